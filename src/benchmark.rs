use anyhow::Result;
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;

use crate::client::{ClientConfig, StreamingClient, build_payload};
use crate::config::{RunConfig, StopPolicy};
use crate::dataset::Dataset;
use crate::executor::{RequestExecutor, attempt};
use crate::failure::FailureKind;
use crate::progress::Progress;
use crate::report::{BenchmarkReport, ReportBuilder, RunLabel, StopReason};
use crate::stats::{Sample, StatsAccumulator};

/// Prompt of the single request that checks the model server before a run.
pub const WARM_UP_PROMPT: &str = "how are you?";

type TaskHandle = JoinHandle<Result<(), FailureKind>>;

/// Drives one benchmark run against an OpenAI-compatible streaming endpoint.
///
/// A run is a warm-up request followed by the dispatch loop. In fixed-count
/// mode every request gets its own task gated by a semaphore of
/// `concurrency` permits. In fixed-duration mode `concurrency` workers issue
/// requests back to back until the deadline passes; requests already in
/// flight at the deadline still complete.
///
/// ```no_run
/// use std::sync::Arc;
/// use stream_bench::{BenchmarkRunner, Config, Dataset, RunLabel};
/// use tokio_util::sync::CancellationToken;
///
/// # async fn example() -> anyhow::Result<()> {
/// let config = Config::load(std::path::Path::new("bench.toml"))?;
/// let dataset = Arc::new(Dataset::from_config(&config.input).await?);
/// let runner = BenchmarkRunner::new(
///     config.run_config("llama".to_string()),
///     dataset,
///     CancellationToken::new(),
///     false,
/// )?;
/// let report = runner.run(RunLabel::Single).await?;
/// report.print_console();
/// # Ok(())
/// # }
/// ```
pub struct BenchmarkRunner {
    client: Arc<StreamingClient>,
    run: Arc<RunConfig>,
    dataset: Arc<Dataset>,
    cancel: CancellationToken,
    quiet: bool,
}

impl BenchmarkRunner {
    pub fn new(
        run: RunConfig,
        dataset: Arc<Dataset>,
        cancel: CancellationToken,
        quiet: bool,
    ) -> Result<Self> {
        let client = StreamingClient::new(ClientConfig {
            url: run.url.clone(),
            api_key: run.api_key.clone(),
            budget: run.transport,
        })?;

        Ok(Self {
            client: Arc::new(client),
            run: Arc::new(run),
            dataset,
            cancel,
            quiet,
        })
    }

    pub fn run_config(&self) -> &RunConfig {
        &self.run
    }

    /// Sends one request outside of any counters. Any failure means the
    /// server is not ready and the run must not start.
    pub async fn warm_up(&self) -> Result<()> {
        info!("Checking model server at {}", self.run.url);

        let payload = build_payload(
            self.run.kind,
            &self.run.model,
            WARM_UP_PROMPT,
            self.run.temperature,
            self.run.max_tokens,
        );

        match attempt(&self.client, &payload, self.run.timeout, &self.cancel).await {
            Ok(timing) => {
                let sample = Sample::from(timing);
                debug!(
                    "Warm-up completed - ttft_ms: {:.1}, total_ms: {:.1}, tokens: {}",
                    sample.ttft.as_secs_f64() * 1000.0,
                    sample.latency.as_secs_f64() * 1000.0,
                    sample.tokens
                );
                Ok(())
            }
            Err(FailureKind::NonSuccessStatus { status, .. }) => {
                anyhow::bail!("Non-200 status code received: {}", status)
            }
            Err(kind) => anyhow::bail!("Model server check failed: {}", kind),
        }
    }

    /// Runs the warm-up and then the dispatch loop, returning the report of
    /// the loop. Only a failed warm-up returns an error; cancellation and
    /// task failures still produce a report with the matching stop reason.
    pub async fn run(&self, label: RunLabel) -> Result<BenchmarkReport> {
        self.warm_up().await?;
        self.dataset.restart();

        let stats = StatsAccumulator::new();
        let builder = ReportBuilder::new(&self.run, label, self.dataset.label());

        info!(
            "Starting {} run: {} workers, {:?}",
            label.as_str(),
            self.run.concurrency,
            self.run.stop
        );

        let start = Instant::now();
        let stop_reason = match self.run.stop {
            StopPolicy::Count(total) => {
                let progress = self.progress(|| Progress::requests(total as u64, label.as_str()));
                let executor = self.executor(&stats, &progress).advance_per_request(true);
                let reason = self.run_count(executor, total).await;
                progress.finish();
                reason
            }
            StopPolicy::Duration(duration) => {
                let progress =
                    self.progress(|| Progress::seconds(duration.as_secs(), label.as_str()));
                let executor = self.executor(&stats, &progress).advance_per_request(false);
                let reason = self.run_duration(executor, &progress, start, duration).await;
                progress.finish();
                reason
            }
        };
        let elapsed = start.elapsed();

        match stop_reason {
            StopReason::Completed => {}
            StopReason::Cancelled => {
                warn!("Run cancelled, the report will still be generated")
            }
            StopReason::Errored => {
                error!("Unexpected error during the run, trying to generate the report")
            }
        }

        let snapshot = stats.snapshot().await;
        info!(
            "Run {} finished in {:.1}s: {} started, {} finished, {} successful",
            label.as_str(),
            elapsed.as_secs_f64(),
            snapshot.stats.started_requests,
            snapshot.stats.finished_requests,
            snapshot.stats.successful_requests
        );

        Ok(builder.build(&snapshot, elapsed, stop_reason))
    }

    fn progress(&self, bar: impl FnOnce() -> Progress) -> Progress {
        if self.quiet { Progress::hidden() } else { bar() }
    }

    fn executor(&self, stats: &StatsAccumulator, progress: &Progress) -> RequestExecutor {
        RequestExecutor::new(
            Arc::clone(&self.client),
            Arc::clone(&self.run),
            stats.clone(),
            progress.clone(),
            self.cancel.clone(),
        )
    }

    async fn run_count(&self, executor: RequestExecutor, total: usize) -> StopReason {
        let semaphore = Arc::new(Semaphore::new(self.run.concurrency));
        let mut handles: Vec<TaskHandle> = Vec::with_capacity(total);

        for _ in 0..total {
            let prompt = self.dataset.next_prompt();
            let executor = executor.clone();
            let semaphore = Arc::clone(&semaphore);
            let cancel = self.cancel.clone();

            handles.push(tokio::spawn(async move {
                let _permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(FailureKind::Cancelled),
                    permit = semaphore.acquire_owned() => {
                        permit.expect("semaphore should never be closed")
                    }
                };
                settle(executor.execute(&prompt).await)
            }));
        }

        join_all(handles, &self.cancel).await
    }

    async fn run_duration(
        &self,
        executor: RequestExecutor,
        progress: &Progress,
        start: Instant,
        duration: Duration,
    ) -> StopReason {
        let deadline = start + duration;
        let mut handles: Vec<TaskHandle> = Vec::with_capacity(self.run.concurrency + 1);

        for _worker_id in 0..self.run.concurrency {
            let executor = executor.clone();
            let dataset = Arc::clone(&self.dataset);
            let cancel = self.cancel.clone();

            handles.push(tokio::spawn(async move {
                while Instant::now() < deadline {
                    if cancel.is_cancelled() {
                        return Err(FailureKind::Cancelled);
                    }
                    let prompt = dataset.next_prompt();
                    settle(executor.execute(&prompt).await)?;
                }
                Ok(())
            }));
        }

        let progress = progress.clone();
        let cancel = self.cancel.clone();
        let seconds = duration.as_secs();
        handles.push(tokio::spawn(async move {
            for _ in 0..seconds {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(FailureKind::Cancelled),
                    _ = sleep(Duration::from_secs(1)) => progress.tick(),
                }
            }
            progress.set_position(seconds);
            Ok(())
        }));

        join_all(handles, &self.cancel).await
    }
}

/// Keeps a cancellation for the caller to unwind on; every other failure
/// has already been counted.
fn settle(outcome: Result<Sample, FailureKind>) -> Result<(), FailureKind> {
    match outcome {
        Err(FailureKind::Cancelled) => Err(FailureKind::Cancelled),
        _ => Ok(()),
    }
}

/// Waits for every task and derives why the run stopped.
async fn join_all(handles: Vec<TaskHandle>, cancel: &CancellationToken) -> StopReason {
    let mut reason = StopReason::Completed;

    for handle in handles {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                if reason == StopReason::Completed {
                    reason = StopReason::Cancelled;
                }
            }
            Err(e) => {
                error!("Benchmark task failed: {}", e);
                reason = StopReason::Errored;
            }
        }
    }

    if reason == StopReason::Completed && cancel.is_cancelled() {
        StopReason::Cancelled
    } else {
        reason
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_join_all_completed() {
        let handles: Vec<TaskHandle> = (0..4).map(|_| tokio::spawn(async { Ok(()) })).collect();
        let reason = join_all(handles, &CancellationToken::new()).await;
        assert_eq!(reason, StopReason::Completed);
    }

    #[tokio::test]
    async fn test_join_all_cancelled() {
        let handles: Vec<TaskHandle> = vec![
            tokio::spawn(async { Ok(()) }),
            tokio::spawn(async { Err(FailureKind::Cancelled) }),
        ];
        let reason = join_all(handles, &CancellationToken::new()).await;
        assert_eq!(reason, StopReason::Cancelled);

        // A token cancelled after the last task finished still counts
        let cancel = CancellationToken::new();
        cancel.cancel();
        let handles: Vec<TaskHandle> = vec![tokio::spawn(async { Ok(()) })];
        assert_eq!(join_all(handles, &cancel).await, StopReason::Cancelled);
    }

    #[tokio::test]
    async fn test_join_all_panicked_task() {
        let handles: Vec<TaskHandle> = vec![
            tokio::spawn(async { Err(FailureKind::Cancelled) }),
            tokio::spawn(async { panic!("worker exploded") }),
            tokio::spawn(async { Ok(()) }),
        ];
        let reason = join_all(handles, &CancellationToken::new()).await;
        assert_eq!(reason, StopReason::Errored);
    }

    #[test]
    fn test_settle() {
        assert_eq!(settle(Err(FailureKind::OverallTimeout)), Ok(()));
        assert_eq!(
            settle(Err(FailureKind::Cancelled)),
            Err(FailureKind::Cancelled)
        );
    }
}
