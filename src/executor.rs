use log::debug;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::client::{RequestPayload, StreamingClient, build_payload};
use crate::config::RunConfig;
use crate::failure::FailureKind;
use crate::progress::Progress;
use crate::stats::{Sample, StatsAccumulator};
use crate::stream::{StreamTiming, read_stream};

/// Sends one request and measures its stream, without touching any counters.
///
/// The overall deadline covers slot wait, send and the whole read. Whichever
/// comes first of cancellation, the deadline, or a transport failure decides
/// the outcome.
pub async fn attempt(
    client: &StreamingClient,
    payload: &RequestPayload,
    deadline: Duration,
    cancel: &CancellationToken,
) -> Result<StreamTiming, FailureKind> {
    let start = Instant::now();
    let request = async {
        let mut lines = client.stream(payload).await?;
        read_stream(&mut lines, start).await
    };

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(FailureKind::Cancelled),
        result = tokio::time::timeout(deadline, request) => {
            result.unwrap_or(Err(FailureKind::OverallTimeout))
        }
    }
}

/// Executes requests for one run and books every outcome.
#[derive(Clone)]
pub struct RequestExecutor {
    client: Arc<StreamingClient>,
    run: Arc<RunConfig>,
    stats: StatsAccumulator,
    progress: Progress,
    cancel: CancellationToken,
    advance_per_request: bool,
}

impl RequestExecutor {
    pub fn new(
        client: Arc<StreamingClient>,
        run: Arc<RunConfig>,
        stats: StatsAccumulator,
        progress: Progress,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            client,
            run,
            stats,
            progress,
            cancel,
            advance_per_request: true,
        }
    }

    /// Whether each finished request moves the progress bar (fixed-count
    /// runs) or only refreshes its counters (fixed-duration runs).
    pub fn advance_per_request(mut self, advance: bool) -> Self {
        self.advance_per_request = advance;
        self
    }

    pub fn stats(&self) -> &StatsAccumulator {
        &self.stats
    }

    /// Runs one request. The caller must already hold its concurrency slot.
    ///
    /// Every failure except cancellation is counted and returned for the
    /// caller to ignore. A cancellation is counted once and returned so the
    /// caller can unwind.
    pub async fn execute(&self, prompt: &str) -> Result<Sample, FailureKind> {
        self.stats.record_started().await;

        let payload = build_payload(
            self.run.kind,
            &self.run.model,
            prompt,
            self.run.temperature,
            self.run.max_tokens,
        );

        let outcome = attempt(&self.client, &payload, self.run.timeout, &self.cancel)
            .await
            .map(Sample::from);

        let stats = self.stats.record(&outcome).await;

        match &outcome {
            Ok(sample) => {
                debug!(
                    "Request completed - ttft_ms: {:.1}, total_ms: {:.1}, tokens: {}",
                    sample.ttft.as_secs_f64() * 1000.0,
                    sample.latency.as_secs_f64() * 1000.0,
                    sample.tokens
                );
                self.progress.update(&stats, self.advance_per_request);
            }
            Err(kind) => {
                debug!("Request failed: {}", kind);
                if !kind.is_cancelled() {
                    self.progress.update(&stats, self.advance_per_request);
                }
                if self.run.verbose {
                    self.progress.echo(&kind.describe());
                }
            }
        }

        outcome
    }
}
