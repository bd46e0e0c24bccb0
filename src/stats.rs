use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::failure::FailureKind;
use crate::metrics::Metrics;
use crate::stream::StreamTiming;

/// Request counters of one run.
///
/// `finished == successful + failed` holds after every update. Cancelled
/// requests are counted in `cancelled_requests` only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Stats {
    pub started_requests: u64,
    pub finished_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub timeout_requests: u64,
    pub non_200_requests: u64,
    pub cancelled_requests: u64,
}

impl Stats {
    pub fn is_consistent(&self) -> bool {
        self.finished_requests == self.successful_requests + self.failed_requests
            && self.started_requests >= self.finished_requests
    }

    /// Requests that started but have not reached a terminal counter.
    pub fn in_flight(&self) -> u64 {
        self.started_requests
            .saturating_sub(self.finished_requests + self.cancelled_requests)
    }
}

/// One successfully measured request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sample {
    pub ttft: Duration,
    pub latency: Duration,
    pub tokens: u64,
}

impl From<StreamTiming> for Sample {
    fn from(timing: StreamTiming) -> Self {
        Self {
            ttft: timing.ttft(),
            latency: timing.latency,
            tokens: timing.tokens,
        }
    }
}

/// Final state handed to the report builder once the run has drained.
#[derive(Debug, Clone, Default)]
pub struct RunSnapshot {
    pub stats: Stats,
    pub samples: Vec<Sample>,
}

#[derive(Debug, Default)]
struct Inner {
    stats: Stats,
    samples: Vec<Sample>,
}

/// Counters and samples shared by every executor of a run.
///
/// A single lock covers both, so a reader never sees a sample without its
/// counter update or a half-applied set of counters.
#[derive(Debug, Clone, Default)]
pub struct StatsAccumulator {
    inner: Arc<Mutex<Inner>>,
}

impl StatsAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record_started(&self) -> Stats {
        let mut inner = self.inner.lock().await;
        inner.stats.started_requests += 1;
        Metrics::record_request_started();
        inner.stats
    }

    /// Applies the terminal update for one request and returns the counters
    /// as they stand afterwards.
    pub async fn record(&self, outcome: &Result<Sample, FailureKind>) -> Stats {
        let mut inner = self.inner.lock().await;
        let stats = &mut inner.stats;

        match outcome {
            Ok(_) => {
                stats.successful_requests += 1;
                stats.finished_requests += 1;
            }
            Err(FailureKind::Cancelled) => {
                stats.cancelled_requests += 1;
            }
            Err(FailureKind::NonSuccessStatus { .. }) => {
                stats.non_200_requests += 1;
                stats.failed_requests += 1;
                stats.finished_requests += 1;
            }
            Err(
                FailureKind::ConnectTimeout
                | FailureKind::WriteTimeout
                | FailureKind::PoolExhausted
                | FailureKind::OverallTimeout,
            ) => {
                stats.timeout_requests += 1;
                stats.failed_requests += 1;
                stats.finished_requests += 1;
            }
            Err(FailureKind::Other(_)) => {
                stats.failed_requests += 1;
                stats.finished_requests += 1;
            }
        }

        let stats = *stats;
        if let Ok(sample) = outcome {
            inner.samples.push(*sample);
        }
        Metrics::record_outcome(outcome);

        stats
    }

    pub async fn stats(&self) -> Stats {
        self.inner.lock().await.stats
    }

    pub async fn snapshot(&self) -> RunSnapshot {
        let inner = self.inner.lock().await;
        RunSnapshot {
            stats: inner.stats,
            samples: inner.samples.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(ms: u64, tokens: u64) -> Sample {
        Sample {
            ttft: Duration::from_millis(ms / 2),
            latency: Duration::from_millis(ms),
            tokens,
        }
    }

    #[tokio::test]
    async fn test_counter_protocol() {
        let acc = StatsAccumulator::new();

        let outcomes = [
            Ok(sample(50, 10)),
            Err(FailureKind::ConnectTimeout),
            Err(FailureKind::PoolExhausted),
            Err(FailureKind::NonSuccessStatus {
                status: 500,
                message: "boom".to_string(),
            }),
            Err(FailureKind::Other("reset".to_string())),
            Err(FailureKind::Cancelled),
        ];

        for outcome in &outcomes {
            let started = acc.record_started().await;
            assert!(started.is_consistent());
            let after = acc.record(outcome).await;
            assert!(after.is_consistent());
        }

        let snapshot = acc.snapshot().await;
        assert_eq!(
            snapshot.stats,
            Stats {
                started_requests: 6,
                finished_requests: 5,
                successful_requests: 1,
                failed_requests: 4,
                timeout_requests: 2,
                non_200_requests: 1,
                cancelled_requests: 1,
            }
        );
        // Every started request reached exactly one terminal counter
        assert_eq!(snapshot.stats.in_flight(), 0);
        assert_eq!(snapshot.samples, vec![sample(50, 10)]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_updates() {
        let acc = StatsAccumulator::new();
        let mut handles = Vec::new();

        for i in 0..64u64 {
            let acc = acc.clone();
            handles.push(tokio::spawn(async move {
                acc.record_started().await;
                tokio::task::yield_now().await;
                let outcome = if i % 4 == 0 {
                    Err(FailureKind::OverallTimeout)
                } else {
                    Ok(sample(10 + i, i))
                };
                let stats = acc.record(&outcome).await;
                assert!(stats.is_consistent());
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }

        let snapshot = acc.snapshot().await;
        assert_eq!(snapshot.stats.started_requests, 64);
        assert_eq!(snapshot.stats.finished_requests, 64);
        assert_eq!(snapshot.stats.successful_requests, 48);
        assert_eq!(snapshot.stats.timeout_requests, 16);
        assert_eq!(snapshot.samples.len(), 48);
    }

    #[test]
    fn test_sample_from_timing() {
        let sample = Sample::from(StreamTiming {
            first_object: None,
            latency: Duration::from_millis(80),
            tokens: 0,
        });
        assert_eq!(sample.ttft, Duration::from_millis(80));
    }
}
