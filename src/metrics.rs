use metriken::{AtomicHistogram, Counter, Gauge, LazyCounter, LazyGauge, metric};

use crate::failure::FailureKind;
use crate::stats::Sample;

// Process-wide mirror of the per-run counters, exposed by the admin server.
// These accumulate across the cold and warm runs of one session.

#[metric(name = "requests_started", description = "Requests that acquired a slot")]
pub static REQUESTS_STARTED: LazyCounter = LazyCounter::new(Counter::default);

#[metric(name = "requests_finished", description = "Requests that succeeded or failed")]
pub static REQUESTS_FINISHED: LazyCounter = LazyCounter::new(Counter::default);

#[metric(name = "requests_success", description = "Successful requests")]
pub static REQUESTS_SUCCESS: LazyCounter = LazyCounter::new(Counter::default);

#[metric(name = "requests_failed", description = "Failed requests")]
pub static REQUESTS_FAILED: LazyCounter = LazyCounter::new(Counter::default);

#[metric(
    name = "requests_timeout",
    description = "Requests that hit a connect, write, pool or overall timeout"
)]
pub static REQUESTS_TIMEOUT: LazyCounter = LazyCounter::new(Counter::default);

#[metric(name = "requests_non_2xx", description = "Requests answered with a non-success status")]
pub static REQUESTS_NON_2XX: LazyCounter = LazyCounter::new(Counter::default);

#[metric(name = "requests_cancelled", description = "Requests cancelled by the operator")]
pub static REQUESTS_CANCELLED: LazyCounter = LazyCounter::new(Counter::default);

#[metric(
    name = "requests_inflight",
    description = "Current number of requests in flight"
)]
pub static REQUESTS_INFLIGHT: LazyGauge = LazyGauge::new(Gauge::default);

#[metric(name = "tokens_total", description = "usage.total_tokens reported by the server")]
pub static TOKENS_TOTAL: LazyCounter = LazyCounter::new(Counter::default);

// Latency metrics (in nanoseconds)
// Histogram parameters: (grouping_power=5, max_value_power=64)
#[metric(
    name = "ttft",
    description = "Time to first token in nanoseconds",
    metadata = { unit = "nanoseconds" }
)]
pub static TTFT: AtomicHistogram = AtomicHistogram::new(5, 64);

#[metric(
    name = "request_latency",
    description = "Total request latency in nanoseconds",
    metadata = { unit = "nanoseconds" }
)]
pub static REQUEST_LATENCY: AtomicHistogram = AtomicHistogram::new(5, 64);

pub struct Metrics;

impl Metrics {
    pub fn record_request_started() {
        REQUESTS_STARTED.increment();
        REQUESTS_INFLIGHT.increment();
    }

    pub fn record_outcome(outcome: &Result<Sample, FailureKind>) {
        REQUESTS_INFLIGHT.decrement();
        match outcome {
            Ok(sample) => {
                REQUESTS_SUCCESS.increment();
                REQUESTS_FINISHED.increment();
                TOKENS_TOTAL.add(sample.tokens);
                let _ = TTFT.increment(sample.ttft.as_nanos() as u64);
                let _ = REQUEST_LATENCY.increment(sample.latency.as_nanos() as u64);
            }
            Err(kind) => {
                if kind.is_cancelled() {
                    REQUESTS_CANCELLED.increment();
                    return;
                }
                REQUESTS_FAILED.increment();
                REQUESTS_FINISHED.increment();
                if kind.is_timeout() {
                    REQUESTS_TIMEOUT.increment();
                } else if matches!(kind, FailureKind::NonSuccessStatus { .. }) {
                    REQUESTS_NON_2XX.increment();
                }
            }
        }
    }
}
