use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::CacheMetricsDelta;
use crate::config::{RunConfig, StopPolicy};
use crate::stats::{RunSnapshot, Sample, Stats};

/// Which phase of a session produced a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunLabel {
    Single,
    Cold,
    Warm,
}

impl RunLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunLabel::Single => "single",
            RunLabel::Cold => "cold",
            RunLabel::Warm => "warm",
        }
    }
}

/// How the dispatch loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StopReason {
    Completed,
    Cancelled,
    Errored,
}

#[derive(Debug, Clone, Serialize)]
pub struct BenchmarkReport {
    // Metadata
    pub timestamp: DateTime<Utc>,
    pub version: String,
    pub run_label: RunLabel,
    pub stop_reason: StopReason,

    // Test configuration
    pub configuration: TestConfiguration,

    // Results
    pub total_duration_time: f64,
    pub request_per_sec: f64,
    pub throughput_token: f64,
    pub stats: Stats,
    pub ttft: TtftSummary,
    pub latency: LatencySummary,
    pub token: TokenSummary,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_metrics: Option<CacheMetricsDelta>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TestConfiguration {
    pub model_server: String,
    pub endpoint: String,
    pub model: String,
    pub completion_type: String,
    pub max_tokens: u32,
    pub temperature: f64,
    pub num_concurrency: usize,
    pub total_requests: Option<usize>,
    pub duration_seconds: Option<u64>,
    pub dataset: String,
}

/// Time to first token, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TtftSummary {
    pub avg_ttft: Option<f64>,
    pub max_ttft: Option<f64>,
    pub min_ttft: Option<f64>,
}

/// End-to-end request latency, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LatencySummary {
    pub avg_latency: Option<f64>,
    pub max_latency: Option<f64>,
    pub min_latency: Option<f64>,
}

/// Tokens per request as reported by the server.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TokenSummary {
    pub avg_token: Option<f64>,
    pub max_token: Option<u64>,
    pub min_token: Option<u64>,
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Average, maximum and minimum, or `None` for an empty list.
fn avg_max_min(values: &[f64]) -> Option<(f64, f64, f64)> {
    if values.is_empty() {
        return None;
    }
    let sum: f64 = values.iter().sum();
    let max = values.iter().copied().fold(f64::MIN, f64::max);
    let min = values.iter().copied().fold(f64::MAX, f64::min);
    Some((sum / values.len() as f64, max, min))
}

pub fn summarize_ttft(samples: &[Sample]) -> TtftSummary {
    let millis: Vec<f64> = samples
        .iter()
        .map(|s| s.ttft.as_secs_f64() * 1000.0)
        .collect();
    match avg_max_min(&millis) {
        Some((avg, max, min)) => TtftSummary {
            avg_ttft: Some(round2(avg)),
            max_ttft: Some(round2(max)),
            min_ttft: Some(round2(min)),
        },
        None => TtftSummary {
            avg_ttft: None,
            max_ttft: None,
            min_ttft: None,
        },
    }
}

pub fn summarize_latency(samples: &[Sample]) -> LatencySummary {
    let secs: Vec<f64> = samples.iter().map(|s| s.latency.as_secs_f64()).collect();
    match avg_max_min(&secs) {
        Some((avg, max, min)) => LatencySummary {
            avg_latency: Some(round2(avg)),
            max_latency: Some(round2(max)),
            min_latency: Some(round2(min)),
        },
        None => LatencySummary {
            avg_latency: None,
            max_latency: None,
            min_latency: None,
        },
    }
}

pub fn summarize_tokens(samples: &[Sample]) -> TokenSummary {
    if samples.is_empty() {
        return TokenSummary {
            avg_token: None,
            max_token: None,
            min_token: None,
        };
    }
    let total: u64 = samples.iter().map(|s| s.tokens).sum();
    TokenSummary {
        avg_token: Some(round2(total as f64 / samples.len() as f64)),
        max_token: samples.iter().map(|s| s.tokens).max(),
        min_token: samples.iter().map(|s| s.tokens).min(),
    }
}

/// Finished requests per wall-clock second.
pub fn requests_per_second(stats: &Stats, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        round2(stats.finished_requests as f64 / secs)
    } else {
        0.0
    }
}

/// Tokens per second of request time, summed over successful requests.
pub fn tokens_per_second(samples: &[Sample]) -> f64 {
    let latency: f64 = samples.iter().map(|s| s.latency.as_secs_f64()).sum();
    if latency > 0.0 {
        let tokens: u64 = samples.iter().map(|s| s.tokens).sum();
        round2(tokens as f64 / latency)
    } else {
        0.0
    }
}

pub struct ReportBuilder {
    timestamp: DateTime<Utc>,
    label: RunLabel,
    configuration: TestConfiguration,
}

impl ReportBuilder {
    pub fn new(run: &RunConfig, label: RunLabel, dataset: &str) -> Self {
        let (total_requests, duration_seconds) = match run.stop {
            StopPolicy::Count(total) => (Some(total), None),
            StopPolicy::Duration(duration) => (None, Some(duration.as_secs())),
        };

        Self {
            timestamp: Utc::now(),
            label,
            configuration: TestConfiguration {
                model_server: run.base_url.clone(),
                endpoint: run.url.clone(),
                model: run.model.clone(),
                completion_type: run.kind.as_str().to_string(),
                max_tokens: run.max_tokens,
                temperature: run.temperature,
                num_concurrency: run.concurrency,
                total_requests,
                duration_seconds,
                dataset: dataset.to_string(),
            },
        }
    }

    /// Reduces the drained run into its report.
    pub fn build(
        &self,
        snapshot: &RunSnapshot,
        elapsed: Duration,
        stop_reason: StopReason,
    ) -> BenchmarkReport {
        let samples = &snapshot.samples;

        BenchmarkReport {
            timestamp: self.timestamp,
            version: env!("CARGO_PKG_VERSION").to_string(),
            run_label: self.label,
            stop_reason,
            configuration: self.configuration.clone(),
            total_duration_time: round2(elapsed.as_secs_f64()),
            request_per_sec: requests_per_second(&snapshot.stats, elapsed),
            throughput_token: tokens_per_second(samples),
            stats: snapshot.stats,
            ttft: summarize_ttft(samples),
            latency: summarize_latency(samples),
            token: summarize_tokens(samples),
            cache_metrics: None,
        }
    }
}

fn fmt_opt<T: std::fmt::Display>(value: Option<T>) -> String {
    value.map_or_else(|| "-".to_string(), |v| v.to_string())
}

/// Directory and file name stem shared by every report of a session.
pub fn session_stamp(at: DateTime<Utc>) -> String {
    at.format("%Y%m%d_%H%M%S").to_string()
}

impl BenchmarkReport {
    /// `<root>/<stamp>/<stamp>_<label>_<file>`
    pub fn file_path(&self, root: &Path, stamp: &str, file: &str) -> PathBuf {
        root.join(stamp)
            .join(format!("{}_{}_{}", stamp, self.run_label.as_str(), file))
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, json).await?;
        Ok(())
    }

    pub fn print_console(&self) {
        let now = Utc::now();
        let timestamp = now.to_rfc3339_opts(chrono::SecondsFormat::Millis, false);

        println!();
        println!("{}", timestamp);
        println!("{} -----", timestamp);
        println!(
            "{} Benchmark Complete ({}, {:?})",
            timestamp,
            self.run_label.as_str(),
            self.stop_reason
        );
        println!(
            "{} Target: {} Model: {} Type: {}",
            timestamp,
            self.configuration.endpoint,
            self.configuration.model,
            self.configuration.completion_type
        );
        println!(
            "{} Duration: {:.2}s Concurrency: {} Dataset: {}",
            timestamp,
            self.total_duration_time,
            self.configuration.num_concurrency,
            self.configuration.dataset
        );
        println!(
            "{} Requests: Started: {} Finished: {} Ok: {} Err: {} Cancelled: {}",
            timestamp,
            self.stats.started_requests,
            self.stats.finished_requests,
            self.stats.successful_requests,
            self.stats.failed_requests,
            self.stats.cancelled_requests
        );

        if self.stats.failed_requests > 0 {
            println!(
                "{} Errors: Timeout: {} Non-200: {} Other: {}",
                timestamp,
                self.stats.timeout_requests,
                self.stats.non_200_requests,
                self.stats.failed_requests
                    - self.stats.timeout_requests
                    - self.stats.non_200_requests
            );
        }

        println!(
            "{} Throughput: Requests/s: {:.2} Tokens/s: {:.2}",
            timestamp, self.request_per_sec, self.throughput_token
        );
        println!(
            "{} TTFT (ms): avg: {} max: {} min: {}",
            timestamp,
            fmt_opt(self.ttft.avg_ttft),
            fmt_opt(self.ttft.max_ttft),
            fmt_opt(self.ttft.min_ttft)
        );
        println!(
            "{} Latency (s): avg: {} max: {} min: {}",
            timestamp,
            fmt_opt(self.latency.avg_latency),
            fmt_opt(self.latency.max_latency),
            fmt_opt(self.latency.min_latency)
        );
        println!(
            "{} Tokens (tok/req): avg: {} max: {} min: {}",
            timestamp,
            fmt_opt(self.token.avg_token),
            fmt_opt(self.token.max_token),
            fmt_opt(self.token.min_token)
        );

        if let Some(cache) = &self.cache_metrics {
            println!(
                "{} LMCache: lookup hits: {} lookup tokens: {} hit tokens: {} retrieves: {} stores: {} evictions: {}",
                timestamp,
                cache.raw_data.num_lookup_hits_total,
                cache.raw_data.num_lookup_tokens_total,
                cache.raw_data.num_hit_tokens_total,
                cache.raw_data.num_retrieve_requests_total,
                cache.raw_data.num_store_requests_total,
                cache.raw_data.local_cpu_evict_count_total
            );
            println!(
                "{} LMCache: prefix hit: {:.2} retrieve hit: {:.2} tokens/hit: {:.2} evict: {:.2}",
                timestamp,
                cache.prefix_hit_ratio,
                cache.retrieve_hit_ratio,
                cache.retrieve_tokens_per_hit,
                cache.evict_ratio
            );
        }

        println!();
    }
}
