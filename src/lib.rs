pub mod admin;
pub mod benchmark;
pub mod cache;
pub mod cli;
pub mod client;
pub mod config;
pub mod dataset;
pub mod executor;
pub mod failure;
pub mod metrics;
pub mod progress;
pub mod report;
pub mod session;
pub mod stats;
pub mod stream;

pub use benchmark::BenchmarkRunner;
pub use cache::{CacheMetricsDelta, CacheMetricsScraper, CacheMetricsSnapshot};
pub use cli::Cli;
pub use client::{ClientConfig, RequestPayload, StreamingClient};
pub use config::{Config, RunConfig, StopPolicy};
pub use dataset::Dataset;
pub use failure::FailureKind;
pub use report::{BenchmarkReport, ReportBuilder, RunLabel, StopReason};
pub use session::BenchmarkSession;
pub use stats::{Sample, Stats, StatsAccumulator};
