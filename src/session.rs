use anyhow::Result;
use chrono::{DateTime, Utc};
use log::{info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::benchmark::BenchmarkRunner;
use crate::cache::{CacheMetricsDelta, CacheMetricsScraper};
use crate::config::{Config, OutputFormat};
use crate::dataset::Dataset;
use crate::report::{BenchmarkReport, RunLabel, StopReason, session_stamp};

/// One invocation of the tool: a single run, or a cold and a warm run
/// bracketed by cache-metrics scrapes.
pub struct BenchmarkSession {
    config: Config,
    cancel: CancellationToken,
    started_at: DateTime<Utc>,
}

impl BenchmarkSession {
    pub fn new(config: Config, cancel: CancellationToken) -> Self {
        Self {
            config,
            cancel,
            started_at: Utc::now(),
        }
    }

    pub fn stamp(&self) -> String {
        session_stamp(self.started_at)
    }

    /// The configured model, or the first one the server lists.
    pub async fn resolve_model(&self) -> Result<String> {
        if let Some(model) = &self.config.endpoint.model {
            return Ok(model.clone());
        }

        info!("Model not specified, querying server for available models");
        crate::client::detect_model(
            &self.config.endpoint.base_url,
            self.config.endpoint.api_key.as_deref(),
            Duration::from_secs(self.config.endpoint.timeout),
        )
        .await
    }

    /// Runs every phase, pushing each report as soon as it exists so the
    /// caller still holds the finished ones when a later phase fails.
    pub async fn run(&self, reports: &mut Vec<BenchmarkReport>) -> Result<()> {
        let model = self.resolve_model().await?;

        info!("Building dataset");
        let dataset = Arc::new(Dataset::from_config(&self.config.input).await?);

        let runner = BenchmarkRunner::new(
            self.config.run_config(model),
            dataset,
            self.cancel.clone(),
            self.config.output.quiet,
        )?;

        let cache = match &self.config.cache_metrics {
            Some(cache) if cache.enabled => cache,
            _ => {
                let report = runner.run(RunLabel::Single).await?;
                self.present(&report)?;
                reports.push(report);
                return Ok(());
            }
        };

        let scraper = CacheMetricsScraper::new(&self.config.endpoint.base_url, cache)?;
        let settle_delay = cache.settle_delay()?;

        for label in [RunLabel::Cold, RunLabel::Warm] {
            if self.cancel.is_cancelled() {
                warn!("Skipping {} run after cancellation", label.as_str());
                break;
            }

            let before = match &scraper {
                Some(scraper) => scraper.scrape().await,
                None => None,
            };

            let mut report = runner.run(label).await?;

            if report.stop_reason != StopReason::Cancelled {
                info!(
                    "Waiting {} for cache metrics to settle",
                    humantime::format_duration(settle_delay)
                );
                tokio::select! {
                    _ = self.cancel.cancelled() => {}
                    _ = tokio::time::sleep(settle_delay) => {}
                }
            }

            let after = match &scraper {
                Some(scraper) => scraper.scrape().await,
                None => None,
            };

            report.cache_metrics = match (before, after) {
                (Some(before), Some(after)) => Some(CacheMetricsDelta::between(&before, &after)),
                _ => None,
            };

            self.present(&report)?;
            reports.push(report);
        }

        Ok(())
    }

    fn present(&self, report: &BenchmarkReport) -> Result<()> {
        match self.config.output.format {
            OutputFormat::Console => {
                if !self.config.output.quiet {
                    report.print_console();
                }
            }
            OutputFormat::Json => {
                println!("{}", serde_json::to_string_pretty(report)?);
            }
        }
        Ok(())
    }

    /// Writes every report under `<directory>/<stamp>/`.
    pub async fn save(&self, reports: &[BenchmarkReport]) -> Result<Vec<PathBuf>> {
        let stamp = self.stamp();
        let mut written = Vec::with_capacity(reports.len());

        for report in reports {
            let path = report.file_path(
                &self.config.output.directory,
                &stamp,
                &self.config.output.file,
            );
            report.save(&path).await?;
            info!("Saved report to {}", path.display());
            written.push(path);
        }

        Ok(written)
    }
}
