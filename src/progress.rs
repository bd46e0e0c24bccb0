use indicatif::{ProgressBar, ProgressStyle};

use crate::stats::Stats;

/// Optional progress bar of a run.
///
/// Counts finished requests in fixed-count runs and elapsed seconds in
/// fixed-duration runs. The message always shows the live counters.
#[derive(Debug, Clone)]
pub struct Progress {
    bar: Option<ProgressBar>,
}

impl Progress {
    pub fn hidden() -> Self {
        Self { bar: None }
    }

    pub fn requests(total: u64, label: &str) -> Self {
        Self::with_template(
            total,
            label,
            "{prefix} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({per_sec}) {msg}",
        )
    }

    pub fn seconds(total: u64, label: &str) -> Self {
        Self::with_template(
            total,
            label,
            "{prefix} [{bar:40.cyan/blue}] {pos}/{len}s {msg}",
        )
    }

    fn with_template(total: u64, label: &str, template: &str) -> Self {
        let bar = ProgressBar::new(total);
        if let Ok(style) = ProgressStyle::default_bar().template(template) {
            bar.set_style(style.progress_chars("#>-"));
        }
        bar.set_prefix(format!("Benchmark runner ({})", label));
        Self { bar: Some(bar) }
    }

    /// Refreshes the counters; `advance` moves the bar by one request.
    pub fn update(&self, stats: &Stats, advance: bool) {
        if let Some(bar) = &self.bar {
            bar.set_message(format!(
                "started={} successful={} failed={} timeout={} non_200={}",
                stats.started_requests,
                stats.successful_requests,
                stats.failed_requests,
                stats.timeout_requests,
                stats.non_200_requests
            ));
            if advance {
                bar.inc(1);
            }
        }
    }

    pub fn tick(&self) {
        if let Some(bar) = &self.bar {
            bar.inc(1);
        }
    }

    pub fn set_position(&self, position: u64) {
        if let Some(bar) = &self.bar {
            bar.set_position(position);
        }
    }

    /// Prints a line above the bar, or plainly when no bar is drawn.
    pub fn echo(&self, message: &str) {
        match &self.bar {
            Some(bar) => bar.println(message),
            None => println!("{}", message),
        }
    }

    pub fn finish(&self) {
        if let Some(bar) = &self.bar {
            bar.finish();
        }
    }
}
