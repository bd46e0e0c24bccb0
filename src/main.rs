use anyhow::Result;
use log::{LevelFilter, Metadata, Record, error, info, warn};
use ringlog::{File, LogBuilder, MultiLogBuilder, Output, Stderr};
use std::collections::HashMap;
use std::io::Write;
use std::sync::Mutex;
use std::time::Duration;
use stream_bench::{BenchmarkSession, Cli, Config, StopPolicy};
use tokio_util::sync::CancellationToken;

/// Maximum trace log size before rotation (10MB)
const LOG_FILE_MAX_SIZE: u64 = 1024 * 1024 * 10;

const LOG_FLUSH_INTERVAL: Duration = Duration::from_millis(100);

/// Parses entries like "hyper=warn" into module prefix and level.
fn parse_log_filters(filters: &[String]) -> HashMap<String, LevelFilter> {
    filters
        .iter()
        .filter_map(|filter| {
            let (module, level) = filter.split_once('=')?;
            let level = level.parse::<LevelFilter>().ok()?;
            Some((module.to_string(), level))
        })
        .collect()
}

/// Longest matching module prefix wins; unmatched targets fall through to
/// the global level.
fn module_allows(metadata: &Metadata, filters: &HashMap<String, LevelFilter>) -> bool {
    filters
        .iter()
        .filter(|(prefix, _)| metadata.target().starts_with(prefix.as_str()))
        .max_by_key(|(prefix, _)| prefix.len())
        .is_none_or(|(_, level)| metadata.level() <= *level)
}

/// Ringlog output behind per-module level overrides.
struct FilteredLogger {
    output: Mutex<Box<dyn Output>>,
    max_level: LevelFilter,
    filters: HashMap<String, LevelFilter>,
}

impl log::Log for FilteredLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.max_level && module_allows(metadata, &self.filters)
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata())
            && let Ok(mut output) = self.output.lock()
        {
            let line = format!(
                "{} {:<5} [{}] {}\n",
                chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
                record.level(),
                record.target(),
                record.args()
            );
            let _ = output.write_all(line.as_bytes());
        }
    }

    fn flush(&self) {
        if let Ok(mut output) = self.output.lock() {
            let _ = output.flush();
        }
    }
}

fn init_logging(config: &Config) -> Result<()> {
    let level = config.log.level.to_level_filter();

    let output: Box<dyn Output> = match &config.output.trace_log {
        Some(path) => {
            let backup = path.with_extension("old");
            Box::new(File::new(path.clone(), backup, LOG_FILE_MAX_SIZE)?)
        }
        None => Box::new(Stderr::new()),
    };

    let filters = parse_log_filters(&config.log.filter);
    if filters.is_empty() {
        let base_log = LogBuilder::new()
            .output(output)
            .build()
            .map_err(|e| anyhow::anyhow!("failed to initialize logger: {}", e))?;

        let mut drain = MultiLogBuilder::new()
            .level_filter(level)
            .default(base_log)
            .build()
            .start();

        std::thread::spawn(move || {
            loop {
                let _ = drain.flush();
                std::thread::sleep(LOG_FLUSH_INTERVAL);
            }
        });
    } else {
        let logger = FilteredLogger {
            output: Mutex::new(output),
            max_level: level,
            filters,
        };
        log::set_boxed_logger(Box::new(logger))
            .map_err(|e| anyhow::anyhow!("failed to set logger: {}", e))?;
        log::set_max_level(level);
    }

    Ok(())
}

fn print_banner(cli: &Cli, config: &Config) {
    println!("Streaming Completion Benchmark");
    println!("   Config: {}", cli.config.display());
    println!("   Target: {}", config.target_url());
    println!(
        "   Workers: {} Max tokens: {} Temperature: {}",
        config.load.concurrent_requests, config.load.max_tokens, config.load.temperature
    );
    match config.stop_policy() {
        StopPolicy::Count(total) => println!("   Requests: {}", total),
        StopPolicy::Duration(duration) => println!("   Duration: {}s", duration.as_secs()),
    }
    if config.cache_metrics_enabled() {
        println!("   Cache metrics: cold and warm runs");
    }
    println!();
}

fn main() -> Result<()> {
    let cli = Cli::parse_args();
    let config = Config::load(&cli.config)?;

    init_logging(&config)?;

    if !config.output.quiet {
        print_banner(&cli, &config);
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.runtime.worker_threads)
        .enable_all()
        .build()?;

    runtime.block_on(run(config))
}

async fn run(config: Config) -> Result<()> {
    if let Some(ref admin) = config.admin
        && admin.enabled
    {
        let addr: std::net::SocketAddr = admin
            .listen
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid admin listen address {}: {}", admin.listen, e))?;
        tokio::spawn(stream_bench::admin::start_server(addr));
    }

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, stopping the benchmark");
                cancel.cancel();
            }
        });
    }

    let quiet = config.output.quiet;
    let session = BenchmarkSession::new(config, cancel);

    let mut reports = Vec::new();
    let outcome = session.run(&mut reports).await;
    if let Err(ref e) = outcome {
        error!("Benchmark failed: {:#}", e);
    }

    match session.save(&reports).await {
        Ok(paths) => {
            for path in paths {
                if !quiet {
                    println!("Saved report file in {}", path.display());
                }
            }
        }
        Err(e) => error!("Failed to save reports: {:#}", e),
    }

    info!("Benchmark session finished with {} report(s)", reports.len());
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use log::Level;

    #[test]
    fn test_parse_log_filters() {
        let filters = parse_log_filters(&[
            "hyper=warn".to_string(),
            "reqwest=TRACE".to_string(),
            "bogus".to_string(),
            "warp=loud".to_string(),
        ]);
        assert_eq!(filters.len(), 2);
        assert_eq!(filters["hyper"], LevelFilter::Warn);
        assert_eq!(filters["reqwest"], LevelFilter::Trace);
    }

    #[test]
    fn test_module_allows() {
        let filters = parse_log_filters(&[
            "hyper=warn".to_string(),
            "hyper::proto=debug".to_string(),
        ]);

        let meta = |target, level| Metadata::builder().target(target).level(level).build();
        assert!(!module_allows(&meta("hyper::client", Level::Info), &filters));
        assert!(module_allows(&meta("hyper::proto::h1", Level::Debug), &filters));
        assert!(module_allows(&meta("stream_bench", Level::Trace), &filters));
    }
}
