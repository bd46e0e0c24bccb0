use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub endpoint: EndpointConfig,
    pub load: LoadConfig,
    #[serde(default)]
    pub input: InputConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_metrics: Option<CacheMetricsConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub admin: Option<AdminConfig>,
}

/// Which OpenAI-compatible completion API the target exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EndpointKind {
    #[default]
    Chat,
    Generate,
}

impl EndpointKind {
    pub fn default_path(&self) -> &'static str {
        match self {
            EndpointKind::Chat => "/v1/chat/completions",
            EndpointKind::Generate => "/v1/completions",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointKind::Chat => "chat",
            EndpointKind::Generate => "generate",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub base_url: String,
    #[serde(default)]
    pub kind: EndpointKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>, // Defaults to the path of `kind`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>, // If not provided, will auto-detect from server
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default = "default_timeout")]
    pub timeout: u64, // Overall per-request deadline in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
    #[serde(default = "default_write_timeout")]
    pub write_timeout: u64,
    #[serde(default = "default_pool_timeout")]
    pub pool_timeout: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool_size: Option<usize>, // Defaults to load.concurrent_requests
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadConfig {
    #[serde(default = "default_concurrent_requests")]
    pub concurrent_requests: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_requests: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<u64>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
    #[serde(default = "default_prompt")]
    pub prompt: String,
    #[serde(default)]
    pub shuffle: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    #[serde(default = "default_output_format")]
    pub format: OutputFormat,
    #[serde(default = "default_output_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_output_file")]
    pub file: String,
    #[serde(default)]
    pub quiet: bool,
    #[serde(default)]
    pub verbose: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_log: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: LogLevel,
    /// Per-module log level overrides (e.g., ["hyper=info", "h2=warn"])
    #[serde(default)]
    pub filter: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn to_level_filter(&self) -> log::LevelFilter {
        match self {
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Console,
    Json,
}

/// Scraping of the LMCache exposition endpoint next to the model server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheMetricsConfig {
    #[serde(default = "default_cache_metrics_enabled")]
    pub enabled: bool,
    #[serde(default = "default_cache_metrics_port")]
    pub port: u16,
    #[serde(default = "default_cache_metrics_path")]
    pub path: String,
    /// Pause between a run finishing and the "after" scrape (e.g., "10s", "500ms")
    #[serde(default = "default_settle_delay")]
    pub settle_delay: String,
    /// Timeout of a single scrape (e.g., "10s")
    #[serde(default = "default_scrape_timeout")]
    pub timeout: String,
}

impl CacheMetricsConfig {
    pub fn settle_delay(&self) -> anyhow::Result<Duration> {
        Ok(humantime::parse_duration(&self.settle_delay)?)
    }

    pub fn scrape_timeout(&self) -> anyhow::Result<Duration> {
        Ok(humantime::parse_duration(&self.timeout)?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminConfig {
    #[serde(default = "default_admin_listen")]
    pub listen: String,
    #[serde(default = "default_admin_enabled")]
    pub enabled: bool,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            listen: default_admin_listen(),
            enabled: default_admin_enabled(),
        }
    }
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            file: None,
            prompt: default_prompt(),
            shuffle: false,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            format: default_output_format(),
            directory: default_output_directory(),
            file: default_output_file(),
            quiet: false,
            verbose: false,
            trace_log: None,
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            worker_threads: default_worker_threads(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            filter: Vec::new(),
        }
    }
}

impl Default for CacheMetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_cache_metrics_enabled(),
            port: default_cache_metrics_port(),
            path: default_cache_metrics_path(),
            settle_delay: default_settle_delay(),
            timeout: default_scrape_timeout(),
        }
    }
}

fn default_timeout() -> u64 {
    120
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_write_timeout() -> u64 {
    60
}

fn default_pool_timeout() -> u64 {
    10
}

fn default_concurrent_requests() -> usize {
    16
}

fn default_max_tokens() -> u32 {
    32
}

fn default_temperature() -> f64 {
    0.7
}

fn default_prompt() -> String {
    "how are you?".to_string()
}

fn default_output_format() -> OutputFormat {
    OutputFormat::Console
}

fn default_output_directory() -> PathBuf {
    PathBuf::from("reports")
}

fn default_output_file() -> String {
    "report.json".to_string()
}

fn default_worker_threads() -> usize {
    num_cpus::get()
}

fn default_log_level() -> LogLevel {
    LogLevel::Info
}

fn default_cache_metrics_enabled() -> bool {
    true
}

fn default_cache_metrics_port() -> u16 {
    7000
}

fn default_cache_metrics_path() -> String {
    "/metrics".to_string()
}

fn default_settle_delay() -> String {
    "10s".to_string()
}

fn default_scrape_timeout() -> String {
    "10s".to_string()
}

fn default_admin_listen() -> String {
    "127.0.0.1:9090".to_string()
}

fn default_admin_enabled() -> bool {
    true
}

/// When the dispatch loop stops issuing new requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopPolicy {
    /// Schedule exactly this many requests and wait for all of them.
    Count(usize),
    /// Keep N workers busy until the wall-clock deadline passes.
    Duration(Duration),
}

/// Transport-phase budgets applied below the overall per-request deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportBudget {
    pub connect: Duration,
    pub write: Duration,
    pub pool: Duration,
    pub pool_size: usize,
}

/// Everything a single benchmark run needs, fixed for the run's lifetime.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub base_url: String,
    pub url: String,
    pub kind: EndpointKind,
    pub model: String,
    pub api_key: Option<String>,
    pub concurrency: usize,
    pub timeout: Duration,
    pub temperature: f64,
    pub max_tokens: u32,
    pub stop: StopPolicy,
    pub verbose: bool,
    pub transport: TransportBudget,
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        match (self.load.total_requests, self.load.duration_seconds) {
            (None, None) => {
                anyhow::bail!("Either total_requests or duration_seconds must be specified")
            }
            (Some(_), Some(_)) => {
                anyhow::bail!("Only one of total_requests or duration_seconds can be specified")
            }
            (Some(0), None) => anyhow::bail!("total_requests must be greater than 0"),
            (None, Some(0)) => anyhow::bail!("duration_seconds must be greater than 0"),
            _ => {}
        }

        if self.load.concurrent_requests == 0 {
            anyhow::bail!("concurrent_requests must be greater than 0");
        }

        if self.load.max_tokens == 0 {
            anyhow::bail!("max_tokens must be greater than 0");
        }

        if !(self.load.temperature >= 0.0) {
            anyhow::bail!(
                "temperature is {}, must be greater than or equal to 0.0",
                self.load.temperature
            );
        }

        if self.endpoint.timeout == 0 {
            anyhow::bail!("timeout must be greater than 0");
        }

        if self.endpoint.pool_size == Some(0) {
            anyhow::bail!("pool_size must be greater than 0");
        }

        if self.runtime.worker_threads == 0 {
            anyhow::bail!("worker_threads must be greater than 0");
        }

        if let Some(ref cache) = self.cache_metrics {
            humantime::parse_duration(&cache.settle_delay)
                .map_err(|e| anyhow::anyhow!("invalid cache_metrics.settle_delay: {}", e))?;
            humantime::parse_duration(&cache.timeout)
                .map_err(|e| anyhow::anyhow!("invalid cache_metrics.timeout: {}", e))?;
        }

        Ok(())
    }

    /// Full URL of the completion endpoint.
    pub fn target_url(&self) -> String {
        let path = self
            .endpoint
            .path
            .as_deref()
            .unwrap_or(self.endpoint.kind.default_path());
        format!("{}{}", self.endpoint.base_url.trim_end_matches('/'), path)
    }

    pub fn stop_policy(&self) -> StopPolicy {
        match (self.load.total_requests, self.load.duration_seconds) {
            (_, Some(secs)) => StopPolicy::Duration(Duration::from_secs(secs)),
            (Some(total), None) => StopPolicy::Count(total),
            (None, None) => StopPolicy::Count(0),
        }
    }

    /// Freezes the configuration into the per-run view. The model must
    /// already be known (configured or detected).
    pub fn run_config(&self, model: String) -> RunConfig {
        RunConfig {
            base_url: self.endpoint.base_url.clone(),
            url: self.target_url(),
            kind: self.endpoint.kind,
            model,
            api_key: self.endpoint.api_key.clone(),
            concurrency: self.load.concurrent_requests,
            timeout: Duration::from_secs(self.endpoint.timeout),
            temperature: self.load.temperature,
            max_tokens: self.load.max_tokens,
            stop: self.stop_policy(),
            verbose: self.output.verbose,
            transport: TransportBudget {
                connect: Duration::from_secs(self.endpoint.connect_timeout),
                write: Duration::from_secs(self.endpoint.write_timeout),
                pool: Duration::from_secs(self.endpoint.pool_timeout),
                pool_size: self
                    .endpoint
                    .pool_size
                    .unwrap_or(self.load.concurrent_requests),
            },
        }
    }

    pub fn cache_metrics_enabled(&self) -> bool {
        self.cache_metrics.as_ref().is_some_and(|c| c.enabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[endpoint]
base_url = "http://10.0.0.5:8000/"

[load]
total_requests = 100
"#;

    #[test]
    fn test_defaults() {
        let config = Config::parse(MINIMAL).unwrap();
        assert_eq!(config.endpoint.kind, EndpointKind::Chat);
        assert_eq!(config.endpoint.timeout, 120);
        assert_eq!(config.load.concurrent_requests, 16);
        assert_eq!(config.load.max_tokens, 32);
        assert_eq!(config.input.prompt, "how are you?");
        assert_eq!(config.output.file, "report.json");
        assert!(!config.cache_metrics_enabled());
        assert_eq!(config.target_url(), "http://10.0.0.5:8000/v1/chat/completions");
    }

    #[test]
    fn test_run_config() {
        let config = Config::parse(
            r#"
[endpoint]
base_url = "http://localhost:8000"
kind = "generate"
timeout = 30
pool_timeout = 2

[load]
concurrent_requests = 4
duration_seconds = 5
temperature = 0.0

[output]
verbose = true
"#,
        )
        .unwrap();

        let run = config.run_config("m".to_string());
        assert_eq!(run.url, "http://localhost:8000/v1/completions");
        assert_eq!(run.kind, EndpointKind::Generate);
        assert_eq!(run.stop, StopPolicy::Duration(Duration::from_secs(5)));
        assert_eq!(run.timeout, Duration::from_secs(30));
        assert_eq!(run.transport.pool, Duration::from_secs(2));
        assert_eq!(run.transport.pool_size, 4);
        assert!(run.verbose);
    }

    #[test]
    fn test_validation() {
        let both = r#"
[endpoint]
base_url = "http://localhost:8000"
[load]
total_requests = 10
duration_seconds = 10
"#;
        assert!(Config::parse(both).is_err());

        let neither = r#"
[endpoint]
base_url = "http://localhost:8000"
[load]
concurrent_requests = 2
"#;
        assert!(Config::parse(neither).is_err());

        let negative_temperature = r#"
[endpoint]
base_url = "http://localhost:8000"
[load]
total_requests = 10
temperature = -0.5
"#;
        assert!(Config::parse(negative_temperature).is_err());

        let bad_delay = r#"
[endpoint]
base_url = "http://localhost:8000"
[load]
total_requests = 10
[cache_metrics]
settle_delay = "soon"
"#;
        assert!(Config::parse(bad_delay).is_err());
    }
}
