use log::{debug, warn};
use serde::Serialize;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::Duration;
use thiserror::Error;

use crate::config::CacheMetricsConfig;
use crate::report::round2;

pub const LOOKUP_HITS: &str = "lmcache:num_lookup_hits_total";
pub const LOOKUP_TOKENS: &str = "lmcache:num_lookup_tokens_total";
pub const HIT_TOKENS: &str = "lmcache:num_hit_tokens_total";
pub const RETRIEVE_REQUESTS: &str = "lmcache:num_retrieve_requests_total";
pub const STORE_REQUESTS: &str = "lmcache:num_store_requests_total";
pub const LOCAL_CPU_EVICTIONS: &str = "lmcache:local_cpu_evict_count_total";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExpositionError {
    #[error("malformed label `{label}` on metric {metric}")]
    MalformedLabel { metric: String, label: String },
}

/// One sample row of a Prometheus text exposition.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheMetricPoint {
    pub labels: HashMap<String, String>,
    pub value: f64,
}

/// Parses `name{label="value",...} number` rows, grouped by metric name in
/// the order they appear.
///
/// Comments, blank lines and rows that do not have that shape are skipped.
/// A label set with an entry lacking `=` fails the whole parse.
pub fn parse_exposition(
    text: &str,
) -> Result<HashMap<String, Vec<CacheMetricPoint>>, ExpositionError> {
    let mut metrics: HashMap<String, Vec<CacheMetricPoint>> = HashMap::new();

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((name, labels, value)) = split_row(line) else {
            continue;
        };

        let mut parsed = HashMap::new();
        if let Some(labels) = labels.filter(|l| !l.is_empty()) {
            for pair in labels.split(',') {
                let (key, val) =
                    pair.split_once('=')
                        .ok_or_else(|| ExpositionError::MalformedLabel {
                            metric: name.to_string(),
                            label: pair.to_string(),
                        })?;
                parsed.insert(
                    key.trim().to_string(),
                    val.trim().trim_matches('"').to_string(),
                );
            }
        }

        metrics
            .entry(name.to_string())
            .or_default()
            .push(CacheMetricPoint {
                labels: parsed,
                value,
            });
    }

    Ok(metrics)
}

fn is_name_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_' || c == ':'
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == ':'
}

fn is_value_char(c: char) -> bool {
    c.is_ascii_digit() || matches!(c, '.' | 'e' | 'E' | '+' | '-')
}

/// Splits a trimmed row into name, optional raw label set and value.
fn split_row(line: &str) -> Option<(&str, Option<&str>, f64)> {
    if !line.starts_with(is_name_start) {
        return None;
    }
    let name_end = line.find(|c: char| !is_name_char(c))?;
    let (name, mut rest) = line.split_at(name_end);

    let mut labels = None;
    if let Some(inner) = rest.strip_prefix('{') {
        let close = inner.find('}')?;
        labels = Some(&inner[..close]);
        rest = &inner[close + 1..];
    }

    // At least one space between the series and its value
    let value = rest.trim_start();
    if value.len() == rest.len() || value.is_empty() || !value.chars().all(is_value_char) {
        return None;
    }

    Some((name, labels, value.parse().ok()?))
}

/// Counter values of one scrape. Missing metrics read as zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheMetricsSnapshot {
    pub num_lookup_hits_total: u64,
    pub num_lookup_tokens_total: u64,
    pub num_hit_tokens_total: u64,
    pub num_retrieve_requests_total: u64,
    pub num_store_requests_total: u64,
    pub local_cpu_evict_count_total: u64,
}

impl CacheMetricsSnapshot {
    pub fn from_metrics(metrics: &HashMap<String, Vec<CacheMetricPoint>>) -> Self {
        let first = |name: &str| {
            metrics
                .get(name)
                .and_then(|points| points.first())
                .map_or(0, |point| point.value as u64)
        };

        Self {
            num_lookup_hits_total: first(LOOKUP_HITS),
            num_lookup_tokens_total: first(LOOKUP_TOKENS),
            num_hit_tokens_total: first(HIT_TOKENS),
            num_retrieve_requests_total: first(RETRIEVE_REQUESTS),
            num_store_requests_total: first(STORE_REQUESTS),
            local_cpu_evict_count_total: first(LOCAL_CPU_EVICTIONS),
        }
    }

    pub fn parse(text: &str) -> Result<Self, ExpositionError> {
        Ok(Self::from_metrics(&parse_exposition(text)?))
    }
}

/// Cache activity between two scrapes and the ratios derived from it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CacheMetricsDelta {
    pub raw_data: CacheMetricsSnapshot,
    pub prefix_hit_ratio: f64,
    pub retrieve_hit_ratio: f64,
    pub retrieve_tokens_per_hit: f64,
    pub evict_ratio: f64,
}

fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator > 0 {
        round2(numerator as f64 / denominator as f64)
    } else {
        0.0
    }
}

impl CacheMetricsDelta {
    pub fn between(before: &CacheMetricsSnapshot, after: &CacheMetricsSnapshot) -> Self {
        Self::from_raw(CacheMetricsSnapshot {
            num_lookup_hits_total: after
                .num_lookup_hits_total
                .saturating_sub(before.num_lookup_hits_total),
            num_lookup_tokens_total: after
                .num_lookup_tokens_total
                .saturating_sub(before.num_lookup_tokens_total),
            num_hit_tokens_total: after
                .num_hit_tokens_total
                .saturating_sub(before.num_hit_tokens_total),
            num_retrieve_requests_total: after
                .num_retrieve_requests_total
                .saturating_sub(before.num_retrieve_requests_total),
            num_store_requests_total: after
                .num_store_requests_total
                .saturating_sub(before.num_store_requests_total),
            local_cpu_evict_count_total: after
                .local_cpu_evict_count_total
                .saturating_sub(before.local_cpu_evict_count_total),
        })
    }

    pub fn from_raw(raw: CacheMetricsSnapshot) -> Self {
        Self {
            raw_data: raw,
            prefix_hit_ratio: ratio(raw.num_lookup_hits_total, raw.num_lookup_tokens_total),
            retrieve_hit_ratio: ratio(raw.num_hit_tokens_total, raw.num_lookup_tokens_total),
            retrieve_tokens_per_hit: ratio(
                raw.num_hit_tokens_total,
                raw.num_retrieve_requests_total,
            ),
            evict_ratio: ratio(
                raw.local_cpu_evict_count_total,
                raw.num_store_requests_total
                    .saturating_add(raw.num_retrieve_requests_total),
            ),
        }
    }
}

/// `<scheme>://<ipv4>:<port><path>` of the cache exporter next to the model
/// server, when the server is addressed by an IPv4 literal.
pub fn cache_metrics_url(base_url: &str, port: u16, path: &str) -> Option<String> {
    let url = reqwest::Url::parse(base_url).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    let host: Ipv4Addr = url.host_str()?.parse().ok()?;
    Some(format!("{}://{}:{}{}", url.scheme(), host, port, path))
}

pub struct CacheMetricsScraper {
    client: reqwest::Client,
    url: String,
}

impl CacheMetricsScraper {
    /// `None` when no exporter address can be derived from the target.
    pub fn new(base_url: &str, config: &CacheMetricsConfig) -> anyhow::Result<Option<Self>> {
        let Some(url) = cache_metrics_url(base_url, config.port, &config.path) else {
            warn!(
                "Cache metrics need an IPv4 model server address, got {}",
                base_url
            );
            return Ok(None);
        };

        let client = reqwest::Client::builder()
            .timeout(config.scrape_timeout()?)
            .connect_timeout(Duration::from_secs(5))
            .build()?;

        Ok(Some(Self { client, url }))
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Failures are logged and yield `None`.
    pub async fn scrape(&self) -> Option<CacheMetricsSnapshot> {
        let text = match self.fetch().await {
            Ok(text) => text,
            Err(e) => {
                warn!("Failed to get cache metrics from {}: {}", self.url, e);
                return None;
            }
        };

        match CacheMetricsSnapshot::parse(&text) {
            Ok(snapshot) => {
                debug!("Cache metrics from {}: {:?}", self.url, snapshot);
                Some(snapshot)
            }
            Err(e) => {
                warn!("Failed to parse cache metrics: {}", e);
                None
            }
        }
    }

    async fn fetch(&self) -> Result<String, reqwest::Error> {
        self.client
            .get(&self.url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXPOSITION: &str = r#"
# HELP lmcache:num_lookup_hits_total Number of hit tokens in lookups
# TYPE lmcache:num_lookup_hits_total counter
lmcache:num_lookup_hits_total{model_name="llama",worker_id="0"} 120.0
lmcache:num_lookup_hits_total{model_name="llama",worker_id="1"} 999.0
lmcache:num_lookup_tokens_total{model_name="llama"} 400
lmcache:num_hit_tokens_total 300
lmcache:num_retrieve_requests_total{} 6
lmcache:num_store_requests_total 4.7
process_start_time_seconds 1.7e9
not a metric line
lmcache:local_cpu_evict_count_total +Inf
"#;

    #[test]
    fn test_parse_exposition() {
        let metrics = parse_exposition(EXPOSITION).unwrap();

        let hits = &metrics[LOOKUP_HITS];
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].value, 120.0);
        assert_eq!(hits[0].labels["model_name"], "llama");
        assert_eq!(hits[1].labels["worker_id"], "1");

        assert!(metrics[HIT_TOKENS][0].labels.is_empty());
        assert!(metrics[RETRIEVE_REQUESTS][0].labels.is_empty());
        assert_eq!(metrics["process_start_time_seconds"][0].value, 1.7e9);
        assert!(!metrics.contains_key("not"));
        // +Inf is not a plain number
        assert!(!metrics.contains_key(LOCAL_CPU_EVICTIONS));
    }

    #[test]
    fn test_malformed_labels_fail() {
        let err = parse_exposition("lmcache:num_hit_tokens_total{model_name} 3").unwrap_err();
        assert_eq!(
            err,
            ExpositionError::MalformedLabel {
                metric: HIT_TOKENS.to_string(),
                label: "model_name".to_string()
            }
        );
    }

    #[test]
    fn test_snapshot_takes_first_row() {
        let snapshot = CacheMetricsSnapshot::parse(EXPOSITION).unwrap();
        assert_eq!(
            snapshot,
            CacheMetricsSnapshot {
                num_lookup_hits_total: 120,
                num_lookup_tokens_total: 400,
                num_hit_tokens_total: 300,
                num_retrieve_requests_total: 6,
                num_store_requests_total: 4,
                local_cpu_evict_count_total: 0,
            }
        );
    }

    #[test]
    fn test_delta_of_same_snapshot_is_zero() {
        let snapshot = CacheMetricsSnapshot::parse(EXPOSITION).unwrap();
        let delta = CacheMetricsDelta::between(&snapshot, &snapshot);
        assert_eq!(delta.raw_data, CacheMetricsSnapshot::default());
        assert_eq!(delta.prefix_hit_ratio, 0.0);
        assert_eq!(delta.retrieve_hit_ratio, 0.0);
        assert_eq!(delta.retrieve_tokens_per_hit, 0.0);
        assert_eq!(delta.evict_ratio, 0.0);
    }

    #[test]
    fn test_delta_ratios() {
        let before = CacheMetricsSnapshot {
            num_lookup_hits_total: 10,
            num_lookup_tokens_total: 100,
            num_hit_tokens_total: 20,
            num_retrieve_requests_total: 1,
            num_store_requests_total: 1,
            local_cpu_evict_count_total: 0,
        };
        let after = CacheMetricsSnapshot {
            num_lookup_hits_total: 110,
            num_lookup_tokens_total: 400,
            num_hit_tokens_total: 220,
            num_retrieve_requests_total: 4,
            num_store_requests_total: 7,
            local_cpu_evict_count_total: 3,
        };

        let delta = CacheMetricsDelta::between(&before, &after);
        assert_eq!(delta.raw_data.num_lookup_tokens_total, 300);
        assert_eq!(delta.prefix_hit_ratio, 0.33);
        assert_eq!(delta.retrieve_hit_ratio, 0.67);
        assert_eq!(delta.retrieve_tokens_per_hit, 66.67);
        assert_eq!(delta.evict_ratio, 0.33);
    }

    #[test]
    fn test_counter_reset_saturates() {
        let before = CacheMetricsSnapshot {
            num_lookup_tokens_total: 50,
            ..Default::default()
        };
        let delta = CacheMetricsDelta::between(&before, &CacheMetricsSnapshot::default());
        assert_eq!(delta.raw_data.num_lookup_tokens_total, 0);
    }

    #[test]
    fn test_saturated_counters_do_not_overflow() {
        // Exporter values beyond u64 range arrive clamped to u64::MAX
        let delta = CacheMetricsDelta::from_raw(CacheMetricsSnapshot {
            num_retrieve_requests_total: u64::MAX,
            num_store_requests_total: u64::MAX,
            local_cpu_evict_count_total: u64::MAX,
            ..Default::default()
        });
        assert!(delta.evict_ratio.is_finite());
        assert_eq!(delta.evict_ratio, 1.0);
    }

    #[test]
    fn test_cache_metrics_url() {
        assert_eq!(
            cache_metrics_url("http://10.0.0.5:8000/", 7000, "/metrics").as_deref(),
            Some("http://10.0.0.5:7000/metrics")
        );
        assert_eq!(
            cache_metrics_url("https://192.168.1.20", 9000, "/metrics").as_deref(),
            Some("https://192.168.1.20:9000/metrics")
        );
        assert_eq!(cache_metrics_url("http://localhost:8000", 7000, "/metrics"), None);
        assert_eq!(cache_metrics_url("http://[::1]:8000", 7000, "/metrics"), None);
        assert_eq!(cache_metrics_url("not a url", 7000, "/metrics"), None);
    }

    #[tokio::test]
    async fn test_scrape() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/metrics")
            .with_status(200)
            .with_body(EXPOSITION)
            .create_async()
            .await;

        let scraper = CacheMetricsScraper::new(&server.url(), &CacheMetricsConfig {
            port: server.socket_address().port(),
            ..Default::default()
        })
        .unwrap()
        .unwrap();

        let snapshot = scraper.scrape().await.unwrap();
        assert_eq!(snapshot.num_hit_tokens_total, 300);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_scrape_failure_is_absent() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/metrics")
            .with_status(503)
            .create_async()
            .await;

        let scraper = CacheMetricsScraper::new(&server.url(), &CacheMetricsConfig {
            port: server.socket_address().port(),
            ..Default::default()
        })
        .unwrap()
        .unwrap();

        assert_eq!(scraper.scrape().await, None);
    }
}
