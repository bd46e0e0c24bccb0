use log::info;
use metriken::{AtomicHistogram, Value};
use std::convert::Infallible;
use std::net::SocketAddr;
use warp::Filter;

const PERCENTILES: [f64; 5] = [50.0, 90.0, 95.0, 99.0, 99.9];

/// Serves the live request counters while a session runs.
pub async fn start_server(addr: SocketAddr) {
    info!("Starting metrics server on {}", addr);
    warp::serve(routes()).run(addr).await;
}

pub fn routes() -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
    metrics_endpoint().or(vars_endpoint())
}

/// GET /metrics - Prometheus text format
fn metrics_endpoint() -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone
{
    warp::path!("metrics")
        .and(warp::get())
        .and_then(prometheus_metrics)
}

/// GET /vars - Human readable format
fn vars_endpoint() -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
    warp::path!("vars").and(warp::get()).and_then(human_metrics)
}

async fn prometheus_metrics() -> Result<impl warp::Reply, Infallible> {
    Ok(warp::reply::with_header(
        render_prometheus(),
        "content-type",
        "text/plain; version=0.0.4; charset=utf-8",
    ))
}

async fn human_metrics() -> Result<impl warp::Reply, Infallible> {
    Ok(warp::reply::with_header(
        render_vars(),
        "content-type",
        "text/plain; charset=utf-8",
    ))
}

/// Percentile and bucket upper bound of a histogram with at least one value.
fn histogram_percentiles(histogram: &AtomicHistogram) -> Vec<(f64, u64)> {
    let Some(loaded) = histogram.load() else {
        return Vec::new();
    };
    match loaded.percentiles(&PERCENTILES) {
        Ok(Some(values)) => values
            .iter()
            .map(|(percentile, bucket)| (*percentile, bucket.end()))
            .collect(),
        _ => Vec::new(),
    }
}

pub fn render_prometheus() -> String {
    let mut lines = Vec::new();

    for metric in &metriken::metrics() {
        let name = metric.name().replace('/', "_");
        let help = metric
            .description()
            .map(|d| format!("# HELP {} {}\n", name, d))
            .unwrap_or_default();

        match metric.value() {
            Some(Value::Counter(value)) => {
                lines.push(format!("{}# TYPE {} counter\n{} {}", help, name, name, value));
            }
            Some(Value::Gauge(value)) => {
                lines.push(format!("{}# TYPE {} gauge\n{} {}", help, name, name, value));
            }
            Some(Value::Other(other)) => {
                if let Some(histogram) = other.downcast_ref::<AtomicHistogram>() {
                    let values = histogram_percentiles(histogram);
                    if values.is_empty() {
                        continue;
                    }
                    let mut block = format!("{}# TYPE {} gauge", help, name);
                    for (percentile, value) in values {
                        block.push_str(&format!(
                            "\n{}{{percentile=\"{}\"}} {}",
                            name, percentile, value
                        ));
                    }
                    lines.push(block);
                }
            }
            _ => continue,
        }
    }

    lines.sort();
    lines.join("\n") + "\n# EOF\n"
}

pub fn render_vars() -> String {
    let mut lines = Vec::new();

    for metric in &metriken::metrics() {
        let name = metric.name();

        match metric.value() {
            Some(Value::Counter(value)) => lines.push(format!("{}: {}", name, value)),
            Some(Value::Gauge(value)) => lines.push(format!("{}: {}", name, value)),
            Some(Value::Other(other)) => {
                if let Some(histogram) = other.downcast_ref::<AtomicHistogram>() {
                    for (percentile, value) in histogram_percentiles(histogram) {
                        lines.push(format!(
                            "{}/p{}: {}",
                            name,
                            (percentile * 10.0) as u32,
                            value
                        ));
                    }
                }
            }
            _ => continue,
        }
    }

    lines.sort();
    lines.join("\n") + "\n"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Metrics;
    use crate::stats::Sample;
    use std::time::Duration;

    fn record_one() {
        Metrics::record_request_started();
        Metrics::record_outcome(&Ok(Sample {
            ttft: Duration::from_millis(20),
            latency: Duration::from_millis(80),
            tokens: 12,
        }));
    }

    #[test]
    fn test_render_prometheus() {
        record_one();
        let text = render_prometheus();
        assert!(text.contains("# TYPE requests_started counter"));
        assert!(text.contains("# HELP tokens_total"));
        assert!(text.contains("# TYPE requests_inflight gauge"));
        assert!(text.contains("ttft{percentile=\"50\"}"));
        assert!(text.ends_with("# EOF\n"));
    }

    #[test]
    fn test_render_vars() {
        record_one();
        let text = render_vars();
        assert!(text.contains("requests_success: "));
        assert!(text.contains("request_latency/p990: "));
    }

    #[tokio::test]
    async fn test_routes() {
        let response = warp::test::request()
            .method("GET")
            .path("/metrics")
            .reply(&routes())
            .await;
        assert_eq!(response.status(), 200);

        let response = warp::test::request()
            .method("GET")
            .path("/unknown")
            .reply(&routes())
            .await;
        assert_eq!(response.status(), 404);
    }
}
