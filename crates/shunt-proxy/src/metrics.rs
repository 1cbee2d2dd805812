//! Prometheus metrics for shunt-proxy.
//!
//! Tracks exchanges, cache activity and upstream reconnects.
use crate::proxy::response_ext::{full, ProxyBody};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_histogram_vec, Counter, CounterVec, Encoder,
    HistogramVec, TextEncoder,
};
use std::convert::Infallible;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

lazy_static! {
    /// Exchanges handled, by proxy kind and outcome (forwarded|replayed|failed)
    pub static ref EXCHANGES_TOTAL: CounterVec = register_counter_vec!(
        "shunt_exchanges_total",
        "Total number of exchanges handled by the proxies",
        &["proxy", "outcome"]
    )
    .unwrap();

    /// Time until the response head was available
    pub static ref EXCHANGE_DURATION_MS: HistogramVec = register_histogram_vec!(
        "shunt_exchange_duration_ms",
        "Time from request arrival until the response head is ready",
        &["proxy", "outcome"],
        vec![1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0]
    )
    .unwrap();

    /// Cache lookups by result (hit|miss|error)
    pub static ref CACHE_LOOKUPS_TOTAL: CounterVec = register_counter_vec!(
        "shunt_cache_lookups_total",
        "Total number of response cache lookups",
        &["result"]
    )
    .unwrap();

    pub static ref CACHE_STORES_TOTAL: Counter = register_counter!(
        "shunt_cache_stores_total",
        "Total number of responses written to the cache"
    )
    .unwrap();

    pub static ref RECONNECTS_TOTAL: CounterVec = register_counter_vec!(
        "shunt_reconnects_total",
        "Total number of upstream reconnect attempts",
        &["proxy"]
    )
    .unwrap();

    /// Exchanges that failed after reconnects were exhausted
    pub static ref UPSTREAM_FAILURES_TOTAL: CounterVec = register_counter_vec!(
        "shunt_upstream_failures_total",
        "Total number of terminal upstream failures",
        &["proxy"]
    )
    .unwrap();
}

/// Collect and return all metrics in Prometheus text format
pub fn collect_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!("Failed to encode metrics: {}", e);
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

pub fn record_exchange(proxy: &str, outcome: &str, duration_ms: f64) {
    EXCHANGES_TOTAL.with_label_values(&[proxy, outcome]).inc();
    EXCHANGE_DURATION_MS
        .with_label_values(&[proxy, outcome])
        .observe(duration_ms);
}

pub fn record_cache_lookup(result: &str) {
    CACHE_LOOKUPS_TOTAL.with_label_values(&[result]).inc();
}

pub fn record_cache_store() {
    CACHE_STORES_TOTAL.inc();
}

pub fn record_reconnect(proxy: &str) {
    RECONNECTS_TOTAL.with_label_values(&[proxy]).inc();
}

pub fn record_upstream_failure(proxy: &str) {
    UPSTREAM_FAILURES_TOTAL.with_label_values(&[proxy]).inc();
}

async fn metrics_response(
    req: Request<hyper::body::Incoming>,
) -> Result<Response<ProxyBody>, Infallible> {
    let response = if req.uri().path() == "/metrics" {
        Response::builder()
            .header("content-type", "text/plain; version=0.0.4")
            .body(full(collect_metrics()))
    } else {
        Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(full("Not Found"))
    };
    Ok(response.unwrap_or_else(|_| Response::new(full(""))))
}

/// Serve `/metrics` on `listener` until the task is dropped.
pub async fn serve(listener: TcpListener) -> std::io::Result<()> {
    info!("Metrics available on http://{}/metrics", listener.local_addr()?);
    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(metrics_response))
                .await
            {
                debug!("Metrics connection error: {}", e);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collect_metrics_after_recording() {
        record_exchange("forward", "forwarded", 12.0);
        record_cache_lookup("hit");
        record_cache_store();
        record_reconnect("intercept");
        record_upstream_failure("intercept");

        let output = collect_metrics();
        assert!(output.contains("shunt_exchanges_total"));
        assert!(output.contains("shunt_cache_lookups_total"));
        assert!(output.contains("shunt_cache_stores_total"));
        assert!(output.contains("shunt_reconnects_total"));
        assert!(output.contains("shunt_upstream_failures_total"));
    }

    #[test]
    fn test_counters_increase() {
        let before = RECONNECTS_TOTAL.with_label_values(&["test"]).get();
        record_reconnect("test");
        record_reconnect("test");
        assert_eq!(RECONNECTS_TOTAL.with_label_values(&["test"]).get(), before + 2.0);
    }

    #[tokio::test]
    async fn test_serve_metrics_endpoint() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(serve(listener));

        record_cache_store();
        let body = reqwest::get(format!("http://{addr}/metrics"))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert!(body.contains("shunt_cache_stores_total"));

        let missing = reqwest::get(format!("http://{addr}/other")).await.unwrap();
        assert_eq!(missing.status(), 404);
        server.abort();
    }
}
