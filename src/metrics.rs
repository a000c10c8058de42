//! Ambient Prometheus metrics registry (spec §4.9, carried regardless of the
//! spec's Non-goal around dashboards — structured observability is part of
//! this crate's ambient stack). Mirrors the registration/HTTP-server shape
//! the teacher uses for its own load metrics.

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server};
use prometheus::{
    Encoder, Gauge, Histogram, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::env;
use std::sync::{Arc, Mutex};
use tracing::{error, info};

lazy_static::lazy_static! {
    pub static ref METRIC_NAMESPACE: String =
        env::var("METRIC_NAMESPACE").unwrap_or_else(|_| "kent_driver".to_string());

    // === Fetch metrics ===

    pub static ref DEQUEUES_TOTAL: IntCounter =
        IntCounter::with_opts(
            Opts::new("dequeues_total", "Total number of Requests dequeued by a worker")
                .namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();

    pub static ref FETCHES_TOTAL: IntCounterVec =
        IntCounterVec::new(
            Opts::new("fetches_total", "Total number of fetch attempts by outcome")
                .namespace(METRIC_NAMESPACE.as_str()),
            &["outcome"] // success, transient, structural, fatal
        ).unwrap();

    pub static ref FETCH_DURATION_SECONDS: Histogram =
        Histogram::with_opts(
            prometheus::HistogramOpts::new(
                "fetch_duration_seconds",
                "Fetch latency in seconds, from acquire to response"
            ).namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();

    pub static ref CONCURRENT_WORKERS: Gauge =
        Gauge::with_opts(
            Opts::new("concurrent_workers", "Number of scheduler workers currently running")
                .namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();

    pub static ref CURRENT_RATE: Gauge =
        Gauge::with_opts(
            Opts::new("rate_limiter_current_rate", "Current adaptive token bucket rate (tokens/sec)")
                .namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();

    // === Retry / error metrics ===

    pub static ref RETRIES_TOTAL: IntCounterVec =
        IntCounterVec::new(
            Opts::new("retries_total", "Total number of retry attempts by error type")
                .namespace(METRIC_NAMESPACE.as_str()),
            &["error_type"]
        ).unwrap();

    pub static ref ERRORS_TOTAL: IntCounterVec =
        IntCounterVec::new(
            Opts::new("errors_total", "Total number of terminal errors recorded by type")
                .namespace(METRIC_NAMESPACE.as_str()),
            &["error_type"]
        ).unwrap();

    // === Speculation metrics ===

    pub static ref SPECULATION_OUTCOMES_TOTAL: IntCounterVec =
        IntCounterVec::new(
            Opts::new("speculation_outcomes_total", "Speculative request outcomes")
                .namespace(METRIC_NAMESPACE.as_str()),
            &["slot_key", "outcome"] // outcome: hit, miss
        ).unwrap();

    // === Compression metrics ===

    pub static ref COMPRESSION_BYTES_ORIGINAL: IntCounter =
        IntCounter::with_opts(
            Opts::new("compression_bytes_original_total", "Total uncompressed response bytes stored")
                .namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();

    pub static ref COMPRESSION_BYTES_COMPRESSED: IntCounter =
        IntCounter::with_opts(
            Opts::new("compression_bytes_compressed_total", "Total compressed response bytes stored")
                .namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();

    // === Result metrics ===

    pub static ref RESULTS_TOTAL: IntCounterVec =
        IntCounterVec::new(
            Opts::new("results_total", "Total number of Results stored by type and validity")
                .namespace(METRIC_NAMESPACE.as_str()),
            &["result_type", "valid"]
        ).unwrap();
}

/// Registers all metrics with the default Prometheus registry.
pub fn register_metrics() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    prometheus::default_registry().register(Box::new(DEQUEUES_TOTAL.clone()))?;
    prometheus::default_registry().register(Box::new(FETCHES_TOTAL.clone()))?;
    prometheus::default_registry().register(Box::new(FETCH_DURATION_SECONDS.clone()))?;
    prometheus::default_registry().register(Box::new(CONCURRENT_WORKERS.clone()))?;
    prometheus::default_registry().register(Box::new(CURRENT_RATE.clone()))?;
    prometheus::default_registry().register(Box::new(RETRIES_TOTAL.clone()))?;
    prometheus::default_registry().register(Box::new(ERRORS_TOTAL.clone()))?;
    prometheus::default_registry().register(Box::new(SPECULATION_OUTCOMES_TOTAL.clone()))?;
    prometheus::default_registry().register(Box::new(COMPRESSION_BYTES_ORIGINAL.clone()))?;
    prometheus::default_registry().register(Box::new(COMPRESSION_BYTES_COMPRESSED.clone()))?;
    prometheus::default_registry().register(Box::new(RESULTS_TOTAL.clone()))?;
    Ok(())
}

/// Records one speculative outcome against the slot it belongs to.
pub fn record_speculation_outcome(slot_key: &str, hit: bool) {
    let outcome = if hit { "hit" } else { "miss" };
    SPECULATION_OUTCOMES_TOTAL.with_label_values(&[slot_key, outcome]).inc();
}

/// HTTP handler for the Prometheus metrics endpoint.
pub async fn metrics_handler(
    _req: Request<Body>,
    registry: Arc<Mutex<Registry>>,
) -> Result<Response<Body>, hyper::Error> {
    let encoder = TextEncoder::new();
    let metric_families = registry.lock().unwrap().gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();

    let response = Response::builder()
        .status(200)
        .header("Content-Type", encoder.format_type())
        .body(Body::from(buffer))
        .unwrap();

    Ok(response)
}

/// Starts the Prometheus metrics HTTP server.
pub async fn start_metrics_server(port: u16, registry: Arc<Mutex<Registry>>) {
    let addr = ([0, 0, 0, 0], port).into();

    let make_svc = make_service_fn(move |_conn| {
        let registry_clone = registry.clone();
        async move {
            Ok::<_, hyper::Error>(service_fn(move |req| {
                let registry_clone_inner = registry_clone.clone();
                async move { metrics_handler(req, registry_clone_inner).await }
            }))
        }
    });

    let server = Server::bind(&addr).serve(make_svc);
    info!(port = port, addr = %addr, "metrics server listening");

    if let Err(e) = server.await {
        error!(error = %e, "metrics server error");
    }
}

/// Gathers and encodes metrics as a string, for one-shot CLI output.
pub fn gather_metrics_string(registry: &Arc<Mutex<Registry>>) -> String {
    let encoder = TextEncoder::new();
    let metric_families = registry.lock().unwrap().gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap_or_else(|e| {
        eprintln!("error encoding metrics to UTF-8: {}", e);
        String::from("# ERROR ENCODING METRICS TO UTF-8")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn speculation_outcome_increments_the_right_label() {
        let before = SPECULATION_OUTCOMES_TOTAL.with_label_values(&["daily", "hit"]).get();
        record_speculation_outcome("daily", true);
        assert_eq!(
            SPECULATION_OUTCOMES_TOTAL.with_label_values(&["daily", "hit"]).get(),
            before + 1
        );
    }
}
