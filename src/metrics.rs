//! Prometheus metrics.
//!
//! Thin wrappers over the `metrics` facade so call sites stay one-liners.
//! The recorder is installed once per process; [`init`] is idempotent so
//! tests can build several routers.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Instant;
use tracing::warn;

static PROMETHEUS: OnceLock<Option<PrometheusHandle>> = OnceLock::new();

/// Install the Prometheus recorder (first call only) and return its handle.
pub fn init() -> Option<PrometheusHandle> {
    PROMETHEUS
        .get_or_init(|| match PrometheusBuilder::new().install_recorder() {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!("Prometheus recorder not installed: {}", e);
                None
            }
        })
        .clone()
}

/// Count a finished request by endpoint and status code.
pub fn record_request(endpoint: &'static str, status: u16) {
    counter!(
        "cliprelay_requests_total",
        "endpoint" => endpoint,
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record request latency since `start`.
pub fn record_duration(endpoint: &'static str, start: Instant) {
    histogram!("cliprelay_request_duration_seconds", "endpoint" => endpoint)
        .record(start.elapsed().as_secs_f64());
}

pub fn record_upstream_error() {
    counter!("cliprelay_upstream_errors_total").increment(1);
}

/// Count a completed source download and its size.
pub fn record_download(bytes: u64) {
    counter!("cliprelay_source_downloads_total").increment(1);
    counter!("cliprelay_source_download_bytes_total").increment(bytes);
}

/// Count a VOD playlist fetch by outcome (`ok`, `invalid`, `error`).
pub fn record_playlist_fetch(outcome: &'static str) {
    counter!("cliprelay_vod_playlist_fetches_total", "outcome" => outcome).increment(1);
}

pub fn record_eviction() {
    counter!("cliprelay_cache_evictions_total").increment(1);
}

pub fn set_cached_clips(count: usize) {
    gauge!("cliprelay_cached_clips").set(count as f64);
}
