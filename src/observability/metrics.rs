//! Metrics collection and exposition.
//!
//! # Metrics
//! - `gateway_requests_total` (counter): dispatched requests by route, status
//! - `gateway_request_duration_seconds` (histogram): time to response headers
//! - `gateway_backend_errors_total` (counter): synthesized 502s by backend
//! - `gateway_archive_cache_total` (counter): archive cache hit/miss/publish outcomes
//! - `gateway_git_bytes_total` (counter): bytes bridged per direction
//!
//! Recording is a no-op until a recorder is installed, so tests and
//! embedders that skip `init_metrics` pay nothing.

use std::net::SocketAddr;
use std::time::Instant;

use metrics_exporter_prometheus::PrometheusBuilder;

/// Start the Prometheus scrape endpoint.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_request(route: &'static str, status: u16, start: Instant) {
    metrics::counter!(
        "gateway_requests_total",
        "route" => route,
        "status" => status.to_string()
    )
    .increment(1);
    metrics::histogram!("gateway_request_duration_seconds", "route" => route)
        .record(start.elapsed().as_secs_f64());
}

pub fn record_backend_error(backend: &str) {
    metrics::counter!("gateway_backend_errors_total", "backend" => backend.to_string()).increment(1);
}

pub fn record_archive_cache(result: &'static str) {
    metrics::counter!("gateway_archive_cache_total", "result" => result).increment(1);
}

pub fn record_git_bytes(direction: &'static str, bytes: u64) {
    metrics::counter!("gateway_git_bytes_total", "direction" => direction).increment(bytes);
}
