//! Prometheus metrics for the gateway.

use std::net::SocketAddr;
use std::time::Duration;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

use vcs_models::ErrorKind;

/// Install the Prometheus recorder with an HTTP listener on `addr`.
pub fn init_metrics(addr: SocketAddr) -> anyhow::Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    Ok(())
}

/// Metric names as constants for consistency.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "vcs_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "vcs_connections_active";
    pub const REQUESTS_TOTAL: &str = "vcs_requests_total";
    pub const REQUEST_DURATION_SECONDS: &str = "vcs_request_duration_seconds";
    pub const UPLOAD_BYTES_TOTAL: &str = "vcs_upload_bytes_total";
    pub const DOWNLOAD_BYTES_TOTAL: &str = "vcs_download_bytes_total";
    pub const FRAME_ERRORS_TOTAL: &str = "vcs_frame_errors_total";
    pub const SWEEPS_TOTAL: &str = "vcs_sweeps_total";
}

pub fn record_connection_opened() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

pub fn record_connection_closed() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record a handled request; `error` is the kind returned to the client, if any.
pub fn record_request(method: &str, error: Option<ErrorKind>, duration: Duration) {
    let outcome = error.map(|kind| kind.as_str()).unwrap_or("ok");
    let labels = [
        ("method", method.to_string()),
        ("outcome", outcome.to_string()),
    ];
    counter!(names::REQUESTS_TOTAL, &labels).increment(1);
    histogram!(names::REQUEST_DURATION_SECONDS, &labels).record(duration.as_secs_f64());
}

pub fn record_upload(bytes: u64) {
    counter!(names::UPLOAD_BYTES_TOTAL).increment(bytes);
}

pub fn record_download(bytes: usize) {
    counter!(names::DOWNLOAD_BYTES_TOTAL).increment(bytes as u64);
}

pub fn record_frame_error() {
    counter!(names::FRAME_ERRORS_TOTAL).increment(1);
}

pub fn record_sweep(expired: usize, purged: usize) {
    let labels = [("result", if expired + purged > 0 { "changed" } else { "idle" })];
    counter!(names::SWEEPS_TOTAL, &labels).increment(1);
}
