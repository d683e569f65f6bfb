//! HTTP-layer Prometheus metrics (behind the `monitoring` feature)

use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::time::Duration;
use tracing::warn;

/// Install the process-wide recorder; `None` when one is already installed
/// (tests build several routers in one process)
#[must_use]
pub fn install_recorder() -> Option<PrometheusHandle> {
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            describe_metrics();
            Some(handle)
        }
        Err(error) => {
            warn!(error = %error, "prometheus recorder not installed");
            None
        }
    }
}

fn describe_metrics() {
    describe_counter!(
        "registry_http_requests_total",
        "HTTP requests by method and status"
    );
    describe_histogram!(
        "registry_http_request_duration_seconds",
        "HTTP request duration in seconds"
    );
}

/// Record one request; called from the logging middleware
pub fn record_request(method: &str, path: &str, status: u16, duration: Duration) {
    // Path templates only would need the matched route; raw paths are fine
    // for a registry's small route surface
    counter!(
        "registry_http_requests_total",
        "method" => method.to_string(),
        "path" => path.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    histogram!(
        "registry_http_request_duration_seconds",
        "method" => method.to_string()
    )
    .record(duration.as_secs_f64());
}
