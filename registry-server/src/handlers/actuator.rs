//! Actuator endpoints: health, info, and Prometheus exposition
//!
//! These paths are public by default and are what cluster peers probe for
//! liveness.

use axum::extract::State;
use axum::response::Json;
use std::fmt::Write as _;

use crate::models::{HealthResponse, InfoResponse};
use crate::server::AppState;

/// `GET /actuator/health`
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let engine = &state.engine;
    let status = if engine.is_healthy() { "UP" } else { "DOWN" };
    Json(HealthResponse {
        status: status.to_string(),
        node_id: state.config.node_id(),
        services: engine.store().get_services().len(),
        instances: engine.store().instance_count(),
        uptime_seconds: engine.metrics().uptime().as_secs(),
    })
}

/// `GET /actuator/info` and `GET /management/info`
pub async fn info() -> Json<InfoResponse> {
    Json(InfoResponse {
        name: env!("CARGO_PKG_NAME").to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        description: "Service registry and discovery control plane".to_string(),
    })
}

/// `GET /actuator/prometheus` — text exposition of the core counters, plus
/// the HTTP-layer metrics when the `monitoring` feature is active
pub async fn prometheus(State(state): State<AppState>) -> String {
    let metrics = state.engine.metrics();
    let mut body = String::new();

    let _ = writeln!(
        body,
        "# HELP registry_uptime_seconds Registry uptime\n# TYPE registry_uptime_seconds gauge\nregistry_uptime_seconds {}",
        metrics.uptime().as_secs()
    );
    let _ = writeln!(
        body,
        "# HELP registry_services Known services\n# TYPE registry_services gauge\nregistry_services {}",
        state.engine.store().get_services().len()
    );
    let _ = writeln!(
        body,
        "# HELP registry_instances Registered instances\n# TYPE registry_instances gauge\nregistry_instances {}",
        state.engine.store().instance_count()
    );
    for (name, value) in metrics.counter_snapshot() {
        let _ = writeln!(
            body,
            "# TYPE registry_{name}_total counter\nregistry_{name}_total {value}"
        );
    }
    for (name, agg) in metrics.duration_snapshot() {
        let _ = writeln!(
            body,
            "# TYPE registry_{name}_duration_micros summary\nregistry_{name}_duration_micros_count {}\nregistry_{name}_duration_micros_sum {}\nregistry_{name}_duration_micros_max {}",
            agg.count, agg.total_micros, agg.max_micros
        );
    }

    #[cfg(feature = "monitoring")]
    if let Some(handle) = &state.prometheus {
        body.push('\n');
        body.push_str(&handle.render());
    }

    body
}
