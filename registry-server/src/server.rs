//! Router assembly and the HTTP server lifecycle

use anyhow::Result;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{middleware, Json, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use registry_core::RegistryEngine;

use crate::config::RegistryConfig;
use crate::error::{ApiError, CODE_INTERNAL};
use crate::handlers::{actuator, cluster, discovery, events, management, registry};
use crate::middleware::{api_key_middleware, logging_middleware, AuthState};

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<RegistryEngine>,
    pub config: Arc<RegistryConfig>,
    #[cfg(feature = "monitoring")]
    pub prometheus: Option<metrics_exporter_prometheus::PrometheusHandle>,
}

/// Registry HTTP server
pub struct RegistryServer {
    config: Arc<RegistryConfig>,
    engine: Arc<RegistryEngine>,
}

impl RegistryServer {
    /// Build the engine from validated configuration
    pub fn new(config: RegistryConfig) -> Result<Self> {
        config.validate()?;
        let engine = RegistryEngine::new(config.core_config())
            .map_err(|e| anyhow::anyhow!("failed to build registry engine: {e}"))?;
        Ok(Self {
            config: Arc::new(config),
            engine: Arc::new(engine),
        })
    }

    #[must_use]
    pub fn engine(&self) -> Arc<RegistryEngine> {
        Arc::clone(&self.engine)
    }

    /// Start background loops, bind, and serve until the shutdown signal
    pub async fn start(self) -> Result<()> {
        let addr: SocketAddr = self
            .config
            .server_address()
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid server address `{}`: {e}", self.config.server_address()))?;

        self.engine.start();
        let engine = Arc::clone(&self.engine);
        let app = build_router(Arc::clone(&self.config), Arc::clone(&self.engine));

        info!("starting registry server on {addr}");
        let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
            error!("failed to bind {addr}: {e}");
            anyhow::anyhow!("failed to bind to {addr}: {e}")
        })?;

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        engine.shutdown().await;
        Ok(())
    }
}

/// Assemble routes and middleware; cluster endpoints are mounted only when
/// clustering is enabled
#[must_use]
pub fn build_router(config: Arc<RegistryConfig>, engine: Arc<RegistryEngine>) -> Router {
    #[cfg(feature = "monitoring")]
    let prometheus = crate::metrics::install_recorder();

    let state = AppState {
        engine,
        config: Arc::clone(&config),
        #[cfg(feature = "monitoring")]
        prometheus,
    };

    let mut router = Router::new()
        // Registry
        .route(
            "/api/v1/registry/services/:service_id/instances",
            post(registry::register).get(registry::list_instances),
        )
        .route(
            "/api/v1/registry/services/:service_id/instances/:instance_id",
            delete(registry::deregister),
        )
        .route(
            "/api/v1/registry/services/:service_id/instances/:instance_id/heartbeat",
            put(registry::heartbeat),
        )
        .route("/api/v1/registry/services", get(registry::list_services))
        // Discovery
        .route(
            "/api/v1/discovery/services/:service_id/instances",
            get(discovery::instances),
        )
        .route(
            "/api/v1/discovery/services/:service_id/healthy-instances",
            get(discovery::healthy_instances),
        )
        .route("/api/v1/discovery/catalog", get(discovery::catalog))
        .route("/api/v1/discovery/services", get(discovery::services))
        // Event streams
        .route(
            "/api/v1/events/services/:service_id/stream",
            get(events::sse_stream),
        )
        .route("/api/v1/events/health/stream", get(events::health_stream))
        .route("/ws/services/:service_id/events", get(events::websocket))
        // Management
        .route("/api/v1/management/cleanup", post(management::cleanup))
        .route(
            "/api/v1/management/instances/:service_id/:instance_id",
            get(management::instance),
        )
        .route(
            "/api/v1/management/instances/:service_id/:instance_id/history",
            get(management::history),
        )
        // Actuator (public)
        .route("/actuator/health", get(actuator::health))
        .route("/actuator/info", get(actuator::info))
        .route("/actuator/prometheus", get(actuator::prometheus))
        .route("/management/info", get(actuator::info));

    if config.cluster.enabled {
        router = router
            .route("/api/v1/cluster/events", post(cluster::post_event))
            .route("/api/v1/cluster/events/stream", get(cluster::event_stream))
            .route("/api/v1/cluster/status", get(cluster::status))
            .route("/api/v1/cluster/nodes", get(cluster::nodes))
            .route("/api/v1/cluster/current-node", get(cluster::current_node))
            .route("/api/v1/cluster/health", get(cluster::health))
            .route("/api/v1/cluster/join", post(cluster::join));
    }

    let auth_state = AuthState { config };

    router
        .with_state(state)
        .layer(TimeoutLayer::new(std::time::Duration::from_secs(30)))
        .layer(middleware::from_fn_with_state(auth_state, api_key_middleware))
        .layer(middleware::from_fn(logging_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(CatchPanicLayer::custom(handle_panic))
}

/// Panics from handler code surface as the INTERNAL_ERROR envelope
fn handle_panic(panic: Box<dyn std::any::Any + Send + 'static>) -> Response {
    let detail = panic
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unexpected panic");
    error!(detail = %detail, "request handler panicked");
    let body = ApiError::new(
        StatusCode::INTERNAL_SERVER_ERROR,
        CODE_INTERNAL,
        "internal server error",
        "unknown",
    )
    .body;
    (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to listen for shutdown signal: {e}");
        return;
    }
    info!("shutdown signal received");
}

/// Route documentation for `--routes`
pub fn print_routes() {
    println!("Registry Server Routes:");
    println!("=======================");
    println!();
    println!("Registry:");
    println!("  POST   /api/v1/registry/services/:serviceId/instances                       - Register instance");
    println!("  GET    /api/v1/registry/services/:serviceId/instances                       - List instances");
    println!("  DELETE /api/v1/registry/services/:serviceId/instances/:instanceId           - Deregister (idempotent)");
    println!("  PUT    /api/v1/registry/services/:serviceId/instances/:instanceId/heartbeat - Renew lease");
    println!("  GET    /api/v1/registry/services                                            - List service ids");
    println!();
    println!("Discovery:");
    println!("  GET    /api/v1/discovery/services/:serviceId/instances          - Filtered instances");
    println!("  GET    /api/v1/discovery/services/:serviceId/healthy-instances  - UP instances only");
    println!("  GET    /api/v1/discovery/catalog                                - Full catalog");
    println!("  GET    /api/v1/discovery/services                               - List service ids");
    println!();
    println!("Event streams:");
    println!("  GET    /api/v1/events/services/:serviceId/stream - SSE stream");
    println!("  GET    /api/v1/events/health/stream              - SSE stream of probe verdicts");
    println!("  WS     /ws/services/:serviceId/events            - WebSocket stream");
    println!();
    println!("Cluster (when cluster.enabled):");
    println!("  POST   /api/v1/cluster/events        - Inbound replicated event");
    println!("  GET    /api/v1/cluster/events/stream - SSE stream of replicated events");
    println!("  GET    /api/v1/cluster/status        - Cluster status");
    println!("  GET    /api/v1/cluster/nodes         - Membership table");
    println!("  GET    /api/v1/cluster/current-node  - Local node");
    println!("  GET    /api/v1/cluster/health        - Cluster health");
    println!("  POST   /api/v1/cluster/join          - Join a node");
    println!();
    println!("Management & actuator:");
    println!("  POST   /api/v1/management/cleanup                                   - Cleanup (acknowledged)");
    println!("  GET    /api/v1/management/instances/:serviceId/:instanceId          - Inspect instance");
    println!("  GET    /api/v1/management/instances/:serviceId/:instanceId/history  - Status history");
    println!("  GET    /actuator/health | /actuator/info | /actuator/prometheus | /management/info");
}
