//! Cluster endpoints: inbound replication, membership, and the event stream
//!
//! Mounted only when clustering is enabled.

use axum::extract::State;
use axum::http::Uri;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::Json;
use futures_util::Stream;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::broadcast;

use registry_core::{ClusterManager, ClusterNode, ClusterStatus, ServiceEvent};

use crate::error::ApiError;
use crate::models::{AckResponse, ClusterHealthResponse};
use crate::server::AppState;

fn manager<'a>(state: &'a AppState, path: &str) -> Result<&'a Arc<ClusterManager>, ApiError> {
    state
        .engine
        .cluster_manager()
        .ok_or_else(|| ApiError::internal(path, "clustering is not enabled on this node"))
}

/// `POST /api/v1/cluster/events` — peer-pushed replicated event
pub async fn post_event(
    State(state): State<AppState>,
    uri: Uri,
    Json(event): Json<ServiceEvent>,
) -> Result<Json<AckResponse>, ApiError> {
    state
        .engine
        .handle_cluster_event(event)
        .map(|()| Json(AckResponse::ok("event accepted")))
        .map_err(|e| ApiError::from_registry(&e, uri.path()))
}

/// `GET /api/v1/cluster/status`
pub async fn status(
    State(state): State<AppState>,
    uri: Uri,
) -> Result<Json<ClusterStatus>, ApiError> {
    Ok(Json(manager(&state, uri.path())?.cluster_status()))
}

/// `GET /api/v1/cluster/nodes`
pub async fn nodes(
    State(state): State<AppState>,
    uri: Uri,
) -> Result<Json<Vec<ClusterNode>>, ApiError> {
    Ok(Json(manager(&state, uri.path())?.cache().list()))
}

/// `GET /api/v1/cluster/current-node`
pub async fn current_node(
    State(state): State<AppState>,
    uri: Uri,
) -> Result<Json<ClusterNode>, ApiError> {
    Ok(Json(manager(&state, uri.path())?.current_node()))
}

/// `GET /api/v1/cluster/health`
pub async fn health(
    State(state): State<AppState>,
    uri: Uri,
) -> Result<Json<ClusterHealthResponse>, ApiError> {
    let manager = manager(&state, uri.path())?;
    let status = manager.cluster_status();
    let needs_failover = manager.needs_failover();
    Ok(Json(ClusterHealthResponse {
        status: if needs_failover { "DEGRADED" } else { "UP" }.to_string(),
        total_nodes: status.total_nodes,
        healthy_nodes: status.healthy_nodes,
        needs_failover,
        leader_node_id: status.leader_node_id,
    }))
}

/// `POST /api/v1/cluster/join` — accept a node into the membership table
pub async fn join(
    State(state): State<AppState>,
    uri: Uri,
    Json(node): Json<ClusterNode>,
) -> Result<Json<AckResponse>, ApiError> {
    let path = uri.path();
    let node_id = node.node_id.clone();
    manager(&state, path)?
        .add_node(node)
        .map(|()| Json(AckResponse::ok(format!("node {node_id} joined"))))
        .map_err(|e| ApiError::from_registry(&e, path))
}

/// `GET /api/v1/cluster/events/stream` — SSE feed of applied replicated events
pub async fn event_stream(
    State(state): State<AppState>,
    uri: Uri,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let path = uri.path();
    let sync = state
        .engine
        .cluster_sync()
        .ok_or_else(|| ApiError::internal(path, "clustering is not enabled on this node"))?;
    let receiver = sync.subscribe_replicated();

    let stream = futures_util::stream::unfold(receiver, |mut receiver| async move {
        loop {
            match receiver.recv().await {
                Ok(event) => {
                    let Ok(sse) = Event::default()
                        .event(event.event_type.as_str())
                        .json_data(&event)
                    else {
                        continue;
                    };
                    return Some((Ok(sse), receiver));
                }
                // Slow consumer: skip what was dropped and keep streaming
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
