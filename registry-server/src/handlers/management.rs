//! Operational endpoints: instance inspection and the cleanup stub

use axum::extract::{Path, State};
use axum::http::Uri;
use axum::response::Json;
use tracing::info;

use registry_core::ServiceInstance;

use crate::error::ApiError;
use crate::models::{AckResponse, StatusHistoryResponse};
use crate::server::AppState;

/// `POST /api/v1/management/cleanup`
///
/// Acknowledges without doing work; the expiry scanner owns actual cleanup.
pub async fn cleanup(State(_state): State<AppState>) -> Json<AckResponse> {
    info!("manual cleanup requested; eviction is handled by the expiry scanner");
    Json(AckResponse::ok("cleanup completed"))
}

/// `GET /api/v1/management/instances/{serviceId}/{instanceId}`
pub async fn instance(
    State(state): State<AppState>,
    Path((service_id, instance_id)): Path<(String, String)>,
    uri: Uri,
) -> Result<Json<ServiceInstance>, ApiError> {
    state
        .engine
        .store()
        .get_instance(&service_id, &instance_id)
        .map(Json)
        .ok_or_else(|| ApiError::not_found(uri.path(), &service_id, &instance_id))
}

/// `GET /api/v1/management/instances/{serviceId}/{instanceId}/history`
pub async fn history(
    State(state): State<AppState>,
    Path((service_id, instance_id)): Path<(String, String)>,
    uri: Uri,
) -> Result<Json<StatusHistoryResponse>, ApiError> {
    if state
        .engine
        .store()
        .get_instance(&service_id, &instance_id)
        .is_none()
    {
        return Err(ApiError::not_found(uri.path(), &service_id, &instance_id));
    }
    Ok(Json(StatusHistoryResponse {
        history: state.engine.status_history(&service_id, &instance_id),
        service_id,
        instance_id,
    }))
}
