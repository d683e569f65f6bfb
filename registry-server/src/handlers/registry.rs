//! Registration, heartbeat, and deregistration endpoints

use axum::extract::{Path, State};
use axum::http::{StatusCode, Uri};
use axum::response::Json;
use chrono::Utc;

use registry_core::{ServiceInstance, ServiceRegistration};

use crate::error::ApiError;
use crate::server::AppState;

/// `POST /api/v1/registry/services/{serviceId}/instances` -> 201
pub async fn register(
    State(state): State<AppState>,
    Path(service_id): Path<String>,
    uri: Uri,
    Json(registration): Json<ServiceRegistration>,
) -> Result<(StatusCode, Json<ServiceInstance>), ApiError> {
    let path = uri.path();
    if let Some(body_service_id) = &registration.service_id {
        if body_service_id != &service_id {
            return Err(ApiError::validation(
                path,
                "serviceId",
                format!("body serviceId `{body_service_id}` does not match the path"),
            ));
        }
    }
    let instance = registration.into_instance(&service_id, Utc::now());
    state
        .engine
        .register(instance)
        .map(|registered| (StatusCode::CREATED, Json(registered)))
        .map_err(|e| ApiError::from_registry(&e, path))
}

/// `DELETE /api/v1/registry/services/{serviceId}/instances/{instanceId}` -> 204, idempotent
pub async fn deregister(
    State(state): State<AppState>,
    Path((service_id, instance_id)): Path<(String, String)>,
    uri: Uri,
) -> Result<StatusCode, ApiError> {
    state
        .engine
        .deregister(&service_id, &instance_id)
        .map(|_| StatusCode::NO_CONTENT)
        .map_err(|e| ApiError::from_registry(&e, uri.path()))
}

/// `PUT /api/v1/registry/services/{serviceId}/instances/{instanceId}/heartbeat` -> 200 or 404
pub async fn heartbeat(
    State(state): State<AppState>,
    Path((service_id, instance_id)): Path<(String, String)>,
    uri: Uri,
) -> Result<Json<ServiceInstance>, ApiError> {
    let path = uri.path();
    match state.engine.renew(&service_id, &instance_id) {
        Ok(Some(instance)) => Ok(Json(instance)),
        Ok(None) => Err(ApiError::not_found(path, &service_id, &instance_id)),
        Err(e) => Err(ApiError::from_registry(&e, path)),
    }
}

/// `GET /api/v1/registry/services/{serviceId}/instances`
pub async fn list_instances(
    State(state): State<AppState>,
    Path(service_id): Path<String>,
) -> Json<Vec<ServiceInstance>> {
    Json(state.engine.store().get_instances(&service_id))
}

/// `GET /api/v1/registry/services`
pub async fn list_services(State(state): State<AppState>) -> Json<Vec<String>> {
    Json(state.engine.store().get_services())
}
