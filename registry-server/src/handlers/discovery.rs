//! Discovery read endpoints

use axum::extract::{Path, Query, State};
use axum::http::Uri;
use axum::response::Json;
use serde::Deserialize;

use registry_core::DiscoveryFilters;

use crate::error::ApiError;
use crate::models::{CatalogResponse, ServiceInstancesResponse};
use crate::server::AppState;

/// Query parameters for filtered discovery reads
#[derive(Debug, Default, Deserialize)]
pub struct DiscoveryQuery {
    #[serde(rename = "healthyOnly")]
    pub healthy_only: Option<String>,
    pub status: Option<String>,
    pub zone: Option<String>,
    pub version: Option<String>,
}

impl DiscoveryQuery {
    /// `?healthyOnly`, `?healthyOnly=` and `?healthyOnly=true` all opt in
    fn healthy_only(&self) -> bool {
        matches!(self.healthy_only.as_deref(), Some("" | "true" | "1"))
    }

    fn filters(&self) -> DiscoveryFilters {
        DiscoveryFilters {
            status: self.status.clone(),
            zone: self.zone.clone(),
            version: self.version.clone(),
        }
    }
}

/// `GET /api/v1/discovery/services/{serviceId}/instances`
pub async fn instances(
    State(state): State<AppState>,
    Path(service_id): Path<String>,
    Query(query): Query<DiscoveryQuery>,
    uri: Uri,
) -> Result<Json<ServiceInstancesResponse>, ApiError> {
    state
        .engine
        .discovery()
        .discover_filtered(&service_id, query.healthy_only(), &query.filters())
        .map(|instances| Json(ServiceInstancesResponse::new(&service_id, instances)))
        .map_err(|e| ApiError::from_registry(&e, uri.path()))
}

/// `GET /api/v1/discovery/services/{serviceId}/healthy-instances`
pub async fn healthy_instances(
    State(state): State<AppState>,
    Path(service_id): Path<String>,
    uri: Uri,
) -> Result<Json<ServiceInstancesResponse>, ApiError> {
    state
        .engine
        .discovery()
        .discover_healthy(&service_id)
        .map(|instances| Json(ServiceInstancesResponse::new(&service_id, instances)))
        .map_err(|e| ApiError::from_registry(&e, uri.path()))
}

/// `GET /api/v1/discovery/catalog?healthyOnly`
pub async fn catalog(
    State(state): State<AppState>,
    Query(query): Query<DiscoveryQuery>,
) -> Json<CatalogResponse> {
    let catalog = state.engine.discovery().catalog(query.healthy_only());
    Json(CatalogResponse {
        services: catalog.services,
        total_services: catalog.total_services,
        total_instances: catalog.total_instances,
    })
}

/// `GET /api/v1/discovery/services`
pub async fn services(State(state): State<AppState>) -> Json<Vec<String>> {
    Json(state.engine.discovery().services())
}
