//! Wire error envelope and mapping from core errors

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use registry_core::model::ts_millis;
use registry_core::RegistryError;

pub const CODE_VALIDATION: &str = "VALIDATION_001";
pub const CODE_REGISTRY_INTERNAL: &str = "REGISTRY_001";
pub const CODE_REGISTRY_NOT_FOUND: &str = "REGISTRY_002";
pub const CODE_AUTH: &str = "AUTH_001";
pub const CODE_INTERNAL: &str = "INTERNAL_ERROR";

/// Error envelope shared by every failure response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(with = "ts_millis")]
    pub timestamp: DateTime<Utc>,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<FxHashMap<String, String>>,
}

/// A failure response: HTTP status plus envelope body
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub body: ErrorBody,
}

impl ApiError {
    #[must_use]
    pub fn new(status: StatusCode, code: &str, message: impl Into<String>, path: &str) -> Self {
        Self {
            status,
            body: ErrorBody {
                code: code.to_string(),
                message: message.into(),
                timestamp: Utc::now(),
                path: path.to_string(),
                details: None,
            },
        }
    }

    #[must_use]
    pub fn with_detail(mut self, key: &str, value: impl Into<String>) -> Self {
        self.body
            .details
            .get_or_insert_with(FxHashMap::default)
            .insert(key.to_string(), value.into());
        self
    }

    #[must_use]
    pub fn validation(path: &str, field: &str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, CODE_VALIDATION, message, path)
            .with_detail("field", field)
    }

    #[must_use]
    pub fn not_found(path: &str, service_id: &str, instance_id: &str) -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            CODE_REGISTRY_NOT_FOUND,
            format!("instance {service_id}/{instance_id} not found"),
            path,
        )
    }

    #[must_use]
    pub fn internal(path: &str, message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            CODE_REGISTRY_INTERNAL,
            message,
            path,
        )
    }

    #[must_use]
    pub fn unauthorized(path: &str, hint: &str, remote_address: &str) -> Self {
        Self::new(
            StatusCode::UNAUTHORIZED,
            CODE_AUTH,
            "API key authentication required",
            path,
        )
        .with_detail("hint", hint)
        .with_detail("remote_address", remote_address)
    }

    /// Map a core error onto the wire contract
    #[must_use]
    pub fn from_registry(error: &RegistryError, path: &str) -> Self {
        match error {
            RegistryError::Validation { field, message } => {
                Self::validation(path, field, message.clone())
            }
            RegistryError::NotFound {
                service_id,
                instance_id,
            } => Self::not_found(path, service_id, instance_id),
            RegistryError::InvalidTransition { .. }
            | RegistryError::Storage(_)
            | RegistryError::Cluster(_)
            | RegistryError::ShuttingDown => Self::internal(path, error.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}
