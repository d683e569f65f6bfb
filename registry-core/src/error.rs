//! Typed error surface for the registry core

use thiserror::Error;

use crate::model::InstanceStatus;

/// Core error types; transport edges map these to wire codes
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid {field}: {message}")]
    Validation { field: String, message: String },

    #[error("instance {service_id}/{instance_id} not found")]
    NotFound {
        service_id: String,
        instance_id: String,
    },

    #[error("status transition {from} -> {to} is not allowed")]
    InvalidTransition {
        from: InstanceStatus,
        to: InstanceStatus,
    },

    #[error("storage failure: {0}")]
    Storage(String),

    #[error("cluster error: {0}")]
    Cluster(String),

    #[error("registry is shutting down")]
    ShuttingDown,
}

impl RegistryError {
    #[must_use]
    pub fn validation(field: &str, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.to_string(),
            message: message.into(),
        }
    }

    #[must_use]
    pub fn not_found(service_id: &str, instance_id: &str) -> Self {
        Self::NotFound {
            service_id: service_id.to_string(),
            instance_id: instance_id.to_string(),
        }
    }
}

/// Result alias used throughout the core
pub type Result<T> = std::result::Result<T, RegistryError>;
