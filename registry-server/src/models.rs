//! REST response shapes

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use registry_core::{ServiceInstance, StatusRecord};

/// Instance list for one service with its recomputed total
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInstancesResponse {
    pub service_id: String,
    pub instances: Vec<ServiceInstance>,
    pub total_instances: usize,
}

impl ServiceInstancesResponse {
    #[must_use]
    pub fn new(service_id: &str, instances: Vec<ServiceInstance>) -> Self {
        Self {
            service_id: service_id.to_string(),
            total_instances: instances.len(),
            instances,
        }
    }
}

/// Full catalog snapshot
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogResponse {
    pub services: FxHashMap<String, Vec<ServiceInstance>>,
    pub total_services: usize,
    pub total_instances: usize,
}

/// Actuator health body
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub node_id: String,
    pub services: usize,
    pub instances: usize,
    pub uptime_seconds: u64,
}

/// Actuator info body
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InfoResponse {
    pub name: String,
    pub version: String,
    pub description: String,
}

/// Cluster health body
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterHealthResponse {
    pub status: String,
    pub total_nodes: usize,
    pub healthy_nodes: usize,
    pub needs_failover: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leader_node_id: Option<String>,
}

/// Acknowledgement for inbound replicated events and management actions
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckResponse {
    pub success: bool,
    pub message: String,
}

impl AckResponse {
    #[must_use]
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }
}

/// Status history for one instance
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusHistoryResponse {
    pub service_id: String,
    pub instance_id: String,
    pub history: Vec<StatusRecord>,
}
