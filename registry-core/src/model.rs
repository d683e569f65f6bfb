//! Core data model: instances, events, cluster nodes

use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::time::Duration;

use crate::error::RegistryError;

/// Maximum length accepted for service and instance identifiers
pub const MAX_ID_LEN: usize = 100;

/// Default lease duration applied when a registration omits one
pub const DEFAULT_LEASE_SECS: u64 = 90;

/// Serde adapter for ISO-8601 UTC timestamps with millisecond precision
pub mod ts_millis {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

/// Lifecycle status of a registered instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    Starting,
    Up,
    Down,
    OutOfService,
    Unknown,
}

impl InstanceStatus {
    /// An instance serves traffic only while `UP`
    #[must_use]
    pub const fn is_healthy(self) -> bool {
        matches!(self, Self::Up)
    }

    #[must_use]
    pub const fn is_available(self) -> bool {
        matches!(self, Self::Up)
    }

    /// `OUT_OF_SERVICE` is the operator-driven terminal state
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::OutOfService)
    }

    /// Wire token used in JSON bodies and query parameters
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "STARTING",
            Self::Up => "UP",
            Self::Down => "DOWN",
            Self::OutOfService => "OUT_OF_SERVICE",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstanceStatus {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "STARTING" => Ok(Self::Starting),
            "UP" => Ok(Self::Up),
            "DOWN" => Ok(Self::Down),
            "OUT_OF_SERVICE" => Ok(Self::OutOfService),
            "UNKNOWN" => Ok(Self::Unknown),
            other => Err(RegistryError::Validation {
                field: "status".to_string(),
                message: format!("unknown status token: {other}"),
            }),
        }
    }
}

/// Probe protocol for an instance health check
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HealthCheckType {
    #[default]
    Http,
    Tcp,
    Script,
}

/// Built-in probe cadence when neither the instance nor the server
/// configuration supplies one
pub const DEFAULT_PROBE_INTERVAL_SECS: u64 = 30;
/// Built-in per-attempt probe deadline
pub const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 5;
/// Built-in probe attempt count
pub const DEFAULT_PROBE_RETRY_COUNT: u32 = 3;

/// Per-instance probe configuration. Omitted values fall back to the probe
/// engine's configured defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, rename = "type")]
    pub check_type: HealthCheckType,
    #[serde(default = "default_path")]
    pub path: String,
    /// Probe cadence in seconds
    #[serde(
        default,
        rename = "interval",
        skip_serializing_if = "Option::is_none"
    )]
    pub interval_secs: Option<u64>,
    /// Per-attempt deadline in seconds
    #[serde(
        default,
        rename = "timeout",
        skip_serializing_if = "Option::is_none"
    )]
    pub timeout_secs: Option<u64>,
    /// Total attempts per probe; the verdict is UP iff any attempt succeeds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
}

fn default_true() -> bool {
    true
}

fn default_path() -> String {
    "/actuator/health".to_string()
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_type: HealthCheckType::Http,
            path: default_path(),
            interval_secs: None,
            timeout_secs: None,
            retry_count: None,
        }
    }
}

impl HealthCheckConfig {
    #[must_use]
    pub fn interval_or(&self, default_secs: u64) -> Duration {
        Duration::from_secs(self.interval_secs.unwrap_or(default_secs))
    }

    #[must_use]
    pub fn timeout_or(&self, default_secs: u64) -> Duration {
        Duration::from_secs(self.timeout_secs.unwrap_or(default_secs))
    }

    #[must_use]
    pub fn retries_or(&self, default_count: u32) -> u32 {
        self.retry_count.unwrap_or(default_count).max(1)
    }

    pub fn validate(&self) -> Result<(), RegistryError> {
        if self.path.is_empty() {
            return Err(RegistryError::Validation {
                field: "healthCheck.path".to_string(),
                message: "path must not be empty".to_string(),
            });
        }
        if self.retry_count == Some(0) {
            return Err(RegistryError::Validation {
                field: "healthCheck.retryCount".to_string(),
                message: "retryCount must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

/// A single running endpoint of a service, identified by `(serviceId, instanceId)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInstance {
    pub service_id: String,
    pub instance_id: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub secure: bool,
    pub status: InstanceStatus,
    #[serde(default)]
    pub metadata: FxHashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheckConfig>,
    /// Heartbeat-timeout override in seconds
    #[serde(
        default,
        rename = "leaseDuration",
        skip_serializing_if = "Option::is_none"
    )]
    pub lease_duration_secs: Option<u64>,
    #[serde(with = "ts_millis")]
    pub registration_time: DateTime<Utc>,
    #[serde(with = "ts_millis")]
    pub last_heartbeat: DateTime<Utc>,
}

impl ServiceInstance {
    /// Composite identity key, unique across the store
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}/{}", self.service_id, self.instance_id)
    }

    /// Base URI derived from the endpoint; `secure` selects the scheme
    #[must_use]
    pub fn uri(&self) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        format!("{scheme}://{}:{}", self.host, self.port)
    }

    /// Heartbeat-timeout threshold for this instance
    #[must_use]
    pub fn lease_duration(&self, default_secs: u64) -> Duration {
        Duration::from_secs(self.lease_duration_secs.unwrap_or(default_secs))
    }

    /// Seconds since the last heartbeat, saturating at zero
    #[must_use]
    pub fn heartbeat_age(&self, now: DateTime<Utc>) -> Duration {
        let secs = (now - self.last_heartbeat).num_seconds().max(0);
        // num_seconds() is clamped non-negative above
        Duration::from_secs(secs as u64)
    }

    pub fn validate(&self) -> Result<(), RegistryError> {
        validate_identifier("serviceId", &self.service_id)?;
        validate_identifier("instanceId", &self.instance_id)?;
        validate_host(&self.host)?;
        validate_port(self.port)?;
        if let Some(hc) = &self.health_check {
            hc.validate()?;
        }
        Ok(())
    }
}

/// External-facing registration request; becomes a [`ServiceInstance`] on entry
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRegistration {
    /// Optional; when present it must match the target service id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_id: Option<String>,
    pub instance_id: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub secure: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<InstanceStatus>,
    #[serde(default)]
    pub metadata: FxHashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheckConfig>,
    #[serde(
        default,
        rename = "leaseDuration",
        skip_serializing_if = "Option::is_none"
    )]
    pub lease_duration_secs: Option<u64>,
}

impl ServiceRegistration {
    /// Convert to a store instance; missing status defaults to `STARTING`
    #[must_use]
    pub fn into_instance(self, service_id: &str, now: DateTime<Utc>) -> ServiceInstance {
        ServiceInstance {
            service_id: service_id.to_string(),
            instance_id: self.instance_id,
            host: self.host,
            port: self.port,
            secure: self.secure,
            status: self.status.unwrap_or(InstanceStatus::Starting),
            metadata: self.metadata,
            health_check: self.health_check,
            lease_duration_secs: self.lease_duration_secs,
            registration_time: now,
            last_heartbeat: now,
        }
    }
}

/// Kind of change a [`ServiceEvent`] records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceEventType {
    Register,
    Deregister,
    Renew,
    StatusChange,
}

impl ServiceEventType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Register => "REGISTER",
            Self::Deregister => "DEREGISTER",
            Self::Renew => "RENEW",
            Self::StatusChange => "STATUS_CHANGE",
        }
    }
}

impl fmt::Display for ServiceEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable record of a state change, flowing through the bus and replication
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceEvent {
    pub event_id: String,
    #[serde(rename = "type")]
    pub event_type: ServiceEventType,
    pub service_id: String,
    pub instance_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<ServiceInstance>,
    #[serde(with = "ts_millis")]
    pub timestamp: DateTime<Utc>,
    /// Node that committed the originating mutation; distinguishes local from replicated
    #[serde(default)]
    pub origin_node_id: String,
}

impl ServiceEvent {
    #[must_use]
    pub fn new(
        event_type: ServiceEventType,
        instance: &ServiceInstance,
        origin_node_id: &str,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            event_type,
            service_id: instance.service_id.clone(),
            instance_id: instance.instance_id.clone(),
            instance: Some(instance.clone()),
            timestamp: Utc::now(),
            origin_node_id: origin_node_id.to_string(),
        }
    }

    /// `DEREGISTER` events carry the final snapshot of the removed instance
    #[must_use]
    pub fn deregistered(instance: &ServiceInstance, origin_node_id: &str) -> Self {
        Self::new(ServiceEventType::Deregister, instance, origin_node_id)
    }
}

/// Liveness status of a cluster peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStatus {
    Up,
    Down,
    Starting,
    Unknown,
}

impl NodeStatus {
    #[must_use]
    pub const fn is_up(self) -> bool {
        matches!(self, Self::Up)
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let token = match self {
            Self::Up => "UP",
            Self::Down => "DOWN",
            Self::Starting => "STARTING",
            Self::Unknown => "UNKNOWN",
        };
        f.write_str(token)
    }
}

/// A registry process participating in best-effort event replication
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterNode {
    pub node_id: String,
    pub host: String,
    pub port: u16,
    pub status: NodeStatus,
    #[serde(with = "ts_millis")]
    pub last_seen: DateTime<Utc>,
    #[serde(default)]
    pub metadata: FxHashMap<String, String>,
}

impl ClusterNode {
    #[must_use]
    pub fn new(node_id: &str, host: &str, port: u16, status: NodeStatus) -> Self {
        Self {
            node_id: node_id.to_string(),
            host: host.to_string(),
            port,
            status,
            last_seen: Utc::now(),
            metadata: FxHashMap::default(),
        }
    }

    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    #[must_use]
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn validate(&self) -> Result<(), RegistryError> {
        if self.node_id.is_empty() {
            return Err(RegistryError::Validation {
                field: "nodeId".to_string(),
                message: "nodeId must not be empty".to_string(),
            });
        }
        validate_host(&self.host)?;
        validate_port(self.port)?;
        Ok(())
    }
}

/// Point-in-time view of the cluster as seen by one node
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    pub cluster_id: String,
    pub nodes: Vec<ClusterNode>,
    pub current_node: ClusterNode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leader_node_id: Option<String>,
    pub total_nodes: usize,
    pub healthy_nodes: usize,
}

/// One entry in an instance's status history
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusRecord {
    pub status: InstanceStatus,
    pub previous_status: InstanceStatus,
    pub reason: String,
    #[serde(with = "ts_millis")]
    pub timestamp: DateTime<Utc>,
}

/// A probe verdict published on the health-event stream
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthEvent {
    pub service_id: String,
    pub instance_id: String,
    pub healthy: bool,
    pub message: String,
    #[serde(with = "ts_millis")]
    pub timestamp: DateTime<Utc>,
}

/// Validate a service or instance identifier: non-empty, bounded, `[A-Za-z0-9._-]+`
pub fn validate_identifier(field: &str, value: &str) -> Result<(), RegistryError> {
    if value.is_empty() {
        return Err(RegistryError::Validation {
            field: field.to_string(),
            message: format!("{field} must not be empty"),
        });
    }
    if value.len() > MAX_ID_LEN {
        return Err(RegistryError::Validation {
            field: field.to_string(),
            message: format!("{field} exceeds {MAX_ID_LEN} characters"),
        });
    }
    let valid = value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if !valid {
        return Err(RegistryError::Validation {
            field: field.to_string(),
            message: format!("{field} must match [A-Za-z0-9._-]+"),
        });
    }
    Ok(())
}

/// Validate a host: IPv4 literal, `localhost`, or a DNS name
pub fn validate_host(host: &str) -> Result<(), RegistryError> {
    if host.is_empty() || host.len() > 253 {
        return Err(RegistryError::Validation {
            field: "host".to_string(),
            message: "host must be a non-empty name of at most 253 characters".to_string(),
        });
    }
    if host == "localhost" || host.parse::<Ipv4Addr>().is_ok() {
        return Ok(());
    }
    let valid_dns = host.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && label
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-')
            && !label.starts_with('-')
            && !label.ends_with('-')
    });
    if !valid_dns {
        return Err(RegistryError::Validation {
            field: "host".to_string(),
            message: format!("host is not an IPv4 literal, localhost, or DNS name: {host}"),
        });
    }
    Ok(())
}

/// Ports are 1..=65535; zero is the only invalid `u16`
pub fn validate_port(port: u16) -> Result<(), RegistryError> {
    if port == 0 {
        return Err(RegistryError::Validation {
            field: "port".to_string(),
            message: "port must be between 1 and 65535".to_string(),
        });
    }
    Ok(())
}
