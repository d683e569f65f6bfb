//! Configuration for the registry server
//!
//! Three layers, strongest last: built-in defaults, file overlays mounted by
//! the container orchestrator (one file per key, filename is the dotted key),
//! and `HSC_REGISTRY_*` environment variables.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use registry_core::cluster::parse_peer;
use registry_core::{ClusterConfig, CoreConfig, ProbeEngineConfig};

/// Environment variable naming the non-secret overlay directory
pub const ENV_CONFIG_DIR: &str = "HSC_REGISTRY_CONFIG_DIR";
/// Environment variable naming the secret overlay directory
pub const ENV_SECRETS_DIR: &str = "HSC_REGISTRY_SECRETS_DIR";

/// Recognized environment overrides, mapped to their dotted config keys.
/// The names are contract-bearing.
const ENV_KEYS: &[(&str, &str)] = &[
    ("HSC_REGISTRY_SERVER_HOST", "server.host"),
    ("HSC_REGISTRY_SERVER_PORT", "server.port"),
    ("HSC_REGISTRY_CLUSTER_ENABLED", "cluster.enabled"),
    ("HSC_REGISTRY_CLUSTER_NODES", "cluster.nodes"),
    ("HSC_REGISTRY_CLUSTER_NODE_ID", "cluster.node_id"),
    ("HSC_REGISTRY_CLUSTER_SYNC_INTERVAL", "cluster.sync_interval_secs"),
    ("HSC_REGISTRY_HEALTH_CHECK_ENABLED", "health_check.enabled"),
    (
        "HSC_REGISTRY_HEALTH_CHECK_DEFAULT_INTERVAL",
        "health_check.default_interval_secs",
    ),
    (
        "HSC_REGISTRY_HEALTH_CHECK_DEFAULT_TIMEOUT",
        "health_check.default_timeout_secs",
    ),
    ("HSC_REGISTRY_HEALTH_CHECK_MAX_RETRY", "health_check.max_retry"),
    ("HSC_REGISTRY_STORAGE_TYPE", "storage.type"),
    (
        "HSC_REGISTRY_STORAGE_EVICTION_INTERVAL",
        "storage.eviction_interval_secs",
    ),
    ("HSC_REGISTRY_STORAGE_DEFAULT_LEASE", "storage.default_lease_secs"),
    ("HSC_REGISTRY_SECURITY_ENABLED", "security.enabled"),
    ("HSC_REGISTRY_SECURITY_API_KEY", "security.api_key"),
    ("HSC_REGISTRY_SECURITY_HEADER_NAME", "security.header_name"),
    (
        "HSC_REGISTRY_SECURITY_QUERY_PARAM_NAME",
        "security.query_param_name",
    ),
    ("HSC_REGISTRY_SECURITY_PUBLIC_PATHS", "security.public_paths"),
];

/// Keys whose values are comma-separated lists on the wire
const LIST_KEYS: &[&str] = &["security.public_paths"];

/// Registry server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// HTTP server configuration
    pub server: ServerConfig,
    /// Cluster replication configuration
    pub cluster: ClusterSection,
    /// Health probe engine configuration
    pub health_check: HealthCheckSection,
    /// Storage and lease configuration
    pub storage: StorageSection,
    /// API-key authentication configuration
    pub security: SecuritySection,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind host
    pub host: String,
    /// Listen port (1024..=65535)
    pub port: u16,
    /// Request timeout in seconds
    pub timeout_seconds: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8761,
            timeout_seconds: 30,
        }
    }
}

/// Cluster replication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterSection {
    /// Turns on sync and the cluster endpoints
    pub enabled: bool,
    /// Comma-separated `host:port` peer list
    pub nodes: String,
    /// Node id override; defaults to `host:port`
    pub node_id: Option<String>,
    /// Peer-liveness and reconcile cadence in seconds
    pub sync_interval_secs: u64,
    /// Deadline for peer calls in seconds
    pub request_timeout_secs: u64,
}

impl Default for ClusterSection {
    fn default() -> Self {
        Self {
            enabled: false,
            nodes: String::new(),
            node_id: None,
            sync_interval_secs: 30,
            request_timeout_secs: 5,
        }
    }
}

impl ClusterSection {
    /// Peer entries, trimmed and without empties
    #[must_use]
    pub fn peers(&self) -> Vec<String> {
        self.nodes
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(ToString::to_string)
            .collect()
    }
}

/// Health probe engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckSection {
    /// Master switch for the probe engine
    pub enabled: bool,
    /// Cadence default for instances that omit one, in seconds
    pub default_interval_secs: u64,
    /// Per-attempt deadline default, in seconds
    pub default_timeout_secs: u64,
    /// Attempt-count bound (0..=10)
    pub max_retry: u32,
    /// Probe worker pool size; defaults to available parallelism
    pub workers: Option<usize>,
}

impl Default for HealthCheckSection {
    fn default() -> Self {
        Self {
            enabled: true,
            default_interval_secs: 30,
            default_timeout_secs: 5,
            max_retry: 3,
            workers: None,
        }
    }
}

/// Storage and lease configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    /// Only `memory` is implemented
    #[serde(rename = "type")]
    pub storage_type: String,
    /// Expiry-scanner cadence in seconds
    pub eviction_interval_secs: u64,
    /// Heartbeat-timeout default in seconds
    pub default_lease_secs: u64,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            storage_type: "memory".to_string(),
            eviction_interval_secs: 60,
            default_lease_secs: 90,
        }
    }
}

/// API-key authentication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecuritySection {
    /// Turns on the auth filter
    pub enabled: bool,
    /// Shared secret (min length 16 when enabled)
    pub api_key: String,
    /// Header carrying the key
    pub header_name: String,
    /// Query parameter carrying the key
    pub query_param_name: String,
    /// Path prefixes that bypass auth
    pub public_paths: Vec<String>,
}

impl Default for SecuritySection {
    fn default() -> Self {
        Self {
            enabled: false,
            api_key: String::new(),
            header_name: "X-Registry-API-Key".to_string(),
            query_param_name: "api_key".to_string(),
            public_paths: vec![
                "/actuator/health".to_string(),
                "/actuator/info".to_string(),
                "/actuator/prometheus".to_string(),
                "/management/info".to_string(),
            ],
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            cluster: ClusterSection::default(),
            health_check: HealthCheckSection::default(),
            storage: StorageSection::default(),
            security: SecuritySection::default(),
        }
    }
}

impl RegistryConfig {
    /// Load with full layering: optional base file, overlay directories from
    /// `HSC_REGISTRY_CONFIG_DIR` / `HSC_REGISTRY_SECRETS_DIR`, then
    /// environment variables
    pub fn load(file: Option<&str>) -> Result<Self> {
        let config_dir = std::env::var(ENV_CONFIG_DIR).ok();
        let secrets_dir = std::env::var(ENV_SECRETS_DIR).ok();
        Self::load_layered(
            file,
            config_dir.as_deref().map(Path::new),
            secrets_dir.as_deref().map(Path::new),
        )
    }

    /// Layering, weakest first: defaults, base file, non-secret overlay dir,
    /// secret overlay dir, environment
    pub fn load_layered(
        file: Option<&str>,
        config_dir: Option<&Path>,
        secrets_dir: Option<&Path>,
    ) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = file {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        for dir in [config_dir, secrets_dir].into_iter().flatten() {
            for (key, value) in read_overlay_dir(dir)? {
                builder = apply_override(builder, &key, value)?;
            }
        }

        for (env_name, key) in ENV_KEYS {
            if let Ok(value) = std::env::var(env_name) {
                builder = apply_override(builder, key, value)?;
            }
        }

        let config: Self = builder
            .build()
            .context("failed to assemble configuration")?
            .try_deserialize()
            .context("failed to deserialize configuration")?;
        Ok(config)
    }

    /// Enforce the documented bounds; called once at startup
    pub fn validate(&self) -> Result<()> {
        if self.server.port < 1024 {
            bail!(
                "server.port must be within 1024..=65535, got {}",
                self.server.port
            );
        }
        if self.health_check.max_retry > 10 {
            bail!(
                "health_check.max_retry must be within 0..=10, got {}",
                self.health_check.max_retry
            );
        }
        if self.storage.storage_type != "memory" {
            bail!(
                "storage.type `{}` is not implemented; only `memory` is supported",
                self.storage.storage_type
            );
        }
        if self.security.enabled && self.security.api_key.len() < 16 {
            bail!("security.api_key must be at least 16 characters when security is enabled");
        }
        if self.cluster.enabled {
            for peer in self.cluster.peers() {
                parse_peer(&peer)
                    .map_err(|e| anyhow::anyhow!("cluster.nodes entry rejected: {e}"))?;
            }
        }
        Ok(())
    }

    /// Bind address for the HTTP listener
    #[must_use]
    pub fn server_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Identity this node advertises to the cluster
    #[must_use]
    pub fn node_id(&self) -> String {
        if let Some(node_id) = &self.cluster.node_id {
            return node_id.clone();
        }
        let host = if self.server.host == "0.0.0.0" {
            "localhost"
        } else {
            self.server.host.as_str()
        };
        format!("{host}:{}", self.server.port)
    }

    /// Assemble the core wiring parameters
    #[must_use]
    pub fn core_config(&self) -> CoreConfig {
        let node_id = self.node_id();
        let cluster = self.cluster.enabled.then(|| ClusterConfig {
            cluster_id: "registry-cluster".to_string(),
            node_id: node_id.clone(),
            host: if self.server.host == "0.0.0.0" {
                "localhost".to_string()
            } else {
                self.server.host.clone()
            },
            port: self.server.port,
            peers: self.cluster.peers(),
            sync_interval_secs: self.cluster.sync_interval_secs,
            request_timeout_secs: self.cluster.request_timeout_secs,
        });
        CoreConfig {
            node_id,
            default_lease_secs: self.storage.default_lease_secs,
            eviction_interval_secs: self.storage.eviction_interval_secs,
            event_buffer: registry_core::events::DEFAULT_EVENT_BUFFER,
            probe: ProbeEngineConfig {
                enabled: self.health_check.enabled,
                default_interval_secs: self.health_check.default_interval_secs,
                default_timeout_secs: self.health_check.default_timeout_secs,
                max_retry: self.health_check.max_retry.max(1),
                workers: self.health_check.workers.unwrap_or_else(|| {
                    std::thread::available_parallelism().map_or(4, std::num::NonZero::get)
                }),
                reconcile_interval_secs: 60,
            },
            cluster,
        }
    }
}

fn apply_override(
    builder: config::ConfigBuilder<config::builder::DefaultState>,
    key: &str,
    value: String,
) -> Result<config::ConfigBuilder<config::builder::DefaultState>> {
    let builder = if LIST_KEYS.contains(&key) {
        let items: Vec<String> = value
            .split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(ToString::to_string)
            .collect();
        builder.set_override(key, items)
    } else {
        builder.set_override(key, value)
    };
    builder.with_context(|| format!("invalid override for `{key}`"))
}

/// Read one overlay directory: each plain file is one key, its trimmed
/// content the value. Hidden entries (orchestrator bookkeeping symlinks)
/// are skipped.
fn read_overlay_dir(dir: &Path) -> Result<Vec<(String, String)>> {
    let mut overrides = Vec::new();
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("cannot read overlay directory {}", dir.display()))?;
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name.starts_with('.') {
            continue;
        }
        let value = std::fs::read_to_string(&path)
            .with_context(|| format!("cannot read overlay file {}", path.display()))?;
        overrides.push((name.to_string(), value.trim().to_string()));
    }
    overrides.sort();
    Ok(overrides)
}
