//! Cluster membership, leader election, and best-effort event replication

pub mod manager;
pub mod sync;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use chrono::Utc;

use crate::error::RegistryError;
use crate::model::{ClusterNode, NodeStatus};

/// Cluster wiring for one node
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub cluster_id: String,
    /// This node's id; peers elect the lexicographically smallest healthy id
    pub node_id: String,
    pub host: String,
    pub port: u16,
    /// Peer addresses as `host:port`
    pub peers: Vec<String>,
    /// Liveness and reconcile cadence
    pub sync_interval_secs: u64,
    /// Deadline for peer liveness checks and replication POSTs
    pub request_timeout_secs: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            cluster_id: "registry-cluster".to_string(),
            node_id: "localhost:8761".to_string(),
            host: "localhost".to_string(),
            port: 8761,
            peers: Vec::new(),
            sync_interval_secs: 30,
            request_timeout_secs: 5,
        }
    }
}

/// Parse a `host:port` peer entry
pub fn parse_peer(entry: &str) -> Result<(String, u16), RegistryError> {
    let (host, port) = entry.rsplit_once(':').ok_or_else(|| {
        RegistryError::validation("cluster.nodes", format!("peer `{entry}` is not host:port"))
    })?;
    let port: u16 = port.parse().map_err(|_| {
        RegistryError::validation("cluster.nodes", format!("peer `{entry}` has an invalid port"))
    })?;
    if host.is_empty() || port == 0 {
        return Err(RegistryError::validation(
            "cluster.nodes",
            format!("peer `{entry}` has an empty host or zero port"),
        ));
    }
    Ok((host.to_string(), port))
}

/// Shared membership table backing both the cluster manager and the sync
/// loop, so both observe the same node set. Writes serialize behind the lock.
#[derive(Debug, Default)]
pub struct NodeCache {
    nodes: RwLock<FxHashMap<String, ClusterNode>>,
}

impl NodeCache {
    #[must_use]
    pub fn new() -> Self {
        Self {
            nodes: RwLock::new(FxHashMap::default()),
        }
    }

    pub fn upsert(&self, node: ClusterNode) {
        self.nodes.write().insert(node.node_id.clone(), node);
    }

    /// Update liveness; advances `lastSeen` only on `UP`
    pub fn set_status(&self, node_id: &str, status: NodeStatus) -> bool {
        let mut nodes = self.nodes.write();
        let Some(node) = nodes.get_mut(node_id) else {
            return false;
        };
        node.status = status;
        if status == NodeStatus::Up {
            node.last_seen = Utc::now();
        }
        true
    }

    pub fn remove(&self, node_id: &str) -> Option<ClusterNode> {
        self.nodes.write().remove(node_id)
    }

    #[must_use]
    pub fn get(&self, node_id: &str) -> Option<ClusterNode> {
        self.nodes.read().get(node_id).cloned()
    }

    #[must_use]
    pub fn contains(&self, node_id: &str) -> bool {
        self.nodes.read().contains_key(node_id)
    }

    /// All nodes, ordered by node id for deterministic iteration
    #[must_use]
    pub fn list(&self) -> Vec<ClusterNode> {
        let mut nodes: Vec<ClusterNode> = self.nodes.read().values().cloned().collect();
        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        nodes
    }

    /// Nodes currently marked `UP`
    #[must_use]
    pub fn healthy(&self) -> Vec<ClusterNode> {
        self.list()
            .into_iter()
            .filter(|node| node.status.is_up())
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }
}
