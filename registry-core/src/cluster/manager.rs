//! Peer membership, liveness monitoring, and leader election

use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::{parse_peer, ClusterConfig, NodeCache};
use crate::error::{RegistryError, Result};
use crate::model::{ClusterNode, ClusterStatus, NodeStatus};

/// Path probed on peers; every registry node serves it unauthenticated
const PEER_HEALTH_PATH: &str = "/actuator/health";

/// Membership table owner and election driver.
///
/// Election is a pure function of the healthy set: the lexicographically
/// smallest healthy node id wins. There is no voting round to coordinate.
pub struct ClusterManager {
    config: ClusterConfig,
    cache: Arc<NodeCache>,
    http: reqwest::Client,
    leader: RwLock<Option<String>>,
}

impl ClusterManager {
    /// Seed the membership table from the configured peer list plus the
    /// local node. The local node is `UP` from the start (and stays so while
    /// the process runs); peers begin `STARTING` until first contact.
    pub fn new(config: ClusterConfig, cache: Arc<NodeCache>) -> Result<Self> {
        cache.upsert(ClusterNode::new(
            &config.node_id,
            &config.host,
            config.port,
            NodeStatus::Up,
        ));
        for peer in &config.peers {
            let (host, port) = parse_peer(peer)?;
            let peer_id = format!("{host}:{port}");
            if peer_id == config.node_id {
                continue;
            }
            cache.upsert(ClusterNode::new(&peer_id, &host, port, NodeStatus::Starting));
        }

        let manager = Self {
            config,
            cache,
            http: reqwest::Client::new(),
            leader: RwLock::new(None),
        };
        manager.elect();
        Ok(manager)
    }

    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    #[must_use]
    pub fn cache(&self) -> Arc<NodeCache> {
        Arc::clone(&self.cache)
    }

    /// Snapshot of the local node entry, pinned to `UP`
    #[must_use]
    pub fn current_node(&self) -> ClusterNode {
        self.cache.get(&self.config.node_id).unwrap_or_else(|| {
            ClusterNode::new(
                &self.config.node_id,
                &self.config.host,
                self.config.port,
                NodeStatus::Up,
            )
        })
    }

    /// Add a member; validated, and re-runs election
    pub fn add_node(&self, node: ClusterNode) -> Result<()> {
        node.validate()?;
        info!(node_id = %node.node_id, address = %node.address(), "cluster node added");
        self.cache.upsert(node);
        self.elect();
        Ok(())
    }

    /// Remove a member; the local node cannot be removed
    pub fn remove_node(&self, node_id: &str) -> Result<Option<ClusterNode>> {
        if node_id.is_empty() {
            return Err(RegistryError::validation("nodeId", "nodeId must not be empty"));
        }
        if node_id == self.config.node_id {
            return Err(RegistryError::Cluster(
                "cannot remove the local node from its own cluster".to_string(),
            ));
        }
        let removed = self.cache.remove(node_id);
        if removed.is_some() {
            info!(node_id = %node_id, "cluster node removed");
            self.elect();
        }
        Ok(removed)
    }

    /// Recompute the leader from the current healthy set
    pub fn elect(&self) {
        let new_leader = self
            .cache
            .healthy()
            .into_iter()
            .map(|node| node.node_id)
            .min();
        let mut leader = self.leader.write();
        if *leader != new_leader {
            info!(
                previous = leader.as_deref().unwrap_or("none"),
                elected = new_leader.as_deref().unwrap_or("none"),
                "leader changed"
            );
            *leader = new_leader;
        }
    }

    #[must_use]
    pub fn leader(&self) -> Option<String> {
        self.leader.read().clone()
    }

    #[must_use]
    pub fn is_leader(&self) -> bool {
        self.leader.read().as_deref() == Some(self.config.node_id.as_str())
    }

    /// True when fewer than a majority of known nodes are `UP`
    #[must_use]
    pub fn needs_failover(&self) -> bool {
        let total = self.cache.len();
        let healthy = self.cache.healthy().len();
        let majority = total / 2 + 1;
        healthy < majority
    }

    /// Mark a failed node `DOWN` and re-elect; state is not sharded, so
    /// there is nothing to redistribute
    pub fn perform_failover(&self, failed_node_id: &str) {
        warn!(node_id = %failed_node_id, "performing failover");
        self.cache.set_status(failed_node_id, NodeStatus::Down);
        self.elect();
    }

    /// One liveness pass over every peer, then re-election
    pub async fn check_peers(&self) {
        // Invariant: the local node stays UP in its own table
        self.cache.set_status(&self.config.node_id, NodeStatus::Up);

        let timeout = Duration::from_secs(self.config.request_timeout_secs);
        for node in self.cache.list() {
            if node.node_id == self.config.node_id {
                continue;
            }
            let url = format!("{}{PEER_HEALTH_PATH}", node.base_url());
            let alive = match self.http.get(&url).timeout(timeout).send().await {
                Ok(response) => response.status().is_success(),
                Err(error) => {
                    debug!(node_id = %node.node_id, error = %error, "peer liveness check failed");
                    false
                }
            };
            let status = if alive { NodeStatus::Up } else { NodeStatus::Down };
            if node.status != status {
                info!(node_id = %node.node_id, from = %node.status, to = %status, "peer liveness changed");
            }
            self.cache.set_status(&node.node_id, status);
        }
        self.elect();
    }

    /// Periodic liveness monitor; cadence is the sync interval
    pub async fn run_liveness_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let interval = Duration::from_secs(self.config.sync_interval_secs);
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval_secs = interval.as_secs(), "cluster liveness monitor started");
        loop {
            tokio::select! {
                _ = ticker.tick() => self.check_peers().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("cluster liveness monitor stopped");
    }

    /// Point-in-time cluster view for the status endpoints
    #[must_use]
    pub fn cluster_status(&self) -> ClusterStatus {
        let nodes = self.cache.list();
        let healthy_nodes = nodes.iter().filter(|n| n.status.is_up()).count();
        ClusterStatus {
            cluster_id: self.config.cluster_id.clone(),
            total_nodes: nodes.len(),
            healthy_nodes,
            current_node: self.current_node(),
            leader_node_id: self.leader(),
            nodes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn manager(node_id: &str, peers: &[&str]) -> ClusterManager {
        let config = ClusterConfig {
            node_id: node_id.to_string(),
            host: "localhost".to_string(),
            port: 8761,
            peers: peers.iter().map(ToString::to_string).collect(),
            ..Default::default()
        };
        ClusterManager::new(config, Arc::new(NodeCache::new())).unwrap()
    }

    #[test]
    fn seeds_self_and_peers() {
        let manager = manager("a:8761", &["b:8761", "c:8761"]);
        let status = manager.cluster_status();
        assert_eq!(status.total_nodes, 3);
        assert_eq!(status.healthy_nodes, 1);
        assert_eq!(status.current_node.status, NodeStatus::Up);
    }

    #[test]
    fn smallest_healthy_id_wins_election() {
        let manager = manager("b:8761", &["a:8761", "c:8761"]);
        // Only the local node is UP at seed time
        assert_eq!(manager.leader(), Some("b:8761".to_string()));
        assert!(manager.is_leader());

        manager.cache().set_status("a:8761", NodeStatus::Up);
        manager.elect();
        assert_eq!(manager.leader(), Some("a:8761".to_string()));
        assert!(!manager.is_leader());
    }

    #[test]
    fn failover_marks_down_and_reelects() {
        let manager = manager("b:8761", &["a:8761"]);
        manager.cache().set_status("a:8761", NodeStatus::Up);
        manager.elect();
        assert_eq!(manager.leader(), Some("a:8761".to_string()));

        manager.perform_failover("a:8761");
        assert_eq!(manager.leader(), Some("b:8761".to_string()));
        assert_eq!(
            manager.cache().get("a:8761").unwrap().status,
            NodeStatus::Down
        );
    }

    #[test]
    fn needs_failover_below_majority() {
        let manager = manager("a:8761", &["b:8761", "c:8761"]);
        // 1 of 3 healthy: below majority
        assert!(manager.needs_failover());
        manager.cache().set_status("b:8761", NodeStatus::Up);
        // 2 of 3 healthy: majority reached
        assert!(!manager.needs_failover());
    }

    #[test]
    fn add_and_remove_nodes_are_validated() {
        let manager = manager("a:8761", &[]);
        assert!(manager
            .add_node(ClusterNode::new("", "h", 1, NodeStatus::Up))
            .is_err());
        assert!(manager
            .add_node(ClusterNode::new("d:9000", "peer-d", 9000, NodeStatus::Up))
            .is_ok());
        assert!(manager.remove_node("a:8761").is_err());
        assert!(manager.remove_node("d:9000").unwrap().is_some());
        assert!(manager.remove_node("d:9000").unwrap().is_none());
    }

    #[test]
    fn no_healthy_nodes_means_no_leader() {
        let manager = manager("a:8761", &["b:8761"]);
        manager.cache().set_status("a:8761", NodeStatus::Down);
        manager.elect();
        assert_eq!(manager.leader(), None);
    }
}
