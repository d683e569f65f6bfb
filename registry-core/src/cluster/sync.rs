//! Event replication: outbound dispatch and inbound merge
//!
//! Replication is best-effort. A failed POST is logged and counted, never
//! retried; heartbeat renewals repair whatever diverged. Loop suppression is
//! carried by `originNodeId`: only locally-originated events go out, and an
//! inbound event keeps its origin so it is republished locally but never
//! forwarded again.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use super::NodeCache;
use crate::events::EventBus;
use crate::metrics::{keys, RegistryMetrics};
use crate::model::ServiceEvent;
use crate::store::RegistryStore;

/// Peer endpoint that accepts replicated events
pub const CLUSTER_EVENTS_PATH: &str = "/api/v1/cluster/events";

/// Origin stamped onto inbound events that arrive without one; anything that
/// is not the local id is applied but never forwarded
const UNKNOWN_ORIGIN: &str = "unknown";

/// Outbound replicator and inbound merge point
pub struct ClusterSync {
    node_id: String,
    cache: Arc<NodeCache>,
    store: Arc<RegistryStore>,
    bus: Arc<EventBus>,
    http: reqwest::Client,
    request_timeout: Duration,
    replicated_tx: broadcast::Sender<ServiceEvent>,
    dispatch_failures: AtomicU64,
    metrics: Arc<RegistryMetrics>,
}

impl ClusterSync {
    #[must_use]
    pub fn new(
        node_id: &str,
        request_timeout_secs: u64,
        cache: Arc<NodeCache>,
        store: Arc<RegistryStore>,
        bus: Arc<EventBus>,
        metrics: Arc<RegistryMetrics>,
    ) -> Self {
        let (replicated_tx, _) = broadcast::channel(256);
        Self {
            node_id: node_id.to_string(),
            cache,
            store,
            bus,
            http: reqwest::Client::new(),
            request_timeout: Duration::from_secs(request_timeout_secs),
            replicated_tx,
            dispatch_failures: AtomicU64::new(0),
            metrics,
        }
    }

    /// Outbound dispatcher: consumes the all-services topic and forwards
    /// locally-originated events to every peer currently marked `UP`.
    pub async fn run_outbound_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut stream = self.bus.watch_all();
        info!(node_id = %self.node_id, "cluster sync dispatcher started");
        loop {
            tokio::select! {
                event = stream.next() => {
                    let Some(event) = event else { break };
                    if event.origin_node_id == self.node_id {
                        self.dispatch(&event).await;
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!(node_id = %self.node_id, "cluster sync dispatcher stopped");
    }

    /// One POST per UP peer; failures are logged and counted, dispatch
    /// continues with the next peer
    pub async fn dispatch(&self, event: &ServiceEvent) {
        for peer in self.cache.list() {
            if peer.node_id == self.node_id || !peer.status.is_up() {
                continue;
            }
            let url = format!("{}{CLUSTER_EVENTS_PATH}", peer.base_url());
            let result = self
                .http
                .post(&url)
                .timeout(self.request_timeout)
                .json(event)
                .send()
                .await;
            match result {
                Ok(response) if response.status().is_success() => {
                    self.metrics.incr(keys::REPLICATION_DISPATCHES);
                    debug!(
                        event_id = %event.event_id,
                        peer = %peer.node_id,
                        "event replicated to peer"
                    );
                }
                Ok(response) => {
                    self.record_failure();
                    warn!(
                        event_id = %event.event_id,
                        peer = %peer.node_id,
                        status = %response.status(),
                        "peer rejected replicated event"
                    );
                }
                Err(error) => {
                    self.record_failure();
                    warn!(
                        event_id = %event.event_id,
                        peer = %peer.node_id,
                        error = %error,
                        "failed to replicate event to peer"
                    );
                }
            }
        }
    }

    fn record_failure(&self) {
        self.dispatch_failures.fetch_add(1, Ordering::Relaxed);
        self.metrics.incr(keys::REPLICATION_FAILURES);
    }

    /// Inbound merge point for peer-pushed events.
    ///
    /// A self-originated echo is dropped outright; anything else is applied
    /// to the store and republished locally with its origin intact, so the
    /// outbound dispatcher skips it.
    pub fn handle_cluster_event(&self, mut event: ServiceEvent) {
        if event.origin_node_id.is_empty() {
            event.origin_node_id = UNKNOWN_ORIGIN.to_string();
        }
        if event.origin_node_id == self.node_id {
            debug!(event_id = %event.event_id, "dropping replicated echo of local event");
            return;
        }
        debug!(
            event_id = %event.event_id,
            event_type = %event.event_type,
            origin = %event.origin_node_id,
            "applying replicated event"
        );
        self.store.merge_replicated(&event);
        let _ = self.replicated_tx.send(event);
    }

    /// Feed of applied replicated events, for the cluster SSE stream
    #[must_use]
    pub fn subscribe_replicated(&self) -> broadcast::Receiver<ServiceEvent> {
        self.replicated_tx.subscribe()
    }

    /// Outbound failures since start (no retry queue exists to drain)
    #[must_use]
    pub fn dispatch_failure_count(&self) -> u64 {
        self.dispatch_failures.load(Ordering::Relaxed)
    }
}
