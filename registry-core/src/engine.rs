//! The engine value owning every core component
//!
//! One `RegistryEngine` is constructed at startup and wired explicitly:
//! bus, store, lifecycle, probe engine, discovery view, and (when enabled)
//! cluster manager and sync. The edge calls through it and nothing else.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::cluster::manager::ClusterManager;
use crate::cluster::sync::ClusterSync;
use crate::cluster::{ClusterConfig, NodeCache};
use crate::discovery::DiscoveryService;
use crate::error::{RegistryError, Result};
use crate::events::{EventBus, DEFAULT_EVENT_BUFFER};
use crate::health::{HealthProbeEngine, ProbeEngineConfig, StatusCallback};
use crate::lifecycle::{ExpiryPolicy, LifecycleManager, StatusHistory};
use crate::metrics::RegistryMetrics;
use crate::model::{
    HealthEvent, InstanceStatus, ServiceEvent, ServiceInstance, StatusRecord, DEFAULT_LEASE_SECS,
};
use crate::store::RegistryStore;

/// Grace period for the expiry scanner at shutdown
const SCANNER_GRACE: Duration = Duration::from_secs(10);
/// Grace period for sync and the remaining loops at shutdown
const SYNC_GRACE: Duration = Duration::from_secs(5);

/// Core wiring parameters, assembled by the edge from its configuration
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Origin id stamped onto locally-committed events
    pub node_id: String,
    /// Heartbeat-timeout threshold for instances without a lease override
    pub default_lease_secs: u64,
    /// Expiry scanner cadence
    pub eviction_interval_secs: u64,
    /// Per-watcher event buffer
    pub event_buffer: usize,
    pub probe: ProbeEngineConfig,
    /// Present iff clustering is enabled
    pub cluster: Option<ClusterConfig>,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            node_id: "localhost:8761".to_string(),
            default_lease_secs: DEFAULT_LEASE_SECS,
            eviction_interval_secs: 60,
            event_buffer: DEFAULT_EVENT_BUFFER,
            probe: ProbeEngineConfig::default(),
            cluster: None,
        }
    }
}

struct ClusterHandles {
    manager: Arc<ClusterManager>,
    sync: Arc<ClusterSync>,
}

/// Process-wide registry engine
pub struct RegistryEngine {
    metrics: Arc<RegistryMetrics>,
    bus: Arc<EventBus>,
    history: Arc<StatusHistory>,
    store: Arc<RegistryStore>,
    lifecycle: Arc<LifecycleManager>,
    health: Arc<HealthProbeEngine>,
    discovery: DiscoveryService,
    cluster: Option<ClusterHandles>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<(&'static str, Duration, JoinHandle<()>)>>,
}

impl RegistryEngine {
    pub fn new(mut config: CoreConfig) -> Result<Self> {
        let metrics = Arc::new(RegistryMetrics::new());
        let bus = Arc::new(EventBus::new(config.event_buffer, Arc::clone(&metrics)));
        let history = Arc::new(StatusHistory::new());

        // When clustering is on, the cluster node id is the event origin id
        if let Some(cluster) = &mut config.cluster {
            cluster.node_id = config.node_id.clone();
        }

        let store = Arc::new(RegistryStore::new(
            &config.node_id,
            ExpiryPolicy::new(config.default_lease_secs),
            Arc::clone(&bus),
            Arc::clone(&history),
            Arc::clone(&metrics),
        ));

        let lifecycle = Arc::new(LifecycleManager::new(
            Arc::clone(&store),
            Duration::from_secs(config.eviction_interval_secs),
        ));

        // Probe verdicts feed back into the store through this callback;
        // constructing it here avoids a cyclic handle between the status
        // manager and the probe engine.
        let callback_store = Arc::clone(&store);
        let on_status_change: StatusCallback =
            Arc::new(move |service_id, instance_id, status, reason| {
                if let Err(e) =
                    callback_store.update_status(service_id, instance_id, status, reason)
                {
                    error!(
                        service_id = %service_id,
                        instance_id = %instance_id,
                        error = %e,
                        "probe-driven status update failed"
                    );
                }
            });
        let health = Arc::new(HealthProbeEngine::new(
            config.probe.clone(),
            Arc::clone(&store),
            on_status_change,
            Arc::clone(&metrics),
        ));

        let discovery = DiscoveryService::new(Arc::clone(&store), Arc::clone(&bus));

        let cluster = match config.cluster {
            Some(cluster_config) => {
                let cache = Arc::new(NodeCache::new());
                let request_timeout = cluster_config.request_timeout_secs;
                let manager = Arc::new(ClusterManager::new(
                    cluster_config,
                    Arc::clone(&cache),
                )?);
                let sync = Arc::new(ClusterSync::new(
                    &config.node_id,
                    request_timeout,
                    cache,
                    Arc::clone(&store),
                    Arc::clone(&bus),
                    Arc::clone(&metrics),
                ));
                Some(ClusterHandles { manager, sync })
            }
            None => None,
        };

        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            metrics,
            bus,
            history,
            store,
            lifecycle,
            health,
            discovery,
            cluster,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Launch the background loops: expiry scanner, probe reconcile, and
    /// (when clustered) peer liveness and outbound sync
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();

        let rx = self.shutdown_tx.subscribe();
        tasks.push((
            "expiry-scanner",
            SCANNER_GRACE,
            tokio::spawn(Arc::clone(&self.lifecycle).run_expiry_scanner(rx)),
        ));

        let rx = self.shutdown_tx.subscribe();
        tasks.push((
            "probe-reconcile",
            SYNC_GRACE,
            tokio::spawn(Arc::clone(&self.health).run_reconcile_loop(rx)),
        ));

        if let Some(cluster) = &self.cluster {
            let rx = self.shutdown_tx.subscribe();
            tasks.push((
                "cluster-liveness",
                SYNC_GRACE,
                tokio::spawn(Arc::clone(&cluster.manager).run_liveness_loop(rx)),
            ));
            let rx = self.shutdown_tx.subscribe();
            tasks.push((
                "cluster-sync",
                SYNC_GRACE,
                tokio::spawn(Arc::clone(&cluster.sync).run_outbound_loop(rx)),
            ));
        }

        info!(tasks = tasks.len(), "registry engine started");
    }

    /// Register (insert or replace) an instance and keep its probe schedule
    /// in step
    pub fn register(&self, instance: ServiceInstance) -> Result<ServiceInstance> {
        let registered = self.store.register(instance)?;
        self.health.schedule(&registered);
        Ok(registered)
    }

    /// Remove an instance and its probe schedule; idempotent
    pub fn deregister(&self, service_id: &str, instance_id: &str) -> Result<Option<ServiceInstance>> {
        let removed = self.store.deregister(service_id, instance_id)?;
        if removed.is_some() {
            self.health.cancel(service_id, instance_id);
        }
        Ok(removed)
    }

    pub fn renew(&self, service_id: &str, instance_id: &str) -> Result<Option<ServiceInstance>> {
        self.store.renew(service_id, instance_id)
    }

    pub fn update_status(
        &self,
        service_id: &str,
        instance_id: &str,
        status: InstanceStatus,
        reason: &str,
    ) -> Result<Option<ServiceInstance>> {
        self.store.update_status(service_id, instance_id, status, reason)
    }

    /// Inbound replication entry point; rejects when clustering is off
    pub fn handle_cluster_event(&self, event: ServiceEvent) -> Result<()> {
        let Some(cluster) = &self.cluster else {
            return Err(RegistryError::Cluster(
                "clustering is not enabled on this node".to_string(),
            ));
        };
        cluster.sync.handle_cluster_event(event);
        Ok(())
    }

    #[must_use]
    pub fn discovery(&self) -> &DiscoveryService {
        &self.discovery
    }

    #[must_use]
    pub fn store(&self) -> &Arc<RegistryStore> {
        &self.store
    }

    #[must_use]
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    #[must_use]
    pub fn metrics(&self) -> &Arc<RegistryMetrics> {
        &self.metrics
    }

    #[must_use]
    pub fn health_engine(&self) -> &Arc<HealthProbeEngine> {
        &self.health
    }

    /// Probe-verdict stream, parallel to the service-event bus
    #[must_use]
    pub fn watch_health(&self) -> broadcast::Receiver<HealthEvent> {
        self.health.subscribe()
    }

    #[must_use]
    pub fn status_history(&self, service_id: &str, instance_id: &str) -> Vec<StatusRecord> {
        self.history.get(service_id, instance_id)
    }

    #[must_use]
    pub fn cluster_manager(&self) -> Option<&Arc<ClusterManager>> {
        self.cluster.as_ref().map(|c| &c.manager)
    }

    #[must_use]
    pub fn cluster_sync(&self) -> Option<&Arc<ClusterSync>> {
        self.cluster.as_ref().map(|c| &c.sync)
    }

    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.store.is_healthy()
    }

    /// Stop every background loop within its grace period, then close the
    /// store and the bus
    pub async fn shutdown(&self) {
        info!("registry engine shutting down");
        let _ = self.shutdown_tx.send(true);

        let tasks: Vec<(&'static str, Duration, JoinHandle<()>)> =
            self.tasks.lock().drain(..).collect();
        for (name, grace, handle) in tasks {
            let abort = handle.abort_handle();
            match tokio::time::timeout(grace, handle).await {
                Ok(_) => info!(task = name, "background task stopped"),
                Err(_) => {
                    abort.abort();
                    warn!(task = name, grace_secs = grace.as_secs(), "background task exceeded grace period, aborting");
                }
            }
        }

        self.health.shutdown();
        self.store.shutdown();
        self.bus.shutdown();
        info!("registry engine shut down");
    }
}
