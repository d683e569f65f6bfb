//! Probe scheduling and verdict handling

use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::prober::{ProbeSpec, Prober};
use crate::metrics::{keys, RegistryMetrics};
use crate::model::{HealthEvent, InstanceStatus, ServiceInstance};
use crate::store::RegistryStore;

/// Installed at construction; invoked on every verdict that differs from the
/// instance's current status. Breaks the status-manager/probe-engine cycle.
pub type StatusCallback = Arc<dyn Fn(&str, &str, InstanceStatus, &str) + Send + Sync>;

/// Engine-level probe settings
#[derive(Debug, Clone)]
pub struct ProbeEngineConfig {
    /// Master switch; when off nothing is ever scheduled
    pub enabled: bool,
    /// Cadence default for instances that omit one
    pub default_interval_secs: u64,
    /// Per-attempt deadline default for instances that omit one
    pub default_timeout_secs: u64,
    /// Attempt-count default, also the upper bound per instance
    pub max_retry: u32,
    /// Concurrent probe bound
    pub workers: usize,
    /// Drift-repair cadence
    pub reconcile_interval_secs: u64,
}

impl Default for ProbeEngineConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_interval_secs: crate::model::DEFAULT_PROBE_INTERVAL_SECS,
            default_timeout_secs: crate::model::DEFAULT_PROBE_TIMEOUT_SECS,
            max_retry: crate::model::DEFAULT_PROBE_RETRY_COUNT,
            workers: std::thread::available_parallelism().map_or(4, std::num::NonZero::get),
            reconcile_interval_secs: 60,
        }
    }
}

struct ProbeSchedule {
    spec: ProbeSpec,
    endpoint: (String, u16, bool),
    handle: JoinHandle<()>,
}

/// Schedules and runs per-instance probes on a bounded worker pool
pub struct HealthProbeEngine {
    config: ProbeEngineConfig,
    store: Arc<RegistryStore>,
    prober: Arc<Prober>,
    schedules: DashMap<String, ProbeSchedule>,
    permits: Arc<Semaphore>,
    on_status_change: StatusCallback,
    health_tx: broadcast::Sender<HealthEvent>,
    metrics: Arc<RegistryMetrics>,
}

impl HealthProbeEngine {
    #[must_use]
    pub fn new(
        config: ProbeEngineConfig,
        store: Arc<RegistryStore>,
        on_status_change: StatusCallback,
        metrics: Arc<RegistryMetrics>,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.workers.max(1)));
        let (health_tx, _) = broadcast::channel(256);
        Self {
            config,
            store,
            prober: Arc::new(Prober::new()),
            schedules: DashMap::new(),
            permits,
            on_status_change,
            health_tx,
            metrics,
        }
    }

    fn key(service_id: &str, instance_id: &str) -> String {
        format!("{service_id}/{instance_id}")
    }

    /// Resolve instance configuration against engine defaults
    fn spec_for(&self, instance: &ServiceInstance) -> Option<ProbeSpec> {
        let hc = instance.health_check.as_ref()?;
        if !self.config.enabled || !hc.enabled {
            return None;
        }
        Some(ProbeSpec {
            check_type: hc.check_type,
            path: hc.path.clone(),
            interval: hc.interval_or(self.config.default_interval_secs),
            timeout: hc.timeout_or(self.config.default_timeout_secs),
            attempts: hc.retries_or(self.config.max_retry).min(self.config.max_retry.max(1)),
        })
    }

    /// Install (or replace) the probe schedule for an instance. Idempotent:
    /// an existing schedule for the same identity is cancelled first.
    pub fn schedule(&self, instance: &ServiceInstance) {
        let key = Self::key(&instance.service_id, &instance.instance_id);
        let Some(spec) = self.spec_for(instance) else {
            self.cancel(&instance.service_id, &instance.instance_id);
            return;
        };

        let endpoint = (instance.host.clone(), instance.port, instance.secure);
        let task = self.spawn_probe_task(instance.clone(), spec.clone());
        if let Some(previous) = self.schedules.insert(
            key.clone(),
            ProbeSchedule {
                spec,
                endpoint,
                handle: task,
            },
        ) {
            previous.handle.abort();
            debug!(key = %key, "replaced probe schedule");
        } else {
            debug!(key = %key, "installed probe schedule");
        }
    }

    /// Stop and remove the schedule; unknown ids are a no-op
    pub fn cancel(&self, service_id: &str, instance_id: &str) {
        if let Some((key, schedule)) = self
            .schedules
            .remove(&Self::key(service_id, instance_id))
        {
            schedule.handle.abort();
            debug!(key = %key, "cancelled probe schedule");
        }
    }

    fn spawn_probe_task(&self, instance: ServiceInstance, spec: ProbeSpec) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let prober = Arc::clone(&self.prober);
        let permits = Arc::clone(&self.permits);
        let on_status_change = Arc::clone(&self.on_status_change);
        let health_tx = self.health_tx.clone();
        let metrics = Arc::clone(&self.metrics);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(spec.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;

                // Bounded pool: a slow probe elsewhere delays this one, it
                // never blocks the scheduler itself.
                let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                    return;
                };
                let verdict = prober.probe(&instance, &spec).await;
                drop(permit);

                metrics.incr(keys::PROBES_RUN);
                if !verdict.healthy {
                    metrics.incr(keys::PROBES_FAILED);
                }

                let _ = health_tx.send(HealthEvent {
                    service_id: instance.service_id.clone(),
                    instance_id: instance.instance_id.clone(),
                    healthy: verdict.healthy,
                    message: verdict.message.clone(),
                    timestamp: Utc::now(),
                });

                let Some(current) =
                    store.get_instance(&instance.service_id, &instance.instance_id)
                else {
                    // Instance is gone; the reconcile pass will drop the entry
                    return;
                };
                let desired = if verdict.healthy {
                    InstanceStatus::Up
                } else {
                    InstanceStatus::Down
                };
                if current.status != desired {
                    let reason = if verdict.healthy {
                        format!("Health check passed: {}", verdict.message)
                    } else {
                        format!("Health check failed: {}", verdict.message)
                    };
                    on_status_change(
                        &instance.service_id,
                        &instance.instance_id,
                        desired,
                        &reason,
                    );
                }
            }
        })
    }

    /// Repair drift between the schedule table and the store: schedule
    /// instances that gained an enabled check, drop schedules whose instance
    /// disappeared, changed endpoint, or changed probe configuration.
    pub fn reconcile(&self) {
        let mut desired: rustc_hash::FxHashMap<String, ServiceInstance> =
            rustc_hash::FxHashMap::default();
        for (_, instances) in self.store.get_all_instances() {
            for instance in instances {
                if self.spec_for(&instance).is_some() {
                    desired.insert(
                        Self::key(&instance.service_id, &instance.instance_id),
                        instance,
                    );
                }
            }
        }

        let stale: Vec<String> = self
            .schedules
            .iter()
            .filter_map(|entry| {
                match desired.get(entry.key()) {
                    None => Some(entry.key().clone()),
                    Some(instance) => {
                        let endpoint =
                            (instance.host.clone(), instance.port, instance.secure);
                        let spec_changed = self
                            .spec_for(instance)
                            .is_none_or(|spec| spec != entry.spec);
                        (spec_changed || endpoint != entry.endpoint)
                            .then(|| entry.key().clone())
                    }
                }
            })
            .collect();
        for key in &stale {
            if let Some((_, schedule)) = self.schedules.remove(key) {
                schedule.handle.abort();
                warn!(key = %key, "dropped stale probe schedule");
            }
        }

        let mut installed = 0usize;
        for (key, instance) in &desired {
            if !self.schedules.contains_key(key) {
                self.schedule(instance);
                installed += 1;
            }
        }
        if installed > 0 || !stale.is_empty() {
            info!(installed, dropped = stale.len(), "probe schedules reconciled");
        }
    }

    /// Background reconcile loop
    pub async fn run_reconcile_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let interval = std::time::Duration::from_secs(self.config.reconcile_interval_secs);
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(
            interval_secs = interval.as_secs(),
            "probe reconcile loop started"
        );
        loop {
            tokio::select! {
                _ = ticker.tick() => self.reconcile(),
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("probe reconcile loop stopped");
    }

    /// Subscribe to the probe-verdict stream
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<HealthEvent> {
        self.health_tx.subscribe()
    }

    #[must_use]
    pub fn scheduled_count(&self) -> usize {
        self.schedules.len()
    }

    #[must_use]
    pub fn is_scheduled(&self, service_id: &str, instance_id: &str) -> bool {
        self.schedules
            .contains_key(&Self::key(service_id, instance_id))
    }

    /// Abort every probe task
    pub fn shutdown(&self) {
        let keys: Vec<String> = self.schedules.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((_, schedule)) = self.schedules.remove(&key) {
                schedule.handle.abort();
            }
        }
        info!("health probe engine shut down");
    }
}
