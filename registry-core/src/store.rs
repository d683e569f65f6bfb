//! Canonical in-memory registry state
//!
//! The store is the only writer of instance state. Mutations serialize per
//! service key through the shard entry lock; reads return cloned snapshots so
//! callers can iterate without holding any lock. Every committed mutation is
//! published on the event bus before the service entry lock is released, which
//! is what gives watchers per-instance commit order.

use chrono::Utc;
use dashmap::DashMap;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{RegistryError, Result};
use crate::events::EventBus;
use crate::lifecycle::{
    check_transition, ExpiryAction, ExpiryPolicy, StatusHistory, REASON_HEARTBEAT_TIMEOUT,
    REASON_LEASE_EXPIRED, REASON_LONG_NO_HEARTBEAT,
};
use crate::metrics::{keys, RegistryMetrics};
use crate::model::{InstanceStatus, ServiceEvent, ServiceEventType, ServiceInstance};

type ServiceMap = FxHashMap<String, ServiceInstance>;

/// Canonical storage of service instances, indexed by service id
pub struct RegistryStore {
    services: DashMap<String, ServiceMap>,
    bus: Arc<EventBus>,
    history: Arc<StatusHistory>,
    policy: ExpiryPolicy,
    metrics: Arc<RegistryMetrics>,
    node_id: String,
    open: AtomicBool,
}

impl RegistryStore {
    #[must_use]
    pub fn new(
        node_id: &str,
        policy: ExpiryPolicy,
        bus: Arc<EventBus>,
        history: Arc<StatusHistory>,
        metrics: Arc<RegistryMetrics>,
    ) -> Self {
        Self {
            services: DashMap::new(),
            bus,
            history,
            policy,
            metrics,
            node_id: node_id.to_string(),
            open: AtomicBool::new(true),
        }
    }

    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    fn ensure_open(&self) -> Result<()> {
        if self.open.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(RegistryError::ShuttingDown)
        }
    }

    /// Insert or replace the entry for the instance's identity.
    ///
    /// `registrationTime` is set on first insert and preserved on replace;
    /// `lastHeartbeat` always advances to now.
    pub fn register(&self, mut instance: ServiceInstance) -> Result<ServiceInstance> {
        self.ensure_open()?;
        instance.validate()?;

        let now = Utc::now();
        instance.last_heartbeat = now;

        let mut entry = self.services.entry(instance.service_id.clone()).or_default();
        if let Some(existing) = entry.get(&instance.instance_id) {
            instance.registration_time = existing.registration_time;
            debug!(
                service_id = %instance.service_id,
                instance_id = %instance.instance_id,
                "replacing existing registration"
            );
        } else {
            instance.registration_time = now;
            info!(
                service_id = %instance.service_id,
                instance_id = %instance.instance_id,
                host = %instance.host,
                port = instance.port,
                "registered new instance"
            );
        }
        entry.insert(instance.instance_id.clone(), instance.clone());

        self.metrics.incr(keys::REGISTRATIONS);
        self.bus.publish(&ServiceEvent::new(
            ServiceEventType::Register,
            &instance,
            &self.node_id,
        ));
        Ok(instance)
    }

    /// Remove the entry; idempotent. Emits `DEREGISTER` only when something
    /// was actually removed.
    pub fn deregister(&self, service_id: &str, instance_id: &str) -> Result<Option<ServiceInstance>> {
        self.ensure_open()?;

        let removed = {
            let Some(mut entry) = self.services.get_mut(service_id) else {
                return Ok(None);
            };
            let Some(instance) = entry.remove(instance_id) else {
                return Ok(None);
            };
            // Publish before the entry lock drops so watchers see removal in
            // commit order relative to any concurrent re-registration.
            self.history.remove(service_id, instance_id);
            self.metrics.incr(keys::DEREGISTRATIONS);
            info!(service_id = %service_id, instance_id = %instance_id, "deregistered instance");
            self.bus
                .publish(&ServiceEvent::deregistered(&instance, &self.node_id));
            instance
        };
        self.services.remove_if(service_id, |_, map| map.is_empty());
        Ok(Some(removed))
    }

    /// Advance the heartbeat; a non-`UP` liveness state flips back to `UP`.
    ///
    /// When the renew also changes status, the `STATUS_CHANGE` is published
    /// before the `RENEW` so status-only watchers never miss the transition.
    pub fn renew(&self, service_id: &str, instance_id: &str) -> Result<Option<ServiceInstance>> {
        self.ensure_open()?;

        let Some(mut entry) = self.services.get_mut(service_id) else {
            return Ok(None);
        };
        let Some(instance) = entry.get_mut(instance_id) else {
            return Ok(None);
        };

        instance.last_heartbeat = Utc::now();
        let previous = instance.status;
        let revives = matches!(
            previous,
            InstanceStatus::Down | InstanceStatus::Unknown | InstanceStatus::Starting
        );
        if revives && check_transition(service_id, instance_id, previous, InstanceStatus::Up) {
            instance.status = InstanceStatus::Up;
            self.history
                .record(service_id, instance_id, previous, InstanceStatus::Up, "Heartbeat renewed");
            self.metrics.incr(keys::STATUS_CHANGES);
            let snapshot = instance.clone();
            self.bus.publish(&ServiceEvent::new(
                ServiceEventType::StatusChange,
                &snapshot,
                &self.node_id,
            ));
        }

        let snapshot = instance.clone();
        self.metrics.incr(keys::RENEWALS);
        debug!(service_id = %service_id, instance_id = %instance_id, "lease renewed");
        self.bus.publish(&ServiceEvent::new(
            ServiceEventType::Renew,
            &snapshot,
            &self.node_id,
        ));
        Ok(Some(snapshot))
    }

    /// Transition status, gated by the lifecycle matrix. A rejected
    /// transition is logged and leaves the instance untouched; an accepted
    /// self-transition records nothing and emits nothing.
    pub fn update_status(
        &self,
        service_id: &str,
        instance_id: &str,
        new_status: InstanceStatus,
        reason: &str,
    ) -> Result<Option<ServiceInstance>> {
        self.ensure_open()?;

        let Some(mut entry) = self.services.get_mut(service_id) else {
            return Ok(None);
        };
        let Some(instance) = entry.get_mut(instance_id) else {
            return Ok(None);
        };

        let previous = instance.status;
        if previous == new_status {
            return Ok(Some(instance.clone()));
        }
        if !check_transition(service_id, instance_id, previous, new_status) {
            self.metrics.incr(keys::REJECTED_TRANSITIONS);
            return Ok(Some(instance.clone()));
        }

        instance.status = new_status;
        if new_status == InstanceStatus::Up {
            // A liveness recovery counts as a heartbeat
            instance.last_heartbeat = Utc::now();
        }
        self.history
            .record(service_id, instance_id, previous, new_status, reason);
        self.metrics.incr(keys::STATUS_CHANGES);
        info!(
            service_id = %service_id,
            instance_id = %instance_id,
            from = %previous,
            to = %new_status,
            reason = %reason,
            "status changed"
        );

        let snapshot = instance.clone();
        self.bus.publish(&ServiceEvent::new(
            ServiceEventType::StatusChange,
            &snapshot,
            &self.node_id,
        ));
        Ok(Some(snapshot))
    }

    #[must_use]
    pub fn get_instance(&self, service_id: &str, instance_id: &str) -> Option<ServiceInstance> {
        self.services
            .get(service_id)
            .and_then(|entry| entry.get(instance_id).cloned())
    }

    #[must_use]
    pub fn get_instances(&self, service_id: &str) -> Vec<ServiceInstance> {
        self.services
            .get(service_id)
            .map(|entry| entry.values().cloned().collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn get_healthy_instances(&self, service_id: &str) -> Vec<ServiceInstance> {
        self.services
            .get(service_id)
            .map(|entry| {
                entry
                    .values()
                    .filter(|instance| instance.status.is_healthy())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    #[must_use]
    pub fn get_services(&self) -> Vec<String> {
        let mut services: Vec<String> = self.services.iter().map(|e| e.key().clone()).collect();
        services.sort();
        services
    }

    #[must_use]
    pub fn get_all_instances(&self) -> FxHashMap<String, Vec<ServiceInstance>> {
        self.services
            .iter()
            .map(|entry| (entry.key().clone(), entry.values().cloned().collect()))
            .collect()
    }

    #[must_use]
    pub fn instance_count(&self) -> usize {
        self.services.iter().map(|entry| entry.len()).sum()
    }

    /// Scan every instance against the expiry policy: decayed statuses are
    /// transitioned, long-dead leases are evicted. Returns the count removed.
    pub fn cleanup_expired(&self) -> usize {
        if self.ensure_open().is_err() {
            return 0;
        }
        let now = Utc::now();

        // Decide first, then apply: applying while iterating would re-enter
        // the shard locks.
        let mut pending: Vec<(String, String, ExpiryAction)> = Vec::new();
        for entry in &self.services {
            for instance in entry.values() {
                let action = self.policy.check(instance, now);
                if action != ExpiryAction::None {
                    pending.push((
                        instance.service_id.clone(),
                        instance.instance_id.clone(),
                        action,
                    ));
                }
            }
        }

        let mut removed = 0;
        for (service_id, instance_id, action) in pending {
            match action {
                ExpiryAction::MarkDown => {
                    let _ = self.update_status(
                        &service_id,
                        &instance_id,
                        InstanceStatus::Down,
                        REASON_HEARTBEAT_TIMEOUT,
                    );
                }
                ExpiryAction::MarkUnknown => {
                    let _ = self.update_status(
                        &service_id,
                        &instance_id,
                        InstanceStatus::Unknown,
                        REASON_LONG_NO_HEARTBEAT,
                    );
                }
                ExpiryAction::Evict => {
                    warn!(
                        service_id = %service_id,
                        instance_id = %instance_id,
                        reason = REASON_LEASE_EXPIRED,
                        "evicting expired lease"
                    );
                    if let Ok(Some(_)) = self.deregister(&service_id, &instance_id) {
                        self.metrics.incr(keys::EXPIRED_EVICTIONS);
                        removed += 1;
                    }
                }
                ExpiryAction::None => {}
            }
        }
        removed
    }

    /// Apply a peer-originated event: the implied mutation happens quietly,
    /// then the inbound event itself is republished locally with its origin
    /// preserved so the outbound sync never forwards it again.
    pub fn merge_replicated(&self, event: &ServiceEvent) {
        if self.ensure_open().is_err() {
            return;
        }
        match event.event_type {
            ServiceEventType::Register => {
                let Some(instance) = &event.instance else {
                    warn!(event_id = %event.event_id, "replicated REGISTER without snapshot");
                    return;
                };
                if let Err(e) = instance.validate() {
                    warn!(event_id = %event.event_id, error = %e, "rejected replicated instance");
                    return;
                }
                let mut entry = self.services.entry(event.service_id.clone()).or_default();
                entry.insert(event.instance_id.clone(), instance.clone());
            }
            ServiceEventType::Deregister => {
                if let Some(mut entry) = self.services.get_mut(&event.service_id) {
                    entry.remove(&event.instance_id);
                }
                self.services
                    .remove_if(&event.service_id, |_, map| map.is_empty());
                self.history.remove(&event.service_id, &event.instance_id);
            }
            ServiceEventType::Renew => {
                if let Some(mut entry) = self.services.get_mut(&event.service_id) {
                    if let Some(instance) = entry.get_mut(&event.instance_id) {
                        instance.last_heartbeat = event
                            .instance
                            .as_ref()
                            .map_or_else(Utc::now, |snapshot| snapshot.last_heartbeat);
                    }
                }
            }
            ServiceEventType::StatusChange => {
                let Some(snapshot) = &event.instance else {
                    return;
                };
                if let Some(mut entry) = self.services.get_mut(&event.service_id) {
                    if let Some(instance) = entry.get_mut(&event.instance_id) {
                        let previous = instance.status;
                        if previous != snapshot.status
                            && check_transition(
                                &event.service_id,
                                &event.instance_id,
                                previous,
                                snapshot.status,
                            )
                        {
                            instance.status = snapshot.status;
                            instance.last_heartbeat = snapshot.last_heartbeat;
                            self.history.record(
                                &event.service_id,
                                &event.instance_id,
                                previous,
                                snapshot.status,
                                "Replicated status change",
                            );
                        }
                    }
                }
            }
        }
        self.metrics.incr(keys::REPLICATION_APPLIED);
        debug!(
            event_id = %event.event_id,
            origin = %event.origin_node_id,
            "merged replicated event"
        );
        self.bus.publish(event);
    }

    /// Drop all state without emitting events
    pub fn clear(&self) {
        self.services.clear();
        self.history.clear();
        info!("registry store cleared");
    }

    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Refuse further mutations; reads keep working for drain paths
    pub fn shutdown(&self) {
        self.open.store(false, Ordering::Release);
        info!("registry store shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::DEFAULT_EVENT_BUFFER;
    use crate::model::ServiceRegistration;
    use pretty_assertions::assert_eq;

    fn store() -> (Arc<RegistryStore>, Arc<EventBus>) {
        let metrics = Arc::new(RegistryMetrics::new());
        let bus = Arc::new(EventBus::new(DEFAULT_EVENT_BUFFER, Arc::clone(&metrics)));
        let store = Arc::new(RegistryStore::new(
            "node-a",
            ExpiryPolicy::new(90),
            Arc::clone(&bus),
            Arc::new(StatusHistory::new()),
            metrics,
        ));
        (store, bus)
    }

    fn registration(service_id: &str, instance_id: &str) -> ServiceInstance {
        ServiceRegistration {
            instance_id: instance_id.to_string(),
            host: "127.0.0.1".to_string(),
            port: 9000,
            ..Default::default()
        }
        .into_instance(service_id, Utc::now())
    }

    #[tokio::test]
    async fn register_is_idempotent_on_identity() {
        let (store, _bus) = store();
        let first = store.register(registration("s", "i")).unwrap();
        let second = store.register(registration("s", "i")).unwrap();
        assert_eq!(store.get_instances("s").len(), 1);
        // registrationTime is preserved across the replace
        assert_eq!(second.registration_time, first.registration_time);
    }

    #[tokio::test]
    async fn register_rejects_invalid_identity() {
        let (store, _bus) = store();
        let mut bad = registration("s", "i");
        bad.service_id = "not a service".to_string();
        assert!(matches!(
            store.register(bad),
            Err(RegistryError::Validation { .. })
        ));
        let mut bad_port = registration("s", "i");
        bad_port.port = 0;
        assert!(store.register(bad_port).is_err());
    }

    #[tokio::test]
    async fn deregister_twice_is_a_noop() {
        let (store, bus) = store();
        store.register(registration("s", "i")).unwrap();
        let mut watch = bus.watch("s");
        assert!(store.deregister("s", "i").unwrap().is_some());
        assert!(store.deregister("s", "i").unwrap().is_none());
        // exactly one DEREGISTER observed
        let event = watch.next().await.unwrap();
        assert_eq!(event.event_type, ServiceEventType::Deregister);
        assert!(watch.try_next().is_none());
        assert!(store.get_services().is_empty());
    }

    #[tokio::test]
    async fn register_then_deregister_nets_to_empty() {
        let (store, bus) = store();
        let mut watch = bus.watch("s");
        store.register(registration("s", "i")).unwrap();
        store.deregister("s", "i").unwrap();
        assert_eq!(store.instance_count(), 0);
        assert_eq!(
            watch.next().await.unwrap().event_type,
            ServiceEventType::Register
        );
        assert_eq!(
            watch.next().await.unwrap().event_type,
            ServiceEventType::Deregister
        );
    }

    #[tokio::test]
    async fn renew_advances_heartbeat_and_revives() {
        let (store, _bus) = store();
        store.register(registration("s", "i")).unwrap();
        let before = store.get_instance("s", "i").unwrap();
        assert_eq!(before.status, InstanceStatus::Starting);

        let renewed = store.renew("s", "i").unwrap().unwrap();
        assert_eq!(renewed.status, InstanceStatus::Up);
        assert!(renewed.last_heartbeat >= before.last_heartbeat);
    }

    #[tokio::test]
    async fn renew_missing_instance_returns_none() {
        let (store, _bus) = store();
        assert!(store.renew("ghost", "i").unwrap().is_none());
    }

    #[tokio::test]
    async fn renew_emits_status_change_before_renew() {
        let (store, bus) = store();
        store.register(registration("s", "i")).unwrap();
        let mut watch = bus.watch("s");
        store.renew("s", "i").unwrap();
        assert_eq!(
            watch.next().await.unwrap().event_type,
            ServiceEventType::StatusChange
        );
        assert_eq!(
            watch.next().await.unwrap().event_type,
            ServiceEventType::Renew
        );
    }

    #[tokio::test]
    async fn renew_when_already_up_emits_only_renew() {
        let (store, bus) = store();
        store.register(registration("s", "i")).unwrap();
        store.renew("s", "i").unwrap();
        let mut watch = bus.watch("s");
        store.renew("s", "i").unwrap();
        assert_eq!(
            watch.next().await.unwrap().event_type,
            ServiceEventType::Renew
        );
        assert!(watch.try_next().is_none());
    }

    #[tokio::test]
    async fn invalid_transition_is_a_noop_without_event() {
        let (store, bus) = store();
        store.register(registration("s", "i")).unwrap();
        store.renew("s", "i").unwrap(); // now UP
        let mut watch = bus.watch("s");
        let result = store
            .update_status("s", "i", InstanceStatus::Starting, "test")
            .unwrap()
            .unwrap();
        assert_eq!(result.status, InstanceStatus::Up);
        assert!(watch.try_next().is_none());
    }

    #[tokio::test]
    async fn self_transition_emits_nothing() {
        let (store, bus) = store();
        store.register(registration("s", "i")).unwrap();
        let mut watch = bus.watch("s");
        store
            .update_status("s", "i", InstanceStatus::Starting, "noop")
            .unwrap();
        assert!(watch.try_next().is_none());
    }

    #[tokio::test]
    async fn healthy_reads_only_return_up() {
        let (store, _bus) = store();
        store.register(registration("s", "up-1")).unwrap();
        store.register(registration("s", "down-1")).unwrap();
        store.renew("s", "up-1").unwrap();
        store
            .update_status("s", "down-1", InstanceStatus::Down, "probe")
            .unwrap();
        let healthy = store.get_healthy_instances("s");
        assert_eq!(healthy.len(), 1);
        assert_eq!(healthy[0].instance_id, "up-1");
    }

    #[tokio::test]
    async fn cleanup_marks_down_then_unknown_then_evicts() {
        let (store, _bus) = store();
        let mut instance = registration("s", "i");
        instance.lease_duration_secs = Some(1);
        store.register(instance).unwrap();
        store.renew("s", "i").unwrap(); // UP

        // fresh heartbeat: nothing happens
        assert_eq!(store.cleanup_expired(), 0);
        assert_eq!(
            store.get_instance("s", "i").unwrap().status,
            InstanceStatus::Up
        );

        // age past the threshold: UP -> DOWN
        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        store.cleanup_expired();
        assert_eq!(
            store.get_instance("s", "i").unwrap().status,
            InstanceStatus::Down
        );

        // age past twice the threshold: DOWN -> UNKNOWN
        tokio::time::sleep(std::time::Duration::from_millis(1000)).await;
        store.cleanup_expired();
        assert_eq!(
            store.get_instance("s", "i").unwrap().status,
            InstanceStatus::Unknown
        );

        // age past three times the threshold: evicted
        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        assert_eq!(store.cleanup_expired(), 1);
        assert!(store.get_instance("s", "i").is_none());
    }

    #[tokio::test]
    async fn merge_replicated_register_emits_no_local_origin_event() {
        let (store, bus) = store();
        let instance = registration("s", "i");
        let event = ServiceEvent::new(ServiceEventType::Register, &instance, "node-b");
        let mut watch = bus.watch("s");
        store.merge_replicated(&event);

        assert!(store.get_instance("s", "i").is_some());
        let republished = watch.next().await.unwrap();
        assert_eq!(republished.origin_node_id, "node-b");
        assert_eq!(republished.event_id, event.event_id);
        assert!(watch.try_next().is_none());
    }

    #[tokio::test]
    async fn merge_replicated_deregister_is_idempotent() {
        let (store, _bus) = store();
        let instance = registration("s", "i");
        store.register(instance.clone()).unwrap();
        let event = ServiceEvent::deregistered(&instance, "node-b");
        store.merge_replicated(&event);
        store.merge_replicated(&event);
        assert!(store.get_instance("s", "i").is_none());
    }

    #[tokio::test]
    async fn shutdown_refuses_mutations_but_keeps_reads() {
        let (store, _bus) = store();
        store.register(registration("s", "i")).unwrap();
        store.shutdown();
        assert!(matches!(
            store.register(registration("s", "j")),
            Err(RegistryError::ShuttingDown)
        ));
        assert!(!store.is_healthy());
        assert_eq!(store.get_instances("s").len(), 1);
    }
}
