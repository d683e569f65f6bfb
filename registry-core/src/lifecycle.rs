//! Instance lifecycle: status state machine, history, heartbeat expiry
//!
//! The store consults this module for every transition; the expiry scanner
//! runs here and drives the store's cleanup on a fixed cadence.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::model::{InstanceStatus, ServiceInstance, StatusRecord};
use crate::store::RegistryStore;

/// Reason attached to the first expiry stage
pub const REASON_HEARTBEAT_TIMEOUT: &str = "Heartbeat timeout";
/// Reason attached to the second expiry stage
pub const REASON_LONG_NO_HEARTBEAT: &str = "Long time no heartbeat";
/// Reason attached to lease eviction; the `expired` tag authorizes auto-deregistration
pub const REASON_LEASE_EXPIRED: &str = "Lease expired";

/// Whether `from -> to` is permitted. Self-transitions are always allowed.
#[must_use]
pub fn transition_allowed(from: InstanceStatus, to: InstanceStatus) -> bool {
    use InstanceStatus::{Down, OutOfService, Starting, Unknown, Up};
    if from == to {
        return true;
    }
    match (from, to) {
        (Starting, Up | Down | OutOfService | Unknown) => true,
        (Up, Down | OutOfService | Unknown) => true,
        (Down, Up | Starting | OutOfService | Unknown) => true,
        (OutOfService, Up | Down | Starting | Unknown) => true,
        (Unknown, Up | Down | Starting | OutOfService) => true,
        _ => false,
    }
}

/// Outcome of an expiry check for one instance.
///
/// Eviction is decided here and only here: probe failures park an instance
/// at `DOWN`, they never remove the registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryAction {
    /// Heartbeat is fresh enough
    None,
    /// Not yet decayed (`UP` or `STARTING`) and past the threshold
    MarkDown,
    /// `DOWN` and past twice the threshold
    MarkUnknown,
    /// Past three times the threshold; remove the registration
    Evict,
}

/// Pure decision function for the expiry scanner
#[derive(Debug, Clone, Copy)]
pub struct ExpiryPolicy {
    /// Threshold applied when the instance carries no lease override
    pub default_lease_secs: u64,
}

impl ExpiryPolicy {
    #[must_use]
    pub const fn new(default_lease_secs: u64) -> Self {
        Self { default_lease_secs }
    }

    #[must_use]
    pub fn check(&self, instance: &ServiceInstance, now: DateTime<Utc>) -> ExpiryAction {
        let threshold = instance.lease_duration(self.default_lease_secs);
        let age = instance.heartbeat_age(now);
        if age > threshold.saturating_mul(3) {
            return ExpiryAction::Evict;
        }
        // The decay cascade applies to any instance that has not already
        // decayed: a registration that never renews out of STARTING ages the
        // same way an UP one does. OUT_OF_SERVICE is operator-driven and
        // UNKNOWN is already past DOWN, so neither regresses here.
        match instance.status {
            InstanceStatus::Up | InstanceStatus::Starting if age > threshold => {
                ExpiryAction::MarkDown
            }
            InstanceStatus::Down if age > threshold.saturating_mul(2) => ExpiryAction::MarkUnknown,
            _ => ExpiryAction::None,
        }
    }
}

/// Per-instance status history, retained until deregistration
#[derive(Debug, Default)]
pub struct StatusHistory {
    records: DashMap<String, Vec<StatusRecord>>,
}

impl StatusHistory {
    #[must_use]
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
        }
    }

    fn key(service_id: &str, instance_id: &str) -> String {
        format!("{service_id}/{instance_id}")
    }

    pub fn record(
        &self,
        service_id: &str,
        instance_id: &str,
        previous: InstanceStatus,
        status: InstanceStatus,
        reason: &str,
    ) {
        let record = StatusRecord {
            status,
            previous_status: previous,
            reason: reason.to_string(),
            timestamp: Utc::now(),
        };
        self.records
            .entry(Self::key(service_id, instance_id))
            .or_default()
            .push(record);
    }

    #[must_use]
    pub fn get(&self, service_id: &str, instance_id: &str) -> Vec<StatusRecord> {
        self.records
            .get(&Self::key(service_id, instance_id))
            .map(|entry| entry.clone())
            .unwrap_or_default()
    }

    pub fn remove(&self, service_id: &str, instance_id: &str) {
        self.records.remove(&Self::key(service_id, instance_id));
    }

    pub fn clear(&self) {
        self.records.clear();
    }
}

/// Drives the periodic heartbeat-expiry scan against the store
pub struct LifecycleManager {
    store: Arc<RegistryStore>,
    scan_interval: Duration,
}

impl LifecycleManager {
    #[must_use]
    pub fn new(store: Arc<RegistryStore>, scan_interval: Duration) -> Self {
        Self {
            store,
            scan_interval,
        }
    }

    /// Expiry scanner loop; exits promptly when `shutdown` flips to true
    pub async fn run_expiry_scanner(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.scan_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(
            interval_secs = self.scan_interval.as_secs(),
            "expiry scanner started"
        );
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let removed = self.store.cleanup_expired();
                    if removed > 0 {
                        info!(removed, "expiry scan evicted instances");
                    } else {
                        debug!("expiry scan found nothing to evict");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("expiry scanner stopped");
    }
}

/// Log-and-reject helper used by the store's write path
pub fn check_transition(
    service_id: &str,
    instance_id: &str,
    from: InstanceStatus,
    to: InstanceStatus,
) -> bool {
    if transition_allowed(from, to) {
        true
    } else {
        warn!(
            service_id = %service_id,
            instance_id = %instance_id,
            from = %from,
            to = %to,
            "rejected status transition"
        );
        false
    }
}
