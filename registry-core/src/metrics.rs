//! Metrics recorder shared by the core components
//!
//! Each public operation records its own counters and timings here; the edge
//! exports a snapshot (Prometheus text or JSON) without reaching into the
//! components themselves.

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Well-known counter names
pub mod keys {
    pub const REGISTRATIONS: &str = "registrations";
    pub const DEREGISTRATIONS: &str = "deregistrations";
    pub const RENEWALS: &str = "renewals";
    pub const STATUS_CHANGES: &str = "status_changes";
    pub const REJECTED_TRANSITIONS: &str = "rejected_transitions";
    pub const EXPIRED_EVICTIONS: &str = "expired_evictions";
    pub const EVENTS_PUBLISHED: &str = "events_published";
    pub const EVENTS_DROPPED: &str = "events_dropped";
    pub const PROBES_RUN: &str = "probes_run";
    pub const PROBES_FAILED: &str = "probes_failed";
    pub const REPLICATION_DISPATCHES: &str = "replication_dispatches";
    pub const REPLICATION_FAILURES: &str = "replication_failures";
    pub const REPLICATION_APPLIED: &str = "replication_applied";
}

/// Duration aggregate for one operation
#[derive(Debug, Default)]
struct DurationTracker {
    count: AtomicU64,
    total_micros: AtomicU64,
    max_micros: AtomicU64,
}

impl DurationTracker {
    fn record(&self, duration: Duration) {
        // Micros since process start fit comfortably in u64
        let micros = duration.as_micros() as u64;
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_micros.fetch_add(micros, Ordering::Relaxed);
        self.max_micros.fetch_max(micros, Ordering::Relaxed);
    }
}

/// Snapshot of one duration aggregate
#[derive(Debug, Clone, Serialize)]
pub struct DurationSnapshot {
    pub count: u64,
    pub total_micros: u64,
    pub max_micros: u64,
}

/// Counter and timing recorder passed into each core component
#[derive(Debug)]
pub struct RegistryMetrics {
    counters: RwLock<FxHashMap<String, AtomicU64>>,
    durations: RwLock<FxHashMap<String, DurationTracker>>,
    start_time: Instant,
}

impl RegistryMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self {
            counters: RwLock::new(FxHashMap::default()),
            durations: RwLock::new(FxHashMap::default()),
            start_time: Instant::now(),
        }
    }

    /// Increment a named counter by one
    pub fn incr(&self, name: &str) {
        self.add(name, 1);
    }

    /// Increment a named counter by `n`
    pub fn add(&self, name: &str, n: u64) {
        let counters = self.counters.read();
        if let Some(counter) = counters.get(name) {
            counter.fetch_add(n, Ordering::Relaxed);
        } else {
            drop(counters);
            let mut counters = self.counters.write();
            counters
                .entry(name.to_string())
                .or_insert_with(|| AtomicU64::new(0))
                .fetch_add(n, Ordering::Relaxed);
        }
    }

    /// Record one operation duration
    pub fn record_duration(&self, name: &str, duration: Duration) {
        let durations = self.durations.read();
        if let Some(tracker) = durations.get(name) {
            tracker.record(duration);
        } else {
            drop(durations);
            let mut durations = self.durations.write();
            durations
                .entry(name.to_string())
                .or_insert_with(DurationTracker::default)
                .record(duration);
        }
    }

    /// Time a closure and record its duration under `name`
    pub fn time<T>(&self, name: &str, f: impl FnOnce() -> T) -> T {
        let start = Instant::now();
        let result = f();
        self.record_duration(name, start.elapsed());
        result
    }

    #[must_use]
    pub fn get(&self, name: &str) -> u64 {
        self.counters
            .read()
            .get(name)
            .map_or(0, |c| c.load(Ordering::Relaxed))
    }

    #[must_use]
    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Sorted counter snapshot for export
    #[must_use]
    pub fn counter_snapshot(&self) -> Vec<(String, u64)> {
        let mut snapshot: Vec<(String, u64)> = self
            .counters
            .read()
            .iter()
            .map(|(name, counter)| (name.clone(), counter.load(Ordering::Relaxed)))
            .collect();
        snapshot.sort();
        snapshot
    }

    /// Sorted duration snapshot for export
    #[must_use]
    pub fn duration_snapshot(&self) -> Vec<(String, DurationSnapshot)> {
        let mut snapshot: Vec<(String, DurationSnapshot)> = self
            .durations
            .read()
            .iter()
            .map(|(name, tracker)| {
                (
                    name.clone(),
                    DurationSnapshot {
                        count: tracker.count.load(Ordering::Relaxed),
                        total_micros: tracker.total_micros.load(Ordering::Relaxed),
                        max_micros: tracker.max_micros.load(Ordering::Relaxed),
                    },
                )
            })
            .collect();
        snapshot.sort_by(|a, b| a.0.cmp(&b.0));
        snapshot
    }
}

impl Default for RegistryMetrics {
    fn default() -> Self {
        Self::new()
    }
}
