//! Topic-keyed broadcast event bus

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::ALL_SERVICES_TOPIC;
use crate::metrics::{keys, RegistryMetrics};
use crate::model::ServiceEvent;

/// Per-consumer buffer size; overflow drops the oldest event
pub const DEFAULT_EVENT_BUFFER: usize = 256;

struct BusInner {
    topics: RwLock<FxHashMap<String, broadcast::Sender<ServiceEvent>>>,
    buffer: usize,
    metrics: Arc<RegistryMetrics>,
}

impl BusInner {
    /// Remove the topic when its last watcher has gone away. Serializes with
    /// subscription through the map's write lock so a new watcher never
    /// attaches to a sender that is being torn down.
    fn release_topic(&self, topic: &str) {
        let mut topics = self.topics.write();
        if let Some(sender) = topics.get(topic) {
            if sender.receiver_count() == 0 {
                topics.remove(topic);
                debug!(topic = %topic, "event topic torn down");
            }
        }
    }
}

/// Multi-producer, multi-consumer fan-out of service events
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    #[must_use]
    pub fn new(buffer: usize, metrics: Arc<RegistryMetrics>) -> Self {
        Self {
            inner: Arc::new(BusInner {
                topics: RwLock::new(FxHashMap::default()),
                buffer,
                metrics,
            }),
        }
    }

    /// Publish an event to its service topic and the all-services topic.
    ///
    /// Never blocks on slow consumers; a topic with no live watcher is torn
    /// down instead of buffering.
    pub fn publish(&self, event: &ServiceEvent) {
        self.inner.metrics.incr(keys::EVENTS_PUBLISHED);
        self.send_to(&event.service_id, event);
        self.send_to(ALL_SERVICES_TOPIC, event);
    }

    fn send_to(&self, topic: &str, event: &ServiceEvent) {
        let sender = {
            let topics = self.inner.topics.read();
            topics.get(topic).cloned()
        };
        let Some(sender) = sender else {
            return;
        };
        if sender.send(event.clone()).is_err() {
            // Last watcher left between lookup and send
            self.inner.release_topic(topic);
        }
    }

    /// Subscribe to one service's events; the topic is created lazily
    #[must_use]
    pub fn watch(&self, service_id: &str) -> EventStream {
        self.subscribe_topic(service_id)
    }

    /// Subscribe to every event on the bus
    #[must_use]
    pub fn watch_all(&self) -> EventStream {
        self.subscribe_topic(ALL_SERVICES_TOPIC)
    }

    fn subscribe_topic(&self, topic: &str) -> EventStream {
        let mut topics = self.inner.topics.write();
        let sender = topics.entry(topic.to_string()).or_insert_with(|| {
            debug!(topic = %topic, "event topic created");
            broadcast::channel(self.inner.buffer).0
        });
        EventStream {
            topic: topic.to_string(),
            rx: Some(sender.subscribe()),
            inner: Arc::clone(&self.inner),
            dropped: 0,
        }
    }

    /// Number of live watchers on a topic
    #[must_use]
    pub fn watcher_count(&self, topic: &str) -> usize {
        self.inner
            .topics
            .read()
            .get(topic)
            .map_or(0, broadcast::Sender::receiver_count)
    }

    /// Currently materialized topics
    #[must_use]
    pub fn topics(&self) -> Vec<String> {
        self.inner.topics.read().keys().cloned().collect()
    }

    /// Disconnect all watchers and drop every topic
    pub fn shutdown(&self) {
        let mut topics = self.inner.topics.write();
        topics.clear();
        debug!("event bus shut down");
    }
}

/// A single watcher's view of one topic.
///
/// Overflow is surfaced, not hidden: when the consumer falls behind, the
/// oldest buffered events are discarded and `dropped()` reports how many.
pub struct EventStream {
    topic: String,
    rx: Option<broadcast::Receiver<ServiceEvent>>,
    inner: Arc<BusInner>,
    dropped: u64,
}

impl EventStream {
    /// Next event in per-service commit order; `None` once the bus shuts down
    pub async fn next(&mut self) -> Option<ServiceEvent> {
        let rx = self.rx.as_mut()?;
        loop {
            match rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.dropped += n;
                    self.inner.metrics.add(keys::EVENTS_DROPPED, n);
                    warn!(topic = %self.topic, dropped = n, "watcher lagged, oldest events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking poll used by synchronous callers; `None` when empty
    pub fn try_next(&mut self) -> Option<ServiceEvent> {
        let rx = self.rx.as_mut()?;
        loop {
            match rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    self.dropped += n;
                    self.inner.metrics.add(keys::EVENTS_DROPPED, n);
                }
                Err(_) => return None,
            }
        }
    }

    /// Events discarded for this watcher because it fell behind
    #[must_use]
    pub const fn dropped(&self) -> u64 {
        self.dropped
    }

    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        // Drop our receiver first so the count below sees it gone
        self.rx.take();
        self.inner.release_topic(&self.topic);
    }
}
