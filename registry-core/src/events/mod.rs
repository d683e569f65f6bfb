//! Service event fan-out
//!
//! Topic-keyed, multi-producer fan-out of [`ServiceEvent`]s to discovery
//! watchers and the cluster replicator. Topics are service ids plus one
//! all-services topic; delivery is best-effort with bounded per-consumer
//! buffers that drop the oldest entry on overflow.

pub mod bus;

pub use bus::{EventBus, EventStream, DEFAULT_EVENT_BUFFER};

/// Topic that receives every event regardless of service id
pub const ALL_SERVICES_TOPIC: &str = "__all__";
