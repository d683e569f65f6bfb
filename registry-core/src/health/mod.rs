//! Active health probing
//!
//! Every registered instance with an enabled health check gets a scheduled
//! probe task. Verdicts feed the status manager through a callback installed
//! at construction and are published on a dedicated health-event stream,
//! parallel to (but distinct from) the service-event bus.

pub mod engine;
pub mod prober;

pub use engine::{HealthProbeEngine, ProbeEngineConfig, StatusCallback};
pub use prober::{ProbeVerdict, Prober};
