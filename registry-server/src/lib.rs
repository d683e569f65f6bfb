//! HTTP edge for the registry core: REST, SSE, and WebSocket surfaces,
//! API-key authentication, configuration, and Prometheus export

pub mod config;
pub mod error;
pub mod handlers;
#[cfg(feature = "monitoring")]
pub mod metrics;
pub mod middleware;
pub mod models;
pub mod server;

pub use config::RegistryConfig;
pub use server::{build_router, print_routes, AppState, RegistryServer};
