//! Read-side discovery views over the registry store

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;

use crate::error::Result;
use crate::events::{EventBus, EventStream};
use crate::model::{validate_identifier, InstanceStatus, ServiceInstance};
use crate::store::RegistryStore;

/// Metadata key consulted by the `zone` filter
pub const METADATA_ZONE: &str = "zone";
/// Metadata key consulted by the `version` filter
pub const METADATA_VERSION: &str = "version";

/// Exact-match filters for discovery reads.
///
/// An unrecognized `status` token matches nothing rather than erroring, so a
/// typo never widens a result set.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DiscoveryFilters {
    pub status: Option<String>,
    pub zone: Option<String>,
    pub version: Option<String>,
}

impl DiscoveryFilters {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.status.is_none() && self.zone.is_none() && self.version.is_none()
    }

    /// True when the instance passes every present filter
    #[must_use]
    pub fn matches(&self, instance: &ServiceInstance) -> bool {
        if let Some(token) = &self.status {
            match InstanceStatus::from_str(token) {
                Ok(status) if instance.status == status => {}
                _ => return false,
            }
        }
        if let Some(zone) = &self.zone {
            if instance.metadata.get(METADATA_ZONE) != Some(zone) {
                return false;
            }
        }
        if let Some(version) = &self.version {
            if instance.metadata.get(METADATA_VERSION) != Some(version) {
                return false;
            }
        }
        true
    }
}

/// Full `{serviceId -> [instances]}` snapshot with recomputed totals
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Catalog {
    pub services: FxHashMap<String, Vec<ServiceInstance>>,
    pub total_services: usize,
    pub total_instances: usize,
}

/// Filtered reads, catalog assembly, and per-service watch
pub struct DiscoveryService {
    store: Arc<RegistryStore>,
    bus: Arc<EventBus>,
}

impl DiscoveryService {
    #[must_use]
    pub fn new(store: Arc<RegistryStore>, bus: Arc<EventBus>) -> Self {
        Self { store, bus }
    }

    /// All instances of a service
    pub fn discover(&self, service_id: &str) -> Result<Vec<ServiceInstance>> {
        validate_identifier("serviceId", service_id)?;
        Ok(self.store.get_instances(service_id))
    }

    /// Instances with `status = UP` only
    pub fn discover_healthy(&self, service_id: &str) -> Result<Vec<ServiceInstance>> {
        validate_identifier("serviceId", service_id)?;
        Ok(self.store.get_healthy_instances(service_id))
    }

    /// Filtered instance list; `healthy_only` composes with the exact-match
    /// filters
    pub fn discover_filtered(
        &self,
        service_id: &str,
        healthy_only: bool,
        filters: &DiscoveryFilters,
    ) -> Result<Vec<ServiceInstance>> {
        let instances = if healthy_only {
            self.discover_healthy(service_id)?
        } else {
            self.discover(service_id)?
        };
        if filters.is_empty() {
            return Ok(instances);
        }
        Ok(instances
            .into_iter()
            .filter(|instance| filters.matches(instance))
            .collect())
    }

    /// Known service ids
    #[must_use]
    pub fn services(&self) -> Vec<String> {
        self.store.get_services()
    }

    /// Assemble the catalog; with `healthy_only`, services whose filtered
    /// list becomes empty are dropped and totals reflect the filtered content
    #[must_use]
    pub fn catalog(&self, healthy_only: bool) -> Catalog {
        let mut services = self.store.get_all_instances();
        if healthy_only {
            for instances in services.values_mut() {
                instances.retain(|instance| instance.status.is_healthy());
            }
            services.retain(|_, instances| !instances.is_empty());
        }
        let total_instances = services.values().map(Vec::len).sum();
        let total_services = services.len();
        debug!(total_services, total_instances, healthy_only, "catalog assembled");
        Catalog {
            services,
            total_services,
            total_instances,
        }
    }

    /// Live event stream for one service, forwarded from the event bus
    pub fn watch_service(&self, service_id: &str) -> Result<EventStream> {
        validate_identifier("serviceId", service_id)?;
        Ok(self.bus.watch(service_id))
    }
}
