//! Reverse index from `host:port` to instance id, one per service.

use std::collections::HashMap;
use std::time::Duration;
use std::time::Instant;

use dashmap::DashMap;
use tracing::debug;

use super::LocalRegistry;
use crate::DataType;
use crate::DiscoveryError;
use crate::HostPort;
use crate::Result;
use crate::ServiceKey;

#[derive(Debug)]
struct ServiceHostPort {
    /// Cache version of the Instances snapshot the index was built from
    cache_version: u64,
    index: HashMap<HostPort, String>,
    last_used: Instant,
}

#[derive(Debug, Default)]
pub struct HostPortIndex {
    services: DashMap<ServiceKey, ServiceHostPort>,
}

impl HostPortIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Id of the instance listening on `host:port`.
    ///
    /// A miss rebuilds the index only when the registry holds a newer Instances
    /// snapshot. A miss against the current snapshot is `InstanceNotFound`.
    pub fn get_instance_id(
        &self,
        registry: &LocalRegistry,
        key: &ServiceKey,
        host: &str,
        port: u16,
    ) -> Result<String> {
        let endpoint = HostPort::new(host, port);
        let indexed_version = match self.services.get_mut(key) {
            Some(mut entry) => {
                entry.last_used = Instant::now();
                if let Some(id) = entry.index.get(&endpoint) {
                    return Ok(id.clone());
                }
                Some(entry.cache_version)
            }
            None => None,
        };

        let data = registry.get_service_data_with_ref(key, DataType::Instances)?;
        if data.is_not_found() {
            return Err(DiscoveryError::ServiceNotFound(key.to_string()).into());
        }
        if indexed_version == Some(data.cache_version()) {
            return Err(instance_not_found(key, &endpoint));
        }
        let Some(instances) = data.instances() else {
            return Err(instance_not_found(key, &endpoint));
        };

        let index: HashMap<HostPort, String> = instances
            .instances()
            .values()
            .map(|instance| (instance.endpoint(), instance.id.clone()))
            .collect();
        let found = index.get(&endpoint).cloned();
        debug!(
            service = %key,
            cache_version = data.cache_version(),
            size = index.len(),
            "host:port index rebuilt"
        );
        self.services.insert(
            key.clone(),
            ServiceHostPort {
                cache_version: data.cache_version(),
                index,
                last_used: Instant::now(),
            },
        );
        found.ok_or_else(|| instance_not_found(key, &endpoint))
    }

    /// Drops indexes unused for `idle`. Returns how many were dropped.
    pub fn clear_idle(
        &self,
        idle: Duration,
    ) -> usize {
        let before = self.services.len();
        self.services
            .retain(|_, entry| entry.last_used.elapsed() < idle);
        before - self.services.len()
    }

    /// Keeps only the indexes of services for which `tracked` holds.
    pub fn retain_services<F>(
        &self,
        tracked: F,
    ) where
        F: Fn(&ServiceKey) -> bool,
    {
        self.services.retain(|key, _| tracked(key));
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

fn instance_not_found(
    key: &ServiceKey,
    endpoint: &HostPort,
) -> crate::Error {
    DiscoveryError::InstanceNotFound(format!("{endpoint} in service {key}")).into()
}
