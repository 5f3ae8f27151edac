//! Per-service state shared by every data type of one service.
//!
//! Holds what must outlive individual snapshots: the local instance ids and the
//! status slots that external circuit-breaker and dynamic-weight policies write.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;

use super::DataType;
use super::ServiceData;
use super::ServiceKey;

#[derive(Debug, Default)]
struct LocalIds {
    seq: u32,
    ids: HashMap<String, u64>,
}

/// Circuit-breaker state reported by an external policy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CircuitBreakerStatus {
    pub version: u64,
    pub open_instances: HashSet<String>,
    /// Half-open instance id to the number of probe requests still allowed
    pub half_open_instances: HashMap<String, u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DynamicWeights {
    pub version: u64,
    pub weights: HashMap<String, u32>,
}

#[derive(Debug)]
pub struct Service {
    key: ServiceKey,
    service_id: u32,
    local_ids: Mutex<LocalIds>,
    circuit_breaker: ArcSwap<CircuitBreakerStatus>,
    dynamic_weights: ArcSwap<DynamicWeights>,
    data_versions: Mutex<HashMap<DataType, u64>>,
}

impl Service {
    pub fn new(
        key: ServiceKey,
        service_id: u32,
    ) -> Self {
        Self {
            key,
            service_id,
            local_ids: Mutex::new(LocalIds::default()),
            circuit_breaker: ArcSwap::from_pointee(CircuitBreakerStatus::default()),
            dynamic_weights: ArcSwap::from_pointee(DynamicWeights::default()),
            data_versions: Mutex::new(HashMap::new()),
        }
    }

    pub fn key(&self) -> &ServiceKey {
        &self.key
    }

    pub fn service_id(&self) -> u32 {
        self.service_id
    }

    /// Assigns local ids to the instances of a snapshot before it is published.
    ///
    /// Ids of instances seen before are reused. Ids of instances that left the
    /// snapshot are forgotten.
    pub fn assign_local_ids(
        &self,
        data: &mut ServiceData,
    ) {
        let Some(instances) = data.instances_mut() else {
            return;
        };
        let mut local = self.local_ids.lock();
        let mut next = HashMap::with_capacity(instances.len());
        for instance in instances.all_mut() {
            let id = match local.ids.get(&instance.id).copied() {
                Some(id) => id,
                None => {
                    local.seq = local.seq.wrapping_add(1);
                    ((self.service_id as u64) << 32) | local.seq as u64
                }
            };
            instance.local_id = id;
            next.insert(instance.id.clone(), id);
        }
        local.ids = next;
    }

    /// Records the version of the latest snapshot of `data_type`.
    pub fn record_data_version(
        &self,
        data_type: DataType,
        cache_version: u64,
    ) {
        self.data_versions.lock().insert(data_type, cache_version);
    }

    pub fn data_version(
        &self,
        data_type: DataType,
    ) -> Option<u64> {
        self.data_versions.lock().get(&data_type).copied()
    }

    pub fn circuit_breaker_status(&self) -> Arc<CircuitBreakerStatus> {
        self.circuit_breaker.load_full()
    }

    /// Stores a newer status. Older versions are ignored.
    pub fn set_circuit_breaker_status(
        &self,
        status: CircuitBreakerStatus,
    ) -> bool {
        let current = self.circuit_breaker.load();
        if status.version != 0 && status.version <= current.version {
            return false;
        }
        self.circuit_breaker.store(Arc::new(status));
        true
    }

    pub fn is_circuit_open(
        &self,
        instance_id: &str,
    ) -> bool {
        self.circuit_breaker
            .load()
            .open_instances
            .contains(instance_id)
    }

    pub fn dynamic_weights(&self) -> Arc<DynamicWeights> {
        self.dynamic_weights.load_full()
    }

    pub fn set_dynamic_weights(
        &self,
        weights: DynamicWeights,
    ) -> bool {
        let current = self.dynamic_weights.load();
        if weights.version != 0 && weights.version <= current.version {
            return false;
        }
        self.dynamic_weights.store(Arc::new(weights));
        true
    }
}
