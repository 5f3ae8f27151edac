//! Server selection and call-result health tracking.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
#[cfg(test)]
use mockall::automock;
use rand::Rng;
use tracing::debug;

use crate::DataType;
use crate::HostPort;
use crate::Instance;
use crate::LocalRegistry;
use crate::ReturnCode;
use crate::ServiceKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    Ok,
    Error,
}

/// One call-result sample against a server instance.
#[derive(Debug, Clone, PartialEq)]
pub struct CallResult {
    /// Service the instance belongs to, `None` for seed servers
    pub service: Option<ServiceKey>,
    pub instance: HostPort,
    pub code: i32,
    pub status: CallStatus,
    pub delay: Duration,
}

pub trait CallResultReporter: Send + Sync + 'static {
    fn report(
        &self,
        result: CallResult,
    );

    /// Whether `instance` should be skipped by server selection.
    fn is_excluded(
        &self,
        instance: &HostPort,
    ) -> bool;
}

/// Default reporter: counts consecutive failures per server.
///
/// A success resets the count. Servers at or above the threshold are excluded
/// from selection while at least one other candidate remains.
#[derive(Debug)]
pub struct HealthMonitor {
    pub(crate) failure_counts: DashMap<HostPort, u32>,
    pub(crate) failure_threshold: u32,
}

impl HealthMonitor {
    pub fn new(failure_threshold: u32) -> Self {
        Self {
            failure_counts: DashMap::new(),
            failure_threshold,
        }
    }

    pub fn record_failure(
        &self,
        instance: &HostPort,
    ) {
        let mut count = self.failure_counts.entry(instance.clone()).or_insert(0);
        *count += 1;
    }

    pub fn record_success(
        &self,
        instance: &HostPort,
    ) {
        self.failure_counts.remove(instance);
    }

    pub fn failure_count(
        &self,
        instance: &HostPort,
    ) -> u32 {
        self.failure_counts
            .get(instance)
            .map(|count| *count)
            .unwrap_or(0)
    }

    pub fn unhealthy_instances(&self) -> Vec<HostPort> {
        self.failure_counts
            .iter()
            .filter(|entry| *entry.value() >= self.failure_threshold)
            .map(|entry| entry.key().clone())
            .collect()
    }
}

impl CallResultReporter for HealthMonitor {
    fn report(
        &self,
        result: CallResult,
    ) {
        match result.status {
            CallStatus::Ok => self.record_success(&result.instance),
            CallStatus::Error => self.record_failure(&result.instance),
        }
    }

    fn is_excluded(
        &self,
        instance: &HostPort,
    ) -> bool {
        self.failure_count(instance) >= self.failure_threshold
    }
}

/// Picks instances of the internal system services.
#[cfg_attr(test, automock)]
pub trait InstanceSelector: Send + Sync + 'static {
    /// Whether instances of `service` can be selected right now. Starts
    /// tracking the service if it is not tracked yet.
    fn is_service_ready(
        &self,
        service: &ServiceKey,
    ) -> bool;

    fn select_instance(
        &self,
        service: &ServiceKey,
        ignore_half_open: bool,
    ) -> std::result::Result<Instance, ReturnCode>;
}

/// Starts tracking service data on a thread that may touch the disk.
#[cfg_attr(test, automock)]
pub trait ServiceTracker: Send + Sync + 'static {
    fn track(
        &self,
        service: &ServiceKey,
        data_type: DataType,
    );
}

/// Selects from the instances held by the local registry, weighted random over
/// the healthy ones.
///
/// Only reads the registry. Untracked services are handed to the tracker, so
/// the connector thread never loads a backup itself.
pub struct RegistrySelector {
    registry: Arc<LocalRegistry>,
    reporter: Arc<dyn CallResultReporter>,
    tracker: Arc<dyn ServiceTracker>,
}

impl RegistrySelector {
    pub fn new(
        registry: Arc<LocalRegistry>,
        reporter: Arc<dyn CallResultReporter>,
        tracker: Arc<dyn ServiceTracker>,
    ) -> Self {
        Self {
            registry,
            reporter,
            tracker,
        }
    }

    fn track_if_missing(
        &self,
        service: &ServiceKey,
    ) {
        if !self.registry.is_tracked(service, DataType::Instances) {
            debug!(service = %service, "system service not tracked yet");
            self.tracker.track(service, DataType::Instances);
        }
    }
}

impl InstanceSelector for RegistrySelector {
    fn is_service_ready(
        &self,
        service: &ServiceKey,
    ) -> bool {
        match self
            .registry
            .get_service_data_with_ref(service, DataType::Instances)
        {
            Ok(data) => data.is_available() && !data.is_not_found(),
            Err(_) => {
                self.track_if_missing(service);
                false
            }
        }
    }

    fn select_instance(
        &self,
        service: &ServiceKey,
        ignore_half_open: bool,
    ) -> std::result::Result<Instance, ReturnCode> {
        let data = match self
            .registry
            .get_service_data_with_ref(service, DataType::Instances)
        {
            Ok(data) => data,
            Err(e) => {
                // A later switch can succeed once tracked
                self.track_if_missing(service);
                return Err(e.return_code());
            }
        };
        if data.is_not_found() {
            return Err(ReturnCode::ServiceNotFound);
        }
        let instances = data.instances().ok_or(ReturnCode::InstanceNotFound)?;
        let status = self.registry.service(service).map(|s| s.circuit_breaker_status());

        let usable = |instance: &&Instance| -> bool {
            let Some(status) = &status else {
                return true;
            };
            if status.open_instances.contains(&instance.id) {
                return false;
            }
            !(ignore_half_open && status.half_open_instances.contains_key(&instance.id))
        };
        let available: Vec<&Instance> = instances.available().filter(usable).collect();
        let healthy: Vec<&Instance> = available
            .iter()
            .copied()
            .filter(|i| !self.reporter.is_excluded(&i.endpoint()))
            .collect();
        let candidates = if healthy.is_empty() { available } else { healthy };

        let selected = pick_weighted(&candidates).ok_or(ReturnCode::InstanceNotFound)?;
        debug!(service = %service, instance = %selected.id, "system service instance selected");
        Ok(selected.clone())
    }
}

fn pick_weighted<'a>(candidates: &[&'a Instance]) -> Option<&'a Instance> {
    let total: u64 = candidates.iter().map(|i| i.weight as u64).sum();
    if total == 0 {
        return None;
    }
    let mut point = rand::thread_rng().gen_range(0..total);
    for instance in candidates {
        let weight = instance.weight as u64;
        if point < weight {
            return Some(instance);
        }
        point -= weight;
    }
    candidates.last().copied()
}
