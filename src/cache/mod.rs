//! Local cache of discovered service data.
//!
//! [`LocalRegistry`] holds the snapshots and is shared by every thread. The
//! [`CacheManager`] runs on its own reactor: it completes asynchronous route
//! info waits and runs the periodic expiry of unused data.

mod host_port;
mod persist;
mod registry;
mod watcher;

pub use host_port::*;
pub use persist::*;
pub use registry::*;
pub use watcher::*;

#[cfg(test)]
mod host_port_test;

use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::reactor::ReactorHandle;
use crate::reactor::Scheduler;
use crate::DataType;
use crate::DiscoveryError;
use crate::RegistryConfig;
use crate::Result;
use crate::RouteInfo;
use crate::RouteInfoNotify;
use crate::ServiceKey;
use crate::ServiceKeyWithType;
use crate::ServiceTracker;

/// Told about every snapshot the registry stored from the server.
pub trait ServiceDataChangeSink: Send + Sync + 'static {
    fn on_service_data_change(
        &self,
        key: &ServiceKeyWithType,
    );
}

/// State of the cache reactor.
pub struct CacheManager {
    config: RegistryConfig,
    registry: Option<Arc<LocalRegistry>>,
    host_ports: Arc<HostPortIndex>,
    watchers: HashMap<u64, TimeoutWatcher>,
    /// Watcher ids per key they still wait for
    by_key: HashMap<ServiceKeyWithType, BTreeSet<u64>>,
    next_watcher_id: u64,
}

impl CacheManager {
    pub fn new(
        config: RegistryConfig,
        host_ports: Arc<HostPortIndex>,
    ) -> Self {
        Self {
            config,
            registry: None,
            host_ports,
            watchers: HashMap::new(),
            by_key: HashMap::new(),
            next_watcher_id: 0,
        }
    }

    /// Arms the periodic host:port cleanup and data expiry.
    pub fn start(
        &mut self,
        sched: &mut Scheduler<CacheManager>,
        registry: Arc<LocalRegistry>,
    ) {
        self.registry = Some(registry);
        self.schedule_clear_host_ports(sched);
        self.schedule_gc(sched);
        info!(
            gc_interval = ?self.config.gc_interval(),
            service_expire_time = ?self.config.service_expire_time(),
            "cache manager started"
        );
    }

    fn schedule_clear_host_ports(
        &self,
        sched: &mut Scheduler<CacheManager>,
    ) {
        sched.add_timing_task(
            self.config.host_port_idle(),
            |cm: &mut CacheManager, sched| {
                let cleared = cm.host_ports.clear_idle(cm.config.host_port_idle());
                if cleared > 0 {
                    debug!(cleared, "idle host:port indexes cleared");
                }
                cm.schedule_clear_host_ports(sched);
            },
        );
    }

    fn schedule_gc(
        &self,
        sched: &mut Scheduler<CacheManager>,
    ) {
        sched.add_timing_task(self.config.gc_interval(), |cm: &mut CacheManager, sched| {
            cm.remove_expired(Instant::now());
            cm.schedule_gc(sched);
        });
    }

    /// Expires unused registry data and the indexes built on it.
    pub fn remove_expired(
        &mut self,
        now: Instant,
    ) -> Vec<ServiceKeyWithType> {
        let Some(registry) = &self.registry else {
            return Vec::new();
        };
        let expired = registry.remove_expired_service_data(now);
        self.host_ports
            .retain_services(|key| registry.is_tracked(key, DataType::Instances));
        if !expired.is_empty() {
            info!(count = expired.len(), "service data expired");
        }
        expired
    }

    /// Waits for the missing slots of `notify`, then hands the completed route
    /// info to `callback`. Completes inline when nothing is missing.
    pub fn add_timeout_watcher(
        &mut self,
        sched: &mut Scheduler<CacheManager>,
        route_info: RouteInfo,
        notify: RouteInfoNotify,
        timeout: Duration,
        callback: WatcherCallback,
    ) {
        self.next_watcher_id += 1;
        let id = self.next_watcher_id;
        let mut watcher = TimeoutWatcher::new(id, route_info, notify, callback);
        if watcher.is_done() {
            watcher.complete();
            return;
        }
        for key in watcher.keys() {
            self.by_key.entry(key.clone()).or_default().insert(id);
        }
        watcher.timer = Some(sched.add_timing_task(timeout, move |cm: &mut CacheManager, _| {
            cm.on_watcher_timeout(id)
        }));
        debug!(watcher = ?watcher, timeout = ?timeout, "route info watcher added");
        self.watchers.insert(id, watcher);
    }

    /// A snapshot for `key` was stored. Completes every watcher left with
    /// nothing to wait for.
    pub fn on_service_data_change(
        &mut self,
        sched: &mut Scheduler<CacheManager>,
        key: &ServiceKeyWithType,
    ) {
        let Some(ids) = self.by_key.remove(key) else {
            return;
        };
        for id in ids {
            let done = match self.watchers.get_mut(&id) {
                Some(watcher) => watcher.on_data_change(key),
                None => continue,
            };
            if !done {
                continue;
            }
            if let Some(watcher) = self.take_watcher(id) {
                if let Some(timer) = watcher.timer {
                    sched.cancel_timing_task(timer);
                }
                watcher.complete();
            }
        }
    }

    fn on_watcher_timeout(
        &mut self,
        id: u64,
    ) {
        if let Some(watcher) = self.take_watcher(id) {
            debug!(watcher = ?watcher, "route info watcher timed out");
            watcher.expire();
        }
    }

    fn take_watcher(
        &mut self,
        id: u64,
    ) -> Option<TimeoutWatcher> {
        let watcher = self.watchers.remove(&id)?;
        for key in watcher.keys() {
            if let Some(ids) = self.by_key.get_mut(key) {
                ids.remove(&id);
                if ids.is_empty() {
                    self.by_key.remove(key);
                }
            }
        }
        Some(watcher)
    }

    /// Loads (`key`, `data_type`) into the registry, reading its backup on
    /// this thread.
    pub fn track_service(
        &self,
        key: &ServiceKey,
        data_type: DataType,
    ) {
        let Some(registry) = &self.registry else {
            return;
        };
        if let Err(e) = registry.load_service_data_with_notify(key, data_type) {
            warn!(service = %key, data_type = %data_type, error = %e, "track service failed");
        }
    }

    pub fn watcher_count(&self) -> usize {
        self.watchers.len()
    }
}

/// Thread-safe front of the cache reactor.
#[derive(Clone, Debug)]
pub struct CacheManagerHandle {
    handle: ReactorHandle<CacheManager>,
}

impl CacheManagerHandle {
    pub fn new(handle: ReactorHandle<CacheManager>) -> Self {
        Self { handle }
    }

    pub fn add_timeout_watcher(
        &self,
        route_info: RouteInfo,
        notify: RouteInfoNotify,
        timeout: Duration,
        callback: WatcherCallback,
    ) -> Result<()> {
        let submitted = self.handle.submit_task(move |cm: &mut CacheManager, sched| {
            cm.add_timeout_watcher(sched, route_info, notify, timeout, callback)
        });
        if submitted {
            Ok(())
        } else {
            Err(DiscoveryError::NotInit("cache manager stopped".to_string()).into())
        }
    }
}

impl ServiceDataChangeSink for CacheManagerHandle {
    fn on_service_data_change(
        &self,
        key: &ServiceKeyWithType,
    ) {
        let key = key.clone();
        self.handle
            .submit_task(move |cm: &mut CacheManager, sched| cm.on_service_data_change(sched, &key));
    }
}

impl ServiceTracker for CacheManagerHandle {
    fn track(
        &self,
        service: &ServiceKey,
        data_type: DataType,
    ) {
        let key = service.clone();
        let submitted = self
            .handle
            .submit_task(move |cm: &mut CacheManager, _| cm.track_service(&key, data_type));
        if !submitted {
            debug!(service = %service, "cache manager stopped, tracking dropped");
        }
    }
}
