//! In-memory registry of discovered snapshots.
//!
//! Consumer threads read and start tracking services here. The connector
//! reactor writes through [`RegistryEventHandler`]. Snapshots are swapped as
//! whole `Arc`s, so readers never observe a partial update.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Weak;
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::CachePersist;
use super::ServiceDataChangeSink;
use crate::metrics::TRACKED_SERVICES;
use crate::DataNotifyFactory;
use crate::DataStatus;
use crate::DataType;
use crate::DiscoveryError;
use crate::RegistryConfig;
use crate::Result;
use crate::RouteInfo;
use crate::RouteInfoNotify;
use crate::RouteSlot;
use crate::ServerConnector;
use crate::Service;
use crate::ServiceData;
use crate::ServiceDataNotify;
use crate::ServiceEventHandler;
use crate::ServiceKey;
use crate::ServiceKeyWithType;

#[derive(Debug)]
struct CacheEntry {
    data: Option<Arc<ServiceData>>,
    access_time: Instant,
    sync_time: Option<Instant>,
}

impl CacheEntry {
    fn new() -> Self {
        Self {
            data: None,
            access_time: Instant::now(),
            sync_time: None,
        }
    }
}

/// Collaborators of a [`LocalRegistry`].
pub struct RegistryDeps {
    pub connector: Arc<dyn ServerConnector>,
    pub persist: Arc<dyn CachePersist>,
    pub change_sink: Arc<dyn ServiceDataChangeSink>,
    pub notify_factory: DataNotifyFactory,
}

pub struct LocalRegistry {
    config: RegistryConfig,
    self_ref: Weak<LocalRegistry>,
    entries: DashMap<ServiceKeyWithType, CacheEntry>,
    /// Creation of a notify and registration of its listener happen under
    /// this lock, so each key is registered exactly once.
    notifies: Mutex<HashMap<ServiceKeyWithType, Arc<ServiceDataNotify>>>,
    services: DashMap<ServiceKey, Arc<Service>>,
    next_service_id: AtomicU32,
    /// Internal services, never expired
    system_services: HashSet<ServiceKey>,
    connector: Arc<dyn ServerConnector>,
    persist: Arc<dyn CachePersist>,
    change_sink: Arc<dyn ServiceDataChangeSink>,
    notify_factory: DataNotifyFactory,
}

impl LocalRegistry {
    pub fn new(
        config: RegistryConfig,
        system_services: impl IntoIterator<Item = ServiceKey>,
        deps: RegistryDeps,
    ) -> Arc<Self> {
        let system_services = system_services.into_iter().collect();
        Arc::new_cyclic(|self_ref| Self {
            config,
            self_ref: self_ref.clone(),
            entries: DashMap::new(),
            notifies: Mutex::new(HashMap::new()),
            services: DashMap::new(),
            next_service_id: AtomicU32::new(0),
            system_services,
            connector: deps.connector,
            persist: deps.persist,
            change_sink: deps.change_sink,
            notify_factory: deps.notify_factory,
        })
    }

    /// Current snapshot of (`key`, `data_type`) plus its notify, starting to
    /// track the key on first use.
    ///
    /// First use creates the notify, loads the disk backup, publishes it if it
    /// is already usable, and registers a connector listener carrying the
    /// backup's revision.
    pub fn load_service_data_with_notify(
        &self,
        key: &ServiceKey,
        data_type: DataType,
    ) -> Result<(Option<Arc<ServiceData>>, Arc<ServiceDataNotify>)> {
        let key_type = ServiceKeyWithType::new(key.clone(), data_type);
        let mut notifies = self.notifies.lock();
        if let Some(notify) = notifies.get(&key_type) {
            let notify = notify.clone();
            drop(notifies);
            return Ok((self.touch(&key_type), notify));
        }

        let notify = Arc::new(ServiceDataNotify::new(
            key.clone(),
            data_type,
            self.notify_factory.create(),
        ));
        notifies.insert(key_type.clone(), notify.clone());

        self.entries
            .entry(key_type.clone())
            .or_insert_with(CacheEntry::new);
        let service = match data_type {
            DataType::Instances => Some(self.get_or_create_service(key)),
            _ => self.service(key),
        };
        let mut data = self.touch(&key_type);
        if data.is_none() {
            if let Some(mut disk) = self.persist.load_service_data(key, data_type) {
                if let Some(service) = &service {
                    service.assign_local_ids(&mut disk);
                }
                let disk = Arc::new(disk);
                self.store(&key_type, Some(disk.clone()));
                data = Some(disk);
            }
        }
        let mut disk_revision = String::new();
        if let Some(disk) = data.as_ref().filter(|d| d.is_available()) {
            notify.publish(disk.clone());
            disk_revision = disk.revision().to_string();
        }

        let handler = RegistryEventHandler {
            registry: self.self_ref.clone(),
        };
        let interval = self.config.refresh_interval_of(&key.namespace, &key.name);
        if let Err(e) = self.connector.register_event_handler(
            key,
            data_type,
            interval,
            &disk_revision,
            Box::new(handler),
        ) {
            notifies.remove(&key_type);
            self.entries
                .remove_if(&key_type, |_, entry| entry.data.is_none());
            warn!(service = %key, data_type = %data_type, error = %e, "register listener failed");
            return Err(e);
        }
        drop(notifies);

        TRACKED_SERVICES.inc();
        info!(
            service = %key,
            data_type = %data_type,
            refresh_interval = ?interval,
            disk_revision = %disk_revision,
            "start tracking service data"
        );
        Ok((data, notify))
    }

    /// Non-blocking read of the current snapshot.
    ///
    /// `ServiceNotFound` when nothing is stored yet, `NotInit` when only an
    /// unavailable disk backup is.
    pub fn get_service_data_with_ref(
        &self,
        key: &ServiceKey,
        data_type: DataType,
    ) -> Result<Arc<ServiceData>> {
        let key_type = ServiceKeyWithType::new(key.clone(), data_type);
        let Some(data) = self.touch(&key_type) else {
            return Err(DiscoveryError::ServiceNotFound(key_type.to_string()).into());
        };
        if data.is_available() || data.is_not_found() {
            return Ok(data);
        }
        Err(DiscoveryError::NotInit(format!("{key_type} only has a backup not usable yet")).into())
    }

    /// Stores a snapshot delivered by the connector, `None` once its listener
    /// is gone.
    pub fn update_service_data(
        &self,
        key: &ServiceKey,
        data_type: DataType,
        data: Option<ServiceData>,
    ) {
        let key_type = ServiceKeyWithType::new(key.clone(), data_type);
        let Some(mut data) = data else {
            // A key tracked again since its listener was removed keeps its entry.
            if !self.notifies.lock().contains_key(&key_type) {
                self.entries.remove(&key_type);
            }
            debug!(service = %key, data_type = %data_type, "listener removed");
            return;
        };

        let service = self.service(key);
        match (&service, data_type) {
            (None, DataType::Instances) => {
                debug!(service = %key, "update for a removed service ignored");
                return;
            }
            (Some(service), _) => {
                service.assign_local_ids(&mut data);
                service.record_data_version(data_type, data.cache_version());
            }
            (None, _) => {}
        }

        let status = data.status();
        let data = Arc::new(data);
        self.store(&key_type, Some(data.clone()));
        let notify = self.notifies.lock().get(&key_type).cloned();
        if let Some(notify) = notify {
            notify.publish(data.clone());
        }
        if status == DataStatus::InitFromDisk {
            return;
        }

        let json = if status == DataStatus::NotFound {
            String::new()
        } else {
            match data.to_json() {
                Ok(json) => json,
                Err(e) => {
                    warn!(service = %key, data_type = %data_type, error = %e, "encode backup failed");
                    String::new()
                }
            }
        };
        self.persist.persist_service_data(key, data_type, json);
        self.change_sink.on_service_data_change(&key_type);
    }

    /// The server confirmed the stored snapshot is current.
    pub fn update_sync_time(
        &self,
        key: &ServiceKey,
        data_type: DataType,
    ) {
        let key_type = ServiceKeyWithType::new(key.clone(), data_type);
        if let Some(mut entry) = self.entries.get_mut(&key_type) {
            entry.sync_time = Some(Instant::now());
        }
        self.persist.update_sync_time(key, data_type);
    }

    /// Last time the server confirmed the snapshot.
    pub fn sync_time(
        &self,
        key: &ServiceKey,
        data_type: DataType,
    ) -> Option<Instant> {
        let key_type = ServiceKeyWithType::new(key.clone(), data_type);
        self.entries.get(&key_type).and_then(|e| e.sync_time)
    }

    /// Drops every entry not accessed since `now - service_expire_time`.
    ///
    /// Expired keys lose their notify, listener, data and backup. An expired
    /// Instances entry takes the RouteRule entry of its service along.
    /// Returns the expired keys.
    pub fn remove_expired_service_data(
        &self,
        now: Instant,
    ) -> Vec<ServiceKeyWithType> {
        let ttl = self.config.service_expire_time();
        let mut expired: Vec<ServiceKeyWithType> = self
            .entries
            .iter()
            .filter(|entry| !self.system_services.contains(&entry.key().key))
            .filter(|entry| now.saturating_duration_since(entry.access_time) >= ttl)
            .map(|entry| entry.key().clone())
            .collect();
        let companions: Vec<ServiceKeyWithType> = expired
            .iter()
            .filter(|k| k.data_type == DataType::Instances)
            .map(|k| ServiceKeyWithType::new(k.key.clone(), DataType::RouteRule))
            .filter(|k| self.entries.contains_key(k) && !expired.contains(k))
            .collect();
        expired.extend(companions);

        for key_type in &expired {
            self.remove_service_data(key_type);
        }
        // Under the notifies lock so a key being loaded keeps its service.
        let notifies = self.notifies.lock();
        self.services.retain(|key, _| {
            DataType::ALL.iter().any(|t| {
                let key_type = ServiceKeyWithType::new(key.clone(), *t);
                notifies.contains_key(&key_type) || self.entries.contains_key(&key_type)
            })
        });
        expired
    }

    fn remove_service_data(
        &self,
        key_type: &ServiceKeyWithType,
    ) {
        let removed = self.notifies.lock().remove(key_type).is_some();
        if removed {
            TRACKED_SERVICES.dec();
            if let Err(e) = self
                .connector
                .deregister_event_handler(&key_type.key, key_type.data_type)
            {
                warn!(service = %key_type.key, data_type = %key_type.data_type, error = %e, "deregister listener failed");
            }
        }
        self.entries.remove(key_type);
        self.persist
            .persist_service_data(&key_type.key, key_type.data_type, String::new());
        info!(service = %key_type.key, data_type = %key_type.data_type, "expired service data removed");
    }

    /// Captures the snapshots already usable into `route_info` and returns
    /// notifies for the remaining slots. The returned notify is empty when
    /// nothing is missing.
    pub fn prepare_route_info(
        &self,
        route_info: &mut RouteInfo,
    ) -> Result<RouteInfoNotify> {
        let mut notify = RouteInfoNotify::new();
        for slot in RouteSlot::ALL {
            let Some(key_type) = route_info.slot_key(slot) else {
                continue;
            };
            if route_info.get(slot).is_some() {
                continue;
            }
            match self.get_service_data_with_ref(&key_type.key, key_type.data_type) {
                Ok(data) if !data.is_not_found() => route_info.set(slot, data),
                _ => {
                    let (data, data_notify) =
                        self.load_service_data_with_notify(&key_type.key, key_type.data_type)?;
                    notify.set_slot(slot, data_notify, data);
                }
            }
        }
        Ok(notify)
    }

    pub fn service(
        &self,
        key: &ServiceKey,
    ) -> Option<Arc<Service>> {
        self.services.get(key).map(|s| s.clone())
    }

    /// Cache version of the stored snapshot, 0 when there is none.
    pub fn cache_version(
        &self,
        key: &ServiceKey,
        data_type: DataType,
    ) -> u64 {
        let key_type = ServiceKeyWithType::new(key.clone(), data_type);
        self.entries
            .get(&key_type)
            .and_then(|e| e.data.as_ref().map(|d| d.cache_version()))
            .unwrap_or(0)
    }

    pub fn is_tracked(
        &self,
        key: &ServiceKey,
        data_type: DataType,
    ) -> bool {
        let key_type = ServiceKeyWithType::new(key.clone(), data_type);
        self.notifies.lock().contains_key(&key_type)
    }

    pub fn tracked_keys(&self) -> Vec<ServiceKeyWithType> {
        let mut keys: Vec<ServiceKeyWithType> = self.notifies.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    fn get_or_create_service(
        &self,
        key: &ServiceKey,
    ) -> Arc<Service> {
        self.services
            .entry(key.clone())
            .or_insert_with(|| {
                let id = self.next_service_id.fetch_add(1, Ordering::Relaxed) + 1;
                Arc::new(Service::new(key.clone(), id))
            })
            .clone()
    }

    /// Current data of the entry, refreshing its access time.
    fn touch(
        &self,
        key_type: &ServiceKeyWithType,
    ) -> Option<Arc<ServiceData>> {
        let mut entry = self.entries.get_mut(key_type)?;
        entry.access_time = Instant::now();
        entry.data.clone()
    }

    fn store(
        &self,
        key_type: &ServiceKeyWithType,
        data: Option<Arc<ServiceData>>,
    ) {
        let mut entry = self
            .entries
            .entry(key_type.clone())
            .or_insert_with(CacheEntry::new);
        entry.data = data;
    }
}

/// Connector listener writing into the registry.
pub struct RegistryEventHandler {
    registry: Weak<LocalRegistry>,
}

impl ServiceEventHandler for RegistryEventHandler {
    fn on_event_update(
        &self,
        key: &ServiceKey,
        data_type: DataType,
        data: Option<ServiceData>,
    ) {
        if let Some(registry) = self.registry.upgrade() {
            registry.update_service_data(key, data_type, data);
        }
    }

    fn on_event_sync(
        &self,
        key: &ServiceKey,
        data_type: DataType,
    ) {
        if let Some(registry) = self.registry.upgrade() {
            registry.update_sync_time(key, data_type);
        }
    }
}
