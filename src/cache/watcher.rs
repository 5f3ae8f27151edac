//! Asynchronous wait for every dataset of one [`RouteInfo`].

use std::fmt;

use crate::reactor::TimerHandle;
use crate::DiscoveryError;
use crate::Result;
use crate::RouteInfo;
use crate::RouteInfoNotify;
use crate::RouteSlot;
use crate::ServiceKeyWithType;

/// Receives the prepared route info, or the reason it could not be prepared.
pub type WatcherCallback = Box<dyn FnOnce(Result<RouteInfo>) + Send>;

/// Pending async preparation of a route info, owned by the cache manager.
///
/// `wait_flags` holds one bit per slot still missing data. Each change event
/// for a slot's key clears its bit. The watcher completes once no bit is left,
/// or when its timer fires, whichever comes first.
pub struct TimeoutWatcher {
    pub(crate) id: u64,
    route_info: RouteInfo,
    notify: RouteInfoNotify,
    wait_flags: u8,
    slots: Vec<(RouteSlot, ServiceKeyWithType)>,
    pub(crate) timer: Option<TimerHandle>,
    callback: WatcherCallback,
}

impl TimeoutWatcher {
    pub(crate) fn new(
        id: u64,
        route_info: RouteInfo,
        notify: RouteInfoNotify,
        callback: WatcherCallback,
    ) -> Self {
        let slots: Vec<(RouteSlot, ServiceKeyWithType)> = notify
            .pending_slots()
            .into_iter()
            .filter_map(|slot| route_info.slot_key(slot).map(|key| (slot, key)))
            .collect();
        let wait_flags = slots.iter().fold(0, |flags, (slot, _)| flags | slot.flag());
        Self {
            id,
            route_info,
            notify,
            wait_flags,
            slots,
            timer: None,
            callback,
        }
    }

    pub fn wait_flags(&self) -> u8 {
        self.wait_flags
    }

    pub fn is_done(&self) -> bool {
        self.wait_flags == 0
    }

    /// Keys this watcher still waits for.
    pub(crate) fn keys(&self) -> impl Iterator<Item = &ServiceKeyWithType> {
        self.slots
            .iter()
            .filter(|(slot, _)| self.wait_flags & slot.flag() != 0)
            .map(|(_, key)| key)
    }

    /// Clears the bits of every slot backed by `key`. Returns whether the
    /// watcher is done.
    pub(crate) fn on_data_change(
        &mut self,
        key: &ServiceKeyWithType,
    ) -> bool {
        for (slot, slot_key) in &self.slots {
            if slot_key == key {
                self.wait_flags &= !slot.flag();
            }
        }
        self.is_done()
    }

    /// Completes with the resolved data.
    pub(crate) fn complete(mut self) {
        let result = self
            .notify
            .set_data_to_route_info(&mut self.route_info)
            .map(|_| self.route_info);
        (self.callback)(result);
    }

    /// Completes at the deadline. Disk backups count as data here.
    pub(crate) fn expire(self) {
        if self.notify.is_data_ready(true) {
            return self.complete();
        }
        let service = self.route_info.service_key().to_string();
        (self.callback)(Err(DiscoveryError::Timeout(format!(
            "prepare route info of service {service}"
        ))
        .into()));
    }
}

impl fmt::Debug for TimeoutWatcher {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("TimeoutWatcher")
            .field("id", &self.id)
            .field("service", self.route_info.service_key())
            .field("wait_flags", &self.wait_flags)
            .finish()
    }
}
