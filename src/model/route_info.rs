//! Datasets one routed request needs, and the multi-key wait over them.

use std::sync::Arc;
use std::time::Instant;

use tracing::error;

use super::DataType;
use super::ServiceData;
use super::ServiceDataNotify;
use super::ServiceKey;
use super::ServiceKeyWithType;
use crate::DiscoveryError;
use crate::Result;

/// One of the three datasets a request may wait for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteSlot {
    DstInstances,
    DstRouteRule,
    SrcRouteRule,
}

impl RouteSlot {
    pub const ALL: [RouteSlot; 3] = [
        RouteSlot::DstInstances,
        RouteSlot::DstRouteRule,
        RouteSlot::SrcRouteRule,
    ];

    /// Bit of this slot in a wait mask.
    pub fn flag(&self) -> u8 {
        match self {
            RouteSlot::DstInstances => 1,
            RouteSlot::DstRouteRule => 2,
            RouteSlot::SrcRouteRule => 4,
        }
    }

    pub fn data_type(&self) -> DataType {
        match self {
            RouteSlot::DstInstances => DataType::Instances,
            RouteSlot::DstRouteRule | RouteSlot::SrcRouteRule => DataType::RouteRule,
        }
    }

    fn index(&self) -> usize {
        match self {
            RouteSlot::DstInstances => 0,
            RouteSlot::DstRouteRule => 1,
            RouteSlot::SrcRouteRule => 2,
        }
    }
}

/// Destination service, optional source service, and the snapshots
/// resolved for them.
#[derive(Debug, Clone)]
pub struct RouteInfo {
    service_key: ServiceKey,
    source_key: Option<ServiceKey>,
    route_rule_enabled: bool,
    instances: Option<Arc<ServiceData>>,
    route_rule: Option<Arc<ServiceData>>,
    source_route_rule: Option<Arc<ServiceData>>,
}

impl RouteInfo {
    pub fn new(service_key: ServiceKey) -> Self {
        Self {
            service_key,
            source_key: None,
            route_rule_enabled: true,
            instances: None,
            route_rule: None,
            source_route_rule: None,
        }
    }

    /// Source service whose outbound rules apply. Ignored when its name is empty.
    pub fn with_source(
        mut self,
        source_key: ServiceKey,
    ) -> Self {
        if !source_key.name.is_empty() {
            self.source_key = Some(source_key);
        }
        self
    }

    /// Only instances are needed, no rule routing.
    pub fn without_route_rule(mut self) -> Self {
        self.route_rule_enabled = false;
        self
    }

    pub fn service_key(&self) -> &ServiceKey {
        &self.service_key
    }

    pub fn source_key(&self) -> Option<&ServiceKey> {
        self.source_key.as_ref()
    }

    pub fn is_route_rule_enabled(&self) -> bool {
        self.route_rule_enabled
    }

    /// Key and data type behind `slot`, `None` when the slot is not needed.
    pub fn slot_key(
        &self,
        slot: RouteSlot,
    ) -> Option<ServiceKeyWithType> {
        let key = match slot {
            RouteSlot::DstInstances => Some(&self.service_key),
            RouteSlot::DstRouteRule if self.route_rule_enabled => Some(&self.service_key),
            RouteSlot::SrcRouteRule if self.route_rule_enabled => self.source_key.as_ref(),
            _ => None,
        }?;
        Some(ServiceKeyWithType::new(key.clone(), slot.data_type()))
    }

    pub fn get(
        &self,
        slot: RouteSlot,
    ) -> Option<&Arc<ServiceData>> {
        match slot {
            RouteSlot::DstInstances => self.instances.as_ref(),
            RouteSlot::DstRouteRule => self.route_rule.as_ref(),
            RouteSlot::SrcRouteRule => self.source_route_rule.as_ref(),
        }
    }

    /// Pre-resolved snapshots are kept as they are by the preparation step.
    pub fn set(
        &mut self,
        slot: RouteSlot,
        data: Arc<ServiceData>,
    ) {
        match slot {
            RouteSlot::DstInstances => self.instances = Some(data),
            RouteSlot::DstRouteRule => self.route_rule = Some(data),
            RouteSlot::SrcRouteRule => self.source_route_rule = Some(data),
        }
    }

    pub fn instances(&self) -> Option<&Arc<ServiceData>> {
        self.instances.as_ref()
    }

    pub fn route_rule(&self) -> Option<&Arc<ServiceData>> {
        self.route_rule.as_ref()
    }

    pub fn source_route_rule(&self) -> Option<&Arc<ServiceData>> {
        self.source_route_rule.as_ref()
    }
}

#[derive(Debug)]
struct NotifySlot {
    notify: Arc<ServiceDataNotify>,
    /// Snapshot known so far, possibly an unavailable disk backup
    data: Option<Arc<ServiceData>>,
}

impl NotifySlot {
    fn current(&self) -> Option<Arc<ServiceData>> {
        self.notify.data().or_else(|| self.data.clone())
    }
}

/// Slots of a [`RouteInfo`] whose data was not ready when it was prepared.
#[derive(Debug, Default)]
pub struct RouteInfoNotify {
    slots: [Option<NotifySlot>; 3],
    all_ready: bool,
}

impl RouteInfoNotify {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_slot(
        &mut self,
        slot: RouteSlot,
        notify: Arc<ServiceDataNotify>,
        data: Option<Arc<ServiceData>>,
    ) {
        self.slots[slot.index()] = Some(NotifySlot { notify, data });
        self.all_ready = false;
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }

    pub fn has_slot(
        &self,
        slot: RouteSlot,
    ) -> bool {
        self.slots[slot.index()].is_some()
    }

    /// True when every slot has data, counting unavailable disk backups only
    /// if `use_disk_data` is set.
    pub fn is_data_ready(
        &self,
        use_disk_data: bool,
    ) -> bool {
        if self.all_ready {
            return true;
        }
        self.slots.iter().flatten().all(|slot| match slot.current() {
            None => false,
            Some(data) => use_disk_data || data.is_available(),
        })
    }

    /// Slots still waiting for usable data.
    pub fn pending_slots(&self) -> Vec<RouteSlot> {
        RouteSlot::ALL
            .into_iter()
            .filter(|slot| {
                self.slots[slot.index()]
                    .as_ref()
                    .map(|s| s.current().map(|d| !d.is_available()).unwrap_or(true))
                    .unwrap_or(false)
            })
            .collect()
    }

    /// Blocks on each missing slot in turn, all sharing `deadline`.
    pub fn wait_data(
        &mut self,
        deadline: Instant,
    ) -> Result<()> {
        for slot in self.slots.iter_mut().flatten() {
            let ready = slot
                .current()
                .map(|d| d.is_available())
                .unwrap_or(false);
            if ready {
                continue;
            }
            let data = slot
                .notify
                .wait_data_with_ref_until(deadline, slot.data.as_ref())?;
            slot.data = Some(data);
        }
        self.all_ready = true;
        Ok(())
    }

    /// Moves the resolved snapshots into `route_info`.
    ///
    /// Fails with `ServiceNotFound` when the server reported any of them missing.
    pub fn set_data_to_route_info(
        &self,
        route_info: &mut RouteInfo,
    ) -> Result<()> {
        for slot in RouteSlot::ALL {
            let Some(state) = &self.slots[slot.index()] else {
                continue;
            };
            let Some(data) = state.current() else {
                continue;
            };
            if data.is_not_found() {
                error!(
                    service = %data.key(),
                    data_type = %data.data_type(),
                    "discover {:?} with service not found",
                    slot
                );
                return Err(DiscoveryError::ServiceNotFound(data.key().to_string()).into());
            }
            route_info.set(slot, data);
        }
        Ok(())
    }
}
