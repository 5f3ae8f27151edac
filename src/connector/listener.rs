use std::time::Duration;
use std::time::Instant;

use crate::proto::code;
use crate::reactor::TimerHandle;
use crate::DataType;
use crate::ServiceData;
use crate::ServiceKey;
use crate::ServiceKeyWithType;

/// Receiver of discover results for one (service, data type).
///
/// Called on the connector thread, implementations must not block.
pub trait ServiceEventHandler: Send + 'static {
    /// New data for the key, `None` once the listener is removed.
    fn on_event_update(
        &self,
        key: &ServiceKey,
        data_type: DataType,
        data: Option<ServiceData>,
    );

    /// The server confirmed the data is unchanged.
    fn on_event_sync(
        &self,
        key: &ServiceKey,
        data_type: DataType,
    );
}

/// Discover state of one registered (service, data type).
///
/// `id` is unique for the lifetime of the connector, so a timer armed for a
/// listener that was removed and registered again never acts on the new one.
pub(crate) struct ServiceListener {
    pub(crate) id: u64,
    pub(crate) key: ServiceKeyWithType,
    pub(crate) sync_interval: Duration,
    pub(crate) handler: Box<dyn ServiceEventHandler>,
    pub(crate) revision: String,
    /// Last response code, 0 before the first response
    pub(crate) ret_code: u32,
    /// 0 until the first update was published
    pub(crate) cache_version: u64,
    pub(crate) sent_at: Option<Instant>,
    pub(crate) discover_timer: Option<TimerHandle>,
    pub(crate) timeout_timer: Option<TimerHandle>,
}

impl ServiceListener {
    pub(crate) fn new(
        id: u64,
        key: ServiceKeyWithType,
        sync_interval: Duration,
        disk_revision: String,
        handler: Box<dyn ServiceEventHandler>,
    ) -> Self {
        Self {
            id,
            key,
            sync_interval,
            handler,
            revision: disk_revision,
            ret_code: 0,
            cache_version: 0,
            sent_at: None,
            discover_timer: None,
            timeout_timer: None,
        }
    }

    /// Records a response and decides whether it carries new data.
    ///
    /// The first response for a listener is always an update, even if its
    /// revision matches the one loaded from disk. Afterwards an unchanged
    /// (code, revision) pair is only a sync. On update the listener takes the
    /// next value of the connector-wide `last_cache_version`.
    pub(crate) fn update_revision(
        &mut self,
        response_code: u32,
        revision: &str,
        last_cache_version: &mut u64,
    ) -> bool {
        if response_code == code::DATA_NO_CHANGE {
            self.ret_code = response_code;
            return false;
        }
        let first = self.cache_version == 0;
        if response_code == code::EXECUTE_SUCCESS {
            if !first && self.ret_code == response_code && self.revision == revision {
                return false;
            }
            self.revision = revision.to_string();
        } else {
            if !first && self.ret_code == response_code {
                return false;
            }
            self.revision.clear();
        }
        self.ret_code = response_code;
        *last_cache_version += 1;
        self.cache_version = *last_cache_version;
        true
    }
}
