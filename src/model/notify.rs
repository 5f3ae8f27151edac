//! Blocking hand-off of published snapshots to consumer threads.
//!
//! A [`ServiceDataNotify`] exists per tracked (service, data type). The reactor
//! publishes into it, consumer threads block on it with an absolute deadline.
//! Wake-ups are generation based: a waiter samples the generation before it
//! checks the data, so a publish that lands in between is never missed.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Condvar;
use parking_lot::Mutex;

use super::DataStatus;
use super::DataType;
use super::ServiceData;
use super::ServiceKey;
use crate::DiscoveryError;
use crate::Result;

/// Wake-up primitive behind a [`ServiceDataNotify`].
pub trait DataNotify: Send + Sync {
    /// Current generation, bumped by every [`DataNotify::notify`].
    fn generation(&self) -> u64;

    /// Bumps the generation and wakes every waiter.
    fn notify(&self);

    /// Blocks until the generation differs from `seen` or `deadline` passes.
    /// Returns whether the generation changed.
    fn wait_until(
        &self,
        seen: u64,
        deadline: Instant,
    ) -> bool;
}

/// Mutex plus condition variable, the default [`DataNotify`].
#[derive(Debug, Default)]
pub struct CondvarDataNotify {
    generation: Mutex<u64>,
    cond: Condvar,
}

impl DataNotify for CondvarDataNotify {
    fn generation(&self) -> u64 {
        *self.generation.lock()
    }

    fn notify(&self) {
        let mut generation = self.generation.lock();
        *generation = generation.wrapping_add(1);
        self.cond.notify_all();
    }

    fn wait_until(
        &self,
        seen: u64,
        deadline: Instant,
    ) -> bool {
        let mut generation = self.generation.lock();
        while *generation == seen {
            if self.cond.wait_until(&mut generation, deadline).timed_out() {
                return *generation != seen;
            }
        }
        true
    }
}

/// Constructor of [`DataNotify`] objects handed to the registry.
#[derive(Clone)]
pub struct DataNotifyFactory(Arc<dyn Fn() -> Box<dyn DataNotify> + Send + Sync>);

impl DataNotifyFactory {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn() -> Box<dyn DataNotify> + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub fn create(&self) -> Box<dyn DataNotify> {
        (self.0)()
    }
}

impl Default for DataNotifyFactory {
    fn default() -> Self {
        Self::new(|| Box::new(CondvarDataNotify::default()))
    }
}

impl fmt::Debug for DataNotifyFactory {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.write_str("DataNotifyFactory")
    }
}

/// Latest published snapshot of one (service, data type) plus its waiters.
pub struct ServiceDataNotify {
    key: ServiceKey,
    data_type: DataType,
    data: Mutex<Option<Arc<ServiceData>>>,
    notify: Box<dyn DataNotify>,
}

impl ServiceDataNotify {
    pub fn new(
        key: ServiceKey,
        data_type: DataType,
        notify: Box<dyn DataNotify>,
    ) -> Self {
        Self {
            key,
            data_type,
            data: Mutex::new(None),
            notify,
        }
    }

    pub fn key(&self) -> &ServiceKey {
        &self.key
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    /// Latest published snapshot, if any.
    pub fn data(&self) -> Option<Arc<ServiceData>> {
        self.data.lock().clone()
    }

    /// Replaces the published snapshot and wakes every waiter.
    pub fn publish(
        &self,
        data: Arc<ServiceData>,
    ) {
        *self.data.lock() = Some(data);
        self.notify.notify();
    }

    /// Waits for a published snapshot until `deadline`.
    ///
    /// `disk` is a backup snapshot loaded earlier. It is returned before the
    /// deadline once it becomes available, and at the deadline regardless of
    /// availability, so a server outage degrades to stale data instead of a
    /// timeout.
    pub fn wait_data_with_ref_until(
        &self,
        deadline: Instant,
        disk: Option<&Arc<ServiceData>>,
    ) -> Result<Arc<ServiceData>> {
        let disk = disk.filter(|d| d.status() == DataStatus::InitFromDisk);
        loop {
            let seen = self.notify.generation();
            if let Some(data) = self.data() {
                return Ok(data);
            }
            if let Some(disk) = disk {
                if disk.is_available() {
                    return Ok(disk.clone());
                }
            }
            if Instant::now() >= deadline {
                break;
            }
            self.notify.wait_until(seen, deadline);
        }

        match disk {
            Some(disk) => Ok(disk.clone()),
            None => Err(DiscoveryError::Timeout(format!(
                "wait {} data of service {}",
                self.data_type, self.key
            ))
            .into()),
        }
    }
}

impl fmt::Debug for ServiceDataNotify {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("ServiceDataNotify")
            .field("key", &self.key)
            .field("data_type", &self.data_type)
            .field("has_data", &self.data.lock().is_some())
            .finish()
    }
}
