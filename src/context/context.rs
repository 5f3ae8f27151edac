use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use tracing::debug;
use tracing::info;

use super::ContextBuilder;
use crate::proto;
use crate::reactor::ReactorThread;
use crate::CacheManager;
use crate::CacheManagerHandle;
use crate::CallResult;
use crate::CallResultReporter;
use crate::CallStatus;
use crate::ClientConfig;
use crate::ConnectorHandle;
use crate::DataType;
use crate::DiscoverConnector;
use crate::DiscoveryError;
use crate::FilePersist;
use crate::HostPort;
use crate::HostPortIndex;
use crate::LocalRegistry;
use crate::Result;
use crate::ReturnCode;
use crate::RouteInfo;
use crate::ServiceData;
use crate::ServiceKey;
use crate::WatcherCallback;

/// Instance a call result is reported against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceRef {
    Id(String),
    Endpoint(HostPort),
}

/// Outcome of one consumer call to a service instance.
#[derive(Debug, Clone)]
pub struct ServiceCallResult {
    pub service: ServiceKey,
    pub instance: InstanceRef,
    pub code: i32,
    pub status: CallStatus,
    pub delay: Duration,
}

pub struct Context {
    config: ClientConfig,
    registry: Arc<LocalRegistry>,
    host_ports: Arc<HostPortIndex>,
    reporter: Arc<dyn CallResultReporter>,
    connector: ConnectorHandle,
    cache: CacheManagerHandle,
    connector_thread: ReactorThread<DiscoverConnector>,
    cache_thread: ReactorThread<CacheManager>,
    file_persist: Option<Arc<FilePersist>>,
    stopped: AtomicBool,
}

impl Context {
    pub fn builder(config: ClientConfig) -> ContextBuilder {
        ContextBuilder::new(config)
    }

    #[allow(clippy::too_many_arguments)]
    pub(super) fn new(
        config: ClientConfig,
        registry: Arc<LocalRegistry>,
        host_ports: Arc<HostPortIndex>,
        reporter: Arc<dyn CallResultReporter>,
        connector: ConnectorHandle,
        cache: CacheManagerHandle,
        connector_thread: ReactorThread<DiscoverConnector>,
        cache_thread: ReactorThread<CacheManager>,
        file_persist: Option<Arc<FilePersist>>,
    ) -> Self {
        Self {
            config,
            registry,
            host_ports,
            reporter,
            connector,
            cache,
            connector_thread,
            cache_thread,
            file_persist,
            stopped: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<LocalRegistry> {
        &self.registry
    }

    pub fn connector(&self) -> &ConnectorHandle {
        &self.connector
    }

    /// Snapshot of (`key`, `data_type`), waiting up to `timeout` for the
    /// first one. A backup not yet usable is returned once the wait times out.
    ///
    /// Fails with `ServiceNotFound` when the server reported the service
    /// missing.
    pub fn get_service_data(
        &self,
        key: &ServiceKey,
        data_type: DataType,
        timeout: Duration,
    ) -> Result<Arc<ServiceData>> {
        self.check_running()?;
        let deadline = Instant::now() + timeout;
        let (data, notify) = self.registry.load_service_data_with_notify(key, data_type)?;
        let data = match data {
            Some(data) if data.is_available() => data,
            disk => notify.wait_data_with_ref_until(deadline, disk.as_ref())?,
        };
        if data.is_not_found() {
            return Err(DiscoveryError::ServiceNotFound(key.to_string()).into());
        }
        Ok(data)
    }

    /// Fills every slot of `route_info`, blocking up to `timeout`.
    pub fn prepare_route_info(
        &self,
        mut route_info: RouteInfo,
        timeout: Duration,
    ) -> Result<RouteInfo> {
        self.check_running()?;
        let deadline = Instant::now() + timeout;
        let mut notify = self.registry.prepare_route_info(&mut route_info)?;
        if notify.is_empty() {
            return Ok(route_info);
        }
        if !notify.is_data_ready(false) {
            notify.wait_data(deadline)?;
        }
        notify.set_data_to_route_info(&mut route_info)?;
        Ok(route_info)
    }

    /// Non-blocking form of [`Context::prepare_route_info`]. `callback` runs on
    /// the caller's thread when nothing is missing, on the cache thread
    /// otherwise.
    pub fn async_prepare_route_info(
        &self,
        mut route_info: RouteInfo,
        timeout: Duration,
        callback: WatcherCallback,
    ) -> Result<()> {
        self.check_running()?;
        let notify = self.registry.prepare_route_info(&mut route_info)?;
        if notify.is_empty() {
            callback(Ok(route_info));
            return Ok(());
        }
        self.cache
            .add_timeout_watcher(route_info, notify, timeout, callback)
    }

    pub fn get_instance_id(
        &self,
        key: &ServiceKey,
        host: &str,
        port: u16,
    ) -> Result<String> {
        self.host_ports
            .get_instance_id(&self.registry, key, host, port)
    }

    /// Feeds a consumer call result to the health monitor.
    pub fn update_service_call_result(
        &self,
        result: ServiceCallResult,
    ) -> Result<()> {
        let instance = match &result.instance {
            InstanceRef::Endpoint(endpoint) => {
                self.get_instance_id(&result.service, &endpoint.host, endpoint.port)?;
                endpoint.clone()
            }
            InstanceRef::Id(id) => {
                let data = self
                    .registry
                    .get_service_data_with_ref(&result.service, DataType::Instances)?;
                data.instances()
                    .and_then(|instances| instances.get(id))
                    .map(|instance| instance.endpoint())
                    .ok_or_else(|| {
                        DiscoveryError::InstanceNotFound(format!("{id} in service {}", result.service))
                    })?
            }
        };
        debug!(
            service = %result.service,
            instance = %instance,
            code = result.code,
            status = ?result.status,
            "service call result"
        );
        self.reporter.report(CallResult {
            service: Some(result.service),
            instance,
            code: result.code,
            status: result.status,
            delay: result.delay,
        });
        Ok(())
    }

    pub fn register_instance(
        &self,
        instance: proto::Instance,
        timeout: Duration,
    ) -> Result<String> {
        self.connector.register_instance(instance, timeout)
    }

    pub fn deregister_instance(
        &self,
        instance: proto::Instance,
        timeout: Duration,
    ) -> Result<()> {
        self.connector.deregister_instance(instance, timeout)
    }

    pub fn instance_heartbeat(
        &self,
        instance: proto::Instance,
        timeout: Duration,
    ) -> Result<()> {
        self.connector.instance_heartbeat(instance, timeout)
    }

    pub fn async_instance_heartbeat<F>(
        &self,
        instance: proto::Instance,
        timeout: Duration,
        callback: F,
    ) -> Result<()>
    where
        F: FnOnce(ReturnCode, String, Option<proto::Response>) + Send + 'static,
    {
        self.connector
            .async_instance_heartbeat(instance, timeout, callback)
    }

    pub fn async_report_client<F>(
        &self,
        host: &str,
        timeout: Duration,
        callback: F,
    ) -> Result<()>
    where
        F: FnOnce(ReturnCode, String, Option<proto::Response>) + Send + 'static,
    {
        self.connector
            .async_report_client(host, env!("CARGO_PKG_VERSION"), timeout, callback)
    }

    /// Cache version of the stored snapshot, 0 when there is none.
    pub fn cache_version(
        &self,
        key: &ServiceKey,
        data_type: DataType,
    ) -> u64 {
        self.registry.cache_version(key, data_type)
    }

    /// Stops and joins every thread. Later calls do nothing.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.connector_thread.stop_and_join();
        self.cache_thread.stop_and_join();
        if let Some(persist) = &self.file_persist {
            persist.stop();
        }
        info!("discovery context stopped");
    }

    fn check_running(&self) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(DiscoveryError::NotInit("context stopped".to_string()).into());
        }
        Ok(())
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.stop();
    }
}
