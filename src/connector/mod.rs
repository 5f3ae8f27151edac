//! Discovery server connector.
//!
//! All connector state lives in a [`DiscoverConnector`] owned by its reactor
//! thread. Other threads reach it only through a [`ConnectorHandle`], which
//! turns every call into a reactor task.

mod discover;
mod grpc;
mod listener;
mod request;
mod selector;
mod server_code;
mod timeout_strategy;
mod transport;

pub use discover::DiscoverConnector;
pub use discover::StreamState;
pub use discover::SwitchState;
pub use grpc::*;
pub use listener::ServiceEventHandler;
pub use request::RequestCallback;
pub use selector::*;
pub use server_code::*;
pub use timeout_strategy::*;
pub use transport::*;

#[cfg(test)]
mod discover_test;

use std::time::Duration;
use std::time::Instant;

use crate::proto;
use crate::proto::code;
use crate::reactor::ReactorHandle;
use crate::reactor::Scheduler;
use crate::DataType;
use crate::DiscoveryError;
use crate::Error;
use crate::Result;
use crate::ReturnCode;
use crate::ServiceKey;
use crate::ServiceKeyWithType;

/// What the registry needs from the connector.
pub trait ServerConnector: Send + Sync + 'static {
    /// Starts discovering (`key`, `data_type`). `disk_revision` is the revision
    /// of a usable backup, empty if there is none.
    fn register_event_handler(
        &self,
        key: &ServiceKey,
        data_type: DataType,
        sync_interval: Duration,
        disk_revision: &str,
        handler: Box<dyn ServiceEventHandler>,
    ) -> Result<()>;

    /// Stops discovering. The handler gets one final `on_event_update(None)`.
    fn deregister_event_handler(
        &self,
        key: &ServiceKey,
        data_type: DataType,
    ) -> Result<()>;
}

/// Thread-safe front of the connector reactor.
#[derive(Clone, Debug)]
pub struct ConnectorHandle {
    handle: ReactorHandle<DiscoverConnector>,
}

impl ConnectorHandle {
    pub fn new(handle: ReactorHandle<DiscoverConnector>) -> Self {
        Self { handle }
    }

    fn submit<F>(
        &self,
        task: F,
    ) -> Result<()>
    where
        F: FnOnce(&mut DiscoverConnector, &mut Scheduler<DiscoverConnector>) + Send + 'static,
    {
        if self.handle.submit_task(task) {
            Ok(())
        } else {
            Err(DiscoveryError::NotInit("connector stopped".to_string()).into())
        }
    }

    /// Registers an instance, returning its id. An instance that already
    /// exists is not an error.
    pub fn register_instance(
        &self,
        instance: proto::Instance,
        timeout: Duration,
    ) -> Result<String> {
        let response = self.block_request(UnaryRequest::Register(instance), timeout)?;
        match code::to_return_code(response.code) {
            ReturnCode::Ok | ReturnCode::ExistedResource => {
                Ok(response.instance.map(|i| i.id).unwrap_or_default())
            }
            code => Err(return_code_error(code, response.info)),
        }
    }

    pub fn deregister_instance(
        &self,
        instance: proto::Instance,
        timeout: Duration,
    ) -> Result<()> {
        let response = self.block_request(UnaryRequest::Deregister(instance), timeout)?;
        check_response(response)
    }

    pub fn instance_heartbeat(
        &self,
        instance: proto::Instance,
        timeout: Duration,
    ) -> Result<()> {
        let response = self.block_request(UnaryRequest::Heartbeat(instance), timeout)?;
        check_response(response)
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
        self.async_request(UnaryRequest::Heartbeat(instance), timeout, Box::new(callback))
    }

    /// Reports this client's host to the server.
    pub fn async_report_client<F>(
        &self,
        host: &str,
        version: &str,
        timeout: Duration,
        callback: F,
    ) -> Result<()>
    where
        F: FnOnce(ReturnCode, String, Option<proto::Response>) + Send + 'static,
    {
        if host.is_empty() {
            return Err(DiscoveryError::InvalidArgument("report client with empty host".to_string()).into());
        }
        let client = proto::Client {
            host: host.to_string(),
            r#type: proto::ClientType::Sdk as i32,
            version: version.to_string(),
        };
        self.async_request(UnaryRequest::ReportClient(client), timeout, Box::new(callback))
    }

    fn block_request(
        &self,
        request: UnaryRequest,
        timeout: Duration,
    ) -> Result<proto::Response> {
        if timeout.is_zero() {
            return Err(DiscoveryError::InvalidArgument(format!(
                "{} request with zero timeout",
                request.kind()
            ))
            .into());
        }
        let kind = request.kind();
        let deadline = Instant::now() + timeout;
        let (reply, outcome) = crossbeam_channel::bounded(1);
        self.submit(move |conn, sched| conn.submit_block_request(sched, request, deadline, reply))?;
        match outcome.recv_deadline(deadline) {
            Ok(outcome) => outcome.map_err(Error::from),
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                Err(DiscoveryError::Timeout(format!("{kind} request timed out")).into())
            }
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                Err(DiscoveryError::NetworkFailed(format!("{kind} request dropped by connector")).into())
            }
        }
    }

    fn async_request(
        &self,
        request: UnaryRequest,
        timeout: Duration,
        callback: RequestCallback,
    ) -> Result<()> {
        if timeout.is_zero() {
            return Err(DiscoveryError::InvalidArgument(format!(
                "{} request with zero timeout",
                request.kind()
            ))
            .into());
        }
        let deadline = Instant::now() + timeout;
        self.submit(move |conn, sched| conn.submit_async_request(sched, request, deadline, callback))
    }
}

impl ServerConnector for ConnectorHandle {
    fn register_event_handler(
        &self,
        key: &ServiceKey,
        data_type: DataType,
        sync_interval: Duration,
        disk_revision: &str,
        handler: Box<dyn ServiceEventHandler>,
    ) -> Result<()> {
        let key = ServiceKeyWithType::new(key.clone(), data_type);
        let disk_revision = disk_revision.to_string();
        self.submit(move |conn, sched| conn.add_listener(sched, key, sync_interval, disk_revision, handler))
    }

    fn deregister_event_handler(
        &self,
        key: &ServiceKey,
        data_type: DataType,
    ) -> Result<()> {
        let key = ServiceKeyWithType::new(key.clone(), data_type);
        self.submit(move |conn, sched| conn.remove_listener(sched, &key))
    }
}

fn check_response(response: proto::Response) -> Result<()> {
    match code::to_return_code(response.code) {
        ReturnCode::Ok => Ok(()),
        code => Err(return_code_error(code, response.info)),
    }
}

pub(crate) fn return_code_error(
    code: ReturnCode,
    message: String,
) -> Error {
    DiscoveryError::from_return_code(code, message)
        .unwrap_or_else(|| DiscoveryError::ServerError("unexpected ok code".to_string()))
        .into()
}
