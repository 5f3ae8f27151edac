//! Hand-written fakes for seams whose calls must be replayed later in a test,
//! which mockall expectations cannot do.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::proto;
use crate::CachePersist;
use crate::CallResult;
use crate::CallResultReporter;
use crate::DataNotifyFactory;
use crate::DataType;
use crate::DiscoverStream;
use crate::HostPort;
use crate::LocalRegistry;
use crate::RegistryConfig;
use crate::RegistryDeps;
use crate::ServiceData;
use crate::Result;
use crate::ServerConnector;
use crate::ServiceDataChangeSink;
use crate::ServiceEventHandler;
use crate::ServiceKey;
use crate::ServiceKeyWithType;
use crate::StreamEvent;
use crate::StreamSink;
use crate::Transport;
use crate::TransportError;
use crate::UnaryCallback;
use crate::UnaryRequest;

pub(crate) struct OpenedStream {
    pub(crate) addr: HostPort,
    pub(crate) connect_timeout: Duration,
    sink: StreamSink,
    sent: Arc<Mutex<Vec<proto::DiscoverRequest>>>,
}

pub(crate) struct UnaryCall {
    pub(crate) addr: HostPort,
    pub(crate) request: UnaryRequest,
    pub(crate) timeout: Duration,
    pub(crate) done: UnaryCallback,
}

/// Transport that records every stream and unary call. Tests drive the
/// stream side by emitting events into the recorded sinks.
#[derive(Default)]
pub(crate) struct FakeTransport {
    streams: Mutex<Vec<OpenedStream>>,
    unary: Mutex<Vec<UnaryCall>>,
}

impl FakeTransport {
    pub(crate) fn stream_count(&self) -> usize {
        self.streams.lock().len()
    }

    pub(crate) fn stream_addr(
        &self,
        index: usize,
    ) -> HostPort {
        self.streams.lock()[index].addr.clone()
    }

    pub(crate) fn connect_timeout(
        &self,
        index: usize,
    ) -> Duration {
        self.streams.lock()[index].connect_timeout
    }

    /// Requests written to stream `index`.
    pub(crate) fn sent(
        &self,
        index: usize,
    ) -> Vec<proto::DiscoverRequest> {
        self.streams.lock()[index].sent.lock().clone()
    }

    pub(crate) fn emit(
        &self,
        index: usize,
        event: StreamEvent,
    ) {
        let streams = self.streams.lock();
        (streams[index].sink)(event);
    }

    /// Emits on the most recently opened stream.
    pub(crate) fn emit_last(
        &self,
        event: StreamEvent,
    ) {
        let index = self.stream_count() - 1;
        self.emit(index, event);
    }

    pub(crate) fn take_unary(&self) -> Vec<UnaryCall> {
        std::mem::take(&mut *self.unary.lock())
    }
}

struct FakeStream {
    sent: Arc<Mutex<Vec<proto::DiscoverRequest>>>,
}

impl DiscoverStream for FakeStream {
    fn send(
        &mut self,
        request: proto::DiscoverRequest,
    ) -> std::result::Result<(), TransportError> {
        self.sent.lock().push(request);
        Ok(())
    }
}

impl Transport for FakeTransport {
    fn open_stream(
        &self,
        addr: &HostPort,
        connect_timeout: Duration,
        sink: StreamSink,
    ) -> Box<dyn DiscoverStream> {
        let sent = Arc::new(Mutex::new(Vec::new()));
        self.streams.lock().push(OpenedStream {
            addr: addr.clone(),
            connect_timeout,
            sink,
            sent: sent.clone(),
        });
        Box::new(FakeStream { sent })
    }

    fn unary(
        &self,
        addr: &HostPort,
        request: UnaryRequest,
        _connect_timeout: Duration,
        timeout: Duration,
        done: UnaryCallback,
    ) {
        self.unary.lock().push(UnaryCall {
            addr: addr.clone(),
            request,
            timeout,
            done,
        });
    }
}

#[derive(Debug, Clone)]
pub(crate) enum HandlerEvent {
    Update {
        key: ServiceKey,
        data_type: DataType,
        data: Option<ServiceData>,
    },
    Sync {
        key: ServiceKey,
        data_type: DataType,
    },
}

impl HandlerEvent {
    pub(crate) fn is_sync(&self) -> bool {
        matches!(self, HandlerEvent::Sync { .. })
    }
}

/// Handler that keeps every event it receives.
#[derive(Clone, Default)]
pub(crate) struct RecordingHandler {
    pub(crate) events: Arc<Mutex<Vec<HandlerEvent>>>,
}

impl RecordingHandler {
    pub(crate) fn events(&self) -> Vec<HandlerEvent> {
        self.events.lock().clone()
    }

    /// Data of every update, `None` entries included.
    pub(crate) fn updates(&self) -> Vec<Option<ServiceData>> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                HandlerEvent::Update { data, .. } => Some(data.clone()),
                HandlerEvent::Sync { .. } => None,
            })
            .collect()
    }

    pub(crate) fn sync_count(&self) -> usize {
        self.events.lock().iter().filter(|e| e.is_sync()).count()
    }
}

impl ServiceEventHandler for RecordingHandler {
    fn on_event_update(
        &self,
        key: &ServiceKey,
        data_type: DataType,
        data: Option<ServiceData>,
    ) {
        self.events.lock().push(HandlerEvent::Update {
            key: key.clone(),
            data_type,
            data,
        });
    }

    fn on_event_sync(
        &self,
        key: &ServiceKey,
        data_type: DataType,
    ) {
        self.events.lock().push(HandlerEvent::Sync {
            key: key.clone(),
            data_type,
        });
    }
}

/// Reporter that keeps every call result, excluding a fixed set of servers.
#[derive(Default)]
pub(crate) struct RecordingReporter {
    pub(crate) results: Mutex<Vec<CallResult>>,
    pub(crate) excluded: Mutex<HashSet<HostPort>>,
}

impl RecordingReporter {
    pub(crate) fn results(&self) -> Vec<CallResult> {
        self.results.lock().clone()
    }

    pub(crate) fn exclude(
        &self,
        instance: HostPort,
    ) {
        self.excluded.lock().insert(instance);
    }
}

impl CallResultReporter for RecordingReporter {
    fn report(
        &self,
        result: CallResult,
    ) {
        self.results.lock().push(result);
    }

    fn is_excluded(
        &self,
        instance: &HostPort,
    ) -> bool {
        self.excluded.lock().contains(instance)
    }
}

pub(crate) struct Registration {
    pub(crate) key: ServiceKeyWithType,
    pub(crate) sync_interval: Duration,
    pub(crate) disk_revision: String,
    pub(crate) handler: Box<dyn ServiceEventHandler>,
}

/// Connector that keeps registered handlers so tests can play the server.
#[derive(Default)]
pub(crate) struct FakeConnector {
    pub(crate) registrations: Mutex<Vec<Registration>>,
    pub(crate) deregistered: Mutex<Vec<ServiceKeyWithType>>,
    /// Fails every registration when set
    pub(crate) reject: Mutex<bool>,
}

impl FakeConnector {
    pub(crate) fn registration_count(&self) -> usize {
        self.registrations.lock().len()
    }

    pub(crate) fn disk_revision(
        &self,
        index: usize,
    ) -> String {
        self.registrations.lock()[index].disk_revision.clone()
    }

    /// Delivers `data` through the latest handler registered for the key.
    pub(crate) fn update(
        &self,
        key: &ServiceKey,
        data_type: DataType,
        data: Option<ServiceData>,
    ) {
        let registrations = self.registrations.lock();
        if let Some(r) = registrations
            .iter()
            .rev()
            .find(|r| r.key.key == *key && r.key.data_type == data_type)
        {
            r.handler.on_event_update(key, data_type, data);
        }
    }

    pub(crate) fn sync(
        &self,
        key: &ServiceKey,
        data_type: DataType,
    ) {
        let registrations = self.registrations.lock();
        if let Some(r) = registrations
            .iter()
            .rev()
            .find(|r| r.key.key == *key && r.key.data_type == data_type)
        {
            r.handler.on_event_sync(key, data_type);
        }
    }

    pub(crate) fn deregistered(&self) -> Vec<ServiceKeyWithType> {
        self.deregistered.lock().clone()
    }
}

impl ServerConnector for FakeConnector {
    fn register_event_handler(
        &self,
        key: &ServiceKey,
        data_type: DataType,
        sync_interval: Duration,
        disk_revision: &str,
        handler: Box<dyn ServiceEventHandler>,
    ) -> Result<()> {
        if *self.reject.lock() {
            return Err(crate::DiscoveryError::NotInit("connector stopped".to_string()).into());
        }
        self.registrations.lock().push(Registration {
            key: ServiceKeyWithType::new(key.clone(), data_type),
            sync_interval,
            disk_revision: disk_revision.to_string(),
            handler,
        });
        Ok(())
    }

    fn deregister_event_handler(
        &self,
        key: &ServiceKey,
        data_type: DataType,
    ) -> Result<()> {
        self.deregistered
            .lock()
            .push(ServiceKeyWithType::new(key.clone(), data_type));
        Ok(())
    }
}

/// Change sink that records every key.
#[derive(Default)]
pub(crate) struct RecordingSink {
    pub(crate) changes: Mutex<Vec<ServiceKeyWithType>>,
}

impl RecordingSink {
    pub(crate) fn changes(&self) -> Vec<ServiceKeyWithType> {
        self.changes.lock().clone()
    }
}

impl ServiceDataChangeSink for RecordingSink {
    fn on_service_data_change(
        &self,
        key: &ServiceKeyWithType,
    ) {
        self.changes.lock().push(key.clone());
    }
}

/// In-memory backups keyed by service and type.
#[derive(Default)]
pub(crate) struct MemoryPersist {
    pub(crate) backups: Mutex<Vec<(ServiceKeyWithType, ServiceData)>>,
    pub(crate) writes: Mutex<Vec<(ServiceKeyWithType, String)>>,
    pub(crate) syncs: Mutex<Vec<ServiceKeyWithType>>,
}

impl MemoryPersist {
    pub(crate) fn with_backup(data: ServiceData) -> Self {
        let persist = Self::default();
        let key = ServiceKeyWithType::new(data.key().clone(), data.data_type());
        persist.backups.lock().push((key, data));
        persist
    }

    pub(crate) fn writes(&self) -> Vec<(ServiceKeyWithType, String)> {
        self.writes.lock().clone()
    }
}

impl CachePersist for MemoryPersist {
    fn load_service_data(
        &self,
        key: &ServiceKey,
        data_type: DataType,
    ) -> Option<ServiceData> {
        let wanted = ServiceKeyWithType::new(key.clone(), data_type);
        let backups = self.backups.lock();
        let (_, data) = backups.iter().find(|(k, _)| *k == wanted)?;
        let json = data.to_json().ok()?;
        ServiceData::from_json(&json, data.available_time()).ok()
    }

    fn persist_service_data(
        &self,
        key: &ServiceKey,
        data_type: DataType,
        json: String,
    ) {
        self.writes
            .lock()
            .push((ServiceKeyWithType::new(key.clone(), data_type), json));
    }

    fn update_sync_time(
        &self,
        key: &ServiceKey,
        data_type: DataType,
    ) {
        self.syncs
            .lock()
            .push(ServiceKeyWithType::new(key.clone(), data_type));
    }
}

/// Registry wired to fakes.
pub(crate) struct RegistryFixture {
    pub(crate) registry: Arc<LocalRegistry>,
    pub(crate) connector: Arc<FakeConnector>,
    pub(crate) sink: Arc<RecordingSink>,
}

impl RegistryFixture {
    pub(crate) fn new(persist: Arc<dyn CachePersist>) -> Self {
        Self::with_config(RegistryConfig::default(), persist, Vec::new())
    }

    pub(crate) fn with_config(
        config: RegistryConfig,
        persist: Arc<dyn CachePersist>,
        system_services: Vec<ServiceKey>,
    ) -> Self {
        let connector = Arc::new(FakeConnector::default());
        let sink = Arc::new(RecordingSink::default());
        let registry = LocalRegistry::new(
            config,
            system_services,
            RegistryDeps {
                connector: connector.clone(),
                persist,
                change_sink: sink.clone(),
                notify_factory: DataNotifyFactory::default(),
            },
        );
        Self {
            registry,
            connector,
            sink,
        }
    }
}
