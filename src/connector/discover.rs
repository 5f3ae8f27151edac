//! Discover stream state machine.
//!
//! Runs on the connector reactor. One bidirectional stream carries the discover
//! requests of every listener; responses are matched back by (service, type).
//!
//! ```text
//! switch state:  Init ─► Begin ─┬─ connected ──► Normal ─ interval ─► Periodic ─┐
//!                  ▲            └─ connect timeout ─► Timeout ──────────────────┤
//!                  │    Default (discover service found on a seed) ─────────────┤
//!                  └──────────────────────── server_switch ◄────────────────────┘
//!
//! stream state:  NotInit (seed) ─► GetInstance (discover service known) ─► Init
//! ```

use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use rand::seq::SliceRandom;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::trace;
use tracing::warn;

use super::listener::ServiceEventHandler;
use super::listener::ServiceListener;
use super::request::RequestTable;
use super::selector::CallResult;
use super::selector::CallResultReporter;
use super::selector::CallStatus;
use super::selector::InstanceSelector;
use super::server_code::ServerCode;
use super::timeout_strategy::TimeoutStrategy;
use super::transport::DiscoverStream;
use super::transport::StreamEvent;
use super::transport::StreamSink;
use super::transport::Transport;
use super::transport::TransportError;
use crate::config::split_address;
use crate::metrics::DISCOVER_REQUESTS;
use crate::metrics::DISCOVER_RESPONSES;
use crate::metrics::SERVER_SWITCHES;
use crate::proto;
use crate::proto::code;
use crate::reactor::ReactorHandle;
use crate::reactor::Scheduler;
use crate::reactor::TimerHandle;
use crate::ConnectorConfig;
use crate::DataStatus;
use crate::DataType;
use crate::HostPort;
use crate::ReturnCode;
use crate::ServiceData;
use crate::ServiceKey;
use crate::ServiceKeyWithType;

/// Which kind of server the discover stream points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum StreamState {
    /// Seed server, only the discover service's own listeners are sent
    NotInit,
    /// Discover service instances are known, migration pending
    GetInstance,
    /// Every listener may be sent
    Init,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchState {
    Init,
    /// Connecting, the switch timer guards the connect timeout
    Begin,
    Timeout,
    /// Connected, the switch timer rotates the stream periodically
    Normal,
    /// Leaving the seed server for the discover service
    Default,
    Periodic,
}

/// A server picked for the stream or for a unary request.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ServerTarget {
    pub(crate) addr: HostPort,
    /// `None` for seed servers
    pub(crate) service: Option<ServiceKey>,
}

pub struct DiscoverConnector {
    pub(crate) config: ConnectorConfig,
    pub(crate) seeds: Vec<HostPort>,
    pub(crate) discover_service: Option<ServiceKey>,
    pub(crate) heartbeat_service: Option<ServiceKey>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) reporter: Arc<dyn CallResultReporter>,
    pub(crate) selector: Option<Arc<dyn InstanceSelector>>,

    pub(crate) listeners: HashMap<ServiceKeyWithType, ServiceListener>,
    /// Listeners waiting for a usable stream
    pub(crate) pending: BTreeSet<ServiceKeyWithType>,
    pub(crate) next_listener_id: u64,
    pub(crate) last_cache_version: u64,

    pub(crate) connect_timeout: TimeoutStrategy,
    pub(crate) message_timeout: TimeoutStrategy,
    /// Largest response delay since the last switch
    pub(crate) message_used_time: Duration,

    pub(crate) stream_state: StreamState,
    pub(crate) switch_state: SwitchState,
    pub(crate) switch_timer: Option<TimerHandle>,
    pub(crate) stream: Option<Box<dyn DiscoverStream>>,
    /// Bumped per opened stream, events of older streams are dropped
    pub(crate) stream_generation: u64,
    pub(crate) stream_target: Option<ServerTarget>,
    pub(crate) stream_response_time: Instant,

    pub(crate) requests: RequestTable,
}

impl DiscoverConnector {
    pub fn new(
        config: ConnectorConfig,
        transport: Arc<dyn Transport>,
        reporter: Arc<dyn CallResultReporter>,
    ) -> Self {
        let seeds = config
            .addresses
            .iter()
            .filter_map(|address| split_address(address))
            .map(|(host, port)| HostPort::new(host, port))
            .collect();
        let discover_service = config.discover_service.as_ref().map(|s| s.service_key());
        let heartbeat_service = config.heartbeat_service.as_ref().map(|s| s.service_key());
        Self {
            seeds,
            discover_service,
            heartbeat_service,
            transport,
            reporter,
            selector: None,
            listeners: HashMap::new(),
            pending: BTreeSet::new(),
            next_listener_id: 0,
            last_cache_version: 0,
            connect_timeout: TimeoutStrategy::connect(&config),
            message_timeout: TimeoutStrategy::message(&config),
            message_used_time: Duration::ZERO,
            stream_state: StreamState::NotInit,
            switch_state: SwitchState::Init,
            switch_timer: None,
            stream: None,
            stream_generation: 0,
            stream_target: None,
            stream_response_time: Instant::now(),
            requests: RequestTable::default(),
            config,
        }
    }

    /// Selector for the discover and heartbeat services. Without one the
    /// connector only ever talks to seed servers.
    pub fn set_selector(
        &mut self,
        selector: Arc<dyn InstanceSelector>,
    ) {
        self.selector = Some(selector);
    }

    /// Opens the first stream.
    pub fn start(
        &mut self,
        sched: &mut Scheduler<DiscoverConnector>,
    ) {
        info!(seeds = self.seeds.len(), "discover connector starting");
        self.server_switch(sched, "start");
    }

    pub fn stream_state(&self) -> StreamState {
        self.stream_state
    }

    pub fn switch_state(&self) -> SwitchState {
        self.switch_state
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn stream_addr(&self) -> Option<&HostPort> {
        self.stream_target.as_ref().map(|t| &t.addr)
    }

    // ============== Listeners ============== //

    pub(crate) fn add_listener(
        &mut self,
        sched: &mut Scheduler<DiscoverConnector>,
        key: ServiceKeyWithType,
        sync_interval: Duration,
        disk_revision: String,
        handler: Box<dyn ServiceEventHandler>,
    ) {
        if self.listeners.contains_key(&key) {
            warn!(service = %key.key, data_type = %key.data_type, "listener already registered, ignored");
            return;
        }
        self.next_listener_id += 1;
        debug!(service = %key.key, data_type = %key.data_type, revision = %disk_revision, "listener registered");
        let listener = ServiceListener::new(
            self.next_listener_id,
            key.clone(),
            sync_interval,
            disk_revision,
            handler,
        );
        self.listeners.insert(key.clone(), listener);
        if !self.send_discover_request(sched, &key) {
            self.pending.insert(key);
        }
    }

    pub(crate) fn remove_listener(
        &mut self,
        sched: &mut Scheduler<DiscoverConnector>,
        key: &ServiceKeyWithType,
    ) {
        let Some(mut listener) = self.listeners.remove(key) else {
            debug!(service = %key.key, data_type = %key.data_type, "deregister of unknown listener");
            return;
        };
        for timer in [listener.discover_timer.take(), listener.timeout_timer.take()]
            .into_iter()
            .flatten()
        {
            sched.cancel_timing_task(timer);
        }
        self.pending.remove(key);
        listener.handler.on_event_update(&key.key, key.data_type, None);
        debug!(service = %key.key, data_type = %key.data_type, "listener removed");
    }

    fn listener_mut(
        &mut self,
        key: &ServiceKeyWithType,
        id: u64,
    ) -> Option<&mut ServiceListener> {
        self.listeners.get_mut(key).filter(|l| l.id == id)
    }

    /// Periodic refresh of one listener.
    fn on_discover_timer(
        &mut self,
        sched: &mut Scheduler<DiscoverConnector>,
        key: ServiceKeyWithType,
        id: u64,
    ) {
        let Some(listener) = self.listener_mut(&key, id) else {
            return;
        };
        listener.discover_timer = None;
        if !self.send_discover_request(sched, &key) {
            self.pending.insert(key);
        }
    }

    /// Writes the discover request of `key` to the stream and arms its
    /// response timeout. Returns false if it has to wait for another stream.
    pub(crate) fn send_discover_request(
        &mut self,
        sched: &mut Scheduler<DiscoverConnector>,
        key: &ServiceKeyWithType,
    ) -> bool {
        if self.stream.is_none() || self.switch_state == SwitchState::Begin {
            return false;
        }
        if self.stream_state != StreamState::Init {
            match &self.discover_service {
                None => self.stream_state = StreamState::Init,
                Some(service) if *service != key.key => return false,
                Some(_) => {}
            }
        }
        let Some(listener) = self.listeners.get_mut(key) else {
            return false;
        };
        if listener.timeout_timer.is_some() {
            warn!(service = %key.key, data_type = %key.data_type, "already discovering");
            return true;
        }

        let request = proto::DiscoverRequest {
            r#type: key.data_type.discover_type() as i32,
            service: Some(proto::Service {
                namespace: key.key.namespace.clone(),
                name: key.key.name.clone(),
                revision: listener.revision.clone(),
                ..Default::default()
            }),
        };
        let Some(stream) = self.stream.as_mut() else {
            return false;
        };
        if let Err(e) = stream.send(request) {
            warn!(service = %key.key, data_type = %key.data_type, error = %e, "write discover request failed");
            return false;
        }
        DISCOVER_REQUESTS
            .with_label_values(&[key.data_type.as_str()])
            .inc();
        trace!(service = %key.key, data_type = %key.data_type, revision = %listener.revision, "discover request sent");

        let id = listener.id;
        let timer_key = key.clone();
        listener.sent_at = Some(Instant::now());
        listener.timeout_timer = Some(sched.add_timing_task(
            self.message_timeout.timeout(),
            move |conn: &mut DiscoverConnector, sched| conn.on_discover_timeout(sched, timer_key, id),
        ));
        true
    }

    fn on_discover_timeout(
        &mut self,
        sched: &mut Scheduler<DiscoverConnector>,
        key: ServiceKeyWithType,
        id: u64,
    ) {
        let Some(listener) = self.listener_mut(&key, id) else {
            return;
        };
        listener.timeout_timer = None;
        self.message_timeout.set_next_retry_timeout();
        warn!(
            service = %key.key,
            data_type = %key.data_type,
            next_timeout = ?self.message_timeout.timeout(),
            "discover request timed out"
        );
        self.pending.insert(key);
        self.update_call_result(ServerCode::RpcTimeout, self.message_timeout.timeout());
        self.server_switch(sched, "message_timeout");
    }

    // ============== Stream events ============== //

    pub(crate) fn on_stream_event(
        &mut self,
        sched: &mut Scheduler<DiscoverConnector>,
        generation: u64,
        event: StreamEvent,
    ) {
        if generation != self.stream_generation {
            trace!(generation, current = self.stream_generation, "event of a replaced stream dropped");
            return;
        }
        match event {
            StreamEvent::Connected { elapsed } => self.on_connect_success(sched, elapsed),
            StreamEvent::ConnectFailed(e) => {
                // The connect timeout timer drives the next switch
                warn!(addr = ?self.stream_addr(), error = %e, "connect to discover server failed");
            }
            StreamEvent::Message(response) => self.on_receive_message(sched, response),
            StreamEvent::RemoteClosed(e) => self.on_remote_close(sched, e),
        }
    }

    fn on_connect_success(
        &mut self,
        sched: &mut Scheduler<DiscoverConnector>,
        elapsed: Duration,
    ) {
        self.connect_timeout.set_normal_timeout(elapsed);
        self.switch_state = SwitchState::Normal;
        self.arm_switch_timer(sched, self.config.server_switch_interval());
        self.stream_response_time = Instant::now();
        info!(
            addr = ?self.stream_addr(),
            elapsed = ?elapsed,
            pending = self.pending.len(),
            "discover stream connected"
        );

        let pending = std::mem::take(&mut self.pending);
        for key in pending {
            if !self.send_discover_request(sched, &key) {
                self.pending.insert(key);
            }
        }
    }

    fn on_remote_close(
        &mut self,
        sched: &mut Scheduler<DiscoverConnector>,
        error: Option<TransportError>,
    ) {
        warn!(addr = ?self.stream_addr(), error = ?error, "discover stream closed by remote");
        self.update_call_result(ServerCode::RemoteClose, self.connect_timeout.timeout());
        self.server_switch(sched, "remote_close");
    }

    fn on_receive_message(
        &mut self,
        sched: &mut Scheduler<DiscoverConnector>,
        response: proto::DiscoverResponse,
    ) {
        self.stream_response_time = Instant::now();
        let server_code = ServerCode::from_response_code(response.code);
        let client_code = code::to_return_code(response.code);
        if server_code == ServerCode::ReturnOk
            || (server_code == ServerCode::InvalidRequest && client_code == ReturnCode::ServiceNotFound)
        {
            self.process_discover_response(sched, response, client_code);
            return;
        }

        let data_type = DataType::from_discover_type(response.r#type)
            .map(|t| t.as_str())
            .unwrap_or("unknown");
        DISCOVER_RESPONSES
            .with_label_values(&[data_type, "error"])
            .inc();
        warn!(
            code = response.code,
            info = %response.info,
            server_code = %server_code,
            "discover response with error code"
        );
        self.update_call_result(server_code, self.message_timeout.timeout());
        if server_code == ServerCode::ServerError {
            self.server_switch(sched, "server_error");
        }
    }

    fn process_discover_response(
        &mut self,
        sched: &mut Scheduler<DiscoverConnector>,
        response: proto::DiscoverResponse,
        client_code: ReturnCode,
    ) {
        let data_type = DataType::from_discover_type(response.r#type);
        let (Some(data_type), Some(service)) = (data_type, response.service.as_ref()) else {
            warn!(r#type = response.r#type, "discover response without known type or service");
            self.update_call_result(ServerCode::InvalidResponse, Duration::ZERO);
            return;
        };
        let key = ServiceKeyWithType::new(
            ServiceKey::new(service.namespace.clone(), service.name.clone()),
            data_type,
        );
        let Some(listener) = self.listeners.get_mut(&key) else {
            info!(service = %key.key, data_type = %data_type, "discover response without listener");
            return;
        };

        let mut delay = Duration::ZERO;
        if let Some(timer) = listener.timeout_timer.take() {
            sched.cancel_timing_task(timer);
            delay = listener.sent_at.map(|t| t.elapsed()).unwrap_or_default();
        }

        let accepted = matches!(client_code, ReturnCode::Ok | ReturnCode::ServiceNotFound);
        if accepted {
            let revision = response.revision().to_string();
            if listener.update_revision(response.code, &revision, &mut self.last_cache_version) {
                let status = if client_code == ReturnCode::Ok {
                    DataStatus::Syncing
                } else {
                    DataStatus::NotFound
                };
                info!(
                    service = %key.key,
                    data_type = %data_type,
                    revision = %revision,
                    cache_version = listener.cache_version,
                    status = ?status,
                    "service data updated"
                );
                let data = ServiceData::from_response(
                    key.key.clone(),
                    data_type,
                    response,
                    status,
                    listener.cache_version,
                );
                listener.handler.on_event_update(&key.key, data_type, Some(data));
                DISCOVER_RESPONSES
                    .with_label_values(&[data_type.as_str(), "update"])
                    .inc();
            } else {
                listener.handler.on_event_sync(&key.key, data_type);
                DISCOVER_RESPONSES
                    .with_label_values(&[data_type.as_str(), "sync"])
                    .inc();
            }
        } else {
            DISCOVER_RESPONSES
                .with_label_values(&[data_type.as_str(), "error"])
                .inc();
        }

        if listener.discover_timer.is_none() {
            let id = listener.id;
            let timer_key = key.clone();
            listener.discover_timer = Some(sched.add_timing_task(
                listener.sync_interval,
                move |conn: &mut DiscoverConnector, sched| conn.on_discover_timer(sched, timer_key, id),
            ));
        }
        self.pending.remove(&key);

        if !accepted {
            self.update_call_result(ServerCode::InvalidRequest, delay);
            return;
        }
        self.update_call_result(ServerCode::ReturnOk, delay);
        self.message_used_time = self.message_used_time.max(delay);

        if client_code == ReturnCode::Ok
            && self.stream_state < StreamState::GetInstance
            && data_type == DataType::Instances
            && self.discover_service.as_ref() == Some(&key.key)
        {
            info!(service = %key.key, "discover service instances received, leaving seed server");
            self.switch_state = SwitchState::Default;
            self.stream_state = StreamState::GetInstance;
            self.arm_switch_timer(sched, Duration::ZERO);
        }
    }

    // ============== Server switch ============== //

    fn arm_switch_timer(
        &mut self,
        sched: &mut Scheduler<DiscoverConnector>,
        delay: Duration,
    ) {
        if let Some(timer) = self.switch_timer.take() {
            sched.cancel_timing_task(timer);
        }
        self.switch_timer = Some(sched.add_timing_task(
            delay,
            |conn: &mut DiscoverConnector, sched| conn.on_switch_timer(sched),
        ));
    }

    /// Connect timeout, periodic rotation, or the move off the seed server.
    pub(crate) fn on_switch_timer(
        &mut self,
        sched: &mut Scheduler<DiscoverConnector>,
    ) {
        self.switch_timer = None;
        let reason = match self.switch_state {
            SwitchState::Normal => {
                self.switch_state = SwitchState::Periodic;
                if !self.message_used_time.is_zero() {
                    self.message_timeout.set_normal_timeout(self.message_used_time);
                    self.message_used_time = Duration::ZERO;
                }
                self.update_call_result(ServerCode::ReturnOk, Duration::ZERO);
                "periodic"
            }
            SwitchState::Default => {
                self.switch_state = SwitchState::Periodic;
                self.update_call_result(ServerCode::ReturnOk, Duration::ZERO);
                "bootstrap"
            }
            SwitchState::Begin => {
                self.switch_state = SwitchState::Timeout;
                self.connect_timeout.set_next_retry_timeout();
                warn!(
                    addr = ?self.stream_addr(),
                    next_timeout = ?self.connect_timeout.timeout(),
                    "connect to discover server timed out"
                );
                self.update_call_result(ServerCode::ConnectError, self.connect_timeout.timeout());
                "connect_timeout"
            }
            state => {
                debug!(?state, "switch timer fired");
                "timer"
            }
        };
        self.server_switch(sched, reason);
    }

    /// Drops the current stream and connects a new one.
    pub(crate) fn server_switch(
        &mut self,
        sched: &mut Scheduler<DiscoverConnector>,
        reason: &str,
    ) {
        SERVER_SWITCHES.with_label_values(&[reason]).inc();
        if let Some(timer) = self.switch_timer.take() {
            sched.cancel_timing_task(timer);
        }
        for (key, listener) in self.listeners.iter_mut() {
            if let Some(timer) = listener.timeout_timer.take() {
                sched.cancel_timing_task(timer);
                self.pending.insert(key.clone());
            }
        }

        let mut target = None;
        if let (Some(service), Some(selector)) = (&self.discover_service, &self.selector) {
            if self.stream_state >= StreamState::GetInstance {
                let ignore_half_open = self.switch_state != SwitchState::Periodic;
                match selector.select_instance(service, ignore_half_open) {
                    Ok(instance) => {
                        target = Some(ServerTarget {
                            addr: instance.endpoint(),
                            service: Some(service.clone()),
                        });
                        self.stream_state = StreamState::Init;
                    }
                    Err(code) => {
                        warn!(service = %service, ?code, "select discover server failed, using seeds");
                    }
                }
            }
        }
        let target = match target {
            Some(target) => target,
            None => {
                self.stream_state = if self.discover_service.is_some() {
                    StreamState::NotInit
                } else {
                    StreamState::Init
                };
                match self.random_seed() {
                    Some(addr) => ServerTarget { addr, service: None },
                    None => {
                        error!("no seed server to connect to");
                        return;
                    }
                }
            }
        };

        self.switch_state = SwitchState::Begin;
        let connect_timeout = self.connect_timeout.timeout();
        self.arm_switch_timer(sched, connect_timeout);

        self.stream = None;
        self.stream_generation += 1;
        info!(
            addr = %target.addr,
            reason,
            generation = self.stream_generation,
            stream_state = ?self.stream_state,
            "switching discover server"
        );
        let sink = stream_sink(sched.handle(), self.stream_generation);
        self.stream = Some(self.transport.open_stream(&target.addr, connect_timeout, sink));
        self.stream_target = Some(target);
    }

    /// Random seed, preferring the ones not excluded by the reporter.
    pub(crate) fn random_seed(&self) -> Option<HostPort> {
        let healthy: Vec<&HostPort> = self
            .seeds
            .iter()
            .filter(|seed| !self.reporter.is_excluded(seed))
            .collect();
        let pool: Vec<&HostPort> = if healthy.is_empty() {
            self.seeds.iter().collect()
        } else {
            healthy
        };
        pool.choose(&mut rand::thread_rng()).map(|seed| (*seed).clone())
    }

    /// Feeds one sample of the stream's server to the reporter.
    ///
    /// An rpc timeout still counts as success when the stream delivered a
    /// response within `delay`.
    fn update_call_result(
        &self,
        server_code: ServerCode,
        delay: Duration,
    ) {
        let Some(target) = &self.stream_target else {
            return;
        };
        let mut status = if server_code.is_failure() {
            CallStatus::Error
        } else {
            CallStatus::Ok
        };
        if server_code == ServerCode::RpcTimeout && self.stream_response_time + delay > Instant::now() {
            status = CallStatus::Ok;
        }
        self.reporter.report(CallResult {
            service: target.service.clone(),
            instance: target.addr.clone(),
            code: server_code.as_i32(),
            status,
            delay,
        });
    }
}

fn stream_sink(
    handle: ReactorHandle<DiscoverConnector>,
    generation: u64,
) -> StreamSink {
    Box::new(move |event| {
        handle.submit_task(move |conn: &mut DiscoverConnector, sched| {
            conn.on_stream_event(sched, generation, event)
        });
    })
}
