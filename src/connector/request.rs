//! Unary requests to system-service instances.
//!
//! Blocking and async requests share one pipeline on the connector reactor:
//! pick a target, send on a dedicated connection, arm a timeout, report the
//! call result. Every request completes exactly once, by response, transport
//! error, or timeout.

use std::collections::HashMap;
use std::time::Instant;

use crossbeam_channel::Sender;
use tracing::debug;
use tracing::warn;

use super::discover::DiscoverConnector;
use super::discover::ServerTarget;
use super::selector::CallResult;
use super::selector::CallStatus;
use super::server_code::ServerCode;
use super::transport::RequestKind;
use super::transport::TransportError;
use super::transport::UnaryRequest;
use crate::metrics::REQUEST_LATENCY_MS;
use crate::metrics::REQUEST_RESULTS;
use crate::proto;
use crate::proto::code;
use crate::reactor::Scheduler;
use crate::reactor::TimerHandle;
use crate::utils::time::as_millis;
use crate::utils::time::remaining;
use crate::DiscoveryError;
use crate::ReturnCode;
use crate::ServiceKey;

/// Callback of an async request: client return code, server info, response.
pub type RequestCallback = Box<dyn FnOnce(ReturnCode, String, Option<proto::Response>) + Send>;

pub(crate) type RequestOutcome = std::result::Result<proto::Response, DiscoveryError>;

pub(crate) enum Completion {
    Block(Sender<RequestOutcome>),
    Async(RequestCallback),
}

impl Completion {
    pub(crate) fn complete(
        self,
        outcome: RequestOutcome,
    ) {
        match self {
            Completion::Block(reply) => {
                // The caller may have given up already
                let _ = reply.try_send(outcome);
            }
            Completion::Async(callback) => match outcome {
                Ok(response) => {
                    let info = response.info.clone();
                    callback(code::to_return_code(response.code), info, Some(response));
                }
                Err(e) => callback(e.return_code(), e.to_string(), None),
            },
        }
    }
}

pub(crate) struct PendingRequest {
    kind: RequestKind,
    target: ServerTarget,
    begin: Instant,
    timer: Option<TimerHandle>,
    completion: Completion,
}

#[derive(Default)]
pub(crate) struct RequestTable {
    next_id: u64,
    inflight: HashMap<u64, PendingRequest>,
}

impl RequestTable {
    pub(crate) fn len(&self) -> usize {
        self.inflight.len()
    }
}

impl DiscoverConnector {
    pub fn inflight_requests(&self) -> usize {
        self.requests.len()
    }

    /// Entry point of blocking requests. The caller waits on the other end of
    /// `reply` until `deadline`.
    pub(crate) fn submit_block_request(
        &mut self,
        sched: &mut Scheduler<DiscoverConnector>,
        request: UnaryRequest,
        deadline: Instant,
        reply: Sender<RequestOutcome>,
    ) {
        let kind = request.kind();
        match self.select_request_target(kind) {
            Ok(target) => self.start_request(sched, request, target, deadline, Completion::Block(reply)),
            Err(code) => {
                warn!(request = %kind, ?code, "no server for request");
                REQUEST_RESULTS
                    .with_label_values(&[kind.as_str(), ServerCode::ConnectError.as_str()])
                    .inc();
                let _ = reply.try_send(Err(DiscoveryError::NetworkFailed(format!(
                    "no server available for {kind} request"
                ))));
            }
        }
    }

    /// Entry point of async requests. Waits, by re-arming itself, until the
    /// target service can be selected or `deadline` passes.
    pub(crate) fn submit_async_request(
        &mut self,
        sched: &mut Scheduler<DiscoverConnector>,
        request: UnaryRequest,
        deadline: Instant,
        callback: RequestCallback,
    ) {
        let kind = request.kind();
        if remaining(deadline).is_zero() {
            callback(
                ReturnCode::Timeout,
                format!("{kind} request timed out before it was sent"),
                None,
            );
            return;
        }
        if !self.is_request_target_ready(kind) {
            let retry = self.config.async_retry_interval();
            debug!(request = %kind, retry = ?retry, "target service not ready, retry later");
            sched.add_timing_task(retry, move |conn: &mut DiscoverConnector, sched| {
                conn.submit_async_request(sched, request, deadline, callback)
            });
            return;
        }
        match self.select_request_target(kind) {
            Ok(target) => self.start_request(sched, request, target, deadline, Completion::Async(callback)),
            Err(code) => callback(code, format!("no server available for {kind} request"), None),
        }
    }

    fn start_request(
        &mut self,
        sched: &mut Scheduler<DiscoverConnector>,
        request: UnaryRequest,
        target: ServerTarget,
        deadline: Instant,
        completion: Completion,
    ) {
        let kind = request.kind();
        if self.requests.inflight.len() >= self.config.request_queue_size {
            warn!(request = %kind, inflight = self.requests.inflight.len(), "too many requests in flight");
            REQUEST_RESULTS
                .with_label_values(&[kind.as_str(), "rate_limit"])
                .inc();
            completion.complete(Err(DiscoveryError::RateLimit("too many request".to_string())));
            return;
        }

        self.requests.next_id += 1;
        let id = self.requests.next_id;
        let timeout = remaining(deadline);
        let timer = sched.add_timing_task(timeout, move |conn: &mut DiscoverConnector, _| {
            conn.on_request_timeout(id)
        });
        debug!(request = %kind, id, addr = %target.addr, timeout = ?timeout, "sending request");

        let addr = target.addr.clone();
        self.requests.inflight.insert(
            id,
            PendingRequest {
                kind,
                target,
                begin: Instant::now(),
                timer: Some(timer),
                completion,
            },
        );
        let handle = sched.handle();
        self.transport.unary(
            &addr,
            request,
            self.connect_timeout.timeout(),
            timeout,
            Box::new(move |result| {
                handle.submit_task(move |conn: &mut DiscoverConnector, sched| {
                    conn.on_request_done(sched, id, result)
                });
            }),
        );
    }

    fn on_request_timeout(
        &mut self,
        id: u64,
    ) {
        let Some(mut request) = self.requests.inflight.remove(&id) else {
            return;
        };
        request.timer = None;
        warn!(request = %request.kind, id, addr = %request.target.addr, "request timed out");
        let message = format!("{} request timed out", request.kind);
        self.finish_request(request, ServerCode::RpcTimeout, Err(DiscoveryError::Timeout(message)));
    }

    fn on_request_done(
        &mut self,
        sched: &mut Scheduler<DiscoverConnector>,
        id: u64,
        result: std::result::Result<proto::Response, TransportError>,
    ) {
        let Some(mut request) = self.requests.inflight.remove(&id) else {
            debug!(id, "result of a finished request dropped");
            return;
        };
        if let Some(timer) = request.timer.take() {
            sched.cancel_timing_task(timer);
        }
        let (server_code, outcome) = match result {
            Ok(response) => {
                let server_code = ServerCode::from_response_code(response.code);
                if server_code == ServerCode::ServerError {
                    let info = response.info.clone();
                    (server_code, Err(DiscoveryError::ServerError(info)))
                } else {
                    (server_code, Ok(response))
                }
            }
            Err(TransportError::Connect(e)) => (ServerCode::ConnectError, Err(DiscoveryError::NetworkFailed(e))),
            Err(TransportError::Timeout) => (
                ServerCode::RpcTimeout,
                Err(DiscoveryError::Timeout(format!("{} request timed out", request.kind))),
            ),
            Err(e) => (ServerCode::RpcError, Err(DiscoveryError::NetworkFailed(e.to_string()))),
        };
        self.finish_request(request, server_code, outcome);
    }

    fn finish_request(
        &self,
        request: PendingRequest,
        server_code: ServerCode,
        outcome: RequestOutcome,
    ) {
        let delay = request.begin.elapsed();
        let status = if server_code.is_failure() {
            CallStatus::Error
        } else {
            CallStatus::Ok
        };
        self.reporter.report(CallResult {
            service: request.target.service.clone(),
            instance: request.target.addr.clone(),
            code: server_code.as_i32(),
            status,
            delay,
        });
        REQUEST_RESULTS
            .with_label_values(&[request.kind.as_str(), server_code.as_str()])
            .inc();
        REQUEST_LATENCY_MS
            .with_label_values(&[request.kind.as_str()])
            .observe(as_millis(delay) as f64);
        debug!(request = %request.kind, server_code = %server_code, delay = ?delay, "request finished");
        request.completion.complete(outcome);
    }

    /// System services tried in turn: the heartbeat service, then the
    /// discover service.
    fn system_services_for(
        &self,
        _kind: RequestKind,
    ) -> Vec<&ServiceKey> {
        let mut services: Vec<&ServiceKey> = self.heartbeat_service.iter().collect();
        if let Some(discover) = &self.discover_service {
            if !services.contains(&discover) {
                services.push(discover);
            }
        }
        services
    }

    fn is_request_target_ready(
        &self,
        kind: RequestKind,
    ) -> bool {
        let Some(selector) = &self.selector else {
            return true;
        };
        let services = self.system_services_for(kind);
        services.is_empty() || services.iter().any(|s| selector.is_service_ready(s))
    }

    /// An instance of the first system service that has one, falling back to
    /// a random seed.
    pub(crate) fn select_request_target(
        &self,
        kind: RequestKind,
    ) -> std::result::Result<ServerTarget, ReturnCode> {
        if let Some(selector) = &self.selector {
            for service in self.system_services_for(kind) {
                match selector.select_instance(service, true) {
                    Ok(instance) => {
                        return Ok(ServerTarget {
                            addr: instance.endpoint(),
                            service: Some(service.clone()),
                        })
                    }
                    Err(code) => {
                        debug!(request = %kind, service = %service, ?code, "select instance failed");
                    }
                }
            }
        }
        self.random_seed()
            .map(|addr| ServerTarget { addr, service: None })
            .ok_or(ReturnCode::NetworkFailed)
    }
}
