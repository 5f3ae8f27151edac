//! Seam between the connector state machine and the wire.
//!
//! A [`Transport`] only moves messages. It never touches connector state: every
//! outcome is handed back through a callback, which the connector re-submits
//! to its reactor.

use std::fmt;
use std::time::Duration;

use crate::proto;
use crate::HostPort;

/// Failure of one transport operation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("rpc failed: {0}")]
    Rpc(String),

    #[error("rpc timed out")]
    Timeout,

    /// The stream is gone, e.g. its task already finished
    #[error("stream closed")]
    Closed,
}

/// Events of one discover stream, in the order they happen.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Connected { elapsed: Duration },
    ConnectFailed(TransportError),
    Message(proto::DiscoverResponse),
    RemoteClosed(Option<TransportError>),
}

pub type StreamSink = Box<dyn Fn(StreamEvent) + Send + Sync>;

/// Outbound half of an open discover stream. Dropping it closes the stream.
pub trait DiscoverStream: Send {
    fn send(
        &mut self,
        request: proto::DiscoverRequest,
    ) -> std::result::Result<(), TransportError>;
}

/// Kinds of unary request, used for routing and metrics labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Register,
    Deregister,
    Heartbeat,
    ReportClient,
}

impl RequestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::Register => "register",
            RequestKind::Deregister => "deregister",
            RequestKind::Heartbeat => "heartbeat",
            RequestKind::ReportClient => "report_client",
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum UnaryRequest {
    Register(proto::Instance),
    Deregister(proto::Instance),
    Heartbeat(proto::Instance),
    ReportClient(proto::Client),
}

impl UnaryRequest {
    pub fn kind(&self) -> RequestKind {
        match self {
            UnaryRequest::Register(_) => RequestKind::Register,
            UnaryRequest::Deregister(_) => RequestKind::Deregister,
            UnaryRequest::Heartbeat(_) => RequestKind::Heartbeat,
            UnaryRequest::ReportClient(_) => RequestKind::ReportClient,
        }
    }

    pub fn path(&self) -> &'static str {
        match self {
            UnaryRequest::Register(_) => proto::REGISTER_INSTANCE_PATH,
            UnaryRequest::Deregister(_) => proto::DEREGISTER_INSTANCE_PATH,
            UnaryRequest::Heartbeat(_) => proto::HEARTBEAT_PATH,
            UnaryRequest::ReportClient(_) => proto::REPORT_CLIENT_PATH,
        }
    }
}

pub type UnaryCallback =
    Box<dyn FnOnce(std::result::Result<proto::Response, TransportError>) + Send>;

pub trait Transport: Send + Sync + 'static {
    /// Starts connecting a discover stream to `addr`.
    ///
    /// Returns immediately. `Connected` or `ConnectFailed` is reported through
    /// `sink`, followed by any number of `Message`s and at most one
    /// `RemoteClosed`.
    fn open_stream(
        &self,
        addr: &HostPort,
        connect_timeout: Duration,
        sink: StreamSink,
    ) -> Box<dyn DiscoverStream>;

    /// Sends one unary request on a dedicated connection. `done` is called
    /// exactly once.
    fn unary(
        &self,
        addr: &HostPort,
        request: UnaryRequest,
        connect_timeout: Duration,
        timeout: Duration,
        done: UnaryCallback,
    );
}
