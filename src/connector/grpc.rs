//! tonic implementation of [`Transport`].
//!
//! Owns a small tokio runtime. Connector calls only spawn onto it, so the
//! reactor thread never blocks on the network.

use std::time::Duration;
use std::time::Instant;

use tokio::runtime::Runtime;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tonic::codec::ProstCodec;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::Channel;
use tonic::transport::Endpoint;
use tracing::debug;
use tracing::trace;

use super::transport::DiscoverStream;
use super::transport::StreamEvent;
use super::transport::StreamSink;
use super::transport::Transport;
use super::transport::TransportError;
use super::transport::UnaryCallback;
use super::transport::UnaryRequest;
use crate::constants::HTTP2_KEEPALIVE_INTERVAL;
use crate::constants::TCP_KEEPALIVE;
use crate::proto;
use crate::Error;
use crate::HostPort;
use crate::Result;

pub struct GrpcTransport {
    runtime: Option<Runtime>,
}

impl GrpcTransport {
    pub fn new() -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("polaris-grpc")
            .enable_all()
            .build()
            .map_err(|e| Error::Fatal(format!("failed to start grpc runtime: {e}")))?;
        Ok(Self {
            runtime: Some(runtime),
        })
    }

    fn spawn<F>(
        &self,
        future: F,
    ) -> Option<JoinHandle<()>>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.runtime.as_ref().map(|rt| rt.spawn(future))
    }
}

impl Drop for GrpcTransport {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

async fn connect(
    addr: &HostPort,
    connect_timeout: Duration,
) -> std::result::Result<Channel, TransportError> {
    let endpoint = Endpoint::try_from(format!("http://{addr}"))
        .map_err(|e| TransportError::Connect(e.to_string()))?
        .connect_timeout(connect_timeout)
        .tcp_keepalive(Some(TCP_KEEPALIVE))
        .http2_keep_alive_interval(HTTP2_KEEPALIVE_INTERVAL);
    endpoint
        .connect()
        .await
        .map_err(|e| TransportError::Connect(e.to_string()))
}

async fn run_stream(
    addr: HostPort,
    connect_timeout: Duration,
    requests: mpsc::UnboundedReceiver<proto::DiscoverRequest>,
    sink: StreamSink,
) {
    let begin = Instant::now();
    let channel = match connect(&addr, connect_timeout).await {
        Ok(channel) => channel,
        Err(e) => {
            sink(StreamEvent::ConnectFailed(e));
            return;
        }
    };
    sink(StreamEvent::Connected {
        elapsed: begin.elapsed(),
    });

    let mut grpc = tonic::client::Grpc::new(channel);
    if let Err(e) = grpc.ready().await {
        sink(StreamEvent::RemoteClosed(Some(TransportError::Rpc(e.to_string()))));
        return;
    }
    let codec = ProstCodec::<proto::DiscoverRequest, proto::DiscoverResponse>::default();
    let path = PathAndQuery::from_static(proto::DISCOVER_PATH);
    let outbound = UnboundedReceiverStream::new(requests);

    let mut inbound = match grpc.streaming(tonic::Request::new(outbound), path, codec).await {
        Ok(response) => response.into_inner(),
        Err(status) => {
            sink(StreamEvent::RemoteClosed(Some(TransportError::Rpc(status.to_string()))));
            return;
        }
    };
    loop {
        match inbound.message().await {
            Ok(Some(response)) => {
                trace!(addr = %addr, code = response.code, "discover response received");
                sink(StreamEvent::Message(response));
            }
            Ok(None) => {
                sink(StreamEvent::RemoteClosed(None));
                return;
            }
            Err(status) => {
                sink(StreamEvent::RemoteClosed(Some(TransportError::Rpc(status.to_string()))));
                return;
            }
        }
    }
}

async fn call<M>(
    channel: Channel,
    path: &'static str,
    message: M,
) -> std::result::Result<proto::Response, TransportError>
where
    M: prost::Message + Send + Sync + 'static,
{
    let mut grpc = tonic::client::Grpc::new(channel);
    grpc.ready()
        .await
        .map_err(|e| TransportError::Rpc(e.to_string()))?;
    let codec = ProstCodec::<M, proto::Response>::default();
    grpc.unary(tonic::Request::new(message), PathAndQuery::from_static(path), codec)
        .await
        .map(|response| response.into_inner())
        .map_err(|status| TransportError::Rpc(status.to_string()))
}

async fn run_unary(
    addr: HostPort,
    request: UnaryRequest,
    connect_timeout: Duration,
    timeout: Duration,
) -> std::result::Result<proto::Response, TransportError> {
    let channel = connect(&addr, connect_timeout).await?;
    let path = request.path();
    let call = async move {
        match request {
            UnaryRequest::Register(instance)
            | UnaryRequest::Deregister(instance)
            | UnaryRequest::Heartbeat(instance) => call(channel, path, instance).await,
            UnaryRequest::ReportClient(client) => call(channel, path, client).await,
        }
    };
    tokio::time::timeout(timeout, call)
        .await
        .map_err(|_| TransportError::Timeout)?
}

/// Outbound half of a stream running on the transport runtime.
struct GrpcStream {
    requests: mpsc::UnboundedSender<proto::DiscoverRequest>,
    task: Option<JoinHandle<()>>,
}

impl DiscoverStream for GrpcStream {
    fn send(
        &mut self,
        request: proto::DiscoverRequest,
    ) -> std::result::Result<(), TransportError> {
        self.requests.send(request).map_err(|_| TransportError::Closed)
    }
}

impl Drop for GrpcStream {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Transport for GrpcTransport {
    fn open_stream(
        &self,
        addr: &HostPort,
        connect_timeout: Duration,
        sink: StreamSink,
    ) -> Box<dyn DiscoverStream> {
        debug!(addr = %addr, "opening discover stream");
        let (requests, outbound) = mpsc::unbounded_channel();
        let task = self.spawn(run_stream(addr.clone(), connect_timeout, outbound, sink));
        Box::new(GrpcStream { requests, task })
    }

    fn unary(
        &self,
        addr: &HostPort,
        request: UnaryRequest,
        connect_timeout: Duration,
        timeout: Duration,
        done: UnaryCallback,
    ) {
        let addr = addr.clone();
        let kind = request.kind();
        let spawned = self.spawn(async move {
            let result = run_unary(addr.clone(), request, connect_timeout, timeout).await;
            debug!(addr = %addr, request = %kind, ok = result.is_ok(), "unary call finished");
            done(result);
        });
        if spawned.is_none() {
            debug!(request = %kind, "grpc runtime gone, request dropped");
        }
    }
}
