//! In-process discovery server shared by the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use parking_lot::Mutex;
use polaris_discovery::proto;
use polaris_discovery::proto::code;
use polaris_discovery::DiscoverStream;
use polaris_discovery::HostPort;
use polaris_discovery::ServiceKey;
use polaris_discovery::StreamEvent;
use polaris_discovery::StreamSink;
use polaris_discovery::Transport;
use polaris_discovery::TransportError;
use polaris_discovery::UnaryCallback;
use polaris_discovery::UnaryRequest;

type ResourceKey = (String, String, i32);

#[derive(Default)]
struct ServerState {
    online: bool,
    resources: HashMap<ResourceKey, proto::DiscoverResponse>,
    sinks: Vec<Arc<StreamSink>>,
    unary: Vec<UnaryRequest>,
    discover_requests: usize,
}

/// Answers discover requests from an in-memory resource table and pushes
/// every published change to the open streams.
#[derive(Clone)]
pub struct FakeServer {
    state: Arc<Mutex<ServerState>>,
}

impl FakeServer {
    pub fn online() -> Self {
        Self {
            state: Arc::new(Mutex::new(ServerState {
                online: true,
                ..Default::default()
            })),
        }
    }

    /// Refuses every connection.
    pub fn offline() -> Self {
        Self {
            state: Arc::new(Mutex::new(ServerState::default())),
        }
    }

    pub fn publish_instances(
        &self,
        key: &ServiceKey,
        revision: &str,
        hosts: &[&str],
    ) {
        let instances = hosts
            .iter()
            .enumerate()
            .map(|(i, host)| proto::Instance {
                id: format!("ins-{}", i + 1),
                host: host.to_string(),
                port: 8080,
                weight: 100,
                healthy: Some(true),
                isolate: Some(false),
                ..Default::default()
            })
            .collect();
        let response = proto::DiscoverResponse {
            code: code::EXECUTE_SUCCESS,
            r#type: proto::DiscoverType::Instance as i32,
            service: Some(service_block(key, revision)),
            instances,
            ..Default::default()
        };
        self.publish(key, response);
    }

    pub fn discover_requests(&self) -> usize {
        self.state.lock().discover_requests
    }

    pub fn unary_requests(&self) -> Vec<UnaryRequest> {
        self.state.lock().unary.clone()
    }

    fn publish(
        &self,
        key: &ServiceKey,
        response: proto::DiscoverResponse,
    ) {
        let sinks = {
            let mut state = self.state.lock();
            state
                .resources
                .insert(resource_key(key, response.r#type), response.clone());
            state.sinks.clone()
        };
        for sink in sinks {
            sink(StreamEvent::Message(response.clone()));
        }
    }

    fn answer(
        &self,
        request: &proto::DiscoverRequest,
    ) -> proto::DiscoverResponse {
        let service = request.service.clone().unwrap_or_default();
        let key = ServiceKey::new(service.namespace.clone(), service.name.clone());
        let mut state = self.state.lock();
        state.discover_requests += 1;
        match state.resources.get(&resource_key(&key, request.r#type)) {
            Some(response) => response.clone(),
            None => proto::DiscoverResponse {
                code: code::NOT_FOUND_RESOURCE,
                r#type: request.r#type,
                service: Some(service_block(&key, "")),
                ..Default::default()
            },
        }
    }
}

fn resource_key(
    key: &ServiceKey,
    discover_type: i32,
) -> ResourceKey {
    (key.namespace.clone(), key.name.clone(), discover_type)
}

fn service_block(
    key: &ServiceKey,
    revision: &str,
) -> proto::Service {
    proto::Service {
        namespace: key.namespace.clone(),
        name: key.name.clone(),
        revision: revision.to_string(),
        ..Default::default()
    }
}

struct FakeStream {
    server: FakeServer,
    sink: Arc<StreamSink>,
}

impl DiscoverStream for FakeStream {
    fn send(
        &mut self,
        request: proto::DiscoverRequest,
    ) -> Result<(), TransportError> {
        let response = self.server.answer(&request);
        (self.sink)(StreamEvent::Message(response));
        Ok(())
    }
}

impl Transport for FakeServer {
    fn open_stream(
        &self,
        _addr: &HostPort,
        _connect_timeout: Duration,
        sink: StreamSink,
    ) -> Box<dyn DiscoverStream> {
        let sink = Arc::new(sink);
        let online = {
            let mut state = self.state.lock();
            if state.online {
                state.sinks.push(sink.clone());
            }
            state.online
        };
        if online {
            sink(StreamEvent::Connected {
                elapsed: Duration::from_millis(1),
            });
        } else {
            sink(StreamEvent::ConnectFailed(TransportError::Connect(
                "connection refused".to_string(),
            )));
        }
        Box::new(FakeStream {
            server: self.clone(),
            sink,
        })
    }

    fn unary(
        &self,
        _addr: &HostPort,
        request: UnaryRequest,
        _connect_timeout: Duration,
        _timeout: Duration,
        done: UnaryCallback,
    ) {
        let online = {
            let mut state = self.state.lock();
            state.unary.push(request.clone());
            state.online
        };
        if !online {
            done(Err(TransportError::Connect("connection refused".to_string())));
            return;
        }
        let instance = match request {
            UnaryRequest::Register(instance) => Some(proto::Instance {
                id: format!("{}:{}", instance.host, instance.port),
                ..instance
            }),
            _ => None,
        };
        done(Ok(proto::Response {
            code: code::EXECUTE_SUCCESS,
            instance,
            ..Default::default()
        }));
    }
}

pub fn enable_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Polls `condition` for up to two seconds.
pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}
