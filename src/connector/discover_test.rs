use std::sync::Arc;
use std::time::Duration;

use super::*;
use crate::proto::code;
use crate::reactor::Reactor;
use crate::test_utils::*;
use crate::ConnectorConfig;
use crate::DataStatus;
use crate::HostPort;
use crate::Instance;
use crate::SystemServiceConfig;

const SEED: &str = "10.1.0.1:8091";

struct Harness {
    reactor: Reactor<DiscoverConnector>,
    transport: Arc<FakeTransport>,
    reporter: Arc<RecordingReporter>,
}

impl Harness {
    fn new(config: ConnectorConfig) -> Self {
        enable_logger();
        let transport = Arc::new(FakeTransport::default());
        let reporter = Arc::new(RecordingReporter::default());
        let connector = DiscoverConnector::new(config, transport.clone(), reporter.clone());
        Self {
            reactor: Reactor::new(connector),
            transport,
            reporter,
        }
    }

    fn start(&mut self) {
        self.reactor.execute(|conn, sched| conn.start(sched));
    }

    fn drain(&mut self) {
        while self.reactor.run_once() {}
    }

    fn connect(&mut self) {
        self.transport.emit_last(StreamEvent::Connected {
            elapsed: Duration::from_millis(10),
        });
        self.drain();
    }

    fn deliver(
        &mut self,
        response: proto::DiscoverResponse,
    ) {
        self.transport.emit_last(StreamEvent::Message(response));
        self.drain();
    }

    fn listen(
        &mut self,
        key: &ServiceKey,
        data_type: DataType,
        disk_revision: &str,
    ) -> RecordingHandler {
        let handler = RecordingHandler::default();
        let boxed = Box::new(handler.clone());
        let key = ServiceKeyWithType::new(key.clone(), data_type);
        let revision = disk_revision.to_string();
        self.reactor.execute(move |conn, sched| {
            conn.add_listener(sched, key, Duration::from_secs(2), revision, boxed)
        });
        handler
    }

    fn conn(&self) -> &DiscoverConnector {
        self.reactor.state()
    }
}

fn seed_config() -> ConnectorConfig {
    ConnectorConfig {
        addresses: vec![SEED.to_string()],
        ..Default::default()
    }
}

fn discover_service() -> ServiceKey {
    ServiceKey::new("Polaris", "polaris.discover")
}

fn bootstrap_config() -> ConnectorConfig {
    ConnectorConfig {
        discover_service: Some(SystemServiceConfig {
            namespace: "Polaris".to_string(),
            name: "polaris.discover".to_string(),
        }),
        ..seed_config()
    }
}

#[test]
fn test_start_opens_stream_to_seed() {
    let mut h = Harness::new(seed_config());
    assert_eq!(h.conn().switch_state(), SwitchState::Init);

    h.start();

    assert_eq!(h.transport.stream_count(), 1);
    assert_eq!(h.transport.stream_addr(0), HostPort::new("10.1.0.1", 8091));
    assert_eq!(h.transport.connect_timeout(0), Duration::from_millis(200));
    assert_eq!(h.conn().switch_state(), SwitchState::Begin);
    // No discover service configured, every listener may use the seed
    assert_eq!(h.conn().stream_state(), StreamState::Init);
    // Connect timeout guard
    assert_eq!(h.reactor.scheduler().timer_count(), 1);
}

#[test]
fn test_listener_waits_for_connection() {
    let mut h = Harness::new(seed_config());
    h.start();
    let key = test_key();
    h.listen(&key, DataType::Instances, "disk-r0");

    assert_eq!(h.conn().pending_count(), 1);
    assert!(h.transport.sent(0).is_empty());

    h.connect();

    assert_eq!(h.conn().switch_state(), SwitchState::Normal);
    assert_eq!(h.conn().pending_count(), 0);
    let sent = h.transport.sent(0);
    assert_eq!(sent.len(), 1);
    let service = sent[0].service.as_ref().unwrap();
    assert_eq!(service.name, "svc");
    assert_eq!(service.revision, "disk-r0");
    assert_eq!(sent[0].r#type, proto::DiscoverType::Instance as i32);
}

#[test]
fn test_listener_registered_on_connected_stream_is_sent_immediately() {
    let mut h = Harness::new(seed_config());
    h.start();
    h.connect();

    h.listen(&test_key(), DataType::RouteRule, "");

    assert_eq!(h.conn().pending_count(), 0);
    assert_eq!(h.transport.sent(0).len(), 1);
    assert_eq!(h.transport.sent(0)[0].r#type, proto::DiscoverType::Routing as i32);
}

#[test]
fn test_duplicate_listener_is_ignored() {
    let mut h = Harness::new(seed_config());
    h.start();
    h.connect();
    let key = test_key();
    h.listen(&key, DataType::Instances, "");
    h.listen(&key, DataType::Instances, "");

    assert_eq!(h.conn().listener_count(), 1);
    assert_eq!(h.transport.sent(0).len(), 1);
}

#[test]
fn test_update_then_sync_for_same_revision() {
    let mut h = Harness::new(seed_config());
    h.start();
    h.connect();
    let key = test_key();
    let handler = h.listen(&key, DataType::Instances, "");

    h.deliver(instances_response_n(&key, "r1", 3));

    let updates = handler.updates();
    assert_eq!(updates.len(), 1);
    let data = updates[0].as_ref().unwrap();
    assert_eq!(data.cache_version(), 1);
    assert_eq!(data.revision(), "r1");
    assert_eq!(data.status(), DataStatus::Syncing);
    assert_eq!(data.instances().unwrap().len(), 3);

    h.deliver(instances_response_n(&key, "r1", 3));

    assert_eq!(handler.updates().len(), 1);
    assert_eq!(handler.sync_count(), 1);
}

#[test]
fn test_new_revision_takes_next_cache_version() {
    let mut h = Harness::new(seed_config());
    h.start();
    h.connect();
    let key = test_key();
    let instances = h.listen(&key, DataType::Instances, "");
    let routing = h.listen(&key, DataType::RouteRule, "");

    h.deliver(instances_response_n(&key, "r1", 1));
    h.deliver(routing_response(&key, "rr1"));
    h.deliver(instances_response_n(&key, "r2", 2));

    let versions: Vec<u64> = instances
        .updates()
        .iter()
        .map(|d| d.as_ref().unwrap().cache_version())
        .collect();
    assert_eq!(versions, vec![1, 3]);
    assert_eq!(routing.updates()[0].as_ref().unwrap().cache_version(), 2);
}

#[test]
fn test_data_no_change_is_sync() {
    let mut h = Harness::new(seed_config());
    h.start();
    h.connect();
    let key = test_key();
    let handler = h.listen(&key, DataType::Instances, "");
    h.deliver(instances_response_n(&key, "r1", 1));

    h.deliver(response_with_code(&key, DataType::Instances, code::DATA_NO_CHANGE, "r1"));

    assert_eq!(handler.updates().len(), 1);
    assert_eq!(handler.sync_count(), 1);
}

#[test]
fn test_not_found_published_once() {
    let mut h = Harness::new(seed_config());
    h.start();
    h.connect();
    let key = test_key();
    let handler = h.listen(&key, DataType::Instances, "");

    h.deliver(response_with_code(&key, DataType::Instances, code::NOT_FOUND_SERVICE, ""));
    h.deliver(response_with_code(&key, DataType::Instances, code::NOT_FOUND_SERVICE, ""));

    let updates = handler.updates();
    assert_eq!(updates.len(), 1);
    assert!(updates[0].as_ref().unwrap().is_not_found());
    assert_eq!(handler.sync_count(), 1);
    // A not-found answer keeps the stream
    assert_eq!(h.transport.stream_count(), 1);
}

#[test]
fn test_response_arms_refresh_timer() {
    let mut h = Harness::new(seed_config());
    h.start();
    h.connect();
    let key = test_key();
    h.listen(&key, DataType::Instances, "");
    // switch interval + message timeout
    assert_eq!(h.reactor.scheduler().timer_count(), 2);

    h.deliver(instances_response_n(&key, "r1", 1));

    // message timeout replaced by the refresh timer
    assert_eq!(h.reactor.scheduler().timer_count(), 2);
    assert_eq!(h.conn().pending_count(), 0);
}

#[test]
fn test_refresh_timer_resends_request() {
    let mut h = Harness::new(seed_config());
    h.start();
    h.connect();
    let key = test_key();
    let handler = RecordingHandler::default();
    let boxed = Box::new(handler.clone());
    let listener_key = ServiceKeyWithType::new(key.clone(), DataType::Instances);
    h.reactor.execute(move |conn, sched| {
        conn.add_listener(sched, listener_key, Duration::from_millis(5), String::new(), boxed)
    });
    h.deliver(instances_response_n(&key, "r1", 1));

    std::thread::sleep(Duration::from_millis(20));
    h.drain();

    let sent = h.transport.sent(0);
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[1].service.as_ref().unwrap().revision, "r1");
}

#[test]
fn test_remote_close_switches_and_requeues_inflight() {
    let mut h = Harness::new(seed_config());
    h.start();
    h.connect();
    let key = test_key();
    h.listen(&key, DataType::Instances, "");

    h.transport
        .emit_last(StreamEvent::RemoteClosed(Some(TransportError::Rpc("reset".to_string()))));
    h.drain();

    assert_eq!(h.transport.stream_count(), 2);
    assert_eq!(h.conn().switch_state(), SwitchState::Begin);
    assert_eq!(h.conn().pending_count(), 1);
    let results = h.reporter.results();
    let last = results.last().unwrap();
    assert_eq!(last.code, ServerCode::RemoteClose.as_i32());
    assert_eq!(last.instance, HostPort::new("10.1.0.1", 8091));

    h.connect();
    assert_eq!(h.conn().pending_count(), 0);
    assert_eq!(h.transport.sent(1).len(), 1);
}

#[test]
fn test_connect_timeout_expands_and_switches() {
    let mut h = Harness::new(seed_config());
    h.start();

    h.reactor.execute(|conn, sched| conn.on_switch_timer(sched));

    assert_eq!(h.transport.stream_count(), 2);
    assert_eq!(h.conn().switch_state(), SwitchState::Begin);
    assert_eq!(h.transport.connect_timeout(1), Duration::from_millis(300));
    let results = h.reporter.results();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].code, ServerCode::ConnectError.as_i32());
    assert_eq!(results[0].status, CallStatus::Error);
}

#[test]
fn test_connect_success_resets_connect_timeout() {
    let mut h = Harness::new(seed_config());
    h.start();
    h.reactor.execute(|conn, sched| conn.on_switch_timer(sched));
    h.reactor.execute(|conn, sched| conn.on_switch_timer(sched));
    assert_eq!(h.transport.connect_timeout(2), Duration::from_millis(450));

    // 10ms * 1.5 is clamped up to the 200ms minimum
    h.connect();
    h.reactor.execute(|conn, sched| conn.server_switch(sched, "test"));

    assert_eq!(h.transport.connect_timeout(3), Duration::from_millis(200));
}

#[test]
fn test_periodic_switch_after_normal() {
    let mut h = Harness::new(seed_config());
    h.start();
    h.connect();
    assert_eq!(h.conn().switch_state(), SwitchState::Normal);

    h.reactor.execute(|conn, sched| conn.on_switch_timer(sched));

    assert_eq!(h.transport.stream_count(), 2);
    assert_eq!(h.conn().switch_state(), SwitchState::Begin);
    let results = h.reporter.results();
    assert_eq!(results.last().unwrap().status, CallStatus::Ok);
}

#[test]
fn test_events_of_replaced_stream_are_dropped() {
    let mut h = Harness::new(seed_config());
    h.start();
    h.reactor.execute(|conn, sched| conn.server_switch(sched, "test"));
    assert_eq!(h.transport.stream_count(), 2);

    h.transport.emit(
        0,
        StreamEvent::Connected {
            elapsed: Duration::from_millis(1),
        },
    );
    h.drain();

    assert_eq!(h.conn().switch_state(), SwitchState::Begin);
}

#[test]
fn test_server_error_switches_but_invalid_request_does_not() {
    let mut h = Harness::new(seed_config());
    h.start();
    h.connect();
    let key = test_key();
    h.listen(&key, DataType::Instances, "");

    h.deliver(response_with_code(&key, DataType::Instances, code::UNAUTHORIZED, ""));
    assert_eq!(h.transport.stream_count(), 1);

    h.deliver(response_with_code(&key, DataType::Instances, code::EXECUTE_EXCEPTION, ""));
    assert_eq!(h.transport.stream_count(), 2);
    let codes: Vec<i32> = h.reporter.results().iter().map(|r| r.code).collect();
    assert!(codes.contains(&ServerCode::Unauthorized.as_i32()));
    assert!(codes.contains(&ServerCode::ServerError.as_i32()));
}

#[test]
fn test_discover_timeout_expands_message_timeout_and_switches() {
    let mut h = Harness::new(ConnectorConfig {
        message_timeout_ms: 5,
        ..seed_config()
    });
    h.start();
    h.connect();
    h.listen(&test_key(), DataType::Instances, "");

    std::thread::sleep(Duration::from_millis(20));
    h.drain();

    assert_eq!(h.transport.stream_count(), 2);
    assert_eq!(h.conn().pending_count(), 1);
    assert_eq!(h.conn().message_timeout.timeout(), Duration::from_millis(10));
}

#[test]
fn test_remove_listener_notifies_handler_with_none() {
    let mut h = Harness::new(seed_config());
    h.start();
    h.connect();
    let key = test_key();
    let handler = h.listen(&key, DataType::Instances, "");
    h.deliver(instances_response_n(&key, "r1", 1));

    let listener_key = ServiceKeyWithType::new(key.clone(), DataType::Instances);
    h.reactor
        .execute(move |conn, sched| conn.remove_listener(sched, &listener_key));

    assert_eq!(h.conn().listener_count(), 0);
    let updates = handler.updates();
    assert_eq!(updates.len(), 2);
    assert!(updates[1].is_none());
    // Only the periodic switch timer remains
    assert_eq!(h.reactor.scheduler().timer_count(), 1);
}

#[test]
fn test_seed_stream_only_sends_discover_service() {
    let mut h = Harness::new(bootstrap_config());
    h.start();
    assert_eq!(h.conn().stream_state(), StreamState::NotInit);
    h.connect();

    h.listen(&test_key(), DataType::Instances, "");
    h.listen(&discover_service(), DataType::Instances, "");

    let sent = h.transport.sent(0);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].service.as_ref().unwrap().name, "polaris.discover");
    assert_eq!(h.conn().pending_count(), 1);
}

#[test]
fn test_migrates_to_discover_service_instance() {
    let mut h = Harness::new(bootstrap_config());
    let mut selector = MockInstanceSelector::new();
    selector
        .expect_select_instance()
        .returning(|_, _| Ok(Instance::from_proto(&proto_instance("d1", "10.2.0.1", 8091))));
    h.reactor.state_mut().set_selector(Arc::new(selector));
    h.start();
    h.connect();
    let discover = discover_service();
    h.listen(&test_key(), DataType::Instances, "");
    h.listen(&discover, DataType::Instances, "");

    // The switch timer fires right away and moves the stream
    h.deliver(instances_response_n(&discover, "d-r1", 1));

    assert_eq!(h.transport.stream_count(), 2);
    assert_eq!(h.transport.stream_addr(1), HostPort::new("10.2.0.1", 8091));
    assert_eq!(h.conn().stream_state(), StreamState::Init);
    assert_eq!(h.conn().switch_state(), SwitchState::Begin);

    h.connect();
    let sent = h.transport.sent(1);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].service.as_ref().unwrap().name, "svc");
}

#[test]
fn test_failed_selection_falls_back_to_seed() {
    let mut h = Harness::new(bootstrap_config());
    let mut selector = MockInstanceSelector::new();
    selector
        .expect_select_instance()
        .returning(|_, _| Err(ReturnCode::InstanceNotFound));
    h.reactor.state_mut().set_selector(Arc::new(selector));
    h.start();
    h.connect();
    let discover = discover_service();
    h.listen(&discover, DataType::Instances, "");

    h.deliver(instances_response_n(&discover, "d-r1", 1));

    assert_eq!(h.transport.stream_count(), 2);
    assert_eq!(h.transport.stream_addr(1), HostPort::new("10.1.0.1", 8091));
    assert_eq!(h.conn().stream_state(), StreamState::NotInit);
}

#[test]
fn test_random_seed_skips_excluded_servers() {
    let h = Harness::new(ConnectorConfig {
        addresses: vec!["10.1.0.1:8091".to_string(), "10.1.0.2:8091".to_string()],
        ..Default::default()
    });
    h.reporter.exclude(HostPort::new("10.1.0.1", 8091));

    for _ in 0..20 {
        assert_eq!(h.conn().random_seed(), Some(HostPort::new("10.1.0.2", 8091)));
    }

    h.reporter.exclude(HostPort::new("10.1.0.2", 8091));
    assert!(h.conn().random_seed().is_some());
}
