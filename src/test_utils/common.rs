use std::sync::Arc;
use std::time::Instant;

use crate::proto;
use crate::proto::code;
use crate::DataStatus;
use crate::DataType;
use crate::ServiceData;
use crate::ServiceKey;

pub(crate) fn test_key() -> ServiceKey {
    ServiceKey::new("Test", "svc")
}

pub(crate) fn proto_instance(
    id: &str,
    host: &str,
    port: u32,
) -> proto::Instance {
    proto::Instance {
        id: id.to_string(),
        host: host.to_string(),
        port,
        weight: 100,
        healthy: Some(true),
        isolate: Some(false),
        ..Default::default()
    }
}

fn proto_service(
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

pub(crate) fn instances_response(
    key: &ServiceKey,
    revision: &str,
    instances: Vec<proto::Instance>,
) -> proto::DiscoverResponse {
    proto::DiscoverResponse {
        code: code::EXECUTE_SUCCESS,
        r#type: proto::DiscoverType::Instance as i32,
        service: Some(proto_service(key, revision)),
        instances,
        ..Default::default()
    }
}

/// `count` healthy instances on 10.0.0.{1..}:8080.
pub(crate) fn instances_response_n(
    key: &ServiceKey,
    revision: &str,
    count: usize,
) -> proto::DiscoverResponse {
    let instances = (1..=count)
        .map(|i| proto_instance(&format!("ins-{i}"), &format!("10.0.0.{i}"), 8080))
        .collect();
    instances_response(key, revision, instances)
}

pub(crate) fn routing_response(
    key: &ServiceKey,
    revision: &str,
) -> proto::DiscoverResponse {
    let route = proto::Route {
        sources: vec![proto::Source {
            namespace: "Test".to_string(),
            service: "caller".to_string(),
            ..Default::default()
        }],
        destinations: vec![proto::Destination {
            namespace: key.namespace.clone(),
            service: key.name.clone(),
            weight: 100,
            ..Default::default()
        }],
    };
    proto::DiscoverResponse {
        code: code::EXECUTE_SUCCESS,
        r#type: proto::DiscoverType::Routing as i32,
        service: Some(proto_service(key, revision)),
        routing: Some(proto::Routing {
            namespace: key.namespace.clone(),
            service: key.name.clone(),
            inbounds: vec![route],
            revision: revision.to_string(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub(crate) fn response_with_code(
    key: &ServiceKey,
    data_type: DataType,
    code: u32,
    revision: &str,
) -> proto::DiscoverResponse {
    proto::DiscoverResponse {
        code,
        r#type: data_type.discover_type() as i32,
        service: Some(proto_service(key, revision)),
        ..Default::default()
    }
}

pub(crate) fn instances_data(
    key: &ServiceKey,
    revision: &str,
    count: usize,
    cache_version: u64,
) -> ServiceData {
    ServiceData::from_response(
        key.clone(),
        DataType::Instances,
        instances_response_n(key, revision, count),
        DataStatus::Syncing,
        cache_version,
    )
}

pub(crate) fn not_found_data(
    key: &ServiceKey,
    data_type: DataType,
    cache_version: u64,
) -> ServiceData {
    ServiceData::from_response(
        key.clone(),
        data_type,
        response_with_code(key, data_type, code::NOT_FOUND_SERVICE, ""),
        DataStatus::NotFound,
        cache_version,
    )
}

/// Instances snapshot restored from a backup, usable from `available_time`.
pub(crate) fn disk_instances_data(
    key: &ServiceKey,
    revision: &str,
    count: usize,
    available_time: Instant,
) -> Arc<ServiceData> {
    let json = instances_data(key, revision, count, 0)
        .to_json()
        .unwrap();
    Arc::new(ServiceData::from_json(&json, available_time).unwrap())
}

static LOGGER_INIT: once_cell::sync::Lazy<()> = once_cell::sync::Lazy::new(|| {
    env_logger::init();
});

pub fn enable_logger() {
    *LOGGER_INIT;
    println!("setup logger for unit test.");
}
