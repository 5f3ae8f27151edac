use std::sync::Arc;
use std::thread::sleep;
use std::time::Duration;

use super::*;
use crate::test_utils::*;
use crate::ReturnCode;
use crate::ServiceKey;

fn tracked_fixture(
    key: &ServiceKey,
    count: usize,
) -> RegistryFixture {
    let fx = RegistryFixture::new(Arc::new(NoopPersist));
    fx.registry
        .load_service_data_with_notify(key, DataType::Instances)
        .unwrap();
    fx.connector
        .update(key, DataType::Instances, Some(instances_data(key, "r1", count, 1)));
    fx
}

#[test]
fn lookup_should_build_index_on_first_use() {
    let key = test_key();
    let fx = tracked_fixture(&key, 3);
    let index = HostPortIndex::new();

    let id = index
        .get_instance_id(&fx.registry, &key, "10.0.0.2", 8080)
        .unwrap();

    assert_eq!(id, "ins-2");
    assert_eq!(index.len(), 1);
}

#[test]
fn miss_on_current_snapshot_should_be_instance_not_found() {
    let key = test_key();
    let fx = tracked_fixture(&key, 2);
    let index = HostPortIndex::new();
    index
        .get_instance_id(&fx.registry, &key, "10.0.0.1", 8080)
        .unwrap();

    let err = index
        .get_instance_id(&fx.registry, &key, "10.0.0.9", 8080)
        .unwrap_err();
    assert_eq!(err.return_code(), ReturnCode::InstanceNotFound);
    let err = index
        .get_instance_id(&fx.registry, &key, "10.0.0.1", 9090)
        .unwrap_err();
    assert_eq!(err.return_code(), ReturnCode::InstanceNotFound);
}

#[test]
fn newer_snapshot_should_rebuild_index() {
    let key = test_key();
    let fx = tracked_fixture(&key, 1);
    let index = HostPortIndex::new();
    assert!(index
        .get_instance_id(&fx.registry, &key, "10.0.0.3", 8080)
        .is_err());

    fx.connector
        .update(&key, DataType::Instances, Some(instances_data(&key, "r2", 3, 2)));

    let id = index
        .get_instance_id(&fx.registry, &key, "10.0.0.3", 8080)
        .unwrap();
    assert_eq!(id, "ins-3");
}

#[test]
fn missing_service_should_be_service_not_found() {
    let key = test_key();
    let fx = RegistryFixture::new(Arc::new(NoopPersist));
    let index = HostPortIndex::new();

    let err = index
        .get_instance_id(&fx.registry, &key, "10.0.0.1", 8080)
        .unwrap_err();
    assert_eq!(err.return_code(), ReturnCode::ServiceNotFound);

    fx.registry
        .load_service_data_with_notify(&key, DataType::Instances)
        .unwrap();
    fx.connector
        .update(&key, DataType::Instances, Some(not_found_data(&key, DataType::Instances, 1)));
    let err = index
        .get_instance_id(&fx.registry, &key, "10.0.0.1", 8080)
        .unwrap_err();
    assert_eq!(err.return_code(), ReturnCode::ServiceNotFound);
    assert!(index.is_empty());
}

#[test]
fn idle_and_untracked_indexes_should_be_dropped() {
    let key = test_key();
    let other = ServiceKey::new("Test", "other");
    let fx = tracked_fixture(&key, 1);
    fx.registry
        .load_service_data_with_notify(&other, DataType::Instances)
        .unwrap();
    fx.connector
        .update(&other, DataType::Instances, Some(instances_data(&other, "r1", 1, 2)));
    let index = HostPortIndex::new();
    index
        .get_instance_id(&fx.registry, &key, "10.0.0.1", 8080)
        .unwrap();
    index
        .get_instance_id(&fx.registry, &other, "10.0.0.1", 8080)
        .unwrap();

    index.retain_services(|k| *k == key);
    assert_eq!(index.len(), 1);

    assert_eq!(index.clear_idle(Duration::from_secs(60)), 0);
    sleep(Duration::from_millis(20));
    assert_eq!(index.clear_idle(Duration::from_millis(10)), 1);
    assert!(index.is_empty());
}
