use std::collections::HashMap;
use std::collections::HashSet;

use super::*;
use crate::test_utils::*;

fn local_ids(data: &ServiceData) -> HashMap<String, u64> {
    data.instances()
        .unwrap()
        .instances()
        .values()
        .map(|i| (i.id.clone(), i.local_id))
        .collect()
}

#[test]
fn test_local_ids_are_reused_across_updates() {
    let key = test_key();
    let service = Service::new(key.clone(), 3);

    let mut first = instances_data(&key, "r1", 2, 1);
    service.assign_local_ids(&mut first);
    let first_ids = local_ids(&first);
    assert_eq!(first_ids.len(), 2);
    for id in first_ids.values() {
        assert_eq!(id >> 32, 3);
        assert_ne!(id & 0xffff_ffff, 0);
    }

    let mut second = instances_data(&key, "r2", 3, 2);
    service.assign_local_ids(&mut second);
    let second_ids = local_ids(&second);

    assert_eq!(second_ids["ins-1"], first_ids["ins-1"]);
    assert_eq!(second_ids["ins-2"], first_ids["ins-2"]);
    let unique: HashSet<u64> = second_ids.values().copied().collect();
    assert_eq!(unique.len(), 3);
}

#[test]
fn test_removed_instance_gets_fresh_id_when_it_returns() {
    let key = test_key();
    let service = Service::new(key.clone(), 1);

    let mut first = instances_data(&key, "r1", 2, 1);
    service.assign_local_ids(&mut first);
    let old = local_ids(&first)["ins-2"];

    let mut shrunk = instances_data(&key, "r2", 1, 2);
    service.assign_local_ids(&mut shrunk);

    let mut back = instances_data(&key, "r3", 2, 3);
    service.assign_local_ids(&mut back);
    assert_ne!(local_ids(&back)["ins-2"], old);
}

#[test]
fn test_non_instance_data_is_left_untouched() {
    let key = test_key();
    let service = Service::new(key.clone(), 1);
    let mut data = not_found_data(&key, DataType::RouteRule, 1);
    service.assign_local_ids(&mut data);
    assert!(data.instances().is_none());
}

#[test]
fn test_circuit_breaker_status_ignores_stale_versions() {
    let service = Service::new(test_key(), 1);
    let mut status = CircuitBreakerStatus {
        version: 2,
        ..Default::default()
    };
    status.open_instances.insert("ins-1".to_string());
    assert!(service.set_circuit_breaker_status(status));
    assert!(service.is_circuit_open("ins-1"));

    let stale = CircuitBreakerStatus {
        version: 1,
        ..Default::default()
    };
    assert!(!service.set_circuit_breaker_status(stale));
    assert!(service.is_circuit_open("ins-1"));
    assert_eq!(service.circuit_breaker_status().version, 2);
}

#[test]
fn test_dynamic_weights_and_data_versions() {
    let service = Service::new(test_key(), 1);
    let mut weights = DynamicWeights {
        version: 1,
        ..Default::default()
    };
    weights.weights.insert("ins-1".to_string(), 50);
    assert!(service.set_dynamic_weights(weights));
    assert_eq!(service.dynamic_weights().weights["ins-1"], 50);

    assert_eq!(service.data_version(DataType::Instances), None);
    service.record_data_version(DataType::Instances, 4);
    assert_eq!(service.data_version(DataType::Instances), Some(4));
}
