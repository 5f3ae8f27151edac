use std::collections::HashSet;
use std::time::Duration;
use std::time::Instant;

use super::*;
use crate::proto;
use crate::test_utils::*;

#[test]
fn test_instances_are_split_by_isolation_and_health() {
    let key = test_key();
    let mut isolated = proto_instance("ins-iso", "10.0.0.9", 8080);
    isolated.isolate = Some(true);
    let mut zero = proto_instance("ins-zero", "10.0.0.8", 8080);
    zero.weight = 0;
    let mut sick = proto_instance("ins-sick", "10.0.0.7", 8080);
    sick.healthy = Some(false);
    let response = instances_response(
        &key,
        "r1",
        vec![proto_instance("ins-ok", "10.0.0.1", 8080), isolated, zero, sick],
    );

    let data = ServiceData::from_response(key, DataType::Instances, response, DataStatus::Syncing, 1);
    let instances = data.instances().unwrap();

    assert_eq!(instances.len(), 4);
    assert_eq!(instances.instances().len(), 2);
    assert_eq!(instances.isolated().len(), 2);
    assert_eq!(instances.available().count(), 1);
    assert_eq!(
        instances.unhealthy().map(|i| i.id.as_str()).collect::<Vec<_>>(),
        vec!["ins-sick"]
    );
    assert_eq!(instances.total_weight(), 100);
    assert!(instances.get("ins-zero").is_some());
    assert!(instances.get("missing").is_none());
}

#[test]
fn test_duplicate_instance_on_same_address_is_skipped() {
    let key = test_key();
    let response = instances_response(
        &key,
        "r1",
        vec![
            proto_instance("ins-1", "10.0.0.1", 8080),
            proto_instance("ins-1", "10.0.0.1", 8080),
        ],
    );
    let data = ServiceData::from_response(key, DataType::Instances, response, DataStatus::Syncing, 1);
    assert_eq!(data.instances().unwrap().len(), 1);
}

#[test]
fn test_hash_conflict_is_resolved_to_unique_values() {
    let key = test_key();
    // One id on three addresses collides on the natural hash. Isolated copies
    // are kept apart from the id-keyed routable set, so all three survive.
    let build = || {
        let mut second = proto_instance("ins-1", "10.0.0.2", 8080);
        second.isolate = Some(true);
        let mut third = proto_instance("ins-1", "10.0.0.3", 8080);
        third.isolate = Some(true);
        let response = instances_response(
            &key,
            "r1",
            vec![proto_instance("ins-1", "10.0.0.1", 8080), second, third],
        );
        let data = ServiceData::from_response(
            key.clone(),
            DataType::Instances,
            response,
            DataStatus::Syncing,
            1,
        );
        let instances = data.instances().unwrap();
        instances
            .instances()
            .values()
            .chain(instances.isolated())
            .map(|i| i.hash)
            .collect::<Vec<u64>>()
    };

    let first = build();
    assert_eq!(first.len(), 3);
    assert_eq!(first[0], crate::utils::hash::murmur3_64(b"ins-1", 0));
    assert_eq!(first.iter().collect::<HashSet<_>>().len(), 3);
    assert_eq!(first, build());
}

#[test]
fn test_distinct_ids_get_distinct_hashes() {
    let key = test_key();
    let data = instances_data(&key, "r1", 50, 1);
    let hashes: HashSet<u64> = data
        .instances()
        .unwrap()
        .instances()
        .values()
        .map(|i| i.hash)
        .collect();
    assert_eq!(hashes.len(), 50);
    assert!(!hashes.contains(&0));
}

#[test]
fn test_service_metadata_flags_are_case_insensitive() {
    let key = test_key();
    let mut response = instances_response_n(&key, "r1", 1);
    let service = response.service.as_mut().unwrap();
    service
        .metadata
        .insert("internal-enable-nearby".to_string(), "TRUE".to_string());
    service
        .metadata
        .insert("internal-canary".to_string(), "no".to_string());

    let data = ServiceData::from_response(key, DataType::Instances, response, DataStatus::Syncing, 1);
    let instances = data.instances().unwrap();
    assert!(instances.is_nearby_enabled());
    assert!(!instances.is_canary_enabled());
}

#[test]
fn test_json_backup_restores_as_disk_data() {
    let key = test_key();
    let data = instances_data(&key, "r1", 3, 7);
    let json = data.to_json().unwrap();

    let later = Instant::now() + Duration::from_secs(60);
    let restored = ServiceData::from_json(&json, later).unwrap();

    assert_eq!(restored.key(), &key);
    assert_eq!(restored.data_type(), DataType::Instances);
    assert_eq!(restored.revision(), "r1");
    assert_eq!(restored.status(), DataStatus::InitFromDisk);
    assert_eq!(restored.cache_version(), 0);
    assert_eq!(restored.instances().unwrap().len(), 3);
    assert!(!restored.is_available());

    let now = ServiceData::from_json(&json, Instant::now()).unwrap();
    assert!(now.is_available());
}

#[test]
fn test_from_json_rejects_unknown_type() {
    let response = proto::DiscoverResponse {
        r#type: proto::DiscoverType::Cluster as i32,
        service: Some(proto::Service {
            namespace: "Test".to_string(),
            name: "svc".to_string(),
            ..Default::default()
        }),
        ..Default::default()
    };
    let json = serde_json::to_string(&response).unwrap();
    assert!(ServiceData::from_json(&json, Instant::now()).is_err());
    assert!(ServiceData::from_json("not json", Instant::now()).is_err());
}

#[test]
fn test_route_rule_payload_and_revision_fallback() {
    let key = test_key();
    let mut response = routing_response(&key, "rr1");
    response.service.as_mut().unwrap().revision.clear();

    let data = ServiceData::from_response(
        key.clone(),
        DataType::RouteRule,
        response,
        DataStatus::Syncing,
        2,
    );
    assert_eq!(data.revision(), "rr1");
    let rule = data.route_rule().unwrap();
    assert_eq!(rule.inbounds().len(), 1);
    assert!(rule
        .referenced_services()
        .contains(&ServiceKey::new("Test", "caller")));
    assert!(data.instances().is_none());
}

#[test]
fn test_not_found_snapshot_has_empty_payload() {
    let key = test_key();
    let data = not_found_data(&key, DataType::Instances, 3);
    assert!(data.is_not_found());
    assert!(data.instances().unwrap().is_empty());
    assert!(data.is_available());
}
