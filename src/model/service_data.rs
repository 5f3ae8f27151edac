//! Immutable snapshots of one (service, data type) pair.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::time::Instant;

use tracing::error;
use tracing::trace;
use tracing::warn;

use super::DataStatus;
use super::DataType;
use super::Instance;
use super::ServiceKey;
use crate::constants::CANARY_ENABLE_KEY;
use crate::constants::NEARBY_ENABLE_KEY;
use crate::proto;
use crate::utils::hash;
use crate::DiscoveryError;
use crate::Result;

/// Instance view of an Instances snapshot.
///
/// Isolated and zero-weight instances are kept apart from the routable set.
/// Unhealthy instances stay routable but are tracked as a subset.
#[derive(Debug, Clone, Default)]
pub struct ServiceInstances {
    metadata: HashMap<String, String>,
    nearby_enabled: bool,
    canary_enabled: bool,
    instances: BTreeMap<String, Instance>,
    isolated: Vec<Instance>,
    unhealthy: BTreeSet<String>,
}

impl ServiceInstances {
    pub fn from_response(
        key: &ServiceKey,
        response: &proto::DiscoverResponse,
    ) -> Self {
        let metadata = response
            .service
            .as_ref()
            .map(|s| s.metadata.clone())
            .unwrap_or_default();
        let flag = |name: &str| {
            metadata
                .get(name)
                .map(|v| v.eq_ignore_ascii_case("true"))
                .unwrap_or(false)
        };
        let nearby_enabled = flag(NEARBY_ENABLE_KEY);
        let canary_enabled = flag(CANARY_ENABLE_KEY);

        let mut taken: HashMap<u64, (String, u32)> = HashMap::new();
        let mut instances = BTreeMap::new();
        let mut isolated = Vec::new();

        for (idx, raw) in response.instances.iter().enumerate() {
            let mut instance = Instance::from_proto(raw);
            let natural = hash::murmur3_64(raw.id.as_bytes(), 0);
            instance.hash = natural;

            match taken.get(&natural).cloned() {
                None => {
                    taken.insert(natural, (raw.host.clone(), raw.port));
                }
                Some((host, port)) if host == raw.host && port == raw.port => {
                    error!(
                        service = %key,
                        idx,
                        id = %raw.id,
                        "duplicated instance {}:{}, skip",
                        raw.host,
                        raw.port
                    );
                    continue;
                }
                Some(_) => {
                    let resolved = hash::resolve_conflict(&raw.id, |h| taken.contains_key(&h));
                    warn!(service = %key, id = %raw.id, natural, resolved, "hash conflict resolved");
                    instance.hash = resolved;
                    if resolved != 0 {
                        taken.insert(resolved, (raw.host.clone(), raw.port));
                    }
                }
            }

            if instance.is_isolated() {
                trace!(service = %key, id = %instance.id, "instance isolated or zero weight");
                isolated.push(instance);
            } else {
                instances.insert(instance.id.clone(), instance);
            }
        }

        let unhealthy = instances
            .values()
            .filter(|i| !i.healthy)
            .map(|i| i.id.clone())
            .collect();

        Self {
            metadata,
            nearby_enabled,
            canary_enabled,
            instances,
            isolated,
            unhealthy,
        }
    }

    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    pub fn is_nearby_enabled(&self) -> bool {
        self.nearby_enabled
    }

    pub fn is_canary_enabled(&self) -> bool {
        self.canary_enabled
    }

    /// Routable instances (not isolated, weight above zero) keyed by id.
    pub fn instances(&self) -> &BTreeMap<String, Instance> {
        &self.instances
    }

    /// Healthy routable instances.
    pub fn available(&self) -> impl Iterator<Item = &Instance> {
        self.instances.values().filter(|i| i.healthy)
    }

    pub fn isolated(&self) -> &[Instance] {
        &self.isolated
    }

    pub fn unhealthy(&self) -> impl Iterator<Item = &Instance> {
        self.unhealthy.iter().filter_map(|id| self.instances.get(id))
    }

    pub fn get(
        &self,
        id: &str,
    ) -> Option<&Instance> {
        self.instances
            .get(id)
            .or_else(|| self.isolated.iter().find(|i| i.id == id))
    }

    pub fn total_weight(&self) -> u64 {
        self.available().map(|i| i.weight as u64).sum()
    }

    pub fn len(&self) -> usize {
        self.instances.len() + self.isolated.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn all_mut(&mut self) -> impl Iterator<Item = &mut Instance> {
        self.instances.values_mut().chain(self.isolated.iter_mut())
    }
}

/// Routing rules of one service.
#[derive(Debug, Clone, Default)]
pub struct ServiceRouteRule {
    inbounds: Vec<proto::Route>,
    outbounds: Vec<proto::Route>,
    referenced: BTreeSet<ServiceKey>,
}

impl ServiceRouteRule {
    pub fn from_routing(routing: proto::Routing) -> Self {
        let mut referenced = BTreeSet::new();
        for route in routing.inbounds.iter() {
            for source in route.sources.iter() {
                insert_concrete(&mut referenced, &source.namespace, &source.service);
            }
        }
        for route in routing.outbounds.iter() {
            for dst in route.destinations.iter() {
                insert_concrete(&mut referenced, &dst.namespace, &dst.service);
            }
        }
        Self {
            inbounds: routing.inbounds,
            outbounds: routing.outbounds,
            referenced,
        }
    }

    pub fn inbounds(&self) -> &[proto::Route] {
        &self.inbounds
    }

    pub fn outbounds(&self) -> &[proto::Route] {
        &self.outbounds
    }

    /// Services named by inbound sources and outbound destinations, wildcards excluded.
    pub fn referenced_services(&self) -> &BTreeSet<ServiceKey> {
        &self.referenced
    }

    pub fn is_empty(&self) -> bool {
        self.inbounds.is_empty() && self.outbounds.is_empty()
    }
}

fn insert_concrete(
    keys: &mut BTreeSet<ServiceKey>,
    namespace: &str,
    name: &str,
) {
    if namespace.is_empty() || name.is_empty() || namespace == "*" || name == "*" {
        return;
    }
    keys.insert(ServiceKey::new(namespace, name));
}

/// Rate limit rules ordered by priority.
#[derive(Debug, Clone, Default)]
pub struct RateLimitData {
    rules: Vec<proto::RateLimitRule>,
}

impl RateLimitData {
    pub fn from_rate_limit(rate_limit: proto::RateLimit) -> Self {
        let mut rules = rate_limit.rules;
        rules.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)));
        Self { rules }
    }

    pub fn rules(&self) -> &[proto::RateLimitRule] {
        &self.rules
    }

    pub fn enabled_rules(&self) -> impl Iterator<Item = &proto::RateLimitRule> {
        self.rules.iter().filter(|r| !r.disable)
    }
}

/// Circuit breaker configuration, evaluated by external policy plugins.
#[derive(Debug, Clone, Default)]
pub struct CircuitBreakerData {
    config: Option<proto::CircuitBreaker>,
}

impl CircuitBreakerData {
    pub fn config(&self) -> Option<&proto::CircuitBreaker> {
        self.config.as_ref()
    }
}

#[derive(Debug, Clone)]
pub enum ServicePayload {
    Instances(ServiceInstances),
    RouteRule(ServiceRouteRule),
    RateLimit(RateLimitData),
    CircuitBreaker(CircuitBreakerData),
}

impl ServicePayload {
    fn parse(
        key: &ServiceKey,
        data_type: DataType,
        response: &proto::DiscoverResponse,
    ) -> Self {
        match data_type {
            DataType::Instances => {
                ServicePayload::Instances(ServiceInstances::from_response(key, response))
            }
            DataType::RouteRule => ServicePayload::RouteRule(ServiceRouteRule::from_routing(
                response.routing.clone().unwrap_or_default(),
            )),
            DataType::RateLimit => ServicePayload::RateLimit(RateLimitData::from_rate_limit(
                response.rate_limit.clone().unwrap_or_default(),
            )),
            DataType::CircuitBreaker => ServicePayload::CircuitBreaker(CircuitBreakerData {
                config: response.circuit_breaker.clone(),
            }),
        }
    }
}

/// Snapshot of one data type of one service.
///
/// Never mutated after it is wrapped in an `Arc` and published.
#[derive(Debug, Clone)]
pub struct ServiceData {
    key: ServiceKey,
    data_type: DataType,
    revision: String,
    cache_version: u64,
    status: DataStatus,
    available_time: Instant,
    payload: ServicePayload,
    response: proto::DiscoverResponse,
}

impl ServiceData {
    /// Builds a snapshot from a discover response, usable immediately.
    pub fn from_response(
        key: ServiceKey,
        data_type: DataType,
        response: proto::DiscoverResponse,
        status: DataStatus,
        cache_version: u64,
    ) -> Self {
        let payload = ServicePayload::parse(&key, data_type, &response);
        let revision = payload_revision(data_type, &response);
        Self {
            key,
            data_type,
            revision,
            cache_version,
            status,
            available_time: Instant::now(),
            payload,
            response,
        }
    }

    /// Restores a backup written by [`ServiceData::to_json`].
    ///
    /// The snapshot is `InitFromDisk` and only usable on its own once
    /// `available_time` has passed.
    pub fn from_json(
        json: &str,
        available_time: Instant,
    ) -> Result<Self> {
        let response: proto::DiscoverResponse = serde_json::from_str(json)?;
        let data_type = DataType::from_discover_type(response.r#type).ok_or_else(|| {
            DiscoveryError::InvalidResponse(format!("unknown discover type {}", response.r#type))
        })?;
        let key = response
            .service
            .as_ref()
            .map(|s| ServiceKey::new(s.namespace.clone(), s.name.clone()))
            .ok_or_else(|| DiscoveryError::InvalidResponse("backup without service".to_string()))?;
        let mut data = Self::from_response(key, data_type, response, DataStatus::InitFromDisk, 0);
        data.available_time = available_time;
        Ok(data)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.response)?)
    }

    pub fn key(&self) -> &ServiceKey {
        &self.key
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn revision(&self) -> &str {
        &self.revision
    }

    pub fn cache_version(&self) -> u64 {
        self.cache_version
    }

    pub fn status(&self) -> DataStatus {
        self.status
    }

    pub fn available_time(&self) -> Instant {
        self.available_time
    }

    /// Network data is always available. Disk data becomes available once
    /// `available_time` is reached.
    pub fn is_available(&self) -> bool {
        Instant::now() >= self.available_time
    }

    pub fn is_not_found(&self) -> bool {
        self.status == DataStatus::NotFound
    }

    pub fn payload(&self) -> &ServicePayload {
        &self.payload
    }

    pub fn instances(&self) -> Option<&ServiceInstances> {
        match &self.payload {
            ServicePayload::Instances(v) => Some(v),
            _ => None,
        }
    }

    pub fn route_rule(&self) -> Option<&ServiceRouteRule> {
        match &self.payload {
            ServicePayload::RouteRule(v) => Some(v),
            _ => None,
        }
    }

    pub fn rate_limit(&self) -> Option<&RateLimitData> {
        match &self.payload {
            ServicePayload::RateLimit(v) => Some(v),
            _ => None,
        }
    }

    pub fn circuit_breaker(&self) -> Option<&CircuitBreakerData> {
        match &self.payload {
            ServicePayload::CircuitBreaker(v) => Some(v),
            _ => None,
        }
    }

    /// Raw response the snapshot was built from.
    pub fn response(&self) -> &proto::DiscoverResponse {
        &self.response
    }

    pub(crate) fn instances_mut(&mut self) -> Option<&mut ServiceInstances> {
        match &mut self.payload {
            ServicePayload::Instances(v) => Some(v),
            _ => None,
        }
    }
}

fn payload_revision(
    data_type: DataType,
    response: &proto::DiscoverResponse,
) -> String {
    let revision = response.revision();
    if !revision.is_empty() {
        return revision.to_string();
    }
    let nested = match data_type {
        DataType::RouteRule => response.routing.as_ref().map(|r| r.revision.as_str()),
        DataType::RateLimit => response.rate_limit.as_ref().map(|r| r.revision.as_str()),
        DataType::CircuitBreaker => response.circuit_breaker.as_ref().map(|c| c.revision.as_str()),
        DataType::Instances => None,
    };
    nested.unwrap_or_default().to_string()
}
