//! Service data model shared by the connector, the registry and consumers.
//!
//! Everything published here is immutable once wrapped in an `Arc`: updates
//! always build a new [`ServiceData`] and replace the previous snapshot.

mod instance;
mod notify;
mod route_info;
mod service;
mod service_data;

pub use instance::*;
pub use notify::*;
pub use route_info::*;
pub use service::*;
pub use service_data::*;

#[cfg(test)]
mod service_data_test;
#[cfg(test)]
mod service_test;

use std::cmp::Ordering;
use std::fmt;

use serde::Deserialize;
use serde::Serialize;

use crate::proto::DiscoverType;

/// Identity of a discoverable service.
///
/// Ordered by name length, then name bytes, then namespace. Equality is
/// structural, so the order stays consistent with `Eq`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ServiceKey {
    pub namespace: String,
    pub name: String,
}

impl ServiceKey {
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl Ord for ServiceKey {
    fn cmp(
        &self,
        other: &Self,
    ) -> Ordering {
        self.name
            .len()
            .cmp(&other.name.len())
            .then_with(|| self.name.as_bytes().cmp(other.name.as_bytes()))
            .then_with(|| self.namespace.cmp(&other.namespace))
    }
}

impl PartialOrd for ServiceKey {
    fn partial_cmp(
        &self,
        other: &Self,
    ) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DataType {
    Instances,
    RouteRule,
    RateLimit,
    CircuitBreaker,
}

impl DataType {
    pub const ALL: [DataType; 4] = [
        DataType::Instances,
        DataType::RouteRule,
        DataType::RateLimit,
        DataType::CircuitBreaker,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Instances => "instances",
            DataType::RouteRule => "route_rule",
            DataType::RateLimit => "rate_limit",
            DataType::CircuitBreaker => "circuit_breaker",
        }
    }

    /// Suffix of the backup file name.
    pub fn file_suffix(&self) -> &'static str {
        match self {
            DataType::Instances => "instance",
            DataType::RouteRule => "routing",
            DataType::RateLimit => "ratelimit",
            DataType::CircuitBreaker => "circuitbreaker",
        }
    }

    pub fn discover_type(&self) -> DiscoverType {
        match self {
            DataType::Instances => DiscoverType::Instance,
            DataType::RouteRule => DiscoverType::Routing,
            DataType::RateLimit => DiscoverType::RateLimit,
            DataType::CircuitBreaker => DiscoverType::CircuitBreaker,
        }
    }

    pub fn from_discover_type(value: i32) -> Option<Self> {
        match DiscoverType::try_from(value).ok()? {
            DiscoverType::Instance => Some(DataType::Instances),
            DiscoverType::Routing => Some(DataType::RouteRule),
            DiscoverType::RateLimit => Some(DataType::RateLimit),
            DiscoverType::CircuitBreaker => Some(DataType::CircuitBreaker),
            DiscoverType::Unknown | DiscoverType::Cluster => None,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataStatus {
    /// Received from the server
    Syncing,
    /// The server confirmed the service or rule does not exist
    NotFound,
    /// Loaded from the local backup, possibly stale
    InitFromDisk,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceKeyWithType {
    pub key: ServiceKey,
    pub data_type: DataType,
}

impl ServiceKeyWithType {
    pub fn new(
        key: ServiceKey,
        data_type: DataType,
    ) -> Self {
        Self { key, data_type }
    }
}

impl fmt::Display for ServiceKeyWithType {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "{}[{}]", self.key, self.data_type)
    }
}
