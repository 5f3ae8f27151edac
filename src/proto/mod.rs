//! Discovery protocol messages.
//!
//! Declared by hand in the shape `tonic-build` would generate for the
//! `v1.PolarisGRPC` service, so no build step is needed. Every message also
//! derives serde, the JSON form is what the disk backup stores.

pub mod code;


use std::collections::HashMap;

use serde::Deserialize;
use serde::Serialize;

pub const DISCOVER_PATH: &str = "/v1.PolarisGRPC/Discover";
pub const REGISTER_INSTANCE_PATH: &str = "/v1.PolarisGRPC/RegisterInstance";
pub const DEREGISTER_INSTANCE_PATH: &str = "/v1.PolarisGRPC/DeregisterInstance";
pub const HEARTBEAT_PATH: &str = "/v1.PolarisGRPC/Heartbeat";
pub const REPORT_CLIENT_PATH: &str = "/v1.PolarisGRPC/ReportClient";

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration, Serialize, Deserialize,
)]
#[repr(i32)]
pub enum DiscoverType {
    Unknown = 0,
    Instance = 1,
    Cluster = 2,
    Routing = 3,
    RateLimit = 4,
    CircuitBreaker = 5,
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration, Serialize, Deserialize,
)]
#[repr(i32)]
pub enum ClientType {
    Unknown = 0,
    Sdk = 1,
    Agent = 2,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
pub struct Service {
    #[prost(string, tag = "1")]
    pub name: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub namespace: ::prost::alloc::string::String,
    #[prost(map = "string, string", tag = "3")]
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[prost(string, tag = "10")]
    #[serde(default)]
    pub revision: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
pub struct Location {
    #[prost(string, tag = "1")]
    pub region: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub zone: ::prost::alloc::string::String,
    #[prost(string, tag = "3")]
    pub campus: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
pub struct Instance {
    #[prost(string, tag = "1")]
    pub id: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub service: ::prost::alloc::string::String,
    #[prost(string, tag = "3")]
    pub namespace: ::prost::alloc::string::String,
    #[prost(string, tag = "4")]
    pub host: ::prost::alloc::string::String,
    #[prost(uint32, tag = "5")]
    pub port: u32,
    #[prost(string, tag = "6")]
    #[serde(default)]
    pub protocol: ::prost::alloc::string::String,
    #[prost(string, tag = "7")]
    #[serde(default)]
    pub version: ::prost::alloc::string::String,
    #[prost(uint32, tag = "8")]
    #[serde(default)]
    pub priority: u32,
    #[prost(uint32, tag = "9")]
    #[serde(default)]
    pub weight: u32,
    /// Absent means healthy
    #[prost(bool, optional, tag = "11")]
    #[serde(default)]
    pub healthy: ::core::option::Option<bool>,
    #[prost(bool, optional, tag = "12")]
    #[serde(default)]
    pub isolate: ::core::option::Option<bool>,
    #[prost(message, optional, tag = "13")]
    #[serde(default)]
    pub location: ::core::option::Option<Location>,
    #[prost(map = "string, string", tag = "14")]
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[prost(string, tag = "15")]
    #[serde(default)]
    pub logic_set: ::prost::alloc::string::String,
    #[prost(string, tag = "21")]
    #[serde(default)]
    pub vpc_id: ::prost::alloc::string::String,
    #[prost(string, tag = "22")]
    #[serde(default)]
    pub revision: ::prost::alloc::string::String,
    /// Heartbeat ttl in seconds, only meaningful on register
    #[prost(uint32, tag = "30")]
    #[serde(default)]
    pub ttl: u32,
    #[prost(string, tag = "31")]
    #[serde(default)]
    pub service_token: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
pub struct Source {
    #[prost(string, tag = "1")]
    pub service: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub namespace: ::prost::alloc::string::String,
    #[prost(map = "string, string", tag = "3")]
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
pub struct Destination {
    #[prost(string, tag = "1")]
    pub service: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub namespace: ::prost::alloc::string::String,
    #[prost(map = "string, string", tag = "3")]
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[prost(uint32, tag = "4")]
    #[serde(default)]
    pub priority: u32,
    #[prost(uint32, tag = "5")]
    #[serde(default)]
    pub weight: u32,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
pub struct Route {
    #[prost(message, repeated, tag = "1")]
    #[serde(default)]
    pub sources: ::prost::alloc::vec::Vec<Source>,
    #[prost(message, repeated, tag = "2")]
    #[serde(default)]
    pub destinations: ::prost::alloc::vec::Vec<Destination>,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
pub struct Routing {
    #[prost(string, tag = "1")]
    pub service: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub namespace: ::prost::alloc::string::String,
    #[prost(message, repeated, tag = "3")]
    #[serde(default)]
    pub inbounds: ::prost::alloc::vec::Vec<Route>,
    #[prost(message, repeated, tag = "4")]
    #[serde(default)]
    pub outbounds: ::prost::alloc::vec::Vec<Route>,
    #[prost(string, tag = "6")]
    #[serde(default)]
    pub revision: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
pub struct Amount {
    #[prost(uint32, tag = "1")]
    pub max_amount: u32,
    #[prost(uint64, tag = "2")]
    pub valid_duration_ms: u64,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
pub struct RateLimitRule {
    #[prost(string, tag = "1")]
    pub id: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub service: ::prost::alloc::string::String,
    #[prost(string, tag = "3")]
    pub namespace: ::prost::alloc::string::String,
    #[prost(uint32, tag = "4")]
    #[serde(default)]
    pub priority: u32,
    #[prost(map = "string, string", tag = "5")]
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[prost(message, repeated, tag = "6")]
    #[serde(default)]
    pub amounts: ::prost::alloc::vec::Vec<Amount>,
    #[prost(bool, tag = "7")]
    #[serde(default)]
    pub disable: bool,
    #[prost(string, tag = "8")]
    #[serde(default)]
    pub revision: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
pub struct RateLimit {
    #[prost(message, repeated, tag = "1")]
    #[serde(default)]
    pub rules: ::prost::alloc::vec::Vec<RateLimitRule>,
    #[prost(string, tag = "2")]
    #[serde(default)]
    pub revision: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
pub struct CbPolicy {
    #[prost(uint32, tag = "1")]
    pub error_rate_percent: u32,
    #[prost(uint32, tag = "2")]
    pub consecutive_errors: u32,
    #[prost(uint64, tag = "3")]
    pub sleep_window_ms: u64,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
pub struct CbRule {
    #[prost(message, repeated, tag = "1")]
    #[serde(default)]
    pub sources: ::prost::alloc::vec::Vec<Source>,
    #[prost(message, repeated, tag = "2")]
    #[serde(default)]
    pub destinations: ::prost::alloc::vec::Vec<Destination>,
    #[prost(message, optional, tag = "3")]
    #[serde(default)]
    pub policy: ::core::option::Option<CbPolicy>,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
pub struct CircuitBreaker {
    #[prost(string, tag = "1")]
    pub id: ::prost::alloc::string::String,
    #[prost(string, tag = "3")]
    pub name: ::prost::alloc::string::String,
    #[prost(string, tag = "4")]
    pub namespace: ::prost::alloc::string::String,
    #[prost(message, repeated, tag = "7")]
    #[serde(default)]
    pub inbounds: ::prost::alloc::vec::Vec<CbRule>,
    #[prost(message, repeated, tag = "8")]
    #[serde(default)]
    pub outbounds: ::prost::alloc::vec::Vec<CbRule>,
    #[prost(string, tag = "11")]
    #[serde(default)]
    pub revision: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
pub struct DiscoverRequest {
    #[prost(enumeration = "DiscoverType", tag = "1")]
    pub r#type: i32,
    #[prost(message, optional, tag = "2")]
    pub service: ::core::option::Option<Service>,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
pub struct DiscoverResponse {
    #[prost(uint32, tag = "1")]
    pub code: u32,
    #[prost(string, tag = "2")]
    #[serde(default)]
    pub info: ::prost::alloc::string::String,
    #[prost(enumeration = "DiscoverType", tag = "3")]
    pub r#type: i32,
    #[prost(message, optional, tag = "4")]
    pub service: ::core::option::Option<Service>,
    #[prost(message, repeated, tag = "5")]
    #[serde(default)]
    pub instances: ::prost::alloc::vec::Vec<Instance>,
    #[prost(message, optional, tag = "6")]
    #[serde(default)]
    pub routing: ::core::option::Option<Routing>,
    #[prost(message, optional, tag = "7")]
    #[serde(default)]
    pub rate_limit: ::core::option::Option<RateLimit>,
    #[prost(message, optional, tag = "8")]
    #[serde(default)]
    pub circuit_breaker: ::core::option::Option<CircuitBreaker>,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
pub struct Client {
    #[prost(string, tag = "1")]
    pub host: ::prost::alloc::string::String,
    #[prost(enumeration = "ClientType", tag = "2")]
    pub r#type: i32,
    #[prost(string, tag = "3")]
    pub version: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
pub struct Response {
    #[prost(uint32, tag = "1")]
    pub code: u32,
    #[prost(string, tag = "2")]
    pub info: ::prost::alloc::string::String,
    #[prost(message, optional, tag = "3")]
    pub client: ::core::option::Option<Client>,
    #[prost(message, optional, tag = "5")]
    pub instance: ::core::option::Option<Instance>,
}

impl DiscoverResponse {
    /// Revision of the payload, carried on the service block.
    pub fn revision(&self) -> &str {
        self.service
            .as_ref()
            .map(|s| s.revision.as_str())
            .unwrap_or_default()
    }
}
