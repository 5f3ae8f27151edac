use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use super::config_error;
use crate::constants::MIN_SERVER_SWITCH_INTERVAL_MS;
use crate::Result;
use crate::ServiceKey;

/// Namespace and name of an internal system service (discover, heartbeat).
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct SystemServiceConfig {
    pub namespace: String,
    pub name: String,
}

impl SystemServiceConfig {
    pub fn service_key(&self) -> ServiceKey {
        ServiceKey::new(self.namespace.clone(), self.name.clone())
    }
}

/// Connector parameters
///
/// Timeouts start at their base value and grow by the expand factor after each
/// failure, up to the configured maximum.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ConnectorConfig {
    /// Seed server list, each entry `host:port`
    #[serde(default = "default_addresses")]
    pub addresses: Vec<String>,

    /// Internal discover service. When set, the discover stream migrates from the
    /// seed list onto this service's instances once they have been discovered.
    #[serde(default)]
    pub discover_service: Option<SystemServiceConfig>,

    /// Internal heartbeat service, falls back to the discover service
    #[serde(default)]
    pub heartbeat_service: Option<SystemServiceConfig>,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_max_connect_timeout_ms")]
    pub max_connect_timeout_ms: u64,

    #[serde(default = "default_connect_timeout_expand")]
    pub connect_timeout_expand: f64,

    #[serde(default = "default_message_timeout_ms")]
    pub message_timeout_ms: u64,

    #[serde(default = "default_max_message_timeout_ms")]
    pub max_message_timeout_ms: u64,

    #[serde(default = "default_message_timeout_expand")]
    pub message_timeout_expand: f64,

    /// Healthy streams are still rotated after this interval (min 60s)
    #[serde(default = "default_server_switch_interval_ms")]
    pub server_switch_interval_ms: u64,

    /// Maximum async requests in flight
    #[serde(default = "default_request_queue_size")]
    pub request_queue_size: usize,

    /// Default listener sync interval
    #[serde(default = "default_discover_refresh_interval_ms")]
    pub discover_refresh_interval_ms: u64,

    /// Retry interval of async requests waiting for their target service
    #[serde(default = "default_async_retry_interval_ms")]
    pub async_retry_interval_ms: u64,

    /// Consecutive failures after which a server is skipped by selection
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            addresses: default_addresses(),
            discover_service: None,
            heartbeat_service: None,
            connect_timeout_ms: default_connect_timeout_ms(),
            max_connect_timeout_ms: default_max_connect_timeout_ms(),
            connect_timeout_expand: default_connect_timeout_expand(),
            message_timeout_ms: default_message_timeout_ms(),
            max_message_timeout_ms: default_max_message_timeout_ms(),
            message_timeout_expand: default_message_timeout_expand(),
            server_switch_interval_ms: default_server_switch_interval_ms(),
            request_queue_size: default_request_queue_size(),
            discover_refresh_interval_ms: default_discover_refresh_interval_ms(),
            async_retry_interval_ms: default_async_retry_interval_ms(),
            failure_threshold: default_failure_threshold(),
        }
    }
}

impl ConnectorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.addresses.is_empty() {
            return Err(config_error(
                "connector.addresses must contain at least one seed server".to_string(),
            ));
        }
        for address in &self.addresses {
            if split_address(address).is_none() {
                return Err(config_error(format!(
                    "connector.addresses entry {address} is not a valid host:port"
                )));
            }
        }
        if self.connect_timeout_ms == 0 || self.connect_timeout_ms > self.max_connect_timeout_ms {
            return Err(config_error(format!(
                "connect_timeout_ms must be in 1..={}, got {}",
                self.max_connect_timeout_ms, self.connect_timeout_ms
            )));
        }
        if self.message_timeout_ms == 0 || self.message_timeout_ms > self.max_message_timeout_ms {
            return Err(config_error(format!(
                "message_timeout_ms must be in 1..={}, got {}",
                self.max_message_timeout_ms, self.message_timeout_ms
            )));
        }
        if self.connect_timeout_expand < 1.0 || self.message_timeout_expand < 1.0 {
            return Err(config_error(
                "timeout expand factors must be at least 1.0".to_string(),
            ));
        }
        if self.server_switch_interval_ms < MIN_SERVER_SWITCH_INTERVAL_MS {
            return Err(config_error(format!(
                "server_switch_interval_ms must be at least {MIN_SERVER_SWITCH_INTERVAL_MS}, got {}",
                self.server_switch_interval_ms
            )));
        }
        if self.request_queue_size == 0 {
            return Err(config_error(
                "request_queue_size must be greater than 0".to_string(),
            ));
        }
        for service in [&self.discover_service, &self.heartbeat_service].into_iter().flatten() {
            if service.name.is_empty() || service.namespace.is_empty() {
                return Err(config_error(format!(
                    "system service {:?} needs both namespace and name",
                    service
                )));
            }
        }
        Ok(())
    }

    pub fn server_switch_interval(&self) -> Duration {
        Duration::from_millis(self.server_switch_interval_ms)
    }

    pub fn discover_refresh_interval(&self) -> Duration {
        Duration::from_millis(self.discover_refresh_interval_ms)
    }

    pub fn async_retry_interval(&self) -> Duration {
        Duration::from_millis(self.async_retry_interval_ms)
    }
}

/// Splits `host:port`, accepting bracketed IPv6 hosts.
pub(crate) fn split_address(address: &str) -> Option<(String, u16)> {
    let (host, port) = address.rsplit_once(':')?;
    let port = port.parse::<u16>().ok()?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return None;
    }
    Some((host.to_string(), port))
}

fn default_addresses() -> Vec<String> {
    vec!["127.0.0.1:8091".to_string()]
}
fn default_connect_timeout_ms() -> u64 {
    200
}
fn default_max_connect_timeout_ms() -> u64 {
    1000
}
fn default_connect_timeout_expand() -> f64 {
    1.5
}
fn default_message_timeout_ms() -> u64 {
    1000
}
fn default_max_message_timeout_ms() -> u64 {
    10_000
}
fn default_message_timeout_expand() -> f64 {
    2.0
}
fn default_server_switch_interval_ms() -> u64 {
    10 * 60 * 1000
}
fn default_request_queue_size() -> usize {
    1000
}
fn default_discover_refresh_interval_ms() -> u64 {
    2000
}
fn default_async_retry_interval_ms() -> u64 {
    20
}
fn default_failure_threshold() -> u32 {
    3
}
