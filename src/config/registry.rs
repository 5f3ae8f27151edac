use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use super::config_error;
use crate::Result;

/// Local registry refresh and expiry settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RegistryConfig {
    /// Services not accessed for this long are dropped (min 60s)
    #[serde(default = "default_service_expire_time_ms")]
    pub service_expire_time_ms: u64,

    /// Default discover interval for tracked services (min 100ms)
    #[serde(default = "default_service_refresh_interval_ms")]
    pub service_refresh_interval_ms: u64,

    /// Per service refresh interval, keyed by `namespace/name`
    #[serde(default)]
    pub service_refresh_overrides: HashMap<String, u64>,

    /// GC timer period
    #[serde(default = "default_gc_interval_ms")]
    pub gc_interval_ms: u64,

    /// Host:port index entries unused for this long are dropped
    #[serde(default = "default_host_port_idle_ms")]
    pub host_port_idle_ms: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            service_expire_time_ms: default_service_expire_time_ms(),
            service_refresh_interval_ms: default_service_refresh_interval_ms(),
            service_refresh_overrides: HashMap::new(),
            gc_interval_ms: default_gc_interval_ms(),
            host_port_idle_ms: default_host_port_idle_ms(),
        }
    }
}

impl RegistryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.service_expire_time_ms < 60_000 {
            return Err(config_error(format!(
                "service_expire_time_ms must be at least 60000, got {}",
                self.service_expire_time_ms
            )));
        }
        if self.service_refresh_interval_ms < 100 {
            return Err(config_error(format!(
                "service_refresh_interval_ms must be at least 100, got {}",
                self.service_refresh_interval_ms
            )));
        }
        if let Some((service, interval)) = self
            .service_refresh_overrides
            .iter()
            .find(|(_, interval)| **interval < 100)
        {
            return Err(config_error(format!(
                "refresh interval of {service} must be at least 100, got {interval}"
            )));
        }
        if self.gc_interval_ms == 0 {
            return Err(config_error("gc_interval_ms must be greater than 0".to_string()));
        }
        Ok(())
    }

    pub fn service_expire_time(&self) -> Duration {
        Duration::from_millis(self.service_expire_time_ms)
    }

    /// Refresh interval for one service, honoring overrides.
    pub fn refresh_interval_of(
        &self,
        namespace: &str,
        name: &str,
    ) -> Duration {
        let key = format!("{namespace}/{name}");
        let ms = self
            .service_refresh_overrides
            .get(&key)
            .copied()
            .unwrap_or(self.service_refresh_interval_ms);
        Duration::from_millis(ms)
    }

    pub fn gc_interval(&self) -> Duration {
        Duration::from_millis(self.gc_interval_ms)
    }

    pub fn host_port_idle(&self) -> Duration {
        Duration::from_millis(self.host_port_idle_ms)
    }
}

fn default_service_expire_time_ms() -> u64 {
    24 * 60 * 60 * 1000
}
fn default_service_refresh_interval_ms() -> u64 {
    2000
}
fn default_gc_interval_ms() -> u64 {
    2000
}
fn default_host_port_idle_ms() -> u64 {
    5000
}
