use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use super::config_error;
use crate::Result;

/// Disk backup of discovered data
///
/// A loaded backup is served right away when the file is recent
/// (`available_time_ms`); older files only become usable after
/// `upgrade_wait_ms`, giving the live stream a chance to answer first.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PersistConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default = "default_dir")]
    pub dir: PathBuf,

    #[serde(default = "default_available_time_ms")]
    pub available_time_ms: u64,

    #[serde(default = "default_upgrade_wait_ms")]
    pub upgrade_wait_ms: u64,

    #[serde(default = "default_max_write_retry")]
    pub max_write_retry: u32,

    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,
}

impl Default for PersistConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            dir: default_dir(),
            available_time_ms: default_available_time_ms(),
            upgrade_wait_ms: default_upgrade_wait_ms(),
            max_write_retry: default_max_write_retry(),
            retry_interval_ms: default_retry_interval_ms(),
        }
    }
}

impl PersistConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        if self.dir.as_os_str().is_empty() {
            return Err(config_error("persist dir path cannot be empty".to_string()));
        }
        if self.retry_interval_ms == 0 {
            return Err(config_error(
                "persist retry_interval_ms must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn available_time(&self) -> Duration {
        Duration::from_millis(self.available_time_ms)
    }

    pub fn upgrade_wait(&self) -> Duration {
        Duration::from_millis(self.upgrade_wait_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}

fn default_enabled() -> bool {
    true
}
fn default_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join("polaris").join("backup")
}
fn default_available_time_ms() -> u64 {
    60_000
}
fn default_upgrade_wait_ms() -> u64 {
    2000
}
fn default_max_write_retry() -> u32 {
    5
}
fn default_retry_interval_ms() -> u64 {
    1000
}
