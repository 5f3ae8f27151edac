use std::time::Duration;

// -
// Configuration sources

/// Path of an optional config file layered over the defaults
pub(crate) const CONFIG_PATH_ENV: &str = "POLARIS_CONFIG_PATH";
/// Prefix of environment overrides, e.g. `POLARIS__CONNECTOR__ADDRESSES`
pub(crate) const ENV_PREFIX: &str = "POLARIS";

pub(crate) const MIN_SERVER_SWITCH_INTERVAL_MS: u64 = 60_000;

// -
// Reactor

/// Upper bound of one idle wait, so a stop request is noticed even if the
/// wake message is lost to a full system.
pub(crate) const MAX_IDLE_WAIT: Duration = Duration::from_millis(100);

// -
// Transport

pub(crate) const TCP_KEEPALIVE: Duration = Duration::from_secs(60);
pub(crate) const HTTP2_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

// -
// Service metadata keys

pub(crate) const NEARBY_ENABLE_KEY: &str = "internal-enable-nearby";
pub(crate) const CANARY_ENABLE_KEY: &str = "internal-canary";

// -
// Backup files

pub(crate) const BACKUP_FILE_PREFIX: &str = "svc";
pub(crate) const BACKUP_FILE_EXTENSION: &str = "json";
