//! Configuration management for the discovery client runtime.
//!
//! Provides hierarchical configuration loading and validation with:
//! - Default values as code base
//! - Configuration file named by `POLARIS_CONFIG_PATH`
//! - Environment variable overrides (`POLARIS__CONNECTOR__ADDRESSES`, ...)
//! - Component-wise validation
mod connector;
mod persist;
mod registry;
pub use connector::*;
pub use persist::*;
pub use registry::*;


use std::env;

use config::Config;
use config::ConfigError;
use config::Environment;
use config::File;
use serde::Deserialize;
use serde::Serialize;

use crate::constants::CONFIG_PATH_ENV;
use crate::constants::ENV_PREFIX;
use crate::Error;
use crate::Result;

/// Root configuration of a discovery client context
///
/// Merge order (later sources override earlier):
/// 1. Default values from code
/// 2. Configuration file specified by `POLARIS_CONFIG_PATH`
/// 3. Environment variables with the `POLARIS__` prefix
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct ClientConfig {
    /// Discover stream and unary request parameters
    #[serde(default)]
    pub connector: ConnectorConfig,
    /// Local registry refresh and expiry
    #[serde(default)]
    pub registry: RegistryConfig,
    /// On-disk snapshot backup
    #[serde(default)]
    pub persist: PersistConfig,
}

impl ClientConfig {
    /// Loads configuration from hierarchical sources without validation.
    ///
    /// Callers MUST call `validate()` once every override is applied.
    ///
    /// # Examples
    /// ```ignore
    /// std::env::set_var("POLARIS__CONNECTOR__ADDRESSES", "10.0.0.1:8091");
    /// let cfg = ClientConfig::new()?.validate()?;
    /// ```
    pub fn new() -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);

        if let Ok(config_path) = env::var(CONFIG_PATH_ENV) {
            builder = builder.add_source(File::with_name(&config_path).required(true));
        }

        builder = builder.add_source(Self::environment());

        let config: Self = builder.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Applies additional overrides from a file, environment variables still win.
    pub fn with_override_config(
        &self,
        path: &str,
    ) -> Result<Self> {
        let config: Self = Config::builder()
            .add_source(Config::try_from(self)?)
            .add_source(File::with_name(path))
            .add_source(Self::environment())
            .build()?
            .try_deserialize()?;
        Ok(config)
    }

    /// Validates every section and returns the validated instance.
    pub fn validate(self) -> Result<Self> {
        self.connector.validate()?;
        self.registry.validate()?;
        self.persist.validate()?;
        Ok(self)
    }

    fn environment() -> Environment {
        Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .ignore_empty(true)
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("connector.addresses")
    }
}

pub(crate) fn config_error(message: String) -> Error {
    Error::Config(ConfigError::Message(message))
}
