//! Discovery Client Error Hierarchy
//!
//! Errors are grouped by the layer that produces them. Transport failures never
//! appear here directly: the connector folds them into a `ServerCode` first and
//! only surfaces `Timeout`, `NetworkFailed` or `ServerError` for the request that
//! was outstanding.

use std::path::PathBuf;

use config::ConfigError;

#[doc(hidden)]
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Configuration loading and validation failures
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// User visible discovery results
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    /// Local snapshot persistence failures
    #[error(transparent)]
    Persist(#[from] PersistError),

    /// Unrecoverable failures, e.g. a worker thread could not be spawned
    #[error("Fatal error: {0}")]
    Fatal(String),
}

impl Error {
    /// Flat return code for callers that do not want to destructure.
    pub fn return_code(&self) -> ReturnCode {
        match self {
            Error::Config(_) => ReturnCode::InvalidConfig,
            Error::Discovery(e) => e.return_code(),
            Error::Persist(_) => ReturnCode::PluginError,
            Error::Fatal(_) => ReturnCode::UnknownError,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Discovery(DiscoveryError::Timeout(_)))
    }
}

/// Client side return codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReturnCode {
    Ok,
    UnknownError,
    InvalidArgument,
    InvalidConfig,
    PluginError,
    Timeout,
    ServerError,
    NetworkFailed,
    InstanceNotFound,
    ServiceNotFound,
    ResourceNotFound,
    ExistedResource,
    Unauthorized,
    HealthCheckDisabled,
    RateLimit,
    InvalidResponse,
    NotInit,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DiscoveryError {
    /// Terminal: the server confirmed the service does not exist
    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    #[error("Instance not found: {0}")]
    InstanceNotFound(String),

    /// Deadline elapsed before data or a response arrived
    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Network failed: {0}")]
    NetworkFailed(String),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Plugin error: {0}")]
    PluginError(String),

    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    #[error("Resource already exists: {0}")]
    ExistedResource(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Rate limited: {0}")]
    RateLimit(String),

    #[error("Health check disabled: {0}")]
    HealthCheckDisabled(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Retriable: data exists locally but is not usable yet
    #[error("Data not initialized: {0}")]
    NotInit(String),
}

impl DiscoveryError {
    pub fn return_code(&self) -> ReturnCode {
        match self {
            DiscoveryError::ServiceNotFound(_) => ReturnCode::ServiceNotFound,
            DiscoveryError::InstanceNotFound(_) => ReturnCode::InstanceNotFound,
            DiscoveryError::Timeout(_) => ReturnCode::Timeout,
            DiscoveryError::NetworkFailed(_) => ReturnCode::NetworkFailed,
            DiscoveryError::ServerError(_) => ReturnCode::ServerError,
            DiscoveryError::InvalidArgument(_) => ReturnCode::InvalidArgument,
            DiscoveryError::PluginError(_) => ReturnCode::PluginError,
            DiscoveryError::ResourceNotFound(_) => ReturnCode::ResourceNotFound,
            DiscoveryError::ExistedResource(_) => ReturnCode::ExistedResource,
            DiscoveryError::Unauthorized(_) => ReturnCode::Unauthorized,
            DiscoveryError::RateLimit(_) => ReturnCode::RateLimit,
            DiscoveryError::HealthCheckDisabled(_) => ReturnCode::HealthCheckDisabled,
            DiscoveryError::InvalidResponse(_) => ReturnCode::InvalidResponse,
            DiscoveryError::NotInit(_) => ReturnCode::NotInit,
        }
    }

    /// Builds the error matching a non-ok return code. `Ok` has no error
    /// counterpart and yields `None`.
    pub fn from_return_code(
        code: ReturnCode,
        message: impl Into<String>,
    ) -> Option<Self> {
        let message = message.into();
        let err = match code {
            ReturnCode::Ok => return None,
            ReturnCode::ServiceNotFound => DiscoveryError::ServiceNotFound(message),
            ReturnCode::InstanceNotFound => DiscoveryError::InstanceNotFound(message),
            ReturnCode::Timeout => DiscoveryError::Timeout(message),
            ReturnCode::NetworkFailed => DiscoveryError::NetworkFailed(message),
            ReturnCode::ServerError | ReturnCode::UnknownError => DiscoveryError::ServerError(message),
            ReturnCode::InvalidArgument | ReturnCode::InvalidConfig => {
                DiscoveryError::InvalidArgument(message)
            }
            ReturnCode::PluginError => DiscoveryError::PluginError(message),
            ReturnCode::ResourceNotFound => DiscoveryError::ResourceNotFound(message),
            ReturnCode::ExistedResource => DiscoveryError::ExistedResource(message),
            ReturnCode::Unauthorized => DiscoveryError::Unauthorized(message),
            ReturnCode::HealthCheckDisabled => DiscoveryError::HealthCheckDisabled(message),
            ReturnCode::RateLimit => DiscoveryError::RateLimit(message),
            ReturnCode::InvalidResponse => DiscoveryError::InvalidResponse(message),
            ReturnCode::NotInit => DiscoveryError::NotInit(message),
        };
        Some(err)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    /// Disk I/O failures while reading or writing snapshots
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Persist failed at path: {path}")]
    Path {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Snapshot (de)serialization failures
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// The persist worker has stopped and no longer accepts writes
    #[error("Persist worker stopped")]
    Stopped,
}

// ============== Conversion Implementations ============== //
impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Persist(PersistError::Io(e))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Persist(PersistError::Json(e))
    }
}
