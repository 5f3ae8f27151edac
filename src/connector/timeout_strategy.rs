use std::time::Duration;

use crate::utils::time::scale;
use crate::ConnectorConfig;

/// Adaptive timeout: grows on failure, follows the observed latency on success.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeoutStrategy {
    min: Duration,
    max: Duration,
    expand: f64,
    timeout: Duration,
}

impl TimeoutStrategy {
    pub fn new(
        min: Duration,
        max: Duration,
        expand: f64,
    ) -> Self {
        Self {
            min,
            max: max.max(min),
            expand,
            timeout: min,
        }
    }

    pub fn connect(config: &ConnectorConfig) -> Self {
        Self::new(
            Duration::from_millis(config.connect_timeout_ms),
            Duration::from_millis(config.max_connect_timeout_ms),
            config.connect_timeout_expand,
        )
    }

    pub fn message(config: &ConnectorConfig) -> Self {
        Self::new(
            Duration::from_millis(config.message_timeout_ms),
            Duration::from_millis(config.max_message_timeout_ms),
            config.message_timeout_expand,
        )
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Multiplies the current timeout by the expand factor, capped at max.
    pub fn set_next_retry_timeout(&mut self) {
        self.timeout = scale(self.timeout, self.expand).min(self.max);
    }

    /// Resets the timeout from a successful call that took `used`.
    pub fn set_normal_timeout(
        &mut self,
        used: Duration,
    ) {
        self.timeout = scale(used, self.expand).clamp(self.min, self.max);
    }
}
