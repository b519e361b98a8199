//! Job runtime configuration.

use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration shared by the runtime, the producer and the sweeper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Idle poll interval of each consumer in milliseconds.
    pub poll_interval_ms: u64,

    /// Redis connection URL for the broker and the lock service.
    pub redis_url: String,

    /// Prefix applied to every Redis key.
    pub key_prefix: String,

    /// Identifier of this replica, recorded on locks it takes.
    pub instance_id: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "orderflow".to_string(),
            instance_id: "local".to_string(),
        }
    }
}

impl RuntimeConfig {
    /// Reads the configuration from `JOBS_*` environment variables, falling
    /// back to defaults for unset ones.
    ///
    /// # Errors
    ///
    /// Returns an error if a set variable cannot be parsed.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let poll_interval_ms = match env::var("JOBS_POLL_INTERVAL_MS") {
            Ok(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
                var: "JOBS_POLL_INTERVAL_MS".to_string(),
                value: raw,
            })?,
            Err(_) => defaults.poll_interval_ms,
        };

        let config = Self {
            poll_interval_ms,
            redis_url: env::var("REDIS_URL").unwrap_or(defaults.redis_url),
            key_prefix: env::var("JOBS_KEY_PREFIX").unwrap_or(defaults.key_prefix),
            instance_id: env::var("JOBS_INSTANCE_ID").unwrap_or(defaults.instance_id),
        };
        config.validate()?;
        Ok(config)
    }

    /// Sets the poll interval.
    #[must_use]
    pub fn with_poll_interval(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    /// Sets the Redis URL.
    #[must_use]
    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = url.into();
        self
    }

    /// Sets the key prefix.
    #[must_use]
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Sets the replica identifier.
    #[must_use]
    pub fn with_instance_id(mut self, id: impl Into<String>) -> Self {
        self.instance_id = id.into();
        self
    }

    /// Returns the poll interval.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::InvalidPollInterval);
        }
        if self.key_prefix.is_empty() {
            return Err(ConfigError::InvalidValue {
                var: "key_prefix".to_string(),
                value: String::new(),
            });
        }
        Ok(())
    }
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Invalid poll interval.
    #[error("poll_interval_ms must be > 0")]
    InvalidPollInterval,

    /// Empty queue name or one using a reserved suffix.
    #[error("invalid queue name: {0:?}")]
    InvalidQueueName(String),

    /// Zero consumers requested.
    #[error("concurrency must be > 0 for queue {0}")]
    InvalidConcurrency(String),

    /// Zero sweep interval.
    #[error("dead-letter sweep interval must be > 0 for queue {0}")]
    InvalidSweepInterval(String),

    /// A value could not be parsed.
    #[error("invalid value for {var}: {value:?}")]
    InvalidValue {
        /// Setting name.
        var: String,
        /// Raw value.
        value: String,
    },
}
