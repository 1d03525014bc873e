//! Configuration for the transaction controller and the in-memory store.
//!
//! Both structs have sensible defaults, builder-style setters, and can be
//! loaded from JSON:
//!
//! ```
//! use txcontrol::config::ControllerConfig;
//! use txcontrol::IsolationLevel;
//!
//! let config = ControllerConfig::from_json(
//!     r#"{ "default_isolation": "serializable", "max_retry_attempts": 5 }"#,
//! ).unwrap();
//! assert_eq!(config.default_isolation, IsolationLevel::Serializable);
//! assert_eq!(config.base_retry_delay_ms, 100);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::transaction::IsolationLevel;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Transaction controller configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Isolation level used when a caller does not ask for one.
    pub default_isolation: IsolationLevel,
    /// Total attempts `execute_with_retry` makes, including the first.
    pub max_retry_attempts: u32,
    /// Delay after the first failed attempt; doubles after each further one.
    pub base_retry_delay_ms: u64,
    /// Upper bound for a single backoff delay.
    pub max_retry_delay_ms: Option<u64>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            default_isolation: IsolationLevel::ReadCommitted,
            max_retry_attempts: 3,
            base_retry_delay_ms: 100,
            max_retry_delay_ms: None,
        }
    }
}

impl ControllerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from JSON; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_retry_attempts == 0 {
            return Err(ConfigError::Invalid(
                "max_retry_attempts must be at least 1".into(),
            ));
        }
        if let Some(max) = self.max_retry_delay_ms {
            if max < self.base_retry_delay_ms {
                return Err(ConfigError::Invalid(format!(
                    "max_retry_delay_ms ({}) is below base_retry_delay_ms ({})",
                    max, self.base_retry_delay_ms
                )));
            }
        }
        Ok(())
    }

    /// Set the default isolation level.
    pub fn default_isolation(mut self, level: IsolationLevel) -> Self {
        self.default_isolation = level;
        self
    }

    /// Set attempt budget and base delay for retries.
    pub fn retry(mut self, max_attempts: u32, base_delay: Duration) -> Self {
        self.max_retry_attempts = max_attempts.max(1);
        self.base_retry_delay_ms = duration_ms(base_delay);
        self
    }

    /// Cap individual backoff delays.
    pub fn with_max_retry_delay(mut self, max_delay: Duration) -> Self {
        self.max_retry_delay_ms = Some(duration_ms(max_delay));
        self
    }

    pub fn base_retry_delay(&self) -> Duration {
        Duration::from_millis(self.base_retry_delay_ms)
    }

    pub fn max_retry_delay(&self) -> Option<Duration> {
        self.max_retry_delay_ms.map(Duration::from_millis)
    }
}

/// In-memory store configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Connections that may be checked out at once.
    pub max_connections: usize,
    /// How long `acquire` waits for a free connection.
    pub acquire_timeout_ms: u64,
    /// How long a transaction waits for a row lock or serializable admission.
    pub lock_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_connections: 16,
            acquire_timeout_ms: 1_000,
            lock_timeout_ms: 2_000,
        }
    }
}

impl StoreConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        if config.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "max_connections must be at least 1".into(),
            ));
        }
        Ok(config)
    }

    pub fn max_connections(mut self, value: usize) -> Self {
        self.max_connections = value.max(1);
        self
    }

    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout_ms = duration_ms(timeout);
        self
    }

    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout_ms = duration_ms(timeout);
        self
    }

    pub fn acquire_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn lock_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
