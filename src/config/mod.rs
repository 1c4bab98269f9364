//! # Courier Configuration System
//!
//! Typed configuration for the broker pipeline and the outbox worker.
//!
//! ## Architecture
//!
//! - **Layered Sources**: built-in defaults, `config/courier.toml`,
//!   `config/courier.{environment}.toml`, then `COURIER__*` environment variables
//! - **Environment Awareness**: development/test/production detection
//! - **Explicit Validation**: invalid values are rejected at load time
//!
//! Durations are configured in milliseconds and exposed as [`Duration`] through
//! accessor methods.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use courier_core::config::ConfigManager;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConfigManager::load()?;
//! let interval = manager.config().outbox.processing_interval();
//! let batch = manager.config().outbox.processing_count;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod loader;

use crate::constants::{defaults, environments};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub use error::{ConfigResult, ConfigurationError};
pub use loader::ConfigManager;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct CourierConfig {
    /// Environment name the configuration was loaded for
    pub environment: String,

    /// Broker behavior pipeline settings
    pub broker: BrokerConfig,

    /// Outbox worker settings
    pub outbox: OutboxConfig,
}

impl Default for CourierConfig {
    fn default() -> Self {
        Self {
            environment: environments::DEVELOPMENT.to_string(),
            broker: BrokerConfig::default(),
            outbox: OutboxConfig::default(),
        }
    }
}

/// When the worker picks up newly written outbox items
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingMode {
    /// Items wait for the next scheduled tick
    #[default]
    Deferred,
    /// The writer also wakes the worker right after inserting
    Immediate,
}

/// Outbox worker configuration
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct OutboxConfig {
    pub enabled: bool,
    pub startup_delay_ms: u64,
    pub processing_interval_ms: u64,
    /// Artificial per-item delay, models transport latency
    pub processing_delay_ms: u64,
    pub processing_mode: ProcessingMode,
    /// Maximum number of items claimed per tick
    pub processing_count: usize,
    pub max_retries: u32,
    pub purge_on_startup: bool,
    pub purge_processed_on_startup: bool,
    pub auto_save: bool,
    /// Claims older than this are considered abandoned by a crashed worker
    pub claim_timeout_ms: u64,
    /// Processed items older than this are purged at startup
    pub retention_ms: Option<u64>,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            startup_delay_ms: defaults::STARTUP_DELAY_MS,
            processing_interval_ms: defaults::PROCESSING_INTERVAL_MS,
            processing_delay_ms: defaults::PROCESSING_DELAY_MS,
            processing_mode: ProcessingMode::Deferred,
            processing_count: defaults::PROCESSING_COUNT,
            max_retries: defaults::MAX_RETRIES,
            purge_on_startup: false,
            purge_processed_on_startup: false,
            auto_save: true,
            claim_timeout_ms: defaults::CLAIM_TIMEOUT_MS,
            retention_ms: None,
        }
    }
}

impl OutboxConfig {
    pub fn startup_delay(&self) -> Duration {
        Duration::from_millis(self.startup_delay_ms)
    }

    pub fn processing_interval(&self) -> Duration {
        Duration::from_millis(self.processing_interval_ms)
    }

    pub fn processing_delay(&self) -> Duration {
        Duration::from_millis(self.processing_delay_ms)
    }

    pub fn claim_timeout(&self) -> Duration {
        Duration::from_millis(self.claim_timeout_ms)
    }

    pub fn retention(&self) -> Option<Duration> {
        self.retention_ms.map(Duration::from_millis)
    }

    /// Reject values the worker loop cannot run with
    pub fn validate(&self) -> ConfigResult<()> {
        if self.processing_interval_ms == 0 {
            return Err(ConfigurationError::invalid_value(
                "outbox.processing_interval_ms",
                0,
                "processing interval must be greater than 0",
            ));
        }

        if self.processing_count == 0 {
            return Err(ConfigurationError::invalid_value(
                "outbox.processing_count",
                0,
                "batch size must be greater than 0",
            ));
        }

        if self.claim_timeout_ms == 0 {
            return Err(ConfigurationError::invalid_value(
                "outbox.claim_timeout_ms",
                0,
                "claim timeout must be greater than 0",
            ));
        }

        if self.purge_on_startup && self.purge_processed_on_startup {
            tracing::warn!(
                "Both purge_on_startup and purge_processed_on_startup are set; \
                 purge_on_startup wins"
            );
        }

        Ok(())
    }
}

/// Exponential backoff settings for the retry behavior
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ExponentialBackoffConfig {
    pub initial_ms: u64,
    pub multiplier: f64,
    pub max_ms: u64,
    pub jitter: bool,
}

impl Default for ExponentialBackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: 100,
            multiplier: 2.0,
            max_ms: 30_000,
            jitter: true,
        }
    }
}

/// Broker behavior pipeline configuration
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct BrokerConfig {
    /// Total tries per handler invocation, including the first
    pub retry_attempts: u32,
    /// Fixed delay between tries when no exponential policy is set
    pub retry_backoff_ms: u64,
    pub exponential_backoff: Option<ExponentialBackoffConfig>,
    pub handler_timeout_ms: Option<u64>,
    /// Probability of synthetic failure; test environments only
    pub chaos_injection_rate: Option<f64>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            retry_attempts: defaults::RETRY_ATTEMPTS,
            retry_backoff_ms: defaults::RETRY_BACKOFF_MS,
            exponential_backoff: None,
            handler_timeout_ms: None,
            chaos_injection_rate: None,
        }
    }
}

impl BrokerConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn handler_timeout(&self) -> Option<Duration> {
        self.handler_timeout_ms.map(Duration::from_millis)
    }

    pub fn validate(&self, environment: &str) -> ConfigResult<()> {
        if self.retry_attempts == 0 {
            return Err(ConfigurationError::invalid_value(
                "broker.retry_attempts",
                0,
                "at least one attempt is required",
            ));
        }

        if let Some(exp) = &self.exponential_backoff {
            if exp.multiplier < 1.0 {
                return Err(ConfigurationError::invalid_value(
                    "broker.exponential_backoff.multiplier",
                    exp.multiplier,
                    "multiplier must be at least 1.0",
                ));
            }
            if exp.max_ms < exp.initial_ms {
                return Err(ConfigurationError::invalid_value(
                    "broker.exponential_backoff.max_ms",
                    exp.max_ms,
                    "max delay must not be lower than the initial delay",
                ));
            }
        }

        if self.handler_timeout_ms == Some(0) {
            return Err(ConfigurationError::invalid_value(
                "broker.handler_timeout_ms",
                0,
                "timeout must be greater than 0",
            ));
        }

        if let Some(rate) = self.chaos_injection_rate {
            if !(0.0..=1.0).contains(&rate) {
                return Err(ConfigurationError::invalid_value(
                    "broker.chaos_injection_rate",
                    rate,
                    "rate must be between 0.0 and 1.0",
                ));
            }
            if environment == environments::PRODUCTION {
                return Err(ConfigurationError::forbidden_in_environment(
                    "broker.chaos_injection_rate",
                    environment,
                ));
            }
        }

        Ok(())
    }
}

impl CourierConfig {
    /// Validate the whole configuration tree
    pub fn validate(&self) -> ConfigResult<()> {
        if self.environment.is_empty() {
            return Err(ConfigurationError::missing_required_field(
                "environment",
                "root configuration",
            ));
        }

        self.broker.validate(&self.environment)?;
        self.outbox.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = CourierConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.outbox.processing_mode, ProcessingMode::Deferred);
        assert_eq!(config.outbox.processing_count, 100);
        assert!(config.outbox.auto_save);
        assert_eq!(config.broker.retry_attempts, 3);
    }

    #[test]
    fn test_duration_accessors() {
        let outbox = OutboxConfig {
            startup_delay_ms: 1500,
            processing_interval_ms: 250,
            retention_ms: Some(60_000),
            ..Default::default()
        };
        assert_eq!(outbox.startup_delay(), Duration::from_millis(1500));
        assert_eq!(outbox.processing_interval(), Duration::from_millis(250));
        assert_eq!(outbox.retention(), Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let mut config = CourierConfig::default();
        config.outbox.processing_count = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("outbox.processing_count"));
    }

    #[test]
    fn test_zero_interval_rejected_directly() {
        let outbox = OutboxConfig {
            processing_interval_ms: 0,
            ..Default::default()
        };
        let err = outbox.validate().unwrap_err();
        assert!(err.to_string().contains("outbox.processing_interval_ms"));
    }

    #[test]
    fn test_chaos_rejected_in_production() {
        let mut config = CourierConfig::default();
        config.broker.chaos_injection_rate = Some(0.2);
        assert!(config.validate().is_ok());

        config.environment = "production".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigurationError::ForbiddenInEnvironment { .. })
        ));
    }

    #[test]
    fn test_chaos_rate_bounds() {
        let mut config = CourierConfig::default();
        config.broker.chaos_injection_rate = Some(1.5);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_processing_mode_serde() {
        let mode: ProcessingMode = serde_json::from_str("\"immediate\"").unwrap();
        assert_eq!(mode, ProcessingMode::Immediate);
    }
}
