//! Configuration Loader
//!
//! Environment-aware configuration loading built on the `config` crate.
//! Sources are merged in order, later sources overriding earlier ones:
//!
//! 1. [`CourierConfig::default`]
//! 2. `{config_dir}/courier.toml` (optional)
//! 3. `{config_dir}/courier.{environment}.toml` (optional)
//! 4. `COURIER__SECTION__KEY` environment variables

use super::error::{ConfigResult, ConfigurationError};
use super::CourierConfig;
use crate::constants::environments;
use config::{Config, Environment, File};
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

const ENV_PREFIX: &str = "COURIER";
const ENV_SEPARATOR: &str = "__";

/// Loaded, validated configuration
#[derive(Debug)]
pub struct ConfigManager {
    config: CourierConfig,
    environment: String,
}

impl ConfigManager {
    /// Load configuration with environment auto-detection
    pub fn load() -> ConfigResult<Arc<ConfigManager>> {
        Self::load_from_directory(None)
    }

    /// Load configuration from a specific directory
    pub fn load_from_directory(config_dir: Option<PathBuf>) -> ConfigResult<Arc<ConfigManager>> {
        let environment = Self::detect_environment();
        Self::load_from_directory_with_env(config_dir, &environment)
    }

    /// Load configuration from a specific directory with explicit environment
    /// This is useful for testing without modifying global environment variables
    pub fn load_from_directory_with_env(
        config_dir: Option<PathBuf>,
        environment: &str,
    ) -> ConfigResult<Arc<ConfigManager>> {
        let config_directory = config_dir.unwrap_or_else(|| PathBuf::from("config"));

        debug!(
            environment = %environment,
            directory = %config_directory.display(),
            "Loading configuration"
        );

        let mut config = Self::build(&config_directory, environment)?;
        config.environment = environment.to_string();
        config.validate()?;

        info!(
            environment = %environment,
            outbox_enabled = config.outbox.enabled,
            processing_mode = ?config.outbox.processing_mode,
            processing_interval_ms = config.outbox.processing_interval_ms,
            retry_attempts = config.broker.retry_attempts,
            "⚙️ Configuration loaded successfully"
        );

        Ok(Arc::new(ConfigManager {
            config,
            environment: environment.to_string(),
        }))
    }

    /// Wrap an already-built configuration, validating it first
    pub fn from_config(config: CourierConfig) -> ConfigResult<Arc<ConfigManager>> {
        config.validate()?;
        Ok(Arc::new(ConfigManager {
            environment: config.environment.clone(),
            config,
        }))
    }

    fn build(config_directory: &Path, environment: &str) -> ConfigResult<CourierConfig> {
        let defaults = Config::try_from(&CourierConfig::default())
            .map_err(|e| ConfigurationError::load_error(environment, e))?;

        let base_file = config_directory.join("courier.toml");
        let env_file = config_directory.join(format!("courier.{environment}.toml"));

        let merged = Config::builder()
            .add_source(defaults)
            .add_source(File::from(base_file).required(false))
            .add_source(File::from(env_file).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator(ENV_SEPARATOR)
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| ConfigurationError::load_error(environment, e))?;

        merged
            .try_deserialize::<CourierConfig>()
            .map_err(ConfigurationError::deserialization_error)
    }

    /// Get the loaded configuration
    pub fn config(&self) -> &CourierConfig {
        &self.config
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    /// Detect the current environment from environment variables
    pub fn detect_environment() -> String {
        env::var("COURIER_ENV")
            .or_else(|_| env::var("APP_ENV"))
            .unwrap_or_else(|_| environments::DEVELOPMENT.to_string())
    }
}
