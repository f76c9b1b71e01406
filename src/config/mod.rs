//! Configuration management for mediafix
//!
//! This module provides a layered configuration system that loads settings from:
//! 1. Default values (embedded in structs)
//! 2. TOML configuration file
//! 3. `.env` file and environment variables (highest priority)
//!
//! # Usage
//!
//! ```no_run
//! use mediafix::config::Config;
//!
//! let config = Config::load().expect("Failed to load configuration");
//! println!("Workers: {}", config.queue.max_concurrency);
//! ```
//!
//! # Environment Variables
//!
//! Configuration can be overridden using environment variables with the pattern:
//! `MEDIAFIX__<section>__<key>`
//!
//! Examples:
//! - `MEDIAFIX__SERVER__BIND_ADDR=0.0.0.0:9000`
//! - `MEDIAFIX__QUEUE__MAX_CONCURRENCY=4`
//! - `MEDIAFIX__QUEUE__QUEUE_CAPACITY=unbounded`
//!
//! # Configuration File
//!
//! By default, the configuration is loaded from `config/mediafix.toml`.
//! This can be overridden using the `MEDIAFIX_CONFIG` environment variable.

mod models;
mod sources;
mod validation;

pub use crate::humanize::{ByteSize, HumanDuration};
pub use models::{
    CacheConfig, CompressionConfig, Config, NotifyConfig, QueueCapacity, QueueConfig,
    ServerConfig, SourceConfig, SourceKind,
};
pub use sources::{CONFIG_ENV_VAR, DEFAULT_CONFIG_PATH, config_path};
pub use validation::ValidationError;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    LoadError(#[from] config::ConfigError),

    #[error("Configuration validation failed: {0}")]
    ValidationError(#[from] ValidationError),

    #[error("Failed to render configuration: {0}")]
    RenderError(#[from] toml::ser::Error),
}

impl Config {
    /// Load configuration from all sources (file + environment)
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration file is malformed or
    /// validation fails.
    pub fn load() -> Result<Self, ConfigError> {
        let config = sources::load()?;
        validation::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let config = sources::load_from_sources(path.as_ref())?;
        validation::validate(&config)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        validation::validate(self)
    }

    /// Effective configuration as TOML
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}
