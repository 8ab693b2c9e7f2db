//! Application configuration.
//!
//! A [`Config`] names the event-bus connections an application opens. It is
//! loaded from YAML files and environment variables; each connection's
//! untyped settings are resolved into typed connector settings
//! ([`NatsSettings`], [`JetStreamSettings`]).

mod settings;

use std::collections::HashMap;

use serde::Deserialize;

pub use settings::{
    InstanceConfig, JetStreamSettings, NatsSettings, DEFAULT_STREAM_PREFIX, DEFAULT_URL,
    EVENT_STREAM_SUFFIX,
};

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "eventwire.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "EVENTWIRE_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "EVENTWIRE";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "EVENTWIRE_LOG";

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Setting '{key}' must be a {expected}")]
    InvalidType { key: String, expected: &'static str },

    #[error("Failed to load configuration: {0}")]
    Load(String),
}

impl From<::config::ConfigError> for ConfigError {
    fn from(e: ::config::ConfigError) -> Self {
        ConfigError::Load(e.to_string())
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Application name; seeds the JetStream stream prefix.
    pub app_name: Option<String>,
    /// Named connections.
    pub connections: HashMap<String, InstanceConfig>,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `eventwire.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix, `__` separated
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(yaml).map_err(|e| ConfigError::Load(e.to_string()))
    }

    pub fn connection(&self, name: &str) -> Option<&InstanceConfig> {
        self.connections.get(name)
    }
}

#[cfg(test)]
mod tests;
