pub mod validation;

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::turn::watchdog::WatchdogConfig;

use self::validation::validate_config;

/// Error type for configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Config validation error: {0}")]
    Validation(String),
}

/// Chat endpoint configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct EndpointConfig {
    pub url: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

/// Conversation shaping for the outbound body.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatConfig {
    #[serde(default = "default_history_window")]
    pub history_window: usize,
    #[serde(default)]
    pub locale: Option<String>,
    #[serde(default)]
    pub timezone: Option<String>,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            history_window: default_history_window(),
            locale: None,
            timezone: None,
        }
    }
}

/// Stall-detection grace periods, in seconds.
#[derive(Debug, Clone, Deserialize)]
pub struct WatchdogSection {
    #[serde(default = "default_first_token_secs")]
    pub first_token_secs: u64,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    #[serde(default = "default_guard_fallback_secs")]
    pub guard_fallback_secs: u64,
}

impl Default for WatchdogSection {
    fn default() -> Self {
        Self {
            first_token_secs: default_first_token_secs(),
            heartbeat_secs: default_heartbeat_secs(),
            guard_fallback_secs: default_guard_fallback_secs(),
        }
    }
}

/// Full application configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub endpoint: EndpointConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub watchdogs: WatchdogSection,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_request_timeout_secs() -> u64 {
    60
}
fn default_connect_timeout_secs() -> u64 {
    5
}
fn default_history_window() -> usize {
    8
}
fn default_first_token_secs() -> u64 {
    45
}
fn default_heartbeat_secs() -> u64 {
    15
}
fn default_guard_fallback_secs() -> u64 {
    10
}
fn default_log_level() -> String {
    "WARNING".to_string()
}

impl AppConfig {
    /// Load and validate a YAML config file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the file cannot be read, parsed, or fails
    /// a validation rule.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_yaml(&raw)
    }

    /// Parse and validate config from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] on parse failure or validation failure.
    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = serde_yaml::from_str(raw)?;
        validate_config(&config)?;
        Ok(config)
    }

    #[must_use]
    pub fn watchdog_config(&self) -> WatchdogConfig {
        WatchdogConfig {
            first_token: Duration::from_secs(self.watchdogs.first_token_secs),
            heartbeat: Duration::from_secs(self.watchdogs.heartbeat_secs),
            guard_fallback: Duration::from_secs(self.watchdogs.guard_fallback_secs),
        }
    }
}
