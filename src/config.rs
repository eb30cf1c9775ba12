//! Partyline Configuration
//!
//! This module provides configuration structures for the Partyline
//! distributed state manager.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::state::ids::{is_valid_id, InstanceId};

/// Main Partyline configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PartylineConfig {
    /// Shared store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Instance-specific configuration
    #[serde(default)]
    pub instance: InstanceConfig,

    /// Expiry and heartbeat timings
    #[serde(default)]
    pub ttl: TtlConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Shared store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Redis-compatible connection URL
    #[serde(default = "default_store_url")]
    pub url: String,

    /// Prefix for every key written by this manager
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Upper bound for a single store call in milliseconds
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
}

/// Instance-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct InstanceConfig {
    /// Fixed instance identifier (a fresh UUID is generated when unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

/// Expiry and heartbeat timings, in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtlConfig {
    /// Connection record TTL, refreshed on activity
    #[serde(default = "default_connection_secs")]
    pub connection_secs: u64,

    /// Session membership and leader key TTL
    #[serde(default = "default_session_secs")]
    pub session_secs: u64,

    /// Instance heartbeat key TTL
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,

    /// How often the heartbeat key is rewritten
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

/// Runtime settings handed to a `DistributedStateManager`
#[derive(Debug, Clone)]
pub struct StateConfig {
    pub key_prefix: String,
    pub connection_ttl: Duration,
    pub session_ttl: Duration,
    pub heartbeat_ttl: Duration,
    pub heartbeat_interval: Duration,
}

// Default value functions
fn default_store_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_key_prefix() -> String {
    "partyline".to_string()
}

fn default_command_timeout_ms() -> u64 {
    2000
}

fn default_connection_secs() -> u64 {
    60 * 60
}

fn default_session_secs() -> u64 {
    4 * 60 * 60
}

fn default_heartbeat_secs() -> u64 {
    60
}

fn default_heartbeat_interval_secs() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: default_store_url(),
            key_prefix: default_key_prefix(),
            command_timeout_ms: default_command_timeout_ms(),
        }
    }
}

impl Default for TtlConfig {
    fn default() -> Self {
        Self {
            connection_secs: default_connection_secs(),
            session_secs: default_session_secs(),
            heartbeat_secs: default_heartbeat_secs(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Default for StateConfig {
    fn default() -> Self {
        Self::from(&PartylineConfig::default())
    }
}

impl From<&PartylineConfig> for StateConfig {
    fn from(config: &PartylineConfig) -> Self {
        Self {
            key_prefix: config.store.key_prefix.clone(),
            connection_ttl: Duration::from_secs(config.ttl.connection_secs),
            session_ttl: Duration::from_secs(config.ttl.session_secs),
            heartbeat_ttl: Duration::from_secs(config.ttl.heartbeat_secs),
            heartbeat_interval: Duration::from_secs(config.ttl.heartbeat_interval_secs),
        }
    }
}

impl StateConfig {
    /// Validate the runtime settings
    pub fn validate(&self) -> crate::Result<()> {
        if !is_valid_id(&self.key_prefix) {
            return Err(crate::Error::Config(format!(
                "key prefix '{}' may only contain letters, digits, '-' and '_'",
                self.key_prefix
            )));
        }

        let expiries = [
            ("connection", self.connection_ttl),
            ("session", self.session_ttl),
            ("heartbeat", self.heartbeat_ttl),
        ];
        for (name, ttl) in expiries {
            if ttl < Duration::from_secs(1) {
                return Err(crate::Error::Config(format!("{} ttl must be at least one second", name)));
            }
        }

        if self.heartbeat_interval.is_zero() || self.heartbeat_interval >= self.heartbeat_ttl {
            return Err(crate::Error::Config(format!(
                "heartbeat interval ({:?}) must be non-zero and shorter than the heartbeat ttl ({:?})",
                self.heartbeat_interval, self.heartbeat_ttl
            )));
        }

        Ok(())
    }
}

impl PartylineConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: PartylineConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Render configuration as TOML
    pub fn to_toml(&self) -> crate::Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("Failed to serialize config: {}", e)))
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.store.url.is_empty() {
            return Err(crate::Error::Config("store.url cannot be empty".into()));
        }

        if self.store.command_timeout_ms == 0 {
            return Err(crate::Error::Config("store.command_timeout_ms must be positive".into()));
        }

        if let Some(id) = &self.instance.id {
            InstanceId::parse(id)?;
        }

        self.state_config().validate()
    }

    /// Get the store call timeout as Duration
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.store.command_timeout_ms)
    }

    /// Runtime settings for the state manager
    pub fn state_config(&self) -> StateConfig {
        StateConfig::from(self)
    }
}
