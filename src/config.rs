//! # Relay and Session Configuration
//!
//! This module defines the TOML configuration for the relay connection, the
//! peripheral session timers, and logging.
//!
//! ## Example: TOML Configuration
//!
//! ```toml
//! [relay]
//! url = "ws://localhost:2020"
//! call_timeout_ms = 5000
//!
//! [session]
//! extension_id = "scrattino"
//! discovery_timeout_ms = 15000
//! poll_interval_ms = 100
//!
//! [session.scan_options]
//! filters = ["arduino"]
//!
//! [logging]
//! level = "debug"
//! ```
//!
//! Every field has a default, so an empty file (or no file at all) yields a
//! working configuration pointed at a relay on `localhost:2020`.
//!
//! ## Example: Rust Usage
//!
//! ```rust
//! use firmata_link::config::Config;
//! let config: Config = toml::from_str("[session]\npoll_interval_ms = 250").unwrap();
//! assert_eq!(config.session.poll_interval_ms, 250);
//! assert_eq!(config.relay.url, "ws://localhost:2020");
//! assert!(config.validate().is_ok());
//! ```

// src/config.rs - Relay, session and logging configuration
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Main configuration struct: relay endpoint, session timers, logging.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Where the relay process listens and how long a single call may take.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RelayConfig {
    #[serde(default = "default_relay_url")]
    pub url: String,
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            url: default_relay_url(),
            call_timeout_ms: default_call_timeout_ms(),
        }
    }
}

impl RelayConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

/// Peripheral session behaviour.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionConfig {
    /// Identifier reported alongside every error event.
    #[serde(default = "default_extension_id")]
    pub extension_id: String,
    #[serde(default = "default_discovery_timeout_ms")]
    pub discovery_timeout_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Forwarded verbatim as the params of the `scan` call.
    #[serde(default)]
    pub scan_options: serde_json::Map<String, serde_json::Value>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            extension_id: default_extension_id(),
            discovery_timeout_ms: default_discovery_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            scan_options: serde_json::Map::new(),
        }
    }
}

impl SessionConfig {
    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl LoggingConfig {
    /// Parsed level; unknown names fall back to `INFO`.
    pub fn tracing_level(&self) -> tracing::Level {
        self.level.parse().unwrap_or(tracing::Level::INFO)
    }
}

impl Config {
    /// Reject values the session cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.relay.url.starts_with("ws://") || self.relay.url.starts_with("wss://")) {
            return Err(ConfigError::Invalid(format!(
                "relay url '{}' must use ws:// or wss://",
                self.relay.url
            )));
        }
        if self.relay.call_timeout_ms == 0 {
            return Err(ConfigError::Invalid("relay.call_timeout_ms must be > 0".to_string()));
        }
        if self.session.discovery_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "session.discovery_timeout_ms must be > 0".to_string(),
            ));
        }
        if self.session.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("session.poll_interval_ms must be > 0".to_string()));
        }
        Ok(())
    }
}

// Default value functions
fn default_relay_url() -> String { "ws://localhost:2020".to_string() }
fn default_call_timeout_ms() -> u64 { 5000 }
fn default_extension_id() -> String { "scrattino".to_string() }
fn default_discovery_timeout_ms() -> u64 { 15000 }
fn default_poll_interval_ms() -> u64 { 100 }
fn default_log_level() -> String { "info".to_string() }

/// Load configuration from a TOML file at the given path.
pub fn load_config(path: &str) -> Result<Config, ConfigError> {
    let config: Config = match std::fs::read_to_string(path) {
        Ok(contents) => match toml::from_str(&contents) {
            Ok(config) => config,
            Err(e) => {
                tracing::error!("Failed to parse config TOML: {}", e);
                return Err(ConfigError::Toml(e));
            }
        },
        Err(e) => {
            tracing::error!("Failed to read config file '{}': {}", path, e);
            return Err(ConfigError::Io(e));
        }
    };
    config.validate()?;
    Ok(config)
}
