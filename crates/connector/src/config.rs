//! Configuration management for the go2link connector.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/go2link/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::handshake::HandshakeMethod;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("device address must be a bare host or IP without scheme, port or path, got {0:?}")]
    InvalidAddress(String),

    #[error("http_timeout_secs must be between 1 and 120 seconds, got {0}")]
    InvalidHttpTimeout(u64),

    #[error("ice_gathering_timeout_secs must be between 1 and 120 seconds, got {0}")]
    InvalidIceGatheringTimeout(u64),

    #[error("stun server must start with stun: or stuns:, got {0}")]
    InvalidStunServer(String),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Address the robot uses for itself in access-point mode.
pub const DEFAULT_DEVICE_ADDRESS: &str = "192.168.12.1";

/// Main configuration structure for the connector.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Which robot to connect to and how.
    pub device: DeviceConfig,

    /// HTTP and WebRTC settings.
    pub network: NetworkConfig,

    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Target device configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DeviceConfig {
    /// Host name or IP address of the robot.
    pub address: String,

    /// Access token sent with the offer. Empty for local-network sessions.
    pub token: String,

    /// Handshake flavour (auto, encrypted, legacy).
    pub handshake_method: HandshakeMethod,
}

/// Network configuration for the handshake and WebRTC.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// Timeout applied to each handshake HTTP request.
    pub http_timeout_secs: u64,

    /// Upper bound on ICE candidate gathering before the offer is sent.
    pub ice_gathering_timeout_secs: u64,

    /// STUN servers for candidate gathering. Empty on a local network.
    pub stun_servers: Vec<String>,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_DEVICE_ADDRESS.to_string(),
            token: String::new(),
            handshake_method: HandshakeMethod::Auto,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            http_timeout_secs: 10,
            ice_gathering_timeout_secs: 10,
            stun_servers: Vec::new(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

impl NetworkConfig {
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn ice_gathering_timeout(&self) -> Duration {
        Duration::from_secs(self.ice_gathering_timeout_secs)
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("go2link")
        .join("config.toml")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - GO2LINK_DEVICE_ADDRESS: Override the robot address
    /// - GO2LINK_TOKEN: Override the access token
    /// - GO2LINK_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    pub fn apply_env_overrides(&mut self) {
        if let Ok(address) = std::env::var("GO2LINK_DEVICE_ADDRESS") {
            if !address.is_empty() {
                tracing::info!("Overriding device address from environment: {}", address);
                self.device.address = address;
            }
        }

        if let Ok(token) = std::env::var("GO2LINK_TOKEN") {
            if !token.is_empty() {
                tracing::info!("Overriding token from environment");
                self.device.token = token;
            }
        }

        if let Ok(level) = std::env::var("GO2LINK_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.logging.log_level = level;
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_address(&self.device.address)?;

        if !(1..=120).contains(&self.network.http_timeout_secs) {
            return Err(ConfigError::InvalidHttpTimeout(self.network.http_timeout_secs));
        }

        if !(1..=120).contains(&self.network.ice_gathering_timeout_secs) {
            return Err(ConfigError::InvalidIceGatheringTimeout(
                self.network.ice_gathering_timeout_secs,
            ));
        }

        if let Some(bad) = self
            .network
            .stun_servers
            .iter()
            .find(|s| !s.starts_with("stun:") && !s.starts_with("stuns:"))
        {
            return Err(ConfigError::InvalidStunServer(bad.clone()));
        }

        let level = self.logging.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.logging.log_level.clone()));
        }

        Ok(())
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

/// The handshake appends its own ports and paths, so only a bare host is accepted.
fn validate_address(address: &str) -> Result<(), ConfigError> {
    let invalid = || ConfigError::InvalidAddress(address.to_string());

    if address.is_empty() || address.contains("://") || address.contains('/') {
        return Err(invalid());
    }

    let parsed = url::Url::parse(&format!("http://{}/", address)).map_err(|_| invalid())?;
    if parsed.host_str().is_none() || parsed.port().is_some() {
        return Err(invalid());
    }

    Ok(())
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
