//! Configuration for the relay server
//!
//! Supports TOML configuration files with sensible defaults.
//! Configuration is loaded from:
//! - macOS: ~/Library/Application Support/relay/config.toml
//! - Linux: ~/.config/relay/config.toml
//! - Windows: %APPDATA%/relay/config.toml

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::codegen::MAX_CODE_LENGTH;
use crate::{DEFAULT_CODE_LENGTH, DEFAULT_PORT, DEFAULT_SWEEP_INTERVAL_SECS, DEFAULT_TTL_SECS};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Listener settings
    pub server: ServerConfig,
    /// Session lifecycle settings
    pub session: SessionConfig,
}

/// Listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen port
    pub port: u16,
    /// Bind address
    pub bind: IpAddr,
    /// Path prefix for every route ("" or "/something")
    pub route_prefix: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            route_prefix: String::new(),
        }
    }
}

/// Which queued client receives the next id the host hands out
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinOrder {
    /// Most recently queued client first
    #[default]
    Lifo,
    /// First come, first served
    Fifo,
}

impl std::str::FromStr for JoinOrder {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "lifo" => Ok(JoinOrder::Lifo),
            "fifo" => Ok(JoinOrder::Fifo),
            other => Err(ConfigError::Invalid(format!(
                "unknown join order {:?} (expected lifo or fifo)",
                other
            ))),
        }
    }
}

/// Session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Letters per session code
    pub code_length: usize,
    /// Idle time after which a session is closed
    pub ttl_secs: u64,
    /// Minimum time between sweeps of expired sessions
    pub sweep_interval_secs: u64,
    /// Pending-join queue policy
    pub join_order: JoinOrder,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            code_length: DEFAULT_CODE_LENGTH,
            ttl_secs: DEFAULT_TTL_SECS,
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
            join_order: JoinOrder::default(),
        }
    }
}

impl SessionConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Self {
        match Self::default_path() {
            Some(path) => Self::load_from(&path).unwrap_or_else(|e| {
                warn!("Failed to load config from {:?}: {}, using defaults", path, e);
                Self::default()
            }),
            None => {
                debug!("No config directory found, using defaults");
                Self::default()
            }
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            debug!("Config file {:?} not found, using defaults", path);
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;

        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;

        info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Get the default config file path
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("com", "relay", "relay").map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Check values the server cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let length = self.session.code_length;
        if length == 0 || length > MAX_CODE_LENGTH {
            return Err(ConfigError::Invalid(format!(
                "session.code_length must be between 1 and {} (got {})",
                MAX_CODE_LENGTH, length
            )));
        }

        if self.session.sweep_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "session.sweep_interval_secs must be greater than zero".into(),
            ));
        }

        let prefix = &self.server.route_prefix;
        if !prefix.is_empty() && (!prefix.starts_with('/') || prefix.ends_with('/')) {
            return Err(ConfigError::Invalid(format!(
                "server.route_prefix must be empty or look like \"/relay\" (got {:?})",
                prefix
            )));
        }

        Ok(())
    }

    /// Serialize as TOML (the same shape `load_from` reads)
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Generate a sample configuration file content
    pub fn sample() -> String {
        Self::default().to_toml().unwrap_or_default()
    }
}

/// Configuration errors
#[derive(Debug, Clone)]
pub enum ConfigError {
    /// I/O error
    Io(String),
    /// Parse error
    Parse(String),
    /// A value is out of range
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "I/O error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Invalid(e) => write!(f, "Invalid configuration: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}
