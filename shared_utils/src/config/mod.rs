//! Configuration management module for tether.
//!
//! This module provides functionality for loading, parsing, and managing
//! configuration settings shared by the client and the tunnel service.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Error reading configuration file
    #[error("Failed to read config file: {0}")]
    IoError(#[from] io::Error),

    /// Error parsing TOML configuration
    #[error("Failed to parse TOML config: {0}")]
    TomlError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration file not found
    #[error("Configuration file not found at {0}")]
    FileNotFound(PathBuf),
}

impl ConfigError {
    fn invalid(key: &str, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            key: key.to_string(),
            message: message.into(),
        }
    }
}

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Client-side settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    /// File holding the last known session state
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
}

fn default_state_file() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join("tether").join("session.json"))
        .unwrap_or_else(|| PathBuf::from("session.json"))
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            state_file: default_state_file(),
        }
    }
}

/// Network path monitoring settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NetworkConfig {
    /// Reconnect when a new validated network appears (default: true)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Address probed to decide whether a path has working connectivity
    #[serde(default = "default_probe_address")]
    pub probe_address: String,

    /// Routing table poll interval in milliseconds (default: 2000)
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Connectivity probe timeout in milliseconds (default: 1500)
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

fn default_true() -> bool {
    true
}

fn default_probe_address() -> String {
    "1.1.1.1:443".to_string()
}

fn default_poll_interval_ms() -> u64 {
    2000
}

fn default_probe_timeout_ms() -> u64 {
    1500
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            enabled: default_true(),
            probe_address: default_probe_address(),
            poll_interval_ms: default_poll_interval_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
        }
    }
}

impl NetworkConfig {
    /// Parsed probe address. Only fails on configs that skipped validation.
    pub fn probe_socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.probe_address
            .parse()
            .map_err(|e| ConfigError::invalid("network.probe_address", format!("{}", e)))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

/// Tunnel service settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServiceConfig {
    /// Delay before a simulated tunnel reports Connected (default: 500)
    #[serde(default = "default_connect_delay_ms")]
    pub connect_delay_ms: u64,

    /// Interval of statistics updates while connected (default: 1000)
    #[serde(default = "default_statistics_interval_ms")]
    pub statistics_interval_ms: u64,
}

fn default_connect_delay_ms() -> u64 {
    500
}

fn default_statistics_interval_ms() -> u64 {
    1000
}

impl Default for ServiceConfig {
    fn default() -> Self {
        ServiceConfig {
            connect_delay_ms: default_connect_delay_ms(),
            statistics_interval_ms: default_statistics_interval_ms(),
        }
    }
}

impl ServiceConfig {
    pub fn connect_delay(&self) -> Duration {
        Duration::from_millis(self.connect_delay_ms)
    }

    pub fn statistics_interval(&self) -> Duration {
        Duration::from_millis(self.statistics_interval_ms)
    }
}

/// Log output settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Also write logs to a daily rolling file (default: false)
    #[serde(default)]
    pub log_to_file: bool,

    /// Directory for log files (default: "./logs")
    #[serde(default = "default_log_dir")]
    pub log_dir: String,

    /// Emit JSON instead of human readable lines (default: false)
    #[serde(default)]
    pub json_format: bool,
}

fn default_log_dir() -> String {
    "./logs".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            log_to_file: false,
            log_dir: default_log_dir(),
            json_format: false,
        }
    }
}

/// Main configuration structure for tether.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Log level (default: "info")
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Unix socket the tunnel service listens on
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,

    /// Client configuration
    #[serde(default)]
    pub client: ClientConfig,

    /// Network monitoring configuration
    #[serde(default)]
    pub network: NetworkConfig,

    /// Tunnel service configuration
    #[serde(default)]
    pub service: ServiceConfig,

    /// Log output configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_socket_path() -> PathBuf {
    dirs::runtime_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("tether")
        .join("service.sock")
}

impl Default for Config {
    fn default() -> Self {
        Config {
            log_level: default_log_level(),
            socket_path: default_socket_path(),
            client: ClientConfig::default(),
            network: NetworkConfig::default(),
            service: ServiceConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;

        // Environment variables take precedence over the file
        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Load the file at `path` if it exists, defaults (plus environment
    /// overrides) otherwise
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        match Self::load(path) {
            Err(ConfigError::FileNotFound(_)) => {
                let mut config = Config::default();
                config.apply_env_overrides();
                config.validate()?;
                Ok(config)
            }
            other => other,
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !LOG_LEVELS.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(ConfigError::invalid(
                "log_level",
                format!("must be one of {}", LOG_LEVELS.join(", ")),
            ));
        }

        if self.socket_path.as_os_str().is_empty() {
            return Err(ConfigError::invalid("socket_path", "must not be empty"));
        }

        if self.client.state_file.as_os_str().is_empty() {
            return Err(ConfigError::invalid("client.state_file", "must not be empty"));
        }

        self.network.probe_socket_addr()?;
        if self.network.poll_interval_ms == 0 {
            return Err(ConfigError::invalid(
                "network.poll_interval_ms",
                "must be greater than 0",
            ));
        }
        if self.network.probe_timeout_ms == 0 {
            return Err(ConfigError::invalid(
                "network.probe_timeout_ms",
                "must be greater than 0",
            ));
        }

        if self.service.statistics_interval_ms == 0 {
            return Err(ConfigError::invalid(
                "service.statistics_interval_ms",
                "must be greater than 0",
            ));
        }

        Ok(())
    }

    /// Apply `TETHER_*` environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary variable source. Unparsable values
    /// are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse_bool(s: &str) -> Option<bool> {
            match s.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Some(true),
                "0" | "false" | "no" | "off" => Some(false),
                _ => None,
            }
        }

        fn parse_u64(s: &str) -> Option<u64> {
            s.trim().parse::<u64>().ok()
        }

        if let Some(v) = lookup("TETHER_LOG_LEVEL") {
            self.log_level = v.trim().to_lowercase();
        }
        if let Some(v) = lookup("TETHER_SOCKET_PATH") {
            self.socket_path = PathBuf::from(v);
        }

        // Client
        if let Some(v) = lookup("TETHER_STATE_FILE") {
            self.client.state_file = PathBuf::from(v);
        }

        // Network
        if let Some(b) = lookup("TETHER_NETWORK_ENABLED").as_deref().and_then(parse_bool) {
            self.network.enabled = b;
        }
        if let Some(v) = lookup("TETHER_NETWORK_PROBE_ADDRESS") {
            self.network.probe_address = v.trim().to_string();
        }
        if let Some(n) = lookup("TETHER_NETWORK_POLL_INTERVAL_MS")
            .as_deref()
            .and_then(parse_u64)
        {
            self.network.poll_interval_ms = n;
        }
        if let Some(n) = lookup("TETHER_NETWORK_PROBE_TIMEOUT_MS")
            .as_deref()
            .and_then(parse_u64)
        {
            self.network.probe_timeout_ms = n;
        }

        // Service
        if let Some(n) = lookup("TETHER_SERVICE_CONNECT_DELAY_MS")
            .as_deref()
            .and_then(parse_u64)
        {
            self.service.connect_delay_ms = n;
        }
        if let Some(n) = lookup("TETHER_SERVICE_STATISTICS_INTERVAL_MS")
            .as_deref()
            .and_then(parse_u64)
        {
            self.service.statistics_interval_ms = n;
        }

        // Logging
        if let Some(b) = lookup("TETHER_LOG_TO_FILE").as_deref().and_then(parse_bool) {
            self.logging.log_to_file = b;
        }
        if let Some(v) = lookup("TETHER_LOG_DIR") {
            self.logging.log_dir = v;
        }
        if let Some(b) = lookup("TETHER_LOG_JSON").as_deref().and_then(parse_bool) {
            self.logging.json_format = b;
        }
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("tether").join("config.toml")
        } else {
            PathBuf::from("config.toml")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn overrides(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.log_level, "info");
        assert!(config.network.enabled);
        assert_eq!(config.network.poll_interval_ms, 2000);
        assert_eq!(config.service.connect_delay_ms, 500);
        assert!(config.socket_path.ends_with("tether/service.sock"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_overrides_replace_values() {
        let mut config = Config::default();
        config.apply_overrides(overrides(&[
            ("TETHER_LOG_LEVEL", "DEBUG"),
            ("TETHER_SOCKET_PATH", "/run/tether.sock"),
            ("TETHER_STATE_FILE", "/tmp/state.json"),
            ("TETHER_NETWORK_ENABLED", "off"),
            ("TETHER_SERVICE_CONNECT_DELAY_MS", "25"),
            ("TETHER_LOG_JSON", "yes"),
        ]));

        assert_eq!(config.log_level, "debug");
        assert_eq!(config.socket_path, PathBuf::from("/run/tether.sock"));
        assert_eq!(config.client.state_file, PathBuf::from("/tmp/state.json"));
        assert!(!config.network.enabled);
        assert_eq!(config.service.connect_delay_ms, 25);
        assert!(config.logging.json_format);
    }

    #[test]
    fn test_unparsable_overrides_are_ignored() {
        let mut config = Config::default();
        config.apply_overrides(overrides(&[
            ("TETHER_NETWORK_ENABLED", "maybe"),
            ("TETHER_NETWORK_POLL_INTERVAL_MS", "soon"),
        ]));

        assert!(config.network.enabled);
        assert_eq!(config.network.poll_interval_ms, 2000);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.log_level = "loud".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref key, .. }) if key == "log_level"
        ));

        let mut config = Config::default();
        config.network.probe_address = "not an address".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.network.poll_interval_ms = 0;
        assert!(config.validate().is_err());
    }
}
