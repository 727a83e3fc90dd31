//! Client configuration.
//!
//! Configuration is loaded from a TOML file. Every field has a default, so
//! an empty file (or `Config::default()`) is a working configuration.

use serde::Deserialize;
use std::path::PathBuf;

/// Root configuration for a Tether account.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Account configuration.
    #[serde(default)]
    pub account: AccountConfig,
    /// Sync engine configuration.
    #[serde(default)]
    pub sync: SyncConfig,
    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Account configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AccountConfig {
    /// Realm tag prefixed to every address (default: "id1").
    #[serde(default = "default_realm")]
    pub realm: String,
    /// Human readable name of this device.
    #[serde(default = "default_device_name")]
    pub device_name: String,
}

/// Sync engine configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Highest datawallet version this client understands (default: 1).
    #[serde(default = "default_supported_datawallet_version")]
    pub supported_datawallet_version: u32,
    /// Push leftover modifications after every run (default: true).
    #[serde(default = "default_opportunistic_datawallet_sync")]
    pub opportunistic_datawallet_sync: bool,
    /// External events fetched per request (default: 100).
    #[serde(default = "default_page_size")]
    pub external_event_page_size: usize,
    /// Datawallet modifications fetched per request (default: 100).
    #[serde(default = "default_page_size")]
    pub datawallet_page_size: usize,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// `tracing` filter directive, overridden by `RUST_LOG` (default: "info").
    #[serde(default = "default_filter")]
    pub filter: String,
}

// Default value functions
fn default_realm() -> String {
    "id1".to_string()
}

fn default_device_name() -> String {
    "primary".to_string()
}

fn default_supported_datawallet_version() -> u32 {
    1
}

fn default_opportunistic_datawallet_sync() -> bool {
    true
}

fn default_page_size() -> usize {
    100
}

fn default_filter() -> String {
    "info".to_string()
}

impl Default for AccountConfig {
    fn default() -> Self {
        Self {
            realm: default_realm(),
            device_name: default_device_name(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            supported_datawallet_version: default_supported_datawallet_version(),
            opportunistic_datawallet_sync: default_opportunistic_datawallet_sync(),
            external_event_page_size: default_page_size(),
            datawallet_page_size: default_page_size(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_filter(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        assert_eq!(config.account.realm, "id1");
        assert_eq!(config.sync.supported_datawallet_version, 1);
        assert!(config.sync.opportunistic_datawallet_sync);
        assert_eq!(config.sync.external_event_page_size, 100);
        assert_eq!(config.logging.filter, "info");
    }

    #[test]
    fn config_from_toml_string() {
        let toml = r#"
[account]
realm = "id2"
device_name = "laptop"

[sync]
supported_datawallet_version = 3
opportunistic_datawallet_sync = false
external_event_page_size = 10

[logging]
filter = "tether_sync_client=debug"
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.account.realm, "id2");
        assert_eq!(config.account.device_name, "laptop");
        assert_eq!(config.sync.supported_datawallet_version, 3);
        assert!(!config.sync.opportunistic_datawallet_sync);
        assert_eq!(config.sync.external_event_page_size, 10);
        assert_eq!(config.sync.datawallet_page_size, 100);
        assert_eq!(config.logging.filter, "tether_sync_client=debug");
    }

    #[test]
    fn empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.account.device_name, "primary");
        assert_eq!(config.sync.datawallet_page_size, 100);
    }

    #[test]
    fn config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[sync]\nsupported_datawallet_version = 2").unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.sync.supported_datawallet_version, 2);
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::from_file(&dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::ReadError { .. }));
    }

    #[test]
    fn invalid_toml_is_a_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[sync\nbroken").unwrap();

        let err = Config::from_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }
}
