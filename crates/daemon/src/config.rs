//! Configuration management for the TestHub daemon.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/testhub/config.toml`.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ipc::get_socket_path;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("session_ttl_secs must be greater than 0")]
    InvalidSessionTtl,

    #[error("sweep_interval_secs must be greater than 0")]
    InvalidSweepInterval,

    #[error("{0} must be greater than 0")]
    InvalidCapacity(&'static str),

    #[error("listen_addr must be a socket address like 127.0.0.1:8000, got {0}")]
    InvalidListenAddr(String),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the TestHub daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General daemon configuration.
    pub daemon: DaemonConfig,

    /// Session store configuration.
    pub store: StoreConfig,

    /// Event relay and WebSocket configuration.
    pub relay: RelayConfig,

    /// Archive location.
    pub archive: ArchiveConfig,

    /// IPC socket location.
    pub ipc: IpcConfig,
}

/// General daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Directory for daemon data (archive, logs).
    pub data_dir: PathBuf,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// When set, logs are also written to a daily-rolling file here.
    pub log_dir: Option<PathBuf>,
}

/// Session store configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StoreConfig {
    /// Lifetime of an open session record in seconds.
    pub session_ttl_secs: u64,

    /// How often expired keys are purged.
    pub sweep_interval_secs: u64,
}

/// Event relay configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RelayConfig {
    /// WebSocket listen address.
    pub listen_addr: String,

    /// Bound of the inbound result feed.
    pub feed_capacity: usize,

    /// Per-viewer outbound queue bound.
    pub viewer_channel_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct ArchiveConfig {
    /// Archive directory. Defaults to `<data_dir>/archive`.
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct IpcConfig {
    /// Socket path. Defaults to the XDG runtime directory.
    pub socket_path: Option<PathBuf>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: "info".to_string(),
            log_dir: None,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            session_ttl_secs: crate::store::DEFAULT_SESSION_TTL_SECS,
            sweep_interval_secs: 60,
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8000".to_string(),
            feed_capacity: crate::relay::DEFAULT_FEED_CAPACITY,
            viewer_channel_capacity: crate::relay::DEFAULT_VIEWER_CHANNEL_CAPACITY,
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("testhub")
        .join("config.toml")
}

/// Returns the default data directory path.
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("testhub")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - TESTHUB_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - TESTHUB_LISTEN_ADDR: Override the WebSocket listen address
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("TESTHUB_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.daemon.log_level = level;
            }
        }

        if let Ok(addr) = std::env::var("TESTHUB_LISTEN_ADDR") {
            if !addr.is_empty() {
                tracing::info!("Overriding listen_addr from environment: {}", addr);
                self.relay.listen_addr = addr;
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// # Errors
    ///
    /// Returns the first invalid setting found:
    /// - A zero session TTL or sweep interval
    /// - A zero feed or viewer channel capacity
    /// - A listen address that is not `host:port`
    /// - An unknown log level
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.store.session_ttl_secs == 0 {
            return Err(ConfigError::InvalidSessionTtl);
        }
        if self.store.sweep_interval_secs == 0 {
            return Err(ConfigError::InvalidSweepInterval);
        }
        if self.relay.feed_capacity == 0 {
            return Err(ConfigError::InvalidCapacity("feed_capacity"));
        }
        if self.relay.viewer_channel_capacity == 0 {
            return Err(ConfigError::InvalidCapacity("viewer_channel_capacity"));
        }

        self.listen_addr()?;

        let level = self.daemon.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.daemon.log_level.clone()));
        }

        Ok(())
    }

    /// The parsed WebSocket listen address.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidListenAddr`] if the address does not parse.
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.relay
            .listen_addr
            .parse()
            .map_err(|_| ConfigError::InvalidListenAddr(self.relay.listen_addr.clone()))
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.store.session_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.store.sweep_interval_secs)
    }

    /// The archive directory, falling back to `<data_dir>/archive`.
    pub fn archive_dir(&self) -> PathBuf {
        self.archive
            .dir
            .clone()
            .unwrap_or_else(|| self.daemon.data_dir.join("archive"))
    }

    /// The IPC socket path, falling back to the XDG runtime directory.
    pub fn socket_path(&self) -> PathBuf {
        self.ipc.socket_path.clone().unwrap_or_else(get_socket_path)
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    ///
    /// # Arguments
    ///
    /// * `path` - The configuration file to read.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read, or is not
    /// valid TOML. The message includes the offending position.
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
    ///
    /// Missing sections and fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the string is not valid TOML or has fields of
    /// the wrong type.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    ///
    /// # Arguments
    ///
    /// * `path` - Where to write the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the file
    /// cannot be written.
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

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    fn with_env<F: FnOnce()>(key: &str, value: Option<&str>, f: F) {
        let original = std::env::var(key).ok();
        // SAFETY: env access is serialized across these tests.
        unsafe {
            match value {
                Some(v) => std::env::set_var(key, v),
                None => std::env::remove_var(key),
            }
        }
        f();
        // SAFETY: see above.
        unsafe {
            match original {
                Some(v) => std::env::set_var(key, v),
                None => std::env::remove_var(key),
            }
        }
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.daemon.log_level, "info");
        assert!(config.daemon.log_dir.is_none());
        assert_eq!(config.store.session_ttl_secs, 86_400);
        assert_eq!(config.store.sweep_interval_secs, 60);
        assert_eq!(config.relay.listen_addr, "127.0.0.1:8000");
        assert_eq!(config.relay.feed_capacity, 1024);
        assert_eq!(config.relay.viewer_channel_capacity, 256);
        assert!(config.archive.dir.is_none());
        assert!(config.ipc.socket_path.is_none());
    }

    #[test]
    fn test_default_data_dir_is_testhub() {
        let config = DaemonConfig::default();
        assert!(config.data_dir.to_string_lossy().contains("testhub"));
    }

    #[test]
    fn test_from_toml_empty() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_from_toml_partial() {
        let toml = r#"
[daemon]
log_level = "debug"

[relay]
listen_addr = "0.0.0.0:9000"
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.daemon.log_level, "debug");
        assert_eq!(config.relay.listen_addr, "0.0.0.0:9000");
        assert_eq!(config.relay.feed_capacity, 1024);
        assert_eq!(config.store, StoreConfig::default());
    }

    #[test]
    fn test_from_toml_full() {
        let toml = r#"
[daemon]
data_dir = "/var/lib/testhub"
log_level = "warn"
log_dir = "/var/log/testhub"

[store]
session_ttl_secs = 3600
sweep_interval_secs = 5

[relay]
listen_addr = "127.0.0.1:8100"
feed_capacity = 64
viewer_channel_capacity = 8

[archive]
dir = "/srv/archive"

[ipc]
socket_path = "/run/testhub.sock"
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.daemon.data_dir, PathBuf::from("/var/lib/testhub"));
        assert_eq!(config.daemon.log_dir, Some(PathBuf::from("/var/log/testhub")));
        assert_eq!(config.session_ttl(), Duration::from_secs(3600));
        assert_eq!(config.sweep_interval(), Duration::from_secs(5));
        assert_eq!(config.relay.feed_capacity, 64);
        assert_eq!(config.relay.viewer_channel_capacity, 8);
        assert_eq!(config.archive_dir(), PathBuf::from("/srv/archive"));
        assert_eq!(config.socket_path(), PathBuf::from("/run/testhub.sock"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml_invalid_syntax() {
        let result = Config::from_toml("[daemon\nlog_level = ");
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("Invalid TOML"));
    }

    #[test]
    fn test_from_toml_wrong_type() {
        let result = Config::from_toml("[store]\nsession_ttl_secs = \"long\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let config = Config::from_toml("[daemon]\nfuture_option = true\n").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_archive_dir_defaults_under_data_dir() {
        let mut config = Config::default();
        config.daemon.data_dir = PathBuf::from("/data");
        assert_eq!(config.archive_dir(), PathBuf::from("/data/archive"));
    }

    #[test]
    fn test_roundtrip_custom() {
        let mut config = Config::default();
        config.daemon.log_level = "trace".to_string();
        config.store.session_ttl_secs = 120;
        config.archive.dir = Some(PathBuf::from("/tmp/a"));

        let toml = config.to_toml().unwrap();
        assert_eq!(Config::from_toml(&toml).unwrap(), config);
    }

    #[test]
    fn test_load_missing_file() {
        let temp_dir = TempDir::new().unwrap();
        let config = Config::load(temp_dir.path().join("missing.toml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_save_creates_directories_and_loads() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.relay.listen_addr = "127.0.0.1:0".to_string();
        config.save(&path).unwrap();

        assert!(path.exists());
        assert_eq!(Config::load(&path).unwrap(), config);
    }

    #[test]
    fn test_load_invalid_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        fs::write(&path, "not = [valid").unwrap();

        let err = Config::load(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to parse config file"));
    }

    #[test]
    fn test_default_config_path() {
        let path = default_config_path();
        assert!(path.ends_with("testhub/config.toml"));
    }

    #[test]
    #[serial]
    fn test_env_override_log_level() {
        with_env("TESTHUB_LOG_LEVEL", Some("debug"), || {
            let mut config = Config::default();
            config.apply_env_overrides();
            assert_eq!(config.daemon.log_level, "debug");
        });
    }

    #[test]
    #[serial]
    fn test_env_override_listen_addr() {
        with_env("TESTHUB_LISTEN_ADDR", Some("0.0.0.0:8800"), || {
            let mut config = Config::default();
            config.apply_env_overrides();
            assert_eq!(config.relay.listen_addr, "0.0.0.0:8800");
        });
    }

    #[test]
    #[serial]
    fn test_env_override_empty_does_not_override() {
        with_env("TESTHUB_LOG_LEVEL", Some(""), || {
            with_env("TESTHUB_LISTEN_ADDR", None, || {
                let mut config = Config::default();
                config.apply_env_overrides();
                assert_eq!(config, Config::default());
            });
        });
    }

    #[test]
    fn test_validate_default_config() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_validate_zero_ttl_and_interval() {
        let mut config = Config::default();
        config.store.session_ttl_secs = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidSessionTtl));

        let mut config = Config::default();
        config.store.sweep_interval_secs = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidSweepInterval));
    }

    #[test]
    fn test_validate_zero_capacities() {
        let mut config = Config::default();
        config.relay.feed_capacity = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidCapacity("feed_capacity"))
        );

        let mut config = Config::default();
        config.relay.viewer_channel_capacity = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidCapacity("viewer_channel_capacity"))
        );
    }

    #[test]
    fn test_validate_listen_addr() {
        let mut config = Config::default();
        config.relay.listen_addr = "localhost".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidListenAddr("localhost".to_string()))
        );

        config.relay.listen_addr = "[::1]:8000".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = Config::default();
        for level in ["trace", "debug", "info", "warn", "error", "DEBUG"] {
            config.daemon.log_level = level.to_string();
            assert!(config.validate().is_ok(), "{} should be valid", level);
        }

        config.daemon.log_level = "verbose".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidLogLevel("verbose".to_string()))
        );
    }
}
