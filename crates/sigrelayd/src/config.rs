//! Relay configuration.
//!
//! Values are layered, lowest precedence first: built-in defaults, a TOML
//! file, environment variables, then command-line flags (applied by the
//! binary).
//!
//! ```toml
//! listen = "0.0.0.0:8000"
//! path = "/"
//! outbound_queue = 64
//! max_message_size = 1048576
//! max_channels = 10000
//! reservation_ttl_secs = 600
//! cleanup_interval_secs = 30
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use sigrelay_core::ChannelIdGenerator;

use crate::registry::{RegistrySettings, MAX_CHANNELS, RESERVATION_TTL};

/// Environment variable naming a TOML config file
pub const ENV_CONFIG: &str = "SIGRELAY_CONFIG";

/// Environment variable overriding the listen address
pub const ENV_LISTEN: &str = "SIGRELAY_LISTEN";

/// Environment variable overriding the WebSocket path
pub const ENV_PATH: &str = "SIGRELAY_PATH";

/// Default listen port, on all interfaces
pub const DEFAULT_PORT: u16 = 8000;

/// Maximum message size (1 MB)
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1_048_576;

/// Per-connection outbound queue depth
pub const DEFAULT_OUTBOUND_QUEUE: usize = 64;

/// Relay daemon configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RelayConfig {
    /// Address the listener binds to
    pub listen: SocketAddr,

    /// The only HTTP path accepted for the WebSocket upgrade
    pub path: String,

    /// Messages buffered per connection before sends are dropped
    pub outbound_queue: usize,

    /// Largest accepted inbound message, in bytes
    pub max_message_size: usize,

    /// Maximum number of live channels
    pub max_channels: usize,

    /// Lifetime of a reserved channel nobody joins
    pub reservation_ttl_secs: u64,

    /// Period of the reservation sweep
    pub cleanup_interval_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            path: "/".to_string(),
            outbound_queue: DEFAULT_OUTBOUND_QUEUE,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_channels: MAX_CHANNELS,
            reservation_ttl_secs: RESERVATION_TTL.as_secs(),
            cleanup_interval_secs: 30,
        }
    }
}

impl RelayConfig {
    /// Parses a TOML document. Missing keys take their defaults.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Reads and parses a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;
        Self::from_toml_str(&contents)
    }

    /// Applies `SIGRELAY_LISTEN` and `SIGRELAY_PATH` from the process environment.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Applies overrides from an arbitrary variable lookup.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(listen) = lookup(ENV_LISTEN) {
            self.listen = listen.parse().map_err(|_| ConfigError::InvalidValue {
                field: ENV_LISTEN.to_string(),
                reason: format!("'{listen}' is not a socket address"),
            })?;
        }
        if let Some(path) = lookup(ENV_PATH) {
            self.path = path;
        }
        Ok(())
    }

    /// Rejects values the relay cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.path.starts_with('/') {
            return Err(ConfigError::invalid("path", "must start with '/'"));
        }
        if self.outbound_queue == 0 {
            return Err(ConfigError::invalid("outbound_queue", "must be positive"));
        }
        if self.max_message_size == 0 {
            return Err(ConfigError::invalid("max_message_size", "must be positive"));
        }
        if self.max_channels == 0 {
            return Err(ConfigError::invalid("max_channels", "must be positive"));
        }
        if self.cleanup_interval_secs == 0 {
            return Err(ConfigError::invalid("cleanup_interval_secs", "must be positive"));
        }
        Ok(())
    }

    pub fn reservation_ttl(&self) -> Duration {
        Duration::from_secs(self.reservation_ttl_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    /// Settings for `spawn_registry`.
    pub fn registry_settings(&self) -> RegistrySettings {
        RegistrySettings {
            max_channels: self.max_channels,
            reservation_ttl: self.reservation_ttl(),
            cleanup_interval: self.cleanup_interval(),
            generator: ChannelIdGenerator::default(),
        }
    }
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {error}")]
    Io { path: PathBuf, error: String },

    #[error("Invalid config file: {0}")]
    Parse(String),

    #[error("Invalid {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

impl ConfigError {
    fn invalid(field: &str, reason: &str) -> Self {
        Self::InvalidValue {
            field: field.to_string(),
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = RelayConfig::default();
        assert_eq!(config.listen.to_string(), "0.0.0.0:8000");
        assert_eq!(config.path, "/");
        assert_eq!(config.max_channels, MAX_CHANNELS);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = RelayConfig::from_toml_str(
            r#"
            listen = "127.0.0.1:9100"
            max_channels = 5
            "#,
        )
        .unwrap();

        assert_eq!(config.listen, SocketAddr::from(([127, 0, 0, 1], 9100)));
        assert_eq!(config.max_channels, 5);
        assert_eq!(config.outbound_queue, DEFAULT_OUTBOUND_QUEUE);
    }

    #[test]
    fn test_unknown_key_rejected() {
        let result = RelayConfig::from_toml_str("listen_port = 8000");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "path = \"/signal\"").unwrap();
        writeln!(file, "reservation_ttl_secs = 5").unwrap();

        let config = RelayConfig::load(file.path()).unwrap();
        assert_eq!(config.path, "/signal");
        assert_eq!(config.reservation_ttl(), Duration::from_secs(5));
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = RelayConfig::load(&dir.path().join("absent.toml"));
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> =
            [(ENV_LISTEN, "127.0.0.1:7000"), (ENV_PATH, "/ws")].into_iter().collect();

        let mut config = RelayConfig::default();
        config
            .apply_env_from(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.listen, SocketAddr::from(([127, 0, 0, 1], 7000)));
        assert_eq!(config.path, "/ws");
    }

    #[test]
    fn test_env_bad_listen() {
        let mut config = RelayConfig::default();
        let result = config.apply_env_from(|key| {
            (key == ENV_LISTEN).then(|| "not-an-address".to_string())
        });
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_validation() {
        let config = RelayConfig {
            path: "ws".to_string(),
            ..RelayConfig::default()
        };
        assert!(config.validate().is_err());

        let config = RelayConfig {
            outbound_queue: 0,
            ..RelayConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("outbound_queue"));
    }

    #[test]
    fn test_registry_settings() {
        let config = RelayConfig {
            max_channels: 3,
            reservation_ttl_secs: 1,
            cleanup_interval_secs: 2,
            ..RelayConfig::default()
        };
        let settings = config.registry_settings();
        assert_eq!(settings.max_channels, 3);
        assert_eq!(settings.reservation_ttl, Duration::from_secs(1));
        assert_eq!(settings.cleanup_interval, Duration::from_secs(2));
    }
}
