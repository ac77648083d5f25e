//! Server configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via PLAINCLI_CONFIG)
//! 3. Environment variables

use crate::handler::SessionOptions;
use crate::server::ServerConfig;
use plaincli_protocol::reader::DEFAULT_READ_BUFFER_SIZE;
use plaincli_protocol::DEFAULT_PORT;
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Network configuration.
    pub network: NetworkConfig,
    /// Session configuration.
    pub session: SessionConfig,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("PLAINCLI_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    /// Applies environment variable overrides to the configuration.
    pub fn apply_env_overrides(&mut self) {
        self.network.apply_env_overrides();
        self.session.apply_env_overrides();
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.network.max_connections == 0 {
            return Err(ConfigError::ValidationError(
                "network.max_connections must be at least 1".to_string(),
            ));
        }
        if self.session.read_buffer_size == 0 {
            return Err(ConfigError::ValidationError(
                "session.read_buffer_size must be at least 1".to_string(),
            ));
        }
        if self.session.stdin_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "session.stdin_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Builds the runtime server configuration.
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind_addr: self.network.bind_addr,
            max_connections: self.network.max_connections,
            session: self.session.options(),
        }
    }
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address to bind to.
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_PORT)),
            max_connections: 1000,
        }
    }
}

impl NetworkConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("PLAINCLI_BIND") {
            if let Ok(parsed) = addr.parse() {
                self.bind_addr = parsed;
            }
        }

        if let Ok(max) = std::env::var("PLAINCLI_MAX_CONNECTIONS") {
            if let Ok(n) = max.parse() {
                self.max_connections = n;
            }
        }
    }
}

/// Session configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Seconds a client has to send START (0 = no limit).
    pub start_timeout_secs: u64,
    /// Read buffer size for incoming frames.
    pub read_buffer_size: usize,
    /// STDIN chunks buffered ahead of a slow command.
    pub stdin_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            start_timeout_secs: 15,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            stdin_capacity: 16,
        }
    }
}

impl SessionConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(timeout) = std::env::var("PLAINCLI_START_TIMEOUT") {
            if let Ok(secs) = timeout.parse() {
                self.start_timeout_secs = secs;
            }
        }

        if let Ok(size) = std::env::var("PLAINCLI_READ_BUFFER_SIZE") {
            if let Ok(n) = size.parse() {
                self.read_buffer_size = n;
            }
        }
    }

    /// Returns the start timeout, `None` when disabled.
    pub fn start_timeout(&self) -> Option<Duration> {
        (self.start_timeout_secs > 0).then(|| Duration::from_secs(self.start_timeout_secs))
    }

    pub fn options(&self) -> SessionOptions {
        SessionOptions {
            start_timeout: self.start_timeout(),
            read_buffer_size: self.read_buffer_size,
            stdin_capacity: self.stdin_capacity,
        }
    }
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Serializes a SocketAddr as a plain string in YAML.
mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S>(addr: &SocketAddr, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SocketAddr, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.network.bind_addr.port(), DEFAULT_PORT);
        assert_eq!(config.network.max_connections, 1000);
        assert_eq!(
            config.session.start_timeout(),
            Some(Duration::from_secs(15))
        );
        config.validate().unwrap();
    }

    #[test]
    fn test_zero_start_timeout_disables_it() {
        let session = SessionConfig {
            start_timeout_secs: 0,
            ..SessionConfig::default()
        };
        assert_eq!(session.start_timeout(), None);
        assert_eq!(session.options().start_timeout, None);
    }

    #[test]
    fn test_yaml_roundtrip() {
        let config = Config::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.network.bind_addr, config.network.bind_addr);
        assert_eq!(
            parsed.session.start_timeout_secs,
            config.session.start_timeout_secs
        );
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plaincli.yaml");
        std::fs::write(
            &path,
            "network:\n  bind_addr: \"0.0.0.0:9000\"\nsession:\n  start_timeout_secs: 3\n",
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.network.bind_addr.port(), 9000);
        assert_eq!(config.network.max_connections, 1000);
        assert_eq!(config.session.start_timeout_secs, 3);
        assert_eq!(config.session.read_buffer_size, DEFAULT_READ_BUFFER_SIZE);

        let server = config.server_config();
        assert_eq!(server.session.start_timeout, Some(Duration::from_secs(3)));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("saved.yaml");
        let mut config = Config::default();
        config.network.max_connections = 7;
        config.save(&path).unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.network.max_connections, 7);
    }

    #[test]
    fn test_missing_file_and_bad_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let missing = Config::from_file(dir.path().join("nope.yaml")).unwrap_err();
        assert!(matches!(missing, ConfigError::IoError(..)));

        let bad = dir.path().join("bad.yaml");
        std::fs::write(&bad, "network: [unclosed").unwrap();
        let err = Config::from_file(&bad).unwrap_err();
        assert!(err.to_string().starts_with("failed to parse config file"));
    }

    #[test]
    fn test_validation() {
        let mut config = Config::default();
        config.session.stdin_capacity = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));
    }
}
