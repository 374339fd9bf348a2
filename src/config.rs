use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to find config directory")]
    NoConfigDir,

    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub bus: BusConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Where to connect and how connections behave.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct BusConfig {
    /// `session`, `system`, or a D-Bus address like `unix:path=/run/bus`
    #[serde(default = "default_address")]
    pub address: String,

    /// How long a proxy waits for a reply before giving up
    #[serde(default = "default_method_call_timeout_ms")]
    pub method_call_timeout_ms: u64,

    /// Incoming messages queued per connection before reads pause
    #[serde(default = "default_max_queued")]
    pub max_queued: usize,

    /// Returned by `org.freedesktop.DBus.Peer.GetMachineId`
    #[serde(default = "default_machine_id")]
    pub machine_id: String,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            method_call_timeout_ms: default_method_call_timeout_ms(),
            max_queued: default_max_queued(),
            machine_id: default_machine_id(),
        }
    }
}

impl BusConfig {
    pub fn method_call_timeout(&self) -> Duration {
        Duration::from_millis(self.method_call_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.address.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "address must not be empty".into(),
            ));
        }

        if self.method_call_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "method_call_timeout_ms must be positive".into(),
            ));
        }

        if self.max_queued == 0 {
            return Err(ConfigError::ValidationError(
                "max_queued must be at least 1".into(),
            ));
        }

        let id = &self.machine_id;
        if id.len() != 32 || !id.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(ConfigError::ValidationError(
                "machine_id must be 32 hex digits".into(),
            ));
        }

        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

// sd-bus default
fn default_method_call_timeout_ms() -> u64 {
    25_000
}

fn default_address() -> String {
    "session".to_string()
}

fn default_max_queued() -> usize {
    64
}

fn default_machine_id() -> String {
    "0".repeat(32)
}

impl Config {
    /// Get the config directory path
    pub fn config_dir() -> Result<PathBuf, ConfigError> {
        ProjectDirs::from("org", "busrpc", "busrpc")
            .map(|dirs| dirs.config_dir().to_path_buf())
            .ok_or(ConfigError::NoConfigDir)
    }

    /// Get the config file path
    pub fn config_path() -> Result<PathBuf, ConfigError> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load config from the default location, falling back to defaults if
    /// no file exists.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::config_path()?;
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Config::default())
        }
    }

    /// Load and validate config from a specific file.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.bus.validate()?;

        const LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
        if !LEVELS.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "unknown log level '{}'",
                self.logging.level
            )));
        }

        Ok(())
    }

    /// Save config to a specific file
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        // Create config directory if needed
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;

        info!("Config saved to: {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.bus.method_call_timeout(), Duration::from_secs(25));
        assert_eq!(config.bus.address, "session");
        assert_eq!(config.bus.max_queued, 64);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [bus]
            address = "unix:path=/run/busrpc/bus"
            method_call_timeout_ms = 500
            "#,
        )
        .unwrap();
        assert_eq!(config.bus.method_call_timeout_ms, 500);
        assert_eq!(config.bus.address, "unix:path=/run/busrpc/bus");
        assert_eq!(config.bus.max_queued, 64);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_validation_errors() {
        let mut config = Config::default();
        config.bus.method_call_timeout_ms = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.bus.max_queued = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.bus.address = " ".into();
        assert!(config.bus.validate().is_err());

        let mut config = Config::default();
        config.bus.machine_id = "xyz".into();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.logging.level = "loud".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.bus.max_queued = 8;
        config.logging.level = "debug".into();
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[bus]\nmax_queued = 0\n").unwrap();
        assert!(matches!(
            Config::load_from(&path),
            Err(ConfigError::ValidationError(_))
        ));

        fs::write(&path, "not toml at all [").unwrap();
        assert!(matches!(
            Config::load_from(&path),
            Err(ConfigError::ParseError(_))
        ));
    }
}
