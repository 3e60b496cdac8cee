//! Thumbnail pipeline configuration.
//!
//! Configuration can be loaded from a TOML file, environment variables, or
//! created programmatically. Every field has a default, so partial files and
//! partial environments are fine.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::thumbnail::{DEFAULT_CAPACITY, DEFAULT_MAX_CONCURRENT_DECODES};

/// Environment variable overriding [`ThumbnailConfig::capacity`]
pub const ENV_CAPACITY: &str = "LORA_MANAGER_THUMB_CAPACITY";
/// Environment variable overriding [`ThumbnailConfig::max_concurrent_decodes`]
pub const ENV_DECODES: &str = "LORA_MANAGER_THUMB_DECODES";
/// Environment variable overriding [`ThumbnailConfig::default_target_width`]
pub const ENV_WIDTH: &str = "LORA_MANAGER_THUMB_WIDTH";
/// Environment variable overriding [`ThumbnailConfig::shutdown_timeout_ms`]
pub const ENV_SHUTDOWN_MS: &str = "LORA_MANAGER_THUMB_SHUTDOWN_MS";

/// Configuration for the thumbnail cache and request orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThumbnailConfig {
    /// Maximum number of cached thumbnails
    pub capacity: usize,
    /// Maximum number of simultaneous decodes
    pub max_concurrent_decodes: usize,
    /// Width used when a caller does not ask for a specific one
    pub default_target_width: u32,
    /// How long shutdown waits for background threads, in milliseconds
    pub shutdown_timeout_ms: u64,
}

impl Default for ThumbnailConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            max_concurrent_decodes: DEFAULT_MAX_CONCURRENT_DECODES,
            default_target_width: 256,
            shutdown_timeout_ms: 2000,
        }
    }
}

impl ThumbnailConfig {
    /// Sets the cache capacity.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Sets the decode concurrency limit.
    pub fn with_max_concurrent_decodes(mut self, decodes: usize) -> Self {
        self.max_concurrent_decodes = decodes;
        self
    }

    /// Sets the default thumbnail width.
    pub fn with_default_target_width(mut self, width: u32) -> Self {
        self.default_target_width = width;
        self
    }

    /// Sets the shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Shutdown timeout as a duration.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Returns the default configuration file location.
    ///
    /// - macOS: ~/Library/Application Support/lora-manager/thumbnails.toml
    /// - Linux: ~/.config/lora-manager/thumbnails.toml
    /// - Windows: %APPDATA%\lora-manager\thumbnails.toml
    pub fn default_config_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("lora-manager").join("thumbnails.toml")
        } else {
            PathBuf::from("thumbnails.toml")
        }
    }

    /// Loads configuration from environment variables on top of the defaults.
    ///
    /// # Errors
    /// Returns an error if any environment variable contains an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().apply_env()
    }

    /// Overrides fields from environment variables that are set.
    ///
    /// # Errors
    /// Returns an error if any environment variable contains an invalid value.
    pub fn apply_env(mut self) -> Result<Self, ConfigError> {
        if let Some(capacity) = env_value(ENV_CAPACITY)? {
            self.capacity = capacity;
        }
        if let Some(decodes) = env_value(ENV_DECODES)? {
            self.max_concurrent_decodes = decodes;
        }
        if let Some(width) = env_value(ENV_WIDTH)? {
            self.default_target_width = width;
        }
        if let Some(timeout) = env_value(ENV_SHUTDOWN_MS)? {
            self.shutdown_timeout_ms = timeout;
        }
        Ok(self)
    }

    /// Loads configuration from a TOML file.
    ///
    /// Expected file format:
    /// ```toml
    /// capacity = 200
    /// max_concurrent_decodes = 4
    /// default_target_width = 256
    /// shutdown_timeout_ms = 2000
    /// ```
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path.as_ref())?;
        Self::from_toml(&contents)
    }

    /// Loads the file if it exists, otherwise returns the defaults.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        match fs::read_to_string(path.as_ref()) {
            Ok(contents) => Self::from_toml(&contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Parses configuration from a TOML string.
    ///
    /// # Errors
    /// Returns an error if the string is not valid TOML for this config.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(toml_str)?)
    }

    /// Converts configuration to TOML format.
    ///
    /// # Errors
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Saves configuration to a TOML file, creating parent directories.
    ///
    /// # Errors
    /// Returns an error if the file cannot be written.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, self.to_toml()?)?;
        Ok(())
    }
}

fn env_value<T: std::str::FromStr>(name: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue(name.to_string())),
        Err(_) => Ok(None),
    }
}

/// Errors that can occur during configuration operations.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Invalid value for a configuration parameter
    #[error("invalid value for configuration key: {0}")]
    InvalidValue(String),
    /// I/O error reading or writing a configuration file
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Malformed configuration file
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    /// Configuration could not be serialized
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),
}
