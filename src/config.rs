//! Configuration System
//!
//! Handles loading configuration from files and environment variables.
//! Supports TOML config files and environment variable overrides.

use crate::series::Resolution;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Which bucket store backs a collection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Sqlite,
    Memory,
}

impl std::str::FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sqlite" => Ok(StoreBackend::Sqlite),
            "memory" => Ok(StoreBackend::Memory),
            other => Err(format!("Unknown store backend: {}", other)),
        }
    }
}

/// Bucket store configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// SQLite database file
    #[serde(default = "default_store_path")]
    pub path: PathBuf,

    /// Validated on load; unknown identifiers are a parse error
    #[serde(default)]
    pub resolution: Resolution,

    /// Buckets older than this become eligible for purging
    #[serde(default)]
    pub expire_after_secs: Option<u64>,

    #[serde(default = "default_purge_interval")]
    pub purge_interval_secs: u64,
}

fn default_store_path() -> PathBuf {
    dirs::data_local_dir()
        .map(|p| p.join("tsbucket").join("buckets.db"))
        .unwrap_or_else(|| PathBuf::from("./tsbucket_data/buckets.db"))
}

fn default_purge_interval() -> u64 {
    60
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            path: default_store_path(),
            resolution: Resolution::default(),
            expire_after_secs: None,
            purge_interval_secs: default_purge_interval(),
        }
    }
}

impl StoreConfig {
    pub fn expire_after(&self) -> Option<Duration> {
        self.expire_after_secs.map(Duration::from_secs)
    }

    pub fn purge_interval(&self) -> Duration {
        Duration::from_secs(self.purge_interval_secs.max(1))
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        let config: Config = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env_overrides();
        config
    }

    /// Load configuration with environment variable overrides
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from default locations or environment
    pub fn load_default() -> Self {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("tsbucket").join("config.toml")),
            Some(PathBuf::from("/etc/tsbucket/config.toml")),
            Some(PathBuf::from("./tsbucket.toml")),
        ];

        for path_opt in config_paths.iter().flatten() {
            if path_opt.exists() {
                match Self::load_with_env(path_opt) {
                    Ok(config) => {
                        tracing::info!("Loaded config from {:?}", path_opt);
                        return config;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load config from {:?}: {}", path_opt, e);
                    }
                }
            }
        }

        tracing::info!("Using default config with environment overrides");
        Self::from_env()
    }

    /// Apply environment variable overrides to an existing config
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply `TSBUCKET_*` overrides read through `lookup`
    ///
    /// Values that do not parse are logged and ignored.
    fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        // Store overrides
        if let Some(path) = lookup("TSBUCKET_STORE_PATH") {
            self.store.path = PathBuf::from(path);
        }
        if let Some(backend) = lookup("TSBUCKET_STORE_BACKEND") {
            match backend.parse() {
                Ok(b) => self.store.backend = b,
                Err(e) => tracing::warn!("Ignoring TSBUCKET_STORE_BACKEND: {}", e),
            }
        }
        if let Some(resolution) = lookup("TSBUCKET_RESOLUTION") {
            match resolution.parse() {
                Ok(r) => self.store.resolution = r,
                Err(e) => tracing::warn!("Ignoring TSBUCKET_RESOLUTION: {}", e),
            }
        }

        // Logging overrides
        if let Some(level) = lookup("TSBUCKET_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = lookup("TSBUCKET_LOG_FORMAT") {
            self.logging.format = format;
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {error}")]
    Io { path: PathBuf, error: String },

    #[error("Failed to parse config file {path:?}: {error}")]
    Parse { path: PathBuf, error: String },
}

/// Generate a default config file content
pub fn generate_default_config() -> String {
    r#"# tsbucket Configuration
#
# Environment variables override these settings:
# - TSBUCKET_STORE_PATH
# - TSBUCKET_STORE_BACKEND
# - TSBUCKET_RESOLUTION
# - TSBUCKET_LOG_LEVEL
# - TSBUCKET_LOG_FORMAT

[store]
# Bucket store backend: sqlite or memory
backend = "sqlite"

# SQLite database file
path = "~/.local/share/tsbucket/buckets.db"

# Bucketing policy: second-in-minute, minute-in-hour, hour-in-day,
# day-in-month, second-in-hour or minute-in-day
resolution = "second-in-minute"

# Drop buckets older than this many seconds
# expire_after_secs = 604800

# How often the expiry task runs (seconds)
purge_interval_secs = 60

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log format: pretty (for development) or json (for production)
format = "pretty"
"#
    .to_string()
}
