//! Application configuration loaded from TOML.

use crate::recording::types::{ExportConfig, SessionConfig};
use crate::sensors::types::ConnectionConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// BLE discovery and link settings
    pub connection: ConnectionConfig,
    /// Session recording settings
    pub session: SessionConfig,
    /// FIT export settings
    pub export: ExportConfig,
    /// SQLite database location; defaults to the data directory
    pub database_path: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            session: SessionConfig::default(),
            export: ExportConfig::default(),
            database_path: None,
        }
    }
}

impl AppConfig {
    /// Reject values the bridge cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session.smoothing_window == 0 {
            return Err(ConfigError::Invalid(
                "session.smoothing_window must be at least 1".into(),
            ));
        }
        if self.session.max_duration_secs == 0 {
            return Err(ConfigError::Invalid(
                "session.max_duration_secs must be positive".into(),
            ));
        }
        if self.connection.connection_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "connection.connection_timeout_secs must be positive".into(),
            ));
        }
        if self.connection.scan_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "connection.scan_timeout_secs must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Database path, falling back to the data directory.
    pub fn database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| get_data_dir().join("workouts.db"))
    }
}

/// Get the application data directory.
pub fn get_data_dir() -> PathBuf {
    directories::ProjectDirs::from("com", "ftmsbridge", "FtmsBridge")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Get the default configuration file path.
pub fn get_config_path() -> PathBuf {
    directories::ProjectDirs::from("com", "ftmsbridge", "FtmsBridge")
        .map(|dirs| dirs.config_dir().join("config.toml"))
        .unwrap_or_else(|| PathBuf::from("config.toml"))
}

/// Load configuration from `path`, or from the default location.
///
/// A missing file yields defaults.
pub fn load_config(path: Option<&Path>) -> Result<AppConfig, ConfigError> {
    let path = path.map(Path::to_path_buf).unwrap_or_else(get_config_path);

    if !path.exists() {
        tracing::debug!("No config at {}, using defaults", path.display());
        return Ok(AppConfig::default());
    }

    let content =
        std::fs::read_to_string(&path).map_err(|e| ConfigError::IoError(e.to_string()))?;

    let config: AppConfig =
        toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
    config.validate()?;

    tracing::info!("Loaded config from {}", path.display());
    Ok(config)
}

/// Save configuration to `path`.
pub fn save_config(config: &AppConfig, path: &Path) -> Result<(), ConfigError> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| ConfigError::IoError(e.to_string()))?;
    }

    let content =
        toml::to_string_pretty(config).map_err(|e| ConfigError::SerializeError(e.to_string()))?;

    std::fs::write(path, content).map_err(|e| ConfigError::IoError(e.to_string()))?;

    Ok(())
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
