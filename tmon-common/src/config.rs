//! Bootstrap configuration loading and path resolution
//!
//! Configuration is two-tier: a TOML bootstrap file (database location, logging, tool
//! parameters) and compiled defaults. Missing files or keys never stop startup; they fall
//! back to defaults with a warning.

use crate::{Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Environment variable naming the TOML configuration file
pub const CONFIG_ENV_VAR: &str = "TMON_CONFIG";

/// Configuration file name looked up in the platform config directories
pub const CONFIG_FILE_NAME: &str = "watcher.toml";

/// Settings shared by every tmon tool
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TomlConfig {
    /// Path to SQLite database file
    #[serde(default)]
    pub database_path: Option<PathBuf>,

    /// Optional override for the declarative column map
    #[serde(default)]
    pub schema_path: Option<PathBuf>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log file path (optional, logs to stderr only if not specified)
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Resolve the configuration file path
///
/// Priority order:
/// 1. Command-line argument (returned even if the file is missing, so loading reports it)
/// 2. Environment variable
/// 3. User config directory (`~/.config/tmon/watcher.toml`)
/// 4. System config (`/etc/tmon/watcher.toml`)
///
/// Returns `None` when no candidate exists, meaning compiled defaults apply.
pub fn resolve_config_path(cli_arg: Option<&Path>, env_var_name: &str) -> Option<PathBuf> {
    if let Some(path) = cli_arg {
        return Some(path.to_path_buf());
    }

    if let Ok(path) = std::env::var(env_var_name) {
        if !path.trim().is_empty() {
            return Some(PathBuf::from(path));
        }
    }

    let user_config = dirs::config_dir().map(|d| d.join("tmon").join(CONFIG_FILE_NAME));
    if let Some(path) = user_config {
        if path.exists() {
            return Some(path);
        }
    }

    let system_config = PathBuf::from("/etc/tmon").join(CONFIG_FILE_NAME);
    if system_config.exists() {
        return Some(system_config);
    }

    None
}

/// Load a TOML configuration file, falling back to `T::default()` when there is no file
pub fn load_toml_config<T>(path: Option<&Path>) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    let Some(path) = path else {
        warn!("No configuration file found, using compiled defaults");
        return Ok(T::default());
    };

    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Failed to read config file {}: {}", path.display(), e)))?;

    let config = toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Failed to parse TOML {}: {}", path.display(), e)))?;

    info!("Loaded configuration from {}", path.display());
    Ok(config)
}

/// Resolve the database path: CLI argument, then TOML, then the OS default
pub fn resolve_database_path(cli_arg: Option<&Path>, toml_config: &TomlConfig) -> PathBuf {
    if let Some(path) = cli_arg {
        return path.to_path_buf();
    }

    if let Some(path) = &toml_config.database_path {
        return path.clone();
    }

    get_default_data_folder().join("tmon.db")
}

/// Get OS-dependent default data folder
pub fn get_default_data_folder() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("tmon"))
        .unwrap_or_else(|| PathBuf::from("./tmon_data"))
}
