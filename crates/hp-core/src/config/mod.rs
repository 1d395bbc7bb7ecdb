//! Configuration management for hargproxy
//!
//! One TOML file, `<config_dir>/hargproxy/config.toml` unless given
//! explicitly. Every section is optional.

mod relay;
pub mod serde_utils;

pub use relay::{AnalyserConfig, BusConfig, NetworkConfig, RelayConfig, SessionConfig};

use crate::error::ConfigError;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};

/// Directory holding the configuration file
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("hargproxy")
}

/// `config.toml` inside [`default_config_dir`]
pub fn default_config_path() -> PathBuf {
    default_config_dir().join("config.toml")
}

/// Parse the configuration file at `path`
pub fn load_config<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| match source.kind() {
        std::io::ErrorKind::NotFound => ConfigError::NotFound(path.to_path_buf()),
        _ => ConfigError::Io {
            path: path.to_path_buf(),
            source,
        },
    })?;
    Ok(toml::from_str(&content)?)
}

/// Load `path` if it exists, defaults otherwise. Any other failure is an
/// error.
pub fn load_or_default<T: DeserializeOwned + Default>(path: &Path) -> Result<T, ConfigError> {
    match load_config(path) {
        Err(ConfigError::NotFound(_)) => {
            tracing::debug!("no config at {:?}, using defaults", path);
            Ok(T::default())
        }
        other => other,
    }
}
