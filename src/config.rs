//! Adapter configuration
//!
//! Loaded from TOML; every field has a default so an empty file (or no file
//! at all) yields a working configuration.
//!
//! ```toml
//! read_timeout_ms = 50
//! nonblocking = false
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Default bounded-read interval used inside the read loop (milliseconds)
pub const DEFAULT_READ_TIMEOUT_MS: i32 = 50;

/// Settings shared by both adapter variants
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterConfig {
    /// Timeout of each transport read issued by the loop. A paused or
    /// closing adapter is noticed by a blocked read within this interval.
    pub read_timeout_ms: i32,
    /// Put the handle into non-blocking mode right after opening
    pub nonblocking: bool,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            read_timeout_ms: DEFAULT_READ_TIMEOUT_MS,
            nonblocking: false,
        }
    }
}

/// Errors loading a config file
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("read_timeout_ms must be positive, got {0}")]
    InvalidTimeout(i32),
}

impl AdapterConfig {
    /// Parse a configuration from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        if config.read_timeout_ms <= 0 {
            return Err(ConfigError::InvalidTimeout(config.read_timeout_ms));
        }
        Ok(config)
    }

    /// Load configuration from a file, falling back to defaults if it does not exist
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::from_toml_str(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No config at {:?}, using defaults", path);
                Ok(Self::default())
            }
            Err(source) => Err(ConfigError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }
}
