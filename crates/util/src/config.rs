//! Stepline configuration file.
//!
//! A small JSON document read from the standard configuration directory
//! (`~/.config/stepline/config.json` on most platforms). Every field is
//! optional; command-line flags take precedence over anything set here.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use dirs_next::config_dir;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::expand_tilde;

/// Environment variable allowing callers to override the config file path.
pub const CONFIG_PATH_ENV: &str = "STEPLINE_CONFIG_PATH";

/// Default filename for the JSON payload.
pub const CONFIG_FILE_NAME: &str = "config.json";

/// Error surfaced when reading or writing the configuration fails.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// I/O failure (for example, permissions or missing directory).
    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Serialization failure while saving.
    #[error("config serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Persisted configuration values.
#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StepLineConfig {
    /// Validate in strict mode unless the command line says otherwise.
    pub strict: bool,
    /// Output format used when `--format` is not given (`yaml` or `json`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_format: Option<String>,
    /// Directory scanned by `stepline list` when no directory is given.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipelines_dir: Option<PathBuf>,
}

impl StepLineConfig {
    /// Loads the configuration from the default location.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&default_config_path())
    }

    /// Loads the configuration from `path`.
    ///
    /// A missing file yields defaults. A file that cannot be parsed is
    /// reported with a warning and also yields defaults.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        match fs::read_to_string(path) {
            Ok(data) => match serde_json::from_str(&data) {
                Ok(config) => {
                    debug!(path = %path.display(), "loaded configuration");
                    Ok(config)
                }
                Err(error) => {
                    warn!(
                        path = %path.display(),
                        error = %error,
                        "Failed to parse config file; using defaults"
                    );
                    Ok(Self::default())
                }
            },
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(error) => Err(ConfigError::Io(error)),
        }
    }

    /// Writes the configuration to `path`, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_string_pretty(self)?;
        fs::write(path, data)?;
        Ok(())
    }

    /// Directory for `stepline list`, tilde-expanded.
    pub fn pipelines_dir(&self) -> Option<PathBuf> {
        self.pipelines_dir
            .as_ref()
            .and_then(|dir| dir.to_str())
            .map(expand_tilde)
    }
}

/// Resolves the configuration path, honouring [`CONFIG_PATH_ENV`].
pub fn default_config_path() -> PathBuf {
    if let Ok(path) = env::var(CONFIG_PATH_ENV) {
        let trimmed = path.trim();
        if !trimmed.is_empty() {
            return expand_tilde(trimmed);
        }
    }

    config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("stepline")
        .join(CONFIG_FILE_NAME)
}
