//! Configuration file support
//!
//! Settings are read from a TOML file. Every section and field is optional
//! and falls back to its default, so an empty file is a valid configuration.
//!
//! ```toml
//! [device]
//! path = "/dev/input/js1"
//!
//! [controller]
//! read_timeout_ms = 20
//! channel_capacity = 1
//!
//! [logging]
//! level = "debug"
//! ```

use color_eyre::eyre::{eyre, Result, WrapErr};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info, Level};

use crate::controller::ControllerSettings;

const APP_DIR: &str = "jsgamepad";
const CONFIG_FILE: &str = "config.toml";

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub device: DeviceConfig,
    pub controller: ControllerSettings,
    pub logging: LoggingConfig,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct DeviceConfig {
    /// Joystick device node
    pub path: PathBuf,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/dev/input/js0"),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl LoggingConfig {
    pub fn max_level(&self) -> Result<Level> {
        Level::from_str(&self.level).map_err(|e| eyre!("Invalid log level '{}': {}", self.level, e))
    }
}

impl Config {
    /// `<config dir>/jsgamepad/config.toml`, if the platform has a config dir
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(APP_DIR).join(CONFIG_FILE))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| eyre!("Failed to parse config: {}", e))
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| eyre!("Failed to serialize config: {}", e))
    }

    /// Load configuration.
    ///
    /// An explicit `path` must exist. Without one the default location is
    /// tried and a missing file yields the defaults.
    pub async fn load(path: Option<&Path>) -> Result<Self> {
        let (path, required) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => match Self::default_path() {
                Some(path) => (path, false),
                None => {
                    debug!("No config directory available, using defaults");
                    return Ok(Self::default());
                }
            },
        };

        if !required && !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            debug!("No config file at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(&path)
            .await
            .wrap_err_with(|| format!("Failed to read config file {}", path.display()))?;
        let config = Self::from_toml_str(&content)?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }
}
