pub mod log_config;
pub mod session_config;

use std::path::Path;

use anyhow::Result;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::config::log_config::LogConfig;
use crate::config::session_config::SessionConfig;
use crate::utils::ensure_directory_exists;

pub const CONFIG_FILE_NAME: &str = "ble_pulse.json";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub session: SessionConfig,
    pub logging: LogConfig,
}

impl AppConfig {
    /// Loads the config from a configuration file, falling back to defaults if it is missing.
    pub async fn load(path: &Path) -> Result<Self> {
        match Self::read(path).await? {
            Some(config) => {
                info!("Config loaded from {:?}", path);
                Ok(config)
            }
            None => {
                warn!("Config file not found at {:?}, using default.", path);
                Ok(Self::default())
            }
        }
    }

    /// Reads the config without logging; `None` when the file does not exist.
    /// Used before the logger is installed.
    pub async fn read(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let config_json = fs::read_to_string(path).await?;
        Ok(Some(serde_json::from_str(&config_json)?))
    }

    /// Saves the config, creating the parent directory if needed.
    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            ensure_directory_exists(dir).await?;
        }

        let config_json = match serde_json::to_string_pretty(self) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize config to JSON: {}", e);
                return Err(e.into());
            }
        };

        fs::write(path, config_json).await?;

        info!("Config saved to {:?}.", path);
        Ok(())
    }
}
