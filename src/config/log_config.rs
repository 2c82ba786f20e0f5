use serde::{Deserialize, Serialize};

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default level filter, e.g. "info" or "ble_pulse_lib=debug". `RUST_LOG` takes precedence.
    pub level: String,
    /// Prefix records with a local timestamp
    pub timestamps: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: "info".to_string(),
            timestamps: true,
        }
    }
}
