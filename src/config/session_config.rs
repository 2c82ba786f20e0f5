use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::bluetooth::{
    DEFAULT_CHANNEL_CAPACITY, DEFAULT_ERROR_COOLDOWN_SECS, DEFAULT_REFRESH_INTERVAL,
};

/// Behaviour of the bluetooth session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Start scanning as soon as the radio reports it is powered on.
    pub eager_scan: bool,

    /// Services an eager scan is restricted to. `None` scans for everything.
    pub service_filter: Option<Vec<Uuid>>,

    /// Name and RSSI of a known peripheral are refreshed on every Nth repeat advertisement.
    pub refresh_interval: u64,

    /// Seconds a failed connection stays in the error state before it is cleared.
    pub error_cooldown_secs: u64,

    /// Depth of the request and driver-event channels.
    pub channel_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            eager_scan: false,
            service_filter: None,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            error_cooldown_secs: DEFAULT_ERROR_COOLDOWN_SECS,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}
