//! Constants used throughout the Bluetooth session
//! This module contains sentinel values, advertisement payload keys,
//! timing values and other defaults shared by the session components.

/// Display name used when neither the advertisement nor the driver report one
pub const NO_NAME: &str = "No Name";

/// Label given to characteristics that carry no human-readable description
pub const UNNAMED_CHARACTERISTIC: &str = "NoName";

/// Value shown for characteristics that have not been read yet
pub const UNREAD_VALUE: &str = "NoData";

/// Advertisement payload keys understood by the deduplicator and drivers
pub const ADV_LOCAL_NAME: &str = "local_name";
pub const ADV_SERVICE_UUIDS: &str = "service_uuids";
pub const ADV_MANUFACTURER_DATA: &str = "manufacturer_data";
pub const ADV_TX_POWER_LEVEL: &str = "tx_power_level";
/// Prefix for per-service data entries, followed by the service UUID
pub const ADV_SERVICE_DATA_PREFIX: &str = "service_data.";

/// Name and RSSI are refreshed on every Nth repeat observation of a peripheral
pub const DEFAULT_REFRESH_INTERVAL: u64 = 50;

/// Delay before an `Error` connection state falls back to `Disconnected`
pub const DEFAULT_ERROR_COOLDOWN_SECS: u64 = 5;

/// Depth of the command and driver-event channels
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// Depth of the change-notification broadcast channel
pub const NOTIFICATION_CAPACITY: usize = 256;
