//! Error types for the Bluetooth session and its radio drivers.

use thiserror::Error;

use crate::core::bluetooth::types::ConnectionState;

/// Rejections returned to callers of the session handle
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("bluetooth radio is not powered on")]
    RadioPoweredOff,

    #[error("another connection is active (state: {0:?})")]
    ConnectionBusy(ConnectionState),

    #[error("bluetooth session has shut down")]
    SessionClosed,
}

/// Failures raised by a radio driver while issuing a primitive
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("no bluetooth adapter found")]
    NoAdapter,

    #[error("unknown peripheral: {0}")]
    UnknownPeripheral(String),

    #[error("unknown GATT handle: {0}")]
    UnknownHandle(u64),

    #[error("driver event channel closed")]
    ChannelClosed,

    #[error(transparent)]
    Backend(#[from] bluest::Error),
}
