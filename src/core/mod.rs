//! Core functionality for BLE Pulse
//! This module contains the central session state machine and its radio driver.

pub mod bluetooth;

// Re-export commonly used types
pub use bluetooth::{BluetoothManager, SessionHandle};
