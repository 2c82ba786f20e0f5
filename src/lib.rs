//! BLE Pulse library
//! A Bluetooth Low Energy central session: scanning, deduplicated discovery,
//! and a sequenced connect / service / characteristic / read pipeline.

// Module declarations
pub mod config;
pub mod core;
pub mod logging;
pub mod state;
pub mod utils;
