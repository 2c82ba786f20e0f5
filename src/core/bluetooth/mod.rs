//! Bluetooth central session
//! This module tracks discovered peripherals, sequences the connection
//! and GATT discovery of one target, and exposes the session to callers.

mod bluest_driver;
mod commands;
mod connection;
mod constants;
mod error;
mod events;
mod manager;
mod registry;
mod scanner;
mod session;
mod types;

// Re-export types that should be publicly accessible
pub use bluest_driver::BluestDriver;
pub use commands::{CommandExecutor, DriverCommand, RadioDriver};
pub use connection::ConnectionSequencer;
pub use constants::*; // Re-export all constants
pub use error::{DriverError, SessionError};
pub use events::{
    Advertisement, CentralEvent, DiscoveredCharacteristic, DiscoveredService, DriverEvent,
    EventSink, PeripheralEvent, driver_channel,
};
pub use manager::{BluetoothManager, Effects};
pub use registry::EntityRegistry;
pub use scanner::{DiscoveryDeduplicator, DiscoveryOutcome};
pub use session::SessionHandle;
pub use types::*;
