//! Radio driver primitives
//! This module contains every request the session can issue to a radio driver,
//! the driver contract, and the executor that dispatches them.

use std::sync::Arc;

use log::{debug, error};
use uuid::Uuid;

use crate::core::bluetooth::error::DriverError;
use crate::core::bluetooth::types::{CharacteristicHandle, PeripheralAddress, ServiceHandle};

/// Driver primitives. All are fire-and-forget: completion arrives later as a driver event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverCommand {
    /// Start scanning; an empty service list scans for everything
    StartScan {
        services: Vec<Uuid>,
        /// Report every advertisement packet instead of collapsing repeats
        allow_duplicates: bool,
    },
    StopScan,
    Connect(PeripheralAddress),
    Disconnect(PeripheralAddress),
    DiscoverServices(PeripheralAddress),
    DiscoverCharacteristics {
        address: PeripheralAddress,
        service: ServiceHandle,
    },
    ReadValue {
        address: PeripheralAddress,
        characteristic: CharacteristicHandle,
    },
}

/// The contract a radio driver fulfils for the session
#[async_trait::async_trait]
pub trait RadioDriver: Send + Sync {
    /// Issue a primitive. Implementations return once the request is issued,
    /// not when it completes.
    async fn send_command(&self, command: DriverCommand) -> Result<(), DriverError>;
}

#[async_trait::async_trait]
impl<T: RadioDriver + ?Sized> RadioDriver for Arc<T> {
    async fn send_command(&self, command: DriverCommand) -> Result<(), DriverError> {
        (**self).send_command(command).await
    }
}

/// Dispatches batches of primitives to a driver in order
pub struct CommandExecutor<T: RadioDriver> {
    driver: T,
}

impl<T: RadioDriver> CommandExecutor<T> {
    pub fn new(driver: T) -> Self {
        Self { driver }
    }

    /// Issue every command. A rejected command never aborts the batch; the
    /// rejections are returned so the session can settle its state.
    pub async fn execute(&self, commands: Vec<DriverCommand>) -> Vec<(DriverCommand, DriverError)> {
        let mut rejected = Vec::new();
        for command in commands {
            debug!("Issuing driver command: {:?}", command);
            if let Err(e) = self.driver.send_command(command.clone()).await {
                error!("Driver rejected {:?}: {}", command, e);
                rejected.push((command, e));
            }
        }
        rejected
    }
}
