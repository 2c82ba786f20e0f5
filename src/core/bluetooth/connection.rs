//! Connection sequencing for the current target peripheral
//! Drives one peripheral through connect, service discovery,
//! characteristic discovery and value reads, and discards events
//! that belong to a peripheral which is no longer the target.

use log::{debug, error, info, warn};

use crate::core::bluetooth::commands::DriverCommand;
use crate::core::bluetooth::error::SessionError;
use crate::core::bluetooth::events::{DiscoveredCharacteristic, DiscoveredService, PeripheralEvent};
use crate::core::bluetooth::manager::Effects;
use crate::core::bluetooth::registry::EntityRegistry;
use crate::core::bluetooth::types::{
    CharacteristicHandle, ConnectionState, PeripheralAddress, PeripheralId, ServiceHandle,
    SessionNotification,
};

/// The peripheral currently occupying the connect pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
struct Target {
    id: PeripheralId,
    address: PeripheralAddress,
}

#[derive(Debug, Default)]
pub struct ConnectionSequencer {
    state: ConnectionState,
    target: Option<Target>,
    /// Characteristic discoveries issued but not yet answered
    pending_discoveries: usize,
    disconnect_requested: bool,
    /// Bumped on every entry into `Error`; a cooldown only clears its own epoch
    error_epoch: u64,
    last_error: Option<String>,
}

impl ConnectionSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn target_id(&self) -> Option<PeripheralId> {
        self.target.as_ref().map(|t| t.id)
    }

    pub fn target_address(&self) -> Option<&PeripheralAddress> {
        self.target.as_ref().map(|t| &t.address)
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    fn is_target(&self, address: &PeripheralAddress) -> bool {
        self.target_address() == Some(address)
    }

    fn set_state(&mut self, state: ConnectionState, fx: &mut Effects) {
        if self.state != state {
            debug!("Connection state {:?} -> {:?}", self.state, state);
            self.state = state;
            fx.notify(SessionNotification::StatusChanged(state));
        }
    }

    /// Begins connecting to `id`. Unknown peripherals are ignored.
    pub fn connect(
        &mut self,
        registry: &EntityRegistry,
        id: PeripheralId,
        fx: &mut Effects,
    ) -> Result<(), SessionError> {
        if self.state != ConnectionState::Disconnected {
            warn!("Rejecting connect to {}: state is {:?}", id, self.state);
            return Err(SessionError::ConnectionBusy(self.state));
        }
        let Some(peripheral) = registry.peripheral(id) else {
            warn!("Connect requested for unknown peripheral {}", id);
            return Ok(());
        };

        info!("Connecting to {} ({})", peripheral.name, peripheral.address);
        self.target = Some(Target {
            id,
            address: peripheral.address.clone(),
        });
        self.pending_discoveries = 0;
        self.disconnect_requested = false;
        self.last_error = None;
        fx.issue(DriverCommand::Connect(peripheral.address.clone()));
        self.set_state(ConnectionState::Connecting, fx);
        Ok(())
    }

    /// Requests teardown of the current link. `Error` clears immediately.
    pub fn disconnect(&mut self, fx: &mut Effects) {
        match self.state {
            ConnectionState::Disconnected => debug!("Disconnect requested while disconnected"),
            ConnectionState::Error => self.set_state(ConnectionState::Disconnected, fx),
            _ => {
                if let Some(target) = &self.target {
                    info!("Disconnecting from {}", target.address);
                    self.disconnect_requested = true;
                    fx.issue(DriverCommand::Disconnect(target.address.clone()));
                }
            }
        }
    }

    /// Returns true if the link to the target came up
    pub fn on_connected(&mut self, address: &PeripheralAddress, fx: &mut Effects) -> bool {
        if !self.is_target(address) || self.state != ConnectionState::Connecting {
            debug!("Ignoring connect event for {} in state {:?}", address, self.state);
            return false;
        }
        info!("{} is connected, discovering services...", address);
        self.last_error = None;
        fx.issue(DriverCommand::DiscoverServices(address.clone()));
        self.set_state(ConnectionState::ServicesDiscovering, fx);
        true
    }

    pub fn on_connect_failed(
        &mut self,
        address: &PeripheralAddress,
        reason: Option<String>,
        fx: &mut Effects,
    ) {
        if !self.is_target(address) {
            debug!("Ignoring connect failure for stale peripheral {}", address);
            return;
        }
        let reason = reason.unwrap_or_else(|| "unknown error".to_string());
        error!("Failed to connect to {}: {}", address, reason);

        fx.issue(DriverCommand::Disconnect(address.clone()));
        self.target = None;
        self.pending_discoveries = 0;
        self.disconnect_requested = false;
        self.last_error = Some(reason);
        self.error_epoch += 1;
        fx.schedule_cooldown(self.error_epoch);
        self.set_state(ConnectionState::Error, fx);
    }

    /// Returns true if the target's link went down and GATT records were cleared
    pub fn on_disconnected(
        &mut self,
        address: &PeripheralAddress,
        reason: Option<String>,
        registry: &mut EntityRegistry,
        fx: &mut Effects,
    ) -> bool {
        if !self.is_target(address) {
            debug!("Ignoring disconnect of stale peripheral {}", address);
            return false;
        }
        match (self.disconnect_requested, reason) {
            (true, _) => info!("Disconnected from {}", address),
            (false, Some(reason)) => warn!("Lost connection to {}: {}", address, reason),
            (false, None) => info!("{} disconnected", address),
        }
        self.clear_link(registry, fx);
        true
    }

    /// Clears `Error` if no newer failure or manual action happened since `epoch`
    pub fn on_cooldown_elapsed(&mut self, epoch: u64, fx: &mut Effects) {
        if self.state == ConnectionState::Error && epoch == self.error_epoch {
            info!("Connection error cooldown elapsed");
            self.set_state(ConnectionState::Disconnected, fx);
        }
    }

    /// Drops the target and its GATT records without talking to the driver
    pub fn reset(&mut self, registry: &mut EntityRegistry, fx: &mut Effects) {
        self.last_error = None;
        self.clear_link(registry, fx);
    }

    fn clear_link(&mut self, registry: &mut EntityRegistry, fx: &mut Effects) {
        let had_gatt = !registry.services().is_empty() || !registry.characteristics().is_empty();
        registry.clear_gatt();
        if had_gatt {
            fx.notify(SessionNotification::ServicesChanged);
        }
        self.target = None;
        self.pending_discoveries = 0;
        self.disconnect_requested = false;
        self.set_state(ConnectionState::Disconnected, fx);
    }

    pub fn on_peripheral_event(
        &mut self,
        event: PeripheralEvent,
        registry: &mut EntityRegistry,
        fx: &mut Effects,
    ) {
        if !self.is_target(event.address()) {
            debug!("Discarding stale event for {}", event.address());
            return;
        }
        match event {
            PeripheralEvent::ServicesDiscovered { address, result } => {
                self.on_services(address, result, registry, fx)
            }
            PeripheralEvent::CharacteristicsDiscovered {
                address,
                service,
                result,
            } => self.on_characteristics(address, service, result, registry, fx),
            PeripheralEvent::ValueRead {
                characteristic,
                result,
                ..
            } => Self::on_value(characteristic, result, registry, fx),
        }
    }

    fn on_services(
        &mut self,
        address: PeripheralAddress,
        result: Result<Vec<DiscoveredService>, String>,
        registry: &mut EntityRegistry,
        fx: &mut Effects,
    ) {
        let Some(owner) = self.target_id() else {
            return;
        };
        let services = match result {
            Ok(services) => services,
            Err(e) => {
                warn!("Error discovering services on {}: {}", address, e);
                if self.state == ConnectionState::ServicesDiscovering {
                    self.set_state(ConnectionState::Connected, fx);
                }
                return;
            }
        };

        info!("{} reported {} services", address, services.len());
        for service in &services {
            debug!("Found service {}", service.uuid);
            registry.insert_service(service.uuid, service.handle, owner);
            fx.issue(DriverCommand::DiscoverCharacteristics {
                address: address.clone(),
                service: service.handle,
            });
        }
        self.pending_discoveries += services.len();
        if !services.is_empty() {
            fx.notify(SessionNotification::ServicesChanged);
        }

        if self.state == ConnectionState::ServicesDiscovering {
            let next = if services.is_empty() {
                ConnectionState::Connected
            } else {
                ConnectionState::CharacteristicsDiscovering
            };
            self.set_state(next, fx);
        }
    }

    fn on_characteristics(
        &mut self,
        address: PeripheralAddress,
        service: ServiceHandle,
        result: Result<Vec<DiscoveredCharacteristic>, String>,
        registry: &mut EntityRegistry,
        fx: &mut Effects,
    ) {
        self.pending_discoveries = self.pending_discoveries.saturating_sub(1);

        let resolved = match (registry.service_by_handle(service).map(|s| s.id), result) {
            (None, _) => {
                warn!("Characteristics reported for unknown service {:?}", service);
                false
            }
            (Some(_), Err(e)) => {
                warn!("Error discovering characteristics for service {:?}: {}", service, e);
                false
            }
            (Some(service_id), Ok(characteristics)) => {
                let mut added = false;
                for characteristic in characteristics {
                    let (_, created) = registry.insert_characteristic(
                        characteristic.uuid,
                        characteristic.description,
                        service_id,
                        characteristic.handle,
                    );
                    if created {
                        debug!("Found characteristic {}, reading value", characteristic.uuid);
                        added = true;
                        fx.issue(DriverCommand::ReadValue {
                            address: address.clone(),
                            characteristic: characteristic.handle,
                        });
                    }
                }
                if added {
                    fx.notify(SessionNotification::ServicesChanged);
                }
                true
            }
        };

        if self.state == ConnectionState::CharacteristicsDiscovering
            && (resolved || self.pending_discoveries == 0)
        {
            self.set_state(ConnectionState::Connected, fx);
        }
    }

    fn on_value(
        characteristic: CharacteristicHandle,
        result: Result<Option<Vec<u8>>, String>,
        registry: &mut EntityRegistry,
        fx: &mut Effects,
    ) {
        match result {
            Err(e) => warn!("Error reading characteristic {:?}: {}", characteristic, e),
            Ok(None) => warn!("Characteristic {:?} returned no value", characteristic),
            Ok(Some(bytes)) => match registry.update_value(characteristic, &bytes) {
                Some(id) => fx.notify(SessionNotification::CharacteristicUpdated(id)),
                None => debug!("Value for unknown characteristic {:?}", characteristic),
            },
        }
    }
}
