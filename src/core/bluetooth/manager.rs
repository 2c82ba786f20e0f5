//! Bluetooth manager for the BLE session
//! This module provides the session façade: it owns the entity registry,
//! routes driver events to the deduplicator or the connection sequencer,
//! and turns application requests into driver primitives.

use log::{debug, info, warn};
use uuid::Uuid;

use crate::config::session_config::SessionConfig;
use crate::core::bluetooth::commands::DriverCommand;
use crate::core::bluetooth::connection::ConnectionSequencer;
use crate::core::bluetooth::error::{DriverError, SessionError};
use crate::core::bluetooth::events::{CentralEvent, DriverEvent, PeripheralEvent};
use crate::core::bluetooth::registry::EntityRegistry;
use crate::core::bluetooth::scanner::{DiscoveryDeduplicator, DiscoveryOutcome};
use crate::core::bluetooth::types::{
    ConnectionState, PeripheralId, RadioState, ScanState, SessionNotification, SessionSnapshot,
};

/// Side effects produced by one step of the session state machine
#[derive(Debug, Default)]
pub struct Effects {
    /// Primitives to issue to the driver, in order
    pub commands: Vec<DriverCommand>,
    /// Observable changes, deduplicated
    pub notifications: Vec<SessionNotification>,
    /// Epoch of an `Error` state that should be cleared after the cooldown
    pub cooldown: Option<u64>,
}

impl Effects {
    pub fn issue(&mut self, command: DriverCommand) {
        self.commands.push(command);
    }

    pub fn notify(&mut self, notification: SessionNotification) {
        if !self.notifications.contains(&notification) {
            self.notifications.push(notification);
        }
    }

    pub fn schedule_cooldown(&mut self, epoch: u64) {
        self.cooldown = Some(epoch);
    }

    /// Appends the effects of a later step
    pub fn merge(&mut self, other: Effects) {
        self.commands.extend(other.commands);
        for notification in other.notifications {
            self.notify(notification);
        }
        if other.cooldown.is_some() {
            self.cooldown = other.cooldown;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty() && self.notifications.is_empty() && self.cooldown.is_none()
    }
}

/// Manages the BLE session state
pub struct BluetoothManager {
    registry: EntityRegistry,
    scanner: DiscoveryDeduplicator,
    connection: ConnectionSequencer,
    radio: RadioState,
    scan_state: ScanState,
    discovery_pending: bool,
    eager_scan: bool,
    default_filter: Option<Vec<Uuid>>,
}

impl BluetoothManager {
    pub fn new(config: &SessionConfig) -> Self {
        let mut scanner = DiscoveryDeduplicator::new(config.refresh_interval);
        scanner.set_service_filter(config.service_filter.clone());
        Self {
            registry: EntityRegistry::new(),
            scanner,
            connection: ConnectionSequencer::new(),
            radio: RadioState::Unknown,
            scan_state: ScanState::Idle,
            discovery_pending: false,
            eager_scan: config.eager_scan,
            default_filter: config.service_filter.clone(),
        }
    }

    pub fn registry(&self) -> &EntityRegistry {
        &self.registry
    }

    pub fn is_powered_on(&self) -> bool {
        self.radio.is_powered_on()
    }

    pub fn scan_state(&self) -> ScanState {
        self.scan_state
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            powered_on: self.is_powered_on(),
            scan_state: self.scan_state,
            connection_state: self.connection.state(),
            discovery_pending: self.discovery_pending,
            target: self.connection.target_id(),
            last_error: self.connection.last_error().map(str::to_string),
            peripherals: self.registry.peripherals().to_vec(),
            services: self.registry.services().to_vec(),
            characteristics: self.registry.characteristics().to_vec(),
        }
    }

    fn set_scan_state(&mut self, state: ScanState, fx: &mut Effects) {
        if self.scan_state != state {
            self.scan_state = state;
            fx.notify(SessionNotification::ScanStateChanged(state));
        }
    }

    fn set_discovery_pending(&mut self, pending: bool, fx: &mut Effects) {
        if self.discovery_pending != pending {
            self.discovery_pending = pending;
            fx.notify(SessionNotification::PeripheralListChanged);
        }
    }

    /// Starts scanning, optionally restricted to peripherals advertising `filter`
    pub fn start_scan(&mut self, filter: Option<Vec<Uuid>>) -> Result<Effects, SessionError> {
        if !self.is_powered_on() {
            warn!("Cannot start scan: radio is {:?}", self.radio);
            return Err(SessionError::RadioPoweredOff);
        }
        let mut fx = Effects::default();
        info!("Starting bluetooth scan (filter: {:?})", filter);
        self.scanner.set_service_filter(filter.clone());
        self.set_scan_state(ScanState::Searching, &mut fx);
        fx.issue(DriverCommand::StartScan {
            services: filter.unwrap_or_default(),
            allow_duplicates: true,
        });
        Ok(fx)
    }

    /// Stops scanning and tears down any current target
    pub fn stop_scan(&mut self) -> Effects {
        let mut fx = Effects::default();
        info!("Stopping bluetooth scan");
        self.set_scan_state(ScanState::Idle, &mut fx);
        self.set_discovery_pending(false, &mut fx);
        self.connection.disconnect(&mut fx);
        fx.issue(DriverCommand::StopScan);
        fx
    }

    pub fn connect(&mut self, peripheral: PeripheralId) -> Result<Effects, SessionError> {
        let mut fx = Effects::default();
        self.connection.connect(&self.registry, peripheral, &mut fx)?;
        if self.connection.state() == ConnectionState::Connecting {
            self.set_discovery_pending(false, &mut fx);
        }
        Ok(fx)
    }

    pub fn disconnect(&mut self) -> Effects {
        let mut fx = Effects::default();
        self.connection.disconnect(&mut fx);
        fx
    }

    /// Forgets every discovered peripheral and any connection
    pub fn reset(&mut self) -> Effects {
        let mut fx = Effects::default();
        info!("Resetting bluetooth session");
        if let Some(address) = self.connection.target_address() {
            fx.issue(DriverCommand::Disconnect(address.clone()));
        }
        self.clear_all(&mut fx);
        fx
    }

    fn clear_all(&mut self, fx: &mut Effects) {
        self.connection.reset(&mut self.registry, fx);
        if !self.registry.peripherals().is_empty() {
            fx.notify(SessionNotification::PeripheralListChanged);
        }
        self.registry.clear();
        self.set_discovery_pending(false, fx);
    }

    pub fn cooldown_elapsed(&mut self, epoch: u64) -> Effects {
        let mut fx = Effects::default();
        self.connection.on_cooldown_elapsed(epoch, &mut fx);
        fx
    }

    /// Settles the session after the driver refused to issue `command`.
    /// Each refusal is treated like the failure event the primitive would have produced.
    pub fn command_failed(&mut self, command: DriverCommand, error: &DriverError) -> Effects {
        let reason = error.to_string();
        let event: DriverEvent = match command {
            DriverCommand::StartScan { .. } => {
                warn!("Scan could not be started: {}", reason);
                let mut fx = Effects::default();
                self.set_scan_state(ScanState::Idle, &mut fx);
                return fx;
            }
            DriverCommand::StopScan => {
                warn!("Scan could not be stopped: {}", reason);
                return Effects::default();
            }
            DriverCommand::Connect(address) => CentralEvent::ConnectFailed {
                address,
                reason: Some(reason),
            }
            .into(),
            DriverCommand::Disconnect(address) => CentralEvent::Disconnected {
                address,
                reason: Some(reason),
            }
            .into(),
            DriverCommand::DiscoverServices(address) => PeripheralEvent::ServicesDiscovered {
                address,
                result: Err(reason),
            }
            .into(),
            DriverCommand::DiscoverCharacteristics { address, service } => {
                PeripheralEvent::CharacteristicsDiscovered {
                    address,
                    service,
                    result: Err(reason),
                }
                .into()
            }
            DriverCommand::ReadValue {
                address,
                characteristic,
            } => PeripheralEvent::ValueRead {
                address,
                characteristic,
                result: Err(reason),
            }
            .into(),
        };
        self.handle_event(event)
    }

    pub fn handle_event(&mut self, event: DriverEvent) -> Effects {
        let mut fx = Effects::default();
        match event {
            DriverEvent::Central(event) => self.handle_central(event, &mut fx),
            DriverEvent::Peripheral(event) => {
                self.connection
                    .on_peripheral_event(event, &mut self.registry, &mut fx)
            }
        }
        fx
    }

    fn handle_central(&mut self, event: CentralEvent, fx: &mut Effects) {
        match event {
            CentralEvent::StateChanged(state) => self.on_radio_state(state, fx),
            CentralEvent::Advertisement(advertisement) => {
                if self.scan_state != ScanState::Searching {
                    debug!("Ignoring advertisement from {} while idle", advertisement.address);
                    return;
                }
                let outcome = self.scanner.on_advertisement(&mut self.registry, advertisement);
                if let DiscoveryOutcome::Inserted(_) = outcome {
                    self.discovery_pending = true;
                }
                if outcome.changed_list() {
                    fx.notify(SessionNotification::PeripheralListChanged);
                }
            }
            CentralEvent::Connected { address } => {
                if self.connection.on_connected(&address, fx)
                    && self.scan_state == ScanState::Searching
                {
                    self.set_scan_state(ScanState::Idle, fx);
                    fx.issue(DriverCommand::StopScan);
                }
            }
            CentralEvent::ConnectFailed { address, reason } => {
                self.connection.on_connect_failed(&address, reason, fx)
            }
            CentralEvent::Disconnected { address, reason } => {
                if self
                    .connection
                    .on_disconnected(&address, reason, &mut self.registry, fx)
                {
                    self.set_scan_state(ScanState::Idle, fx);
                }
            }
        }
    }

    fn on_radio_state(&mut self, state: RadioState, fx: &mut Effects) {
        let was_on = self.is_powered_on();
        self.radio = state;
        let is_on = self.is_powered_on();
        if was_on != is_on {
            fx.notify(SessionNotification::PowerChanged(is_on));
        }

        if is_on {
            info!("Bluetooth is powered on.");
            if !was_on && self.eager_scan {
                let filter = self.default_filter.clone();
                // Powered on, so this cannot be rejected
                if let Ok(scan) = self.start_scan(filter) {
                    fx.merge(scan);
                }
            }
            return;
        }

        info!("Bluetooth radio is {:?}, resetting session", state);
        self.set_scan_state(ScanState::Idle, fx);
        self.clear_all(fx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bluetooth::constants::ADV_SERVICE_UUIDS;
    use crate::core::bluetooth::events::{
        Advertisement, DiscoveredCharacteristic, DiscoveredService,
    };
    use crate::core::bluetooth::types::{
        AdvertisementPayload, AdvertisementValue, CharacteristicHandle, PeripheralAddress,
        ServiceHandle,
    };

    fn powered_manager(config: SessionConfig) -> BluetoothManager {
        let mut manager = BluetoothManager::new(&config);
        manager.handle_event(CentralEvent::StateChanged(RadioState::PoweredOn).into());
        manager
    }

    fn advert(address: &str) -> DriverEvent {
        CentralEvent::Advertisement(Advertisement {
            address: address.into(),
            name: Some("Thermo".into()),
            rssi: -55,
            payload: AdvertisementPayload::new(),
        })
        .into()
    }

    fn connect_fully(manager: &mut BluetoothManager, address: &str) -> PeripheralId {
        manager.handle_event(advert(address));
        let id = manager
            .registry()
            .peripheral_by_address(&address.into())
            .unwrap()
            .id;
        manager.connect(id).unwrap();
        let address = PeripheralAddress::from(address);
        manager.handle_event(CentralEvent::Connected { address: address.clone() }.into());
        manager.handle_event(
            PeripheralEvent::ServicesDiscovered {
                address: address.clone(),
                result: Ok(vec![DiscoveredService {
                    uuid: Uuid::nil(),
                    handle: ServiceHandle(1),
                }]),
            }
            .into(),
        );
        manager.handle_event(
            PeripheralEvent::CharacteristicsDiscovered {
                address,
                service: ServiceHandle(1),
                result: Ok(vec![DiscoveredCharacteristic {
                    uuid: Uuid::nil(),
                    handle: CharacteristicHandle(2),
                    description: Some("Temperature".into()),
                }]),
            }
            .into(),
        );
        id
    }

    #[test]
    fn scan_requires_power() {
        let mut manager = BluetoothManager::new(&SessionConfig::default());
        assert_eq!(manager.start_scan(None).err(), Some(SessionError::RadioPoweredOff));

        let mut manager = powered_manager(SessionConfig::default());
        let fx = manager.start_scan(None).unwrap();
        assert_eq!(
            fx.commands,
            vec![DriverCommand::StartScan {
                services: vec![],
                allow_duplicates: true
            }]
        );
        assert_eq!(manager.scan_state(), ScanState::Searching);
    }

    #[test]
    fn advertisements_outside_scan_are_ignored() {
        let mut manager = powered_manager(SessionConfig::default());
        let fx = manager.handle_event(advert("AA"));
        assert!(fx.is_empty());
        assert!(manager.registry().peripherals().is_empty());

        manager.start_scan(None).unwrap();
        let fx = manager.handle_event(advert("AA"));
        assert_eq!(fx.notifications, vec![SessionNotification::PeripheralListChanged]);
        assert!(manager.snapshot().discovery_pending);

        // The first repeat refreshes, later ones only bump the counter
        let fx = manager.handle_event(advert("AA"));
        assert_eq!(fx.notifications, vec![SessionNotification::PeripheralListChanged]);
        let fx = manager.handle_event(advert("AA"));
        assert!(fx.notifications.is_empty());
    }

    #[test]
    fn eager_scan_starts_on_power_on() {
        let filter = vec![Uuid::from_u128(0x180d)];
        let manager_config = SessionConfig {
            eager_scan: true,
            service_filter: Some(filter.clone()),
            ..SessionConfig::default()
        };
        let mut manager = BluetoothManager::new(&manager_config);
        let fx = manager.handle_event(CentralEvent::StateChanged(RadioState::PoweredOn).into());
        assert_eq!(
            fx.commands,
            vec![DriverCommand::StartScan {
                services: filter.clone(),
                allow_duplicates: true
            }]
        );
        assert_eq!(manager.scan_state(), ScanState::Searching);

        let mut payload = AdvertisementPayload::new();
        payload.insert(ADV_SERVICE_UUIDS.into(), AdvertisementValue::Uuids(filter));
        manager.handle_event(
            CentralEvent::Advertisement(Advertisement {
                address: "HR".into(),
                name: None,
                rssi: -70,
                payload,
            })
            .into(),
        );
        manager.handle_event(advert("OTHER"));
        assert_eq!(manager.registry().peripherals().len(), 1);
    }

    #[test]
    fn connect_success_stops_the_scan() {
        let mut manager = powered_manager(SessionConfig::default());
        manager.start_scan(None).unwrap();
        manager.handle_event(advert("AA"));
        let id = manager.registry().peripherals()[0].id;

        let fx = manager.connect(id).unwrap();
        assert_eq!(fx.commands, vec![DriverCommand::Connect("AA".into())]);
        assert!(!manager.snapshot().discovery_pending);

        let fx = manager.handle_event(CentralEvent::Connected { address: "AA".into() }.into());
        assert_eq!(
            fx.commands,
            vec![
                DriverCommand::DiscoverServices("AA".into()),
                DriverCommand::StopScan
            ]
        );
        assert_eq!(manager.scan_state(), ScanState::Idle);
        assert_eq!(manager.connection_state(), ConnectionState::ServicesDiscovering);
    }

    #[test]
    fn stop_scan_disconnects_the_target_but_keeps_history() {
        let mut manager = powered_manager(SessionConfig::default());
        manager.start_scan(None).unwrap();
        manager.handle_event(advert("BB"));
        connect_fully(&mut manager, "AA");
        assert_eq!(manager.connection_state(), ConnectionState::Connected);

        let fx = manager.stop_scan();
        assert_eq!(
            fx.commands,
            vec![
                DriverCommand::Disconnect("AA".into()),
                DriverCommand::StopScan
            ]
        );
        manager.handle_event(
            CentralEvent::Disconnected {
                address: "AA".into(),
                reason: None,
            }
            .into(),
        );
        let snapshot = manager.snapshot();
        assert_eq!(snapshot.connection_state, ConnectionState::Disconnected);
        assert!(snapshot.services.is_empty());
        assert_eq!(snapshot.peripherals.len(), 2);
    }

    #[test]
    fn power_off_resets_everything() {
        let mut manager = powered_manager(SessionConfig::default());
        manager.start_scan(None).unwrap();
        connect_fully(&mut manager, "AA");

        let fx = manager.handle_event(CentralEvent::StateChanged(RadioState::PoweredOff).into());
        assert!(fx.notifications.contains(&SessionNotification::PowerChanged(false)));
        let snapshot = manager.snapshot();
        assert!(!snapshot.powered_on);
        assert_eq!(snapshot.scan_state, ScanState::Idle);
        assert_eq!(snapshot.connection_state, ConnectionState::Disconnected);
        assert_eq!(snapshot.target, None);
        assert!(snapshot.peripherals.is_empty());
        assert!(snapshot.services.is_empty());
        assert!(snapshot.characteristics.is_empty());
    }

    #[test]
    fn reset_clears_peripherals_and_drops_the_link() {
        let mut manager = powered_manager(SessionConfig::default());
        manager.start_scan(None).unwrap();
        connect_fully(&mut manager, "AA");

        let fx = manager.reset();
        assert_eq!(fx.commands, vec![DriverCommand::Disconnect("AA".into())]);
        assert!(manager.registry().peripherals().is_empty());
        assert_eq!(manager.connection_state(), ConnectionState::Disconnected);

        // The late confirmation belongs to a forgotten target
        let fx = manager.handle_event(
            CentralEvent::Disconnected {
                address: "AA".into(),
                reason: None,
            }
            .into(),
        );
        assert!(fx.is_empty());
    }

    /// Drives a fresh connection to "AA" until it reaches `stage`
    fn connect_until(manager: &mut BluetoothManager, stage: ConnectionState) {
        manager.handle_event(advert("AA"));
        let id = manager.registry().peripherals()[0].id;
        manager.connect(id).unwrap();
        let address = PeripheralAddress::from("AA");
        if stage == ConnectionState::Connecting {
            return;
        }
        manager.handle_event(CentralEvent::Connected { address: address.clone() }.into());
        if stage == ConnectionState::ServicesDiscovering {
            return;
        }
        manager.handle_event(
            PeripheralEvent::ServicesDiscovered {
                address,
                result: Ok(vec![
                    DiscoveredService {
                        uuid: Uuid::nil(),
                        handle: ServiceHandle(1),
                    },
                    DiscoveredService {
                        uuid: Uuid::from_u128(0x180f),
                        handle: ServiceHandle(2),
                    },
                ]),
            }
            .into(),
        );
        assert_eq!(manager.connection_state(), stage);
    }

    #[test]
    fn disconnect_from_every_linked_stage_clears_gatt() {
        for stage in [
            ConnectionState::Connecting,
            ConnectionState::ServicesDiscovering,
            ConnectionState::CharacteristicsDiscovering,
        ] {
            let mut manager = powered_manager(SessionConfig::default());
            manager.start_scan(None).unwrap();
            connect_until(&mut manager, stage);
            assert_eq!(manager.connection_state(), stage);

            let fx = manager.disconnect();
            assert_eq!(fx.commands, vec![DriverCommand::Disconnect("AA".into())]);

            manager.handle_event(
                CentralEvent::Disconnected {
                    address: "AA".into(),
                    reason: None,
                }
                .into(),
            );
            let snapshot = manager.snapshot();
            assert_eq!(snapshot.connection_state, ConnectionState::Disconnected, "{stage:?}");
            assert_eq!(snapshot.target, None);
            assert!(snapshot.services.is_empty());
            assert!(snapshot.characteristics.is_empty());
            assert_eq!(snapshot.peripherals.len(), 1);

            // Work still in flight for the old link is discarded
            let fx = manager.handle_event(
                PeripheralEvent::CharacteristicsDiscovered {
                    address: "AA".into(),
                    service: ServiceHandle(1),
                    result: Ok(vec![DiscoveredCharacteristic {
                        uuid: Uuid::nil(),
                        handle: CharacteristicHandle(3),
                        description: None,
                    }]),
                }
                .into(),
            );
            assert!(fx.is_empty());
            assert!(manager.registry().characteristics().is_empty());
        }
    }

    #[test]
    fn stop_scan_while_connecting_abandons_the_attempt() {
        let mut manager = powered_manager(SessionConfig::default());
        manager.start_scan(None).unwrap();
        connect_until(&mut manager, ConnectionState::Connecting);

        let fx = manager.stop_scan();
        assert_eq!(
            fx.commands,
            vec![
                DriverCommand::Disconnect("AA".into()),
                DriverCommand::StopScan
            ]
        );
        assert_eq!(manager.scan_state(), ScanState::Idle);

        manager.handle_event(
            CentralEvent::Disconnected {
                address: "AA".into(),
                reason: None,
            }
            .into(),
        );
        assert_eq!(manager.connection_state(), ConnectionState::Disconnected);

        // A late link-up for the abandoned attempt is stale
        let fx = manager.handle_event(CentralEvent::Connected { address: "AA".into() }.into());
        assert!(fx.commands.is_empty());
        assert_eq!(manager.connection_state(), ConnectionState::Disconnected);
    }

    #[test]
    fn refused_primitives_settle_the_state() {
        let refusal = DriverError::ChannelClosed;

        let mut manager = powered_manager(SessionConfig::default());
        manager.start_scan(None).unwrap();
        connect_until(&mut manager, ConnectionState::Connecting);
        let fx = manager.command_failed(DriverCommand::Connect("AA".into()), &refusal);
        assert_eq!(manager.connection_state(), ConnectionState::Error);
        assert_eq!(fx.commands, vec![DriverCommand::Disconnect("AA".into())]);
        assert!(fx.cooldown.is_some());

        let mut manager = powered_manager(SessionConfig::default());
        manager.start_scan(None).unwrap();
        connect_until(&mut manager, ConnectionState::ServicesDiscovering);
        manager.command_failed(DriverCommand::DiscoverServices("AA".into()), &refusal);
        assert_eq!(manager.connection_state(), ConnectionState::Connected);

        manager.disconnect();
        manager.command_failed(DriverCommand::Disconnect("AA".into()), &refusal);
        assert_eq!(manager.connection_state(), ConnectionState::Disconnected);

        manager.start_scan(None).unwrap();
        manager.command_failed(
            DriverCommand::StartScan {
                services: vec![],
                allow_duplicates: true,
            },
            &refusal,
        );
        assert_eq!(manager.scan_state(), ScanState::Idle);
    }
}
