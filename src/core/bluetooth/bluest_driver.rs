//! Radio driver backed by the `bluest` crate
//! Every primitive is issued on its own task; results come back
//! to the session through the `EventSink`.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use bluest::{
    Adapter, AdapterEvent, AdvertisingDevice, Characteristic as GattCharacteristic,
    ConnectionEvent, Device, Service as GattService,
};
use futures_util::StreamExt;
use log::{debug, error, info, warn};
use tokio_util::sync::CancellationToken;

use crate::core::bluetooth::commands::{DriverCommand, RadioDriver};
use crate::core::bluetooth::constants::{
    ADV_LOCAL_NAME, ADV_MANUFACTURER_DATA, ADV_SERVICE_DATA_PREFIX, ADV_SERVICE_UUIDS,
    ADV_TX_POWER_LEVEL,
};
use crate::core::bluetooth::error::DriverError;
use crate::core::bluetooth::events::{
    Advertisement, CentralEvent, DiscoveredCharacteristic, DiscoveredService, EventSink,
    PeripheralEvent,
};
use crate::core::bluetooth::types::{
    AdvertisementPayload, AdvertisementValue, CharacteristicHandle, PeripheralAddress, RadioState,
    ServiceHandle,
};

/// Numeric handles for the GATT objects of each peripheral
struct GattHandles<T> {
    next: u64,
    entries: HashMap<u64, (PeripheralAddress, T)>,
}

impl<T: Clone> GattHandles<T> {
    fn new() -> Self {
        Self {
            next: 1,
            entries: HashMap::new(),
        }
    }

    fn insert(&mut self, owner: &PeripheralAddress, item: T) -> u64 {
        let handle = self.next;
        self.next += 1;
        self.entries.insert(handle, (owner.clone(), item));
        handle
    }

    fn get(&self, handle: u64) -> Option<T> {
        self.entries.get(&handle).map(|(_, item)| item.clone())
    }

    /// Drops every handle owned by `owner`, returning how many were removed
    fn forget(&mut self, owner: &PeripheralAddress) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, (address, _)| address != owner);
        before - self.entries.len()
    }

    fn clear(&mut self) {
        self.entries.clear();
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Handles shared with the per-primitive tasks
struct DriverState {
    adapter: Adapter,
    sink: EventSink,
    devices: Mutex<HashMap<PeripheralAddress, Device>>,
    services: Mutex<GattHandles<GattService>>,
    characteristics: Mutex<GattHandles<GattCharacteristic>>,
}

impl DriverState {
    fn device(&self, address: &PeripheralAddress) -> Option<Device> {
        self.devices.lock().ok()?.get(address).cloned()
    }

    fn service(&self, handle: ServiceHandle) -> Option<GattService> {
        self.services.lock().ok()?.get(handle.0)
    }

    fn characteristic(&self, handle: CharacteristicHandle) -> Option<GattCharacteristic> {
        self.characteristics.lock().ok()?.get(handle.0)
    }

    /// Releases the GATT handles of a peripheral whose link is gone
    fn forget_gatt(&self, address: &PeripheralAddress) {
        let services = self.services.lock().map(|mut s| s.forget(address)).unwrap_or(0);
        let characteristics = self
            .characteristics
            .lock()
            .map(|mut c| c.forget(address))
            .unwrap_or(0);
        if services + characteristics > 0 {
            debug!(
                "Released {} service and {} characteristic handles of {}",
                services, characteristics, address
            );
        }
    }

    /// Drops every known device and handle once the radio is unavailable
    fn forget_all(&self) {
        if let Ok(mut devices) = self.devices.lock() {
            devices.clear();
        }
        let mut released = 0;
        if let Ok(mut services) = self.services.lock() {
            released += services.len();
            services.clear();
        }
        if let Ok(mut characteristics) = self.characteristics.lock() {
            released += characteristics.len();
            characteristics.clear();
        }
        debug!("Radio unavailable, released {} GATT handles", released);
    }
}

pub struct BluestDriver {
    state: Arc<DriverState>,
    scan_token: Mutex<Option<CancellationToken>>,
    /// Connection-loss watchers per connected peripheral
    link_watchers: Mutex<HashMap<PeripheralAddress, CancellationToken>>,
    power_token: CancellationToken,
}

impl BluestDriver {
    /// Opens the default adapter and starts reporting its power state into `sink`
    pub async fn new(sink: EventSink) -> Result<Self, DriverError> {
        let adapter = Adapter::default().await.ok_or(DriverError::NoAdapter)?;
        info!("Bluetooth adapter opened.");

        let state = Arc::new(DriverState {
            adapter,
            sink,
            devices: Mutex::new(HashMap::new()),
            services: Mutex::new(GattHandles::new()),
            characteristics: Mutex::new(GattHandles::new()),
        });

        let power_token = CancellationToken::new();
        tokio::spawn(Self::watch_power(state.clone(), power_token.clone()));

        Ok(Self {
            state,
            scan_token: Mutex::new(None),
            link_watchers: Mutex::new(HashMap::new()),
            power_token,
        })
    }

    fn spawn<F>(&self, task: impl FnOnce(Arc<DriverState>) -> F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(task(self.state.clone()));
    }

    fn deliver_later(&self, event: impl Into<crate::core::bluetooth::events::DriverEvent>) {
        let event = event.into();
        self.spawn(|state| async move { state.sink.deliver(event).await });
    }

    async fn watch_power(state: Arc<DriverState>, cancel_token: CancellationToken) {
        let initial = match state.adapter.is_available().await {
            Ok(true) => RadioState::PoweredOn,
            Ok(false) => RadioState::PoweredOff,
            Err(e) => {
                warn!("Failed to query adapter availability: {}", e);
                RadioState::Unknown
            }
        };
        if !initial.is_powered_on() {
            state.forget_all();
        }
        state.sink.deliver(CentralEvent::StateChanged(initial)).await;

        let events = match state.adapter.events().await {
            Ok(events) => events,
            Err(e) => {
                error!("Failed to subscribe to adapter events: {}", e);
                return;
            }
        };
        let mut events = std::pin::pin!(events);

        loop {
            tokio::select! {
                event = events.next() => {
                    let radio = match event {
                        Some(Ok(AdapterEvent::Available)) => RadioState::PoweredOn,
                        Some(Ok(AdapterEvent::Unavailable)) => RadioState::PoweredOff,
                        Some(Err(e)) => {
                            warn!("Error in adapter event stream: {}", e);
                            continue;
                        }
                        None => break,
                    };
                    if !radio.is_powered_on() {
                        state.forget_all();
                    }
                    if state.sink.send(CentralEvent::StateChanged(radio)).await.is_err() {
                        break;
                    }
                }
                _ = cancel_token.cancelled() => break,
            }
        }
        debug!("Adapter event stream ended");
    }

    fn start_scan(&self, services: Vec<bluest::Uuid>, allow_duplicates: bool) {
        if !allow_duplicates {
            debug!("bluest always reports duplicate advertisements");
        }
        let cancel_token = CancellationToken::new();
        if let Ok(mut current) = self.scan_token.lock() {
            if let Some(previous) = current.replace(cancel_token.clone()) {
                previous.cancel();
            }
        }
        self.spawn(move |state| async move {
            if let Err(e) = Self::scan_task(&state, &services, cancel_token).await {
                error!("Bluetooth scan failed: {}", e);
            }
        });
    }

    async fn scan_task(
        state: &DriverState,
        services: &[bluest::Uuid],
        cancel_token: CancellationToken,
    ) -> Result<()> {
        info!("Starting bluetooth scan");
        let scan_stream = state.adapter.scan(services).await?;
        let mut scan_stream = std::pin::pin!(scan_stream);

        loop {
            tokio::select! {
                result = scan_stream.next() => {
                    let Some(discovered) = result else {
                        info!("Bluetooth scan stream has ended.");
                        break;
                    };
                    let Some(advertisement) = Self::to_advertisement(state, discovered) else {
                        continue;
                    };
                    if state.sink.send(CentralEvent::Advertisement(advertisement)).await.is_err() {
                        break;
                    }
                }
                _ = cancel_token.cancelled() => {
                    info!("Bluetooth scan stopped.");
                    break;
                }
            }
        }
        Ok(())
    }

    fn to_advertisement(
        state: &DriverState,
        discovered: AdvertisingDevice,
    ) -> Option<Advertisement> {
        let AdvertisingDevice {
            device,
            adv_data,
            rssi,
        } = discovered;
        let address = PeripheralAddress::new(device.id().to_string());
        let Some(rssi) = rssi else {
            debug!("Advertisement from {} without RSSI", address);
            return None;
        };

        let mut payload = AdvertisementPayload::new();
        if let Some(local_name) = adv_data.local_name {
            payload.insert(ADV_LOCAL_NAME.into(), AdvertisementValue::Text(local_name));
        }
        if !adv_data.services.is_empty() {
            payload.insert(
                ADV_SERVICE_UUIDS.into(),
                AdvertisementValue::Uuids(adv_data.services),
            );
        }
        if let Some(manufacturer) = adv_data.manufacturer_data {
            let mut bytes = manufacturer.company_id.to_le_bytes().to_vec();
            bytes.extend_from_slice(&manufacturer.data);
            payload.insert(ADV_MANUFACTURER_DATA.into(), AdvertisementValue::Bytes(bytes));
        }
        if let Some(tx_power) = adv_data.tx_power_level {
            payload.insert(
                ADV_TX_POWER_LEVEL.into(),
                AdvertisementValue::Integer(i64::from(tx_power)),
            );
        }
        for (uuid, data) in adv_data.service_data {
            payload.insert(
                format!("{}{}", ADV_SERVICE_DATA_PREFIX, uuid),
                AdvertisementValue::Bytes(data),
            );
        }

        let name = device.name().ok();
        if let Ok(mut devices) = state.devices.lock() {
            devices.insert(address.clone(), device);
        }

        Some(Advertisement {
            address,
            name,
            rssi,
            payload,
        })
    }

    fn stop_scan(&self) {
        if let Some(cancel_token) = self.scan_token.lock().ok().and_then(|mut t| t.take()) {
            cancel_token.cancel();
        }
    }

    fn connect(&self, address: PeripheralAddress) {
        let Some(device) = self.state.device(&address) else {
            self.deliver_later(CentralEvent::ConnectFailed {
                reason: Some(format!("unknown peripheral {}", address)),
                address,
            });
            return;
        };

        let watcher = CancellationToken::new();
        if let Ok(mut watchers) = self.link_watchers.lock() {
            if let Some(previous) = watchers.insert(address.clone(), watcher.clone()) {
                previous.cancel();
            }
        }

        self.spawn(move |state| async move {
            info!("Initiating connection to {}...", address);
            if let Err(e) = state.adapter.connect_device(&device).await {
                state.forget_gatt(&address);
                state
                    .sink
                    .deliver(CentralEvent::ConnectFailed {
                        address,
                        reason: Some(e.to_string()),
                    })
                    .await;
                return;
            }
            state
                .sink
                .deliver(CentralEvent::Connected {
                    address: address.clone(),
                })
                .await;
            Self::watch_link(&state, &device, address, watcher).await;
        });
    }

    /// Reports an unsolicited link loss unless cancelled by a requested disconnect
    async fn watch_link(
        state: &DriverState,
        device: &Device,
        address: PeripheralAddress,
        cancel_token: CancellationToken,
    ) {
        let events = match state.adapter.device_connection_events(device).await {
            Ok(events) => events,
            Err(e) => {
                warn!("Cannot watch connection of {}: {}", address, e);
                return;
            }
        };
        let mut events = std::pin::pin!(events);

        loop {
            tokio::select! {
                event = events.next() => match event {
                    Some(ConnectionEvent::Disconnected) | None => {
                        state.forget_gatt(&address);
                        state
                            .sink
                            .deliver(CentralEvent::Disconnected {
                                address,
                                reason: Some("connection lost".to_string()),
                            })
                            .await;
                        break;
                    }
                    Some(ConnectionEvent::Connected) => {}
                },
                _ = cancel_token.cancelled() => break,
            }
        }
    }

    fn disconnect(&self, address: PeripheralAddress) {
        if let Some(watcher) = self
            .link_watchers
            .lock()
            .ok()
            .and_then(|mut watchers| watchers.remove(&address))
        {
            watcher.cancel();
        }

        let device = self.state.device(&address);
        self.spawn(move |state| async move {
            let reason = match device {
                Some(device) => match state.adapter.disconnect_device(&device).await {
                    Ok(()) => None,
                    Err(e) => {
                        warn!("Disconnect from {} reported: {}", address, e);
                        Some(e.to_string())
                    }
                },
                None => None,
            };
            state.forget_gatt(&address);
            state
                .sink
                .deliver(CentralEvent::Disconnected { address, reason })
                .await;
        });
    }

    fn discover_services(&self, address: PeripheralAddress) {
        let Some(device) = self.state.device(&address) else {
            self.deliver_later(PeripheralEvent::ServicesDiscovered {
                result: Err(format!("unknown peripheral {}", address)),
                address,
            });
            return;
        };

        self.spawn(move |state| async move {
            // A fresh discovery replaces the handles of an earlier one
            state.forget_gatt(&address);
            let result = match device.discover_services().await {
                Ok(services) => Ok(services
                    .into_iter()
                    .filter_map(|service| {
                        let uuid = service.uuid();
                        let handle = state.services.lock().ok()?.insert(&address, service);
                        Some(DiscoveredService {
                            uuid,
                            handle: ServiceHandle(handle),
                        })
                    })
                    .collect()),
                Err(e) => Err(e.to_string()),
            };
            state
                .sink
                .deliver(PeripheralEvent::ServicesDiscovered { address, result })
                .await;
        });
    }

    fn discover_characteristics(&self, address: PeripheralAddress, handle: ServiceHandle) {
        let Some(service) = self.state.service(handle) else {
            self.deliver_later(PeripheralEvent::CharacteristicsDiscovered {
                address,
                service: handle,
                result: Err(DriverError::UnknownHandle(handle.0).to_string()),
            });
            return;
        };

        self.spawn(move |state| async move {
            let result = match service.discover_characteristics().await {
                Ok(characteristics) => Ok(characteristics
                    .into_iter()
                    .filter_map(|characteristic| {
                        let uuid = characteristic.uuid();
                        let char_handle = state
                            .characteristics
                            .lock()
                            .ok()?
                            .insert(&address, characteristic);
                        Some(DiscoveredCharacteristic {
                            uuid,
                            handle: CharacteristicHandle(char_handle),
                            description: None,
                        })
                    })
                    .collect()),
                Err(e) => Err(e.to_string()),
            };
            state
                .sink
                .deliver(PeripheralEvent::CharacteristicsDiscovered {
                    address,
                    service: handle,
                    result,
                })
                .await;
        });
    }

    fn read_value(&self, address: PeripheralAddress, handle: CharacteristicHandle) {
        let Some(characteristic) = self.state.characteristic(handle) else {
            self.deliver_later(PeripheralEvent::ValueRead {
                address,
                characteristic: handle,
                result: Err(DriverError::UnknownHandle(handle.0).to_string()),
            });
            return;
        };

        self.spawn(move |state| async move {
            let result = match characteristic.read().await {
                Ok(value) if value.is_empty() => Ok(None),
                Ok(value) => Ok(Some(value)),
                Err(e) => Err(e.to_string()),
            };
            state
                .sink
                .deliver(PeripheralEvent::ValueRead {
                    address,
                    characteristic: handle,
                    result,
                })
                .await;
        });
    }
}

#[async_trait::async_trait]
impl RadioDriver for BluestDriver {
    async fn send_command(&self, command: DriverCommand) -> Result<(), DriverError> {
        if self.state.sink.is_closed() {
            return Err(DriverError::ChannelClosed);
        }
        match command {
            DriverCommand::StartScan {
                services,
                allow_duplicates,
            } => self.start_scan(services, allow_duplicates),
            DriverCommand::StopScan => self.stop_scan(),
            DriverCommand::Connect(address) => self.connect(address),
            DriverCommand::Disconnect(address) => self.disconnect(address),
            DriverCommand::DiscoverServices(address) => self.discover_services(address),
            DriverCommand::DiscoverCharacteristics { address, service } => {
                self.discover_characteristics(address, service)
            }
            DriverCommand::ReadValue {
                address,
                characteristic,
            } => self.read_value(address, characteristic),
        }
        Ok(())
    }
}

impl Drop for BluestDriver {
    fn drop(&mut self) {
        self.stop_scan();
        self.power_token.cancel();
        if let Ok(watchers) = self.link_watchers.lock() {
            for watcher in watchers.values() {
                watcher.cancel();
            }
        }
    }
}
