//! Defines shared data structures for the Bluetooth module.

use std::collections::HashMap;
use std::fmt;

use serde::Serialize;
use uuid::Uuid;

use crate::core::bluetooth::constants::{UNNAMED_CHARACTERISTIC, UNREAD_VALUE};

macro_rules! entity_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
        pub struct $name(Uuid);

        impl $name {
            /// Allocates a fresh identifier
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

entity_id!(
    /// Stable identity of a discovered peripheral, assigned at first discovery
    PeripheralId
);
entity_id!(
    /// Identity of a discovered GATT service
    ServiceId
);
entity_id!(
    /// Identity of a discovered GATT characteristic
    CharacteristicId
);

/// Radio-level address of a peripheral as reported by the driver
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct PeripheralAddress(String);

impl PeripheralAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeripheralAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeripheralAddress {
    fn from(address: &str) -> Self {
        Self::new(address)
    }
}

/// Opaque driver handle of a service inside a peripheral's GATT table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ServiceHandle(pub u64);

/// Opaque driver handle of a characteristic inside a peripheral's GATT table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct CharacteristicHandle(pub u64);

/// A single typed value carried in an advertisement payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum AdvertisementValue {
    Text(String),
    Integer(i64),
    Uuids(Vec<Uuid>),
    Bytes(Vec<u8>),
}

/// Raw advertisement data keyed by payload field
pub type AdvertisementPayload = HashMap<String, AdvertisementValue>;

/// Represents a discovered peripheral
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Peripheral {
    pub id: PeripheralId,
    /// The radio address the peripheral advertised from
    pub address: PeripheralAddress,
    /// Resolved display name, refreshed on throttled observations
    pub name: String,
    /// Last accepted signal strength (always negative)
    pub rssi: i16,
    pub advertisement: AdvertisementPayload,
    /// Number of repeat observations since first discovery
    pub discover_count: u64,
}

impl Peripheral {
    pub fn new(
        address: PeripheralAddress,
        name: String,
        rssi: i16,
        advertisement: AdvertisementPayload,
    ) -> Self {
        Self {
            id: PeripheralId::new(),
            address,
            name,
            rssi,
            advertisement,
            discover_count: 0,
        }
    }
}

/// Represents a GATT service of the connected peripheral
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Service {
    pub id: ServiceId,
    pub uuid: Uuid,
    pub handle: ServiceHandle,
    pub peripheral: PeripheralId,
}

impl Service {
    pub fn new(uuid: Uuid, handle: ServiceHandle, peripheral: PeripheralId) -> Self {
        Self {
            id: ServiceId::new(),
            uuid,
            handle,
            peripheral,
        }
    }
}

/// Represents a GATT characteristic and its last read value
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Characteristic {
    pub id: CharacteristicId,
    pub uuid: Uuid,
    pub label: String,
    pub service: ServiceId,
    pub handle: CharacteristicHandle,
    /// Lowercase hex of the last read, or the unread sentinel
    pub value: String,
}

impl Characteristic {
    pub fn new(
        uuid: Uuid,
        label: Option<String>,
        service: ServiceId,
        handle: CharacteristicHandle,
    ) -> Self {
        let label = label
            .filter(|label| !label.is_empty())
            .unwrap_or_else(|| UNNAMED_CHARACTERISTIC.to_string());
        Self {
            id: CharacteristicId::new(),
            uuid,
            label,
            service,
            handle,
            value: UNREAD_VALUE.to_string(),
        }
    }

    pub fn is_read(&self) -> bool {
        self.value != UNREAD_VALUE
    }
}

/// Power state of the radio adapter as reported by the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RadioState {
    Unknown,
    Resetting,
    Unsupported,
    Unauthorized,
    PoweredOff,
    PoweredOn,
}

impl RadioState {
    pub fn is_powered_on(&self) -> bool {
        matches!(self, Self::PoweredOn)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum ScanState {
    #[default]
    Idle,
    Searching,
}

/// Connection lifecycle of the current target peripheral
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    ServicesDiscovering,
    CharacteristicsDiscovering,
    Connected,
    Error,
}

impl ConnectionState {
    /// True while the connect/discovery pipeline holds a target
    pub fn has_link(&self) -> bool {
        matches!(
            self,
            Self::Connecting
                | Self::ServicesDiscovering
                | Self::CharacteristicsDiscovering
                | Self::Connected
        )
    }
}

/// Read-only view of the session published to observers
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub powered_on: bool,
    pub scan_state: ScanState,
    pub connection_state: ConnectionState,
    /// Set when a new peripheral shows up, cleared on connect, stop scan and reset
    pub discovery_pending: bool,
    pub target: Option<PeripheralId>,
    pub last_error: Option<String>,
    pub peripherals: Vec<Peripheral>,
    pub services: Vec<Service>,
    pub characteristics: Vec<Characteristic>,
}

impl SessionSnapshot {
    pub fn peripheral(&self, id: PeripheralId) -> Option<&Peripheral> {
        self.peripherals.iter().find(|p| p.id == id)
    }

    pub fn characteristics_of(&self, service: ServiceId) -> impl Iterator<Item = &Characteristic> {
        self.characteristics.iter().filter(move |c| c.service == service)
    }
}

/// Change notifications pushed to observers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SessionNotification {
    PowerChanged(bool),
    ScanStateChanged(ScanState),
    PeripheralListChanged,
    StatusChanged(ConnectionState),
    ServicesChanged,
    CharacteristicUpdated(CharacteristicId),
}
