//! Events delivered by a radio driver into the session.
//! Central-manager events (power, advertisements, link changes) and
//! peripheral events (GATT discovery and reads) travel on one serialized channel.

use log::warn;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::core::bluetooth::error::DriverError;
use crate::core::bluetooth::types::{
    AdvertisementPayload, CharacteristicHandle, PeripheralAddress, RadioState, ServiceHandle,
};

/// One advertisement packet observed during a scan
#[derive(Debug, Clone, PartialEq)]
pub struct Advertisement {
    pub address: PeripheralAddress,
    /// Name the driver knows the peripheral by, if any
    pub name: Option<String>,
    pub rssi: i16,
    pub payload: AdvertisementPayload,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CentralEvent {
    StateChanged(RadioState),
    Advertisement(Advertisement),
    Connected {
        address: PeripheralAddress,
    },
    ConnectFailed {
        address: PeripheralAddress,
        reason: Option<String>,
    },
    /// Confirmation of a requested disconnect or an unsolicited link loss
    Disconnected {
        address: PeripheralAddress,
        reason: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredService {
    pub uuid: Uuid,
    pub handle: ServiceHandle,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredCharacteristic {
    pub uuid: Uuid,
    pub handle: CharacteristicHandle,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PeripheralEvent {
    ServicesDiscovered {
        address: PeripheralAddress,
        result: Result<Vec<DiscoveredService>, String>,
    },
    CharacteristicsDiscovered {
        address: PeripheralAddress,
        service: ServiceHandle,
        result: Result<Vec<DiscoveredCharacteristic>, String>,
    },
    /// Completion of a read; `Ok(None)` means the peripheral returned no value
    ValueRead {
        address: PeripheralAddress,
        characteristic: CharacteristicHandle,
        result: Result<Option<Vec<u8>>, String>,
    },
}

impl PeripheralEvent {
    pub fn address(&self) -> &PeripheralAddress {
        match self {
            Self::ServicesDiscovered { address, .. }
            | Self::CharacteristicsDiscovered { address, .. }
            | Self::ValueRead { address, .. } => address,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DriverEvent {
    Central(CentralEvent),
    Peripheral(PeripheralEvent),
}

impl From<CentralEvent> for DriverEvent {
    fn from(event: CentralEvent) -> Self {
        Self::Central(event)
    }
}

impl From<PeripheralEvent> for DriverEvent {
    fn from(event: PeripheralEvent) -> Self {
        Self::Peripheral(event)
    }
}

/// Sending half handed to a radio driver
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::Sender<DriverEvent>,
}

impl EventSink {
    pub async fn send(&self, event: impl Into<DriverEvent>) -> Result<(), DriverError> {
        self.tx
            .send(event.into())
            .await
            .map_err(|_| DriverError::ChannelClosed)
    }

    /// Sends an event, logging instead of failing when the session is gone
    pub async fn deliver(&self, event: impl Into<DriverEvent>) {
        if let Err(e) = self.send(event).await {
            warn!("Dropping driver event: {}", e);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Creates the serialized channel a driver delivers its events on.
/// A zero capacity is raised to one.
pub fn driver_channel(capacity: usize) -> (EventSink, mpsc::Receiver<DriverEvent>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (EventSink { tx }, rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn zero_capacity_channel_still_delivers() {
        let (sink, mut events) = driver_channel(0);
        sink.send(CentralEvent::StateChanged(RadioState::PoweredOn))
            .await
            .unwrap();
        assert!(matches!(
            events.recv().await,
            Some(DriverEvent::Central(CentralEvent::StateChanged(RadioState::PoweredOn)))
        ));

        drop(events);
        assert!(sink.is_closed());
        assert!(matches!(
            sink.send(CentralEvent::StateChanged(RadioState::PoweredOff)).await,
            Err(DriverError::ChannelClosed)
        ));
    }
}
