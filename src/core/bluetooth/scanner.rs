//! Advertisement deduplication
//! Filters and throttles the raw advertisement stream into registry updates.

use std::collections::HashSet;

use log::{debug, info};
use uuid::Uuid;

use crate::core::bluetooth::constants::{ADV_LOCAL_NAME, ADV_SERVICE_UUIDS, NO_NAME};
use crate::core::bluetooth::events::Advertisement;
use crate::core::bluetooth::registry::EntityRegistry;
use crate::core::bluetooth::types::{
    AdvertisementPayload, AdvertisementValue, Peripheral, PeripheralId,
};

/// What happened to one advertisement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryOutcome {
    /// RSSI was not negative
    InvalidRssi,
    /// No advertised service matched the active filter
    Filtered,
    /// First sighting of this address
    Inserted(PeripheralId),
    /// Throttled observation that refreshed name and RSSI
    Refreshed(PeripheralId),
    /// Repeat observation that only bumped the counter
    Counted(PeripheralId),
}

impl DiscoveryOutcome {
    /// True when observers should be told the peripheral list changed
    pub fn changed_list(&self) -> bool {
        matches!(self, Self::Inserted(_) | Self::Refreshed(_))
    }
}

pub struct DiscoveryDeduplicator {
    refresh_interval: u64,
    service_filter: Option<HashSet<Uuid>>,
}

impl DiscoveryDeduplicator {
    pub fn new(refresh_interval: u64) -> Self {
        Self {
            refresh_interval: refresh_interval.max(1),
            service_filter: None,
        }
    }

    /// Restricts accepted advertisements to those declaring one of `services`
    pub fn set_service_filter(&mut self, services: Option<Vec<Uuid>>) {
        self.service_filter = services.map(|uuids| uuids.into_iter().collect());
    }

    pub fn service_filter(&self) -> Option<&HashSet<Uuid>> {
        self.service_filter.as_ref()
    }

    pub fn on_advertisement(
        &self,
        registry: &mut EntityRegistry,
        advertisement: Advertisement,
    ) -> DiscoveryOutcome {
        if advertisement.rssi >= 0 {
            debug!(
                "Ignoring advertisement from {} with invalid RSSI {}",
                advertisement.address, advertisement.rssi
            );
            return DiscoveryOutcome::InvalidRssi;
        }

        if !self.matches_filter(&advertisement.payload) {
            debug!("Advertisement from {} filtered out", advertisement.address);
            return DiscoveryOutcome::Filtered;
        }

        let name = Self::resolve_name(&advertisement);

        if let Some(peripheral) = registry.peripheral_by_address_mut(&advertisement.address) {
            let refresh = peripheral.discover_count % self.refresh_interval == 0;
            peripheral.discover_count += 1;
            if refresh {
                peripheral.name = name;
                peripheral.rssi = advertisement.rssi;
                return DiscoveryOutcome::Refreshed(peripheral.id);
            }
            return DiscoveryOutcome::Counted(peripheral.id);
        }

        info!(
            "Discovered {} ({}) RSSI {}",
            name, advertisement.address, advertisement.rssi
        );
        let peripheral = Peripheral::new(
            advertisement.address,
            name,
            advertisement.rssi,
            advertisement.payload,
        );
        DiscoveryOutcome::Inserted(registry.insert_peripheral(peripheral))
    }

    fn matches_filter(&self, payload: &AdvertisementPayload) -> bool {
        let Some(filter) = &self.service_filter else {
            return true;
        };
        match payload.get(ADV_SERVICE_UUIDS) {
            Some(AdvertisementValue::Uuids(advertised)) => {
                advertised.iter().any(|uuid| filter.contains(uuid))
            }
            _ => false,
        }
    }

    /// Advertised local name, else driver name, else the sentinel
    pub fn resolve_name(advertisement: &Advertisement) -> String {
        match advertisement.payload.get(ADV_LOCAL_NAME) {
            Some(AdvertisementValue::Text(local_name)) => local_name.clone(),
            _ => advertisement
                .name
                .clone()
                .unwrap_or_else(|| NO_NAME.to_string()),
        }
    }
}
