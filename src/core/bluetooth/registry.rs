//! Entity registry
//! Owns every discovered peripheral, service and characteristic record.
//! Other components refer to records by identifier or driver handle only.

use std::collections::HashMap;

use log::debug;
use uuid::Uuid;

use crate::core::bluetooth::types::{
    Characteristic, CharacteristicHandle, CharacteristicId, Peripheral, PeripheralAddress,
    PeripheralId, Service, ServiceHandle, ServiceId,
};

#[derive(Debug, Default)]
pub struct EntityRegistry {
    /// Peripherals in discovery order
    peripherals: Vec<Peripheral>,
    /// Radio address to index in `peripherals`
    by_address: HashMap<PeripheralAddress, usize>,
    services: Vec<Service>,
    characteristics: Vec<Characteristic>,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn peripherals(&self) -> &[Peripheral] {
        &self.peripherals
    }

    pub fn services(&self) -> &[Service] {
        &self.services
    }

    pub fn characteristics(&self) -> &[Characteristic] {
        &self.characteristics
    }

    pub fn peripheral(&self, id: PeripheralId) -> Option<&Peripheral> {
        self.peripherals.iter().find(|p| p.id == id)
    }

    pub fn peripheral_by_address(&self, address: &PeripheralAddress) -> Option<&Peripheral> {
        self.by_address.get(address).map(|&index| &self.peripherals[index])
    }

    pub fn peripheral_by_address_mut(
        &mut self,
        address: &PeripheralAddress,
    ) -> Option<&mut Peripheral> {
        let index = *self.by_address.get(address)?;
        self.peripherals.get_mut(index)
    }

    /// Inserts a newly discovered peripheral.
    /// An address already present keeps its existing record and id.
    pub fn insert_peripheral(&mut self, peripheral: Peripheral) -> PeripheralId {
        if let Some(existing) = self.peripheral_by_address(&peripheral.address) {
            debug!("Peripheral {} already registered", peripheral.address);
            return existing.id;
        }
        let id = peripheral.id;
        self.by_address
            .insert(peripheral.address.clone(), self.peripherals.len());
        self.peripherals.push(peripheral);
        id
    }

    pub fn service_by_handle(&self, handle: ServiceHandle) -> Option<&Service> {
        self.services.iter().find(|s| s.handle == handle)
    }

    /// Registers a service of `peripheral`, reusing the record if the handle is known
    pub fn insert_service(
        &mut self,
        uuid: Uuid,
        handle: ServiceHandle,
        peripheral: PeripheralId,
    ) -> ServiceId {
        if let Some(existing) = self.service_by_handle(handle) {
            return existing.id;
        }
        let service = Service::new(uuid, handle, peripheral);
        let id = service.id;
        self.services.push(service);
        id
    }

    pub fn characteristic(&self, id: CharacteristicId) -> Option<&Characteristic> {
        self.characteristics.iter().find(|c| c.id == id)
    }

    pub fn characteristic_by_handle(
        &self,
        handle: CharacteristicHandle,
    ) -> Option<&Characteristic> {
        self.characteristics.iter().find(|c| c.handle == handle)
    }

    /// Registers a characteristic of `service`, reusing the record if the handle is known.
    /// Returns the id and whether a new record was created.
    pub fn insert_characteristic(
        &mut self,
        uuid: Uuid,
        label: Option<String>,
        service: ServiceId,
        handle: CharacteristicHandle,
    ) -> (CharacteristicId, bool) {
        if let Some(existing) = self.characteristic_by_handle(handle) {
            return (existing.id, false);
        }
        let characteristic = Characteristic::new(uuid, label, service, handle);
        let id = characteristic.id;
        self.characteristics.push(characteristic);
        (id, true)
    }

    /// Overwrites the value of the characteristic behind `handle` with the hex of `bytes`
    pub fn update_value(
        &mut self,
        handle: CharacteristicHandle,
        bytes: &[u8],
    ) -> Option<CharacteristicId> {
        let characteristic = self
            .characteristics
            .iter_mut()
            .find(|c| c.handle == handle)?;
        characteristic.value = hex::encode(bytes);
        Some(characteristic.id)
    }

    /// Drops all services and characteristics
    pub fn clear_gatt(&mut self) {
        self.services.clear();
        self.characteristics.clear();
    }

    /// Drops every record
    pub fn clear(&mut self) {
        self.clear_gatt();
        self.peripherals.clear();
        self.by_address.clear();
    }
}
