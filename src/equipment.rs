//! Mutable session-scoped equipment metadata.

use std::collections::HashMap;

use crate::catalog::{lookup_by_id, CharacteristicDefinition, SportsEquipment};
use crate::error::{Error, Result};
use crate::value::Value;

/// The subset of the static catalog a particular device actually advertises,
/// plus the metadata collected during the connect sequence.
///
/// Invariant: `characteristics` is always a subset of `catalog::CATALOG`
/// keyed by id; an id is present here iff its bit was set in the
/// `EQUIPMENT_INFORMATION` response bitmap. `equipment` is fixed once the
/// struct is built; there is deliberately no setter.
#[derive(Debug, Clone)]
pub struct EquipmentInformation {
    equipment: SportsEquipment,
    characteristics: HashMap<u8, CharacteristicDefinition>,
    supported_capabilities: Vec<u8>,
    supported_commands: Vec<u8>,
    values: HashMap<String, Value>,
    serial_number: Option<String>,
    firmware_version: Option<String>,
    reference_number: Option<u32>,
}

impl EquipmentInformation {
    pub fn new(equipment: SportsEquipment, characteristic_ids: &[u8]) -> Self {
        let characteristics = characteristic_ids
            .iter()
            .filter_map(|&id| lookup_by_id(id).map(|def| (id, *def)))
            .collect();

        Self {
            equipment,
            characteristics,
            supported_capabilities: Vec::new(),
            supported_commands: Vec::new(),
            values: HashMap::new(),
            serial_number: None,
            firmware_version: None,
            reference_number: None,
        }
    }

    pub fn equipment(&self) -> SportsEquipment {
        self.equipment
    }

    pub fn characteristics(&self) -> &HashMap<u8, CharacteristicDefinition> {
        &self.characteristics
    }

    pub fn supports_command(&self, command: u8) -> bool {
        self.supported_commands.contains(&command)
    }

    pub fn set_supported_capabilities(&mut self, ids: Vec<u8>) {
        self.supported_capabilities = ids;
    }

    pub fn supported_capabilities(&self) -> &[u8] {
        &self.supported_capabilities
    }

    pub fn set_supported_commands(&mut self, ids: Vec<u8>) {
        self.supported_commands = ids;
    }

    pub fn supported_commands(&self) -> &[u8] {
        &self.supported_commands
    }

    pub fn set_serial_number(&mut self, serial: String) {
        self.serial_number = Some(serial);
    }

    pub fn serial_number(&self) -> Option<&str> {
        self.serial_number.as_deref()
    }

    pub fn set_firmware_version(&mut self, version: String) {
        self.firmware_version = Some(version);
    }

    pub fn firmware_version(&self) -> Option<&str> {
        self.firmware_version.as_deref()
    }

    pub fn set_reference_number(&mut self, reference: u32) {
        self.reference_number = Some(reference);
    }

    pub fn reference_number(&self) -> Option<u32> {
        self.reference_number
    }

    /// Looks up a characteristic by id among those this device advertises,
    /// refusing ids that exist in the catalog but weren't advertised.
    pub fn resolve_id(&self, id: u8) -> Result<&CharacteristicDefinition> {
        self.characteristics
            .get(&id)
            .ok_or_else(|| Error::invalid_argument(format!("characteristic id {id} not supported by this device")))
    }

    /// Records a value observed from a read response or metadata query,
    /// keyed by characteristic name.
    pub fn record_value(&mut self, id: u8, value: Value) {
        if let Some(def) = self.characteristics.get(&id) {
            self.values.insert(def.name.to_string(), value);
        }
    }

    pub fn value(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn values(&self) -> &HashMap<String, Value> {
        &self.values
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn characteristics_is_filtered_to_advertised_subset() {
        let info = EquipmentInformation::new(SportsEquipment::Treadmill, &[0, 1, 16]);
        assert!(info.characteristics().contains_key(&0));
        assert!(info.characteristics().contains_key(&16));
        assert!(!info.characteristics().contains_key(&30));
    }

    #[test]
    fn resolve_id_rejects_unadvertised_catalog_member() {
        let info = EquipmentInformation::new(SportsEquipment::Treadmill, &[0]);
        assert!(info.resolve_id(30).is_err());
        assert!(info.resolve_id(0).is_ok());
    }

    #[test]
    fn record_value_is_keyed_by_name() {
        let mut info = EquipmentInformation::new(SportsEquipment::Treadmill, &[30]);
        info.record_value(30, Value::Float(12.5));
        assert_eq!(info.value("MaxKph"), Some(&Value::Float(12.5)));
    }
}
