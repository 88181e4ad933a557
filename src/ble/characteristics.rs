//! GATT characteristic handling.
//!
//! Provides functionality for enumerating, reading and writing
//! characteristics on a connected peripheral.

use btleplug::api::{CharPropFlags, Characteristic, Peripheral as _, WriteType};
use btleplug::platform::Peripheral;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::transport::{CharacteristicId, CharacteristicInfo, CharacteristicProperties};
use crate::utils::hex_preview;

/// Map btleplug property flags onto the controller's closed flag set.
pub fn properties_from_flags(flags: CharPropFlags) -> CharacteristicProperties {
    CharacteristicProperties {
        readable: flags.contains(CharPropFlags::READ),
        writable_ack: flags.contains(CharPropFlags::WRITE),
        writable_noack: flags.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE),
    }
}

/// Handler for GATT characteristics on a peripheral.
pub struct CharacteristicHandler {
    /// The peripheral to communicate with.
    peripheral: Peripheral,
    /// Cached characteristics by UUID.
    characteristics: Arc<RwLock<HashMap<Uuid, Characteristic>>>,
}

impl CharacteristicHandler {
    /// Create a new characteristic handler for a peripheral.
    ///
    /// Note: Services must be discovered before using this handler.
    pub fn new(peripheral: Peripheral) -> Self {
        Self {
            peripheral,
            characteristics: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Discover and cache all characteristics.
    ///
    /// This should be called after connecting and discovering services.
    pub fn discover_characteristics(&self) -> Vec<CharacteristicInfo> {
        let services = self.peripheral.services();

        let mut chars = self.characteristics.write();
        chars.clear();

        let mut infos = Vec::new();
        for service in services {
            for characteristic in service.characteristics {
                let properties = properties_from_flags(characteristic.properties);
                debug!(
                    "Found characteristic: {} in service {} | props={}",
                    characteristic.uuid, service.uuid, properties
                );
                infos.push(CharacteristicInfo {
                    id: CharacteristicId(characteristic.uuid),
                    service: service.uuid,
                    properties,
                });
                chars.insert(characteristic.uuid, characteristic);
            }
        }

        debug!("Discovered {} characteristics", chars.len());

        infos
    }

    fn lookup(&self, uuid: &Uuid) -> Result<Characteristic> {
        self.characteristics
            .read()
            .get(uuid)
            .cloned()
            .ok_or_else(|| Error::CharacteristicNotFound {
                uuid: uuid.to_string(),
            })
    }

    /// Read a characteristic value.
    pub async fn read(&self, uuid: &Uuid) -> Result<Vec<u8>> {
        let characteristic = self.lookup(uuid)?;

        let data = self.peripheral.read(&characteristic).await?;

        trace!("Read [{}] from characteristic {}", hex_preview(&data, 32), uuid);

        Ok(data)
    }

    /// Write to a characteristic.
    pub async fn write(&self, uuid: &Uuid, data: &[u8], with_response: bool) -> Result<()> {
        let characteristic = self.lookup(uuid)?;

        let write_type = if with_response {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };

        self.peripheral
            .write(&characteristic, data, write_type)
            .await?;

        trace!(
            "Wrote [{}] to characteristic {} ({:?})",
            hex_preview(data, 32),
            uuid,
            write_type
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_properties_from_flags() {
        let props = properties_from_flags(CharPropFlags::READ | CharPropFlags::WRITE_WITHOUT_RESPONSE);
        assert!(props.readable);
        assert!(!props.writable_ack);
        assert!(props.writable_noack);

        let props = properties_from_flags(CharPropFlags::NOTIFY);
        assert_eq!(props, CharacteristicProperties::default());
    }
}
