//! BLE Characteristic UUIDs.
//!
//! Contains the UUID constants used for mug communication, plus a best-effort
//! classifier that suggests a role for characteristics it recognises.

use uuid::Uuid;

use crate::capabilities::Role;

// Mug temperature characteristics (vendor specific)
/// Current drink temperature (read, notify).
pub const DRINK_TEMPERATURE_UUID: Uuid =
    Uuid::from_u128(0xfc54_0002_236c_4c94_8fa9_944a3e5353fa);
/// Target temperature setpoint (read, write).
pub const TARGET_TEMPERATURE_UUID: Uuid =
    Uuid::from_u128(0xfc54_0003_236c_4c94_8fa9_944a3e5353fa);

// Standard SIG characteristics that carry a temperature
/// Environmental Sensing Temperature characteristic UUID.
pub const TEMPERATURE_UUID: Uuid = Uuid::from_u128(0x0000_2a6e_0000_1000_8000_00805f9b34fb);
/// Health Thermometer Temperature Measurement characteristic UUID.
pub const TEMPERATURE_MEASUREMENT_UUID: Uuid =
    Uuid::from_u128(0x0000_2a1c_0000_1000_8000_00805f9b34fb);

/// Suggest a role for a characteristic based on its UUID alone.
///
/// This is a display hint only. The controller never writes to a
/// characteristic because of a suggestion; roles are bound by
/// [`crate::capabilities::RoleHints`].
pub fn suggest_role(uuid: &Uuid) -> Option<Role> {
    match *uuid {
        DRINK_TEMPERATURE_UUID | TEMPERATURE_UUID | TEMPERATURE_MEASUREMENT_UUID => {
            Some(Role::Measured)
        }
        TARGET_TEMPERATURE_UUID => Some(Role::Setpoint),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_format() {
        assert_eq!(
            TARGET_TEMPERATURE_UUID.to_string(),
            "fc540003-236c-4c94-8fa9-944a3e5353fa"
        );
        assert_eq!(
            DRINK_TEMPERATURE_UUID.to_string(),
            "fc540002-236c-4c94-8fa9-944a3e5353fa"
        );
        assert!(TEMPERATURE_UUID.to_string().contains("2a6e"));
    }

    #[test]
    fn test_suggest_role() {
        assert_eq!(suggest_role(&DRINK_TEMPERATURE_UUID), Some(Role::Measured));
        assert_eq!(suggest_role(&TEMPERATURE_MEASUREMENT_UUID), Some(Role::Measured));
        assert_eq!(suggest_role(&TARGET_TEMPERATURE_UUID), Some(Role::Setpoint));
        assert_eq!(suggest_role(&Uuid::nil()), None);
    }
}
