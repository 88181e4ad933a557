//! Capability probing.
//!
//! After a connection is established the controller does not know which
//! characteristics it can use or how. [`resolve`] binds the Measured and
//! Setpoint roles to characteristics and records what each one supports;
//! [`resolve_byte_order`] settles the session's temperature byte order.
//! Both run once per session, before the control loop starts.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::ble::uuids::{suggest_role, DRINK_TEMPERATURE_UUID, TARGET_TEMPERATURE_UUID};
use crate::config::ControllerConfig;
use crate::error::Result;
use crate::protocol::{same_setpoint, ByteOrder, SetpointCodec};
use crate::transport::{bounded, CharacteristicId, CharacteristicInfo, GattSession};
use crate::utils::hex_preview;

/// What a characteristic is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Role {
    /// The measured value (drink temperature).
    Measured,
    /// The target setpoint.
    Setpoint,
}

impl Role {
    /// All roles.
    pub const ALL: [Role; 2] = [Role::Measured, Role::Setpoint];
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Measured => write!(f, "Measured"),
            Self::Setpoint => write!(f, "Setpoint"),
        }
    }
}

/// Characteristic UUID to look for, per role.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RoleHints {
    hints: BTreeMap<Role, Uuid>,
}

impl RoleHints {
    /// Hints with no roles configured.
    pub fn empty() -> Self {
        Self {
            hints: BTreeMap::new(),
        }
    }

    /// Bind a role to a characteristic UUID.
    pub fn with(mut self, role: Role, uuid: Uuid) -> Self {
        self.hints.insert(role, uuid);
        self
    }

    /// The UUID configured for a role.
    pub fn get(&self, role: Role) -> Option<Uuid> {
        self.hints.get(&role).copied()
    }

    /// Iterate the configured roles.
    pub fn iter(&self) -> impl Iterator<Item = (Role, Uuid)> + '_ {
        self.hints.iter().map(|(role, uuid)| (*role, *uuid))
    }
}

impl Default for RoleHints {
    fn default() -> Self {
        Self::empty()
            .with(Role::Measured, DRINK_TEMPERATURE_UUID)
            .with(Role::Setpoint, TARGET_TEMPERATURE_UUID)
    }
}

/// A role bound to a characteristic, with what that characteristic supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapabilityDescriptor {
    /// The role.
    pub role: Role,
    /// The characteristic filling it.
    pub characteristic: CharacteristicId,
    /// Supports read.
    pub supports_read: bool,
    /// Supports write with response.
    pub supports_acknowledged_write: bool,
    /// Supports write without response.
    pub supports_unacknowledged_write: bool,
}

impl CapabilityDescriptor {
    /// Build a descriptor from an enumerated characteristic.
    pub fn from_info(role: Role, info: &CharacteristicInfo) -> Self {
        Self {
            role,
            characteristic: info.id,
            supports_read: info.properties.readable,
            supports_acknowledged_write: info.properties.writable_ack,
            supports_unacknowledged_write: info.properties.writable_noack,
        }
    }

    /// Whether any write modality is available.
    pub fn is_writable(&self) -> bool {
        self.supports_acknowledged_write || self.supports_unacknowledged_write
    }

    /// The write modality to use: `Some(true)` for acknowledged,
    /// `Some(false)` for unacknowledged, `None` if not writable.
    pub fn preferred_write(&self) -> Option<bool> {
        if self.supports_acknowledged_write {
            Some(true)
        } else if self.supports_unacknowledged_write {
            Some(false)
        } else {
            None
        }
    }
}

/// Roles resolved for one session. A missing role is not an error.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Capabilities {
    roles: BTreeMap<Role, CapabilityDescriptor>,
}

impl Capabilities {
    /// Build from a set of descriptors.
    pub fn from_descriptors(descriptors: impl IntoIterator<Item = CapabilityDescriptor>) -> Self {
        Self {
            roles: descriptors.into_iter().map(|d| (d.role, d)).collect(),
        }
    }

    /// The descriptor for a role, if resolved.
    pub fn get(&self, role: Role) -> Option<&CapabilityDescriptor> {
        self.roles.get(&role)
    }

    /// The Measured descriptor.
    pub fn measured(&self) -> Option<&CapabilityDescriptor> {
        self.get(Role::Measured)
    }

    /// The Setpoint descriptor.
    pub fn setpoint(&self) -> Option<&CapabilityDescriptor> {
        self.get(Role::Setpoint)
    }

    /// The resolved roles.
    pub fn roles(&self) -> Vec<Role> {
        self.roles.keys().copied().collect()
    }

    /// Whether no role was resolved.
    pub fn is_empty(&self) -> bool {
        self.roles.is_empty()
    }
}

/// Map roles onto the session's characteristics.
///
/// Enumerates once. Unmatched roles are left out of the result.
///
/// # Errors
///
/// Propagates enumeration failures.
pub async fn resolve<S>(session: &S, hints: &RoleHints) -> Result<Capabilities>
where
    S: GattSession + ?Sized,
{
    let characteristics = session.enumerate().await?;
    debug!("Session exposes {} characteristics", characteristics.len());

    let mut descriptors = Vec::new();
    for (role, uuid) in hints.iter() {
        match characteristics.iter().find(|c| c.id.uuid() == uuid) {
            Some(info) => {
                info!(
                    "Found {} characteristic: {} | props={}",
                    role, info.id, info.properties
                );
                descriptors.push(CapabilityDescriptor::from_info(role, info));
            }
            None => warn!("{} characteristic {} not found", role, uuid),
        }
    }

    for info in &characteristics {
        if hints.iter().any(|(_, uuid)| uuid == info.id.uuid()) {
            continue;
        }
        if let Some(role) = suggest_role(&info.id.uuid()) {
            debug!(
                "Characteristic {} looks like a {} characteristic (suggestion only)",
                info.id, role
            );
        }
    }

    Ok(Capabilities::from_descriptors(descriptors))
}

/// How a session's byte order was decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrderSource {
    /// Set explicitly in the configuration.
    Configured,
    /// Confirmed by a write-then-read-back check.
    Calibrated,
    /// Neither configured nor confirmable; the default was assumed.
    Fallback,
}

/// A session's byte order and where it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteOrderResolution {
    /// Byte order to use.
    pub order: ByteOrder,
    /// How it was decided.
    pub source: ByteOrderSource,
}

impl ByteOrderResolution {
    fn fallback(order: ByteOrder) -> Self {
        Self {
            order,
            source: ByteOrderSource::Fallback,
        }
    }
}

/// Decide the session's byte order.
///
/// A configured order is used as is. Otherwise, when calibration is enabled
/// and the setpoint can be written and read back, the device is asked;
/// failing that, [`ControllerConfig::FALLBACK_BYTE_ORDER`] is assumed.
pub async fn resolve_byte_order<S>(
    session: &S,
    capabilities: &Capabilities,
    config: &ControllerConfig,
) -> ByteOrderResolution
where
    S: GattSession + ?Sized,
{
    if let Some(order) = config.byte_order {
        return ByteOrderResolution {
            order,
            source: ByteOrderSource::Configured,
        };
    }

    let fallback = ControllerConfig::FALLBACK_BYTE_ORDER;

    match capabilities.setpoint() {
        Some(setpoint) if config.calibrate_byte_order => {
            calibrate_byte_order(
                session,
                setpoint,
                config.policy.max_setpoint,
                fallback,
                config.io_timeout,
            )
            .await
        }
        _ => ByteOrderResolution::fallback(fallback),
    }
}

/// Find the byte order the device honours by writing `probe_value` and
/// reading it back.
///
/// Orders are tried starting with `fallback`. The setpoint's original bytes
/// are written back on every path that wrote a probe, so callers must let
/// this run to completion rather than dropping it. Any I/O failure, an unreadable or unwritable
/// setpoint, or a probe value that encodes the same in both orders yields
/// `fallback`.
pub async fn calibrate_byte_order<S>(
    session: &S,
    setpoint: &CapabilityDescriptor,
    probe_value: f64,
    fallback: ByteOrder,
    io_timeout: Duration,
) -> ByteOrderResolution
where
    S: GattSession + ?Sized,
{
    let Some(acknowledged) = setpoint.preferred_write() else {
        debug!("Setpoint not writable, assuming {} endian", fallback);
        return ByteOrderResolution::fallback(fallback);
    };
    if !setpoint.supports_read {
        debug!("Setpoint not readable, assuming {} endian", fallback);
        return ByteOrderResolution::fallback(fallback);
    }

    let probe = match SetpointCodec::new(fallback).encode(probe_value) {
        Ok(bytes) if bytes[0] != bytes[1] => bytes,
        _ => {
            debug!(
                "Probe value {:.2}°C cannot tell byte orders apart, assuming {} endian",
                probe_value, fallback
            );
            return ByteOrderResolution::fallback(fallback);
        }
    };
    debug!("Calibrating byte order with [{}]", hex_preview(&probe, 2));

    let characteristic = &setpoint.characteristic;
    let original = match bounded(io_timeout, session.read(characteristic)).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!("Could not read setpoint before calibration: {}", e);
            return ByteOrderResolution::fallback(fallback);
        }
    };

    let mut orders = ByteOrder::ALL;
    orders.sort_by_key(|order| *order != fallback);

    let mut confirmed = None;
    for order in orders {
        let codec = SetpointCodec::new(order);
        let Ok(bytes) = codec.encode(probe_value) else {
            break;
        };

        if let Err(e) = bounded(io_timeout, session.write(characteristic, &bytes, acknowledged)).await
        {
            warn!("Calibration write failed: {}", e);
            break;
        }

        match bounded(io_timeout, session.read(characteristic)).await {
            Ok(read_back) => {
                debug!(
                    "Wrote [{}] ({} endian), read back [{}]",
                    hex_preview(&bytes, 2),
                    order,
                    hex_preview(&read_back, 8)
                );
                let honoured = codec
                    .decode_slice(&read_back)
                    .map(|value| same_setpoint(value, probe_value))
                    .unwrap_or(false);
                if honoured {
                    confirmed = Some(order);
                    break;
                }
            }
            Err(e) => {
                warn!("Calibration read-back failed: {}", e);
                break;
            }
        }
    }

    if let Err(e) = bounded(io_timeout, session.write(characteristic, &original, acknowledged)).await
    {
        warn!(
            "Could not restore setpoint [{}] after calibration: {}",
            hex_preview(&original, 8),
            e
        );
    }

    match confirmed {
        Some(order) => {
            info!("Device honours {} endian setpoints", order);
            ByteOrderResolution {
                order,
                source: ByteOrderSource::Calibrated,
            }
        }
        None => {
            warn!(
                "Could not confirm setpoint byte order, assuming {} endian",
                fallback
            );
            ByteOrderResolution::fallback(fallback)
        }
    }
}
