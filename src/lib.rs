// Allow holding locks across await points - we use parking_lot which is designed for this
#![allow(clippy::await_holding_lock)]
// Allow unusual byte groupings for UUIDs which have standard format
#![allow(clippy::unusual_byte_groupings)]

//! # mug-control-ble
//!
//! A cross-platform Rust library that keeps a Bluetooth Low Energy
//! temperature-controlled mug at drinking temperature.
//!
//! The controller reads the drink temperature from the mug, and toggles the
//! mug's target temperature between an "off" and a "heat" setpoint with a
//! hysteresis policy.
//!
//! ## Features
//!
//! - **Discovery**: Scan for peripherals and keep a merged, ordered ledger of sightings
//! - **Capability Probing**: Bind the drink and target characteristics and record what each supports
//! - **Byte Order Calibration**: Confirm the setpoint byte order with a write-then-read-back check
//! - **Control Loop**: Periodic read, decide, write cycle that tolerates transient failures
//! - **Session Supervision**: Connect, control and always disconnect, with cooperative cancellation
//! - **Status Events**: One broadcast channel reporting everything a UI needs
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use mug_control_ble::{
//!     BleCentral, ControllerConfig, Discovery, Result, SessionSupervisor,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = ControllerConfig::default().with_target("C0AFF08D-F255-248A-1317-30DE4080E377");
//!     let central = Arc::new(BleCentral::new().await?);
//!     let cancel = CancellationToken::new();
//!
//!     // Scan until the mug shows up
//!     let discovery = Discovery::new(central.clone(), &config);
//!     let Some(mug) = discovery.find_target(&cancel).await? else {
//!         return Ok(());
//!     };
//!     println!("Found {} ({})", mug.display_name(), mug.identifier);
//!
//!     // Control it until the connection drops
//!     let supervisor = SessionSupervisor::new(central, config)?;
//!     let outcome = supervisor.run(&mug.identifier, &cancel).await;
//!     println!("Session ended: {}", outcome);
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Platform Notes
//!
//! ### macOS
//! Requires Bluetooth permission. Add `NSBluetoothAlwaysUsageDescription`
//! to your Info.plist for bundled apps. Peripheral identifiers are
//! platform UUIDs rather than MAC addresses.
//!
//! ### Linux
//! Requires BlueZ. User may need to be in the `bluetooth` group.
//!
//! ### Windows
//! Requires Windows 10 or later with Bluetooth LE support.
//!
//! ## Feature Flags
//!
//! - `serde`: Enable serialization/deserialization for configuration and data types

// Public modules
pub mod ble;
pub mod capabilities;
pub mod config;
pub mod control;
pub mod discovery;
pub mod error;
pub mod events;
pub mod protocol;
pub mod supervisor;
pub mod transport;
pub mod utils;

#[cfg(test)]
mod testing;

// Re-exports for convenience
pub use ble::{BleCentral, BleSession, ConnectionState};
pub use capabilities::{
    ByteOrderResolution, ByteOrderSource, Capabilities, CapabilityDescriptor, Role, RoleHints,
};
pub use config::{ControllerConfig, HysteresisPolicy};
pub use control::{write_setpoint, ControlLoop, ControlState, Decision, LoopExit, Reading};
pub use discovery::{Discovery, DiscoveryLedger, Snapshot};
pub use error::{Error, Result};
pub use events::{Operation, SkipReason, StatusEvent};
pub use protocol::{ByteOrder, SetpointCodec};
pub use supervisor::{SessionOutcome, SessionSupervisor};
pub use transport::{AdvertisementSighting, CharacteristicId, GattSession, Transport};
pub use utils::{celsius_to_fahrenheit, fahrenheit_to_celsius};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_exports() {
        // Verify that key types are exported
        let _ = std::any::TypeId::of::<DiscoveryLedger>();
        let _ = std::any::TypeId::of::<SessionSupervisor<BleCentral>>();
        let _ = std::any::TypeId::of::<Error>();
        let _ = std::any::TypeId::of::<SetpointCodec>();
        let _ = std::any::TypeId::of::<StatusEvent>();
        let _ = std::any::TypeId::of::<ControllerConfig>();
    }

    #[test]
    fn test_temperature_conversion() {
        assert!((celsius_to_fahrenheit(100.0) - 212.0).abs() < 0.001);
        assert!((fahrenheit_to_celsius(212.0) - 100.0).abs() < 0.001);
    }
}
