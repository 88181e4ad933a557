//! BLE communication module.
//!
//! This module provides the `btleplug` backed implementation of the
//! controller's transport: scanning, connecting, and characteristic I/O.

pub mod central;
pub mod characteristics;
pub mod connection;
pub mod scanner;
pub mod uuids;

pub use central::BleCentral;
pub use characteristics::CharacteristicHandler;
pub use connection::{BleSession, ConnectionState};
pub use scanner::BleScanner;
pub use uuids::*;
