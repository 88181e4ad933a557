//! Protocol module for the mug's characteristic payloads.
//!
//! Both temperature characteristics carry a 2-byte word in hundredths of a
//! degree. See [`codec`] for the encoding and the byte order policy.

pub mod codec;

pub use codec::{same_setpoint, ByteOrder, SetpointCodec, MAX_CELSIUS, RESOLUTION};
