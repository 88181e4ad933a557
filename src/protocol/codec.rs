//! Setpoint wire codec.
//!
//! Temperatures travel as an unsigned 16-bit integer in hundredths of a
//! degree Celsius: `raw = round(celsius * 100)`. The byte order of that
//! integer is not fixed across firmware revisions, so it is carried as an
//! explicit [`ByteOrder`] rather than assumed.

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Wire units per degree Celsius.
pub const SCALE: f64 = 100.0;

/// Smallest representable temperature step in degrees Celsius.
pub const RESOLUTION: f64 = 1.0 / SCALE;

/// Highest temperature the wire format can carry (655.35°C).
pub const MAX_CELSIUS: f64 = u16::MAX as f64 / SCALE;

/// Byte order of the 16-bit temperature word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "lowercase")
)]
pub enum ByteOrder {
    /// Least significant byte first (50.00°C = `88 13`).
    Little,
    /// Most significant byte first (50.00°C = `13 88`).
    Big,
}

impl ByteOrder {
    /// Both orders, in the sequence calibration tries them by default.
    pub const ALL: [ByteOrder; 2] = [ByteOrder::Little, ByteOrder::Big];

    /// The other byte order.
    pub fn swapped(self) -> Self {
        match self {
            Self::Little => Self::Big,
            Self::Big => Self::Little,
        }
    }
}

impl fmt::Display for ByteOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Little => write!(f, "little"),
            Self::Big => write!(f, "big"),
        }
    }
}

impl FromStr for ByteOrder {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "little" | "le" => Ok(Self::Little),
            "big" | "be" => Ok(Self::Big),
            other => Err(Error::InvalidParameter {
                name: "byte_order".to_string(),
                value: other.to_string(),
            }),
        }
    }
}

/// Convert a temperature to its raw wire integer.
///
/// # Errors
///
/// Returns [`Error::OutOfRange`] for negative or non-finite input, or when
/// the scaled value does not fit in 16 bits.
pub fn to_raw(celsius: f64) -> Result<u16> {
    if !celsius.is_finite() || celsius < 0.0 {
        return Err(Error::OutOfRange { value: celsius });
    }

    let scaled = (celsius * SCALE).round();
    if scaled > f64::from(u16::MAX) {
        return Err(Error::OutOfRange { value: celsius });
    }

    Ok(scaled as u16)
}

/// Convert a raw wire integer to degrees Celsius.
#[inline]
pub fn from_raw(raw: u16) -> f64 {
    f64::from(raw) / SCALE
}

/// Check whether two temperatures are the same setpoint at device resolution.
pub fn same_setpoint(a: f64, b: f64) -> bool {
    (a * SCALE).round() == (b * SCALE).round()
}

/// Encoder/decoder for one device's temperature characteristics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetpointCodec {
    order: ByteOrder,
}

impl SetpointCodec {
    /// Create a codec for the given byte order.
    pub fn new(order: ByteOrder) -> Self {
        Self { order }
    }

    /// The byte order this codec uses.
    pub fn byte_order(&self) -> ByteOrder {
        self.order
    }

    /// Encode a temperature into two wire bytes.
    ///
    /// # Example
    ///
    /// ```
    /// use mug_control_ble::protocol::{ByteOrder, SetpointCodec};
    ///
    /// let codec = SetpointCodec::new(ByteOrder::Little);
    /// assert_eq!(codec.encode(50.0).unwrap(), [0x88, 0x13]);
    /// ```
    pub fn encode(&self, celsius: f64) -> Result<[u8; 2]> {
        let raw = to_raw(celsius)?;
        Ok(match self.order {
            ByteOrder::Little => raw.to_le_bytes(),
            ByteOrder::Big => raw.to_be_bytes(),
        })
    }

    /// Decode two wire bytes into a temperature. Every bit pattern is valid.
    pub fn decode(&self, bytes: [u8; 2]) -> f64 {
        let raw = match self.order {
            ByteOrder::Little => u16::from_le_bytes(bytes),
            ByteOrder::Big => u16::from_be_bytes(bytes),
        };
        from_raw(raw)
    }

    /// Decode a characteristic payload.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidData`] unless the payload is exactly two bytes.
    pub fn decode_slice(&self, data: &[u8]) -> Result<f64> {
        let bytes: [u8; 2] = data.try_into().map_err(|_| Error::InvalidData {
            context: format!("expected 2 temperature bytes, got {}", data.len()),
        })?;
        Ok(self.decode(bytes))
    }
}
