//! Error types for the mug-control-ble crate.

use thiserror::Error;

/// The main error type for this crate.
#[derive(Error, Debug)]
pub enum Error {
    /// Bluetooth-related error from the underlying BLE library.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// Bluetooth is not available or is disabled on this system.
    #[error("Bluetooth not available or disabled")]
    BluetoothUnavailable,

    /// A scan could not be started or was interrupted.
    ///
    /// Recoverable: discovery retries on the next scan period.
    #[error("Discovery failed: {reason}")]
    Discovery {
        /// Description of why the scan failed.
        reason: String,
    },

    /// Failed to establish a connection to the peripheral.
    #[error("Connection failed: {reason}")]
    ConnectFailed {
        /// Description of why the connection failed.
        reason: String,
    },

    /// The connection to the peripheral was lost.
    #[error("Connection lost")]
    ConnectionLost,

    /// Operation requires a connection but the peripheral is not connected.
    #[error("Peripheral not connected")]
    NotConnected,

    /// A session was used after it was disconnected.
    #[error("Session already closed")]
    SessionClosed,

    /// Reading a characteristic failed.
    #[error("Read from {characteristic} failed: {reason}")]
    ReadFailed {
        /// The characteristic that was read.
        characteristic: String,
        /// Description of the failure.
        reason: String,
    },

    /// Writing a characteristic failed.
    #[error("Write to {characteristic} failed: {reason}")]
    WriteFailed {
        /// The characteristic that was written.
        characteristic: String,
        /// Description of the failure.
        reason: String,
    },

    /// A temperature cannot be represented on the wire.
    #[error("Value out of range: {value}")]
    OutOfRange {
        /// The rejected value.
        value: f64,
    },

    /// Invalid data was received from the peripheral.
    #[error("Invalid data received: {context}")]
    InvalidData {
        /// Description of what was invalid about the data.
        context: String,
    },

    /// An invalid parameter was provided.
    #[error("Invalid parameter: {name} = {value}")]
    InvalidParameter {
        /// The name of the parameter.
        name: String,
        /// The invalid value that was provided.
        value: String,
    },

    /// Characteristic not found on the device.
    #[error("Characteristic not found: {uuid}")]
    CharacteristicNotFound {
        /// The UUID of the characteristic that was not found.
        uuid: String,
    },

    /// A transport operation did not complete in time.
    #[error("Operation timed out")]
    Timeout,

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether this error means the session can no longer be used.
    ///
    /// Everything else is treated as transient by the control loop.
    pub fn is_session_loss(&self) -> bool {
        matches!(
            self,
            Self::ConnectionLost | Self::NotConnected | Self::SessionClosed
        )
    }
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
