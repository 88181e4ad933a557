//! Status events emitted to whoever presents the controller.
//!
//! The control loop and the session supervisor publish [`StatusEvent`]s on a
//! `tokio::sync::broadcast` channel. This is the only UI-facing contract of
//! the core; terminal dashboards and log sinks subscribe to it.

use std::fmt;

use crate::capabilities::{ByteOrderResolution, Role};
use crate::control::Reading;
use crate::supervisor::SessionOutcome;

/// Capacity of the status channel.
pub const STATUS_CHANNEL_CAPACITY: usize = 64;

/// Why a needed setpoint write did not happen.
#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    /// The setpoint characteristic offers no write modality.
    NotWritable,
    /// The desired setpoint cannot be encoded.
    OutOfRange(f64),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotWritable => write!(f, "setpoint characteristic is not writable"),
            Self::OutOfRange(value) => write!(f, "{:.2}°C cannot be encoded", value),
        }
    }
}

/// Operation tracked for persistent-fault escalation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Reading the measured temperature.
    ReadMeasured,
    /// Reading the device's current setpoint.
    ReadSetpoint,
    /// Writing a new setpoint.
    WriteSetpoint,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadMeasured => write!(f, "read measured"),
            Self::ReadSetpoint => write!(f, "read setpoint"),
            Self::WriteSetpoint => write!(f, "write setpoint"),
        }
    }
}

/// A discrete controller status update.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusEvent {
    /// A session was established with the peripheral.
    Connected {
        /// Peripheral identifier.
        identifier: String,
    },
    /// Roles were resolved for the session.
    CapabilitiesResolved {
        /// Resolved roles.
        roles: Vec<Role>,
    },
    /// The session's byte order was decided.
    ByteOrderResolved(ByteOrderResolution),
    /// Result of this iteration's measured-value read.
    MeasuredRead(Reading),
    /// A new setpoint was written.
    SetpointChanged {
        /// Last known device setpoint before the write.
        from: Option<f64>,
        /// The setpoint written.
        to: f64,
    },
    /// A write was needed but not performed.
    WriteSkipped(SkipReason),
    /// A role is missing or unusable for the rest of the session.
    DegradedCapability(Role),
    /// An operation failed three times in a row.
    PersistentFault(Operation),
    /// The session is over.
    SessionEnded(SessionOutcome),
}
