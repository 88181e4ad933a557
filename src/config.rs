//! Controller configuration.
//!
//! Every recognised option lives on [`ControllerConfig`]. Defaults follow the
//! behaviour of the stock mug tools: scan every 5 seconds, give a connection
//! 10 seconds, run the loop every 3 seconds and keep the drink at 40°C by
//! toggling the setpoint between 0°C and 50°C.

use std::time::Duration;

use crate::capabilities::RoleHints;
use crate::error::{Error, Result};
use crate::protocol::{codec, ByteOrder};

/// Hysteresis thresholds and the two setpoints the controller switches between.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct HysteresisPolicy {
    /// Below this measured temperature the controller heats.
    pub t_low: f64,
    /// Above this measured temperature the controller stops heating.
    pub t_high: f64,
    /// Setpoint written when heating is off.
    pub min_setpoint: f64,
    /// Setpoint written when heating is on.
    pub max_setpoint: f64,
}

impl Default for HysteresisPolicy {
    fn default() -> Self {
        Self {
            t_low: 40.0,
            t_high: 40.0,
            min_setpoint: 0.0,
            max_setpoint: 50.0,
        }
    }
}

/// Full controller configuration.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ControllerConfig {
    /// Peripheral identifier to look for, if known up front.
    pub target: Option<String>,
    /// Length of one scan.
    pub scan_period: Duration,
    /// Pause between a finished (or failed) scan and the next.
    pub rescan_delay: Duration,
    /// Upper bound on a connection attempt.
    pub connect_timeout: Duration,
    /// Control loop period.
    pub control_period: Duration,
    /// Upper bound on a single characteristic read or write.
    pub io_timeout: Duration,
    /// Hysteresis thresholds and setpoints.
    pub policy: HysteresisPolicy,
    /// Byte order of the temperature words. `None` means undetermined.
    pub byte_order: Option<ByteOrder>,
    /// Probe the byte order with a write-then-read-back when undetermined.
    pub calibrate_byte_order: bool,
    /// Characteristic UUIDs for each role.
    pub role_hints: RoleHints,
}

impl ControllerConfig {
    /// Byte order assumed when it is neither configured nor calibrated.
    pub const FALLBACK_BYTE_ORDER: ByteOrder = ByteOrder::Little;

    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the peripheral identifier to look for.
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// Set the hysteresis policy.
    pub fn with_policy(mut self, policy: HysteresisPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Fix the byte order, disabling calibration.
    pub fn with_byte_order(mut self, order: ByteOrder) -> Self {
        self.byte_order = Some(order);
        self
    }

    /// Set the control loop period.
    pub fn with_control_period(mut self, period: Duration) -> Self {
        self.control_period = period;
        self
    }

    /// Set the scan period and the pause between scans.
    pub fn with_scan_timing(mut self, scan_period: Duration, rescan_delay: Duration) -> Self {
        self.scan_period = scan_period;
        self.rescan_delay = rescan_delay;
        self
    }

    /// Set the connection and I/O timeouts.
    pub fn with_timeouts(mut self, connect: Duration, io: Duration) -> Self {
        self.connect_timeout = connect;
        self.io_timeout = io;
        self
    }

    /// Set the characteristic UUIDs for each role.
    pub fn with_role_hints(mut self, hints: RoleHints) -> Self {
        self.role_hints = hints;
        self
    }

    /// Check the configuration for values the controller cannot honour.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParameter`] naming the first offending option.
    pub fn validate(&self) -> Result<()> {
        let policy = &self.policy;

        if !(policy.t_low.is_finite() && policy.t_high.is_finite()) || policy.t_low > policy.t_high
        {
            return Err(invalid(
                "t_low",
                format!("{} (t_high = {})", policy.t_low, policy.t_high),
            ));
        }

        for (name, value) in [
            ("min_setpoint", policy.min_setpoint),
            ("max_setpoint", policy.max_setpoint),
        ] {
            if codec::to_raw(value).is_err() {
                return Err(invalid(name, value.to_string()));
            }
        }

        if policy.min_setpoint > policy.max_setpoint {
            return Err(invalid(
                "min_setpoint",
                format!("{} (max_setpoint = {})", policy.min_setpoint, policy.max_setpoint),
            ));
        }

        for (name, value) in [
            ("scan_period", self.scan_period),
            ("connect_timeout", self.connect_timeout),
            ("control_period", self.control_period),
            ("io_timeout", self.io_timeout),
        ] {
            if value.is_zero() {
                return Err(invalid(name, format!("{:?}", value)));
            }
        }

        Ok(())
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            target: None,
            scan_period: Duration::from_secs(5),
            rescan_delay: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(10),
            control_period: Duration::from_secs(3),
            io_timeout: Duration::from_secs(2),
            policy: HysteresisPolicy::default(),
            byte_order: None,
            calibrate_byte_order: true,
            role_hints: RoleHints::default(),
        }
    }
}

fn invalid(name: &str, value: String) -> Error {
    Error::InvalidParameter {
        name: name.to_string(),
        value,
    }
}
