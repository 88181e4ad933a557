//! The hysteresis control loop.
//!
//! Once per period the loop reads the drink temperature, decides whether the
//! mug should heat, and writes the matching setpoint when it differs from the
//! one the device last reported. Transient I/O failures are absorbed here;
//! only persistent faults and a lost session reach the owner.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::capabilities::{Capabilities, CapabilityDescriptor, Role};
use crate::config::{ControllerConfig, HysteresisPolicy};
use crate::error::{Error, Result};
use crate::events::{Operation, SkipReason, StatusEvent};
use crate::protocol::{codec, same_setpoint, SetpointCodec};
use crate::transport::{bounded, GattSession};
use crate::utils::hex_preview;

/// Consecutive failures of one operation before a persistent fault is reported.
pub const PERSISTENT_FAULT_THRESHOLD: u32 = 3;

/// Outcome of a measured-value read.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Reading {
    /// Temperature in °C.
    Value(f64),
    /// The read failed or timed out.
    Unreadable,
}

impl Reading {
    /// The temperature, if one was read.
    pub fn value(&self) -> Option<f64> {
        match self {
            Self::Value(v) => Some(*v),
            Self::Unreadable => None,
        }
    }
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(v) => write!(f, "{:.2}°C", v),
            Self::Unreadable => write!(f, "unreadable"),
        }
    }
}

/// Phase of the control loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlState {
    /// Waiting for the next period.
    Idle,
    /// Reading characteristics.
    Reading,
    /// Applying the policy.
    Deciding,
    /// Writing a new setpoint.
    Writing,
    /// Terminal.
    Stopped,
}

impl fmt::Display for ControlState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Reading => write!(f, "Reading"),
            Self::Deciding => write!(f, "Deciding"),
            Self::Writing => write!(f, "Writing"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

/// What the policy wants for a measured temperature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Below the low threshold: heat.
    Heat,
    /// Above the high threshold: stop heating.
    Off,
    /// Inside the band: keep the previous setpoint.
    Hold,
}

impl HysteresisPolicy {
    /// Decide for a measured temperature.
    ///
    /// ```
    /// use mug_control_ble::{Decision, HysteresisPolicy};
    ///
    /// let policy = HysteresisPolicy::default();
    /// assert_eq!(policy.decide(35.0), Decision::Heat);
    /// assert_eq!(policy.decide(45.0), Decision::Off);
    /// assert_eq!(policy.decide(40.0), Decision::Hold);
    /// ```
    pub fn decide(&self, measured: f64) -> Decision {
        if measured < self.t_low {
            Decision::Heat
        } else if measured > self.t_high {
            Decision::Off
        } else {
            Decision::Hold
        }
    }

    /// The setpoint a decision asks for, given the previous desired setpoint.
    pub fn setpoint_for(&self, decision: Decision, previous: Option<f64>) -> Option<f64> {
        match decision {
            Decision::Heat => Some(self.max_setpoint),
            Decision::Off => Some(self.min_setpoint),
            Decision::Hold => previous,
        }
    }
}

/// Controller state for one session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ControllerState {
    /// Latest measured-value read.
    pub measured: Option<Reading>,
    /// Last setpoint known to be on the device.
    pub device_setpoint: Option<f64>,
    /// Setpoint the controller wants.
    pub desired: Option<f64>,
}

/// Why [`ControlLoop::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// The cancellation token fired.
    Cancelled,
    /// The transport reported the session gone.
    SessionLost,
}

/// Summary of one iteration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IterationReport {
    /// The measured read, if the Measured role is usable.
    pub reading: Option<Reading>,
    /// The policy decision, if a temperature was read.
    pub decision: Option<Decision>,
    /// The setpoint written, if any.
    pub written: Option<f64>,
}

#[derive(Debug, Default)]
struct Streak {
    key: Option<u16>,
    count: u32,
}

/// Consecutive-failure counters per operation.
#[derive(Debug, Default)]
struct FaultTracker {
    streaks: HashMap<Operation, Streak>,
}

impl FaultTracker {
    /// Record a failure. Returns true when the streak reaches the threshold.
    ///
    /// A different `key` starts a new streak.
    fn failure(&mut self, operation: Operation, key: Option<u16>) -> bool {
        let streak = self.streaks.entry(operation).or_default();
        if streak.key != key {
            streak.key = key;
            streak.count = 0;
        }
        streak.count += 1;
        streak.count == PERSISTENT_FAULT_THRESHOLD
    }

    fn success(&mut self, operation: Operation) {
        self.streaks.remove(&operation);
    }
}

/// Write a setpoint through a resolved descriptor.
///
/// Uses an acknowledged write when the characteristic supports one.
///
/// # Errors
///
/// Returns [`Error::OutOfRange`] if the value cannot be encoded and
/// [`Error::WriteFailed`] if the characteristic is not writable, or
/// propagates the transport error.
pub async fn write_setpoint<S>(
    session: &S,
    descriptor: &CapabilityDescriptor,
    codec: &SetpointCodec,
    celsius: f64,
) -> Result<()>
where
    S: GattSession + ?Sized,
{
    let bytes = codec.encode(celsius)?;
    let acknowledged = descriptor
        .preferred_write()
        .ok_or_else(|| Error::WriteFailed {
            characteristic: descriptor.characteristic.to_string(),
            reason: "characteristic is not writable".to_string(),
        })?;

    trace!(
        "Writing setpoint {:.2}°C as [{}] (ack={})",
        celsius,
        hex_preview(&bytes, 2),
        acknowledged
    );
    session
        .write(&descriptor.characteristic, &bytes, acknowledged)
        .await
}

/// The control loop for one session.
///
/// Borrows the session; the owner connects and disconnects it.
pub struct ControlLoop<'a, S: GattSession + ?Sized> {
    /// Connected session.
    session: &'a S,
    /// Roles resolved for this session.
    capabilities: Capabilities,
    /// Session byte order.
    codec: SetpointCodec,
    /// Thresholds and setpoints.
    policy: HysteresisPolicy,
    /// Iteration period.
    period: Duration,
    /// Bound on each read or write.
    io_timeout: Duration,
    /// Status channel.
    events: broadcast::Sender<StatusEvent>,
    /// Controller state.
    state: ControllerState,
    /// Current phase.
    phase: ControlState,
    /// Failure streaks.
    faults: FaultTracker,
    /// Roles already reported as degraded.
    degraded: BTreeSet<Role>,
    /// Desired raw value a skip was last reported for.
    skipped: Option<u16>,
    /// Persistent faults reported so far.
    persistent_faults: usize,
}

impl<'a, S: GattSession + ?Sized> ControlLoop<'a, S> {
    /// Create a loop with fresh state.
    pub fn new(
        session: &'a S,
        capabilities: Capabilities,
        codec: SetpointCodec,
        config: &ControllerConfig,
        events: broadcast::Sender<StatusEvent>,
    ) -> Self {
        Self {
            session,
            capabilities,
            codec,
            policy: config.policy,
            period: config.control_period,
            io_timeout: config.io_timeout,
            events,
            state: ControllerState::default(),
            phase: ControlState::Idle,
            faults: FaultTracker::default(),
            degraded: BTreeSet::new(),
            skipped: None,
            persistent_faults: 0,
        }
    }

    /// Current controller state.
    pub fn state(&self) -> &ControllerState {
        &self.state
    }

    /// Current phase.
    pub fn phase(&self) -> ControlState {
        self.phase
    }

    /// Number of persistent faults reported this session.
    pub fn persistent_faults(&self) -> usize {
        self.persistent_faults
    }

    /// Run iterations until cancelled or the session is lost.
    pub async fn run(&mut self, cancel: &CancellationToken) -> LoopExit {
        info!(
            "Control loop started (period {:?}, {} endian)",
            self.period,
            self.codec.byte_order()
        );

        let exit = loop {
            let iteration = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                result = self.iterate() => Some(result),
            };

            match iteration {
                None => break LoopExit::Cancelled,
                Some(Err(e)) => {
                    warn!("Session lost: {}", e);
                    break LoopExit::SessionLost;
                }
                Some(Ok(_)) => {}
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break LoopExit::Cancelled,
                _ = tokio::time::sleep(self.period) => {}
            }
        };

        self.phase = ControlState::Stopped;
        info!("Control loop stopped: {:?}", exit);
        exit
    }

    /// Run one read, decide, write cycle.
    ///
    /// # Errors
    ///
    /// Only errors that end the session are returned; everything else is
    /// absorbed and reported through the status channel.
    pub async fn iterate(&mut self) -> Result<IterationReport> {
        let mut report = IterationReport::default();
        self.degrade_unusable_roles();

        self.phase = ControlState::Reading;
        report.reading = self.read_measured().await?;
        self.read_device_setpoint().await?;

        self.phase = ControlState::Deciding;
        if let Some(measured) = report.reading.and_then(|r| r.value()) {
            let decision = self.policy.decide(measured);
            self.state.desired = self.policy.setpoint_for(decision, self.state.desired);
            debug!(
                "Measured {:.2}°C -> {:?} (desired {:?})",
                measured, decision, self.state.desired
            );
            report.decision = Some(decision);
        }

        if let Some(desired) = self.state.desired {
            let current = self.state.device_setpoint;
            if !current.is_some_and(|c| same_setpoint(c, desired)) {
                self.phase = ControlState::Writing;
                if self.apply_setpoint(desired).await? {
                    report.written = Some(desired);
                }
            }
        }

        self.phase = ControlState::Idle;
        Ok(report)
    }

    async fn read_measured(&mut self) -> Result<Option<Reading>> {
        let descriptor = match self.capabilities.measured() {
            Some(d) if d.supports_read => *d,
            _ => {
                self.degrade(Role::Measured);
                return Ok(None);
            }
        };

        let reading = match self.read_value(&descriptor).await {
            Ok(value) => {
                self.faults.success(Operation::ReadMeasured);
                Reading::Value(value)
            }
            Err(e) if e.is_session_loss() => return Err(e),
            Err(e) => {
                warn!("Measured read failed: {}", e);
                self.fault(Operation::ReadMeasured, None);
                Reading::Unreadable
            }
        };

        self.state.measured = Some(reading);
        self.emit(StatusEvent::MeasuredRead(reading));
        Ok(Some(reading))
    }

    async fn read_device_setpoint(&mut self) -> Result<()> {
        let descriptor = match self.capabilities.setpoint() {
            Some(d) if d.supports_read => *d,
            _ => return Ok(()),
        };

        match self.read_value(&descriptor).await {
            Ok(value) => {
                self.faults.success(Operation::ReadSetpoint);
                if let Some(known) = self.state.device_setpoint {
                    if !same_setpoint(known, value) {
                        debug!("Device setpoint drifted from {:.2} to {:.2}°C", known, value);
                    }
                }
                self.state.device_setpoint = Some(value);
            }
            Err(e) if e.is_session_loss() => return Err(e),
            Err(e) => {
                warn!("Setpoint read failed, using last known value: {}", e);
                self.fault(Operation::ReadSetpoint, None);
            }
        }
        Ok(())
    }

    async fn read_value(&self, descriptor: &CapabilityDescriptor) -> Result<f64> {
        let bytes = bounded(self.io_timeout, self.session.read(&descriptor.characteristic)).await?;
        trace!(
            "Read [{}] from {}",
            hex_preview(&bytes, 8),
            descriptor.characteristic
        );
        self.codec.decode_slice(&bytes)
    }

    /// Returns true if the setpoint was written.
    async fn apply_setpoint(&mut self, desired: f64) -> Result<bool> {
        let descriptor = match self.capabilities.setpoint() {
            Some(d) => *d,
            None => {
                self.degrade(Role::Setpoint);
                return Ok(false);
            }
        };

        let key = match codec::to_raw(desired) {
            Ok(raw) => raw,
            Err(_) => {
                self.skip(SkipReason::OutOfRange(desired), None);
                return Ok(false);
            }
        };

        if !descriptor.is_writable() {
            self.degrade(Role::Setpoint);
            self.skip(SkipReason::NotWritable, Some(key));
            return Ok(false);
        }

        let result = bounded(
            self.io_timeout,
            write_setpoint(self.session, &descriptor, &self.codec, desired),
        )
        .await;

        match result {
            Ok(()) => {
                let from = self.state.device_setpoint.replace(desired);
                info!(
                    "Setpoint changed: {} -> {:.2}°C",
                    from.map_or_else(|| "unknown".to_string(), |v| format!("{:.2}°C", v)),
                    desired
                );
                self.faults.success(Operation::WriteSetpoint);
                self.skipped = None;
                self.emit(StatusEvent::SetpointChanged { from, to: desired });
                Ok(true)
            }
            Err(e) if e.is_session_loss() => Err(e),
            Err(e) => {
                warn!("Setpoint write of {:.2}°C failed: {}", desired, e);
                self.fault(Operation::WriteSetpoint, Some(key));
                Ok(false)
            }
        }
    }

    fn fault(&mut self, operation: Operation, key: Option<u16>) {
        if self.faults.failure(operation, key) {
            warn!(
                "{} failed {} times in a row",
                operation, PERSISTENT_FAULT_THRESHOLD
            );
            self.persistent_faults += 1;
            self.emit(StatusEvent::PersistentFault(operation));
        }
    }

    /// Report roles this session cannot use, whether or not a write is due.
    fn degrade_unusable_roles(&mut self) {
        for role in Role::ALL {
            let usable = match (role, self.capabilities.get(role)) {
                (_, None) => false,
                (Role::Measured, Some(d)) => d.supports_read,
                (Role::Setpoint, Some(d)) => d.is_writable(),
            };
            if !usable {
                self.degrade(role);
            }
        }
    }

    fn degrade(&mut self, role: Role) {
        if self.degraded.insert(role) {
            warn!("{} capability unavailable for this session", role);
            self.emit(StatusEvent::DegradedCapability(role));
        }
    }

    fn skip(&mut self, reason: SkipReason, key: Option<u16>) {
        if key.is_none() || self.skipped != key {
            self.skipped = key;
            debug!("Skipping setpoint write: {}", reason);
            self.emit(StatusEvent::WriteSkipped(reason));
        }
    }

    fn emit(&self, event: StatusEvent) {
        let _ = self.events.send(event);
    }
}
