//! Session supervision.
//!
//! [`SessionSupervisor::run`] owns one connection from connect to
//! disconnect: it resolves capabilities, settles the byte order, drives the
//! control loop and always disconnects a session it managed to open.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::capabilities::{resolve, resolve_byte_order};
use crate::config::ControllerConfig;
use crate::control::{ControlLoop, LoopExit};
use crate::error::Result;
use crate::events::{StatusEvent, STATUS_CHANNEL_CAPACITY};
use crate::protocol::SetpointCodec;
use crate::transport::{bounded, GattSession, Transport};

/// How a supervised session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SessionOutcome {
    /// No session was opened.
    ConnectFailed {
        /// Why the connection failed.
        reason: String,
    },
    /// The peripheral exposes neither role.
    NoUsableCharacteristics,
    /// The cancellation token fired.
    Cancelled,
    /// The transport lost the session.
    ConnectionLost,
    /// The session could not be set up.
    Failed {
        /// What went wrong.
        reason: String,
    },
}

impl fmt::Display for SessionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectFailed { reason } => write!(f, "connect failed: {}", reason),
            Self::NoUsableCharacteristics => write!(f, "no usable characteristics"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::ConnectionLost => write!(f, "connection lost"),
            Self::Failed { reason } => write!(f, "failed: {}", reason),
        }
    }
}

/// Clears the active flag when a run ends, however it ends.
struct ActiveGuard<'a>(&'a AtomicBool);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Runs controller sessions against one transport, one at a time.
pub struct SessionSupervisor<T: Transport> {
    /// BLE stack.
    transport: Arc<T>,
    /// Validated configuration.
    config: ControllerConfig,
    /// Status channel.
    events: broadcast::Sender<StatusEvent>,
    /// Whether a session is running.
    active: AtomicBool,
}

impl<T: Transport> SessionSupervisor<T> {
    /// Create a supervisor.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InvalidParameter`] if the configuration does
    /// not validate.
    pub fn new(transport: Arc<T>, config: ControllerConfig) -> Result<Self> {
        config.validate()?;
        let (events, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);

        Ok(Self {
            transport,
            config,
            events,
            active: AtomicBool::new(false),
        })
    }

    /// Subscribe to status events.
    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.events.subscribe()
    }

    /// The configuration in use.
    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Whether a session is running.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Connect to `identifier` and control it until cancelled or lost.
    ///
    /// A session that was opened is disconnected exactly once before this
    /// returns, provided the run ends through `cancel` rather than by
    /// dropping the future. Only one run may be active at a time; a
    /// concurrent call returns [`SessionOutcome::Failed`] without touching
    /// the transport.
    pub async fn run(&self, identifier: &str, cancel: &CancellationToken) -> SessionOutcome {
        if self
            .active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            error!("Refusing to start a second session for {}", identifier);
            return SessionOutcome::Failed {
                reason: "a session is already active".to_string(),
            };
        }
        let _guard = ActiveGuard(&self.active);

        let outcome = self.run_inner(identifier, cancel).await;

        info!("Session with {} ended: {}", identifier, outcome);
        let _ = self.events.send(StatusEvent::SessionEnded(outcome.clone()));
        outcome
    }

    async fn run_inner(&self, identifier: &str, cancel: &CancellationToken) -> SessionOutcome {
        let connected = tokio::select! {
            biased;
            _ = cancel.cancelled() => return SessionOutcome::Cancelled,
            result = self.transport.connect(identifier, self.config.connect_timeout) => result,
        };

        let session = match connected {
            Ok(session) => session,
            Err(e) => {
                warn!("Could not connect to {}: {}", identifier, e);
                return SessionOutcome::ConnectFailed {
                    reason: e.to_string(),
                };
            }
        };

        info!("Connected to {}", identifier);
        let _ = self.events.send(StatusEvent::Connected {
            identifier: identifier.to_string(),
        });

        let outcome = self.drive(&session, cancel).await;

        if let Err(e) = session.disconnect().await {
            warn!("Error disconnecting {}: {}", identifier, e);
        }
        outcome
    }

    async fn drive(&self, session: &T::Session, cancel: &CancellationToken) -> SessionOutcome {
        let resolved = tokio::select! {
            biased;
            _ = cancel.cancelled() => return SessionOutcome::Cancelled,
            result = bounded(self.config.io_timeout, resolve(session, &self.config.role_hints)) => result,
        };

        let capabilities = match resolved {
            Ok(capabilities) => capabilities,
            Err(e) if e.is_session_loss() => return SessionOutcome::ConnectionLost,
            Err(e) => {
                return SessionOutcome::Failed {
                    reason: format!("capability probing failed: {}", e),
                }
            }
        };

        let _ = self.events.send(StatusEvent::CapabilitiesResolved {
            roles: capabilities.roles(),
        });
        if capabilities.is_empty() {
            warn!("Peripheral exposes no usable characteristics");
            return SessionOutcome::NoUsableCharacteristics;
        }

        // Not raced against `cancel`: calibration restores the setpoint it overwrote.
        let resolution = resolve_byte_order(session, &capabilities, &self.config).await;
        if cancel.is_cancelled() {
            info!("Cancelled during byte order resolution");
            return SessionOutcome::Cancelled;
        }
        info!(
            "Using {} endian temperatures ({:?})",
            resolution.order, resolution.source
        );
        let _ = self.events.send(StatusEvent::ByteOrderResolved(resolution));

        let mut control = ControlLoop::new(
            session,
            capabilities,
            SetpointCodec::new(resolution.order),
            &self.config,
            self.events.clone(),
        );

        match control.run(cancel).await {
            LoopExit::Cancelled => SessionOutcome::Cancelled,
            LoopExit::SessionLost => SessionOutcome::ConnectionLost,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{ByteOrderSource, Role};
    use crate::protocol::ByteOrder;
    use crate::testing::{characteristic, FakeSession, FakeTransport};
    use crate::transport::CharacteristicProperties;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn config() -> ControllerConfig {
        ControllerConfig::default()
            .with_control_period(Duration::from_millis(10))
            .with_timeouts(Duration::from_millis(200), Duration::from_millis(50))
    }

    fn supervisor(transport: FakeTransport) -> (Arc<FakeTransport>, SessionSupervisor<FakeTransport>) {
        let transport = Arc::new(transport);
        let supervisor = SessionSupervisor::new(transport.clone(), config()).unwrap();
        (transport, supervisor)
    }

    fn cancel_after(millis: u64) -> CancellationToken {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(millis)).await;
            trigger.cancel();
        });
        cancel
    }

    #[test]
    fn test_invalid_config_rejected() {
        let transport = Arc::new(FakeTransport::new());
        let config = config().with_control_period(Duration::ZERO);
        assert!(SessionSupervisor::new(transport, config).is_err());
    }

    #[tokio::test]
    async fn test_connect_failure_does_not_disconnect() {
        let session = FakeSession::mug(ByteOrder::Little);
        let transport = FakeTransport::with_session(session.clone());
        transport.fail_connect("peripheral out of range");
        let (_, supervisor) = supervisor(transport);
        let mut rx = supervisor.subscribe();

        let outcome = supervisor.run("AA", &CancellationToken::new()).await;

        assert_eq!(
            outcome,
            SessionOutcome::ConnectFailed {
                reason: "Connection failed: peripheral out of range".to_string()
            }
        );
        assert_eq!(session.disconnects(), 0);
        assert_eq!(rx.try_recv().unwrap(), StatusEvent::SessionEnded(outcome));
        assert!(!supervisor.is_active());
    }

    #[tokio::test]
    async fn test_connection_lost_disconnects_once() {
        let session = FakeSession::mug(ByteOrder::Little);
        session.set_measured(35.0);
        session.lose_connection_after_reads(6);
        let (transport, supervisor) = supervisor(FakeTransport::with_session(session.clone()));

        let outcome = supervisor.run("AA", &CancellationToken::new()).await;

        assert_eq!(outcome, SessionOutcome::ConnectionLost);
        assert_eq!(session.disconnects(), 1);
        assert_eq!(transport.connects(), 1);
    }

    #[tokio::test]
    async fn test_no_usable_characteristics() {
        let session = FakeSession::with_characteristics(
            ByteOrder::Little,
            vec![characteristic(
                uuid::Uuid::from_u128(0x2a19),
                CharacteristicProperties::ALL,
            )],
        );
        let (_, supervisor) = supervisor(FakeTransport::with_session(session.clone()));

        let outcome = supervisor.run("AA", &CancellationToken::new()).await;

        assert_eq!(outcome, SessionOutcome::NoUsableCharacteristics);
        assert_eq!(session.disconnects(), 1);
    }

    #[tokio::test]
    async fn test_cancel_disconnects_once() {
        let session = FakeSession::mug(ByteOrder::Big);
        session.set_measured(35.0);
        let (_, supervisor) = supervisor(FakeTransport::with_session(session.clone()));
        let mut rx = supervisor.subscribe();

        let outcome = supervisor.run("AA", &cancel_after(100)).await;

        assert_eq!(outcome, SessionOutcome::Cancelled);
        assert_eq!(session.disconnects(), 1);
        assert!((session.device_setpoint() - 50.0).abs() < 1e-9);

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert_eq!(
            events[0],
            StatusEvent::Connected {
                identifier: "AA".to_string()
            }
        );
        assert_eq!(
            events[1],
            StatusEvent::CapabilitiesResolved {
                roles: vec![Role::Measured, Role::Setpoint]
            }
        );
        assert!(matches!(
            events[2],
            StatusEvent::ByteOrderResolved(resolution)
                if resolution.order == ByteOrder::Big
                    && resolution.source == ByteOrderSource::Calibrated
        ));
        assert_eq!(
            events.last(),
            Some(&StatusEvent::SessionEnded(SessionOutcome::Cancelled))
        );
    }

    #[tokio::test]
    async fn test_cancel_during_calibration_restores_setpoint() {
        let session = FakeSession::mug(ByteOrder::Little);
        session.set_device_setpoint(20.0);
        session.set_read_delay(Duration::from_millis(40));
        let transport = Arc::new(FakeTransport::with_session(session.clone()));
        let config = config().with_timeouts(Duration::from_millis(200), Duration::from_millis(500));
        let supervisor = SessionSupervisor::new(transport, config).unwrap();
        let mut rx = supervisor.subscribe();

        // Fires between the calibration write and its read-back.
        let outcome = supervisor.run("AA", &cancel_after(60)).await;

        assert_eq!(outcome, SessionOutcome::Cancelled);
        assert_eq!(session.disconnects(), 1);
        assert!((session.device_setpoint() - 20.0).abs() < 1e-9);
        assert_eq!(session.written_setpoints().last().copied(), Some(20.0));

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert!(!events
            .iter()
            .any(|e| matches!(e, StatusEvent::ByteOrderResolved(_))));
    }

    #[tokio::test]
    async fn test_cancel_during_connect() {
        let session = FakeSession::mug(ByteOrder::Little);
        let transport = FakeTransport::with_session(session.clone());
        transport.set_connect_delay(Duration::from_secs(60));
        let (_, supervisor) = supervisor(transport);

        let outcome = supervisor.run("AA", &cancel_after(20)).await;

        assert_eq!(outcome, SessionOutcome::Cancelled);
        assert_eq!(session.disconnects(), 0);
    }

    #[tokio::test]
    async fn test_single_active_session() {
        let session = FakeSession::mug(ByteOrder::Little);
        let transport = FakeTransport::with_session(session.clone());
        transport.set_connect_delay(Duration::from_millis(50));
        let (transport, supervisor) = supervisor(transport);
        let cancel = CancellationToken::new();

        let (first, second) = tokio::join!(supervisor.run("AA", &cancel), async {
            let outcome = supervisor.run("AA", &cancel).await;
            cancel.cancel();
            outcome
        });

        assert!(matches!(second, SessionOutcome::Failed { .. }));
        assert_eq!(first, SessionOutcome::Cancelled);
        assert_eq!(transport.connects(), 1);
        assert_eq!(session.disconnects(), 0);
        assert!(!supervisor.is_active());
    }
}
