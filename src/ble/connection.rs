//! BLE connection management.
//!
//! [`BleSession`] is the `btleplug` implementation of
//! [`GattSession`](crate::transport::GattSession): it tracks connection state,
//! owns the characteristic cache and turns platform errors into the
//! controller's error taxonomy.

use async_trait::async_trait;
use btleplug::api::Peripheral as _;
use btleplug::platform::Peripheral;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::ble::characteristics::CharacteristicHandler;
use crate::error::{Error, Result};
use crate::transport::{CharacteristicId, CharacteristicInfo, GattSession};

/// Connection state for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// Not connected to the peripheral.
    #[default]
    Disconnected,
    /// Currently attempting to connect.
    Connecting,
    /// Connected to the peripheral.
    Connected,
    /// Currently disconnecting.
    Disconnecting,
}

impl ConnectionState {
    /// Check if connected.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Check if in a transitional state.
    pub fn is_transitioning(&self) -> bool {
        matches!(self, Self::Connecting | Self::Disconnecting)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Disconnecting => write!(f, "Disconnecting"),
        }
    }
}

/// A live GATT session with one peripheral.
pub struct BleSession {
    /// Peripheral identifier, for logging.
    identifier: String,
    /// The connected peripheral.
    peripheral: Peripheral,
    /// Current connection state.
    state: Arc<RwLock<ConnectionState>>,
    /// Characteristic cache.
    characteristics: CharacteristicHandler,
    /// Set once [`GattSession::disconnect`] has been called.
    closed: AtomicBool,
}

impl BleSession {
    /// Connect to a peripheral and discover its services.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectFailed`] if the platform connect or service
    /// discovery fails.
    pub async fn connect(identifier: String, peripheral: Peripheral) -> Result<Self> {
        let session = Self {
            identifier,
            characteristics: CharacteristicHandler::new(peripheral.clone()),
            peripheral,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            closed: AtomicBool::new(false),
        };

        session.set_state(ConnectionState::Connecting);

        let connected = async {
            if !session.peripheral.is_connected().await.unwrap_or(false) {
                session.peripheral.connect().await?;
            } else {
                info!("Peripheral already connected at BLE level");
            }
            session.peripheral.discover_services().await
        }
        .await;

        if let Err(e) = connected {
            warn!("Connection to {} failed: {}", session.identifier, e);
            // Leave the link down in case the connect half-succeeded.
            let _ = session.peripheral.disconnect().await;
            session.set_state(ConnectionState::Disconnected);
            return Err(Error::ConnectFailed {
                reason: e.to_string(),
            });
        }

        info!("Successfully connected to {}", session.identifier);
        session.set_state(ConnectionState::Connected);

        Ok(session)
    }

    /// Get the current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Get the peripheral identifier.
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Get the peripheral.
    pub fn peripheral(&self) -> &Peripheral {
        &self.peripheral
    }

    fn ensure_open(&self) -> Result<()> {
        let state = self.state();
        match unavailable(state, self.closed.load(Ordering::Acquire)) {
            None => Ok(()),
            Some(Error::SessionClosed) => {
                error!(
                    "Session with {} used while {}; this is a sequencing bug",
                    self.identifier, state
                );
                Err(Error::SessionClosed)
            }
            Some(err) => {
                warn!("{} is {}", self.identifier, state);
                Err(err)
            }
        }
    }

    /// Classify a failed operation: a dropped link ends the session,
    /// anything else is reported through `transient`.
    async fn classify(&self, err: Error, transient: impl FnOnce(String) -> Error) -> Error {
        if matches!(err, Error::Bluetooth(_))
            && !self.peripheral.is_connected().await.unwrap_or(false)
        {
            warn!("Lost connection to {}", self.identifier);
            self.set_state(ConnectionState::Disconnected);
            return Error::ConnectionLost;
        }

        match err {
            Error::Bluetooth(e) => transient(e.to_string()),
            other => other,
        }
    }

    /// Update the connection state.
    fn set_state(&self, new_state: ConnectionState) {
        let old_state = std::mem::replace(&mut *self.state.write(), new_state);

        if old_state != new_state {
            debug!(
                "Connection state of {} changed: {} -> {}",
                self.identifier, old_state, new_state
            );
        }
    }
}

/// Why an operation cannot run in `state`, if it cannot.
///
/// A session closed by its owner is [`Error::SessionClosed`]; one whose link
/// dropped underneath it is [`Error::NotConnected`].
fn unavailable(state: ConnectionState, closed: bool) -> Option<Error> {
    match state {
        ConnectionState::Connected if !closed => None,
        _ if closed => Some(Error::SessionClosed),
        _ => Some(Error::NotConnected),
    }
}

#[async_trait]
impl GattSession for BleSession {
    async fn enumerate(&self) -> Result<Vec<CharacteristicInfo>> {
        self.ensure_open()?;
        Ok(self.characteristics.discover_characteristics())
    }

    async fn read(&self, characteristic: &CharacteristicId) -> Result<Vec<u8>> {
        self.ensure_open()?;

        match self.characteristics.read(&characteristic.uuid()).await {
            Ok(data) => Ok(data),
            Err(e) => Err(self
                .classify(e, |reason| Error::ReadFailed {
                    characteristic: characteristic.to_string(),
                    reason,
                })
                .await),
        }
    }

    async fn write(
        &self,
        characteristic: &CharacteristicId,
        data: &[u8],
        acknowledged: bool,
    ) -> Result<()> {
        self.ensure_open()?;

        match self
            .characteristics
            .write(&characteristic.uuid(), data, acknowledged)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) => Err(self
                .classify(e, |reason| Error::WriteFailed {
                    characteristic: characteristic.to_string(),
                    reason,
                })
                .await),
        }
    }

    async fn disconnect(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        let current_state = self.state();

        if matches!(
            current_state,
            ConnectionState::Disconnected | ConnectionState::Disconnecting
        ) && !self.peripheral.is_connected().await.unwrap_or(false)
        {
            debug!("{} already disconnected", self.identifier);
            self.set_state(ConnectionState::Disconnected);
            return Ok(());
        }

        self.set_state(ConnectionState::Disconnecting);

        let result = self.peripheral.disconnect().await;
        self.set_state(ConnectionState::Disconnected);

        match result {
            Ok(()) => {
                info!("Successfully disconnected from {}", self.identifier);
                Ok(())
            }
            Err(e) => {
                error!("Failed to disconnect from {}: {}", self.identifier, e);
                Err(Error::Bluetooth(e))
            }
        }
    }
}
