//! Transport seam between the controller core and a BLE stack.
//!
//! The core never talks to a radio directly. It scans, connects and moves
//! bytes through [`Transport`] and [`GattSession`]; [`crate::ble`] provides
//! the `btleplug` implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, Stream, StreamExt};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{Error, Result};

/// One advertisement sighting of a peripheral.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AdvertisementSighting {
    /// Opaque, stable peripheral identifier (address or platform UUID).
    pub identifier: String,
    /// Advertised local name, if any.
    pub name: Option<String>,
    /// Signal strength in dBm.
    pub rssi: Option<i16>,
    /// When this peripheral was first seen.
    pub first_seen: DateTime<Utc>,
    /// When this peripheral was most recently seen.
    pub last_seen: DateTime<Utc>,
}

impl AdvertisementSighting {
    /// Create a sighting observed at `seen`.
    pub fn new(identifier: impl Into<String>, name: Option<String>, seen: DateTime<Utc>) -> Self {
        Self {
            identifier: identifier.into(),
            name,
            rssi: None,
            first_seen: seen,
            last_seen: seen,
        }
    }

    /// Attach a signal strength.
    pub fn with_rssi(mut self, rssi: Option<i16>) -> Self {
        self.rssi = rssi;
        self
    }

    /// Name for display, falling back to "Unknown".
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("Unknown")
    }
}

/// Opaque reference to a characteristic within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CharacteristicId(pub Uuid);

impl CharacteristicId {
    /// The characteristic UUID.
    pub fn uuid(&self) -> Uuid {
        self.0
    }
}

impl From<Uuid> for CharacteristicId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl fmt::Display for CharacteristicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The closed set of characteristic properties the controller cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CharacteristicProperties {
    /// Supports read.
    pub readable: bool,
    /// Supports write with response.
    pub writable_ack: bool,
    /// Supports write without response.
    pub writable_noack: bool,
}

impl CharacteristicProperties {
    /// Properties of a characteristic that supports everything.
    pub const ALL: Self = Self {
        readable: true,
        writable_ack: true,
        writable_noack: true,
    };

    /// Whether any write modality is available.
    pub fn is_writable(&self) -> bool {
        self.writable_ack || self.writable_noack
    }
}

impl fmt::Display for CharacteristicProperties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut flags = Vec::new();
        if self.readable {
            flags.push("read");
        }
        if self.writable_ack {
            flags.push("write");
        }
        if self.writable_noack {
            flags.push("write-without-response");
        }
        write!(f, "{}", flags.join(","))
    }
}

/// A characteristic as reported by enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicInfo {
    /// Characteristic reference.
    pub id: CharacteristicId,
    /// UUID of the owning service.
    pub service: Uuid,
    /// Supported operations.
    pub properties: CharacteristicProperties,
}

/// A connected GATT session with one peripheral.
///
/// After [`GattSession::disconnect`] every other call must fail with
/// [`crate::Error::SessionClosed`].
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GattSession: Send + Sync {
    /// List the characteristics exposed by the peripheral.
    async fn enumerate(&self) -> Result<Vec<CharacteristicInfo>>;

    /// Read a characteristic value.
    async fn read(&self, characteristic: &CharacteristicId) -> Result<Vec<u8>>;

    /// Write a characteristic value, with or without peer acknowledgement.
    async fn write(
        &self,
        characteristic: &CharacteristicId,
        data: &[u8],
        acknowledged: bool,
    ) -> Result<()>;

    /// Disconnect. Safe to call on a broken or already closed session.
    async fn disconnect(&self) -> Result<()>;
}

/// Scanning and connection capabilities of a BLE stack.
#[async_trait]
pub trait Transport: Send + Sync {
    /// The session type produced by [`Transport::connect`].
    type Session: GattSession + 'static;

    /// Scan for `duration`, yielding sightings as they arrive.
    ///
    /// The stream ends when the scan period is over. Dropping it early
    /// stops the scan as well.
    async fn scan(&self, duration: Duration) -> Result<BoxStream<'static, AdvertisementSighting>>;

    /// Connect to a peripheral by identifier.
    async fn connect(&self, identifier: &str, timeout: Duration) -> Result<Self::Session>;
}

/// Bound a transport operation, mapping expiry to [`Error::Timeout`].
pub(crate) async fn bounded<T>(
    limit: Duration,
    operation: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    tokio::time::timeout(limit, operation)
        .await
        .map_err(|_| Error::Timeout)?
}

/// Runs its hook once, when dropped.
struct OnDrop<F: FnOnce()>(Option<F>);

impl<F: FnOnce()> Drop for OnDrop<F> {
    fn drop(&mut self) {
        if let Some(hook) = self.0.take() {
            hook();
        }
    }
}

/// Tie `hook` to the lifetime of `items`: it runs when the returned stream
/// is dropped, whether or not it was drained.
pub(crate) fn with_drop_hook<S, F>(items: S, hook: F) -> BoxStream<'static, S::Item>
where
    S: Stream + Send + 'static,
    S::Item: Send,
    F: FnOnce() + Send + 'static,
{
    let guard = OnDrop(Some(hook));
    stream::unfold((items.boxed(), guard), |(mut items, guard)| async move {
        let item = items.next().await?;
        Some((item, (items, guard)))
    })
    .boxed()
}
