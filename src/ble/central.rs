//! `btleplug` implementation of the [`Transport`] seam.

use async_trait::async_trait;
use btleplug::api::Peripheral as _;
use futures::stream::BoxStream;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::ble::connection::BleSession;
use crate::ble::scanner::BleScanner;
use crate::error::{Error, Result};
use crate::transport::{AdvertisementSighting, Transport};

/// BLE central backed by the platform adapter.
#[derive(Clone)]
pub struct BleCentral {
    scanner: BleScanner,
}

impl BleCentral {
    /// Create a central on the first available adapter.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available.
    pub async fn new() -> Result<Self> {
        Ok(Self {
            scanner: BleScanner::new().await?,
        })
    }

    /// Create a central from an existing scanner.
    pub fn with_scanner(scanner: BleScanner) -> Self {
        Self { scanner }
    }

    /// Get the scanner.
    pub fn scanner(&self) -> &BleScanner {
        &self.scanner
    }
}

#[async_trait]
impl Transport for BleCentral {
    type Session = BleSession;

    async fn scan(&self, duration: Duration) -> Result<BoxStream<'static, AdvertisementSighting>> {
        self.scanner.scan(duration).await
    }

    async fn connect(&self, identifier: &str, timeout: Duration) -> Result<BleSession> {
        info!("Attempting to connect to {}", identifier);

        let peripheral = self.scanner.peripheral(identifier).await?;

        let connecting = BleSession::connect(identifier.to_string(), peripheral.clone());
        connect_within(timeout, connecting, async move {
            if let Err(e) = peripheral.disconnect().await {
                debug!("Disconnect after timeout failed: {}", e);
            }
        })
        .await
    }
}

/// Bound a connection attempt. On expiry `abandon` runs before the timeout is
/// reported, since the platform may still complete the dropped attempt.
async fn connect_within<T>(
    timeout: Duration,
    connecting: impl Future<Output = Result<T>>,
    abandon: impl Future<Output = ()>,
) -> Result<T> {
    match tokio::time::timeout(timeout, connecting).await {
        Ok(result) => result,
        Err(_) => {
            warn!("Connection attempt timed out after {:?}", timeout);
            abandon.await;
            Err(Error::ConnectFailed {
                reason: format!("timed out after {:?}", timeout),
            })
        }
    }
}
