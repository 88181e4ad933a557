//! BLE scanning functionality.
//!
//! Provides the scanner that turns adapter events into
//! [`AdvertisementSighting`]s.

use btleplug::api::{Central, CentralEvent, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral};
use chrono::Utc;
use futures::stream::{BoxStream, StreamExt};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use crate::error::{Error, Result};
use crate::transport::{with_drop_hook, AdvertisementSighting};

/// BLE scanner for discovering peripherals.
#[derive(Clone)]
pub struct BleScanner {
    /// The BLE adapter to use for scanning.
    adapter: Adapter,
}

impl BleScanner {
    /// Create a new BLE scanner on the first available adapter.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new()
            .await
            .map_err(|_e| Error::BluetoothUnavailable)?;

        let adapters = manager.adapters().await.map_err(Error::Bluetooth)?;

        let adapter = adapters
            .into_iter()
            .next()
            .ok_or(Error::BluetoothUnavailable)?;

        info!(
            "Using Bluetooth adapter: {:?}",
            adapter.adapter_info().await.ok()
        );

        Ok(Self { adapter })
    }

    /// Create a new BLE scanner with a specific adapter.
    pub fn with_adapter(adapter: Adapter) -> Self {
        Self { adapter }
    }

    /// Get the underlying adapter.
    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    /// Scan for `duration`, yielding a sighting for every discovery or update.
    ///
    /// The platform scan is stopped when the stream is dropped, whether the
    /// period ran out or the caller gave up early.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Discovery`] if the scan cannot be started.
    pub async fn scan(&self, duration: Duration) -> Result<BoxStream<'static, AdvertisementSighting>> {
        let events = self.adapter.events().await.map_err(|e| Error::Discovery {
            reason: e.to_string(),
        })?;

        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(|e| Error::Discovery {
                reason: e.to_string(),
            })?;

        debug!("Scanning for {:?}", duration);

        let adapter = self.adapter.clone();
        let sightings = events
            .take_until(tokio::time::sleep(duration))
            .filter_map(move |event| {
                let adapter = adapter.clone();
                async move { Self::sighting_for(&adapter, event).await }
            });

        let stopper = self.adapter.clone();
        Ok(with_drop_hook(sightings, move || {
            let Ok(runtime) = tokio::runtime::Handle::try_current() else {
                warn!("No runtime to stop the scan on");
                return;
            };
            runtime.spawn(async move {
                if let Err(e) = stopper.stop_scan().await {
                    warn!("Failed to stop scan: {}", e);
                }
                debug!("Scan stopped");
            });
        }))
    }

    /// Look up a peripheral the adapter has already seen.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectFailed`] if no peripheral has that identifier.
    pub async fn peripheral(&self, identifier: &str) -> Result<Peripheral> {
        let peripherals = self.adapter.peripherals().await?;

        peripherals
            .into_iter()
            .find(|p| p.id().to_string() == identifier)
            .ok_or_else(|| Error::ConnectFailed {
                reason: format!("peripheral {} has not been seen by the adapter", identifier),
            })
    }

    /// Turn a discovery/update event into a sighting.
    async fn sighting_for(adapter: &Adapter, event: CentralEvent) -> Option<AdvertisementSighting> {
        let id = match event {
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
            _ => return None,
        };

        let peripheral = match adapter.peripheral(&id).await {
            Ok(p) => p,
            Err(e) => {
                trace!("Failed to get peripheral: {}", e);
                return None;
            }
        };

        let properties = match peripheral.properties().await {
            Ok(Some(p)) => p,
            _ => return None,
        };

        trace!(
            "Sighting: {} ({:?}, rssi {:?})",
            id,
            properties.local_name,
            properties.rssi
        );

        Some(
            AdvertisementSighting::new(id.to_string(), properties.local_name, Utc::now())
                .with_rssi(properties.rssi),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scanner_clone() {
        fn assert_clone<T: Clone + Send + Sync>() {}
        assert_clone::<BleScanner>();
    }
}
