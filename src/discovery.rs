//! Peripheral discovery.
//!
//! Scans produce a noisy stream of sightings: the same peripheral shows up
//! many times per scan, sometimes without a name, and overlapping scan
//! batches may be merged concurrently. [`DiscoveryLedger`] folds them into one
//! entry per identifier, ordered by identifier so a picker list does not
//! reshuffle while the user is navigating it. [`Discovery`] drives periodic
//! scans into a ledger.

use chrono::{DateTime, Utc};
use futures::StreamExt;
use parking_lot::RwLock;
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ControllerConfig;
use crate::error::{Error, Result};
use crate::transport::{AdvertisementSighting, Transport};

/// Deduplicated set of advertisement sightings.
#[derive(Debug, Default)]
pub struct DiscoveryLedger {
    entries: RwLock<BTreeMap<String, AdvertisementSighting>>,
}

impl DiscoveryLedger {
    /// Create an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a sighting into the ledger.
    ///
    /// A known identifier keeps its earliest `first_seen`, takes the latest
    /// `last_seen`, and takes the name and signal strength of the newest
    /// sighting that carries one. Returns `true` if the identifier is new.
    pub fn observe(&self, sighting: AdvertisementSighting) -> bool {
        let mut entries = self.entries.write();

        match entries.entry(sighting.identifier.clone()) {
            Entry::Vacant(slot) => {
                debug!(
                    "New peripheral: {} ({})",
                    sighting.identifier,
                    sighting.display_name()
                );
                slot.insert(sighting);
                true
            }
            Entry::Occupied(mut slot) => {
                let entry = slot.get_mut();
                if sighting.name.is_some() {
                    entry.name = sighting.name;
                }
                if sighting.rssi.is_some() {
                    entry.rssi = sighting.rssi;
                }
                entry.first_seen = entry.first_seen.min(sighting.first_seen);
                entry.last_seen = entry.last_seen.max(sighting.last_seen);
                false
            }
        }
    }

    /// Take an identifier-ordered view of the ledger.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            entries: self.entries.read().values().cloned().collect(),
        }
    }

    /// Get the entry for an identifier.
    pub fn get(&self, identifier: &str) -> Option<AdvertisementSighting> {
        self.entries.read().get(identifier).cloned()
    }

    /// Number of distinct peripherals seen.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether nothing has been seen yet.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Forget everything, restarting discovery.
    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// Time since a sighting was last refreshed.
    pub fn age(sighting: &AdvertisementSighting) -> Duration {
        Self::age_at(sighting, Utc::now())
    }

    /// Time between a sighting's last refresh and `now`, saturating at zero.
    pub fn age_at(sighting: &AdvertisementSighting, now: DateTime<Utc>) -> Duration {
        (now - sighting.last_seen).to_std().unwrap_or(Duration::ZERO)
    }
}

/// An immutable, identifier-ordered copy of the ledger.
///
/// Iterating does not consume it; call [`Snapshot::iter`] as often as needed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    entries: Vec<AdvertisementSighting>,
}

impl Snapshot {
    /// Iterate the entries in identifier order.
    pub fn iter(&self) -> std::slice::Iter<'_, AdvertisementSighting> {
        self.entries.iter()
    }

    /// Entry at a list position.
    pub fn get(&self, index: usize) -> Option<&AdvertisementSighting> {
        self.entries.get(index)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the snapshot is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Position of an identifier in the list.
    pub fn position(&self, identifier: &str) -> Option<usize> {
        self.entries.iter().position(|s| s.identifier == identifier)
    }
}

impl IntoIterator for Snapshot {
    type Item = AdvertisementSighting;
    type IntoIter = std::vec::IntoIter<AdvertisementSighting>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl<'a> IntoIterator for &'a Snapshot {
    type Item = &'a AdvertisementSighting;
    type IntoIter = std::slice::Iter<'a, AdvertisementSighting>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

/// Runs scans into a [`DiscoveryLedger`].
pub struct Discovery<T: Transport> {
    transport: Arc<T>,
    ledger: Arc<DiscoveryLedger>,
    target: Option<String>,
    scan_period: Duration,
    rescan_delay: Duration,
}

impl<T: Transport> Discovery<T> {
    /// Create a discovery driver with a fresh ledger.
    pub fn new(transport: Arc<T>, config: &ControllerConfig) -> Self {
        Self {
            transport,
            ledger: Arc::new(DiscoveryLedger::new()),
            target: config.target.clone(),
            scan_period: config.scan_period,
            rescan_delay: config.rescan_delay,
        }
    }

    /// Use a shared ledger instead of a private one.
    pub fn with_ledger(mut self, ledger: Arc<DiscoveryLedger>) -> Self {
        self.ledger = ledger;
        self
    }

    /// The configured target identifier.
    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }

    /// The ledger this driver fills.
    pub fn ledger(&self) -> &Arc<DiscoveryLedger> {
        &self.ledger
    }

    /// Run one scan period, merging everything seen.
    ///
    /// Returns the number of previously unknown peripherals. Cancellation
    /// ends the scan early without an error.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Discovery`] if the scan cannot be started.
    pub async fn scan_once(&self, cancel: &CancellationToken) -> Result<usize> {
        let mut sightings = self.transport.scan(self.scan_period).await?;
        let mut new_peripherals = 0;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("Scan cancelled");
                    break;
                }
                next = sightings.next() => match next {
                    Some(sighting) => {
                        if self.ledger.observe(sighting) {
                            new_peripherals += 1;
                        }
                    }
                    None => break,
                },
            }
        }

        if new_peripherals > 0 {
            info!("Found {} new device(s)", new_peripherals);
        }

        Ok(new_peripherals)
    }

    /// Scan until `identifier` has been seen.
    ///
    /// Scan failures are logged and retried after the rescan delay. Returns
    /// `Ok(None)` if cancelled first.
    ///
    /// # Errors
    ///
    /// Errors other than [`Error::Discovery`] (for example an unavailable
    /// adapter) are returned immediately.
    pub async fn find(
        &self,
        identifier: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<AdvertisementSighting>> {
        info!("Looking for peripheral: {}", identifier);

        loop {
            if cancel.is_cancelled() {
                return Ok(None);
            }

            match self.scan_once(cancel).await {
                Ok(_) => {}
                Err(e @ Error::Discovery { .. }) => warn!("Scan error: {}", e),
                Err(e) => return Err(e),
            }

            if let Some(sighting) = self.ledger.get(identifier) {
                info!(
                    "Found target device: {} ({})",
                    sighting.display_name(),
                    sighting.identifier
                );
                return Ok(Some(sighting));
            }

            debug!(
                "Target device not found among {} peripheral(s), retrying",
                self.ledger.len()
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(None),
                _ = tokio::time::sleep(self.rescan_delay) => {}
            }
        }
    }

    /// Scan until the configured target has been seen.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParameter`] if no target is configured, and
    /// otherwise behaves like [`Discovery::find`].
    pub async fn find_target(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<AdvertisementSighting>> {
        let target = self.target.as_deref().ok_or_else(|| Error::InvalidParameter {
            name: "target".to_string(),
            value: "none configured".to_string(),
        })?;
        self.find(target, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeTransport;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn sighting(id: &str, name: Option<&str>, secs: i64) -> AdvertisementSighting {
        AdvertisementSighting::new(id, name.map(str::to_string), at(secs))
    }

    #[test]
    fn test_repeat_sighting_merges() {
        let ledger = DiscoveryLedger::new();

        assert!(ledger.observe(sighting("AA", Some("Mug"), 0)));
        assert!(!ledger.observe(sighting("AA", Some("Ember Mug 2"), 10)));

        assert_eq!(ledger.len(), 1);
        let entry = ledger.get("AA").unwrap();
        assert_eq!(entry.name.as_deref(), Some("Ember Mug 2"));
        assert_eq!(entry.first_seen, at(0));
        assert_eq!(entry.last_seen, at(10));
    }

    #[test]
    fn test_last_seen_is_monotonic() {
        let ledger = DiscoveryLedger::new();
        ledger.observe(sighting("AA", None, 20));
        ledger.observe(sighting("AA", None, 5));

        let entry = ledger.get("AA").unwrap();
        assert_eq!(entry.first_seen, at(5));
        assert_eq!(entry.last_seen, at(20));
    }

    #[test]
    fn test_nameless_sighting_keeps_name() {
        let ledger = DiscoveryLedger::new();
        ledger.observe(sighting("AA", Some("Mug"), 0));
        ledger.observe(sighting("AA", None, 1).with_rssi(Some(-60)));

        let entry = ledger.get("AA").unwrap();
        assert_eq!(entry.name.as_deref(), Some("Mug"));
        assert_eq!(entry.rssi, Some(-60));
    }

    #[test]
    fn test_snapshot_is_ordered_and_restartable() {
        let ledger = DiscoveryLedger::new();
        ledger.observe(sighting("CC", None, 0));
        ledger.observe(sighting("AA", None, 1));
        ledger.observe(sighting("BB", None, 2));

        let snapshot = ledger.snapshot();
        let first: Vec<_> = snapshot.iter().map(|s| s.identifier.as_str()).collect();
        let second: Vec<_> = (&snapshot).into_iter().map(|s| s.identifier.as_str()).collect();

        assert_eq!(first, vec!["AA", "BB", "CC"]);
        assert_eq!(first, second);
        assert_eq!(snapshot.position("BB"), Some(1));

        // Refreshing an entry does not move it.
        ledger.observe(sighting("CC", Some("Mug"), 30));
        assert_eq!(ledger.snapshot().position("CC"), Some(2));
    }

    #[test]
    fn test_age() {
        let s = sighting("AA", None, 0);
        assert_eq!(DiscoveryLedger::age_at(&s, at(7)), Duration::from_secs(7));
        assert_eq!(DiscoveryLedger::age_at(&s, at(-3)), Duration::ZERO);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_observers() {
        let ledger = Arc::new(DiscoveryLedger::new());

        let tasks: Vec<_> = (0..8)
            .map(|task| {
                let ledger = ledger.clone();
                tokio::spawn(async move {
                    for i in 0..100 {
                        let id = format!("{:02}", i % 10);
                        ledger.observe(sighting(&id, Some(format!("task {}", task).as_str()), i));
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();

        for task in tasks {
            task.await.unwrap();
        }

        let snapshot = ledger.snapshot();
        assert_eq!(snapshot.len(), 10);
        for entry in &snapshot {
            assert!(entry.name.is_some());
            assert_eq!(entry.first_seen, at(entry.identifier.parse::<i64>().unwrap()));
            assert_eq!(
                entry.last_seen,
                at(90 + entry.identifier.parse::<i64>().unwrap())
            );
        }
    }

    #[tokio::test]
    async fn test_find_retries_after_scan_error() {
        let transport = Arc::new(FakeTransport::new());
        transport.push_scan_error();
        transport.push_scan(vec![sighting("BB", None, 0)]);
        transport.push_scan(vec![sighting("AA", Some("Mug"), 1), sighting("BB", None, 1)]);

        let config = ControllerConfig::default()
            .with_scan_timing(Duration::from_millis(10), Duration::from_millis(1));
        let discovery = Discovery::new(transport.clone(), &config);

        let found = discovery
            .find("AA", &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(found.name.as_deref(), Some("Mug"));
        assert_eq!(transport.scan_count(), 3);
        assert_eq!(discovery.ledger().len(), 2);
    }

    #[tokio::test]
    async fn test_find_observes_cancellation() {
        let transport = Arc::new(FakeTransport::new());
        let config = ControllerConfig::default()
            .with_scan_timing(Duration::from_millis(10), Duration::from_secs(60));
        let discovery = Discovery::new(transport, &config);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let found = discovery.find("AA", &cancel).await.unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn test_find_target_uses_configured_identifier() {
        let transport = Arc::new(FakeTransport::new());
        transport.push_scan(vec![sighting("BB", None, 0), sighting("CC", Some("Mug"), 0)]);

        let config = ControllerConfig::default()
            .with_target("CC")
            .with_scan_timing(Duration::from_millis(10), Duration::from_millis(1));
        let discovery = Discovery::new(transport, &config);

        let found = discovery
            .find_target(&CancellationToken::new())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(discovery.target(), Some("CC"));
        assert_eq!(found.identifier, "CC");
    }

    #[tokio::test]
    async fn test_find_target_requires_target() {
        let transport = Arc::new(FakeTransport::new());
        let discovery = Discovery::new(transport.clone(), &ControllerConfig::default());

        let result = discovery.find_target(&CancellationToken::new()).await;

        assert!(matches!(result, Err(Error::InvalidParameter { .. })));
        assert_eq!(transport.scan_count(), 0);
    }
}
