//! In-memory transport and mug used by the unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;

use crate::ble::uuids::{DRINK_TEMPERATURE_UUID, TARGET_TEMPERATURE_UUID};
use crate::error::{Error, Result};
use crate::protocol::{ByteOrder, SetpointCodec};
use crate::transport::{
    AdvertisementSighting, CharacteristicId, CharacteristicInfo, CharacteristicProperties,
    GattSession, Transport,
};

/// Transport with scripted scans and a single connectable peripheral.
pub(crate) struct FakeTransport {
    scans: Mutex<VecDeque<Result<Vec<AdvertisementSighting>>>>,
    scan_count: AtomicUsize,
    session: Mutex<Option<FakeSession>>,
    connect_failure: Mutex<Option<String>>,
    connect_delay: Mutex<Duration>,
    connects: AtomicUsize,
}

impl FakeTransport {
    pub(crate) fn new() -> Self {
        Self {
            scans: Mutex::new(VecDeque::new()),
            scan_count: AtomicUsize::new(0),
            session: Mutex::new(None),
            connect_failure: Mutex::new(None),
            connect_delay: Mutex::new(Duration::ZERO),
            connects: AtomicUsize::new(0),
        }
    }

    pub(crate) fn with_session(session: FakeSession) -> Self {
        let transport = Self::new();
        *transport.session.lock() = Some(session);
        transport
    }

    pub(crate) fn push_scan(&self, sightings: Vec<AdvertisementSighting>) {
        self.scans.lock().push_back(Ok(sightings));
    }

    pub(crate) fn push_scan_error(&self) {
        self.scans.lock().push_back(Err(Error::Discovery {
            reason: "adapter busy".to_string(),
        }));
    }

    pub(crate) fn scan_count(&self) -> usize {
        self.scan_count.load(Ordering::SeqCst)
    }

    pub(crate) fn fail_connect(&self, reason: &str) {
        *self.connect_failure.lock() = Some(reason.to_string());
    }

    pub(crate) fn set_connect_delay(&self, delay: Duration) {
        *self.connect_delay.lock() = delay;
    }

    pub(crate) fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for FakeTransport {
    type Session = FakeSession;

    async fn scan(&self, _duration: Duration) -> Result<BoxStream<'static, AdvertisementSighting>> {
        self.scan_count.fetch_add(1, Ordering::SeqCst);
        let next = self.scans.lock().pop_front();
        match next {
            Some(Ok(sightings)) => Ok(stream::iter(sightings).boxed()),
            Some(Err(e)) => Err(e),
            None => Ok(stream::empty().boxed()),
        }
    }

    async fn connect(&self, _identifier: &str, timeout: Duration) -> Result<FakeSession> {
        self.connects.fetch_add(1, Ordering::SeqCst);

        let delay = *self.connect_delay.lock();
        if tokio::time::timeout(timeout, tokio::time::sleep(delay))
            .await
            .is_err()
        {
            return Err(Error::ConnectFailed {
                reason: "timed out".to_string(),
            });
        }

        if let Some(reason) = self.connect_failure.lock().clone() {
            return Err(Error::ConnectFailed { reason });
        }

        self.session.lock().clone().ok_or_else(|| Error::ConnectFailed {
            reason: "no such peripheral".to_string(),
        })
    }
}

/// A write as the fake device received it.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct RecordedWrite {
    pub characteristic: CharacteristicId,
    pub data: Vec<u8>,
    pub acknowledged: bool,
}

struct MugState {
    characteristics: Vec<CharacteristicInfo>,
    codec: SetpointCodec,
    measured: f64,
    setpoint: f64,
    writes: Vec<RecordedWrite>,
    failing_reads: usize,
    failing_writes: usize,
    reads: usize,
    lost_after_reads: Option<usize>,
    read_delay: Duration,
    closed: bool,
    disconnects: usize,
}

/// A simulated mug. Clones share the same device.
///
/// The device interprets and reports temperatures in one byte order and
/// clamps written setpoints to 0..=100°C.
#[derive(Clone)]
pub(crate) struct FakeSession {
    state: Arc<Mutex<MugState>>,
}

impl FakeSession {
    /// A mug exposing a read-only drink temperature and a readable
    /// setpoint that takes writes without response.
    pub(crate) fn mug(order: ByteOrder) -> Self {
        Self::with_characteristics(
            order,
            vec![
                characteristic(
                    DRINK_TEMPERATURE_UUID,
                    CharacteristicProperties {
                        readable: true,
                        ..Default::default()
                    },
                ),
                characteristic(
                    TARGET_TEMPERATURE_UUID,
                    CharacteristicProperties {
                        readable: true,
                        writable_ack: false,
                        writable_noack: true,
                    },
                ),
            ],
        )
    }

    pub(crate) fn with_characteristics(
        order: ByteOrder,
        characteristics: Vec<CharacteristicInfo>,
    ) -> Self {
        Self {
            state: Arc::new(Mutex::new(MugState {
                characteristics,
                codec: SetpointCodec::new(order),
                measured: 40.0,
                setpoint: 0.0,
                writes: Vec::new(),
                failing_reads: 0,
                failing_writes: 0,
                reads: 0,
                lost_after_reads: None,
                read_delay: Duration::ZERO,
                closed: false,
                disconnects: 0,
            })),
        }
    }

    pub(crate) fn set_measured(&self, celsius: f64) {
        self.state.lock().measured = celsius;
    }

    pub(crate) fn set_device_setpoint(&self, celsius: f64) {
        self.state.lock().setpoint = celsius;
    }

    pub(crate) fn device_setpoint(&self) -> f64 {
        self.state.lock().setpoint
    }

    pub(crate) fn fail_next_reads(&self, count: usize) {
        self.state.lock().failing_reads = count;
    }

    pub(crate) fn fail_next_writes(&self, count: usize) {
        self.state.lock().failing_writes = count;
    }

    pub(crate) fn lose_connection_after_reads(&self, count: usize) {
        self.state.lock().lost_after_reads = Some(count);
    }

    pub(crate) fn set_read_delay(&self, delay: Duration) {
        self.state.lock().read_delay = delay;
    }

    pub(crate) fn writes(&self) -> Vec<RecordedWrite> {
        self.state.lock().writes.clone()
    }

    /// Written setpoints, decoded in the device's byte order.
    pub(crate) fn written_setpoints(&self) -> Vec<f64> {
        let state = self.state.lock();
        state
            .writes
            .iter()
            .filter_map(|w| state.codec.decode_slice(&w.data).ok())
            .collect()
    }

    pub(crate) fn disconnects(&self) -> usize {
        self.state.lock().disconnects
    }

    fn find(state: &MugState, id: &CharacteristicId) -> Result<CharacteristicInfo> {
        state
            .characteristics
            .iter()
            .find(|c| c.id == *id)
            .cloned()
            .ok_or_else(|| Error::CharacteristicNotFound {
                uuid: id.to_string(),
            })
    }
}

pub(crate) fn characteristic(
    uuid: uuid::Uuid,
    properties: CharacteristicProperties,
) -> CharacteristicInfo {
    CharacteristicInfo {
        id: CharacteristicId(uuid),
        service: uuid::Uuid::nil(),
        properties,
    }
}

#[async_trait]
impl GattSession for FakeSession {
    async fn enumerate(&self) -> Result<Vec<CharacteristicInfo>> {
        let state = self.state.lock();
        if state.closed {
            return Err(Error::SessionClosed);
        }
        Ok(state.characteristics.clone())
    }

    async fn read(&self, characteristic: &CharacteristicId) -> Result<Vec<u8>> {
        let delay = self.state.lock().read_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        if state.closed {
            return Err(Error::SessionClosed);
        }
        if let Some(limit) = state.lost_after_reads {
            if state.reads >= limit {
                return Err(Error::ConnectionLost);
            }
        }
        state.reads += 1;

        if state.failing_reads > 0 {
            state.failing_reads -= 1;
            return Err(Error::ReadFailed {
                characteristic: characteristic.to_string(),
                reason: "gatt error".to_string(),
            });
        }

        Self::find(&state, characteristic)?;
        let value = if characteristic.uuid() == DRINK_TEMPERATURE_UUID {
            state.measured
        } else {
            state.setpoint
        };
        Ok(state.codec.encode(value)?.to_vec())
    }

    async fn write(
        &self,
        characteristic: &CharacteristicId,
        data: &[u8],
        acknowledged: bool,
    ) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(Error::SessionClosed);
        }
        if state.failing_writes > 0 {
            state.failing_writes -= 1;
            return Err(Error::WriteFailed {
                characteristic: characteristic.to_string(),
                reason: "gatt error".to_string(),
            });
        }

        let info = Self::find(&state, characteristic)?;
        state.writes.push(RecordedWrite {
            characteristic: *characteristic,
            data: data.to_vec(),
            acknowledged,
        });

        if info.id.uuid() == TARGET_TEMPERATURE_UUID {
            let value = state.codec.decode_slice(data)?;
            state.setpoint = value.clamp(0.0, 100.0);
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.closed = true;
        state.disconnects += 1;
        Ok(())
    }
}
