//! Global readout counters and their periodic publication.
//!
//! Counters are plain atomics updated from the data path without locks.
//! A publisher thread snapshots them into a fixed-layout record and sends
//! it verbatim (bincode fixed-width little-endian encoding) as one UDP
//! datagram per period; a separate monitor process renders them.

use crate::tfclock::{SharedFirstOrbit, published_first_orbit, shared_first_orbit};
use crate::thread::{LoopStatus, LoopThread};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::io;
use std::net::UdpSocket;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Packs up to 8 ASCII bytes of a state tag into a u64 for atomic storage.
pub fn state_to_u64(state: &str) -> u64 {
    let mut bytes = [0u8; 8];
    for (i, b) in state.bytes().take(8).enumerate() {
        bytes[i] = b;
    }
    u64::from_le_bytes(bytes)
}

/// Reverses [`state_to_u64`].
pub fn state_from_u64(v: u64) -> String {
    let bytes = v.to_le_bytes();
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(8);
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Lock-free global counters, one instance per process, owned by the
/// pipeline context and updated by all stages.
pub struct DaqStats {
    pub subtimeframes: AtomicU64,
    pub bytes_readout: AtomicU64,
    pub bytes_recorded: AtomicU64,
    pub bytes_tx: AtomicU64,
    pub tx_pages_pending: AtomicU64,
    pub tx_pages_released: AtomicU64,
    /// Cumulated transport latency of released pages, microseconds.
    pub tx_latency_us: AtomicU64,
    /// Current run state tag, 8 ASCII bytes packed.
    pub state: AtomicU64,
    /// First orbit seen by any equipment; shared with timeframe clocks.
    pub first_orbit: SharedFirstOrbit,
}

impl Default for DaqStats {
    fn default() -> Self {
        Self {
            subtimeframes: AtomicU64::new(0),
            bytes_readout: AtomicU64::new(0),
            bytes_recorded: AtomicU64::new(0),
            bytes_tx: AtomicU64::new(0),
            tx_pages_pending: AtomicU64::new(0),
            tx_pages_released: AtomicU64::new(0),
            tx_latency_us: AtomicU64::new(0),
            state: AtomicU64::new(state_to_u64("unknown")),
            first_orbit: shared_first_orbit(),
        }
    }
}

impl DaqStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_state(&self, state: &str) {
        self.state.store(state_to_u64(state), Ordering::Relaxed);
    }

    pub fn reset(&self) {
        self.subtimeframes.store(0, Ordering::Relaxed);
        self.bytes_readout.store(0, Ordering::Relaxed);
        self.bytes_recorded.store(0, Ordering::Relaxed);
        self.bytes_tx.store(0, Ordering::Relaxed);
        self.tx_pages_pending.store(0, Ordering::Relaxed);
        self.tx_pages_released.store(0, Ordering::Relaxed);
        self.tx_latency_us.store(0, Ordering::Relaxed);
    }

    pub fn print(&self) {
        info!(
            "global stats: subtimeframes={} bytesReadout={} bytesRecorded={} bytesTx={}",
            self.subtimeframes.load(Ordering::Relaxed),
            self.bytes_readout.load(Ordering::Relaxed),
            self.bytes_recorded.load(Ordering::Relaxed),
            self.bytes_tx.load(Ordering::Relaxed),
        );
    }

    /// Snapshot for publication. `timestamp_us` and `readout_rate` are
    /// provided by the publisher (monotonic time base, rate over the last
    /// interval).
    pub fn snapshot(&self, timestamp_us: u64, readout_rate: f64) -> StatsRecord {
        StatsRecord {
            magic: STATS_RECORD_MAGIC,
            version: STATS_RECORD_VERSION,
            timestamp_us,
            subtimeframes: self.subtimeframes.load(Ordering::Relaxed),
            bytes_readout: self.bytes_readout.load(Ordering::Relaxed),
            bytes_recorded: self.bytes_recorded.load(Ordering::Relaxed),
            bytes_tx: self.bytes_tx.load(Ordering::Relaxed),
            tx_pages_pending: self.tx_pages_pending.load(Ordering::Relaxed),
            tx_pages_released: self.tx_pages_released.load(Ordering::Relaxed),
            tx_latency_us: self.tx_latency_us.load(Ordering::Relaxed),
            readout_rate,
            state: self.state.load(Ordering::Relaxed),
            first_orbit: published_first_orbit(&self.first_orbit).map(u64::from).unwrap_or(u64::MAX),
        }
    }
}

pub const STATS_RECORD_MAGIC: u32 = 0x5151_4144; // "DAQQ"
pub const STATS_RECORD_VERSION: u32 = 1;

/// Fixed-layout counters record, one per datagram. Field order is the
/// wire layout; all integers are little-endian fixed width.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StatsRecord {
    pub magic: u32,
    pub version: u32,
    pub timestamp_us: u64,
    pub subtimeframes: u64,
    pub bytes_readout: u64,
    pub bytes_recorded: u64,
    pub bytes_tx: u64,
    pub tx_pages_pending: u64,
    pub tx_pages_released: u64,
    pub tx_latency_us: u64,
    pub readout_rate: f64,
    pub state: u64,
    /// `u64::MAX` when no equipment published a first orbit yet.
    pub first_orbit: u64,
}

impl StatsRecord {
    pub fn encode(&self) -> Vec<u8> {
        bincode::serialize(self).expect("fixed-layout record always serializes")
    }

    pub fn decode(bytes: &[u8]) -> io::Result<Self> {
        let record: StatsRecord = bincode::deserialize(bytes).map_err(io::Error::other)?;
        if record.magic != STATS_RECORD_MAGIC {
            return Err(io::Error::other("bad stats record magic"));
        }
        if record.version != STATS_RECORD_VERSION {
            return Err(io::Error::other(format!("unsupported stats record version {}", record.version)));
        }
        Ok(record)
    }

    pub fn state_string(&self) -> String {
        state_from_u64(self.state)
    }
}

/// A metric queued for the publisher by a pipeline stage that has no
/// access to the publishing socket itself.
#[derive(Debug, Clone, PartialEq)]
pub struct Metric {
    pub name: &'static str,
    pub tag: u16,
    pub value: u64,
}

/// Thread-safe transient storage between metric producers and the
/// publisher.
#[derive(Default)]
pub struct MetricQueue {
    queue: Mutex<VecDeque<Metric>>,
}

impl MetricQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, metric: Metric) {
        self.queue.lock().expect("metric queue mutex poisoned").push_back(metric);
    }

    /// Runs `f` on every queued metric and empties the queue.
    pub fn execute<F: FnMut(&Metric)>(&self, mut f: F) {
        let mut q = self.queue.lock().expect("metric queue mutex poisoned");
        for m in q.iter() {
            f(m);
        }
        q.clear();
    }

    pub fn clear(&self) {
        self.queue.lock().expect("metric queue mutex poisoned").clear();
    }

    pub fn len(&self) -> usize {
        self.queue.lock().expect("metric queue mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Periodic UDP publisher for the stats record.
pub struct StatsPublisher {
    thread: LoopThread,
}

impl StatsPublisher {
    /// Starts publishing to `target` (host:port) every `period`.
    pub fn start(
        stats: Arc<DaqStats>,
        metrics: Arc<MetricQueue>,
        target: &str,
        period: Duration,
    ) -> io::Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.connect(target)?;
        info!("stats publisher: sending to {} every {:?}", target, period);
        let t0 = Instant::now();
        let mut last_bytes = 0u64;
        let mut last_time = t0;
        let thread = LoopThread::start("stats-publisher", period, move || {
            let now = Instant::now();
            let elapsed = now.duration_since(last_time).as_secs_f64();
            let bytes = stats.bytes_readout.load(Ordering::Relaxed);
            let rate = if elapsed > 0.0 {
                (bytes.saturating_sub(last_bytes)) as f64 / elapsed
            } else {
                0.0
            };
            last_bytes = bytes;
            last_time = now;
            let record = stats.snapshot(t0.elapsed().as_micros() as u64, rate);
            if let Err(e) = socket.send(&record.encode()) {
                debug!("stats publisher: send failed: {}", e);
            }
            metrics.execute(|m| debug!("metric {}[{}] = {}", m.name, m.tag, m.value));
            LoopStatus::Idle
        });
        Ok(Self { thread })
    }

    pub fn stop(&mut self) {
        self.thread.join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_string_roundtrip() {
        assert_eq!(state_from_u64(state_to_u64("running")), "running");
        assert_eq!(state_from_u64(state_to_u64("")), "");
        // longer tags are truncated to 8 bytes
        assert_eq!(state_from_u64(state_to_u64("stabilizing")), "stabiliz");
    }

    #[test]
    fn record_encode_decode() {
        let stats = DaqStats::new();
        stats.bytes_readout.store(12345, Ordering::Relaxed);
        stats.subtimeframes.store(7, Ordering::Relaxed);
        stats.set_state("running");
        let record = stats.snapshot(1_000_000, 250.0);
        let bytes = record.encode();
        let decoded = StatsRecord::decode(&bytes).unwrap();
        assert_eq!(decoded, record);
        assert_eq!(decoded.state_string(), "running");
        assert_eq!(decoded.bytes_readout, 12345);
        assert_eq!(decoded.first_orbit, u64::MAX);
    }

    #[test]
    fn record_layout_is_stable() {
        // fixed-width encoding: 2 u32 + 8 u64 + 1 f64 + 2 u64
        let record = DaqStats::new().snapshot(0, 0.0);
        assert_eq!(record.encode().len(), 4 + 4 + 8 * 11);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(StatsRecord::decode(&[0u8; 4]).is_err());
        let mut bytes = DaqStats::new().snapshot(0, 0.0).encode();
        bytes[0] ^= 0xFF;
        assert!(StatsRecord::decode(&bytes).is_err());
    }

    #[test]
    fn metric_queue_drains() {
        let q = MetricQueue::new();
        q.push(Metric { name: "blocks", tag: 1, value: 10 });
        q.push(Metric { name: "bytes", tag: 1, value: 20 });
        let mut seen = Vec::new();
        q.execute(|m| seen.push(m.value));
        assert_eq!(seen, vec![10, 20]);
        assert!(q.is_empty());
    }

    #[test]
    fn publisher_sends_datagrams() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let target = receiver.local_addr().unwrap().to_string();
        let stats = Arc::new(DaqStats::new());
        stats.bytes_readout.store(999, Ordering::Relaxed);
        let metrics = Arc::new(MetricQueue::new());
        let mut publisher =
            StatsPublisher::start(stats, metrics, &target, Duration::from_millis(10)).unwrap();
        let mut buf = [0u8; 256];
        let n = receiver.recv(&mut buf).unwrap();
        let record = StatsRecord::decode(&buf[..n]).unwrap();
        assert_eq!(record.bytes_readout, 999);
        publisher.stop();
    }
}
