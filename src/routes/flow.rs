//! Flow tracking: last-seen time and byte/packet counters.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;

/// Seconds of inactivity after which a flow expires.
pub const FLOW_TIMEOUT_SECS: i64 = 55;

/// Current time as unix seconds, the clock flows are tracked against.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Connection-tracking state shared by a route and its reverse.
///
/// Counters are rx/tx from the flow initiator's point of view: packets
/// through the originally installed route count as rx, packets through
/// the reverse as tx.
#[derive(Debug)]
pub struct Flow {
    timeout: i64,
    last_seen: AtomicI64,
    rx_bytes: AtomicU64,
    tx_bytes: AtomicU64,
    rx_packets: AtomicU64,
    tx_packets: AtomicU64,
}

/// Point-in-time copy of a flow's counters.
#[derive(Debug, Clone, Serialize)]
pub struct FlowStats {
    pub last_seen: SystemTime,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_packets: u64,
    pub tx_packets: u64,
}

impl Flow {
    pub(crate) fn new(now: i64, timeout: i64) -> Self {
        Self {
            timeout,
            last_seen: AtomicI64::new(now),
            rx_bytes: AtomicU64::new(0),
            tx_bytes: AtomicU64::new(0),
            rx_packets: AtomicU64::new(0),
            tx_packets: AtomicU64::new(0),
        }
    }

    pub fn stats(&self) -> FlowStats {
        let last_seen = self.last_seen.load(Ordering::Relaxed).max(0) as u64;
        FlowStats {
            last_seen: UNIX_EPOCH + Duration::from_secs(last_seen),
            rx_bytes: self.rx_bytes.load(Ordering::Relaxed),
            tx_bytes: self.tx_bytes.load(Ordering::Relaxed),
            rx_packets: self.rx_packets.load(Ordering::Relaxed),
            tx_packets: self.tx_packets.load(Ordering::Relaxed),
        }
    }

    pub fn expired(&self, now: i64) -> bool {
        self.last_seen.load(Ordering::Relaxed) < now - self.timeout
    }

    pub(crate) fn touch(&self, now: i64) {
        self.last_seen.store(now, Ordering::Relaxed);
    }

    pub(crate) fn received_packet(&self, now: i64, size: u64) {
        self.touch(now);
        self.rx_packets.fetch_add(1, Ordering::Relaxed);
        self.rx_bytes.fetch_add(size, Ordering::Relaxed);
    }

    pub(crate) fn sent_packet(&self, now: i64, size: u64) {
        self.touch(now);
        self.tx_packets.fetch_add(1, Ordering::Relaxed);
        self.tx_bytes.fetch_add(size, Ordering::Relaxed);
    }
}
