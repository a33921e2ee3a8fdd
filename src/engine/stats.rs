// Transfer counters: how much work the coalescing layer saved and how it went.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub started: u64,
    pub coalesced: u64,
    pub superseded: u64,
    pub bytes_received: u64,
    pub completed: u64,
    pub failed: u64,
    pub active_transfers: u32,
}

impl StatsSnapshot {
    /// Share of requests that rode on an existing transfer.
    pub fn coalesce_rate(&self) -> f64 {
        let requests = self.started + self.coalesced;
        if requests > 0 {
            self.coalesced as f64 / requests as f64
        } else {
            0.0
        }
    }
}

pub struct TransferStats {
    started: AtomicU64,
    coalesced: AtomicU64,
    superseded: AtomicU64,
    bytes_received: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    active_transfers: AtomicU32,
}

impl TransferStats {
    pub fn new() -> Self {
        Self {
            started: AtomicU64::new(0),
            coalesced: AtomicU64::new(0),
            superseded: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            active_transfers: AtomicU32::new(0),
        }
    }

    pub fn record_started(&self) {
        self.started.fetch_add(1, Ordering::Relaxed);
        self.active_transfers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_coalesced(&self) {
        self.coalesced.fetch_add(1, Ordering::Relaxed);
    }

    /// A tracked transfer was replaced by a higher-priority one; the replacement is counted by `record_started`.
    pub fn record_superseded(&self) {
        self.superseded.fetch_add(1, Ordering::Relaxed);
        self.active_transfers.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record_bytes(&self, bytes: u64) {
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_finished(&self, success: bool) {
        if success {
            self.completed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        self.active_transfers.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            started: self.started.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            superseded: self.superseded.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            active_transfers: self.active_transfers.load(Ordering::Relaxed),
        }
    }
}

impl Default for TransferStats {
    fn default() -> Self {
        Self::new()
    }
}
