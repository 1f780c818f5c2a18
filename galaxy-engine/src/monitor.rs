//! # Cache Monitoring
//!
//! Observation hooks for the engine. [`NoopMonitor`] is the default;
//! [`CacheStatistics`] keeps counters in fixed-size atomic arrays indexed by
//! the dense message-kind and op-type indices.

use galaxy_core::messages::MessageKind;
use galaxy_core::ops::OpType;
use std::sync::atomic::{AtomicU64, Ordering};

pub trait CacheMonitor: Send + Sync {
    fn message_received(&self, _kind: MessageKind) {}
    fn message_sent(&self, _kind: MessageKind) {}
    fn op_submitted(&self, _op: OpType) {}
    /// A read was served from the local copy (`hit`) or had to go remote.
    fn read(&self, _hit: bool) {}
    fn evicted(&self) {}
    fn invalidated(&self) {}
    fn stale_purged(&self, _count: usize) {}
    fn timed_out(&self) {}
}

/// Monitor that ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMonitor;

impl CacheMonitor for NoopMonitor {}

#[derive(Debug)]
pub struct CacheStatistics {
    received: [AtomicU64; MessageKind::COUNT],
    sent: [AtomicU64; MessageKind::COUNT],
    ops: [AtomicU64; OpType::COUNT],
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    invalidations: AtomicU64,
    stale_purges: AtomicU64,
    timeouts: AtomicU64,
}

impl Default for CacheStatistics {
    fn default() -> Self {
        Self {
            received: std::array::from_fn(|_| AtomicU64::new(0)),
            sent: std::array::from_fn(|_| AtomicU64::new(0)),
            ops: std::array::from_fn(|_| AtomicU64::new(0)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
            stale_purges: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
        }
    }
}

impl CacheStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        StatisticsSnapshot {
            received: std::array::from_fn(|i| load(&self.received[i])),
            sent: std::array::from_fn(|i| load(&self.sent[i])),
            ops: std::array::from_fn(|i| load(&self.ops[i])),
            hits: load(&self.hits),
            misses: load(&self.misses),
            evictions: load(&self.evictions),
            invalidations: load(&self.invalidations),
            stale_purges: load(&self.stale_purges),
            timeouts: load(&self.timeouts),
        }
    }
}

impl CacheMonitor for CacheStatistics {
    fn message_received(&self, kind: MessageKind) {
        self.received[kind.index()].fetch_add(1, Ordering::Relaxed);
    }

    fn message_sent(&self, kind: MessageKind) {
        self.sent[kind.index()].fetch_add(1, Ordering::Relaxed);
    }

    fn op_submitted(&self, op: OpType) {
        self.ops[op.index()].fetch_add(1, Ordering::Relaxed);
    }

    fn read(&self, hit: bool) {
        let counter = if hit { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn evicted(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    fn invalidated(&self) {
        self.invalidations.fetch_add(1, Ordering::Relaxed);
    }

    fn stale_purged(&self, count: usize) {
        self.stale_purges.fetch_add(count as u64, Ordering::Relaxed);
    }

    fn timed_out(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatisticsSnapshot {
    received: [u64; MessageKind::COUNT],
    sent: [u64; MessageKind::COUNT],
    ops: [u64; OpType::COUNT],
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub invalidations: u64,
    pub stale_purges: u64,
    pub timeouts: u64,
}

impl StatisticsSnapshot {
    pub fn received(&self, kind: MessageKind) -> u64 {
        self.received[kind.index()]
    }

    pub fn sent(&self, kind: MessageKind) -> u64 {
        self.sent[kind.index()]
    }

    pub fn ops(&self, op: OpType) -> u64 {
        self.ops[op.index()]
    }

    pub fn total_sent(&self) -> u64 {
        self.sent.iter().sum()
    }

    pub fn total_received(&self) -> u64 {
        self.received.iter().sum()
    }
}
