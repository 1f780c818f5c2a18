//! Recording stand-ins for the engine's collaborators.

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use galaxy_core::backup::Backup;
use galaxy_core::listener::CacheListener;
use galaxy_core::messages::{AllocedRefMessage, Message, MessageType};
use galaxy_core::refs::RefAllocator;
use galaxy_core::{LineId, NodeId, Result, MAX_RESERVED_REF_ID};
use galaxy_engine::Cache;

use crate::network_sim::NetworkSimulator;

#[derive(Debug, Clone, PartialEq)]
pub struct BackupRecord {
    pub line: LineId,
    pub version: u64,
    pub data: Option<Bytes>,
}

/// Backup that records every version it is handed. With slaves attached,
/// each backup stays outstanding until `ack_all`.
#[derive(Debug, Default)]
pub struct RecordingBackup {
    slaves: AtomicBool,
    hold_inv_acks: AtomicBool,
    records: Mutex<Vec<BackupRecord>>,
    outstanding: Mutex<Vec<LineId>>,
    held_invs: Mutex<Vec<LineId>>,
    groups: AtomicUsize,
    flushes: AtomicUsize,
}

impl RecordingBackup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_slaves() -> Self {
        let backup = Self::default();
        backup.slaves.store(true, Ordering::SeqCst);
        backup
    }

    pub fn set_slaves(&self, slaves: bool) {
        self.slaves.store(slaves, Ordering::SeqCst);
    }

    /// Holds INVACKs back until `release_inv_acks`.
    pub fn set_hold_inv_acks(&self, hold: bool) {
        self.hold_inv_acks.store(hold, Ordering::SeqCst);
    }

    pub fn records(&self) -> Vec<BackupRecord> {
        self.records.lock().clone()
    }

    pub fn records_for(&self, line: LineId) -> Vec<u64> {
        self.records
            .lock()
            .iter()
            .filter(|r| r.line == line)
            .map(|r| r.version)
            .collect()
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.lock().len()
    }

    pub fn groups(&self) -> usize {
        self.groups.load(Ordering::SeqCst)
    }

    pub fn flushes(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }

    /// Acknowledges every outstanding backup on `cache`.
    pub fn ack_all(&self, cache: &Cache) -> Result<usize> {
        let lines = std::mem::take(&mut *self.outstanding.lock());
        for line in &lines {
            cache.slaves_ack(*line)?;
        }
        Ok(lines.len())
    }

    pub fn release_inv_acks(&self, cache: &Cache) -> Result<usize> {
        let mut lines = std::mem::take(&mut *self.held_invs.lock());
        lines.dedup();
        for line in &lines {
            cache.slaves_inv_ack(*line)?;
        }
        Ok(lines.len())
    }
}

impl Backup for RecordingBackup {
    fn start_backup(&self) {
        self.groups.fetch_add(1, Ordering::SeqCst);
    }

    fn backup(&self, line: LineId, version: u64, data: Option<&Bytes>) -> bool {
        self.records.lock().push(BackupRecord {
            line,
            version,
            data: data.cloned(),
        });
        if self.slaves.load(Ordering::SeqCst) {
            self.outstanding.lock().push(line);
            true
        } else {
            false
        }
    }

    fn flush(&self) {
        self.flushes.fetch_add(1, Ordering::SeqCst);
    }

    fn inv(&self, line: LineId, _owner: NodeId) -> bool {
        if self.hold_inv_acks.load(Ordering::SeqCst) {
            self.held_invs.lock().push(line);
            true
        } else {
            false
        }
    }

    fn has_slaves(&self) -> bool {
        self.slaves.load(Ordering::SeqCst)
    }
}

/// Cluster-wide source of fresh ids.
#[derive(Debug)]
pub struct IdSequence {
    next: AtomicU64,
}

impl IdSequence {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(MAX_RESERVED_REF_ID + 1),
        }
    }

    pub fn take(&self, count: u64) -> u64 {
        self.next.fetch_add(count, Ordering::SeqCst)
    }
}

impl Default for IdSequence {
    fn default() -> Self {
        Self::new()
    }
}

/// Answers id requests with an ALLOCED_REF from the server over the bus.
pub struct BusRefAllocator {
    node: NodeId,
    sequence: Arc<IdSequence>,
    network: Arc<NetworkSimulator>,
    message_ids: AtomicU64,
    requests: AtomicUsize,
}

impl BusRefAllocator {
    pub fn new(node: NodeId, sequence: Arc<IdSequence>, network: Arc<NetworkSimulator>) -> Self {
        Self {
            node,
            sequence,
            network,
            message_ids: AtomicU64::new(1),
            requests: AtomicUsize::new(0),
        }
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

impl RefAllocator for BusRefAllocator {
    fn allocate_refs(&self, count: u64) {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let start = self.sequence.take(count);
        debug!("Granting {} ids from {:#x} to {}", count, start, self.node);
        let message = Message::request(
            NodeId::SERVER,
            self.node,
            self.message_ids.fetch_add(1, Ordering::SeqCst),
            MessageType::AllocedRef(AllocedRefMessage { start, count }),
        );
        if let Err(e) = self.network.send_message(message) {
            warn!("Could not grant ids to {}: {}", self.node, e);
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ListenerEvent {
    Received { line: LineId, version: u64 },
    Invalidated(LineId),
    Evicted(LineId),
    Message { line: LineId, data: Bytes },
}

#[derive(Debug, Default)]
pub struct RecordingListener {
    events: Mutex<Vec<ListenerEvent>>,
}

impl RecordingListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ListenerEvent> {
        self.events.lock().clone()
    }

    pub fn evictions(&self) -> Vec<LineId> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                ListenerEvent::Evicted(line) => Some(*line),
                _ => None,
            })
            .collect()
    }

    pub fn messages(&self) -> Vec<Bytes> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                ListenerEvent::Message { data, .. } => Some(data.clone()),
                _ => None,
            })
            .collect()
    }
}

impl CacheListener for RecordingListener {
    fn received(&self, line: LineId, version: u64, _data: Option<&Bytes>) {
        self.events
            .lock()
            .push(ListenerEvent::Received { line, version });
    }

    fn invalidated(&self, line: LineId) {
        self.events.lock().push(ListenerEvent::Invalidated(line));
    }

    fn evicted(&self, line: LineId) {
        self.events.lock().push(ListenerEvent::Evicted(line));
    }

    fn message_received(&self, line: LineId, data: &Bytes) {
        self.events.lock().push(ListenerEvent::Message {
            line,
            data: data.clone(),
        });
    }
}
