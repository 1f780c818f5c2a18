//! Transaction bookkeeping. The engine drives commit and rollback; this module
//! only records what a transaction touched.

use bytes::Bytes;
use galaxy_core::{GalaxyError, LineId, Result, TransactionId};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::cache::Cache;
use crate::line::flags;
use crate::op::Completion;

/// Line contents before a transaction's first write to it.
#[derive(Debug, Clone)]
pub(crate) struct PreImage {
    pub data: Option<Bytes>,
    /// MODIFIED/DELETED bits at capture time
    pub flags: u8,
}

#[derive(Debug, Default)]
struct TransactionInner {
    locked: BTreeSet<LineId>,
    pre_images: BTreeMap<LineId, PreImage>,
    reads: Vec<(LineId, u64)>,
    pending: Vec<Arc<Completion>>,
    finished: bool,
}

/// Lines locked and written by a transaction.
#[derive(Debug, Default)]
pub(crate) struct TransactionLines {
    pub locked: BTreeSet<LineId>,
    pub pre_images: BTreeMap<LineId, PreImage>,
}

/// A group of operations whose writes are backed up together at commit.
///
/// Created by `Cache::begin`; attach operations with `Op::in_transaction`.
#[derive(Debug)]
pub struct Transaction {
    id: TransactionId,
    inner: Mutex<TransactionInner>,
}

impl Transaction {
    pub(crate) fn new() -> Self {
        Self {
            id: TransactionId::new(),
            inner: Mutex::new(TransactionInner::default()),
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn is_finished(&self) -> bool {
        self.inner.lock().finished
    }

    /// Lines currently locked by this transaction.
    pub fn locked_lines(&self) -> Vec<LineId> {
        self.inner.lock().locked.iter().copied().collect()
    }

    /// Stale-read tripwires recorded by GETS.
    pub fn reads(&self) -> Vec<(LineId, u64)> {
        self.inner.lock().reads.clone()
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.is_finished() {
            return Err(GalaxyError::invalid_operation(format!(
                "transaction {} already finished",
                self.id
            )));
        }
        Ok(())
    }

    pub(crate) fn add_locked(&self, line: LineId) {
        self.inner.lock().locked.insert(line);
    }

    /// Records the pre-image on the first write; returns true if this call
    /// captured it.
    pub(crate) fn capture(&self, line: LineId, pre_image: impl FnOnce() -> PreImage) -> bool {
        let mut inner = self.inner.lock();
        if inner.pre_images.contains_key(&line) {
            return false;
        }
        inner.pre_images.insert(line, pre_image());
        true
    }

    pub(crate) fn record_read(&self, line: LineId, version: u64) {
        self.inner.lock().reads.push((line, version));
    }

    pub(crate) fn track(&self, completion: Arc<Completion>) {
        let mut inner = self.inner.lock();
        inner.pending.retain(|c| !c.is_resolved());
        inner.pending.push(completion);
    }

    /// Marks the transaction finished and hands back everything it touched.
    pub(crate) fn finish(&self) -> Result<TransactionLines> {
        let mut inner = self.inner.lock();
        if inner.finished {
            return Err(GalaxyError::invalid_operation(format!(
                "transaction {} already finished",
                self.id
            )));
        }
        inner.finished = true;
        Ok(TransactionLines {
            locked: std::mem::take(&mut inner.locked),
            pre_images: std::mem::take(&mut inner.pre_images),
        })
    }

    /// Completions of operations still waiting when the transaction ends.
    pub(crate) fn take_pending(&self) -> Vec<Arc<Completion>> {
        std::mem::take(&mut self.inner.lock().pending)
    }
}

impl Cache {
    pub fn begin(&self) -> Arc<Transaction> {
        let txn = Arc::new(Transaction::new());
        debug!("Began transaction {}", txn.id());
        txn
    }

    /// Unlocks every line the transaction holds and backs up the final
    /// version of each written line as one group.
    pub fn commit(&self, txn: &Transaction) -> Result<()> {
        let lines = txn.finish()?;
        debug!("Committing {} ({} lines)", txn.id(), lines.locked.len());
        self.backup.start_backup();
        for id in &lines.locked {
            let pre_image = lines.pre_images.get(id);
            self.with_line(*id, false, |line, ctx| {
                if line.locked_by != Some(txn.id()) {
                    return;
                }
                line.locked_by = None;
                line.clear_flag(flags::LOCKED);
                if let Some(old) = pre_image.and_then(|p| p.data.clone()) {
                    self.storage.deallocate(line.id, old);
                }
                self.backup_line(line, ctx);
                self.settle(line, ctx);
            });
        }
        self.backup.end_backup();
        Ok(())
    }

    /// Restores every written line to its pre-image and unlocks it. Versions
    /// are kept, so a rolled-back line is never re-shipped to the backup.
    pub fn rollback(&self, txn: &Transaction) -> Result<()> {
        let mut lines = txn.finish()?;
        debug!("Rolling back {} ({} lines)", txn.id(), lines.locked.len());
        for id in &lines.locked {
            let pre_image = lines.pre_images.remove(id);
            self.with_line(*id, false, |line, ctx| {
                if line.locked_by != Some(txn.id()) {
                    return;
                }
                if let Some(pre_image) = pre_image {
                    if let Some(current) = std::mem::replace(&mut line.data, pre_image.data) {
                        self.storage.deallocate(line.id, current);
                    }
                    line.flags = (line.flags & !(flags::MODIFIED | flags::DELETED)) | pre_image.flags;
                    line.backed_up_version = line.version;
                }
                line.locked_by = None;
                line.clear_flag(flags::LOCKED);
                self.settle(line, ctx);
            });
        }
        Ok(())
    }

    /// Fails the transaction's outstanding operations with `Aborted`, then
    /// rolls it back.
    pub fn abort(&self, txn: &Transaction) -> Result<()> {
        txn.ensure_open()?;
        let pending = txn.take_pending();
        let aborted = pending
            .iter()
            .filter(|c| c.resolve(Err(GalaxyError::Aborted)))
            .count();
        if aborted > 0 {
            warn!("Aborted {} pending operations of {}", aborted, txn.id());
        }
        self.rollback(txn)
    }

    /// True if no line read with GETS has changed or gone stale since.
    pub fn verify_stale_reads(&self, txn: &Transaction) -> bool {
        txn.reads().into_iter().all(|(id, version)| {
            self.with_line(id, false, |line, _| {
                line.state.is_readable() && !line.needs_refresh && line.version == version
            })
            .unwrap_or(false)
        })
    }
}
