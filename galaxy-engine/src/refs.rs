//! Local window of fresh line ids supplied by the `RefAllocator`.

use std::collections::VecDeque;
use std::ops::Range;
use std::sync::Arc;

use crate::op::Op;

#[derive(Debug, Default)]
pub(crate) struct RefWindow {
    ranges: VecDeque<Range<u64>>,
    requested: bool,
    /// End of the highest batch supplied so far
    high_water: u64,
    /// Allocations waiting for ids, in arrival order
    pub waiters: VecDeque<Arc<Op>>,
}

impl RefWindow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn remaining(&self) -> u64 {
        self.ranges.iter().map(|r| r.end - r.start).sum()
    }

    /// Takes `count` consecutive ids from the first range that can supply them.
    pub fn take(&mut self, count: u64) -> Option<u64> {
        let range = self
            .ranges
            .iter_mut()
            .find(|r| r.end - r.start >= count)?;
        let start = range.start;
        range.start += count;
        self.ranges.retain(|r| r.start < r.end);
        Some(start)
    }

    /// Size of the batch to request, if a refill is due: once fewer than half a
    /// batch of ids remain, or fewer than `needed`. At most one request is
    /// outstanding.
    pub fn refill_request(&mut self, batch: u64, needed: u64) -> Option<u64> {
        let remaining = self.remaining();
        if self.requested || (remaining >= batch / 2 && remaining >= needed) {
            return None;
        }
        self.requested = true;
        Some(batch.max(needed))
    }

    /// Adds a batch. Batches are handed out in increasing order, so one that
    /// starts below an earlier batch's end is a repeat and is refused.
    pub fn supply(&mut self, start: u64, count: u64) -> bool {
        if start < self.high_water {
            return false;
        }
        self.high_water = start + count;
        self.requested = false;
        match self.ranges.back_mut() {
            Some(last) if last.end == start => last.end += count,
            _ => self.ranges.push_back(start..start + count),
        }
        true
    }
}
