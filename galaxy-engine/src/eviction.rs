//! Least-recently-used ordering of lines, consulted when the table grows
//! past `max_capacity`.

use galaxy_core::LineId;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Default)]
struct LruInner {
    tick: u64,
    by_tick: BTreeMap<u64, LineId>,
    by_line: HashMap<LineId, u64>,
}

#[derive(Debug, Default)]
pub(crate) struct LruIndex {
    inner: Mutex<LruInner>,
}

impl LruIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `line` as the most recently used.
    pub fn touch(&self, line: LineId) {
        let mut inner = self.inner.lock();
        inner.tick += 1;
        let tick = inner.tick;
        if let Some(previous) = inner.by_line.insert(line, tick) {
            inner.by_tick.remove(&previous);
        }
        inner.by_tick.insert(tick, line);
    }

    pub fn remove(&self, line: LineId) {
        let mut inner = self.inner.lock();
        if let Some(tick) = inner.by_line.remove(&line) {
            inner.by_tick.remove(&tick);
        }
    }

    /// Up to `limit` lines, least recently used first.
    pub fn oldest(&self, limit: usize) -> Vec<LineId> {
        self.inner
            .lock()
            .by_tick
            .values()
            .take(limit)
            .copied()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().by_line.len()
    }
}
