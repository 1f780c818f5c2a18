use bytes::{Bytes, BytesMut};
use galaxy_core::{storage::Storage, GalaxyError, LineId, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{trace, warn};

/// Heap-backed line buffers with byte accounting.
///
/// Allocation is charged at the requested size, release at the returned
/// buffer's length, so callers fill what they allocate (as `Storage::store`
/// does).
#[derive(Debug)]
pub struct HeapStorage {
    allocated: AtomicUsize,
    limit: Option<usize>,
}

impl HeapStorage {
    /// Storage that never refuses an allocation.
    pub fn unbounded() -> Self {
        Self {
            allocated: AtomicUsize::new(0),
            limit: None,
        }
    }

    /// Storage that refuses allocations beyond `limit` outstanding bytes.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            allocated: AtomicUsize::new(0),
            limit: Some(limit),
        }
    }

    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    fn charge(&self, size: usize) -> Result<()> {
        let Some(limit) = self.limit else {
            self.allocated.fetch_add(size, Ordering::Relaxed);
            return Ok(());
        };
        self.allocated
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_add(size).filter(|total| *total <= limit)
            })
            .map(|_| ())
            .map_err(|current| {
                warn!(
                    "Refusing {} byte buffer: {} of {} bytes in use",
                    size, current, limit
                );
                GalaxyError::storage(format!(
                    "allocating {} bytes would exceed the {} byte limit",
                    size, limit
                ))
            })
    }
}

impl Default for HeapStorage {
    fn default() -> Self {
        Self::unbounded()
    }
}

impl Storage for HeapStorage {
    fn allocate(&self, size: usize) -> Result<BytesMut> {
        self.charge(size)?;
        Ok(BytesMut::with_capacity(size))
    }

    fn deallocate(&self, line: LineId, buffer: Bytes) {
        let size = buffer.len();
        trace!("Releasing {} bytes of {}", size, line);
        let _ = self
            .allocated
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_sub(size))
            });
    }

    fn total_allocated(&self) -> usize {
        self.allocated.load(Ordering::Acquire)
    }
}
