//! Line buffer allocation.

use bytes::{Bytes, BytesMut};

use crate::{LineId, Result};

/// Allocator for line data buffers, accounting for everything outstanding.
pub trait Storage: Send + Sync {
    /// Returns an empty buffer with room for `size` bytes.
    fn allocate(&self, size: usize) -> Result<BytesMut>;

    /// Returns a buffer that no longer backs `line`.
    fn deallocate(&self, line: LineId, buffer: Bytes);

    /// Bytes currently allocated and not yet returned.
    fn total_allocated(&self) -> usize;

    /// Copies `data` into a freshly allocated buffer.
    fn store(&self, data: &[u8]) -> Result<Bytes> {
        let mut buffer = self.allocate(data.len())?;
        buffer.extend_from_slice(data);
        Ok(buffer.freeze())
    }
}
