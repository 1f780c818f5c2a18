//! Notification sink for line events.

use bytes::Bytes;

use crate::LineId;

/// Receives best-effort notifications about a line (or, registered on the
/// cache, about every line). Callbacks run after the line lock has been
/// released and must not block.
pub trait CacheListener: Send + Sync {
    /// A copy of the line arrived from another node.
    fn received(&self, _line: LineId, _version: u64, _data: Option<&Bytes>) {}

    /// The local copy was invalidated by the new owner.
    fn invalidated(&self, _line: LineId) {}

    /// The line was evicted from the local cache.
    fn evicted(&self, _line: LineId) {}

    /// An application message addressed to the line's owner arrived.
    fn message_received(&self, _line: LineId, _data: &Bytes) {}
}
