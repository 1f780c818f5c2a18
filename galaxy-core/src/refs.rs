//! Fresh line id supply.

use crate::messages::Message;

/// Supplies batches of unused line ids.
///
/// Requests are asynchronous: the allocator answers by calling
/// `Cache::refs_allocated(start, count)` (directly, or through an
/// ALLOCED_REF message delivered to `Cache::receive`).
pub trait RefAllocator: Send + Sync {
    fn allocate_refs(&self, count: u64);

    /// ALLOC_REF messages addressed to this node are handed over untouched.
    fn receive(&self, _message: Message) {}
}
