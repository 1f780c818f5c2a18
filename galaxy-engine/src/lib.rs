//! # Galaxy Engine
//!
//! The per-node cache-coherence engine of the Galaxy in-memory data grid.
//!
//! Every node caches lines (opaque byte blobs identified by a [`LineId`]).
//! At most one node owns a line at any time; other nodes may hold read-only
//! shared copies. Ownership moves on demand through GETX/PUTX, shared copies
//! are invalidated before the owner writes, and every modified version is
//! handed to the backup before any response that exposes it leaves the node.
//!
//! ## Key Components
//!
//! - **Cache**: the engine, driven by local operations and inbound messages
//! - **CacheConfig**: capacity, item size and timeout settings
//! - **Op / PendingOp**: operation descriptors and completion handles
//! - **Transaction**: groups writes under line locks until commit
//! - **CacheMonitor / CacheStatistics**: observation hooks and counters
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use bytes::Bytes;
//! use galaxy_core::network::{StaticMembership, Transport};
//! use galaxy_core::messages::Message;
//! use galaxy_core::{NodeId, Result};
//! use galaxy_engine::{Cache, CacheConfig};
//! use std::sync::Arc;
//!
//! struct Loopback;
//!
//! impl Transport for Loopback {
//!     fn send(&self, _message: Message) -> Result<()> {
//!         Ok(())
//!     }
//! }
//!
//! # fn main() -> Result<()> {
//! let membership = Arc::new(StaticMembership::new(NodeId::new(1), [], false));
//! let cache = Cache::builder(CacheConfig::default(), membership, Arc::new(Loopback)).build()?;
//!
//! let txn = cache.begin();
//! // ... run ops with `Op::in_transaction(&txn)` ...
//! cache.commit(&txn)?;
//! # let _ = Bytes::new();
//! # Ok(())
//! # }
//! ```
//!
//! [`LineId`]: galaxy_core::LineId

pub mod cache;
pub mod config;
mod eviction;
pub mod line;
mod local;
pub mod monitor;
pub mod op;
mod refs;
mod remote;
mod stale;
pub mod transaction;

pub use cache::{spawn_timeout_sweeper, Cache, CacheBuilder};
pub use config::CacheConfig;
pub use line::{flags, LineInfo};
pub use monitor::{CacheMonitor, CacheStatistics, NoopMonitor, StatisticsSnapshot};
pub use op::{Completion, Op, OpStatus, PendingOp};
pub use transaction::Transaction;

#[cfg(test)]
mod tests;
