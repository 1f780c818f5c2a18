//! # Galaxy Storage
//!
//! Buffer allocation for cached line data.
//!
//! The coherence engine never allocates line buffers itself; it asks a
//! [`Storage`](galaxy_core::storage::Storage) implementation, which accounts for
//! every byte handed out until the buffer is returned.
//!
//! ## Implementations
//!
//! - [`HeapStorage`] - Heap buffers with optional byte limit
//!
//! ## Example
//!
//! ```rust
//! use galaxy_core::{storage::Storage, LineId};
//! use galaxy_storage::HeapStorage;
//!
//! let storage = HeapStorage::with_limit(1024);
//! let buffer = storage.store(b"hello world").unwrap();
//! assert_eq!(storage.total_allocated(), 11);
//!
//! storage.deallocate(LineId::new(0x1_0000_0001), buffer);
//! assert_eq!(storage.total_allocated(), 0);
//! assert!(storage.store(&[0u8; 2048]).is_err());
//! ```

pub mod heap;

pub use heap::HeapStorage;
