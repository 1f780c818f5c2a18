//! # Galaxy Core
//!
//! Core building blocks shared by every part of the Galaxy in-memory data grid.
//!
//! Nodes in a Galaxy cluster share mutable, fixed-identity data items ("lines",
//! addressed by a 64-bit id) through a cache-coherence protocol modelled on
//! MOESI. This crate holds everything the coherence engine and its
//! collaborators agree on:
//!
//! - **Identifiers and states**: [`NodeId`], [`LineId`], [`LineState`]
//! - **Wire messages**: the request/response vocabulary in [`messages`]
//! - **Local operations**: [`ops::OpType`] and [`ops::OpValue`]
//! - **Error handling**: [`GalaxyError`] and the crate-wide [`Result`]
//! - **Collaborator contracts**: [`network::Transport`], [`network::Membership`],
//!   [`backup::Backup`], [`refs::RefAllocator`], [`storage::Storage`],
//!   [`listener::CacheListener`], [`function::LineFunction`]
//! - **Encoding**: bincode/JSON serializers with checksummed frames, and
//!   structural validation of inbound messages
//!
//! ```rust
//! use galaxy_core::messages::{Message, MessageKind};
//! use galaxy_core::{LineId, NodeId};
//!
//! let probe = Message::getx(NodeId::new(1), NodeId::NONE, 1, LineId::new(0x1_0000_0001));
//! assert!(probe.is_broadcast());
//! assert_eq!(probe.kind(), MessageKind::GetX);
//! ```

pub mod backup;
pub mod error;
pub mod function;
pub mod listener;
pub mod messages;
pub mod network;
pub mod ops;
pub mod refs;
pub mod serialization;
pub mod storage;
pub mod types;
pub mod validation;

pub use error::*;
pub use types::*;
pub use validation::*;
