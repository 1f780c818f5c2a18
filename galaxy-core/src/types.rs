//! # Core Types
//!
//! Fundamental identifiers and states used throughout the Galaxy coherence protocol.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Highest line id reserved for system use (root-name resolution and friends).
///
/// Ids handed out by the ref allocator always lie strictly above this value.
pub const MAX_RESERVED_REF_ID: u64 = 0xffff_ffff;

/// Identifier of a node in the grid.
///
/// Node ids are small integers assigned by cluster membership. Two values are
/// reserved: [`NodeId::NONE`] means "unknown owner" or, as a message target,
/// "broadcast to every peer"; [`NodeId::SERVER`] is the central durable store.
///
/// # Examples
///
/// ```rust
/// use galaxy_core::NodeId;
///
/// let node = NodeId::new(3);
/// assert!(node.is_peer());
/// assert!(NodeId::NONE.is_none());
/// assert!(NodeId::SERVER.is_server());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub i16);

impl NodeId {
    /// Unknown owner / broadcast sentinel.
    pub const NONE: NodeId = NodeId(-1);
    /// The central server node.
    pub const SERVER: NodeId = NodeId(0);

    pub fn new(id: i16) -> Self {
        Self(id)
    }

    pub fn value(&self) -> i16 {
        self.0
    }

    pub fn is_none(&self) -> bool {
        self.0 < 0
    }

    pub fn is_server(&self) -> bool {
        self.0 == 0
    }

    /// A real, non-server cluster node.
    pub fn is_peer(&self) -> bool {
        self.0 > 0
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::NONE
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            -1 => write!(f, "none"),
            0 => write!(f, "server"),
            n => write!(f, "node-{}", n),
        }
    }
}

impl From<i16> for NodeId {
    fn from(id: i16) -> Self {
        Self(id)
    }
}

/// 64-bit identifier of a cache line.
///
/// # Examples
///
/// ```rust
/// use galaxy_core::{LineId, MAX_RESERVED_REF_ID};
///
/// let root = LineId::new(1);
/// assert!(root.is_reserved());
/// assert!(!LineId::new(MAX_RESERVED_REF_ID + 1).is_reserved());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LineId(pub u64);

impl LineId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    /// Returns true for ids in the system-reserved range.
    pub fn is_reserved(&self) -> bool {
        self.0 <= MAX_RESERVED_REF_ID
    }

    /// The id `n` positions after this one.
    pub fn offset(&self, n: u64) -> Self {
        Self(self.0 + n)
    }
}

impl fmt::Display for LineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl From<u64> for LineId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Coherence state of a cache line.
///
/// The variants are declared weakest first so that the derived ordering
/// reflects the strength of the access right: `I < S < O < E`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum LineState {
    /// No valid data
    Invalid,
    /// Read-only copy, another node owns the line
    Shared,
    /// This node owns the line but other nodes may hold shared copies
    Owned,
    /// This node is the sole holder
    Exclusive,
}

impl LineState {
    /// States in which this node is the authoritative owner.
    pub fn is_owner(&self) -> bool {
        matches!(self, LineState::Owned | LineState::Exclusive)
    }

    /// States in which the local copy may be read.
    pub fn is_readable(&self) -> bool {
        !matches!(self, LineState::Invalid)
    }
}

impl fmt::Display for LineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LineState::Invalid => write!(f, "I"),
            LineState::Shared => write!(f, "S"),
            LineState::Owned => write!(f, "O"),
            LineState::Exclusive => write!(f, "E"),
        }
    }
}

/// Unique identifier for a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionId(pub Uuid);

impl TransactionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
