//! # Local Operation Model
//!
//! Operation kinds and result values for the engine's local entry points.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::LineId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpType {
    /// Read, acquiring a shared copy if needed
    Get,
    /// Transactional read that records a stale-read tripwire
    GetS,
    /// Read with exclusive ownership
    GetX,
    /// Write a line, allocating a fresh id when none is given
    Put,
    /// Overwrite an existing line
    Set,
    /// Delete a line
    Del,
    /// Allocate a block of fresh, empty lines
    Alloc,
    /// Hand shared copies to other nodes
    Push,
    /// Hand ownership to another node
    PushX,
    /// Deliver an application message to the line's owner
    Send,
    /// Apply a registered function to the line on its owner
    Invoke,
    /// Attach or detach a per-line listener
    Listen,
    /// GET/GETX targeted at the owner of another line
    GetFromOwner,
}

impl OpType {
    pub const COUNT: usize = 13;

    pub const ALL: [OpType; OpType::COUNT] = [
        OpType::Get,
        OpType::GetS,
        OpType::GetX,
        OpType::Put,
        OpType::Set,
        OpType::Del,
        OpType::Alloc,
        OpType::Push,
        OpType::PushX,
        OpType::Send,
        OpType::Invoke,
        OpType::Listen,
        OpType::GetFromOwner,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    /// Operations that modify line contents and therefore need exclusive
    /// ownership and a backup before the line is released.
    pub fn is_write(self) -> bool {
        matches!(
            self,
            OpType::Put | OpType::Set | OpType::Del | OpType::Alloc | OpType::Invoke
        )
    }

    /// Operations that take the line lock when run inside a transaction.
    pub fn locks_in_transaction(self) -> bool {
        self.is_write() || self == OpType::GetX
    }
}

impl fmt::Display for OpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OpType::Get => "GET",
            OpType::GetS => "GETS",
            OpType::GetX => "GETX",
            OpType::Put => "PUT",
            OpType::Set => "SET",
            OpType::Del => "DEL",
            OpType::Alloc => "ALLOC",
            OpType::Push => "PUSH",
            OpType::PushX => "PUSHX",
            OpType::Send => "SEND",
            OpType::Invoke => "INVOKE",
            OpType::Listen => "LSTN",
            OpType::GetFromOwner => "GET_FROM_OWNER",
        };
        f.write_str(name)
    }
}

/// Value produced by a completed operation.
#[derive(Debug, Clone, PartialEq)]
pub enum OpValue {
    /// The operation has no result value
    Nothing,
    /// Line contents (reads)
    Data(Option<Bytes>),
    /// A line id (PUT/ALLOC)
    Ref(LineId),
    /// The value returned by an INVOKE function
    Invoked(Bytes),
}

impl OpValue {
    pub fn data(&self) -> Option<&Bytes> {
        match self {
            OpValue::Data(data) => data.as_ref(),
            _ => None,
        }
    }

    pub fn into_data(self) -> Option<Bytes> {
        match self {
            OpValue::Data(data) => data,
            OpValue::Invoked(result) => Some(result),
            _ => None,
        }
    }

    pub fn as_ref_id(&self) -> Option<LineId> {
        match self {
            OpValue::Ref(id) => Some(*id),
            _ => None,
        }
    }
}
