//! # Cache Lines
//!
//! Per-id mutable record guarded by its own mutex. All fields are mutated only
//! by the engine while it holds that mutex.

use bytes::Bytes;
use galaxy_core::listener::CacheListener;
use galaxy_core::messages::{Message, MessageKind, MessageType};
use galaxy_core::{LineId, LineState, NodeId, TransactionId};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use crate::op::Op;

/// Line flag bits.
pub mod flags {
    /// A local write has not been backed up yet
    pub const MODIFIED: u8 = 0x01;
    /// A transaction holds the exclusive right to mutate the line
    pub const LOCKED: u8 = 0x02;
    /// The line was deleted and is waiting to be removed
    pub const DELETED: u8 = 0x04;
    /// A backup acknowledgment is outstanding
    pub const SLAVE: u8 = 0x08;
}

/// The one outstanding request a line may have on the wire.
#[derive(Debug, Clone)]
pub(crate) struct InFlight {
    pub kind: MessageKind,
    pub message_id: u64,
    /// `NodeId::NONE` for a broadcast probe
    pub target: NodeId,
    /// Peers that have not answered a broadcast probe yet
    pub awaiting: BTreeSet<NodeId>,
    pub tried_server: bool,
    pub deadline: Instant,
    pub payload: MessageType,
}

pub struct CacheLine {
    pub(crate) id: LineId,
    pub(crate) state: LineState,
    pub(crate) next_state: Option<LineState>,
    pub(crate) owner: NodeId,
    /// Set when the owner was only learned from a redirect
    pub(crate) owner_guessed: bool,
    /// Shared copies (state O); while `next_state` is set these are the
    /// nodes whose INVACK is still outstanding.
    pub(crate) sharers: BTreeSet<NodeId>,
    /// Message id of the INV sent to each sharer in the current O → E
    /// transition; only an INVACK carrying that id counts.
    pub(crate) inv_ids: BTreeMap<NodeId, u64>,
    pub(crate) version: u64,
    pub(crate) data: Option<Bytes>,
    pub(crate) flags: u8,
    pub(crate) locked_by: Option<TransactionId>,
    pub(crate) needs_refresh: bool,
    pub(crate) listener: Option<Arc<dyn CacheListener>>,

    pub(crate) pending_ops: VecDeque<Arc<Op>>,
    pub(crate) pending_messages: VecDeque<Message>,
    pub(crate) in_flight: Option<InFlight>,
    pub(crate) invalidation_deadline: Option<Instant>,

    pub(crate) backed_up_version: u64,
    pub(crate) pending_backup_acks: usize,
    /// Responses released once the current version is durable
    pub(crate) held_responses: Vec<Message>,
    /// INVACKs released by `Cache::slaves_inv_ack`
    pub(crate) deferred_inv_acks: Vec<Message>,

    /// Removed from the table; lookups that find a detached line retry.
    pub(crate) detached: bool,
}

impl CacheLine {
    pub(crate) fn new(id: LineId) -> Self {
        Self {
            id,
            state: LineState::Invalid,
            next_state: None,
            owner: NodeId::NONE,
            owner_guessed: false,
            sharers: BTreeSet::new(),
            inv_ids: BTreeMap::new(),
            version: 0,
            data: None,
            flags: 0,
            locked_by: None,
            needs_refresh: false,
            listener: None,
            pending_ops: VecDeque::new(),
            pending_messages: VecDeque::new(),
            in_flight: None,
            invalidation_deadline: None,
            backed_up_version: 0,
            pending_backup_acks: 0,
            held_responses: Vec::new(),
            deferred_inv_acks: Vec::new(),
            detached: false,
        }
    }

    pub(crate) fn has_flag(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }

    pub(crate) fn set_flag(&mut self, flag: u8) {
        self.flags |= flag;
    }

    pub(crate) fn clear_flag(&mut self, flag: u8) {
        self.flags &= !flag;
    }

    /// Remote reads, ownership requests and invalidations must wait.
    pub(crate) fn is_blocked(&self) -> bool {
        self.has_flag(flags::LOCKED)
            || (self.has_flag(flags::MODIFIED) && self.has_flag(flags::SLAVE))
            || self.next_state.is_some()
    }

    pub(crate) fn is_stable_exclusive(&self) -> bool {
        self.state == LineState::Exclusive && self.next_state.is_none()
    }

    pub(crate) fn is_evictable(&self) -> bool {
        matches!(self.state, LineState::Invalid | LineState::Shared)
            && self.next_state.is_none()
            && self.flags & !flags::DELETED == 0
            && self.locked_by.is_none()
            && self.pending_ops.is_empty()
            && self.pending_messages.is_empty()
            && self.in_flight.is_none()
            && self.pending_backup_acks == 0
            && self.held_responses.is_empty()
            && self.deferred_inv_acks.is_empty()
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.pending_ops.is_empty()
            && self.pending_messages.is_empty()
            && self.in_flight.is_none()
            && self.locked_by.is_none()
    }

    /// Whether `message_id` answers the INV this line sent to `node` for the
    /// transition still in progress.
    pub(crate) fn expects_inv_ack(&self, node: NodeId, message_id: u64) -> bool {
        self.next_state == Some(LineState::Exclusive)
            && self.inv_ids.get(&node) == Some(&message_id)
    }

    pub(crate) fn owner_known(&self, local: NodeId) -> Option<NodeId> {
        if self.owner.is_none() || self.owner == local {
            None
        } else {
            Some(self.owner)
        }
    }

    pub(crate) fn info(&self) -> LineInfo {
        LineInfo {
            id: self.id,
            state: self.state,
            next_state: self.next_state,
            owner: self.owner,
            sharers: self.sharers.iter().copied().collect(),
            version: self.version,
            data: self.data.clone(),
            flags: self.flags,
            locked: self.locked_by.is_some(),
            needs_refresh: self.needs_refresh,
            pending_ops: self.pending_ops.len(),
            pending_messages: self.pending_messages.len(),
            request_in_flight: self.in_flight.is_some(),
        }
    }
}

/// Point-in-time view of a line.
#[derive(Debug, Clone, PartialEq)]
pub struct LineInfo {
    pub id: LineId,
    pub state: LineState,
    pub next_state: Option<LineState>,
    pub owner: NodeId,
    pub sharers: Vec<NodeId>,
    pub version: u64,
    pub data: Option<Bytes>,
    pub flags: u8,
    pub locked: bool,
    pub needs_refresh: bool,
    pub pending_ops: usize,
    pub pending_messages: usize,
    pub request_in_flight: bool,
}

impl LineInfo {
    pub fn is_modified(&self) -> bool {
        self.flags & flags::MODIFIED != 0
    }

    pub fn is_backup_pending(&self) -> bool {
        self.flags & flags::SLAVE != 0
    }

    pub fn is_deleted(&self) -> bool {
        self.flags & flags::DELETED != 0
    }
}
