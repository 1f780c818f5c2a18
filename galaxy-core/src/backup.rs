//! Durability gate collaborator.
//!
//! Every locally accepted write must reach the replica before the engine lets
//! any other node observe it. The engine drives the [`Backup`] collaborator
//! and reacts to its completion callbacks (`Cache::slaves_ack`,
//! `Cache::slaves_inv_ack`).

use bytes::Bytes;

use crate::messages::Message;
use crate::{LineId, NodeId};

pub trait Backup: Send + Sync {
    /// Opens a group of `backup` calls issued for one release point.
    fn start_backup(&self) {}

    /// Ships version `version` of `line` to the replica.
    ///
    /// Returns `true` when an acknowledgment will follow through
    /// `Cache::slaves_ack`; `false` when there is no replica and the write is
    /// as durable as it will get.
    fn backup(&self, line: LineId, version: u64, data: Option<&Bytes>) -> bool;

    /// Closes the group opened by `start_backup`.
    fn end_backup(&self) {}

    /// Pushes out anything buffered so a pending acknowledgment arrives sooner.
    /// Called before an owner answers a GET or GETX.
    fn flush(&self) {}

    /// Asks the replica to drop its copy of `line`, now owned by `owner`.
    ///
    /// Returns `true` when the engine must hold its INVACK until
    /// `Cache::slaves_inv_ack` is called.
    fn inv(&self, _line: LineId, _owner: NodeId) -> bool {
        false
    }

    /// Whether replicas are currently attached.
    fn has_slaves(&self) -> bool {
        false
    }

    /// BACKUP_PACKET and BACKUP_PACKETACK messages are handed over untouched.
    fn receive(&self, _message: Message) {}
}

/// Backup for nodes without a replica: every write is final immediately.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoBackup;

impl Backup for NoBackup {
    fn backup(&self, _line: LineId, _version: u64, _data: Option<&Bytes>) -> bool {
        false
    }
}
