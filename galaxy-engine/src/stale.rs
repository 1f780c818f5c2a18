//! Shared copies grouped by the owner they were received from.
//!
//! A shared copy may be read locally for as long as nothing suggests its
//! owner has moved on. Ownership churn observed on any line of an owner (a
//! PUT from a different owner, or an INV) purges every copy received from
//! that owner, so the next read of each goes back to the network.

use galaxy_core::{LineId, NodeId};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Default)]
pub(crate) struct StalenessTracker {
    by_owner: Mutex<HashMap<NodeId, HashSet<LineId>>>,
    owner_of: Mutex<HashMap<LineId, NodeId>>,
}

impl StalenessTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, line: LineId, owner: NodeId) {
        let previous = self.owner_of.lock().insert(line, owner);
        let mut by_owner = self.by_owner.lock();
        if let Some(previous) = previous.filter(|p| *p != owner) {
            if let Some(lines) = by_owner.get_mut(&previous) {
                lines.remove(&line);
            }
        }
        by_owner.entry(owner).or_default().insert(line);
    }

    pub fn forget(&self, line: LineId) {
        let owner = self.owner_of.lock().remove(&line);
        if let Some(owner) = owner {
            if let Some(lines) = self.by_owner.lock().get_mut(&owner) {
                lines.remove(&line);
            }
        }
    }

    /// Removes and returns every line tracked under `owner`.
    pub fn take_lineage(&self, owner: NodeId) -> Vec<LineId> {
        let lines = self.by_owner.lock().remove(&owner).unwrap_or_default();
        let mut owner_of = self.owner_of.lock();
        for line in &lines {
            owner_of.remove(line);
        }
        lines.into_iter().collect()
    }
}
