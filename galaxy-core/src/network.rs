use parking_lot::RwLock;
use std::collections::BTreeSet;

use crate::messages::Message;
use crate::{NodeId, Result};

/// Outbound half of the wire transport.
///
/// Delivery is not guaranteed; the engine supplies its own deadlines. A send
/// to `NodeId::NONE` is a broadcast to every peer. Implementations must not
/// block and must not call back into the engine from `send`: the engine calls
/// it while holding a line lock.
pub trait Transport: Send + Sync {
    /// Sends a message to `message.to`.
    ///
    /// Returns `GalaxyError::NodeNotFound` when the target has left the
    /// cluster; the engine recovers from that locally.
    fn send(&self, message: Message) -> Result<()>;
}

/// View of cluster membership consumed by the engine.
pub trait Membership: Send + Sync {
    fn local_node(&self) -> NodeId;

    /// Every live peer except the local node and the server.
    fn peers(&self) -> Vec<NodeId>;

    fn has_server(&self) -> bool;

    fn is_member(&self, node: NodeId) -> bool {
        (node.is_server() && self.has_server()) || self.peers().contains(&node)
    }
}

/// Membership backed by an explicit node set, updated by whoever runs the
/// cluster (tests, or a discovery layer).
#[derive(Debug)]
pub struct StaticMembership {
    local: NodeId,
    peers: RwLock<BTreeSet<NodeId>>,
    has_server: bool,
}

impl StaticMembership {
    pub fn new(local: NodeId, peers: impl IntoIterator<Item = NodeId>, has_server: bool) -> Self {
        let peers = peers
            .into_iter()
            .filter(|n| *n != local && n.is_peer())
            .collect();
        Self {
            local,
            peers: RwLock::new(peers),
            has_server,
        }
    }

    pub fn add_peer(&self, node: NodeId) -> bool {
        if node == self.local || !node.is_peer() {
            return false;
        }
        self.peers.write().insert(node)
    }

    pub fn remove_peer(&self, node: NodeId) -> bool {
        self.peers.write().remove(&node)
    }
}

impl Membership for StaticMembership {
    fn local_node(&self) -> NodeId {
        self.local
    }

    fn peers(&self) -> Vec<NodeId> {
        self.peers.read().iter().copied().collect()
    }

    fn has_server(&self) -> bool {
        self.has_server
    }

    fn is_member(&self, node: NodeId) -> bool {
        (node.is_server() && self.has_server) || self.peers.read().contains(&node)
    }
}
