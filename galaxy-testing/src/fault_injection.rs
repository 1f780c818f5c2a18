use std::collections::HashSet;
use tracing::{info, warn};

use galaxy_core::NodeId;

use crate::cluster::TestCluster;
use crate::network_sim::NetworkConditions;

#[derive(Debug, Clone)]
pub enum FaultType {
    /// The node leaves the cluster for good; survivors are told through
    /// `node_removed`.
    NodeCrash { node_id: NodeId },
    /// A replica takes over the node's identity; peers repeat what they
    /// still have outstanding at it.
    NodeSwitch { node_id: NodeId },
    NetworkPartition { nodes: HashSet<NodeId> },
    PacketLoss { rate: f64 },
    Duplication { rate: f64 },
}

impl TestCluster {
    pub fn inject_fault(&mut self, fault: FaultType) {
        match fault {
            FaultType::NodeCrash { node_id } => {
                warn!("Injecting node crash for {}", node_id);
                self.network().remove_node(node_id);
                if self.take_node(node_id).is_none() {
                    warn!("Node {} was not part of the cluster", node_id);
                }
                for node in self.nodes() {
                    node.membership.remove_peer(node_id);
                    node.cache.node_removed(node_id);
                }
            }

            FaultType::NodeSwitch { node_id } => {
                info!("Injecting node switch for {}", node_id);
                for node in self.nodes().filter(|n| n.id != node_id) {
                    node.cache.node_switched(node_id);
                }
            }

            FaultType::NetworkPartition { nodes } => {
                info!("Injecting network partition for {:?}", nodes);
                self.network().create_partition(nodes);
            }

            FaultType::PacketLoss { rate } => {
                info!("Injecting packet loss rate {}", rate);
                self.network().update_conditions(NetworkConditions {
                    packet_loss_rate: rate,
                    ..Default::default()
                });
            }

            FaultType::Duplication { rate } => {
                info!("Injecting message duplication rate {}", rate);
                self.network().update_conditions(NetworkConditions {
                    duplicate_rate: rate,
                    ..Default::default()
                });
            }
        }
    }

    /// Restores a reliable, unpartitioned network. Crashed nodes stay gone.
    pub fn heal(&self) {
        self.network().heal_partitions();
        self.network().update_conditions(NetworkConditions::default());
        info!("Healed network faults");
    }
}
