use parking_lot::{Mutex, RwLock};
use rand::Rng;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

use galaxy_core::messages::Message;
use galaxy_core::network::Transport;
use galaxy_core::serialization::Serializer;
use galaxy_core::{GalaxyError, NodeId, Result};
use galaxy_engine::Cache;

/// Anything that can be handed a message by the simulator.
pub trait Endpoint: Send + Sync {
    fn deliver(&self, message: Message);
}

impl Endpoint for Cache {
    fn deliver(&self, message: Message) {
        self.receive(message);
    }
}

#[derive(Debug, Clone, Default)]
pub struct NetworkConditions {
    pub packet_loss_rate: f64,
    /// Chance that a message is delivered twice
    pub duplicate_rate: f64,
}

#[derive(Debug, Default, Clone)]
pub struct NetworkStats {
    pub messages_sent: u64,
    pub messages_delivered: u64,
    pub messages_dropped: u64,
    pub messages_duplicated: u64,
    pub total_bytes: usize,
}

impl NetworkStats {
    pub fn delivery_rate(&self) -> f64 {
        if self.messages_sent > 0 {
            self.messages_delivered as f64 / self.messages_sent as f64
        } else {
            1.0
        }
    }
}

/// A message as it travels: an encoded, checksummed frame.
#[derive(Debug)]
struct PendingMessage {
    to: NodeId,
    frame: Arc<[u8]>,
}

/// In-memory message bus. Messages are queued in send order and delivered
/// one at a time by whoever drives the simulator, so runs are reproducible
/// apart from injected loss and duplication.
pub struct NetworkSimulator {
    nodes: RwLock<HashMap<NodeId, Weak<dyn Endpoint>>>,
    conditions: RwLock<NetworkConditions>,
    partitions: RwLock<Vec<HashSet<NodeId>>>,
    pending_messages: Mutex<VecDeque<PendingMessage>>,
    message_stats: Mutex<NetworkStats>,
    serializer: Serializer,
    shutdown: AtomicBool,
}

impl NetworkSimulator {
    pub fn new() -> Self {
        Self {
            nodes: RwLock::new(HashMap::new()),
            conditions: RwLock::new(NetworkConditions::default()),
            partitions: RwLock::new(Vec::new()),
            pending_messages: Mutex::new(VecDeque::new()),
            message_stats: Mutex::new(NetworkStats::default()),
            serializer: Serializer::binary(),
            shutdown: AtomicBool::new(false),
        }
    }

    pub fn add_node(&self, node_id: NodeId, endpoint: Weak<dyn Endpoint>) {
        self.nodes.write().insert(node_id, endpoint);
        info!("Added node {} to network simulation", node_id);
    }

    /// Takes `node_id` off the bus. Sends to it fail with `NodeNotFound`
    /// and anything still queued for it is dropped on delivery.
    pub fn remove_node(&self, node_id: NodeId) {
        self.nodes.write().remove(&node_id);
        info!("Removed node {} from network simulation", node_id);
    }

    pub fn has_node(&self, node_id: NodeId) -> bool {
        self.nodes.read().contains_key(&node_id)
    }

    pub fn update_conditions(&self, conditions: NetworkConditions) {
        debug!("Updated network conditions: {:?}", conditions);
        *self.conditions.write() = conditions;
    }

    pub fn create_partition(&self, nodes: HashSet<NodeId>) {
        warn!("Created network partition with nodes: {:?}", nodes);
        self.partitions.write().push(nodes);
    }

    pub fn heal_partitions(&self) {
        self.partitions.write().clear();
        info!("Healed all network partitions");
    }

    fn are_nodes_partitioned(&self, node1: NodeId, node2: NodeId) -> bool {
        self.partitions
            .read()
            .iter()
            .any(|p| p.contains(&node1) != p.contains(&node2))
    }

    /// Queues `message` for its recipient, or for every other peer if it is
    /// a broadcast. The server never receives broadcasts.
    pub fn send_message(&self, message: Message) -> Result<()> {
        let recipients: Vec<NodeId> = {
            let nodes = self.nodes.read();
            if message.is_broadcast() {
                nodes
                    .keys()
                    .copied()
                    .filter(|n| n.is_peer() && *n != message.from)
                    .collect()
            } else if nodes.contains_key(&message.to) {
                vec![message.to]
            } else {
                return Err(GalaxyError::NodeNotFound { node: message.to });
            }
        };

        let frame: Arc<[u8]> = self.serializer.encode_frame(&message)?.into();
        let size = frame.len();
        let conditions = self.conditions.read().clone();
        let mut rng = rand::thread_rng();
        let mut queued = Vec::with_capacity(recipients.len());
        let mut dropped = 0;
        let mut duplicated = 0;

        for to in recipients {
            if self.are_nodes_partitioned(message.from, to) {
                debug!("Message from {} to {} dropped due to partition", message.from, to);
                dropped += 1;
                continue;
            }
            if rng.gen::<f64>() < conditions.packet_loss_rate {
                debug!("Message from {} to {} dropped due to packet loss", message.from, to);
                dropped += 1;
                continue;
            }
            queued.push(PendingMessage {
                to,
                frame: Arc::clone(&frame),
            });
            if rng.gen::<f64>() < conditions.duplicate_rate {
                duplicated += 1;
                queued.push(PendingMessage {
                    to,
                    frame: Arc::clone(&frame),
                });
            }
        }

        {
            let mut stats = self.message_stats.lock();
            stats.messages_sent += 1;
            stats.messages_dropped += dropped;
            stats.messages_duplicated += duplicated;
            stats.total_bytes += size;
        }
        self.pending_messages.lock().extend(queued);
        Ok(())
    }

    /// Delivers the oldest queued message. Returns false if nothing was queued.
    pub fn deliver_next(&self) -> bool {
        let Some(pending) = self.pending_messages.lock().pop_front() else {
            return false;
        };
        let endpoint = self.nodes.read().get(&pending.to).and_then(Weak::upgrade);
        match endpoint {
            Some(endpoint) => match self.serializer.decode_frame(&pending.frame) {
                Ok(message) => {
                    self.message_stats.lock().messages_delivered += 1;
                    endpoint.deliver(message);
                }
                Err(e) => {
                    warn!("Dropping undecodable frame for {}: {}", pending.to, e);
                    self.message_stats.lock().messages_dropped += 1;
                }
            },
            None => {
                debug!("Target node {} not found for message delivery", pending.to);
                self.message_stats.lock().messages_dropped += 1;
            }
        }
        true
    }

    /// Delivers every message queued at the time of the call; messages they
    /// trigger wait for the next round. Returns the number delivered.
    pub fn deliver_pending(&self) -> usize {
        let queued = self.pending_count();
        let mut delivered = 0;
        while delivered < queued && self.deliver_next() {
            delivered += 1;
        }
        delivered
    }

    /// Delivers until the bus is empty. Fails if more than `limit` messages
    /// are needed, which points at a message storm.
    pub fn run_until_quiet(&self, limit: usize) -> Result<usize> {
        let mut delivered = 0;
        while self.deliver_next() {
            delivered += 1;
            if delivered > limit {
                return Err(GalaxyError::internal(format!(
                    "network still busy after {} messages",
                    limit
                )));
            }
        }
        Ok(delivered)
    }

    pub fn pending_count(&self) -> usize {
        self.pending_messages.lock().len()
    }

    /// Background delivery loop for async tests; stops after `shutdown`.
    pub async fn run_simulation(&self) {
        info!("Starting network simulation");
        let mut delivery_interval = tokio::time::interval(Duration::from_millis(1));
        while !self.shutdown.load(Ordering::SeqCst) {
            delivery_interval.tick().await;
            self.deliver_pending();
        }
        info!("Network simulation stopped");
    }

    pub fn get_stats(&self) -> NetworkStats {
        self.message_stats.lock().clone()
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        info!("Network simulation shutdown requested");
    }
}

impl Default for NetworkSimulator {
    fn default() -> Self {
        Self::new()
    }
}

/// One node's view of the simulator.
pub struct SimulatedNetwork {
    node_id: NodeId,
    simulator: Arc<NetworkSimulator>,
}

impl SimulatedNetwork {
    pub fn new(node_id: NodeId, simulator: Arc<NetworkSimulator>) -> Self {
        Self { node_id, simulator }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }
}

impl Transport for SimulatedNetwork {
    fn send(&self, message: Message) -> Result<()> {
        if message.from != self.node_id {
            return Err(GalaxyError::network(format!(
                "{} cannot send as {}",
                self.node_id, message.from
            )));
        }
        self.simulator.send_message(message)
    }
}
