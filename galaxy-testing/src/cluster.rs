//! Multi-node harness: one engine per peer wired to a shared simulator.

use anyhow::{anyhow, bail, Context};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use galaxy_core::network::{Membership, StaticMembership};
use galaxy_core::ops::OpValue;
use galaxy_core::{LineId, LineState, NodeId};
use galaxy_engine::{Cache, CacheConfig, LineInfo, Op, OpStatus};
use galaxy_storage::HeapStorage;

use crate::doubles::{BusRefAllocator, IdSequence, RecordingBackup, RecordingListener};
use crate::network_sim::{Endpoint, NetworkSimulator, SimulatedNetwork};
use crate::server::ScriptedServer;

/// Upper bound on messages delivered while settling one operation.
const MESSAGE_BUDGET: usize = 100_000;

pub struct ClusterNode {
    pub id: NodeId,
    pub cache: Arc<Cache>,
    pub backup: Arc<RecordingBackup>,
    pub membership: Arc<StaticMembership>,
    pub storage: Arc<HeapStorage>,
    pub listener: Arc<RecordingListener>,
    pub allocator: Arc<BusRefAllocator>,
}

pub struct TestCluster {
    network: Arc<NetworkSimulator>,
    nodes: BTreeMap<NodeId, ClusterNode>,
    server: Option<Arc<ScriptedServer>>,
    config: CacheConfig,
}

impl TestCluster {
    /// Peers `1..=node_count`, plus a scripted server when `with_server`.
    pub fn new(node_count: usize, with_server: bool) -> anyhow::Result<Self> {
        Self::with_config(node_count, with_server, CacheConfig::default())
    }

    pub fn with_config(
        node_count: usize,
        with_server: bool,
        config: CacheConfig,
    ) -> anyhow::Result<Self> {
        if node_count == 0 || node_count > i16::MAX as usize {
            bail!("cannot build a cluster of {} nodes", node_count);
        }
        let network = Arc::new(NetworkSimulator::new());
        let sequence = Arc::new(IdSequence::new());
        let ids: Vec<NodeId> = (1..=node_count as i16).map(NodeId::new).collect();

        let server = with_server.then(|| {
            let server = Arc::new(ScriptedServer::new(Arc::clone(&network)));
            let endpoint: Arc<dyn Endpoint> = server.clone();
            network.add_node(NodeId::SERVER, Arc::downgrade(&endpoint));
            server
        });

        let mut nodes = BTreeMap::new();
        for &id in &ids {
            let membership = Arc::new(StaticMembership::new(
                id,
                ids.iter().copied().filter(|n| *n != id),
                with_server,
            ));
            let backup = Arc::new(RecordingBackup::new());
            let storage = Arc::new(HeapStorage::unbounded());
            let listener = Arc::new(RecordingListener::new());
            let allocator = Arc::new(BusRefAllocator::new(
                id,
                Arc::clone(&sequence),
                Arc::clone(&network),
            ));
            let transport = Arc::new(SimulatedNetwork::new(id, Arc::clone(&network)));

            let cache = Cache::builder(config.clone(), membership.clone(), transport)
                .backup(backup.clone())
                .ref_allocator(allocator.clone())
                .storage(storage.clone())
                .build()
                .with_context(|| format!("building cache for {}", id))?;
            let cache = Arc::new(cache);
            cache.set_listener(Some(listener.clone()));

            let endpoint: Arc<dyn Endpoint> = cache.clone();
            network.add_node(id, Arc::downgrade(&endpoint));
            nodes.insert(
                id,
                ClusterNode {
                    id,
                    cache,
                    backup,
                    membership,
                    storage,
                    listener,
                    allocator,
                },
            );
        }

        info!(
            "Started test cluster with {} nodes{}",
            node_count,
            if with_server { " and a server" } else { "" }
        );
        Ok(Self {
            network,
            nodes,
            server,
            config,
        })
    }

    pub fn network(&self) -> &Arc<NetworkSimulator> {
        &self.network
    }

    pub fn server(&self) -> Option<&Arc<ScriptedServer>> {
        self.server.as_ref()
    }

    pub fn node(&self, id: i16) -> anyhow::Result<&ClusterNode> {
        self.nodes
            .get(&NodeId::new(id))
            .ok_or_else(|| anyhow!("no node {} in the cluster", id))
    }

    pub fn cache(&self, id: i16) -> anyhow::Result<&Arc<Cache>> {
        Ok(&self.node(id)?.cache)
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.keys().copied().collect()
    }

    pub(crate) fn nodes(&self) -> impl Iterator<Item = &ClusterNode> {
        self.nodes.values()
    }

    pub(crate) fn take_node(&mut self, id: NodeId) -> Option<ClusterNode> {
        self.nodes.remove(&id)
    }

    /// Runs `op` on node `id` and drives the network until it completes.
    /// Expired requests are swept while the network is idle, so a lost
    /// message surfaces as a `Timeout` once `request_timeout` passes.
    pub fn run_op(&self, id: i16, op: Op) -> anyhow::Result<galaxy_core::Result<OpValue>> {
        let node = self.node(id)?;
        let pending = match node.cache.run_op(op) {
            Ok(OpStatus::Done(value)) => return Ok(Ok(value)),
            Ok(OpStatus::Pending(pending)) => pending,
            Err(e) => return Ok(Err(e)),
        };

        let deadline = Instant::now() + self.config.op_timeout;
        let mut delivered = 0;
        loop {
            if let Some(result) = pending.result() {
                return Ok(result);
            }
            if self.network.deliver_next() {
                delivered += 1;
                if delivered > MESSAGE_BUDGET {
                    bail!("operation on node {} still pending after {} messages", id, delivered);
                }
                continue;
            }
            if self.sweep_timeouts() > 0 {
                continue;
            }
            if Instant::now() >= deadline {
                bail!(
                    "operation on node {} stalled on {:?} with an idle network",
                    id,
                    pending.line()
                );
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Like `run_op`, failing on an engine error.
    pub fn expect_op(&self, id: i16, op: Op) -> anyhow::Result<OpValue> {
        self.run_op(id, op)?
            .map_err(|e| anyhow!("operation on node {} failed: {}", id, e))
    }

    pub fn run_until_quiet(&self) -> anyhow::Result<usize> {
        Ok(self.network.run_until_quiet(MESSAGE_BUDGET)?)
    }

    pub fn sweep_timeouts(&self) -> usize {
        self.nodes.values().map(|n| n.cache.sweep_timeouts()).sum()
    }

    /// Acknowledges every outstanding backup on every node.
    pub fn ack_backups(&self) -> anyhow::Result<usize> {
        let mut acked = 0;
        for node in self.nodes.values() {
            acked += node.backup.ack_all(&node.cache)?;
        }
        Ok(acked)
    }

    pub fn line_info(&self, id: i16, line: LineId) -> anyhow::Result<Option<LineInfo>> {
        Ok(self.cache(id)?.line_info(line))
    }

    /// Checks the single-owner invariant for `line` on a quiet network: at
    /// most one node holds it in O or E, and every shared copy in use
    /// matches the owner's version and data.
    pub fn check_coherence(&self, line: LineId) -> anyhow::Result<()> {
        let infos: Vec<(NodeId, LineInfo)> = self
            .nodes
            .values()
            .filter_map(|n| n.cache.line_info(line).map(|info| (n.id, info)))
            .collect();

        let owners: Vec<&(NodeId, LineInfo)> =
            infos.iter().filter(|(_, i)| i.state.is_owner()).collect();
        if owners.len() > 1 {
            let ids: Vec<NodeId> = owners.iter().map(|(n, _)| *n).collect();
            bail!("{} has {} owners: {:?}", line, owners.len(), ids);
        }
        let Some((owner, owned)) = owners.first() else {
            return Ok(());
        };

        for (node, info) in &infos {
            if info.state != LineState::Shared || info.needs_refresh {
                continue;
            }
            if info.version != owned.version || info.data != owned.data {
                bail!(
                    "{} on {} is v{} but owner {} has v{}",
                    line,
                    node,
                    info.version,
                    owner,
                    owned.version
                );
            }
            if !owned.sharers.contains(node) && owned.state == LineState::Exclusive {
                bail!("{} shared on {} while {} holds it exclusively", line, node, owner);
            }
        }
        debug!("{} coherent across {} nodes", line, infos.len());
        Ok(())
    }

    /// Every node still in the cluster, as the membership of `id` sees it.
    pub fn peers_of(&self, id: i16) -> anyhow::Result<Vec<NodeId>> {
        Ok(self.node(id)?.membership.peers())
    }
}
