//! # Coherence Engine
//!
//! [`Cache`] owns the id→line table and drives every line state transition.
//! Local operations enter through `run_op`/`do_op` (see `local.rs`), protocol
//! messages through `receive` (see `remote.rs`).
//!
//! Every line is guarded by its own mutex; there is no global lock. Work that
//! must not happen under a line lock (listener callbacks, staleness purges of
//! other lines, removals, eviction) is collected in a [`Dispatch`] and carried
//! out once the lock is released.

use bytes::Bytes;
use dashmap::DashMap;
use galaxy_core::backup::{Backup, NoBackup};
use galaxy_core::function::LineFunction;
use galaxy_core::listener::CacheListener;
use galaxy_core::messages::{LineMessage, Message, MessageType};
use galaxy_core::network::{Membership, Transport};
use galaxy_core::refs::RefAllocator;
use galaxy_core::storage::Storage;
use galaxy_core::{GalaxyError, LineId, LineState, NodeId, Result, ValidationConfig};
use galaxy_storage::HeapStorage;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::CacheConfig;
use crate::eviction::LruIndex;
use crate::line::{flags, CacheLine, InFlight, LineInfo};
use crate::monitor::{CacheMonitor, CacheStatistics, NoopMonitor, StatisticsSnapshot};
use crate::op::Op;
use crate::refs::RefWindow;
use crate::stale::StalenessTracker;

/// Extra LRU entries inspected past the number of lines to evict, so a few
/// busy lines at the cold end do not stall eviction.
const EVICTION_SCAN_SLACK: usize = 64;

pub(crate) enum Event {
    Received { version: u64, data: Option<Bytes> },
    Invalidated,
    Evicted,
    Message(Bytes),
}

pub(crate) struct Notification {
    listeners: Vec<Arc<dyn CacheListener>>,
    line: LineId,
    event: Event,
}

impl Notification {
    fn deliver(self) {
        for listener in &self.listeners {
            match &self.event {
                Event::Received { version, data } => {
                    listener.received(self.line, *version, data.as_ref())
                }
                Event::Invalidated => listener.invalidated(self.line),
                Event::Evicted => listener.evicted(self.line),
                Event::Message(data) => listener.message_received(self.line, data),
            }
        }
    }
}

/// Context threaded through one locked section of a line.
#[derive(Default)]
pub(crate) struct Dispatch {
    /// Replies synthesized locally (departed nodes, empty probes), handled
    /// against the same line before its lock is released
    pub synthesized: VecDeque<Message>,
    pub notifications: Vec<Notification>,
    /// Owners whose shared copies must be revalidated
    pub purges: Vec<NodeId>,
    pub removals: Vec<LineId>,
}

impl Dispatch {
    pub fn notify(&mut self, listeners: Vec<Arc<dyn CacheListener>>, line: LineId, event: Event) {
        if !listeners.is_empty() {
            self.notifications.push(Notification {
                listeners,
                line,
                event,
            });
        }
    }
}

/// The per-node coherence engine.
pub struct Cache {
    pub(crate) config: CacheConfig,
    pub(crate) local: NodeId,
    pub(crate) membership: Arc<dyn Membership>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) backup: Arc<dyn Backup>,
    pub(crate) ref_allocator: Option<Arc<dyn RefAllocator>>,
    pub(crate) storage: Arc<dyn Storage>,
    monitor: Arc<dyn CacheMonitor>,
    statistics: CacheStatistics,
    listener: RwLock<Option<Arc<dyn CacheListener>>>,
    pub(crate) functions: DashMap<String, Arc<dyn LineFunction>>,
    lines: DashMap<LineId, Arc<Mutex<CacheLine>>>,
    lru: LruIndex,
    pub(crate) stale: StalenessTracker,
    pub(crate) refs: Mutex<RefWindow>,
    next_message_id: AtomicU64,
    pub(crate) validation: ValidationConfig,
}

/// Assembles a [`Cache`] from its collaborators.
///
/// Backup defaults to [`NoBackup`], storage to an unbounded [`HeapStorage`],
/// the monitor to [`NoopMonitor`]. Without a ref allocator, PUT without an id
/// and ALLOC fail with `InvalidOperation`.
pub struct CacheBuilder {
    config: CacheConfig,
    membership: Arc<dyn Membership>,
    transport: Arc<dyn Transport>,
    backup: Option<Arc<dyn Backup>>,
    ref_allocator: Option<Arc<dyn RefAllocator>>,
    storage: Option<Arc<dyn Storage>>,
    monitor: Option<Arc<dyn CacheMonitor>>,
}

impl CacheBuilder {
    pub fn backup(mut self, backup: Arc<dyn Backup>) -> Self {
        self.backup = Some(backup);
        self
    }

    pub fn ref_allocator(mut self, allocator: Arc<dyn RefAllocator>) -> Self {
        self.ref_allocator = Some(allocator);
        self
    }

    pub fn storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn monitor(mut self, monitor: Arc<dyn CacheMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn build(self) -> Result<Cache> {
        self.config.validate()?;
        let local = self.membership.local_node();
        if !local.is_peer() {
            return Err(GalaxyError::invalid_operation(format!(
                "{} cannot run a peer cache",
                local
            )));
        }

        let validation = ValidationConfig {
            max_item_size: self.config.max_item_size,
            ..ValidationConfig::default()
        };

        info!("Starting cache on {}", local);
        Ok(Cache {
            local,
            membership: self.membership,
            transport: self.transport,
            backup: self.backup.unwrap_or_else(|| Arc::new(NoBackup)),
            ref_allocator: self.ref_allocator,
            storage: self
                .storage
                .unwrap_or_else(|| Arc::new(HeapStorage::unbounded())),
            monitor: self.monitor.unwrap_or_else(|| Arc::new(NoopMonitor)),
            statistics: CacheStatistics::new(),
            listener: RwLock::new(None),
            functions: DashMap::new(),
            lines: DashMap::new(),
            lru: LruIndex::new(),
            stale: StalenessTracker::new(),
            refs: Mutex::new(RefWindow::new()),
            next_message_id: AtomicU64::new(1),
            validation,
            config: self.config,
        })
    }
}

impl Cache {
    pub fn builder(
        config: CacheConfig,
        membership: Arc<dyn Membership>,
        transport: Arc<dyn Transport>,
    ) -> CacheBuilder {
        CacheBuilder {
            config,
            membership,
            transport,
            backup: None,
            ref_allocator: None,
            storage: None,
            monitor: None,
        }
    }

    pub fn local_node(&self) -> NodeId {
        self.local
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Registers the cache-wide listener, notified for every line.
    pub fn set_listener(&self, listener: Option<Arc<dyn CacheListener>>) {
        *self.listener.write() = listener;
    }

    /// Registers a function that INVOKE can apply by `name`.
    pub fn register_function(&self, name: impl Into<String>, function: impl LineFunction + 'static) {
        self.functions.insert(name.into(), Arc::new(function));
    }

    pub fn line_info(&self, line: LineId) -> Option<LineInfo> {
        let entry = self.entry(line)?;
        let line = entry.lock();
        (!line.detached).then(|| line.info())
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Bytes of line data currently held through the storage collaborator.
    pub fn total_allocated(&self) -> usize {
        self.storage.total_allocated()
    }

    pub fn statistics(&self) -> StatisticsSnapshot {
        self.statistics.snapshot()
    }

    pub(crate) fn observe(&self, event: impl Fn(&dyn CacheMonitor)) {
        event(&self.statistics);
        event(self.monitor.as_ref());
    }

    pub(crate) fn next_message_id(&self) -> u64 {
        self.next_message_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn has_server(&self) -> bool {
        self.membership.has_server()
    }

    pub(crate) fn listeners_for(&self, line: &CacheLine) -> Vec<Arc<dyn CacheListener>> {
        line.listener
            .iter()
            .cloned()
            .chain(self.listener.read().iter().cloned())
            .collect()
    }

    fn entry(&self, line: LineId) -> Option<Arc<Mutex<CacheLine>>> {
        self.lines.get(&line).map(|entry| Arc::clone(entry.value()))
    }

    fn entry_or_insert(&self, line: LineId) -> Arc<Mutex<CacheLine>> {
        Arc::clone(
            self.lines
                .entry(line)
                .or_insert_with(|| Arc::new(Mutex::new(CacheLine::new(line))))
                .value(),
        )
    }

    /// Runs `f` under the lock of `line`, creating the line in state I when
    /// `create` is set. Returns `None` if the line does not exist.
    pub(crate) fn with_line<R>(
        &self,
        id: LineId,
        create: bool,
        f: impl FnOnce(&mut CacheLine, &mut Dispatch) -> R,
    ) -> Option<R> {
        let mut ctx = Dispatch::default();
        let result = loop {
            let entry = if create {
                self.entry_or_insert(id)
            } else {
                match self.entry(id) {
                    Some(entry) => entry,
                    None => break None,
                }
            };
            let mut line = entry.lock();
            if line.detached {
                continue;
            }
            if create {
                self.lru.touch(id);
            }
            let result = f(&mut *line, &mut ctx);
            while let Some(message) = ctx.synthesized.pop_front() {
                self.handle_message(&mut *line, message, &mut ctx);
            }
            break Some(result);
        };
        self.finish(ctx);
        result
    }

    fn finish(&self, ctx: Dispatch) {
        let Dispatch {
            notifications,
            purges,
            removals,
            ..
        } = ctx;
        for owner in purges {
            self.purge_lineage(owner);
        }
        for line in removals {
            self.remove_deleted(line);
        }
        for notification in notifications {
            notification.deliver();
        }
        self.evict_if_needed();
    }

    fn purge_lineage(&self, owner: NodeId) {
        let mut purged = 0;
        for id in self.stale.take_lineage(owner) {
            if let Some(entry) = self.entry(id) {
                let mut line = entry.lock();
                if !line.detached && line.state == LineState::Shared && line.owner == owner {
                    line.needs_refresh = true;
                    purged += 1;
                }
            }
        }
        if purged > 0 {
            debug!("Purged {} shared copies received from {}", purged, owner);
            self.observe(|m| m.stale_purged(purged));
        }
    }

    fn remove_deleted(&self, id: LineId) {
        let Some(entry) = self.entry(id) else {
            return;
        };
        let mut line = entry.lock();
        if line.detached
            || !line.has_flag(flags::DELETED)
            || line.state != LineState::Invalid
            || !line.is_idle()
            || line.pending_backup_acks > 0
        {
            return;
        }
        line.detached = true;
        if let Some(data) = line.data.take() {
            self.storage.deallocate(id, data);
        }
        self.lines.remove_if(&id, |_, v| Arc::ptr_eq(v, &entry));
        drop(line);
        self.lru.remove(id);
        self.stale.forget(id);
        debug!("Removed deleted line {}", id);
    }

    /// Evicts least-recently-used I/S lines while the table exceeds
    /// `max_capacity`. Busy lines are skipped, never waited for.
    fn evict_if_needed(&self) {
        let excess = self.lines.len().saturating_sub(self.config.max_capacity);
        if excess == 0 {
            return;
        }

        let mut evicted = Vec::new();
        for id in self.lru.oldest(excess + EVICTION_SCAN_SLACK) {
            if evicted.len() >= excess {
                break;
            }
            let Some(entry) = self.entry(id) else {
                self.lru.remove(id);
                continue;
            };
            let Some(mut line) = entry.try_lock() else {
                continue;
            };
            if line.detached || !line.is_evictable() {
                continue;
            }
            line.detached = true;
            if let Some(data) = line.data.take() {
                self.storage.deallocate(id, data);
            }
            let listeners = self.listeners_for(&line);
            self.lines.remove_if(&id, |_, v| Arc::ptr_eq(v, &entry));
            drop(line);
            self.lru.remove(id);
            self.stale.forget(id);
            evicted.push(Notification {
                listeners,
                line: id,
                event: Event::Evicted,
            });
        }

        for notification in evicted {
            debug!("Evicted line {}", notification.line);
            self.observe(|m| m.evicted());
            notification.deliver();
        }
    }

    /// Sends a message, counting it on success.
    pub(crate) fn send_message(&self, message: Message) -> Result<()> {
        let kind = message.kind();
        debug!("Sending {}", message);
        self.transport.send(message)?;
        self.observe(|m| m.message_sent(kind));
        Ok(())
    }

    /// Sends a response; a requester that has left simply never gets it.
    pub(crate) fn send_reply(&self, message: Message) {
        if let Err(e) = self.send_message(message) {
            debug!("Dropping reply: {}", e);
        }
    }

    /// Puts a new request for `line` on the wire and records it as the line's
    /// in-flight request. `op` waits on it.
    pub(crate) fn start_request(
        &self,
        line: &mut CacheLine,
        op: &Op,
        payload: MessageType,
        target: NodeId,
        ctx: &mut Dispatch,
    ) {
        let message_id = self.next_message_id();
        line.in_flight = Some(InFlight {
            kind: payload.kind(),
            message_id,
            target,
            awaiting: BTreeSet::new(),
            tried_server: target.is_server(),
            deadline: Instant::now() + self.config.request_timeout,
            payload,
        });
        op.wait_on(message_id);
        self.transmit_in_flight(line, ctx);
    }

    /// Re-sends the in-flight request to `target` under a new message id, so
    /// late answers to the old id are recognised as duplicates.
    pub(crate) fn reissue(&self, line: &mut CacheLine, target: NodeId, ctx: &mut Dispatch) {
        let message_id = self.next_message_id();
        let Some(flight) = line.in_flight.as_mut() else {
            return;
        };
        let previous_id = flight.message_id;
        flight.message_id = message_id;
        flight.target = target;
        flight.tried_server |= target.is_server();
        flight.deadline = Instant::now() + self.config.request_timeout;
        for op in &line.pending_ops {
            if op.is_waiting_on(previous_id) {
                op.wait_on(message_id);
            }
        }
        self.transmit_in_flight(line, ctx);
    }

    fn transmit_in_flight(&self, line: &mut CacheLine, ctx: &mut Dispatch) {
        let id = line.id;
        let Some(flight) = line.in_flight.as_mut() else {
            return;
        };
        flight.awaiting = if flight.target.is_none() {
            self.membership.peers().into_iter().collect()
        } else {
            BTreeSet::new()
        };
        let not_found = |from: NodeId, message_id: u64| {
            Message::new(
                from,
                self.local,
                message_id,
                true,
                MessageType::NotFound(LineMessage { line: id }),
            )
        };

        if flight.target.is_none() && flight.awaiting.is_empty() {
            debug!("No peers to probe for {}", id);
            ctx.synthesized
                .push_back(not_found(self.local, flight.message_id));
            return;
        }

        let message = Message::request(
            self.local,
            flight.target,
            flight.message_id,
            flight.payload.clone(),
        );
        match self.send_message(message) {
            Ok(()) => {}
            Err(GalaxyError::NodeNotFound { node }) => {
                debug!("{} left before {} for {}; treating as not found", node, flight.kind, id);
                ctx.synthesized.push_back(not_found(node, flight.message_id));
            }
            Err(e) => warn!("Failed to send {} for {}: {}", flight.kind, id, e),
        }
    }

    /// Sends INV to every sharer of an owned line. A sharer that has left is
    /// treated as having acknowledged. Re-sends within one transition reuse
    /// the sharer's INV id.
    pub(crate) fn send_invalidations(
        &self,
        line: &mut CacheLine,
        previous_owner: NodeId,
        ctx: &mut Dispatch,
    ) {
        let targets: Vec<NodeId> = line.sharers.iter().copied().collect();
        for node in targets {
            let message_id = *line
                .inv_ids
                .entry(node)
                .or_insert_with(|| self.next_message_id());
            let message = Message::inv(self.local, node, message_id, line.id, previous_owner);
            match self.send_message(message) {
                Ok(()) => {}
                Err(GalaxyError::NodeNotFound { node }) => {
                    debug!("Sharer {} of {} left; self-acknowledging", node, line.id);
                    ctx.synthesized.push_back(Message::new(
                        node,
                        self.local,
                        message_id,
                        true,
                        MessageType::InvAck(LineMessage { line: line.id }),
                    ));
                }
                Err(e) => warn!("Failed to invalidate {} at {}: {}", line.id, node, e),
            }
        }
        line.invalidation_deadline = Some(Instant::now() + self.config.request_timeout);
    }

    /// O → E: invalidate every sharer, or become E at once if there are none.
    pub(crate) fn begin_invalidation(&self, line: &mut CacheLine, ctx: &mut Dispatch) {
        line.sharers.remove(&self.local);
        line.inv_ids.clear();
        if line.sharers.is_empty() {
            line.state = LineState::Exclusive;
            line.next_state = None;
            return;
        }
        line.next_state = Some(LineState::Exclusive);
        self.send_invalidations(line, self.local, ctx);
    }

    /// Backs up the line's current version once, bracketed as its own group.
    pub(crate) fn release_write(&self, line: &mut CacheLine, ctx: &mut Dispatch) {
        self.backup.start_backup();
        self.backup_line(line, ctx);
        self.backup.end_backup();
    }

    /// Ships the current version to the backup if it has not been shipped yet.
    pub(crate) fn backup_line(&self, line: &mut CacheLine, ctx: &mut Dispatch) {
        if !line.has_flag(flags::MODIFIED) || line.backed_up_version == line.version {
            return;
        }
        line.backed_up_version = line.version;

        if line.has_flag(flags::DELETED) && self.has_server() {
            let message = Message::request(
                self.local,
                NodeId::SERVER,
                self.next_message_id(),
                MessageType::Del(LineMessage { line: line.id }),
            );
            if let Err(e) = self.send_message(message) {
                warn!("Failed to notify server of deletion of {}: {}", line.id, e);
            }
        }

        if self
            .backup
            .backup(line.id, line.version, line.data.as_ref())
        {
            line.set_flag(flags::SLAVE);
            line.pending_backup_acks += 1;
        } else if line.pending_backup_acks == 0 {
            line.clear_flag(flags::MODIFIED);
            self.on_durable(line, ctx);
        }
    }

    fn on_durable(&self, line: &mut CacheLine, ctx: &mut Dispatch) {
        for response in std::mem::take(&mut line.held_responses) {
            self.send_reply(response);
        }
        if line.has_flag(flags::DELETED) {
            self.finalize_delete(line, ctx);
        }
    }

    fn finalize_delete(&self, line: &mut CacheLine, ctx: &mut Dispatch) {
        if let Some(data) = line.data.take() {
            self.storage.deallocate(line.id, data);
        }
        line.state = LineState::Invalid;
        line.next_state = None;
        line.owner = NodeId::NONE;
        line.sharers.clear();
        line.clear_flag(flags::MODIFIED);
        self.stale.forget(line.id);
        ctx.removals.push(line.id);
    }

    /// Backup acknowledgment for `line`: once the last outstanding one
    /// arrives, held responses go out and queued requests are replayed.
    pub fn slaves_ack(&self, line: LineId) -> Result<()> {
        self.with_line(line, false, |line, ctx| {
            if line.pending_backup_acks == 0 {
                error!("Backup ack for {} with no backup outstanding", line.id);
                return Err(GalaxyError::protocol(format!(
                    "backup ack for {} with no backup outstanding",
                    line.id
                )));
            }
            line.pending_backup_acks -= 1;
            if line.pending_backup_acks == 0 {
                line.clear_flag(flags::SLAVE);
                if line.backed_up_version == line.version {
                    line.clear_flag(flags::MODIFIED);
                }
                self.on_durable(line, ctx);
                self.settle(line, ctx);
            }
            Ok(())
        })
        .unwrap_or_else(|| {
            error!("Backup ack for unknown line {}", line);
            Err(GalaxyError::protocol(format!(
                "backup ack for unknown line {}",
                line
            )))
        })
    }

    /// Releases INVACKs the backup asked to hold back.
    pub fn slaves_inv_ack(&self, line: LineId) -> Result<()> {
        self.with_line(line, false, |line, _ctx| {
            if line.deferred_inv_acks.is_empty() {
                return Err(GalaxyError::protocol(format!(
                    "invalidation ack for {} with none deferred",
                    line.id
                )));
            }
            for ack in std::mem::take(&mut line.deferred_inv_acks) {
                self.send_reply(ack);
            }
            Ok(())
        })
        .unwrap_or_else(|| {
            Err(GalaxyError::protocol(format!(
                "invalidation ack for unknown line {}",
                line
            )))
        })
    }

    fn line_ids(&self) -> Vec<LineId> {
        self.lines.iter().map(|entry| *entry.key()).collect()
    }

    /// Times out every in-flight request past its deadline and re-sends
    /// invalidations that have gone unanswered. Returns the number of
    /// requests timed out.
    pub fn sweep_timeouts(&self) -> usize {
        let now = Instant::now();
        let mut expired = 0;
        for id in self.line_ids() {
            let timed_out = self.with_line(id, false, |line, ctx| {
                if line.next_state.is_some()
                    && line.invalidation_deadline.map_or(false, |d| d <= now)
                {
                    debug!("Re-sending invalidations for {}", line.id);
                    self.send_invalidations(line, self.local, ctx);
                }
                match &line.in_flight {
                    Some(flight) if flight.deadline <= now => {
                        ctx.synthesized.push_back(Message::timeout(
                            self.local,
                            line.id,
                            flight.message_id,
                        ));
                        true
                    }
                    _ => false,
                }
            });
            if timed_out == Some(true) {
                expired += 1;
            }
        }
        expired
    }

    /// `node` left the cluster: answer on its behalf for every outstanding
    /// exchange and forget it as an owner.
    pub fn node_removed(&self, node: NodeId) {
        info!("Node {} left the cluster", node);
        for id in self.line_ids() {
            self.with_line(id, false, |line, ctx| {
                if line.sharers.contains(&node) {
                    if let Some(message_id) = line
                        .inv_ids
                        .get(&node)
                        .copied()
                        .filter(|_| line.next_state.is_some())
                    {
                        ctx.synthesized.push_back(Message::new(
                            node,
                            self.local,
                            message_id,
                            true,
                            MessageType::InvAck(LineMessage { line: line.id }),
                        ));
                    } else {
                        line.sharers.remove(&node);
                        if line.state == LineState::Owned && line.sharers.is_empty() {
                            line.state = LineState::Exclusive;
                        }
                    }
                }
                if let Some(flight) = &line.in_flight {
                    let answer = if flight.target == node {
                        Some(MessageType::NotFound(LineMessage { line: line.id }))
                    } else if flight.target.is_none() && flight.awaiting.contains(&node) {
                        Some(MessageType::Ack(LineMessage { line: line.id }))
                    } else {
                        None
                    };
                    if let Some(answer) = answer {
                        ctx.synthesized.push_back(Message::new(
                            node,
                            self.local,
                            flight.message_id,
                            true,
                            answer,
                        ));
                    }
                }
                if line.owner == node && !line.state.is_owner() {
                    line.owner = NodeId::NONE;
                }
            });
        }
    }

    /// A replica took over `node`'s identity: repeat everything still
    /// outstanding at it, since the old master may never have answered.
    pub fn node_switched(&self, node: NodeId) {
        info!("Node {} switched to its replica", node);
        for id in self.line_ids() {
            self.with_line(id, false, |line, ctx| {
                if line.in_flight.as_ref().map_or(false, |f| f.target == node) {
                    self.reissue(line, node, ctx);
                }
                let outstanding_inv = line
                    .inv_ids
                    .get(&node)
                    .copied()
                    .filter(|_| line.next_state.is_some() && line.sharers.contains(&node));
                if let Some(message_id) = outstanding_inv {
                    let message = Message::inv(self.local, node, message_id, line.id, self.local);
                    if let Err(e) = self.send_message(message) {
                        warn!("Failed to re-invalidate {} at {}: {}", line.id, node, e);
                    }
                }
            });
        }
    }
}

/// Runs `Cache::sweep_timeouts` every `timeout_sweep_interval` until the cache
/// is dropped.
pub fn spawn_timeout_sweeper(cache: &Arc<Cache>) -> tokio::task::JoinHandle<()> {
    let period = cache.config.timeout_sweep_interval;
    let cache: Weak<Cache> = Arc::downgrade(cache);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            let Some(cache) = cache.upgrade() else {
                break;
            };
            let expired = cache.sweep_timeouts();
            if expired > 0 {
                debug!("Timed out {} requests", expired);
            }
        }
    })
}
