use bytes::Bytes;
use galaxy_core::backup::Backup;
use galaxy_core::function::Invocation;
use galaxy_core::listener::CacheListener;
use galaxy_core::messages::{
    ChangedOwnerMessage, InvokeMessage, InvokeResultMessage, LineMessage, Message, MessageKind,
    MessageType, PutMessage, PutXMessage, UserMessage,
};
use galaxy_core::network::{StaticMembership, Transport};
use galaxy_core::ops::OpValue;
use galaxy_core::refs::RefAllocator;
use galaxy_core::{GalaxyError, LineId, LineState, NodeId, Result};
use parking_lot::Mutex;
use proptest::prelude::*;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::{Cache, CacheConfig, Op, OpStatus, PendingOp};

fn node(id: i16) -> NodeId {
    NodeId::new(id)
}

fn line(n: u64) -> LineId {
    LineId::new(0x1_0000_0000 + n)
}

fn data(bytes: &'static [u8]) -> Option<Bytes> {
    Some(Bytes::from_static(bytes))
}

#[derive(Default)]
struct RecordingTransport {
    sent: Mutex<Vec<Message>>,
    departed: Mutex<BTreeSet<NodeId>>,
}

impl RecordingTransport {
    fn take(&self) -> Vec<Message> {
        std::mem::take(&mut *self.sent.lock())
    }

    fn take_one(&self) -> Message {
        let mut sent = self.take();
        assert_eq!(sent.len(), 1, "expected exactly one message: {:?}", sent);
        sent.remove(0)
    }
}

impl Transport for RecordingTransport {
    fn send(&self, message: Message) -> Result<()> {
        if self.departed.lock().contains(&message.to) {
            return Err(GalaxyError::NodeNotFound { node: message.to });
        }
        self.sent.lock().push(message);
        Ok(())
    }
}

#[derive(Default)]
struct RecordingBackup {
    slave: AtomicBool,
    defer_inv: AtomicBool,
    backups: Mutex<Vec<(LineId, u64)>>,
    flushes: AtomicUsize,
}

impl Backup for RecordingBackup {
    fn backup(&self, line: LineId, version: u64, _data: Option<&Bytes>) -> bool {
        self.backups.lock().push((line, version));
        self.slave.load(Ordering::SeqCst)
    }

    fn flush(&self) {
        self.flushes.fetch_add(1, Ordering::SeqCst);
    }

    fn inv(&self, _line: LineId, _owner: NodeId) -> bool {
        self.defer_inv.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct RecordingAllocator {
    requests: Mutex<Vec<u64>>,
}

impl RefAllocator for RecordingAllocator {
    fn allocate_refs(&self, count: u64) {
        self.requests.lock().push(count);
    }
}

#[derive(Default)]
struct RecordingListener {
    events: Mutex<Vec<(LineId, &'static str)>>,
    messages: Mutex<Vec<Bytes>>,
}

impl RecordingListener {
    fn count(&self, event: &str) -> usize {
        self.events.lock().iter().filter(|(_, e)| *e == event).count()
    }
}

impl CacheListener for RecordingListener {
    fn received(&self, line: LineId, _version: u64, _data: Option<&Bytes>) {
        self.events.lock().push((line, "received"));
    }

    fn invalidated(&self, line: LineId) {
        self.events.lock().push((line, "invalidated"));
    }

    fn evicted(&self, line: LineId) {
        self.events.lock().push((line, "evicted"));
    }

    fn message_received(&self, _line: LineId, data: &Bytes) {
        self.messages.lock().push(data.clone());
    }
}

struct Harness {
    cache: Cache,
    transport: Arc<RecordingTransport>,
    backup: Arc<RecordingBackup>,
    allocator: Arc<RecordingAllocator>,
    membership: Arc<StaticMembership>,
}

impl Harness {
    fn new(has_server: bool) -> Self {
        Self::with_config(CacheConfig::default(), has_server)
    }

    fn with_config(config: CacheConfig, has_server: bool) -> Self {
        let transport = Arc::new(RecordingTransport::default());
        let backup = Arc::new(RecordingBackup::default());
        let allocator = Arc::new(RecordingAllocator::default());
        let membership = Arc::new(StaticMembership::new(node(1), [node(2), node(3)], has_server));
        let cache = Cache::builder(config, membership.clone(), transport.clone())
            .backup(backup.clone())
            .ref_allocator(allocator.clone())
            .build()
            .unwrap();
        Self {
            cache,
            transport,
            backup,
            allocator,
            membership,
        }
    }

    fn pending(&self, op: Op) -> PendingOp {
        match self.cache.run_op(op).unwrap() {
            OpStatus::Pending(pending) => pending,
            OpStatus::Done(value) => panic!("expected a pending op, got {:?}", value),
        }
    }

    /// Receives a PUT from `owner` as if it had pushed the line here.
    fn shared_from(&self, owner: NodeId, id: LineId, version: u64, contents: &'static [u8]) {
        self.cache.receive(Message::request(
            owner,
            node(1),
            900,
            MessageType::Put(PutMessage {
                line: id,
                version,
                data: data(contents),
            }),
        ));
    }

    /// Acquires `id` exclusively from node 2 and acknowledges every
    /// invalidation.
    fn own(&self, id: LineId, contents: &'static [u8]) {
        let pending = self.pending(Op::getx(id));
        let getx = self.transport.take_one();
        assert_eq!(getx.kind(), MessageKind::GetX);
        self.cache.receive(getx.reply(
            node(2),
            MessageType::PutX(PutXMessage {
                line: id,
                version: 1,
                data: data(contents),
                sharers: vec![],
                partial: false,
            }),
        ));
        for inv in self.transport.take() {
            assert_eq!(inv.kind(), MessageKind::Inv);
            self.cache
                .receive(inv.reply(inv.to, MessageType::InvAck(LineMessage { line: id })));
        }
        assert_eq!(pending.result(), Some(Ok(OpValue::Data(data(contents)))));
        assert_eq!(self.cache.line_info(id).unwrap().state, LineState::Exclusive);
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .try_init();
}

#[test]
fn test_pushed_copy_is_read_without_traffic() {
    init_tracing();
    let h = Harness::new(false);
    let id = LineId::new(1);
    h.shared_from(node(10), id, 1, b"hello");

    assert_eq!(h.cache.get(id).unwrap(), data(b"hello"));
    assert!(h.transport.take().is_empty());

    let info = h.cache.line_info(id).unwrap();
    assert_eq!(info.state, LineState::Shared);
    assert_eq!(info.owner, node(10));
    assert_eq!(info.version, 1);
}

#[test]
fn test_miss_acquires_then_hits() {
    let h = Harness::new(false);
    let id = line(1);
    let pending = h.pending(Op::get(id));

    let get = h.transport.take_one();
    assert_eq!(get.kind(), MessageKind::Get);
    assert!(get.is_broadcast());

    h.cache.receive(get.reply(
        node(2),
        MessageType::Put(PutMessage {
            line: id,
            version: 3,
            data: data(b"value"),
        }),
    ));
    assert_eq!(pending.result(), Some(Ok(OpValue::Data(data(b"value")))));

    // a late probe answer from the other peer is a no-op
    h.cache
        .receive(get.reply(node(3), MessageType::Ack(LineMessage { line: id })));

    assert_eq!(h.cache.get(id).unwrap(), data(b"value"));
    assert!(h.transport.take().is_empty());
    assert_eq!(h.cache.statistics().misses, 1);
}

#[test]
fn test_getx_waits_for_every_invalidation() {
    let h = Harness::new(true);
    let id = line(1);
    let pending = h.pending(Op::getx(id));

    let getx = h.transport.take_one();
    assert!(getx.is_broadcast());
    h.cache.receive(getx.reply(
        node(2),
        MessageType::PutX(PutXMessage {
            line: id,
            version: 4,
            data: data(b"hello"),
            sharers: vec![],
            partial: false,
        }),
    ));

    let info = h.cache.line_info(id).unwrap();
    assert_eq!(info.state, LineState::Owned);
    assert_eq!(info.next_state, Some(LineState::Exclusive));
    assert!(!pending.is_done());

    let invs = h.transport.take();
    let targets: BTreeSet<NodeId> = invs.iter().map(|m| m.to).collect();
    assert_eq!(targets, [NodeId::SERVER, node(2)].into_iter().collect());

    h.cache
        .receive(invs[0].reply(invs[0].to, MessageType::InvAck(LineMessage { line: id })));
    assert!(!pending.is_done());
    assert_eq!(h.cache.line_info(id).unwrap().state, LineState::Owned);

    h.cache
        .receive(invs[1].reply(invs[1].to, MessageType::InvAck(LineMessage { line: id })));
    assert_eq!(pending.result(), Some(Ok(OpValue::Data(data(b"hello")))));
    let info = h.cache.line_info(id).unwrap();
    assert_eq!(info.state, LineState::Exclusive);
    assert_eq!(info.owner, node(1));
    assert_eq!(info.version, 4);
}

#[test]
fn test_write_is_hidden_until_backup_ack() {
    let h = Harness::new(false);
    let id = line(1);
    h.own(id, b"hello");
    h.backup.slave.store(true, Ordering::SeqCst);

    h.cache.set(id, Bytes::from_static(b"bye")).unwrap();
    assert_eq!(*h.backup.backups.lock(), vec![(id, 2)]);
    let info = h.cache.line_info(id).unwrap();
    assert!(info.is_modified());
    assert!(info.is_backup_pending());

    h.cache.receive(Message::get(node(3), node(1), 500, id));
    assert!(h.transport.take().is_empty());
    assert_eq!(h.backup.flushes.load(Ordering::SeqCst), 1);
    assert_eq!(h.cache.line_info(id).unwrap().pending_messages, 1);

    h.cache.slaves_ack(id).unwrap();
    // flushed again right before the queued GET is served
    assert_eq!(h.backup.flushes.load(Ordering::SeqCst), 2);
    let put = h.transport.take_one();
    assert_eq!(put.to, node(3));
    assert_eq!(put.message_id, 500);
    match put.message_type {
        MessageType::Put(put) => {
            assert_eq!(put.version, 2);
            assert_eq!(put.data, data(b"bye"));
        }
        other => panic!("unexpected {:?}", other),
    }

    let info = h.cache.line_info(id).unwrap();
    assert!(!info.is_modified());
    assert_eq!(info.state, LineState::Owned);
    assert_eq!(info.sharers, vec![node(3)]);
    assert_eq!(h.backup.backups.lock().len(), 1);
}

#[test]
fn test_unexpected_backup_ack_is_a_protocol_violation() {
    let h = Harness::new(false);
    let id = line(1);
    h.own(id, b"hello");
    assert!(matches!(
        h.cache.slaves_ack(id),
        Err(GalaxyError::ProtocolViolation { .. })
    ));
    assert!(h.cache.slaves_ack(line(99)).is_err());
}

#[test]
fn test_not_found_retries_server_once() {
    let h = Harness::new(true);
    let id = line(1);
    let pending = h.pending(Op::get(id));

    let get = h.transport.take_one();
    h.cache
        .receive(get.reply(node(2), MessageType::NotFound(LineMessage { line: id })));

    let retry = h.transport.take_one();
    assert_eq!(retry.to, NodeId::SERVER);
    assert_eq!(retry.kind(), MessageKind::Get);
    assert_ne!(retry.message_id, get.message_id);
    assert!(!pending.is_done());

    h.cache.receive(retry.reply(
        NodeId::SERVER,
        MessageType::NotFound(LineMessage { line: id }),
    ));
    assert_eq!(pending.result(), Some(Err(GalaxyError::RefNotFound { line: id })));
    assert!(h.transport.take().is_empty());
}

#[test]
fn test_all_peers_ack_without_server_is_not_found() {
    let h = Harness::new(false);
    let id = line(1);
    let pending = h.pending(Op::get(id));
    let get = h.transport.take_one();

    h.cache
        .receive(get.reply(node(2), MessageType::Ack(LineMessage { line: id })));
    assert!(!pending.is_done());
    h.cache
        .receive(get.reply(node(3), MessageType::Ack(LineMessage { line: id })));
    assert_eq!(pending.result(), Some(Err(GalaxyError::RefNotFound { line: id })));
}

#[test]
fn test_duplicate_changed_owner_resends_once() {
    let h = Harness::new(false);
    let id = line(1);
    let pending = h.pending(Op::get(id));
    let get = h.transport.take_one();

    let redirect = get.reply(
        node(2),
        MessageType::ChangedOwner(ChangedOwnerMessage {
            line: id,
            new_owner: node(3),
            certain: true,
        }),
    );
    h.cache.receive(redirect.clone());
    h.cache.receive(redirect);

    let resent = h.transport.take_one();
    assert_eq!(resent.to, node(3));
    assert_eq!(resent.kind(), MessageKind::Get);
    assert_eq!(h.cache.line_info(id).unwrap().owner, node(3));

    h.cache.receive(resent.reply(
        node(3),
        MessageType::Put(PutMessage {
            line: id,
            version: 1,
            data: data(b"x"),
        }),
    ));
    assert_eq!(pending.result(), Some(Ok(OpValue::Data(data(b"x")))));
}

#[test]
fn test_redirect_to_departed_node_keeps_target() {
    let h = Harness::new(false);
    let id = line(1);
    h.shared_from(node(2), id, 1, b"x");
    let _pending = h.pending(Op::getx(id));
    let getx = h.transport.take_one();
    assert_eq!(getx.to, node(2));

    h.cache.receive(getx.reply(
        node(2),
        MessageType::ChangedOwner(ChangedOwnerMessage {
            line: id,
            new_owner: node(7),
            certain: true,
        }),
    ));
    let resent = h.transport.take_one();
    assert_eq!(resent.to, node(2));
}

#[test]
fn test_duplicate_inv_ack_single_transition() {
    let h = Harness::new(false);
    let id = line(1);
    let pending = h.pending(Op::getx(id));
    let getx = h.transport.take_one();
    h.cache.receive(getx.reply(
        node(2),
        MessageType::PutX(PutXMessage {
            line: id,
            version: 1,
            data: data(b"v"),
            sharers: vec![node(3)],
            partial: false,
        }),
    ));
    let invs = h.transport.take();
    assert_eq!(invs.len(), 2);

    let from_three = invs.iter().find(|m| m.to == node(3)).unwrap();
    let ack = from_three.reply(node(3), MessageType::InvAck(LineMessage { line: id }));
    h.cache.receive(ack.clone());
    h.cache.receive(ack);
    assert_eq!(h.cache.line_info(id).unwrap().sharers, vec![node(2)]);
    assert!(!pending.is_done());

    let from_two = invs.iter().find(|m| m.to == node(2)).unwrap();
    let ack = from_two.reply(node(2), MessageType::InvAck(LineMessage { line: id }));
    h.cache.receive(ack.clone());
    h.cache.receive(ack);

    let info = h.cache.line_info(id).unwrap();
    assert_eq!(info.state, LineState::Exclusive);
    assert_eq!(info.version, 1);
    assert!(pending.is_done());
}

#[test]
fn test_late_inv_ack_keeps_live_sharer() {
    let h = Harness::new(false);
    let id = line(1);
    h.own(id, b"v1");
    h.cache.receive(Message::get(node(3), node(1), 710, id));
    let _ = h.transport.take_one();

    let write = h.pending(Op::set(id, Bytes::from_static(b"v2")));
    let inv = h.transport.take_one();
    assert_eq!(inv.to, node(3));
    let ack = inv.reply(node(3), MessageType::InvAck(LineMessage { line: id }));
    h.cache.receive(ack.clone());
    assert_eq!(write.result(), Some(Ok(OpValue::Nothing)));

    // node 3 reads the new version, then the old ack shows up again
    h.cache.receive(Message::get(node(3), node(1), 711, id));
    let _ = h.transport.take_one();
    h.cache.receive(ack);
    h.cache.receive(Message::new(
        node(3),
        node(1),
        999,
        true,
        MessageType::InvAck(LineMessage { line: id }),
    ));
    let info = h.cache.line_info(id).unwrap();
    assert_eq!(info.state, LineState::Owned);
    assert_eq!(info.sharers, vec![node(3)]);

    let write = h.pending(Op::set(id, Bytes::from_static(b"v3")));
    let inv = h.transport.take_one();
    assert_eq!(inv.kind(), MessageKind::Inv);
    assert_eq!(inv.to, node(3));
    assert!(!write.is_done());
    h.cache
        .receive(inv.reply(node(3), MessageType::InvAck(LineMessage { line: id })));
    assert_eq!(write.result(), Some(Ok(OpValue::Nothing)));
    assert_eq!(h.cache.line_info(id).unwrap().version, 3);
}

#[test]
fn test_resent_invalidation_keeps_its_message_id() {
    let config = CacheConfig::default().with_request_timeout(Duration::from_millis(1));
    let h = Harness::with_config(config, false);
    let id = line(1);
    h.own(id, b"v1");
    h.cache.receive(Message::get(node(3), node(1), 712, id));
    let _ = h.transport.take_one();

    let write = h.pending(Op::set(id, Bytes::from_static(b"v2")));
    let first = h.transport.take_one();
    std::thread::sleep(Duration::from_millis(10));
    h.cache.sweep_timeouts();
    let resent = h.transport.take_one();
    assert_eq!(resent.kind(), MessageKind::Inv);
    assert_eq!(resent.message_id, first.message_id);

    h.cache
        .receive(first.reply(node(3), MessageType::InvAck(LineMessage { line: id })));
    assert_eq!(write.result(), Some(Ok(OpValue::Nothing)));
}

#[test]
fn test_duplicate_putx_after_handoff_is_ignored() {
    let h = Harness::new(false);
    let id = line(1);
    let pending = h.pending(Op::getx(id));
    let getx = h.transport.take_one();
    let putx = getx.reply(
        node(2),
        MessageType::PutX(PutXMessage {
            line: id,
            version: 1,
            data: data(b"v"),
            sharers: vec![],
            partial: false,
        }),
    );
    h.cache.receive(putx.clone());
    let inv = h.transport.take_one();
    h.cache
        .receive(inv.reply(node(2), MessageType::InvAck(LineMessage { line: id })));
    assert!(pending.is_done());

    h.cache.receive(Message::getx(node(3), node(1), 720, id));
    assert_eq!(h.transport.take_one().kind(), MessageKind::PutX);

    h.cache.receive(putx);
    assert!(h.transport.take().is_empty());
    let info = h.cache.line_info(id).unwrap();
    assert_eq!(info.state, LineState::Shared);
    assert_eq!(info.owner, node(3));
}

#[test]
fn test_duplicate_put_does_not_revive_invalidated_copy() {
    let h = Harness::new(false);
    let id = line(1);
    let pending = h.pending(Op::get(id));
    let get = h.transport.take_one();
    let put = get.reply(
        node(2),
        MessageType::Put(PutMessage {
            line: id,
            version: 1,
            data: data(b"old"),
        }),
    );
    h.cache.receive(put.clone());
    assert_eq!(pending.result(), Some(Ok(OpValue::Data(data(b"old")))));

    h.cache
        .receive(Message::inv(node(3), node(1), 721, id, node(2)));
    assert_eq!(h.transport.take_one().kind(), MessageKind::InvAck);

    h.cache.receive(put);
    let info = h.cache.line_info(id).unwrap();
    assert_eq!(info.state, LineState::Invalid);
    assert_eq!(info.data, None);
    assert_eq!(info.owner, node(3));
}

#[test]
fn test_unmatched_put_response_creates_no_line() {
    let h = Harness::new(false);
    h.cache.receive(Message::new(
        node(2),
        node(1),
        722,
        true,
        MessageType::Put(PutMessage {
            line: line(4),
            version: 1,
            data: data(b"stray"),
        }),
    ));
    assert!(h.cache.line_info(line(4)).is_none());
    assert!(h.transport.take().is_empty());
}

#[test]
fn test_owner_flushes_backup_before_serving_reads() {
    let h = Harness::new(false);
    let id = line(1);
    h.own(id, b"v");
    assert_eq!(h.backup.flushes.load(Ordering::SeqCst), 0);

    h.cache.receive(Message::get(node(3), node(1), 730, id));
    assert_eq!(h.backup.flushes.load(Ordering::SeqCst), 1);
    assert_eq!(h.transport.take_one().kind(), MessageKind::Put);

    h.cache.receive(Message::getx(node(2), node(1), 731, id));
    assert_eq!(h.backup.flushes.load(Ordering::SeqCst), 2);
    assert_eq!(h.transport.take_one().kind(), MessageKind::PutX);

    // a non-owner redirects without touching the backup
    h.cache.receive(Message::get(node(3), node(1), 732, id));
    assert_eq!(h.backup.flushes.load(Ordering::SeqCst), 2);
    assert_eq!(h.transport.take_one().kind(), MessageKind::ChangedOwner);
}

#[test]
fn test_later_ops_wait_behind_queued_ones() {
    let h = Harness::new(false);
    let id = line(1);
    h.shared_from(node(2), id, 1, b"old");

    let write = h.pending(Op::set(id, Bytes::from_static(b"new")));
    // readable, but queued behind the write
    let read = h.pending(Op::get(id));

    let getx = h.transport.take_one();
    assert_eq!(getx.to, node(2));
    h.cache.receive(getx.reply(
        node(2),
        MessageType::PutX(PutXMessage {
            line: id,
            version: 1,
            data: data(b"old"),
            sharers: vec![],
            partial: false,
        }),
    ));
    let inv = h.transport.take_one();
    assert!(!write.is_done());
    assert!(!read.is_done());

    h.cache
        .receive(inv.reply(node(2), MessageType::InvAck(LineMessage { line: id })));
    assert_eq!(write.result(), Some(Ok(OpValue::Nothing)));
    assert_eq!(read.result(), Some(Ok(OpValue::Data(data(b"new")))));
    assert_eq!(h.cache.line_info(id).unwrap().version, 2);
}

#[test]
fn test_eviction_spares_owned_lines() {
    let h = Harness::with_config(CacheConfig::default().with_max_capacity(2), false);
    let listener = Arc::new(RecordingListener::default());
    h.cache.set_listener(Some(listener.clone()));

    h.own(line(1), b"mine");
    h.shared_from(node(2), line(2), 1, b"a");
    h.shared_from(node(2), line(3), 1, b"b");

    assert_eq!(h.cache.len(), 2);
    assert!(h.cache.line_info(line(1)).is_some());
    assert!(h.cache.line_info(line(2)).is_none());
    assert_eq!(listener.count("evicted"), 1);
    assert_eq!(h.cache.statistics().evictions, 1);
}

#[test]
fn test_request_timeout_fails_waiting_op() {
    let config = CacheConfig::default().with_request_timeout(Duration::from_millis(1));
    let h = Harness::with_config(config, false);
    let id = line(1);
    let pending = h.pending(Op::get(id));
    let get = h.transport.take_one();

    std::thread::sleep(Duration::from_millis(10));
    assert_eq!(h.cache.sweep_timeouts(), 1);
    assert_eq!(pending.result(), Some(Err(GalaxyError::Timeout { line: id })));
    assert_eq!(h.cache.statistics().timeouts, 1);
    let info = h.cache.line_info(id).unwrap();
    assert!(!info.request_in_flight);
    assert_eq!(info.pending_ops, 0);

    // the answer arrives too late and matches nothing
    h.cache.receive(get.reply(
        node(2),
        MessageType::Put(PutMessage {
            line: id,
            version: 1,
            data: data(b"late"),
        }),
    ));
    let info = h.cache.line_info(id).unwrap();
    assert_eq!(info.state, LineState::Invalid);
    assert_eq!(info.data, None);
}

#[test]
fn test_op_timeout_in_do_op() {
    let config = CacheConfig::default().with_op_timeout(Duration::from_millis(20));
    let h = Harness::with_config(config, false);
    let id = line(1);
    assert_eq!(h.cache.get(id), Err(GalaxyError::Timeout { line: id }));
    assert_eq!(h.cache.line_info(id).unwrap().pending_ops, 0);
}

#[test]
fn test_departed_sharer_acknowledges() {
    let h = Harness::new(false);
    let id = line(1);
    let pending = h.pending(Op::getx(id));
    let getx = h.transport.take_one();
    h.cache.receive(getx.reply(
        node(2),
        MessageType::PutX(PutXMessage {
            line: id,
            version: 1,
            data: data(b"v"),
            sharers: vec![],
            partial: false,
        }),
    ));
    assert_eq!(h.cache.line_info(id).unwrap().state, LineState::Owned);

    h.membership.remove_peer(node(2));
    h.cache.node_removed(node(2));
    assert_eq!(h.cache.line_info(id).unwrap().state, LineState::Exclusive);
    assert!(pending.is_done());
}

#[test]
fn test_send_to_departed_owner_is_not_found() {
    let h = Harness::new(false);
    let id = line(1);
    h.shared_from(node(3), id, 1, b"v");
    h.transport.departed.lock().insert(node(3));

    assert_eq!(h.cache.getx(id), Err(GalaxyError::RefNotFound { line: id }));
}

#[test]
fn test_node_switch_resends_in_flight_request() {
    let h = Harness::new(false);
    let id = line(1);
    h.shared_from(node(2), id, 1, b"v");
    let _pending = h.pending(Op::getx(id));
    let first = h.transport.take_one();

    h.cache.node_switched(node(2));
    let again = h.transport.take_one();
    assert_eq!(again.to, node(2));
    assert_eq!(again.kind(), MessageKind::GetX);
    assert_ne!(again.message_id, first.message_id);
}

#[test]
fn test_commit_backs_up_final_version_once() {
    let h = Harness::new(false);
    let id = line(1);
    h.own(id, b"hello");

    let txn = h.cache.begin();
    h.cache
        .do_op(Op::set(id, Bytes::from_static(b"a")).in_transaction(&txn))
        .unwrap();
    h.cache
        .do_op(Op::set(id, Bytes::from_static(b"b")).in_transaction(&txn))
        .unwrap();
    assert!(h.backup.backups.lock().is_empty());
    assert!(h.cache.line_info(id).unwrap().locked);
    assert_eq!(txn.locked_lines(), vec![id]);

    h.cache.receive(Message::get(node(3), node(1), 600, id));
    assert!(h.transport.take().is_empty());

    h.cache.commit(&txn).unwrap();
    assert_eq!(*h.backup.backups.lock(), vec![(id, 3)]);
    let put = h.transport.take_one();
    assert!(matches!(
        put.message_type,
        MessageType::Put(PutMessage { version: 3, .. })
    ));
    assert!(h.cache.commit(&txn).is_err());
}

#[test]
fn test_rollback_restores_data_and_keeps_version() {
    let h = Harness::new(false);
    let id = line(1);
    h.own(id, b"hello");
    let allocated = h.cache.total_allocated();

    let txn = h.cache.begin();
    h.cache
        .do_op(Op::set(id, Bytes::from_static(b"changed")).in_transaction(&txn))
        .unwrap();
    h.cache.rollback(&txn).unwrap();

    let info = h.cache.line_info(id).unwrap();
    assert_eq!(info.data, data(b"hello"));
    assert_eq!(info.version, 2);
    assert!(!info.is_modified());
    assert!(!info.locked);
    assert!(h.backup.backups.lock().is_empty());
    assert_eq!(h.cache.total_allocated(), allocated);
}

#[test]
fn test_abort_fails_pending_ops() {
    let h = Harness::new(false);
    let txn = h.cache.begin();
    let pending = h.pending(Op::getx(line(1)).in_transaction(&txn));

    h.cache.abort(&txn).unwrap();
    assert_eq!(pending.result(), Some(Err(GalaxyError::Aborted)));
    assert!(txn.is_finished());
    assert!(h.cache.abort(&txn).is_err());
    assert!(h
        .cache
        .run_op(Op::get(line(1)).in_transaction(&txn))
        .is_err());
}

#[test]
fn test_stale_read_tripwire() {
    let h = Harness::new(false);
    let id = line(1);
    h.shared_from(node(2), id, 1, b"v");

    let txn = h.cache.begin();
    let read = h.cache.do_op(Op::gets(id).in_transaction(&txn)).unwrap();
    assert_eq!(read, OpValue::Data(data(b"v")));
    assert_eq!(txn.reads(), vec![(id, 1)]);
    assert!(h.cache.verify_stale_reads(&txn));

    h.cache
        .receive(Message::inv(node(2), node(1), 700, id, node(2)));
    assert!(!h.cache.verify_stale_reads(&txn));
    assert!(h.cache.run_op(Op::gets(id)).is_err());
}

#[test]
fn test_put_from_new_owner_purges_lineage() {
    let h = Harness::new(false);
    h.shared_from(node(2), line(1), 1, b"a");
    h.shared_from(node(2), line(2), 1, b"b");
    h.shared_from(node(3), line(2), 2, b"c");

    assert!(h.cache.line_info(line(1)).unwrap().needs_refresh);
    assert!(!h.cache.line_info(line(2)).unwrap().needs_refresh);
    assert_eq!(h.cache.statistics().stale_purges, 1);

    let _pending = h.pending(Op::get(line(1)));
    let get = h.transport.take_one();
    assert_eq!(get.to, node(2));
    assert_eq!(get.kind(), MessageKind::Get);
}

#[test]
fn test_deferred_inv_ack() {
    let h = Harness::new(false);
    let id = line(1);
    let listener = Arc::new(RecordingListener::default());
    h.shared_from(node(2), id, 1, b"v");
    h.cache.listen(id, Some(listener.clone())).unwrap();
    h.backup.defer_inv.store(true, Ordering::SeqCst);

    h.cache
        .receive(Message::inv(node(2), node(1), 701, id, node(2)));
    assert!(h.transport.take().is_empty());
    assert_eq!(h.cache.line_info(id).unwrap().state, LineState::Invalid);
    assert_eq!(listener.count("invalidated"), 1);

    h.cache.slaves_inv_ack(id).unwrap();
    let ack = h.transport.take_one();
    assert_eq!(ack.kind(), MessageKind::InvAck);
    assert_eq!(ack.message_id, 701);
    assert!(h.cache.slaves_inv_ack(id).is_err());
}

#[test]
fn test_inv_for_unknown_line_is_acknowledged() {
    let h = Harness::new(false);
    h.cache
        .receive(Message::inv(node(2), node(1), 702, line(5), node(2)));
    let ack = h.transport.take_one();
    assert_eq!(ack.kind(), MessageKind::InvAck);
    assert!(h.cache.line_info(line(5)).is_none());
}

#[test]
fn test_directed_get_for_unknown_line() {
    let h = Harness::new(false);
    h.cache.receive(Message::get(node(2), node(1), 703, line(5)));
    assert_eq!(h.transport.take_one().kind(), MessageKind::NotFound);

    h.cache.receive(Message::get(node(2), NodeId::NONE, 704, line(5)));
    assert_eq!(h.transport.take_one().kind(), MessageKind::Ack);
}

#[test]
fn test_non_owner_redirects() {
    let h = Harness::new(false);
    let id = line(1);
    h.shared_from(node(2), id, 1, b"v");

    h.cache.receive(Message::getx(node(3), node(1), 705, id));
    match h.transport.take_one().message_type {
        MessageType::ChangedOwner(redirect) => {
            assert_eq!(redirect.new_owner, node(2));
            assert!(redirect.certain);
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_ownership_transfer_on_remote_getx() {
    let h = Harness::new(false);
    let id = line(1);
    h.own(id, b"hello");
    h.cache.receive(Message::get(node(3), node(1), 706, id));
    let _ = h.transport.take_one();

    h.cache.receive(Message::getx(node(2), node(1), 707, id));
    let putx = h.transport.take_one();
    match putx.message_type {
        MessageType::PutX(putx) => {
            assert_eq!(putx.sharers, vec![node(3)]);
            assert_eq!(putx.data, data(b"hello"));
        }
        other => panic!("unexpected {:?}", other),
    }
    let info = h.cache.line_info(id).unwrap();
    assert_eq!(info.state, LineState::Shared);
    assert_eq!(info.owner, node(2));
    assert!(info.sharers.is_empty());
}

#[test]
fn test_alloc_window_refills_at_half() {
    let h = Harness::with_config(CacheConfig::default().with_ref_batch_size(10), false);
    let pending = h.pending(Op::put(Bytes::from_static(b"first")));
    assert_eq!(*h.allocator.requests.lock(), vec![10]);

    let start = 0x1_0000_0000;
    h.cache.refs_allocated(start, 10).unwrap();
    assert_eq!(pending.result(), Some(Ok(OpValue::Ref(LineId::new(start)))));
    let info = h.cache.line_info(LineId::new(start)).unwrap();
    assert_eq!(info.state, LineState::Exclusive);
    assert_eq!(info.data, data(b"first"));

    for n in 1..5 {
        assert_eq!(
            h.cache.put(Bytes::from_static(b"more")).unwrap(),
            LineId::new(start + n)
        );
    }
    assert_eq!(h.allocator.requests.lock().len(), 1);
    h.cache.put(Bytes::from_static(b"more")).unwrap();
    assert_eq!(*h.allocator.requests.lock(), vec![10, 10]);

    assert_eq!(h.cache.alloc(3).unwrap(), LineId::new(start + 6));
    assert!(matches!(
        h.cache.refs_allocated(5, 10),
        Err(GalaxyError::ProtocolViolation { .. })
    ));
}

#[test]
fn test_item_too_large_rejected() {
    let h = Harness::with_config(CacheConfig::default().with_max_item_size(8), false);
    let result = h.cache.run_op(Op::set(line(1), Bytes::from(vec![0u8; 16])));
    assert!(matches!(
        result,
        Err(GalaxyError::ItemTooLarge { size: 16, max: 8 })
    ));
}

fn append(_line: LineId, current: Option<&Bytes>, args: &Bytes) -> Result<Invocation> {
    let mut out = current.map(|d| d.to_vec()).unwrap_or_default();
    out.extend_from_slice(args);
    let len = out.len() as u64;
    Ok(Invocation {
        data: Some(Bytes::from(out)),
        result: Bytes::copy_from_slice(&len.to_be_bytes()),
    })
}

#[test]
fn test_local_invoke_is_a_write() {
    let h = Harness::new(false);
    let id = line(1);
    h.own(id, b"ab");
    h.cache.register_function("append", append);

    let result = h.cache.invoke(id, "append", Bytes::from_static(b"cd")).unwrap();
    assert_eq!(result.as_ref(), &4u64.to_be_bytes());
    let info = h.cache.line_info(id).unwrap();
    assert_eq!(info.data, data(b"abcd"));
    assert_eq!(info.version, 2);
    assert_eq!(*h.backup.backups.lock(), vec![(id, 2)]);

    assert!(matches!(
        h.cache.invoke(id, "missing", Bytes::new()),
        Err(GalaxyError::InvalidOperation { .. })
    ));
}

#[test]
fn test_remote_invoke_round_trip() {
    let h = Harness::new(false);
    let id = line(1);
    h.shared_from(node(2), id, 1, b"ab");
    let pending = h.pending(Op::invoke(id, "append", Bytes::from_static(b"cd")));

    let invoke = h.transport.take_one();
    assert_eq!(invoke.to, node(2));
    h.cache.receive(invoke.reply(
        node(2),
        MessageType::InvRes(InvokeResultMessage {
            line: id,
            result: Ok(Bytes::from_static(b"4")),
        }),
    ));
    assert_eq!(
        pending.result(),
        Some(Ok(OpValue::Invoked(Bytes::from_static(b"4"))))
    );
}

#[test]
fn test_inbound_invoke_applies_on_owner() {
    let h = Harness::new(false);
    let id = line(1);
    h.own(id, b"ab");
    h.cache.register_function("append", append);

    h.cache.receive(Message::request(
        node(3),
        node(1),
        800,
        MessageType::Invoke(InvokeMessage {
            line: id,
            function: "append".to_string(),
            args: Bytes::from_static(b"c"),
        }),
    ));
    match h.transport.take_one().message_type {
        MessageType::InvRes(res) => {
            assert_eq!(res.result, Ok(Bytes::copy_from_slice(&3u64.to_be_bytes())))
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(h.cache.line_info(id).unwrap().data, data(b"abc"));
}

#[test]
fn test_send_delivers_to_owner() {
    let h = Harness::new(false);
    let listener = Arc::new(RecordingListener::default());
    let mine = line(1);
    h.own(mine, b"x");
    h.cache.listen(mine, Some(listener.clone())).unwrap();
    h.cache.send(mine, Bytes::from_static(b"local")).unwrap();
    assert_eq!(*listener.messages.lock(), vec![Bytes::from_static(b"local")]);
    assert!(h.transport.take().is_empty());

    let theirs = line(2);
    h.shared_from(node(2), theirs, 1, b"y");
    let pending = h.pending(Op::send(theirs, Bytes::from_static(b"remote")));
    let msg = h.transport.take_one();
    assert!(matches!(
        &msg.message_type,
        MessageType::Msg(UserMessage { data, .. }) if data.as_ref() == b"remote"
    ));
    h.cache
        .receive(msg.reply(node(2), MessageType::MsgAck(LineMessage { line: theirs })));
    assert_eq!(pending.result(), Some(Ok(OpValue::Nothing)));
}

#[test]
fn test_push_shares_owned_line() {
    let h = Harness::new(false);
    let id = line(1);
    h.own(id, b"x");
    h.cache.push(id, vec![node(3), node(9)]).unwrap();

    let put = h.transport.take_one();
    assert_eq!(put.to, node(3));
    let info = h.cache.line_info(id).unwrap();
    assert_eq!(info.state, LineState::Owned);
    assert_eq!(info.sharers, vec![node(3)]);

    // shared copies cannot push
    h.shared_from(node(2), line(2), 1, b"y");
    h.cache.push(line(2), vec![node(3)]).unwrap();
    assert!(h.transport.take().is_empty());
}

#[test]
fn test_pushx_hands_over_ownership() {
    let h = Harness::new(false);
    let id = line(1);
    h.own(id, b"x");
    h.cache.pushx(id, node(3)).unwrap();

    let putx = h.transport.take_one();
    assert_eq!(putx.kind(), MessageKind::PutX);
    assert_eq!(putx.to, node(3));
    let info = h.cache.line_info(id).unwrap();
    assert_eq!(info.state, LineState::Shared);
    assert_eq!(info.owner, node(3));

    assert!(matches!(
        h.cache.pushx(line(2), node(9)),
        Ok(())
    ));
}

#[test]
fn test_delete_removes_line() {
    let h = Harness::new(false);
    let id = line(1);
    h.own(id, b"x");
    h.cache.del(id).unwrap();
    assert!(h.cache.line_info(id).is_none());
    assert_eq!(h.cache.total_allocated(), 0);
}

#[test]
fn test_get_from_owner_targets_owner_of_reference() {
    let h = Harness::new(false);
    h.shared_from(node(3), line(1), 1, b"ref");
    let _pending = h.pending(Op::get_from_owner(line(2), line(1), false));
    let get = h.transport.take_one();
    assert_eq!(get.to, node(3));
    assert_eq!(get.kind(), MessageKind::Get);
}

#[tokio::test]
async fn test_async_get_completes_from_message() {
    let h = Arc::new(Harness::new(false));
    let id = line(1);
    let reader = Arc::clone(&h);
    let task = tokio::spawn(async move { reader.cache.get_async(id).await });

    let get = loop {
        if let Some(message) = h.transport.sent.lock().pop() {
            break message;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    };
    h.cache.receive(get.reply(
        node(2),
        MessageType::Put(PutMessage {
            line: id,
            version: 1,
            data: data(b"async"),
        }),
    ));
    assert_eq!(task.await.unwrap().unwrap(), data(b"async"));
}

proptest! {
    #[test]
    fn prop_versions_strictly_increase(writes in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..64), 1..20)) {
        let h = Harness::new(false);
        let id = line(1);
        h.own(id, b"seed");
        let mut previous = h.cache.line_info(id).unwrap().version;
        for write in writes {
            h.cache.set(id, Bytes::from(write.clone())).unwrap();
            let info = h.cache.line_info(id).unwrap();
            prop_assert_eq!(info.version, previous + 1);
            prop_assert_eq!(info.data, Some(Bytes::from(write)));
            previous = info.version;
        }
        prop_assert_eq!(h.backup.backups.lock().len() as u64, previous - 1);
    }
}
