//! Local operation descriptors and their completion handles.

use bytes::Bytes;
use galaxy_core::listener::CacheListener;
use galaxy_core::ops::{OpType, OpValue};
use galaxy_core::{GalaxyError, LineId, NodeId, Result, TransactionId};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

use crate::transaction::Transaction;

/// Result slot of an operation, resolved at most once. Blocking callers wait
/// on the condition variable, async callers on the `Notify`.
#[derive(Default)]
pub struct Completion {
    slot: Mutex<Option<Result<OpValue>>>,
    ready: Condvar,
    notify: Notify,
}

impl Completion {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores the result. Returns false if the completion was already resolved.
    pub fn resolve(&self, result: Result<OpValue>) -> bool {
        {
            let mut slot = self.slot.lock();
            if slot.is_some() {
                return false;
            }
            *slot = Some(result);
        }
        self.ready.notify_all();
        self.notify.notify_waiters();
        true
    }

    pub fn is_resolved(&self) -> bool {
        self.slot.lock().is_some()
    }

    pub fn result(&self) -> Option<Result<OpValue>> {
        self.slot.lock().clone()
    }

    pub fn wait(&self, timeout: Duration) -> Option<Result<OpValue>> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.slot.lock();
        while slot.is_none() {
            if self.ready.wait_until(&mut slot, deadline).timed_out() {
                break;
            }
        }
        slot.clone()
    }

    pub async fn wait_async(&self) -> Result<OpValue> {
        loop {
            let notified = self.notify.notified();
            if let Some(result) = self.result() {
                return result;
            }
            notified.await;
        }
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("result", &*self.slot.lock())
            .finish()
    }
}

const NOT_WAITING: u64 = 0;

/// A local operation submitted to the engine.
///
/// # Examples
///
/// ```rust
/// use bytes::Bytes;
/// use galaxy_core::{ops::OpType, LineId};
/// use galaxy_engine::Op;
///
/// let op = Op::set(LineId::new(0x1_0000_0001), Bytes::from_static(b"bye"));
/// assert_eq!(op.op_type(), OpType::Set);
/// assert_eq!(op.line(), Some(LineId::new(0x1_0000_0001)));
/// ```
pub struct Op {
    pub(crate) op_type: OpType,
    /// `None` when a fresh id must be allocated
    pub(crate) line: Option<LineId>,
    pub(crate) data: Option<Bytes>,
    pub(crate) nodes: Vec<NodeId>,
    pub(crate) function: Option<String>,
    pub(crate) listener: Option<Arc<dyn CacheListener>>,
    pub(crate) count: u64,
    pub(crate) owner_of: Option<LineId>,
    pub(crate) exclusive: bool,
    pub(crate) owner_hint: Option<NodeId>,
    pub(crate) txn: Option<Arc<Transaction>>,
    waiting_on: AtomicU64,
    pub(crate) completion: Arc<Completion>,
}

impl Op {
    fn new(op_type: OpType, line: Option<LineId>) -> Self {
        Self {
            op_type,
            line,
            data: None,
            nodes: Vec::new(),
            function: None,
            listener: None,
            count: 1,
            owner_of: None,
            exclusive: false,
            owner_hint: None,
            txn: None,
            waiting_on: AtomicU64::new(NOT_WAITING),
            completion: Arc::new(Completion::new()),
        }
    }

    pub fn get(line: LineId) -> Self {
        Self::new(OpType::Get, Some(line))
    }

    /// Transactional read; records a stale-read tripwire on the transaction.
    pub fn gets(line: LineId) -> Self {
        Self::new(OpType::GetS, Some(line))
    }

    pub fn getx(line: LineId) -> Self {
        Self::new(OpType::GetX, Some(line))
    }

    /// Writes `data` under a freshly allocated id.
    pub fn put(data: Bytes) -> Self {
        let mut op = Self::new(OpType::Put, None);
        op.data = Some(data);
        op
    }

    /// Writes `data` to an existing line, acquiring it exclusively first.
    pub fn put_at(line: LineId, data: Bytes) -> Self {
        let mut op = Self::new(OpType::Put, Some(line));
        op.data = Some(data);
        op
    }

    pub fn set(line: LineId, data: Bytes) -> Self {
        let mut op = Self::new(OpType::Set, Some(line));
        op.data = Some(data);
        op
    }

    pub fn del(line: LineId) -> Self {
        Self::new(OpType::Del, Some(line))
    }

    /// Allocates `count` consecutive empty lines.
    pub fn alloc(count: u64) -> Self {
        let mut op = Self::new(OpType::Alloc, None);
        op.count = count;
        op
    }

    pub fn push(line: LineId, nodes: Vec<NodeId>) -> Self {
        let mut op = Self::new(OpType::Push, Some(line));
        op.nodes = nodes;
        op
    }

    pub fn pushx(line: LineId, node: NodeId) -> Self {
        let mut op = Self::new(OpType::PushX, Some(line));
        op.nodes = vec![node];
        op
    }

    pub fn send(line: LineId, data: Bytes) -> Self {
        let mut op = Self::new(OpType::Send, Some(line));
        op.data = Some(data);
        op
    }

    pub fn invoke(line: LineId, function: impl Into<String>, args: Bytes) -> Self {
        let mut op = Self::new(OpType::Invoke, Some(line));
        op.function = Some(function.into());
        op.data = Some(args);
        op
    }

    /// Attaches `listener` to the line, or detaches the current one with `None`.
    pub fn listen(line: LineId, listener: Option<Arc<dyn CacheListener>>) -> Self {
        let mut op = Self::new(OpType::Listen, Some(line));
        op.listener = listener;
        op
    }

    /// Reads `line` from the node that owns `owner_of`.
    pub fn get_from_owner(line: LineId, owner_of: LineId, exclusive: bool) -> Self {
        let mut op = Self::new(OpType::GetFromOwner, Some(line));
        op.owner_of = Some(owner_of);
        op.exclusive = exclusive;
        op
    }

    pub fn in_transaction(mut self, txn: &Arc<Transaction>) -> Self {
        self.txn = Some(Arc::clone(txn));
        self
    }

    pub fn op_type(&self) -> OpType {
        self.op_type
    }

    pub fn line(&self) -> Option<LineId> {
        self.line
    }

    /// The same operation re-typed, optionally steered at `hint`.
    pub(crate) fn redirected(self, op_type: OpType, hint: Option<NodeId>) -> Op {
        Op {
            op_type,
            owner_hint: hint,
            ..self
        }
    }

    pub(crate) fn txn_id(&self) -> Option<TransactionId> {
        self.txn.as_ref().map(|t| t.id())
    }

    pub(crate) fn wait_on(&self, message_id: u64) {
        self.waiting_on.store(message_id, Ordering::Relaxed);
    }

    pub(crate) fn is_waiting_on(&self, message_id: u64) -> bool {
        message_id != NOT_WAITING && self.waiting_on.load(Ordering::Relaxed) == message_id
    }

    pub(crate) fn resolve(&self, result: Result<OpValue>) -> bool {
        self.completion.resolve(result)
    }

    pub(crate) fn is_resolved(&self) -> bool {
        self.completion.is_resolved()
    }

    /// Payload size checked against the configured maximum item size.
    pub(crate) fn payload_len(&self) -> usize {
        self.data.as_ref().map_or(0, |d| d.len())
    }

    pub(crate) fn target(&self) -> Result<LineId> {
        self.line.ok_or_else(|| {
            GalaxyError::invalid_operation(format!("{} needs a line id", self.op_type))
        })
    }
}

impl fmt::Debug for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Op")
            .field("op_type", &self.op_type)
            .field("line", &self.line)
            .field("txn", &self.txn_id())
            .field("resolved", &self.is_resolved())
            .finish()
    }
}

/// Outcome of the non-blocking entry point.
#[derive(Debug)]
pub enum OpStatus {
    Done(OpValue),
    Pending(PendingOp),
}

impl OpStatus {
    pub fn is_pending(&self) -> bool {
        matches!(self, OpStatus::Pending(_))
    }
}

/// Handle on an operation that could not complete immediately.
#[derive(Debug, Clone)]
pub struct PendingOp {
    pub(crate) line: Option<LineId>,
    pub(crate) completion: Arc<Completion>,
}

impl PendingOp {
    pub fn line(&self) -> Option<LineId> {
        self.line
    }

    pub fn is_done(&self) -> bool {
        self.completion.is_resolved()
    }

    pub fn result(&self) -> Option<Result<OpValue>> {
        self.completion.result()
    }

    /// Blocks up to `timeout`; `None` if the operation is still pending.
    pub fn wait(&self, timeout: Duration) -> Option<Result<OpValue>> {
        self.completion.wait(timeout)
    }

    pub async fn completed(&self) -> Result<OpValue> {
        self.completion.wait_async().await
    }
}
