//! Local operations: execution against a line, queueing and completion.

use bytes::Bytes;
use galaxy_core::listener::CacheListener;
use galaxy_core::messages::{
    InvokeMessage, LineMessage, Message, MessageType, PutMessage, PutXMessage, UserMessage,
};
use galaxy_core::ops::{OpType, OpValue};
use galaxy_core::{GalaxyError, LineId, LineState, NodeId, Result, MAX_RESERVED_REF_ID};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cache::{Cache, Dispatch, Event};
use crate::line::{flags, CacheLine};
use crate::op::{Op, OpStatus, PendingOp};
use crate::transaction::{PreImage, Transaction};

/// Outcome of one attempt to execute an operation.
pub(crate) enum Step {
    Done(Result<OpValue>),
    /// Parked on the line until a message or a commit changes its state
    Wait,
}

impl Cache {
    /// Non-blocking entry point: runs `op` if the line allows it now,
    /// otherwise queues it and returns a handle.
    pub fn run_op(&self, op: Op) -> Result<OpStatus> {
        self.observe(|m| m.op_submitted(op.op_type));
        let size = op.payload_len();
        if size > self.config.max_item_size {
            return Err(GalaxyError::ItemTooLarge {
                size,
                max: self.config.max_item_size,
            });
        }
        if let Some(txn) = &op.txn {
            txn.ensure_open()?;
        }

        let op = match op.op_type {
            OpType::GetFromOwner => self.resolve_owner_hint(op)?,
            OpType::GetS if op.txn.is_none() => {
                return Err(GalaxyError::invalid_operation(
                    "GETS outside a transaction",
                ))
            }
            _ => op,
        };
        if op.line.is_none() && matches!(op.op_type, OpType::Put | OpType::Alloc) {
            return self.allocate(op);
        }
        let id = op.target()?;

        let op = Arc::new(op);
        self.with_line(id, true, |line, ctx| {
            let bypass = op.txn_id().is_some() && line.locked_by == op.txn_id();
            if line.pending_ops.is_empty() || bypass {
                match self.execute(line, &op, ctx) {
                    Step::Done(result) => {
                        op.resolve(result);
                    }
                    Step::Wait if bypass => line.pending_ops.push_front(Arc::clone(&op)),
                    Step::Wait => line.pending_ops.push_back(Arc::clone(&op)),
                }
            } else {
                line.pending_ops.push_back(Arc::clone(&op));
            }
            self.settle(line, ctx);
        });
        self.status(&op)
    }

    fn status(&self, op: &Arc<Op>) -> Result<OpStatus> {
        if let Some(result) = op.completion.result() {
            return result.map(OpStatus::Done);
        }
        if let Some(txn) = &op.txn {
            txn.track(Arc::clone(&op.completion));
        }
        Ok(OpStatus::Pending(PendingOp {
            line: op.line,
            completion: Arc::clone(&op.completion),
        }))
    }

    fn resolve_owner_hint(&self, op: Op) -> Result<Op> {
        let owner_of = op.owner_of.ok_or_else(|| {
            GalaxyError::invalid_operation("GET_FROM_OWNER needs a reference line")
        })?;
        let hint = self
            .with_line(owner_of, false, |line, _| line.owner_known(self.local))
            .flatten();
        let op_type = if op.exclusive {
            OpType::GetX
        } else {
            OpType::Get
        };
        debug!("Reading {:?} via owner of {}: {:?}", op.line, owner_of, hint);
        Ok(op.redirected(op_type, hint))
    }

    pub(crate) fn execute(&self, line: &mut CacheLine, op: &Arc<Op>, ctx: &mut Dispatch) -> Step {
        if line.locked_by.is_some() && line.locked_by != op.txn_id() {
            return Step::Wait;
        }

        match op.op_type {
            OpType::Get | OpType::GetS => self.read(line, op, ctx),
            OpType::GetX => {
                if let Some(step) = self.acquire_exclusive(line, op, ctx) {
                    return step;
                }
                if let Some(txn) = &op.txn {
                    self.lock_line(line, txn);
                }
                Step::Done(Ok(OpValue::Data(line.data.clone())))
            }
            OpType::Put | OpType::Set => {
                if let Some(step) = self.acquire_exclusive(line, op, ctx) {
                    return step;
                }
                let result = self.write_line(line, op.txn.as_ref(), op.data.clone(), 0, ctx);
                Step::Done(result.map(|()| match op.op_type {
                    OpType::Put => OpValue::Ref(line.id),
                    _ => OpValue::Nothing,
                }))
            }
            OpType::Del => {
                if let Some(step) = self.acquire_exclusive(line, op, ctx) {
                    return step;
                }
                let result = self.write_line(line, op.txn.as_ref(), None, flags::DELETED, ctx);
                Step::Done(result.map(|()| OpValue::Nothing))
            }
            OpType::Push => self.push_line(line, op),
            OpType::PushX => self.pushx_line(line, op),
            OpType::Send => {
                let data = op.data.clone().unwrap_or_default();
                if line.state.is_owner() {
                    ctx.notify(self.listeners_for(line), line.id, Event::Message(data));
                    return Step::Done(Ok(OpValue::Nothing));
                }
                let payload = MessageType::Msg(UserMessage {
                    line: line.id,
                    data,
                });
                self.request(line, op, payload, ctx)
            }
            OpType::Invoke => {
                let Some(function) = op.function.as_deref() else {
                    return Step::Done(Err(GalaxyError::invalid_operation(
                        "INVOKE without a function name",
                    )));
                };
                let args = op.data.clone().unwrap_or_default();
                if !line.state.is_owner() {
                    let payload = MessageType::Invoke(InvokeMessage {
                        line: line.id,
                        function: function.to_string(),
                        args,
                    });
                    return self.request(line, op, payload, ctx);
                }
                if let Some(step) = self.acquire_exclusive(line, op, ctx) {
                    return step;
                }
                Step::Done(
                    self.apply_function(line, op.txn.as_ref(), function, &args, ctx)
                        .map(OpValue::Invoked),
                )
            }
            OpType::Listen => {
                line.listener = op.listener.clone();
                Step::Done(Ok(OpValue::Nothing))
            }
            OpType::Alloc | OpType::GetFromOwner => Step::Done(Err(GalaxyError::internal(
                format!("{} reached line execution", op.op_type),
            ))),
        }
    }

    fn read(&self, line: &mut CacheLine, op: &Op, ctx: &mut Dispatch) -> Step {
        if line.state.is_readable() && !line.needs_refresh {
            self.observe(|m| m.read(true));
            if op.op_type == OpType::GetS {
                if let Some(txn) = &op.txn {
                    txn.record_read(line.id, line.version);
                }
            }
            return Step::Done(Ok(OpValue::Data(line.data.clone())));
        }
        self.observe(|m| m.read(false));
        self.request(line, op, MessageType::Get(LineMessage { line: line.id }), ctx)
    }

    /// Waits on the line's in-flight request, or starts one aimed at the
    /// best-known owner (a broadcast if there is none).
    fn request(&self, line: &mut CacheLine, op: &Op, payload: MessageType, ctx: &mut Dispatch) -> Step {
        if let Some(flight) = &line.in_flight {
            op.wait_on(flight.message_id);
            return Step::Wait;
        }
        let target = op
            .owner_hint
            .filter(|n| *n != self.local && self.membership.is_member(*n))
            .or_else(|| {
                line.owner_known(self.local)
                    .filter(|n| self.membership.is_member(*n))
            })
            .unwrap_or(NodeId::NONE);
        self.start_request(line, op, payload, target, ctx);
        Step::Wait
    }

    /// `None` once the line is stably exclusive here; otherwise the step to
    /// take while ownership or invalidations are outstanding.
    fn acquire_exclusive(&self, line: &mut CacheLine, op: &Op, ctx: &mut Dispatch) -> Option<Step> {
        if line.is_stable_exclusive() {
            return None;
        }
        match line.state {
            LineState::Owned | LineState::Exclusive => {
                if line.next_state.is_none() {
                    self.begin_invalidation(line, ctx);
                }
                if line.is_stable_exclusive() {
                    None
                } else {
                    Some(Step::Wait)
                }
            }
            LineState::Shared | LineState::Invalid => Some(self.request(
                line,
                op,
                MessageType::GetX(LineMessage { line: line.id }),
                ctx,
            )),
        }
    }

    fn lock_line(&self, line: &mut CacheLine, txn: &Transaction) {
        line.set_flag(flags::LOCKED);
        line.locked_by = Some(txn.id());
        txn.add_locked(line.id);
    }

    /// Installs new contents as the next version. Inside a transaction the
    /// line is locked and its pre-image captured; otherwise the version is
    /// backed up straight away.
    pub(crate) fn write_line(
        &self,
        line: &mut CacheLine,
        txn: Option<&Arc<Transaction>>,
        data: Option<Bytes>,
        extra_flags: u8,
        ctx: &mut Dispatch,
    ) -> Result<()> {
        let stored = data.map(|d| self.storage.store(&d)).transpose()?;
        let captured = match txn {
            Some(txn) => {
                self.lock_line(line, txn);
                txn.capture(line.id, || PreImage {
                    data: line.data.clone(),
                    flags: line.flags & (flags::MODIFIED | flags::DELETED),
                })
            }
            None => false,
        };
        if let Some(old) = std::mem::replace(&mut line.data, stored) {
            if !captured {
                self.storage.deallocate(line.id, old);
            }
        }
        line.version += 1;
        line.clear_flag(flags::DELETED);
        line.set_flag(flags::MODIFIED | extra_flags);
        if txn.is_none() {
            self.release_write(line, ctx);
        }
        Ok(())
    }

    /// Applies a registered function to the line on its owner.
    pub(crate) fn apply_function(
        &self,
        line: &mut CacheLine,
        txn: Option<&Arc<Transaction>>,
        name: &str,
        args: &Bytes,
        ctx: &mut Dispatch,
    ) -> Result<Bytes> {
        let function = self
            .functions
            .get(name)
            .map(|f| Arc::clone(f.value()))
            .ok_or_else(|| GalaxyError::invalid_operation(format!("unknown function {}", name)))?;
        let invocation = function.invoke(line.id, line.data.as_ref(), args)?;
        let size = invocation.data.as_ref().map_or(0, |d| d.len());
        if size > self.config.max_item_size {
            return Err(GalaxyError::ItemTooLarge {
                size,
                max: self.config.max_item_size,
            });
        }
        self.write_line(line, txn, invocation.data, 0, ctx)?;
        Ok(invocation.result)
    }

    fn push_line(&self, line: &mut CacheLine, op: &Op) -> Step {
        if !line.state.is_owner() {
            debug!("Ignoring PUSH of {}: not the owner", line.id);
            return Step::Done(Ok(OpValue::Nothing));
        }
        if line.locked_by.is_some() {
            return Step::Done(Err(GalaxyError::invalid_operation(format!(
                "cannot push {} while its transaction holds it",
                line.id
            ))));
        }
        if line.is_blocked() {
            return Step::Wait;
        }

        for &node in &op.nodes {
            if node == self.local || !node.is_peer() || !self.membership.is_member(node) {
                debug!("Skipping push of {} to {}", line.id, node);
                continue;
            }
            let message = Message::request(
                self.local,
                node,
                self.next_message_id(),
                MessageType::Put(PutMessage {
                    line: line.id,
                    version: line.version,
                    data: line.data.clone(),
                }),
            );
            match self.send_message(message) {
                Ok(()) => {
                    line.sharers.insert(node);
                }
                Err(e) => debug!("Push of {} to {} failed: {}", line.id, node, e),
            }
        }
        if line.state == LineState::Exclusive && !line.sharers.is_empty() {
            line.state = LineState::Owned;
        }
        Step::Done(Ok(OpValue::Nothing))
    }

    fn pushx_line(&self, line: &mut CacheLine, op: &Op) -> Step {
        if !line.is_stable_exclusive() {
            debug!("Ignoring PUSHX of {}: not exclusive", line.id);
            return Step::Done(Ok(OpValue::Nothing));
        }
        let Some(&target) = op.nodes.first() else {
            return Step::Done(Err(GalaxyError::invalid_operation("PUSHX without a target")));
        };
        if target == self.local || !target.is_peer() || !self.membership.is_member(target) {
            return Step::Done(Err(GalaxyError::NodeNotFound { node: target }));
        }
        if line.locked_by.is_some() {
            return Step::Done(Err(GalaxyError::invalid_operation(format!(
                "cannot push {} while its transaction holds it",
                line.id
            ))));
        }
        if line.is_blocked() {
            return Step::Wait;
        }

        let message = Message::request(
            self.local,
            target,
            self.next_message_id(),
            MessageType::PutX(PutXMessage {
                line: line.id,
                version: line.version,
                data: line.data.clone(),
                sharers: Vec::new(),
                partial: false,
            }),
        );
        if let Err(e) = self.send_message(message) {
            return Step::Done(Err(e));
        }
        debug!("Pushed ownership of {} to {}", line.id, target);
        line.state = LineState::Shared;
        line.owner = target;
        line.owner_guessed = false;
        line.sharers.clear();
        self.stale.record(line.id, target);
        Step::Done(Ok(OpValue::Nothing))
    }

    /// Lets queued operations and messages proceed as far as the line allows.
    pub(crate) fn settle(&self, line: &mut CacheLine, ctx: &mut Dispatch) {
        self.process_ops(line, ctx);
        if self.drain_messages(line, ctx) {
            self.process_ops(line, ctx);
        }
    }

    fn process_ops(&self, line: &mut CacheLine, ctx: &mut Dispatch) {
        loop {
            while line.pending_ops.front().map_or(false, |op| op.is_resolved()) {
                line.pending_ops.pop_front();
            }
            let Some(op) = line.pending_ops.front().cloned() else {
                return;
            };
            if self.waits_on_flight(line, &op) {
                break;
            }
            match self.execute(line, &op, ctx) {
                Step::Done(result) => {
                    op.resolve(result);
                    line.pending_ops.retain(|queued| !Arc::ptr_eq(queued, &op));
                }
                Step::Wait => break,
            }
        }
        if line.locked_by.is_some() {
            self.process_holder_ops(line, ctx);
        }
    }

    /// Operations of the transaction holding the line run ahead of others.
    fn process_holder_ops(&self, line: &mut CacheLine, ctx: &mut Dispatch) {
        let mut index = 0;
        while index < line.pending_ops.len() {
            let op = Arc::clone(&line.pending_ops[index]);
            if op.is_resolved() {
                line.pending_ops.remove(index);
                continue;
            }
            if line.locked_by.is_none()
                || op.txn_id() != line.locked_by
                || self.waits_on_flight(line, &op)
            {
                index += 1;
                continue;
            }
            match self.execute(line, &op, ctx) {
                Step::Done(result) => {
                    op.resolve(result);
                    line.pending_ops.remove(index);
                }
                Step::Wait => index += 1,
            }
        }
    }

    fn waits_on_flight(&self, line: &CacheLine, op: &Op) -> bool {
        line.in_flight
            .as_ref()
            .map_or(false, |f| op.is_waiting_on(f.message_id))
    }

    /// Replays requests that were queued while the line was busy. Returns
    /// true if any were handled.
    fn drain_messages(&self, line: &mut CacheLine, ctx: &mut Dispatch) -> bool {
        if line.pending_messages.is_empty() || line.is_blocked() {
            return false;
        }
        let mut queued = std::mem::take(&mut line.pending_messages);
        while let Some(message) = queued.pop_front() {
            if line.is_blocked() {
                queued.push_front(message);
                break;
            }
            self.dispatch(line, message, ctx);
        }
        line.pending_messages.extend(queued);
        true
    }

    /// Blocking entry point: runs `op` and waits up to `op_timeout` for it.
    pub fn do_op(&self, op: Op) -> Result<OpValue> {
        match self.run_op(op)? {
            OpStatus::Done(value) => Ok(value),
            OpStatus::Pending(pending) => match pending.wait(self.config.op_timeout) {
                Some(result) => result,
                None => self.expire(&pending),
            },
        }
    }

    pub async fn do_op_async(&self, op: Op) -> Result<OpValue> {
        match self.run_op(op)? {
            OpStatus::Done(value) => Ok(value),
            OpStatus::Pending(pending) => {
                match tokio::time::timeout(self.config.op_timeout, pending.completed()).await {
                    Ok(result) => result,
                    Err(_) => self.expire(&pending),
                }
            }
        }
    }

    /// Fails a pending operation with `Timeout` and takes it off its line.
    fn expire(&self, pending: &PendingOp) -> Result<OpValue> {
        // allocations have no line yet
        let line = pending.line.unwrap_or(LineId::new(0));
        let error = GalaxyError::Timeout { line };
        if !pending.completion.resolve(Err(error.clone())) {
            return pending.completion.result().unwrap_or(Err(error));
        }
        warn!("Operation on {} timed out", line);
        self.observe(|m| m.timed_out());
        match pending.line {
            Some(id) => {
                self.with_line(id, false, |line, ctx| {
                    line.pending_ops.retain(|op| !op.is_resolved());
                    self.settle(line, ctx);
                });
            }
            None => self.refs.lock().waiters.retain(|op| !op.is_resolved()),
        }
        Err(error)
    }

    pub fn get(&self, line: LineId) -> Result<Option<Bytes>> {
        self.do_op(Op::get(line)).map(OpValue::into_data)
    }

    pub fn getx(&self, line: LineId) -> Result<Option<Bytes>> {
        self.do_op(Op::getx(line)).map(OpValue::into_data)
    }

    pub fn set(&self, line: LineId, data: Bytes) -> Result<()> {
        self.do_op(Op::set(line, data)).map(|_| ())
    }

    /// Stores `data` under a freshly allocated id.
    pub fn put(&self, data: Bytes) -> Result<LineId> {
        expect_ref(self.do_op(Op::put(data))?)
    }

    pub fn put_at(&self, line: LineId, data: Bytes) -> Result<()> {
        self.do_op(Op::put_at(line, data)).map(|_| ())
    }

    /// Allocates `count` empty lines; returns the first id.
    pub fn alloc(&self, count: u64) -> Result<LineId> {
        expect_ref(self.do_op(Op::alloc(count))?)
    }

    pub fn del(&self, line: LineId) -> Result<()> {
        self.do_op(Op::del(line)).map(|_| ())
    }

    pub fn push(&self, line: LineId, nodes: Vec<NodeId>) -> Result<()> {
        self.do_op(Op::push(line, nodes)).map(|_| ())
    }

    pub fn pushx(&self, line: LineId, node: NodeId) -> Result<()> {
        self.do_op(Op::pushx(line, node)).map(|_| ())
    }

    pub fn send(&self, line: LineId, data: Bytes) -> Result<()> {
        self.do_op(Op::send(line, data)).map(|_| ())
    }

    pub fn invoke(&self, line: LineId, function: &str, args: Bytes) -> Result<Bytes> {
        match self.do_op(Op::invoke(line, function, args))? {
            OpValue::Invoked(result) => Ok(result),
            other => Err(GalaxyError::internal(format!(
                "INVOKE completed with {:?}",
                other
            ))),
        }
    }

    pub fn listen(&self, line: LineId, listener: Option<Arc<dyn CacheListener>>) -> Result<()> {
        self.do_op(Op::listen(line, listener)).map(|_| ())
    }

    pub fn get_from_owner(&self, line: LineId, owner_of: LineId, exclusive: bool) -> Result<Option<Bytes>> {
        self.do_op(Op::get_from_owner(line, owner_of, exclusive))
            .map(OpValue::into_data)
    }

    pub async fn get_async(&self, line: LineId) -> Result<Option<Bytes>> {
        self.do_op_async(Op::get(line)).await.map(OpValue::into_data)
    }

    pub async fn set_async(&self, line: LineId, data: Bytes) -> Result<()> {
        self.do_op_async(Op::set(line, data)).await.map(|_| ())
    }

    /// PUT without an id and ALLOC: take ids from the local window, or wait
    /// for the allocator to supply more.
    fn allocate(&self, op: Op) -> Result<OpStatus> {
        let Some(allocator) = self.ref_allocator.clone() else {
            return Err(GalaxyError::invalid_operation(format!(
                "{} needs a ref allocator",
                op.op_type
            )));
        };
        if op.count == 0 {
            return Err(GalaxyError::invalid_operation("ALLOC of zero lines"));
        }

        let op = Arc::new(op);
        let (start, refill) = {
            let mut refs = self.refs.lock();
            let start = if refs.waiters.is_empty() {
                refs.take(op.count)
            } else {
                None
            };
            if start.is_none() {
                refs.waiters.push_back(Arc::clone(&op));
            }
            (start, refs.refill_request(self.config.ref_batch_size, op.count))
        };
        if let Some(batch) = refill {
            info!("Requesting {} fresh ids", batch);
            allocator.allocate_refs(batch);
        }
        if let Some(start) = start {
            op.resolve(self.populate_fresh(&op, start));
        }
        self.status(&op)
    }

    /// Creates the op's fresh lines, exclusively owned here.
    fn populate_fresh(&self, op: &Op, start: u64) -> Result<OpValue> {
        for offset in 0..op.count {
            let id = LineId::new(start + offset);
            let data = match op.op_type {
                OpType::Put => op.data.clone(),
                _ => None,
            };
            self.with_line(id, true, |line, ctx| {
                if line.state != LineState::Invalid || line.version != 0 || line.in_flight.is_some() {
                    return Err(GalaxyError::protocol(format!(
                        "fresh id {} is already in use",
                        id
                    )));
                }
                line.state = LineState::Exclusive;
                line.owner = self.local;
                line.owner_guessed = false;
                self.write_line(line, op.txn.as_ref(), data, 0, ctx)
            })
            .unwrap_or_else(|| Err(GalaxyError::internal(format!("line {} vanished", id))))?;
        }
        Ok(OpValue::Ref(LineId::new(start)))
    }

    /// A batch of fresh ids from the allocator. Waiting allocations are
    /// served in arrival order.
    pub fn refs_allocated(&self, start: u64, count: u64) -> Result<()> {
        if start <= MAX_RESERVED_REF_ID {
            return Err(GalaxyError::protocol(format!(
                "allocated ids start at reserved id {:#x}",
                start
            )));
        }
        if count == 0 {
            return Err(GalaxyError::protocol("empty id batch"));
        }
        debug!("Received {} fresh ids from {:#x}", count, start);

        let (ready, refill) = {
            let mut refs = self.refs.lock();
            if !refs.supply(start, count) {
                warn!("Ignoring repeated id batch from {:#x}", start);
                return Ok(());
            }
            let mut ready = Vec::new();
            while let Some(op) = refs.waiters.front().cloned() {
                if op.is_resolved() {
                    refs.waiters.pop_front();
                    continue;
                }
                let Some(first) = refs.take(op.count) else {
                    break;
                };
                refs.waiters.pop_front();
                ready.push((op, first));
            }
            let needed = refs.waiters.front().map_or(1, |op| op.count);
            (ready, refs.refill_request(self.config.ref_batch_size, needed))
        };

        for (op, first) in ready {
            op.resolve(self.populate_fresh(&op, first));
        }
        if let (Some(batch), Some(allocator)) = (refill, &self.ref_allocator) {
            info!("Requesting {} fresh ids", batch);
            allocator.allocate_refs(batch);
        }
        Ok(())
    }
}

fn expect_ref(value: OpValue) -> Result<LineId> {
    value
        .as_ref_id()
        .ok_or_else(|| GalaxyError::internal(format!("expected a line id, got {:?}", value)))
}
