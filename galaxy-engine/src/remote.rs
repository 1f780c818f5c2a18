//! Inbound protocol message handling.

use bytes::Bytes;
use galaxy_core::messages::{
    ChangedOwnerMessage, InvokeMessage, InvokeResultMessage, LineMessage, Message, MessageKind,
    MessageType, PutMessage, PutXMessage,
};
use galaxy_core::ops::{OpType, OpValue};
use galaxy_core::{validate_message, GalaxyError, LineState, NodeId, Result};
use std::collections::BTreeSet;
use tracing::{debug, error, warn};

use crate::cache::{Cache, Dispatch, Event};
use crate::line::{flags, CacheLine};

impl Cache {
    /// Entry point for messages delivered by the transport.
    pub fn receive(&self, message: Message) {
        self.observe(|m| m.message_received(message.kind()));
        if let Err(e) = validate_message(&message, &self.validation) {
            warn!("Dropping invalid message {}: {}", message, e);
            return;
        }
        if !message.is_broadcast() && message.to != self.local {
            warn!("Dropping misrouted message {}", message);
            return;
        }
        debug!("Received {}", message);

        match &message.message_type {
            MessageType::BackupPacket(_) | MessageType::BackupPacketAck(_) => {
                self.backup.receive(message);
                return;
            }
            MessageType::AllocRef(_) => {
                match &self.ref_allocator {
                    Some(allocator) => allocator.receive(message),
                    None => warn!("No ref allocator for {}", message),
                }
                return;
            }
            MessageType::AllocedRef(alloced) => {
                if let Err(e) = self.refs_allocated(alloced.start, alloced.count) {
                    error!("Rejected id batch from {}: {}", message.from, e);
                }
                return;
            }
            _ => {}
        }

        let Some(id) = message.line() else {
            return;
        };
        // only a push may introduce a line; responses need a request in flight
        let create =
            !message.response && matches!(message.kind(), MessageKind::Put | MessageKind::PutX);
        let mut message = Some(message);
        let handled = self.with_line(id, create, |line, ctx| {
            if let Some(message) = message.take() {
                self.handle_message(line, message, ctx);
            }
        });
        if handled.is_none() {
            if let Some(message) = message {
                self.handle_absent(message);
            }
        }
    }

    /// Answers a message about a line this node has never seen (or dropped).
    fn handle_absent(&self, message: Message) {
        let Some(line) = message.line() else {
            return;
        };
        let reply = match message.kind() {
            kind if kind.is_owner_request() => {
                if message.is_broadcast() {
                    MessageType::Ack(LineMessage { line })
                } else {
                    MessageType::NotFound(LineMessage { line })
                }
            }
            MessageKind::Inv => MessageType::InvAck(LineMessage { line }),
            MessageKind::Del => MessageType::Ack(LineMessage { line }),
            _ => {
                debug!("Ignoring {} for unknown line", message);
                return;
            }
        };
        self.send_reply(message.reply(self.local, reply));
    }

    /// Handles one message for a locked line, then lets queued work proceed.
    pub(crate) fn handle_message(&self, line: &mut CacheLine, message: Message, ctx: &mut Dispatch) {
        self.dispatch(line, message, ctx);
        self.settle(line, ctx);
    }

    pub(crate) fn dispatch(&self, line: &mut CacheLine, message: Message, ctx: &mut Dispatch) {
        let kind = message.kind();
        let gated = !message.response
            && (kind.is_owner_request() || matches!(kind, MessageKind::Inv | MessageKind::Del));
        if gated && line.is_blocked() {
            debug!("Queueing {} behind busy line {}", message, line.id);
            if line.has_flag(flags::SLAVE) {
                self.backup.flush();
            }
            line.pending_messages.push_back(message);
            return;
        }

        match &message.message_type {
            MessageType::Get(_) | MessageType::GetS(_) => self.on_get(line, &message),
            MessageType::GetX(_) => self.on_getx(line, &message),
            MessageType::Put(put) => self.on_put(line, &message, put, ctx),
            MessageType::PutX(putx) => self.on_putx(line, &message, putx, ctx),
            MessageType::Inv(_) => self.on_inv(line, &message, ctx),
            MessageType::InvAck(_) => self.on_inv_ack(line, &message),
            MessageType::ChangedOwner(redirect) => {
                self.on_changed_owner(line, &message, redirect, ctx)
            }
            MessageType::NotFound(_) => {
                if self.is_in_flight(line, &message) {
                    self.on_not_found(line, ctx);
                }
            }
            MessageType::Ack(_) => self.on_ack(line, &message, ctx),
            MessageType::Timeout(_) => self.on_timeout(line, &message),
            MessageType::Del(_) => self.on_del(line, &message, ctx),
            MessageType::Msg(msg) => self.on_msg(line, &message, msg.data.clone(), ctx),
            MessageType::MsgAck(_) => {
                self.on_result(line, &message, OpType::Send, Ok(OpValue::Nothing))
            }
            MessageType::Invoke(invoke) => self.on_invoke(line, &message, invoke, ctx),
            MessageType::InvRes(result) => self.on_invoke_result(line, &message, result),
            _ => warn!("Unexpected {} for line {}", message, line.id),
        }
    }

    fn is_in_flight(&self, line: &CacheLine, message: &Message) -> bool {
        line.in_flight
            .as_ref()
            .map_or(false, |f| f.message_id == message.message_id && message.kind().answers(f.kind))
    }

    /// Non-owner answer to an owner request: point at the owner we know of,
    /// otherwise ACK a probe or report the line missing.
    fn redirect(&self, line: &CacheLine, message: &Message) {
        let reply = match line.owner_known(self.local) {
            Some(owner) if owner != message.from => {
                MessageType::ChangedOwner(ChangedOwnerMessage {
                    line: line.id,
                    new_owner: owner,
                    certain: !line.owner_guessed,
                })
            }
            _ if message.is_broadcast() => MessageType::Ack(LineMessage { line: line.id }),
            _ => MessageType::NotFound(LineMessage { line: line.id }),
        };
        self.send_reply(message.reply(self.local, reply));
    }

    fn on_get(&self, line: &mut CacheLine, message: &Message) {
        if !line.state.is_owner() {
            return self.redirect(line, message);
        }
        self.backup.flush();
        let reply = message.reply(
            self.local,
            MessageType::Put(PutMessage {
                line: line.id,
                version: line.version,
                data: line.data.clone(),
            }),
        );
        match self.send_message(reply) {
            Ok(()) => {
                if message.from != self.local {
                    line.sharers.insert(message.from);
                }
                if line.state == LineState::Exclusive && !line.sharers.is_empty() {
                    line.state = LineState::Owned;
                }
            }
            Err(e) => debug!("Could not serve {} to {}: {}", line.id, message.from, e),
        }
    }

    fn on_getx(&self, line: &mut CacheLine, message: &Message) {
        if !line.state.is_owner() {
            return self.redirect(line, message);
        }
        if message.from == self.local {
            warn!("Ignoring GETX for {} from ourselves", line.id);
            return;
        }
        self.backup.flush();
        let sharers = line
            .sharers
            .iter()
            .copied()
            .filter(|n| *n != message.from && *n != self.local)
            .collect();
        let reply = message.reply(
            self.local,
            MessageType::PutX(PutXMessage {
                line: line.id,
                version: line.version,
                data: line.data.clone(),
                sharers,
                partial: false,
            }),
        );
        if let Err(e) = self.send_message(reply) {
            debug!("Ownership of {} stays here, {} unreachable: {}", line.id, message.from, e);
            return;
        }

        debug!("Transferred ownership of {} to {}", line.id, message.from);
        line.state = LineState::Shared;
        line.next_state = None;
        line.owner = message.from;
        line.owner_guessed = false;
        line.sharers.clear();
        self.stale.record(line.id, message.from);
    }

    fn on_put(&self, line: &mut CacheLine, message: &Message, put: &PutMessage, ctx: &mut Dispatch) {
        let matched = self.is_in_flight(line, message);
        if message.response && !matched {
            debug!("Ignoring unmatched {}", message);
            return;
        }
        if line.state.is_owner() || put.version < line.version {
            debug!(
                "Ignoring PUT of {} v{} from {} (state {}, v{})",
                line.id, put.version, message.from, line.state, line.version
            );
            if matched {
                line.in_flight = None;
            }
            return;
        }
        if !self.adopt_data(line, put.data.as_ref()) {
            return;
        }

        let previous_owner = line.owner;
        line.state = LineState::Shared;
        line.next_state = None;
        line.version = put.version;
        line.owner = message.from;
        line.owner_guessed = false;
        line.needs_refresh = false;
        line.clear_flag(flags::DELETED);
        if previous_owner != message.from && previous_owner.is_peer() && previous_owner != self.local {
            ctx.purges.push(previous_owner);
        }
        self.stale.record(line.id, message.from);

        if matched
            || line
                .in_flight
                .as_ref()
                .map_or(false, |f| matches!(f.kind, MessageKind::Get | MessageKind::GetS))
        {
            line.in_flight = None;
        }
        ctx.notify(
            self.listeners_for(line),
            line.id,
            Event::Received {
                version: line.version,
                data: line.data.clone(),
            },
        );
    }

    fn on_putx(&self, line: &mut CacheLine, message: &Message, putx: &PutXMessage, ctx: &mut Dispatch) {
        if message.response && !self.is_in_flight(line, message) {
            debug!("Ignoring unmatched {}", message);
            return;
        }
        if line.state.is_owner() || message.from == self.local {
            debug!("Ignoring duplicate PUTX of {} from {}", line.id, message.from);
            return;
        }
        if putx.version < line.version {
            warn!(
                "PUTX of {} from {} carries v{} behind local v{}",
                line.id, message.from, putx.version, line.version
            );
        }
        if !self.adopt_data(line, putx.data.as_ref()) {
            return;
        }

        line.version = line.version.max(putx.version);
        line.owner = self.local;
        line.owner_guessed = false;
        line.needs_refresh = false;
        line.clear_flag(flags::DELETED);
        self.stale.forget(line.id);

        let mut sharers: BTreeSet<NodeId> = putx.sharers.iter().copied().collect();
        sharers.insert(message.from);
        if self.has_server() {
            sharers.insert(NodeId::SERVER);
        }
        sharers.remove(&self.local);
        sharers.remove(&NodeId::NONE);
        line.sharers = sharers;

        if line
            .in_flight
            .as_ref()
            .map_or(false, |f| matches!(f.kind, MessageKind::Get | MessageKind::GetS | MessageKind::GetX))
        {
            line.in_flight = None;
        }

        if line.sharers.is_empty() {
            line.state = LineState::Exclusive;
            line.next_state = None;
        } else {
            line.state = LineState::Owned;
            line.next_state = Some(LineState::Exclusive);
            line.inv_ids.clear();
            self.send_invalidations(line, message.from, ctx);
        }
        debug!(
            "Took ownership of {} from {}; {} sharers to invalidate",
            line.id,
            message.from,
            line.sharers.len()
        );
        ctx.notify(
            self.listeners_for(line),
            line.id,
            Event::Received {
                version: line.version,
                data: line.data.clone(),
            },
        );
    }

    /// Replaces the line's data with a stored copy of `data`.
    fn adopt_data(&self, line: &mut CacheLine, data: Option<&Bytes>) -> bool {
        let stored = match data.map(|d| self.storage.store(d)).transpose() {
            Ok(stored) => stored,
            Err(e) => {
                error!("Cannot store {}: {}", line.id, e);
                return false;
            }
        };
        if let Some(old) = std::mem::replace(&mut line.data, stored) {
            self.storage.deallocate(line.id, old);
        }
        true
    }

    fn on_inv(&self, line: &mut CacheLine, message: &Message, ctx: &mut Dispatch) {
        if line.state.is_owner() {
            warn!(
                "{} invalidated {} while it is owned here; yielding",
                message.from, line.id
            );
        }
        let previous_owner = line.owner;
        if let Some(old) = line.data.take() {
            self.storage.deallocate(line.id, old);
        }
        line.state = LineState::Invalid;
        line.next_state = None;
        line.sharers.clear();
        line.owner = message.from;
        line.owner_guessed = false;
        line.needs_refresh = false;
        self.stale.forget(line.id);
        if previous_owner.is_peer() && previous_owner != self.local {
            ctx.purges.push(previous_owner);
        }

        self.observe(|m| m.invalidated());
        ctx.notify(self.listeners_for(line), line.id, Event::Invalidated);

        let ack = message.reply(self.local, MessageType::InvAck(LineMessage { line: line.id }));
        if self.backup.inv(line.id, message.from) {
            line.deferred_inv_acks.push(ack);
        } else {
            self.send_reply(ack);
        }
    }

    fn on_inv_ack(&self, line: &mut CacheLine, message: &Message) {
        if !line.expects_inv_ack(message.from, message.message_id) {
            debug!("Ignoring stale INVACK for {} from {}", line.id, message.from);
            return;
        }
        line.inv_ids.remove(&message.from);
        line.sharers.remove(&message.from);
        if line.sharers.is_empty() {
            line.state = LineState::Exclusive;
            line.next_state = None;
            line.invalidation_deadline = None;
            line.inv_ids.clear();
            debug!("{} is now exclusive", line.id);
        }
    }

    fn on_changed_owner(
        &self,
        line: &mut CacheLine,
        message: &Message,
        redirect: &ChangedOwnerMessage,
        ctx: &mut Dispatch,
    ) {
        let Some(flight) = line
            .in_flight
            .as_ref()
            .filter(|f| f.message_id == message.message_id)
        else {
            debug!("Ignoring stale {}", message);
            return;
        };
        let previous_target = flight.target;
        let new_owner = redirect.new_owner;
        let target = if new_owner != self.local && self.membership.is_member(new_owner) {
            line.owner = new_owner;
            line.owner_guessed = !redirect.certain;
            new_owner
        } else {
            previous_target
        };
        debug!(
            "{} redirected {} to {}; asking {}",
            message.from, line.id, new_owner, target
        );
        self.reissue(line, target, ctx);
    }

    fn on_ack(&self, line: &mut CacheLine, message: &Message, ctx: &mut Dispatch) {
        if !self.is_in_flight(line, message) {
            return;
        }
        let Some(flight) = line.in_flight.as_mut() else {
            return;
        };
        if !flight.target.is_none() {
            return self.on_not_found(line, ctx);
        }
        flight.awaiting.remove(&message.from);
        if flight.awaiting.is_empty() {
            debug!("No peer owns {}", line.id);
            self.on_not_found(line, ctx);
        }
    }

    /// Nobody answered for the line: ask the server once, then give up.
    fn on_not_found(&self, line: &mut CacheLine, ctx: &mut Dispatch) {
        let Some((kind, message_id, tried_server)) = line
            .in_flight
            .as_ref()
            .map(|f| (f.kind, f.message_id, f.tried_server))
        else {
            return;
        };
        if !line.state.is_readable() {
            line.owner = NodeId::NONE;
        }
        if self.has_server() && !tried_server {
            debug!("Retrying {} for {} at the server", kind, line.id);
            return self.reissue(line, NodeId::SERVER, ctx);
        }
        line.in_flight = None;
        debug!("Ref {} not found", line.id);
        self.complete_waiting(line, message_id, None, Err(GalaxyError::RefNotFound { line: line.id }));
    }

    fn on_timeout(&self, line: &mut CacheLine, message: &Message) {
        let Some(flight) = line
            .in_flight
            .as_ref()
            .filter(|f| f.message_id == message.message_id)
        else {
            return;
        };
        warn!(
            "{} for {} to {} timed out",
            flight.kind, line.id, flight.target
        );
        let message_id = flight.message_id;
        line.in_flight = None;
        self.observe(|m| m.timed_out());
        self.complete_waiting(line, message_id, None, Err(GalaxyError::Timeout { line: line.id }));
    }

    fn on_del(&self, line: &mut CacheLine, message: &Message, ctx: &mut Dispatch) {
        if line.state.is_owner() {
            warn!("Ignoring DEL of locally owned {} from {}", line.id, message.from);
        } else {
            if let Some(old) = line.data.take() {
                self.storage.deallocate(line.id, old);
            }
            line.state = LineState::Invalid;
            line.owner = NodeId::NONE;
            line.set_flag(flags::DELETED);
            self.stale.forget(line.id);
            ctx.removals.push(line.id);
            ctx.notify(self.listeners_for(line), line.id, Event::Invalidated);
        }
        self.send_reply(message.reply(self.local, MessageType::Ack(LineMessage { line: line.id })));
    }

    fn on_msg(&self, line: &mut CacheLine, message: &Message, data: Bytes, ctx: &mut Dispatch) {
        if !line.state.is_owner() {
            return self.redirect(line, message);
        }
        ctx.notify(self.listeners_for(line), line.id, Event::Message(data));
        self.send_reply(message.reply(self.local, MessageType::MsgAck(LineMessage { line: line.id })));
    }

    fn on_invoke(&self, line: &mut CacheLine, message: &Message, invoke: &InvokeMessage, ctx: &mut Dispatch) {
        if !line.state.is_owner() {
            return self.redirect(line, message);
        }
        if line.state == LineState::Owned {
            self.begin_invalidation(line, ctx);
            if line.next_state.is_some() {
                line.pending_messages.push_back(message.clone());
                return;
            }
        }

        let result = self
            .apply_function(line, None, &invoke.function, &invoke.args, ctx)
            .map_err(|e| e.to_string());
        let reply = message.reply(
            self.local,
            MessageType::InvRes(InvokeResultMessage {
                line: line.id,
                result,
            }),
        );
        if line.has_flag(flags::SLAVE) {
            line.held_responses.push(reply);
        } else {
            self.send_reply(reply);
        }
    }

    fn on_invoke_result(&self, line: &mut CacheLine, message: &Message, result: &InvokeResultMessage) {
        let value = match &result.result {
            Ok(value) => Ok(OpValue::Invoked(value.clone())),
            Err(reason) => Err(GalaxyError::invalid_operation(reason.clone())),
        };
        self.on_result(line, message, OpType::Invoke, value);
    }

    /// A response that carries the result of the waiting operation itself.
    fn on_result(&self, line: &mut CacheLine, message: &Message, op_type: OpType, result: Result<OpValue>) {
        if !self.is_in_flight(line, message) {
            debug!("Ignoring unmatched {}", message);
            return;
        }
        line.in_flight = None;
        self.complete_waiting(line, message.message_id, Some(op_type), result);
    }

    /// Resolves the operations waiting on `message_id` (only those of
    /// `op_type`, if given) and drops them from the queue.
    pub(crate) fn complete_waiting(
        &self,
        line: &mut CacheLine,
        message_id: u64,
        op_type: Option<OpType>,
        result: Result<OpValue>,
    ) {
        line.pending_ops.retain(|op| {
            let matches = op.is_waiting_on(message_id) && op_type.map_or(true, |t| t == op.op_type);
            if matches {
                op.resolve(result.clone());
            }
            !matches
        });
    }
}
