//! # Protocol Messages
//!
//! Immutable wire messages exchanged by coherence engines. Every message
//! carries its kind, the sending and target nodes, a message id and a response
//! flag; line-scoped messages additionally carry the line id.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{LineId, NodeId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub message_id: u64,
    pub from: NodeId,
    /// `NodeId::NONE` for broadcast
    pub to: NodeId,
    pub response: bool,
    pub message_type: MessageType,
}

impl Message {
    pub fn new(
        from: NodeId,
        to: NodeId,
        message_id: u64,
        response: bool,
        message_type: MessageType,
    ) -> Self {
        Self {
            message_id,
            from,
            to,
            response,
            message_type,
        }
    }

    /// A request addressed to `to` (or broadcast when `to` is `NodeId::NONE`).
    pub fn request(from: NodeId, to: NodeId, message_id: u64, message_type: MessageType) -> Self {
        Self::new(from, to, message_id, false, message_type)
    }

    /// Builds the response to this message. The response goes back to the
    /// sender and reuses the request's message id for correlation.
    pub fn reply(&self, from: NodeId, message_type: MessageType) -> Self {
        Self::new(from, self.from, self.message_id, true, message_type)
    }

    pub fn get(from: NodeId, to: NodeId, message_id: u64, line: LineId) -> Self {
        Self::request(from, to, message_id, MessageType::Get(LineMessage { line }))
    }

    pub fn getx(from: NodeId, to: NodeId, message_id: u64, line: LineId) -> Self {
        Self::request(from, to, message_id, MessageType::GetX(LineMessage { line }))
    }

    pub fn inv(
        from: NodeId,
        to: NodeId,
        message_id: u64,
        line: LineId,
        previous_owner: NodeId,
    ) -> Self {
        Self::request(
            from,
            to,
            message_id,
            MessageType::Inv(InvMessage {
                line,
                previous_owner,
            }),
        )
    }

    /// A locally generated TIMEOUT for the request `message_id` on `line`.
    pub fn timeout(local: NodeId, line: LineId, message_id: u64) -> Self {
        Self::new(
            local,
            local,
            message_id,
            true,
            MessageType::Timeout(LineMessage { line }),
        )
    }

    pub fn kind(&self) -> MessageKind {
        self.message_type.kind()
    }

    pub fn line(&self) -> Option<LineId> {
        self.message_type.line()
    }

    pub fn is_broadcast(&self) -> bool {
        self.to.is_none()
    }

    /// Request/response correlation: same line, same message id, and the
    /// response kind is one that can answer the request kind. Payloads are
    /// not compared.
    pub fn is_response_to(&self, request: &Message) -> bool {
        self.response
            && !request.response
            && self.message_id == request.message_id
            && self.line() == request.line()
            && self.kind().answers(request.kind())
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}#{} {} -> {}",
            self.kind(),
            if self.response { "(resp)" } else { "" },
            self.message_id,
            self.from,
            self.to
        )?;
        if let Some(line) = self.line() {
            write!(f, " line {}", line)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MessageType {
    Get(LineMessage),
    GetS(LineMessage),
    GetX(LineMessage),
    Put(PutMessage),
    PutX(PutXMessage),
    Inv(InvMessage),
    InvAck(LineMessage),
    ChangedOwner(ChangedOwnerMessage),
    NotFound(LineMessage),
    Ack(LineMessage),
    Timeout(LineMessage),
    Del(LineMessage),
    Msg(UserMessage),
    MsgAck(LineMessage),
    Invoke(InvokeMessage),
    InvRes(InvokeResultMessage),
    BackupPacket(BackupPacketMessage),
    BackupPacketAck(BackupPacketAckMessage),
    AllocRef(AllocRefMessage),
    AllocedRef(AllocedRefMessage),
}

impl MessageType {
    pub fn kind(&self) -> MessageKind {
        match self {
            MessageType::Get(_) => MessageKind::Get,
            MessageType::GetS(_) => MessageKind::GetS,
            MessageType::GetX(_) => MessageKind::GetX,
            MessageType::Put(_) => MessageKind::Put,
            MessageType::PutX(_) => MessageKind::PutX,
            MessageType::Inv(_) => MessageKind::Inv,
            MessageType::InvAck(_) => MessageKind::InvAck,
            MessageType::ChangedOwner(_) => MessageKind::ChangedOwner,
            MessageType::NotFound(_) => MessageKind::NotFound,
            MessageType::Ack(_) => MessageKind::Ack,
            MessageType::Timeout(_) => MessageKind::Timeout,
            MessageType::Del(_) => MessageKind::Del,
            MessageType::Msg(_) => MessageKind::Msg,
            MessageType::MsgAck(_) => MessageKind::MsgAck,
            MessageType::Invoke(_) => MessageKind::Invoke,
            MessageType::InvRes(_) => MessageKind::InvRes,
            MessageType::BackupPacket(_) => MessageKind::BackupPacket,
            MessageType::BackupPacketAck(_) => MessageKind::BackupPacketAck,
            MessageType::AllocRef(_) => MessageKind::AllocRef,
            MessageType::AllocedRef(_) => MessageKind::AllocedRef,
        }
    }

    pub fn line(&self) -> Option<LineId> {
        match self {
            MessageType::Get(m)
            | MessageType::GetS(m)
            | MessageType::GetX(m)
            | MessageType::InvAck(m)
            | MessageType::NotFound(m)
            | MessageType::Ack(m)
            | MessageType::Timeout(m)
            | MessageType::Del(m)
            | MessageType::MsgAck(m) => Some(m.line),
            MessageType::Put(m) => Some(m.line),
            MessageType::PutX(m) => Some(m.line),
            MessageType::Inv(m) => Some(m.line),
            MessageType::ChangedOwner(m) => Some(m.line),
            MessageType::Msg(m) => Some(m.line),
            MessageType::Invoke(m) => Some(m.line),
            MessageType::InvRes(m) => Some(m.line),
            MessageType::BackupPacket(_)
            | MessageType::BackupPacketAck(_)
            | MessageType::AllocRef(_)
            | MessageType::AllocedRef(_) => None,
        }
    }
}

/// Dense, payload-free tag of a message type, usable as an array index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    Get,
    GetS,
    GetX,
    Put,
    PutX,
    Inv,
    InvAck,
    ChangedOwner,
    NotFound,
    Ack,
    Timeout,
    Del,
    Msg,
    MsgAck,
    Invoke,
    InvRes,
    BackupPacket,
    BackupPacketAck,
    AllocRef,
    AllocedRef,
}

impl MessageKind {
    pub const COUNT: usize = 20;

    pub const ALL: [MessageKind; MessageKind::COUNT] = [
        MessageKind::Get,
        MessageKind::GetS,
        MessageKind::GetX,
        MessageKind::Put,
        MessageKind::PutX,
        MessageKind::Inv,
        MessageKind::InvAck,
        MessageKind::ChangedOwner,
        MessageKind::NotFound,
        MessageKind::Ack,
        MessageKind::Timeout,
        MessageKind::Del,
        MessageKind::Msg,
        MessageKind::MsgAck,
        MessageKind::Invoke,
        MessageKind::InvRes,
        MessageKind::BackupPacket,
        MessageKind::BackupPacketAck,
        MessageKind::AllocRef,
        MessageKind::AllocedRef,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    /// Requests that acquire a line or address its owner.
    pub fn is_owner_request(self) -> bool {
        matches!(
            self,
            MessageKind::Get
                | MessageKind::GetS
                | MessageKind::GetX
                | MessageKind::Msg
                | MessageKind::Invoke
        )
    }

    /// Whether a response of this kind can answer a request of `request` kind.
    pub fn answers(self, request: MessageKind) -> bool {
        use MessageKind::*;
        match self {
            Put => matches!(request, Get | GetS),
            PutX => request == GetX,
            InvAck => request == Inv,
            MsgAck => request == Msg,
            InvRes => request == Invoke,
            ChangedOwner | NotFound | Ack | Timeout => request.is_owner_request(),
            BackupPacketAck => request == BackupPacket,
            AllocedRef => request == AllocRef,
            _ => false,
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageKind::Get => "GET",
            MessageKind::GetS => "GETS",
            MessageKind::GetX => "GETX",
            MessageKind::Put => "PUT",
            MessageKind::PutX => "PUTX",
            MessageKind::Inv => "INV",
            MessageKind::InvAck => "INVACK",
            MessageKind::ChangedOwner => "CHNGD_OWNR",
            MessageKind::NotFound => "NOT_FOUND",
            MessageKind::Ack => "ACK",
            MessageKind::Timeout => "TIMEOUT",
            MessageKind::Del => "DEL",
            MessageKind::Msg => "MSG",
            MessageKind::MsgAck => "MSGACK",
            MessageKind::Invoke => "INVOKE",
            MessageKind::InvRes => "INVRES",
            MessageKind::BackupPacket => "BACKUP_PACKET",
            MessageKind::BackupPacketAck => "BACKUP_PACKETACK",
            MessageKind::AllocRef => "ALLOC_REF",
            MessageKind::AllocedRef => "ALLOCED_REF",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineMessage {
    pub line: LineId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PutMessage {
    pub line: LineId,
    pub version: u64,
    pub data: Option<Bytes>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PutXMessage {
    pub line: LineId,
    pub version: u64,
    pub data: Option<Bytes>,
    /// Nodes still holding shared copies; the new owner must invalidate them.
    pub sharers: Vec<NodeId>,
    pub partial: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvMessage {
    pub line: LineId,
    pub previous_owner: NodeId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangedOwnerMessage {
    pub line: LineId,
    pub new_owner: NodeId,
    /// False when the responder only has a best guess.
    pub certain: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserMessage {
    pub line: LineId,
    pub data: Bytes,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvokeMessage {
    pub line: LineId,
    pub function: String,
    pub args: Bytes,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvokeResultMessage {
    pub line: LineId,
    pub result: std::result::Result<Bytes, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupEntry {
    pub line: LineId,
    pub version: u64,
    pub data: Option<Bytes>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupPacketMessage {
    pub packet_id: u64,
    pub entries: Vec<BackupEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupPacketAckMessage {
    pub packet_id: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocRefMessage {
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocedRefMessage {
    pub start: u64,
    pub count: u64,
}
