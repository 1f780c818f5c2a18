//! A minimal central server for cluster tests.
//!
//! The server owns the lines it was seeded with until a peer takes them with
//! GETX, and otherwise answers like a node that has never seen the line.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};

use galaxy_core::messages::{
    LineMessage, Message, MessageKind, MessageType, PutMessage, PutXMessage,
};
use galaxy_core::{LineId, NodeId};

use crate::network_sim::{Endpoint, NetworkSimulator};

#[derive(Debug, Clone)]
struct StoredLine {
    version: u64,
    data: Option<Bytes>,
    sharers: BTreeSet<NodeId>,
}

pub struct ScriptedServer {
    network: Arc<NetworkSimulator>,
    lines: Mutex<HashMap<LineId, StoredLine>>,
    received: Mutex<Vec<Message>>,
}

impl ScriptedServer {
    pub fn new(network: Arc<NetworkSimulator>) -> Self {
        Self {
            network,
            lines: Mutex::new(HashMap::new()),
            received: Mutex::new(Vec::new()),
        }
    }

    /// Makes the server the owner of `line`.
    pub fn store(&self, line: LineId, version: u64, data: Option<Bytes>) {
        self.lines.lock().insert(
            line,
            StoredLine {
                version,
                data,
                sharers: BTreeSet::new(),
            },
        );
    }

    pub fn owns(&self, line: LineId) -> bool {
        self.lines.lock().contains_key(&line)
    }

    pub fn received(&self) -> Vec<Message> {
        self.received.lock().clone()
    }

    pub fn received_kind(&self, kind: MessageKind) -> usize {
        self.received
            .lock()
            .iter()
            .filter(|m| m.kind() == kind)
            .count()
    }

    fn reply(&self, request: &Message, message_type: MessageType) {
        if let Err(e) = self
            .network
            .send_message(request.reply(NodeId::SERVER, message_type))
        {
            debug!("Server reply to {} dropped: {}", request.from, e);
        }
    }

    fn answer(&self, message: &Message) -> Option<MessageType> {
        let line = message.line()?;
        let mut lines = self.lines.lock();
        let answer = match message.kind() {
            MessageKind::Get | MessageKind::GetS => match lines.get_mut(&line) {
                Some(stored) => {
                    stored.sharers.insert(message.from);
                    MessageType::Put(PutMessage {
                        line,
                        version: stored.version,
                        data: stored.data.clone(),
                    })
                }
                None => MessageType::NotFound(LineMessage { line }),
            },
            MessageKind::GetX => match lines.remove(&line) {
                Some(stored) => MessageType::PutX(PutXMessage {
                    line,
                    version: stored.version,
                    data: stored.data,
                    sharers: stored
                        .sharers
                        .into_iter()
                        .filter(|n| *n != message.from)
                        .collect(),
                    partial: false,
                }),
                None => MessageType::NotFound(LineMessage { line }),
            },
            MessageKind::Inv => MessageType::InvAck(LineMessage { line }),
            MessageKind::Del => {
                lines.remove(&line);
                MessageType::Ack(LineMessage { line })
            }
            MessageKind::Msg | MessageKind::Invoke => MessageType::NotFound(LineMessage { line }),
            _ => {
                if !message.response {
                    warn!("Server ignoring {}", message);
                }
                return None;
            }
        };
        Some(answer)
    }
}

impl Endpoint for ScriptedServer {
    fn deliver(&self, message: Message) {
        debug!("Server received {}", message);
        self.received.lock().push(message.clone());
        if let Some(answer) = self.answer(&message) {
            self.reply(&message, answer);
        }
    }
}
