use crate::messages::{Message, MessageType};
use crate::{GalaxyError, LineId, NodeId, Result};

pub trait Validator {
    fn validate(&self) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct ValidationConfig {
    pub max_item_size: usize,
    pub max_sharers: usize,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            max_item_size: 1024 * 1024, // 1MB
            max_sharers: i16::MAX as usize,
        }
    }
}

impl Validator for Message {
    fn validate(&self) -> Result<()> {
        validate_message(self, &ValidationConfig::default())
    }
}

/// Structural checks on an inbound message. They catch collaborator bugs
/// (a transport that mangles messages) before the message touches line state.
pub fn validate_message(message: &Message, config: &ValidationConfig) -> Result<()> {
    if message.from.is_none() {
        return Err(GalaxyError::protocol(format!(
            "{} has no sender",
            message.kind()
        )));
    }

    if let Some(line) = message.line() {
        validate_line_id(line)?;
    }

    match &message.message_type {
        MessageType::Put(put) => {
            validate_item_size(put.data.as_ref().map_or(0, |d| d.len()), config)?;
        }
        MessageType::PutX(putx) => {
            validate_item_size(putx.data.as_ref().map_or(0, |d| d.len()), config)?;
            if putx.sharers.len() > config.max_sharers {
                return Err(GalaxyError::protocol(format!(
                    "PUTX for {} lists {} sharers",
                    putx.line,
                    putx.sharers.len()
                )));
            }
            for sharer in &putx.sharers {
                validate_sharer(*sharer, message)?;
            }
        }
        MessageType::ChangedOwner(redirect) => {
            if redirect.new_owner == message.from && redirect.certain {
                return Err(GalaxyError::protocol(format!(
                    "{} redirects {} to itself",
                    message.from, redirect.line
                )));
            }
        }
        MessageType::Msg(msg) => validate_item_size(msg.data.len(), config)?,
        MessageType::AllocedRef(alloced) => {
            if alloced.count == 0 {
                return Err(GalaxyError::protocol("ALLOCED_REF with an empty range"));
            }
        }
        _ => {}
    }

    Ok(())
}

fn validate_line_id(line: LineId) -> Result<()> {
    if line.value() == 0 {
        return Err(GalaxyError::protocol("line id 0 is never valid on the wire"));
    }
    Ok(())
}

fn validate_item_size(size: usize, config: &ValidationConfig) -> Result<()> {
    if size > config.max_item_size {
        return Err(GalaxyError::ItemTooLarge {
            size,
            max: config.max_item_size,
        });
    }
    Ok(())
}

fn validate_sharer(sharer: NodeId, message: &Message) -> Result<()> {
    if sharer.is_none() || sharer == message.from || (!message.is_broadcast() && sharer == message.to)
    {
        return Err(GalaxyError::protocol(format!(
            "PUTX from {} to {} lists invalid sharer {}",
            message.from, message.to, sharer
        )));
    }
    Ok(())
}
