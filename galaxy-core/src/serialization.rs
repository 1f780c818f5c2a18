use crate::{messages::Message, GalaxyError, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Trait for message serialization
pub trait MessageSerializer {
    fn serialize<T>(&self, data: &T) -> Result<Vec<u8>>
    where
        T: Serialize;

    fn deserialize<T>(&self, bytes: &[u8]) -> Result<T>
    where
        T: for<'de> Deserialize<'de>;
}

/// JSON serializer, handy for debugging captures
#[derive(Default, Clone)]
pub struct JsonSerializer;

impl MessageSerializer for JsonSerializer {
    fn serialize<T>(&self, data: &T) -> Result<Vec<u8>>
    where
        T: Serialize,
    {
        serde_json::to_vec(data)
            .map_err(|e| GalaxyError::serialization(format!("JSON serialization failed: {}", e)))
    }

    fn deserialize<T>(&self, bytes: &[u8]) -> Result<T>
    where
        T: for<'de> Deserialize<'de>,
    {
        serde_json::from_slice(bytes)
            .map_err(|e| GalaxyError::serialization(format!("JSON deserialization failed: {}", e)))
    }
}

/// Binary serializer using bincode
#[derive(Default, Clone)]
pub struct BinarySerializer;

impl MessageSerializer for BinarySerializer {
    fn serialize<T>(&self, data: &T) -> Result<Vec<u8>>
    where
        T: Serialize,
    {
        bincode::serialize(data)
            .map_err(|e| GalaxyError::serialization(format!("Binary serialization failed: {}", e)))
    }

    fn deserialize<T>(&self, bytes: &[u8]) -> Result<T>
    where
        T: for<'de> Deserialize<'de>,
    {
        bincode::deserialize(bytes).map_err(|e| {
            GalaxyError::serialization(format!("Binary deserialization failed: {}", e))
        })
    }
}

/// Enum-based serializer that avoids trait object issues
#[derive(Clone)]
pub enum Serializer {
    Json(JsonSerializer),
    Binary(BinarySerializer),
}

impl Default for Serializer {
    fn default() -> Self {
        Self::Binary(BinarySerializer)
    }
}

impl MessageSerializer for Serializer {
    fn serialize<T>(&self, data: &T) -> Result<Vec<u8>>
    where
        T: Serialize,
    {
        match self {
            Self::Json(s) => s.serialize(data),
            Self::Binary(s) => s.serialize(data),
        }
    }

    fn deserialize<T>(&self, bytes: &[u8]) -> Result<T>
    where
        T: for<'de> Deserialize<'de>,
    {
        match self {
            Self::Json(s) => s.deserialize(bytes),
            Self::Binary(s) => s.deserialize(bytes),
        }
    }
}

const CHECKSUM_LEN: usize = 4;

impl Serializer {
    pub fn json() -> Self {
        Self::Json(JsonSerializer)
    }

    pub fn binary() -> Self {
        Self::Binary(BinarySerializer)
    }

    /// Encodes a message as a frame: payload followed by a big-endian CRC32
    /// of the payload.
    pub fn encode_frame(&self, message: &Message) -> Result<Vec<u8>> {
        let mut frame = self.serialize(message)?;
        let checksum = crc32fast::hash(&frame);
        frame.extend_from_slice(&checksum.to_be_bytes());
        Ok(frame)
    }

    /// Decodes a frame produced by [`Serializer::encode_frame`], rejecting
    /// truncated or corrupted input.
    pub fn decode_frame(&self, frame: &[u8]) -> Result<Message> {
        if frame.len() < CHECKSUM_LEN {
            return Err(GalaxyError::serialization(format!(
                "Frame of {} bytes is too short",
                frame.len()
            )));
        }
        let (payload, trailer) = frame.split_at(frame.len() - CHECKSUM_LEN);
        let expected = u32::from_be_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
        let actual = crc32fast::hash(payload);
        if expected != actual {
            warn!(
                "Dropping corrupted frame: checksum {:#x} != {:#x}",
                actual, expected
            );
            return Err(GalaxyError::serialization(format!(
                "Checksum mismatch: expected {:#x}, got {:#x}",
                expected, actual
            )));
        }
        self.deserialize(payload)
    }
}
