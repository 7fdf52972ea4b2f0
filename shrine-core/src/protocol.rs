//! Shrine control messages and the pluggable payload codec.

use serde::{Deserialize, Serialize};

/// Current protocol version. Exchanged in the version handshake.
pub const PROTOCOL_VERSION: u8 = 1;

/// Control messages carried inside MESSAGE frames. Raw file bytes never travel here;
/// they follow a STREAM tag on the same connection (see wire module).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlMessage {
    /// Announce that exactly `size` raw bytes for `key` follow as the next stream on this connection.
    StoreAnnounce { key: String, size: u64 },
    /// Ask peers holding `key` to replicate it back to the sender.
    GetRequest { key: String },
    /// Receiver has recorded the announce for `key` and will drain the next stream.
    StoreAck { key: String },
}

impl ControlMessage {
    pub fn key(&self) -> &str {
        match self {
            ControlMessage::StoreAnnounce { key, .. }
            | ControlMessage::GetRequest { key }
            | ControlMessage::StoreAck { key } => key,
        }
    }
}

/// Turns control messages into bytes and back. Both ends of a link must agree on the codec.
pub trait MessageCodec: Send + Sync {
    fn encode(&self, msg: &ControlMessage) -> Result<Vec<u8>, CodecError>;
    fn decode(&self, bytes: &[u8]) -> Result<ControlMessage, CodecError>;
}

/// Default codec: bincode.
#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeCodec;

impl MessageCodec for BincodeCodec {
    fn encode(&self, msg: &ControlMessage) -> Result<Vec<u8>, CodecError> {
        bincode::serialize(msg).map_err(CodecError::Bincode)
    }

    fn decode(&self, bytes: &[u8]) -> Result<ControlMessage, CodecError> {
        bincode::deserialize(bytes).map_err(CodecError::Bincode)
    }
}

/// Human-readable codec, handy when sniffing traffic.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl MessageCodec for JsonCodec {
    fn encode(&self, msg: &ControlMessage) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(msg).map_err(CodecError::Json)
    }

    fn decode(&self, bytes: &[u8]) -> Result<ControlMessage, CodecError> {
        serde_json::from_slice(bytes).map_err(CodecError::Json)
    }
}

/// Error turning a control message into bytes or back.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("bincode: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}
