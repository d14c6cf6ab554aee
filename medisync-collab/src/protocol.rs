//! Wire protocol spoken over a peer channel.
//!
//! Every frame is a JSON text object tagged by `type`:
//! ```text
//! {"type":"chunk","messageId":"m_…","index":0,"total":3,"payload":"<base64>"}
//! {"type":"ack","messageId":"m_…"}
//! {"type":"meta","action":"pull"}
//! ```
//!
//! A change larger than one chunk is split by [`crate::chunk::segment`] and
//! travels as `total` chunk frames sharing one `messageId`. The receiver acks
//! the `messageId` once the whole payload has been reassembled and applied.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Meta action asking the remote peer to send its full document snapshot.
pub const PULL_ACTION: &str = "pull";

/// Identifier of a remote peer, as handed out by the signaling layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Process-unique identifier of one message transmission.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    /// Allocate a fresh id: `m_<unix millis>_<random hex>`.
    ///
    /// The time prefix keeps ids from different runs apart even if the
    /// random part were ever to repeat.
    pub fn generate() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        Self(format!("m_{millis}_{}", Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// One bounded fragment of a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chunk {
    pub message_id: MessageId,
    pub index: u32,
    pub total: u32,
    #[serde(with = "base64_payload")]
    pub payload: Vec<u8>,
}

impl Chunk {
    /// Reject chunks whose position cannot belong to any valid message.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.total == 0 {
            return Err(ProtocolError::ZeroTotal {
                message_id: self.message_id.clone(),
            });
        }
        if self.index >= self.total {
            return Err(ProtocolError::IndexOutOfRange {
                index: self.index,
                total: self.total,
            });
        }
        Ok(())
    }
}

/// Top-level frame exchanged between peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WireMessage {
    Chunk(Chunk),
    Ack {
        #[serde(rename = "messageId")]
        message_id: MessageId,
    },
    Meta {
        action: String,
    },
}

impl WireMessage {
    pub fn ack(message_id: MessageId) -> Self {
        Self::Ack { message_id }
    }

    pub fn pull() -> Self {
        Self::Meta {
            action: PULL_ACTION.to_string(),
        }
    }

    /// Serialize to the JSON text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Malformed)
    }

    /// Parse a JSON text frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(ProtocolError::Malformed)
    }
}

/// Protocol errors.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed wire message: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("chunk of message {message_id} declares zero total")]
    ZeroTotal { message_id: MessageId },
    #[error("chunk index {index} out of range for total {total}")]
    IndexOutOfRange { index: u32, total: u32 },
    #[error("peer handshake rejected: {0}")]
    Handshake(String),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error(transparent)]
    Transport(#[from] crate::transport::TransportError),
}

mod base64_payload {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
