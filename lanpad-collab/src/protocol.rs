//! Wire protocol for LAN peer traffic.
//!
//! Every datagram carries one [`Envelope`]: the sender's client id plus a
//! [`WireMessage`]. Two framings exist:
//!
//! ```text
//! Binary (bincode, default)
//! ┌────────────┬─────────┬──────────────────────┐
//! │ sender     │ variant │ fields               │
//! │ 16 bytes   │ varint  │ variable             │
//! └────────────┴─────────┴──────────────────────┘
//!
//! Text (JSON)
//! {"sender":"…","message":{"CRDT_INSERT":{"id":…,"ch":"a","left_origin":null}}}
//! ```
//!
//! Binary payloads (snapshots, chunks) become base64 strings under the text
//! framing; under bincode they stay raw bytes.

use std::net::SocketAddr;

use lanpad_core::{ClientId, Fingerprint, Identifier, Operation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Upper bound for a single decoded datagram.
pub const MAX_MESSAGE_BYTES: usize = 1 << 20;

/// How envelopes are turned into datagram bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Framing {
    #[default]
    Binary,
    Text,
}

/// One fragment of an oversized snapshot transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub transfer_id: Uuid,
    pub index: u32,
    pub total: u32,
    #[serde(with = "payload_bytes")]
    pub payload: Vec<u8>,
}

/// Closed set of peer messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WireMessage {
    /// A host advertises a shareable session.
    Invite { name: String, addr: SocketAddr },
    /// A joiner accepts an invite.
    InviteAccept { name: String, addr: SocketAddr },
    /// Presence broadcast after joining.
    PeerAnnounce { name: String, addr: SocketAddr },
    /// Clean departure.
    PeerLeave { addr: SocketAddr },
    CrdtInsert {
        id: Identifier,
        ch: char,
        left_origin: Option<Identifier>,
    },
    CrdtDelete { id: Identifier },
    /// Ask the receiver for its full state.
    RequestSnapshot { addr: SocketAddr },
    /// Compressed full state that fits in one datagram.
    Snapshot {
        transfer_id: Uuid,
        #[serde(with = "payload_bytes")]
        payload: Vec<u8>,
    },
    Chunk(Chunk),
    /// Periodic consistency probe.
    StateCheck { hash: Fingerprint, count: u64 },
}

impl WireMessage {
    /// Kind tag for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            WireMessage::Invite { .. } => "INVITE",
            WireMessage::InviteAccept { .. } => "INVITE_ACCEPT",
            WireMessage::PeerAnnounce { .. } => "PEER_ANNOUNCE",
            WireMessage::PeerLeave { .. } => "PEER_LEAVE",
            WireMessage::CrdtInsert { .. } => "CRDT_INSERT",
            WireMessage::CrdtDelete { .. } => "CRDT_DELETE",
            WireMessage::RequestSnapshot { .. } => "REQUEST_SNAPSHOT",
            WireMessage::Snapshot { .. } => "SNAPSHOT",
            WireMessage::Chunk(_) => "CHUNK",
            WireMessage::StateCheck { .. } => "STATE_CHECK",
        }
    }

    /// The CRDT operation carried by this message, if any.
    pub fn into_operation(self) -> Option<Operation> {
        match self {
            WireMessage::CrdtInsert { id, ch, left_origin } => {
                Some(Operation::Insert { id, ch, left_origin })
            }
            WireMessage::CrdtDelete { id } => Some(Operation::Delete { id }),
            _ => None,
        }
    }

    /// Serialize the bare message (no envelope).
    pub fn encode(&self, framing: Framing) -> Result<Vec<u8>, ProtocolError> {
        encode_with(self, framing)
    }

    /// Deserialize a bare message (no envelope).
    pub fn decode(bytes: &[u8], framing: Framing) -> Result<Self, ProtocolError> {
        decode_with(bytes, framing)
    }
}

impl From<Operation> for WireMessage {
    fn from(op: Operation) -> Self {
        match op {
            Operation::Insert { id, ch, left_origin } => {
                WireMessage::CrdtInsert { id, ch, left_origin }
            }
            Operation::Delete { id } => WireMessage::CrdtDelete { id },
        }
    }
}

/// Top-level datagram.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Lets a replica drop its own broadcasts when the OS loops them back.
    pub sender: ClientId,
    pub message: WireMessage,
}

impl Envelope {
    pub fn new(sender: ClientId, message: WireMessage) -> Self {
        Self { sender, message }
    }

    /// Serialize to datagram bytes.
    pub fn encode(&self, framing: Framing) -> Result<Vec<u8>, ProtocolError> {
        encode_with(self, framing)
    }

    /// Deserialize from datagram bytes.
    pub fn decode(bytes: &[u8], framing: Framing) -> Result<Self, ProtocolError> {
        decode_with(bytes, framing)
    }
}

fn wire_config() -> impl bincode::config::Config {
    bincode::config::standard().with_limit::<MAX_MESSAGE_BYTES>()
}

fn encode_with<T: Serialize>(value: &T, framing: Framing) -> Result<Vec<u8>, ProtocolError> {
    match framing {
        Framing::Binary => bincode::serde::encode_to_vec(value, wire_config())
            .map_err(|e| ProtocolError::Serialization(e.to_string())),
        Framing::Text => {
            serde_json::to_vec(value).map_err(|e| ProtocolError::Serialization(e.to_string()))
        }
    }
}

fn decode_with<T: serde::de::DeserializeOwned>(
    bytes: &[u8],
    framing: Framing,
) -> Result<T, ProtocolError> {
    if bytes.len() > MAX_MESSAGE_BYTES {
        return Err(ProtocolError::TooLarge {
            size: bytes.len(),
            limit: MAX_MESSAGE_BYTES,
        });
    }
    match framing {
        Framing::Binary => {
            let (value, _) = bincode::serde::decode_from_slice(bytes, wire_config())
                .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
            Ok(value)
        }
        Framing::Text => serde_json::from_slice(bytes)
            .map_err(|e| ProtocolError::Deserialization(e.to_string())),
    }
}

/// Raw bytes in binary framings, base64 text in human-readable ones.
mod payload_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&STANDARD.encode(bytes))
        } else {
            bytes.serialize(serializer)
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        if deserializer.is_human_readable() {
            let text = String::deserialize(deserializer)?;
            STANDARD.decode(text.as_bytes()).map_err(D::Error::custom)
        } else {
            Vec::<u8>::deserialize(deserializer)
        }
    }
}

/// Protocol errors. All of them are dropped-and-logged by the session.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Decompression failed: {0}")]
    Decompression(String),
    #[error("Payload of {size} bytes exceeds limit of {limit}")]
    TooLarge { size: usize, limit: usize },
    #[error("Invalid chunk: {0}")]
    InvalidChunk(String),
    #[error("Invalid message type: expected {expected}, got {got}")]
    InvalidMessageType {
        expected: &'static str,
        got: &'static str,
    },
}
