//! Binary protocol spoken on the `/collaboration` socket.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬────────────┬──────────┐
//! │ msg_type │ session_id │ payload  │
//! │ 1 byte   │ 16 bytes   │ variable │
//! └──────────┴────────────┴──────────┘
//! ```
//!
//! Update and state-vector payloads are Yjs v1 encodings produced by `yrs`
//! (or any compatible client). Awareness payloads are opaque to the server.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Message types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Identity token, first frame sent by the client
    Auth = 1,
    /// Authentication accepted
    Authenticated = 2,
    /// Authentication rejected; the socket is closed afterwards
    PermissionDenied = 3,
    /// Yrs state vector
    SyncStep1 = 4,
    /// Yrs state diff response
    SyncStep2 = 5,
    /// Incremental CRDT update
    Update = 6,
    /// Opaque awareness (cursor/selection) payload
    Awareness = 7,
    /// A session detached from the document
    PeerLeft = 8,
    /// Heartbeat ping
    Ping = 9,
    /// Heartbeat pong
    Pong = 10,
}

/// Top-level protocol message.
///
/// `session_id` names the session a frame originates from; frames authored
/// by the server itself carry `Uuid::nil()`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub session_id: Uuid,
    pub payload: Vec<u8>,
}

impl SyncMessage {
    fn new(msg_type: MessageType, session_id: Uuid, payload: Vec<u8>) -> Self {
        Self {
            msg_type,
            session_id,
            payload,
        }
    }

    /// Create the authentication frame carrying the identity token.
    pub fn auth(token: &str) -> Self {
        Self::new(MessageType::Auth, Uuid::nil(), token.as_bytes().to_vec())
    }

    /// Create the acceptance frame for an authenticated session.
    pub fn authenticated(session_id: Uuid, read_only: bool) -> Self {
        Self::new(MessageType::Authenticated, session_id, vec![read_only as u8])
    }

    /// Create a rejection frame.
    pub fn permission_denied(reason: &str) -> Self {
        Self::new(
            MessageType::PermissionDenied,
            Uuid::nil(),
            reason.as_bytes().to_vec(),
        )
    }

    /// Create a sync step 1 (state vector request).
    pub fn sync_step1(session_id: Uuid, state_vector: Vec<u8>) -> Self {
        Self::new(MessageType::SyncStep1, session_id, state_vector)
    }

    /// Create a sync step 2 (state diff response).
    pub fn sync_step2(session_id: Uuid, state_diff: Vec<u8>) -> Self {
        Self::new(MessageType::SyncStep2, session_id, state_diff)
    }

    /// Create an incremental update message.
    pub fn update(session_id: Uuid, update: Vec<u8>) -> Self {
        Self::new(MessageType::Update, session_id, update)
    }

    /// Create an awareness update message.
    pub fn awareness(session_id: Uuid, state: Vec<u8>) -> Self {
        Self::new(MessageType::Awareness, session_id, state)
    }

    /// Create a peer left notification.
    pub fn peer_left(session_id: Uuid) -> Self {
        Self::new(MessageType::PeerLeft, session_id, Vec::new())
    }

    pub fn ping(session_id: Uuid) -> Self {
        Self::new(MessageType::Ping, session_id, Vec::new())
    }

    pub fn pong(session_id: Uuid) -> Self {
        Self::new(MessageType::Pong, session_id, Vec::new())
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }

    /// Parse the token of an `Auth` frame.
    pub fn token(&self) -> Result<String, ProtocolError> {
        self.text_payload(MessageType::Auth)
    }

    /// Parse the reason of a `PermissionDenied` frame.
    pub fn reason(&self) -> Result<String, ProtocolError> {
        self.text_payload(MessageType::PermissionDenied)
    }

    /// Whether an `Authenticated` frame grants read-only access.
    pub fn read_only(&self) -> Result<bool, ProtocolError> {
        if self.msg_type != MessageType::Authenticated {
            return Err(ProtocolError::InvalidMessageType);
        }
        Ok(self.payload.first().copied().unwrap_or(0) != 0)
    }

    fn text_payload(&self, expected: MessageType) -> Result<String, ProtocolError> {
        if self.msg_type != expected {
            return Err(ProtocolError::InvalidMessageType);
        }
        String::from_utf8(self.payload.clone())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }
}

/// Protocol errors.
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("Invalid message type")]
    InvalidMessageType,
}
