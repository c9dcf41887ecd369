//! Cross-instance relay.
//!
//! When several server processes serve the same documents, every locally
//! merged update and awareness change is published on a shared channel and
//! merged by the other processes. Without a relay each process only
//! converges with its own sessions.
//!
//! A process that loads a document publishes a sync request carrying its
//! state vector; every process holding the document answers with the
//! update the requester lacks.
//!
//! ```text
//! process A ── publish ──► pub/sub ── subscribe ──► process B
//!     ▲                                                 │
//!     └──────────────── subscribe ◄── publish ──────────┘
//! ```

pub mod memory;
pub mod redis_pubsub;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use uuid::Uuid;

pub use self::memory::MemoryRelay;
pub use self::redis_pubsub::RedisRelay;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Relay connection failed: {0}")]
    Connect(String),
    #[error("Relay publish failed: {0}")]
    Publish(String),
    #[error("Relay encoding error: {0}")]
    Encoding(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelayKind {
    Update,
    Awareness,
    PeerLeft,
    /// Payload is the requester's state vector
    SyncRequest,
}

/// One relayed event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayEnvelope {
    /// Instance that published the event
    pub origin: Uuid,
    pub document: String,
    /// Session the event belongs to on the origin instance
    pub session: Uuid,
    pub kind: RelayKind,
    pub payload: Vec<u8>,
}

impl RelayEnvelope {
    pub fn encode(&self) -> Result<Vec<u8>, RelayError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| RelayError::Encoding(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, RelayError> {
        let (envelope, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| RelayError::Encoding(e.to_string()))?;
        Ok(envelope)
    }
}

#[async_trait]
pub trait Relay: Send + Sync {
    async fn publish(&self, envelope: &RelayEnvelope) -> Result<(), RelayError>;

    /// Envelopes published by every instance, this one included.
    fn subscribe(&self) -> broadcast::Receiver<RelayEnvelope>;
}

/// Connect the relay configured by `url`.
///
/// No url means single-process operation. A failed connection is logged and
/// also yields single-process operation.
pub async fn connect(url: Option<&str>) -> Option<Arc<dyn Relay>> {
    let Some(url) = url else {
        log::info!("No relay configured, running without cross-instance sync");
        return None;
    };
    match RedisRelay::connect(url).await {
        Ok(relay) => {
            log::info!("Relay connected");
            Some(Arc::new(relay))
        }
        Err(e) => {
            log::error!("Failed to connect to relay: {e}");
            None
        }
    }
}
