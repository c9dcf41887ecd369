//! # live-collab: Real-time collaboration server for shared documents
//!
//! Many editors attach to one shared CRDT document over WebSocket; every
//! accepted update is merged once and fanned out to the other editors, and
//! the merged state is stored through the content API.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   WebSocket    ┌──────────────┐  authenticate  ┌──────────────┐
//! │ CollabClient │ ◄────────────► │ server       │ ─────────────► │ auth         │
//! │ (per editor) │  Binary Proto  │ (gateway)    │                │ (content API)│
//! └──────────────┘                └──────┬───────┘                └──────────────┘
//!                                        │ Session
//!                                        ▼
//!                                 ┌──────────────┐  fetch/store   ┌──────────────┐
//!                                 │ Multiplexer  │ ─────────────► │ storage      │
//!                                 │ (Yrs Doc per │                └──────────────┘
//!                                 │  document)   │    publish     ┌──────────────┐
//!                                 └──────┬───────┘ ◄────────────► │ relay        │
//!                                        │                        │ (pub/sub)    │
//!                                 ┌──────┴───────┐                └──────────────┘
//!                                 │BroadcastGroup│
//!                                 │ (fan-out)    │
//!                                 └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Binary wire protocol (bincode-encoded SyncMessage)
//! - [`context`]: Document identity and upgrade request data
//! - [`auth`]: Cookie check and credential verification
//! - [`api`]: Content API client (users, memberships, page descriptions)
//! - [`storage`]: Fetch/store dispatch by document type
//! - [`broadcast`]: Per-document fan-out
//! - [`relay`]: Cross-instance pub/sub
//! - [`multiplexer`]: Shared documents, sessions, debounced stores
//! - [`server`]: HTTP/WebSocket gateway
//! - [`client`]: WebSocket client

pub mod api;
pub mod auth;
pub mod broadcast;
pub mod client;
pub mod context;
pub mod multiplexer;
pub mod protocol;
pub mod relay;
pub mod server;
pub mod storage;

// Re-exports for convenience
pub use api::{ApiError, ContentApi};
pub use auth::{AuthError, AuthRequest, ContentApiVerifier, CredentialVerifier};
pub use broadcast::{BroadcastGroup, BroadcastStats};
pub use client::{ClientError, ClientOptions, CollabClient, SyncEvent};
pub use context::{DocumentId, DocumentType, Identity, RequestContext};
pub use multiplexer::{
    DocumentState, Multiplexer, MultiplexerConfig, MultiplexerStats, Session, SessionError,
};
pub use protocol::{MessageType, ProtocolError, SyncMessage};
pub use relay::{MemoryRelay, Relay, RelayEnvelope, RelayError, RedisRelay};
pub use server::{CollabServer, ServerConfig, ServerError};
pub use storage::{DocumentBackend, DocumentStore, ProjectPageBackend, StoreError};
