//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use live_collab::auth::{AuthError, AuthRequest, CredentialVerifier};
use live_collab::context::{DocumentId, Identity, RequestContext};
use live_collab::multiplexer::{Multiplexer, MultiplexerConfig, Session};
use live_collab::protocol::{MessageType, SyncMessage};
use live_collab::relay::Relay;
use live_collab::storage::{DocumentBackend, DocumentStore, StoreError};
use tokio::time::timeout;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, GetString, ReadTxn, StateVector, Text, Transact, Update, WriteTxn};

// ─── Storage ─────────────────────────────────────────────────────────────────

/// In-memory backend with call counters and failure switches.
#[derive(Default)]
pub struct MemoryBackend {
    documents: Mutex<HashMap<String, Vec<u8>>>,
    pub fetches: AtomicUsize,
    pub stores: AtomicUsize,
    pub fail_fetch: AtomicBool,
    pub fail_store: AtomicBool,
    pub fetch_delay: Option<Duration>,
}

impl MemoryBackend {
    pub fn with_fetch_delay(delay: Duration) -> Self {
        Self {
            fetch_delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn insert(&self, id: &str, state: Vec<u8>) {
        self.documents
            .lock()
            .unwrap()
            .insert(id.to_string(), state);
    }

    pub fn get(&self, id: &str) -> Option<Vec<u8>> {
        self.documents.lock().unwrap().get(id).cloned()
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn stores(&self) -> usize {
        self.stores.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DocumentBackend for MemoryBackend {
    async fn fetch(
        &self,
        id: &DocumentId,
        _context: &RequestContext,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.fetch_delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_fetch.load(Ordering::SeqCst) {
            return Err(StoreError::MissingParameter("workspaceSlug"));
        }
        Ok(self.get(id.as_str()))
    }

    async fn store(
        &self,
        id: &DocumentId,
        _context: &RequestContext,
        state: &[u8],
    ) -> Result<(), StoreError> {
        self.stores.fetch_add(1, Ordering::SeqCst);
        if self.fail_store.load(Ordering::SeqCst) {
            return Err(StoreError::MissingParameter("projectId"));
        }
        self.insert(id.as_str(), state.to_vec());
        Ok(())
    }
}

// ─── Authentication ──────────────────────────────────────────────────────────

/// Accepts every token as the user id; some users are read-only, some denied.
#[derive(Default)]
pub struct TestVerifier {
    pub calls: AtomicUsize,
    pub read_only: HashSet<String>,
    pub denied: HashSet<String>,
}

impl TestVerifier {
    pub fn with_read_only(user: &str) -> Self {
        Self {
            read_only: [user.to_string()].into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn with_denied(user: &str) -> Self {
        Self {
            denied: [user.to_string()].into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CredentialVerifier for TestVerifier {
    async fn verify(&self, request: AuthRequest<'_>) -> Result<Identity, AuthError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.denied.contains(request.token) {
            return Err(AuthError::Rejected("denied".to_string()));
        }
        let identity = Identity::new(request.token);
        Ok(if self.read_only.contains(request.token) {
            identity.read_only()
        } else {
            identity
        })
    }
}

// ─── Multiplexer ─────────────────────────────────────────────────────────────

/// Debounce long enough that only detaches store during a test.
pub fn quiet_config() -> MultiplexerConfig {
    MultiplexerConfig {
        debounce: Duration::from_secs(60),
        max_debounce: Duration::from_secs(120),
        ..MultiplexerConfig::default()
    }
}

pub fn multiplexer(
    config: MultiplexerConfig,
    backend: Arc<MemoryBackend>,
    verifier: Arc<TestVerifier>,
    relay: Option<Arc<dyn Relay>>,
) -> Multiplexer {
    let store = Arc::new(DocumentStore::new(backend.clone(), backend));
    Multiplexer::new(config, verifier, store, relay)
}

/// Upgrade request data for a project page.
pub fn page_context(document: &str) -> RequestContext {
    RequestContext::new(
        [("Cookie", "session=abc")],
        [
            ("documentId", document),
            ("documentType", "project_page"),
            ("workspaceSlug", "acme"),
            ("projectId", "p1"),
        ],
    )
}

pub async fn join(multiplexer: &Multiplexer, document: &str, user: &str) -> Session {
    multiplexer
        .connect(DocumentId::new(document), page_context(document), user)
        .await
        .expect("session should authenticate")
}

/// Next frame for `session`, decoded; `None` if nothing arrives in time.
pub async fn next_message(session: &mut Session, wait: Duration) -> Option<SyncMessage> {
    let bytes = timeout(wait, session.next_frame()).await.ok()??;
    SyncMessage::decode(&bytes).ok()
}

/// Next frame of `msg_type`, skipping others.
pub async fn next_of_type(
    session: &mut Session,
    msg_type: MessageType,
    wait: Duration,
) -> Option<SyncMessage> {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        let msg = next_message(session, remaining).await?;
        if msg.msg_type == msg_type {
            return Some(msg);
        }
    }
}

// ─── Yrs helpers ─────────────────────────────────────────────────────────────

/// Append `insert` to the `content` text of `doc`, returning the delta.
pub fn append_text(doc: &Doc, insert: &str) -> Vec<u8> {
    let sv = doc.transact().state_vector();
    {
        let mut txn = doc.transact_mut();
        let text = txn.get_or_insert_text("content");
        let len = text.get_string(&txn).len() as u32;
        text.insert(&mut txn, len, insert);
    }
    let txn = doc.transact();
    txn.encode_state_as_update_v1(&sv)
}

/// A full state holding `content`.
pub fn state_with_text(content: &str) -> Vec<u8> {
    append_text(&Doc::new(), content)
}

/// Text of a v1-encoded document state.
pub fn text_of(state: &[u8]) -> String {
    let doc = Doc::new();
    let mut txn = doc.transact_mut();
    let update = Update::decode_v1(state).expect("valid update");
    txn.apply_update(update).expect("applicable update");
    let text = txn.get_or_insert_text("content");
    text.get_string(&txn)
}

pub fn empty_state_vector() -> Vec<u8> {
    StateVector::default().encode_v1()
}
