//! Session multiplexer: one shared document per identity, many sessions.
//!
//! Architecture:
//! ```text
//! Session A ──┐
//!             ├── Room (DocumentId) ── Yrs Doc ── BroadcastGroup ──► other sessions
//! Session B ──┘         │                  │
//!                       │                  └── Relay ──► other instances
//!                       └── DocumentStore (fetch on load, debounced store)
//! ```
//!
//! Per document: `Unloaded → Loading → Loaded ⇄ Flushing → (evicted) Unloaded`.
//!
//! The registry maps each document to a shared load future. The first attach
//! creates it and every concurrent attach awaits the same future, so a cold
//! document is fetched exactly once. The future stays in the registry after
//! it resolves and doubles as the handle of the resident room.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Mutex;
use tokio::time::Instant;
use uuid::Uuid;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, ReadTxn, StateVector, Transact, Update};

use crate::auth::{self, AuthError, CredentialVerifier};
use crate::broadcast::{BroadcastGroup, FrameError, FrameReceiver};
use crate::context::{DocumentId, Identity, RequestContext};
use crate::protocol::SyncMessage;
use crate::relay::{Relay, RelayEnvelope, RelayKind};
use crate::storage::DocumentStore;

pub type SessionId = Uuid;

/// Multiplexer configuration.
#[derive(Debug, Clone)]
pub struct MultiplexerConfig {
    /// Quiet period after the last change before a document is stored
    pub debounce: Duration,
    /// Upper bound on how long a change may stay unstored
    pub max_debounce: Duration,
    /// Frames buffered per session before it lags
    pub broadcast_capacity: usize,
    /// Longest wait for a document fetch before loading it empty
    pub fetch_timeout: Duration,
    /// How long an awareness entry relayed from another instance is
    /// replayed to newcomers without being refreshed
    pub remote_awareness_ttl: Duration,
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_secs(2),
            max_debounce: Duration::from_secs(10),
            broadcast_capacity: 256,
            fetch_timeout: Duration::from_secs(10),
            remote_awareness_ttl: Duration::from_secs(30),
        }
    }
}

/// Lifecycle state of one document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentState {
    /// Not resident (never loaded, or evicted)
    Unloaded,
    /// Fetch in flight
    Loading,
    Loaded,
    /// Loaded, with a store in flight
    Flushing,
}

/// Multiplexer statistics.
#[derive(Debug, Clone, Default)]
pub struct MultiplexerStats {
    pub total_connections: u64,
    pub rejected_connections: u64,
    pub active_sessions: u64,
    pub updates_merged: u64,
    pub resident_documents: usize,
}

#[derive(Default)]
struct AtomicStats {
    total_connections: AtomicU64,
    rejected_connections: AtomicU64,
    active_sessions: AtomicU64,
    updates_merged: AtomicU64,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("Session is read-only")]
    ReadOnly,
    #[error("Invalid update: {0}")]
    InvalidUpdate(String),
    #[error("Invalid state vector: {0}")]
    InvalidStateVector(String),
}

type LoadFuture = Shared<BoxFuture<'static, Arc<Room>>>;

/// A resident document.
struct Room {
    id: DocumentId,
    state: Mutex<RoomState>,
    broadcast: BroadcastGroup,
    /// Serializes stores of this document
    flush_lock: Mutex<()>,
    flushing: AtomicBool,
}

struct RoomState {
    /// Authoritative document; only mutated while the room lock is held
    doc: Doc,
    sessions: HashMap<SessionId, Identity>,
    /// Latest awareness payload per session, local and remote
    awareness: HashMap<SessionId, AwarenessEntry>,
    dirty: bool,
    first_unflushed: Option<Instant>,
    last_change: Option<Instant>,
    flush_scheduled: bool,
    /// Context of the most recent local change, used to store it
    store_context: Option<RequestContext>,
    evicted: bool,
}

struct AwarenessEntry {
    payload: Vec<u8>,
    /// Instance hosting the session, `None` for local sessions
    origin: Option<Uuid>,
    updated: Instant,
}

impl AwarenessEntry {
    fn local(payload: Vec<u8>) -> Self {
        Self {
            payload,
            origin: None,
            updated: Instant::now(),
        }
    }

    fn remote(origin: Uuid, payload: Vec<u8>) -> Self {
        Self {
            payload,
            origin: Some(origin),
            updated: Instant::now(),
        }
    }

    fn is_stale(&self, ttl: Duration) -> bool {
        self.origin.is_some() && self.updated.elapsed() >= ttl
    }
}

impl Room {
    fn load(id: DocumentId, persisted: Option<Vec<u8>>, capacity: usize) -> Self {
        let doc = Doc::new();
        if let Some(bytes) = persisted {
            match Update::decode_v1(&bytes) {
                Ok(update) => {
                    let mut txn = doc.transact_mut();
                    if let Err(e) = txn.apply_update(update) {
                        log::error!("Failed to apply persisted state of document {id}: {e}");
                    }
                }
                Err(e) => log::error!("Persisted state of document {id} is not a valid update: {e}"),
            }
        }

        Self {
            id,
            state: Mutex::new(RoomState {
                doc,
                sessions: HashMap::new(),
                awareness: HashMap::new(),
                dirty: false,
                first_unflushed: None,
                last_change: None,
                flush_scheduled: false,
                store_context: None,
                evicted: false,
            }),
            broadcast: BroadcastGroup::new(capacity),
            flush_lock: Mutex::new(()),
            flushing: AtomicBool::new(false),
        }
    }

    fn send(&self, origin: Option<SessionId>, msg: &SyncMessage) {
        if let Err(e) = self.broadcast.send(origin, msg) {
            log::error!("Failed to encode frame for document {}: {e}", self.id);
        }
    }
}

impl RoomState {
    fn encode_state(&self) -> Vec<u8> {
        self.doc
            .transact()
            .encode_state_as_update_v1(&StateVector::default())
    }

    fn state_vector(&self) -> Vec<u8> {
        self.doc.transact().state_vector().encode_v1()
    }

    /// Remove remote awareness entries, returning their sessions.
    fn drop_remote_awareness(&mut self) -> Vec<SessionId> {
        let remote: Vec<SessionId> = self
            .awareness
            .iter()
            .filter(|(_, entry)| entry.origin.is_some())
            .map(|(session, _)| *session)
            .collect();
        for session in &remote {
            self.awareness.remove(session);
        }
        remote
    }

    fn mark_dirty(&mut self, context: &RequestContext) {
        let now = Instant::now();
        self.dirty = true;
        self.first_unflushed.get_or_insert(now);
        self.last_change = Some(now);
        self.store_context = Some(context.clone());
    }

    /// When the pending changes must be stored, `None` if nothing is pending.
    fn flush_deadline(&self, debounce: Duration, max_debounce: Duration) -> Option<Instant> {
        if !self.dirty {
            return None;
        }
        let quiet = self.last_change? + debounce;
        let cap = self.first_unflushed? + max_debounce;
        Some(quiet.min(cap))
    }
}

struct Inner {
    config: MultiplexerConfig,
    /// Tags relay envelopes published by this instance
    instance_id: Uuid,
    verifier: Arc<dyn CredentialVerifier>,
    store: Arc<DocumentStore>,
    relay: Option<Arc<dyn Relay>>,
    documents: StdMutex<HashMap<DocumentId, LoadFuture>>,
    stats: AtomicStats,
}

/// Brokers sessions onto shared documents. Cheap to clone.
#[derive(Clone)]
pub struct Multiplexer {
    inner: Arc<Inner>,
}

impl Multiplexer {
    /// Must be called inside a tokio runtime when a relay is given: the relay
    /// subscription runs as a background task.
    pub fn new(
        config: MultiplexerConfig,
        verifier: Arc<dyn CredentialVerifier>,
        store: Arc<DocumentStore>,
        relay: Option<Arc<dyn Relay>>,
    ) -> Self {
        let relay_rx = relay.as_ref().map(|r| r.subscribe());
        let inner = Arc::new(Inner {
            config,
            instance_id: Uuid::new_v4(),
            verifier,
            store,
            relay,
            documents: StdMutex::new(HashMap::new()),
            stats: AtomicStats::default(),
        });
        if let Some(rx) = relay_rx {
            tokio::spawn(relay_loop(Arc::downgrade(&inner), rx));
        }
        Self { inner }
    }

    pub fn instance_id(&self) -> Uuid {
        self.inner.instance_id
    }

    pub fn has_relay(&self) -> bool {
        self.inner.relay.is_some()
    }

    /// Authenticate a connection and attach it to `document`.
    ///
    /// Authentication runs exactly once; a rejected connection is never
    /// attached.
    pub async fn connect(
        &self,
        document: DocumentId,
        context: RequestContext,
        token: &str,
    ) -> Result<Session, AuthError> {
        let session_id = Uuid::new_v4();
        self.inner
            .stats
            .total_connections
            .fetch_add(1, Ordering::Relaxed);

        let identity =
            match auth::authenticate(self.inner.verifier.as_ref(), session_id, &context, token)
                .await
            {
                Ok(identity) => identity,
                Err(e) => {
                    self.inner
                        .stats
                        .rejected_connections
                        .fetch_add(1, Ordering::Relaxed);
                    return Err(e);
                }
            };

        Ok(self.attach(session_id, document, identity, context).await)
    }

    pub fn document_state(&self, id: &DocumentId) -> DocumentState {
        let documents = self.documents();
        match documents.get(id).map(|load| load.peek().cloned()) {
            None => DocumentState::Unloaded,
            Some(None) => DocumentState::Loading,
            Some(Some(room)) if room.flushing.load(Ordering::SeqCst) => DocumentState::Flushing,
            Some(Some(_)) => DocumentState::Loaded,
        }
    }

    /// Full state of a resident document, encoded as a single update.
    pub async fn document_snapshot(&self, id: &DocumentId) -> Option<Vec<u8>> {
        let room = self.resident(id)?;
        let state = room.state.lock().await;
        Some(state.encode_state())
    }

    pub async fn session_count(&self, id: &DocumentId) -> usize {
        match self.resident(id) {
            Some(room) => room.state.lock().await.sessions.len(),
            None => 0,
        }
    }

    pub fn stats(&self) -> MultiplexerStats {
        let stats = &self.inner.stats;
        MultiplexerStats {
            total_connections: stats.total_connections.load(Ordering::Relaxed),
            rejected_connections: stats.rejected_connections.load(Ordering::Relaxed),
            active_sessions: stats.active_sessions.load(Ordering::Relaxed),
            updates_merged: stats.updates_merged.load(Ordering::Relaxed),
            resident_documents: self.documents().len(),
        }
    }

    fn documents(&self) -> MutexGuard<'_, HashMap<DocumentId, LoadFuture>> {
        self.inner
            .documents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn resident(&self, id: &DocumentId) -> Option<Arc<Room>> {
        self.documents()
            .get(id)
            .and_then(|load| load.peek().cloned())
    }

    /// The load future of `document`, created on first use.
    fn load(&self, document: &DocumentId, context: &RequestContext) -> LoadFuture {
        let mut documents = self.documents();
        if let Some(load) = documents.get(document) {
            return load.clone();
        }

        log::info!("Loading document {document}");
        let store = self.inner.store.clone();
        let id = document.clone();
        let context = context.clone();
        let capacity = self.inner.config.broadcast_capacity;
        let fetch_timeout = self.inner.config.fetch_timeout;
        let relay = self.inner.relay.clone();
        let instance_id = self.inner.instance_id;
        let load = async move {
            let fetch = tokio::time::timeout(fetch_timeout, store.fetch(&id, &context));
            let persisted = match fetch.await {
                Ok(persisted) => persisted,
                Err(_) => {
                    log::error!("Fetching document {id} timed out after {fetch_timeout:?}");
                    None
                }
            };
            log::info!(
                "Loaded document {id} ({})",
                if persisted.is_some() { "persisted" } else { "empty" }
            );
            let room = Arc::new(Room::load(id, persisted, capacity));

            // Ask resident peers for the edits they hold but have not stored
            if let Some(relay) = relay {
                let state_vector = room.state.lock().await.state_vector();
                let request = RelayEnvelope {
                    origin: instance_id,
                    document: room.id.as_str().to_string(),
                    session: Uuid::nil(),
                    kind: RelayKind::SyncRequest,
                    payload: state_vector,
                };
                publish_envelope(relay.as_ref(), &request).await;
            }
            room
        }
        .boxed()
        .shared();

        documents.insert(document.clone(), load.clone());
        load
    }

    async fn attach(
        &self,
        session_id: SessionId,
        document: DocumentId,
        identity: Identity,
        context: RequestContext,
    ) -> Session {
        loop {
            let load = self.load(&document, &context);
            let mut abandoned = AbandonedLoad {
                multiplexer: self.clone(),
                load: Some(load.clone()),
            };
            let room = load.await;

            let mut state = room.state.lock().await;
            if state.evicted {
                // Evicted between load and attach; load it again
                abandoned.load = None;
                continue;
            }
            state.sessions.insert(session_id, identity.clone());
            abandoned.load = None;

            // Subscribe under the room lock so no frame slips between the
            // awareness snapshot and the subscription.
            let frames = room.broadcast.subscribe(session_id);
            let ttl = self.inner.config.remote_awareness_ttl;
            state.awareness.retain(|_, entry| !entry.is_stale(ttl));
            let pending = state
                .awareness
                .iter()
                .filter_map(|(peer, entry)| {
                    SyncMessage::awareness(*peer, entry.payload.clone()).encode().ok()
                })
                .map(Arc::new)
                .collect();
            let attached = state.sessions.len();
            drop(state);

            self.inner
                .stats
                .active_sessions
                .fetch_add(1, Ordering::Relaxed);
            log::info!(
                "Session {session_id} ({}) attached to document {document} ({attached} attached)",
                identity.user_id
            );

            return Session {
                id: session_id,
                identity,
                context,
                room,
                frames,
                pending,
                resync: false,
                multiplexer: self.clone(),
                closed: false,
            };
        }
    }

    async fn detach(&self, room: &Arc<Room>, session_id: SessionId) {
        let remaining = {
            let mut state = room.state.lock().await;
            state.sessions.remove(&session_id);
            state.awareness.remove(&session_id);
            room.send(Some(session_id), &SyncMessage::peer_left(session_id));
            state.sessions.len()
        };
        self.inner
            .stats
            .active_sessions
            .fetch_sub(1, Ordering::Relaxed);
        log::info!(
            "Session {session_id} detached from document {} ({remaining} attached)",
            room.id
        );
        self.publish(room, session_id, RelayKind::PeerLeft, &[]).await;

        if remaining == 0 {
            self.flush(room).await;
            self.evict_if_idle(room).await;
        }
    }

    /// Release a room nobody is attached to.
    async fn evict_if_idle(&self, room: &Arc<Room>) {
        let mut state = room.state.lock().await;
        if state.evicted || !state.sessions.is_empty() {
            return;
        }
        state.evicted = true;

        let mut documents = self.documents();
        let current = documents
            .get(&room.id)
            .and_then(|load| load.peek())
            .is_some_and(|resident| Arc::ptr_eq(resident, room));
        if current {
            documents.remove(&room.id);
        }
        log::info!("Unloaded document {}", room.id);
    }

    async fn apply_update(
        &self,
        room: &Arc<Room>,
        session_id: SessionId,
        identity: &Identity,
        context: &RequestContext,
        update: &[u8],
    ) -> Result<(), SessionError> {
        if identity.read_only {
            return Err(SessionError::ReadOnly);
        }

        let schedule = {
            let mut state = room.state.lock().await;
            {
                // `Update` is not Send; decode and merge without an await between
                let decoded = Update::decode_v1(update)
                    .map_err(|e| SessionError::InvalidUpdate(e.to_string()))?;
                let mut txn = state.doc.transact_mut();
                txn.apply_update(decoded)
                    .map_err(|e| SessionError::InvalidUpdate(e.to_string()))?;
            }
            state.mark_dirty(context);
            // Broadcast under the lock: frame order equals merge order
            room.send(
                Some(session_id),
                &SyncMessage::update(session_id, update.to_vec()),
            );
            !std::mem::replace(&mut state.flush_scheduled, true)
        };

        self.inner
            .stats
            .updates_merged
            .fetch_add(1, Ordering::Relaxed);
        log::trace!("Document {} changed by session {session_id}", room.id);

        if schedule {
            self.schedule_flush(room.clone());
        }
        self.publish(room, session_id, RelayKind::Update, update)
            .await;
        Ok(())
    }

    async fn update_awareness(&self, room: &Arc<Room>, session_id: SessionId, payload: Vec<u8>) {
        {
            let mut state = room.state.lock().await;
            state
                .awareness
                .insert(session_id, AwarenessEntry::local(payload.clone()));
            room.send(
                Some(session_id),
                &SyncMessage::awareness(session_id, payload.clone()),
            );
        }
        self.publish(room, session_id, RelayKind::Awareness, &payload)
            .await;
    }

    fn schedule_flush(&self, room: Arc<Room>) {
        let multiplexer = self.clone();
        let debounce = self.inner.config.debounce;
        let max_debounce = self.inner.config.max_debounce;

        tokio::spawn(async move {
            loop {
                let deadline = {
                    let mut state = room.state.lock().await;
                    match state.flush_deadline(debounce, max_debounce) {
                        Some(deadline) => deadline,
                        None => {
                            state.flush_scheduled = false;
                            return;
                        }
                    }
                };
                if deadline <= Instant::now() {
                    break;
                }
                tokio::time::sleep_until(deadline).await;
            }
            room.state.lock().await.flush_scheduled = false;
            multiplexer.flush(&room).await;
        });
    }

    /// Store the document if it has unstored changes.
    async fn flush(&self, room: &Room) {
        let _serialized = room.flush_lock.lock().await;
        let (state, context) = {
            let mut state = room.state.lock().await;
            if !state.dirty {
                return;
            }
            let Some(context) = state.store_context.clone() else {
                return;
            };
            state.dirty = false;
            state.first_unflushed = None;
            state.last_change = None;
            (state.encode_state(), context)
        };

        room.flushing.store(true, Ordering::SeqCst);
        self.inner.store.store(&room.id, &context, &state).await;
        room.flushing.store(false, Ordering::SeqCst);
    }

    async fn publish(&self, room: &Room, session: SessionId, kind: RelayKind, payload: &[u8]) {
        let Some(relay) = &self.inner.relay else {
            return;
        };
        let envelope = RelayEnvelope {
            origin: self.inner.instance_id,
            document: room.id.as_str().to_string(),
            session,
            kind,
            payload: payload.to_vec(),
        };
        publish_envelope(relay.as_ref(), &envelope).await;
    }

    /// Merge an event published by another instance.
    ///
    /// Only documents this instance holds are touched; events for a document
    /// still loading are applied once it is resident. A document loaded later
    /// catches up through its sync request. Remote changes are stored by
    /// their origin.
    async fn apply_remote(&self, envelope: RelayEnvelope) {
        let id = DocumentId::new(envelope.document.clone());
        let Some(load) = self.documents().get(&id).cloned() else {
            return;
        };
        match load.peek().cloned() {
            Some(room) => self.apply_remote_to(&room, envelope).await,
            None => {
                let multiplexer = self.clone();
                tokio::spawn(async move {
                    let room = load.await;
                    multiplexer.apply_remote_to(&room, envelope).await;
                });
            }
        }
    }

    async fn apply_remote_to(&self, room: &Arc<Room>, envelope: RelayEnvelope) {
        let mut state = room.state.lock().await;
        if state.evicted {
            return;
        }
        let id = &room.id;
        match envelope.kind {
            RelayKind::Update => {
                let update = match Update::decode_v1(&envelope.payload) {
                    Ok(update) => update,
                    Err(e) => {
                        log::warn!("Dropping invalid relayed update for document {id}: {e}");
                        return;
                    }
                };
                {
                    let mut txn = state.doc.transact_mut();
                    if let Err(e) = txn.apply_update(update) {
                        log::warn!("Failed to apply relayed update for document {id}: {e}");
                        return;
                    }
                }
                room.send(None, &SyncMessage::update(envelope.session, envelope.payload));
            }
            RelayKind::SyncRequest => {
                let remote = match StateVector::decode_v1(&envelope.payload) {
                    Ok(remote) => remote,
                    Err(e) => {
                        log::warn!("Dropping invalid sync request for document {id}: {e}");
                        return;
                    }
                };
                let diff = state.doc.transact().encode_diff_v1(&remote);
                drop(state);
                if diff == empty_update() {
                    return;
                }
                log::debug!(
                    "Answering sync request from instance {} for document {id}",
                    envelope.origin
                );
                self.publish(room, Uuid::nil(), RelayKind::Update, &diff)
                    .await;
            }
            RelayKind::Awareness => {
                state.awareness.insert(
                    envelope.session,
                    AwarenessEntry::remote(envelope.origin, envelope.payload.clone()),
                );
                room.send(
                    None,
                    &SyncMessage::awareness(envelope.session, envelope.payload),
                );
            }
            RelayKind::PeerLeft => {
                state.awareness.remove(&envelope.session);
                room.send(None, &SyncMessage::peer_left(envelope.session));
            }
        }
    }

    /// Recover resident documents after relay events were lost.
    ///
    /// Remote cursors can no longer be trusted to be removed, and missed
    /// updates are requested again from the peers.
    async fn recover_relay_gap(&self) {
        let rooms: Vec<Arc<Room>> = self
            .documents()
            .values()
            .filter_map(|load| load.peek().cloned())
            .collect();
        for room in rooms {
            let state_vector = {
                let mut state = room.state.lock().await;
                if state.evicted {
                    continue;
                }
                for session in state.drop_remote_awareness() {
                    room.send(None, &SyncMessage::peer_left(session));
                }
                state.state_vector()
            };
            self.publish(&room, Uuid::nil(), RelayKind::SyncRequest, &state_vector)
                .await;
        }
    }
}

/// Encoding of an update that carries nothing.
fn empty_update() -> Vec<u8> {
    Doc::new()
        .transact()
        .encode_state_as_update_v1(&StateVector::default())
}

async fn publish_envelope(relay: &dyn Relay, envelope: &RelayEnvelope) {
    if let Err(e) = relay.publish(envelope).await {
        log::warn!(
            "Failed to relay {:?} for document {}: {e}",
            envelope.kind,
            envelope.document
        );
    }
}

async fn relay_loop(inner: Weak<Inner>, mut rx: broadcast::Receiver<RelayEnvelope>) {
    loop {
        let received = rx.recv().await;
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let multiplexer = Multiplexer { inner };
        match received {
            Ok(envelope) if envelope.origin == multiplexer.inner.instance_id => {}
            Ok(envelope) => multiplexer.apply_remote(envelope).await,
            Err(RecvError::Lagged(n)) => {
                log::warn!("Relay subscriber lagged by {n} messages");
                multiplexer.recover_relay_gap().await;
            }
            Err(RecvError::Closed) => {
                log::warn!("Relay subscription closed");
                multiplexer.recover_relay_gap().await;
                break;
            }
        }
    }
}

/// Evicts a loaded room when the attach waiting for it is cancelled.
struct AbandonedLoad {
    multiplexer: Multiplexer,
    load: Option<LoadFuture>,
}

impl Drop for AbandonedLoad {
    fn drop(&mut self) {
        let Some(load) = self.load.take() else {
            return;
        };
        let multiplexer = self.multiplexer.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let room = load.await;
                multiplexer.evict_if_idle(&room).await;
            });
        }
    }
}

/// One authenticated connection attached to a document.
///
/// Dropping a session without [`Session::close`] detaches it in the
/// background.
pub struct Session {
    id: SessionId,
    identity: Identity,
    context: RequestContext,
    room: Arc<Room>,
    frames: FrameReceiver,
    /// Frames owed to this session before live traffic
    pending: VecDeque<Arc<Vec<u8>>>,
    resync: bool,
    multiplexer: Multiplexer,
    closed: bool,
}

impl Session {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn document(&self) -> &DocumentId {
        &self.room.id
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn is_read_only(&self) -> bool {
        self.identity.read_only
    }

    pub fn context(&self) -> &RequestContext {
        &self.context
    }

    /// Encoded state vector of the shared document.
    pub async fn state_vector(&self) -> Vec<u8> {
        self.room.state.lock().await.state_vector()
    }

    /// Everything the shared document has that `state_vector` lacks.
    pub async fn encode_diff(&self, state_vector: &[u8]) -> Result<Vec<u8>, SessionError> {
        let remote = StateVector::decode_v1(state_vector)
            .map_err(|e| SessionError::InvalidStateVector(e.to_string()))?;
        let state = self.room.state.lock().await;
        let diff = state.doc.transact().encode_diff_v1(&remote);
        Ok(diff)
    }

    /// Merge an update and fan it out to the other sessions.
    pub async fn apply_update(&self, update: &[u8]) -> Result<(), SessionError> {
        self.multiplexer
            .apply_update(&self.room, self.id, &self.identity, &self.context, update)
            .await
    }

    pub async fn update_awareness(&self, payload: Vec<u8>) {
        self.multiplexer
            .update_awareness(&self.room, self.id, payload)
            .await;
    }

    /// Next encoded frame for this session; `None` once the document is gone.
    ///
    /// A session that fell too far behind receives a full-state `SyncStep2`
    /// in place of the frames it lost. Cancel safe.
    pub async fn next_frame(&mut self) -> Option<Arc<Vec<u8>>> {
        if let Some(frame) = self.pending.pop_front() {
            return Some(frame);
        }
        loop {
            if self.resync {
                let full = self.room.state.lock().await.encode_state();
                self.resync = false;
                match SyncMessage::sync_step2(Uuid::nil(), full).encode() {
                    Ok(bytes) => return Some(Arc::new(bytes)),
                    Err(e) => log::error!("Failed to encode resync for session {}: {e}", self.id),
                }
            }
            match self.frames.recv().await {
                Ok(bytes) => return Some(bytes),
                Err(FrameError::Lagged(n)) => {
                    log::warn!("Session {} lagged by {n} frames, resynchronising", self.id);
                    self.resync = true;
                }
                Err(FrameError::Closed) => return None,
            }
        }
    }

    /// Detach from the document, storing it if this was the last session.
    pub async fn close(mut self) {
        self.closed = true;
        self.multiplexer.detach(&self.room, self.id).await;
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        let multiplexer = self.multiplexer.clone();
        let room = self.room.clone();
        let id = self.id;
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                multiplexer.detach(&room, id).await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = MultiplexerConfig::default();
        assert_eq!(config.debounce, Duration::from_secs(2));
        assert_eq!(config.max_debounce, Duration::from_secs(10));
        assert_eq!(config.broadcast_capacity, 256);
        assert_eq!(config.fetch_timeout, Duration::from_secs(10));
        assert_eq!(config.remote_awareness_ttl, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_flush_deadline() {
        let room = Room::load(DocumentId::new("d"), None, 8);
        let mut state = room.state.lock().await;
        let debounce = Duration::from_millis(100);
        let max = Duration::from_millis(250);
        assert!(state.flush_deadline(debounce, max).is_none());

        state.mark_dirty(&RequestContext::default());
        let first = state.first_unflushed.unwrap();
        assert_eq!(state.flush_deadline(debounce, max), Some(first + debounce));

        // A change much later is capped by the max debounce
        state.last_change = Some(first + Duration::from_millis(200));
        assert_eq!(state.flush_deadline(debounce, max), Some(first + max));
    }

    #[tokio::test]
    async fn test_room_loads_invalid_state_as_empty() {
        let room = Room::load(DocumentId::new("d"), Some(vec![0xFF, 0x01]), 8);
        let state = room.state.lock().await;
        assert_eq!(state.encode_state(), empty_update());
    }

    #[tokio::test]
    async fn test_only_remote_awareness_is_dropped() {
        let local = AwarenessEntry::local(b"here".to_vec());
        let remote = AwarenessEntry::remote(Uuid::new_v4(), b"there".to_vec());
        assert!(!local.is_stale(Duration::ZERO));
        assert!(remote.is_stale(Duration::ZERO));
        assert!(!remote.is_stale(Duration::from_secs(30)));

        let room = Room::load(DocumentId::new("d"), None, 8);
        let mut state = room.state.lock().await;
        let (near, far) = (Uuid::new_v4(), Uuid::new_v4());
        state.awareness.insert(near, local);
        state.awareness.insert(far, remote);

        assert_eq!(state.drop_remote_awareness(), vec![far]);
        assert!(state.awareness.contains_key(&near));
        assert!(state.drop_remote_awareness().is_empty());
    }
}
