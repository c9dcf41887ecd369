//! HTTP/WebSocket gateway.
//!
//! Architecture:
//! ```text
//! GET /health ─────────► "OK"
//!
//! GET /collaboration ──► cookie check ──► upgrade ──► Auth frame ──► Multiplexer::connect
//!      ?documentId=…                                                    │
//!      &documentType=…                                                  ▼
//!                                          socket ◄──── frames ──── Session
//! ```
//!
//! A missing cookie refuses the upgrade with 401; a failed verification
//! sends `PermissionDenied` and closes the socket with code 4401.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpListener;
use uuid::Uuid;

use crate::api::{ApiError, ContentApi};
use crate::auth::{self, ContentApiVerifier};
use crate::context::RequestContext;
use crate::multiplexer::{Multiplexer, MultiplexerConfig, Session, SessionError};
use crate::protocol::{MessageType, SyncMessage};
use crate::relay;
use crate::storage::DocumentStore;

/// Close code sent after a rejected authentication.
pub const UNAUTHORIZED_CLOSE_CODE: u16 = 4401;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Base URL of the content API used for identity and storage
    pub api_base_url: String,
    /// Pub/sub relay (None = single process)
    pub redis_url: Option<String>,
    /// How long a fresh socket may take to send its `Auth` frame
    pub auth_timeout: Duration,
    pub multiplexer: MultiplexerConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            api_base_url: "http://localhost:8000".to_string(),
            redis_url: None,
            auth_timeout: Duration::from_secs(10),
            multiplexer: MultiplexerConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Configuration from environment variables, defaults for the rest.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let var = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let millis = |key: &str, default: Duration| match var(key) {
            Some(raw) => match raw.parse::<u64>() {
                Ok(ms) => Duration::from_millis(ms),
                Err(_) => {
                    log::warn!("Ignoring invalid {key}={raw}");
                    default
                }
            },
            None => default,
        };

        let port = match var("PORT") {
            Some(raw) => raw.parse().unwrap_or_else(|_| {
                log::warn!("Ignoring invalid PORT={raw}");
                defaults.port
            }),
            None => defaults.port,
        };

        Self {
            host: var("HOST").unwrap_or(defaults.host),
            port,
            api_base_url: var("API_BASE_URL").unwrap_or(defaults.api_base_url),
            redis_url: redis_url(var("REDIS_URL"), var("REDIS_HOST"), var("REDIS_PORT")),
            auth_timeout: millis("LIVE_AUTH_TIMEOUT_MS", defaults.auth_timeout),
            multiplexer: MultiplexerConfig {
                debounce: millis("LIVE_STORE_DEBOUNCE_MS", defaults.multiplexer.debounce),
                max_debounce: millis(
                    "LIVE_STORE_MAX_DEBOUNCE_MS",
                    defaults.multiplexer.max_debounce,
                ),
                fetch_timeout: millis(
                    "LIVE_STORE_FETCH_TIMEOUT_MS",
                    defaults.multiplexer.fetch_timeout,
                ),
                ..defaults.multiplexer
            },
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Relay URL: an explicit URL wins, else host plus numeric port.
pub fn redis_url(
    url: Option<String>,
    host: Option<String>,
    port: Option<String>,
) -> Option<String> {
    if url.is_some() {
        return url;
    }
    match (host, port) {
        (Some(host), Some(port)) if port.parse::<u16>().is_ok() => {
            Some(format!("redis://{host}:{port}"))
        }
        _ => None,
    }
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
    #[error("Server error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Clone)]
struct GatewayState {
    multiplexer: Multiplexer,
    auth_timeout: Duration,
}

/// Router with the liveness and collaboration endpoints.
pub fn router(multiplexer: Multiplexer, auth_timeout: Duration) -> Router {
    let state = Arc::new(GatewayState {
        multiplexer,
        auth_timeout,
    });
    Router::new()
        .route("/health", get(health))
        .route("/collaboration", get(collaboration))
        .with_state(state)
}

async fn health() -> &'static str {
    "OK"
}

async fn collaboration(
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    State(state): State<Arc<GatewayState>>,
) -> Response {
    let headers = headers
        .iter()
        .filter_map(|(name, value)| Some((name.as_str().to_string(), value.to_str().ok()?.to_string())));
    let context = RequestContext::new(headers, params);

    let Some(document) = context.document_id() else {
        return (StatusCode::BAD_REQUEST, "documentId is required").into_response();
    };
    if let Err(e) = auth::require_cookie(&context) {
        log::warn!("Refusing upgrade for document {document}: {e}");
        return (StatusCode::UNAUTHORIZED, e.to_string()).into_response();
    }
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    log::debug!("Upgrading connection for document {document}");
    ws.on_upgrade(move |socket| async move {
        let (mut sender, mut receiver) = socket.split();

        let token = match tokio::time::timeout(state.auth_timeout, read_token(&mut receiver)).await
        {
            Ok(Some(token)) => token,
            Ok(None) => {
                reject(&mut sender, "authentication frame expected").await;
                return;
            }
            Err(_) => {
                reject(&mut sender, "authentication timed out").await;
                return;
            }
        };

        match state.multiplexer.connect(document, context, &token).await {
            Ok(session) => run_session(session, sender, receiver).await,
            Err(e) => reject(&mut sender, &e.to_string()).await,
        }
    })
}

/// Wait for the `Auth` frame. `None` if anything else arrives first.
async fn read_token(receiver: &mut SplitStream<WebSocket>) -> Option<String> {
    loop {
        match receiver.next().await? {
            Ok(Message::Binary(data)) => {
                return SyncMessage::decode(&data)
                    .ok()
                    .filter(|msg| msg.msg_type == MessageType::Auth)
                    .and_then(|msg| msg.token().ok());
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
            Ok(_) => return None,
            Err(e) => {
                log::debug!("Socket error before authentication: {e}");
                return None;
            }
        }
    }
}

async fn reject(sender: &mut SplitSink<WebSocket, Message>, reason: &str) {
    if let Ok(bytes) = SyncMessage::permission_denied(reason).encode() {
        let _ = sender.send(Message::Binary(bytes.into())).await;
    }
    let _ = sender
        .send(Message::Close(Some(CloseFrame {
            code: UNAUTHORIZED_CLOSE_CODE,
            reason: "Unauthorized".into(),
        })))
        .await;
}

async fn send_message(
    sender: &mut SplitSink<WebSocket, Message>,
    msg: &SyncMessage,
) -> Result<(), axum::Error> {
    match msg.encode() {
        Ok(bytes) => sender.send(Message::Binary(bytes.into())).await,
        Err(e) => {
            log::error!("Failed to encode {:?}: {e}", msg.msg_type);
            Ok(())
        }
    }
}

/// Shuttle frames between an authenticated socket and its session.
async fn run_session(
    mut session: Session,
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
) {
    let session_id = session.id();
    let greeting = [
        SyncMessage::authenticated(session_id, session.is_read_only()),
        SyncMessage::sync_step1(Uuid::nil(), session.state_vector().await),
    ];
    for msg in &greeting {
        if send_message(&mut sender, msg).await.is_err() {
            session.close().await;
            return;
        }
    }

    loop {
        tokio::select! {
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        if let Some(reply) = handle_frame(&session, &data).await {
                            if send_message(&mut sender, &reply).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        log::debug!("Session {session_id} closed by client");
                        break;
                    }
                    Some(Err(e)) => {
                        log::warn!("Socket error on session {session_id}: {e}");
                        break;
                    }
                    Some(Ok(_)) => {}
                }
            }

            frame = session.next_frame() => {
                let Some(bytes) = frame else { break };
                if sender.send(Message::Binary(Bytes::from(Vec::clone(&bytes)))).await.is_err() {
                    break;
                }
            }
        }
    }

    session.close().await;
}

/// Apply one client frame; returns the direct reply, if any.
async fn handle_frame(session: &Session, data: &[u8]) -> Option<SyncMessage> {
    let msg = match SyncMessage::decode(data) {
        Ok(msg) => msg,
        Err(e) => {
            log::warn!("Failed to decode frame from session {}: {e}", session.id());
            return None;
        }
    };

    match msg.msg_type {
        MessageType::SyncStep1 => match session.encode_diff(&msg.payload).await {
            Ok(diff) => Some(SyncMessage::sync_step2(Uuid::nil(), diff)),
            Err(e) => {
                log::warn!("Session {}: {e}", session.id());
                None
            }
        },
        MessageType::SyncStep2 | MessageType::Update => {
            match session.apply_update(&msg.payload).await {
                Ok(()) => {}
                Err(SessionError::ReadOnly) => {
                    log::debug!("Ignoring update from read-only session {}", session.id());
                }
                Err(e) => log::warn!("Session {}: {e}", session.id()),
            }
            None
        }
        MessageType::Awareness => {
            session.update_awareness(msg.payload).await;
            None
        }
        MessageType::Ping => Some(SyncMessage::pong(Uuid::nil())),
        other => {
            log::debug!("Unhandled message type {other:?} from session {}", session.id());
            None
        }
    }
}

/// The collaboration server process.
pub struct CollabServer {
    config: ServerConfig,
    multiplexer: Multiplexer,
}

impl CollabServer {
    /// Wire the content API, verifier, store and relay from `config`.
    ///
    /// An unreachable relay is logged and the server runs single-process.
    pub async fn from_config(config: ServerConfig) -> Result<Self, ServerError> {
        let api = ContentApi::new(config.api_base_url.clone())?;
        let verifier = Arc::new(ContentApiVerifier::new(api.clone()));
        let store = Arc::new(DocumentStore::with_content_api(api));
        let relay = relay::connect(config.redis_url.as_deref()).await;
        let multiplexer = Multiplexer::new(config.multiplexer.clone(), verifier, store, relay);
        Ok(Self::new(config, multiplexer))
    }

    pub fn new(config: ServerConfig, multiplexer: Multiplexer) -> Self {
        Self {
            config,
            multiplexer,
        }
    }

    pub fn multiplexer(&self) -> &Multiplexer {
        &self.multiplexer
    }

    pub fn router(&self) -> Router {
        router(self.multiplexer.clone(), self.config.auth_timeout)
    }

    /// Bind the configured address and serve until Ctrl+C.
    pub async fn run(self) -> Result<(), ServerError> {
        let addr = self.config.bind_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: addr.clone(),
                source,
            })?;
        self.serve(listener, shutdown_signal()).await
    }

    /// Serve on an already bound listener until `shutdown` resolves.
    pub async fn serve(
        self,
        listener: TcpListener,
        shutdown: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> Result<(), ServerError> {
        log::info!("Live server has started at {}", listener.local_addr()?);
        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await?;
        log::info!("Live server stopped");
        Ok(())
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("Failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
    log::info!("Shutting down");
}
