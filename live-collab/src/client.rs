//! WebSocket client for the `/collaboration` endpoint.
//!
//! Provides:
//! - Connection with cookie, query params and the `Auth` handshake
//! - Update, awareness and sync requests
//! - Server frames surfaced as [`SyncEvent`]s
//!
//! Used by tooling and the end-to-end tests; editors speak the same protocol.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use reqwest::Url;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::context::{DOCUMENT_ID_PARAM, DOCUMENT_TYPE_PARAM};
use crate::protocol::{MessageType, ProtocolError, SyncMessage};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Invalid server url: {0}")]
    InvalidUrl(String),
    #[error("Connection refused with HTTP {0}")]
    Rejected(u16),
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
    #[error("Connection closed")]
    Closed,
    #[error("Timed out waiting for the server")]
    Timeout,
    #[error(transparent)]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Where and as whom to connect.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Server endpoint, e.g. `ws://localhost:3000/collaboration`
    pub url: String,
    pub document_id: String,
    pub document_type: Option<String>,
    /// Additional query params (`workspaceSlug`, `projectId`, ...)
    pub params: Vec<(String, String)>,
    pub cookie: Option<String>,
    pub token: String,
    /// Bound on the handshake, connect included
    pub timeout: Duration,
}

impl ClientOptions {
    pub fn new(
        url: impl Into<String>,
        document_id: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        Self {
            url: url.into(),
            document_id: document_id.into(),
            document_type: None,
            params: Vec::new(),
            cookie: None,
            token: token.into(),
            timeout: Duration::from_secs(10),
        }
    }

    pub fn document_type(mut self, document_type: impl Into<String>) -> Self {
        self.document_type = Some(document_type.into());
        self
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((key.into(), value.into()));
        self
    }

    pub fn cookie(mut self, cookie: impl Into<String>) -> Self {
        self.cookie = Some(cookie.into());
        self
    }

    /// Endpoint with the document identity in the query string.
    pub fn request_url(&self) -> Result<Url, ClientError> {
        let mut url =
            Url::parse(&self.url).map_err(|e| ClientError::InvalidUrl(format!("{}: {e}", self.url)))?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair(DOCUMENT_ID_PARAM, &self.document_id);
            if let Some(document_type) = &self.document_type {
                query.append_pair(DOCUMENT_TYPE_PARAM, document_type);
            }
            for (key, value) in &self.params {
                query.append_pair(key, value);
            }
        }
        Ok(url)
    }
}

/// Frames received from the server after authentication.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// The server's state vector, sent once after authentication
    SyncStep1(Vec<u8>),
    /// State the client lacked (reply to a sync request, or a resync)
    SyncStep2(Vec<u8>),
    /// An update merged from another session
    Update { session: Uuid, update: Vec<u8> },
    Awareness { session: Uuid, state: Vec<u8> },
    PeerLeft(Uuid),
    Pong,
    /// The socket closed, with the close code if one was sent
    Closed(Option<u16>),
}

/// An authenticated collaboration connection.
pub struct CollabClient {
    session_id: Uuid,
    read_only: bool,
    outgoing: mpsc::Sender<Message>,
    events: mpsc::Receiver<SyncEvent>,
}

impl CollabClient {
    /// Connect, authenticate and start the reader and writer tasks.
    pub async fn connect(options: ClientOptions) -> Result<Self, ClientError> {
        tokio::time::timeout(options.timeout, Self::handshake(&options))
            .await
            .map_err(|_| ClientError::Timeout)?
    }

    async fn handshake(options: &ClientOptions) -> Result<Self, ClientError> {
        let url = options.request_url()?;
        let mut request = url.as_str().into_client_request()?;
        if let Some(cookie) = &options.cookie {
            let value = HeaderValue::from_str(cookie)
                .map_err(|e| ClientError::InvalidUrl(format!("invalid cookie: {e}")))?;
            request.headers_mut().insert("cookie", value);
        }

        let (stream, _) = match tokio_tungstenite::connect_async(request).await {
            Ok(connected) => connected,
            Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
                return Err(ClientError::Rejected(response.status().as_u16()));
            }
            Err(e) => return Err(e.into()),
        };
        let (mut writer, mut reader) = stream.split();

        let auth = SyncMessage::auth(&options.token).encode()?;
        writer.send(Message::Binary(auth.into())).await?;

        let (session_id, read_only) = loop {
            let data = match reader.next().await {
                Some(Ok(Message::Binary(data))) => data,
                Some(Ok(Message::Close(_))) | None => return Err(ClientError::Closed),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
            };
            let msg = SyncMessage::decode(&data)?;
            match msg.msg_type {
                MessageType::Authenticated => break (msg.session_id, msg.read_only()?),
                MessageType::PermissionDenied => {
                    return Err(ClientError::PermissionDenied(msg.reason()?));
                }
                other => log::debug!("Ignoring {other:?} before authentication"),
            }
        };
        log::debug!("Authenticated as session {session_id} (read-only: {read_only})");

        let (out_tx, mut out_rx) = mpsc::channel::<Message>(256);
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if writer.send(msg).await.is_err() || closing {
                    break;
                }
            }
        });

        let (event_tx, event_rx) = mpsc::channel::<SyncEvent>(256);
        tokio::spawn(async move {
            while let Some(frame) = reader.next().await {
                let event = match frame {
                    Ok(Message::Binary(data)) => match SyncMessage::decode(&data) {
                        Ok(msg) => match to_event(msg) {
                            Some(event) => event,
                            None => continue,
                        },
                        Err(e) => {
                            log::warn!("Failed to decode server frame: {e}");
                            continue;
                        }
                    },
                    Ok(Message::Close(frame)) => {
                        let code = frame.map(|f| u16::from(f.code));
                        let _ = event_tx.send(SyncEvent::Closed(code)).await;
                        return;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        log::debug!("Connection error: {e}");
                        break;
                    }
                };
                if event_tx.send(event).await.is_err() {
                    return;
                }
            }
            let _ = event_tx.send(SyncEvent::Closed(None)).await;
        });

        Ok(Self {
            session_id,
            read_only,
            outgoing: out_tx,
            events: event_rx,
        })
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }

    /// Send a v1-encoded update.
    pub async fn send_update(&self, update: Vec<u8>) -> Result<(), ClientError> {
        self.send(SyncMessage::update(self.session_id, update)).await
    }

    pub async fn send_awareness(&self, state: Vec<u8>) -> Result<(), ClientError> {
        self.send(SyncMessage::awareness(self.session_id, state))
            .await
    }

    /// Ask for everything missing from `state_vector`; answered by a
    /// [`SyncEvent::SyncStep2`].
    pub async fn request_sync(&self, state_vector: Vec<u8>) -> Result<(), ClientError> {
        self.send(SyncMessage::sync_step1(self.session_id, state_vector))
            .await
    }

    pub async fn ping(&self) -> Result<(), ClientError> {
        self.send(SyncMessage::ping(self.session_id)).await
    }

    /// Next server event; `None` after the connection is gone.
    pub async fn recv(&mut self) -> Option<SyncEvent> {
        self.events.recv().await
    }

    pub async fn close(self) {
        let _ = self.outgoing.send(Message::Close(None)).await;
    }

    async fn send(&self, msg: SyncMessage) -> Result<(), ClientError> {
        let bytes = msg.encode()?;
        self.outgoing
            .send(Message::Binary(bytes.into()))
            .await
            .map_err(|_| ClientError::Closed)
    }
}

fn to_event(msg: SyncMessage) -> Option<SyncEvent> {
    Some(match msg.msg_type {
        MessageType::SyncStep1 => SyncEvent::SyncStep1(msg.payload),
        MessageType::SyncStep2 => SyncEvent::SyncStep2(msg.payload),
        MessageType::Update => SyncEvent::Update {
            session: msg.session_id,
            update: msg.payload,
        },
        MessageType::Awareness => SyncEvent::Awareness {
            session: msg.session_id,
            state: msg.payload,
        },
        MessageType::PeerLeft => SyncEvent::PeerLeft(msg.session_id),
        MessageType::Pong => SyncEvent::Pong,
        other => {
            log::debug!("Ignoring unexpected {other:?} frame");
            return None;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_url_carries_document_identity() {
        let options = ClientOptions::new("ws://localhost:3000/collaboration", "page-1", "user-1")
            .document_type("project_page")
            .param("workspaceSlug", "acme")
            .param("projectId", "p 1");
        let url = options.request_url().unwrap();
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();

        assert_eq!(url.path(), "/collaboration");
        assert_eq!(
            pairs,
            vec![
                ("documentId".to_string(), "page-1".to_string()),
                ("documentType".to_string(), "project_page".to_string()),
                ("workspaceSlug".to_string(), "acme".to_string()),
                ("projectId".to_string(), "p 1".to_string()),
            ]
        );
    }

    #[test]
    fn test_invalid_url() {
        let options = ClientOptions::new("not a url", "page-1", "user-1");
        assert!(matches!(options.request_url(), Err(ClientError::InvalidUrl(_))));
    }

    #[test]
    fn test_server_frames_map_to_events() {
        let peer = Uuid::new_v4();
        assert_eq!(
            to_event(SyncMessage::update(peer, vec![1])),
            Some(SyncEvent::Update {
                session: peer,
                update: vec![1]
            })
        );
        assert_eq!(
            to_event(SyncMessage::peer_left(peer)),
            Some(SyncEvent::PeerLeft(peer))
        );
        assert_eq!(to_event(SyncMessage::pong(Uuid::nil())), Some(SyncEvent::Pong));
        assert_eq!(to_event(SyncMessage::auth("x")), None);
    }

    #[tokio::test]
    async fn test_connect_refused_host() {
        let mut options = ClientOptions::new("ws://127.0.0.1:9/collaboration", "page-1", "u");
        options.timeout = Duration::from_secs(2);
        assert!(CollabClient::connect(options).await.is_err());
    }
}
