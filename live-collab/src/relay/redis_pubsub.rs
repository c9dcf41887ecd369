//! Redis pub/sub relay.
//!
//! Envelopes are bincode-encoded and published on one channel per document;
//! a pattern subscription forwards every channel into a local broadcast.

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tokio::sync::broadcast;

use super::{Relay, RelayEnvelope, RelayError};

/// Channel prefix; each document publishes on `{prefix}:{document}`.
pub const CHANNEL_PREFIX: &str = "live-collab";

const SUBSCRIBER_CAPACITY: usize = 1024;

/// Relay over Redis pub/sub.
pub struct RedisRelay {
    publisher: MultiplexedConnection,
    sender: broadcast::Sender<RelayEnvelope>,
}

impl RedisRelay {
    /// Connect both the publishing and the subscribing side.
    ///
    /// Subscribed envelopes are forwarded by a background task until the
    /// subscription closes.
    pub async fn connect(url: &str) -> Result<Self, RelayError> {
        let client = redis::Client::open(url).map_err(|e| RelayError::Connect(e.to_string()))?;
        let publisher = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| RelayError::Connect(e.to_string()))?;
        let mut pubsub = client
            .get_async_pubsub()
            .await
            .map_err(|e| RelayError::Connect(e.to_string()))?;
        pubsub
            .psubscribe(format!("{CHANNEL_PREFIX}:*"))
            .await
            .map_err(|e| RelayError::Connect(e.to_string()))?;

        let (sender, _) = broadcast::channel(SUBSCRIBER_CAPACITY);
        let forward = sender.clone();
        tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            while let Some(msg) = messages.next().await {
                match RelayEnvelope::decode(msg.get_payload_bytes()) {
                    Ok(envelope) => {
                        let _ = forward.send(envelope);
                    }
                    Err(e) => log::warn!("Dropping undecodable relay message: {e}"),
                }
            }
            log::warn!("Relay subscription closed");
        });

        Ok(Self { publisher, sender })
    }
}

pub fn channel_for(document: &str) -> String {
    format!("{CHANNEL_PREFIX}:{document}")
}

#[async_trait]
impl Relay for RedisRelay {
    async fn publish(&self, envelope: &RelayEnvelope) -> Result<(), RelayError> {
        let payload = envelope.encode()?;
        let mut conn = self.publisher.clone();
        conn.publish::<_, _, ()>(channel_for(&envelope.document), payload)
            .await
            .map_err(|e| RelayError::Publish(e.to_string()))
    }

    fn subscribe(&self) -> broadcast::Receiver<RelayEnvelope> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_name() {
        assert_eq!(channel_for("page-1"), "live-collab:page-1");
    }
}
