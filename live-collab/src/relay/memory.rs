//! In-process relay for tests and single-host setups.

use async_trait::async_trait;
use tokio::sync::broadcast;

use super::{Relay, RelayEnvelope, RelayError};

/// In-process relay: clones share one channel.
///
/// Hand a clone to each multiplexer that should behave like a separate
/// server instance.
#[derive(Clone)]
pub struct MemoryRelay {
    sender: broadcast::Sender<RelayEnvelope>,
}

impl MemoryRelay {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }
}

impl Default for MemoryRelay {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl Relay for MemoryRelay {
    async fn publish(&self, envelope: &RelayEnvelope) -> Result<(), RelayError> {
        // No subscribers is not an error
        let _ = self.sender.send(envelope.clone());
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<RelayEnvelope> {
        self.sender.subscribe()
    }
}
