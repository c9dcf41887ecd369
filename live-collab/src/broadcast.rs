//! Fan-out of encoded frames to the sessions of one document.
//!
//! Uses a tokio broadcast channel for O(1) send to all subscribers. Each
//! frame remembers the session that produced it so receivers can skip their
//! own frames instead of echoing them back.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;

use crate::protocol::{ProtocolError, SyncMessage};

/// An encoded frame plus the session it came from (`None` = server/relay).
#[derive(Debug, Clone)]
pub struct Frame {
    pub origin: Option<Uuid>,
    pub bytes: Arc<Vec<u8>>,
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub receivers: usize,
}

/// Atomic stats, so sending never takes a lock.
#[derive(Default)]
struct AtomicBroadcastStats {
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
}

/// A broadcast group for a single document.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Frame>,
    capacity: usize,
    stats: Arc<AtomicBroadcastStats>,
}

impl BroadcastGroup {
    /// `capacity` is how many frames a receiver may fall behind before it
    /// starts losing frames.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            capacity,
            stats: Arc::new(AtomicBroadcastStats::default()),
        }
    }

    /// Subscribe on behalf of `session`.
    pub fn subscribe(&self, session: Uuid) -> FrameReceiver {
        FrameReceiver {
            session,
            rx: self.sender.subscribe(),
            stats: self.stats.clone(),
        }
    }

    /// Encode and send a message to every receiver except `origin`.
    pub fn send(&self, origin: Option<Uuid>, msg: &SyncMessage) -> Result<usize, ProtocolError> {
        let bytes = Arc::new(msg.encode()?);
        Ok(self.send_raw(origin, bytes))
    }

    /// Send pre-encoded bytes. Returns the number of receivers.
    pub fn send_raw(&self, origin: Option<Uuid>, bytes: Arc<Vec<u8>>) -> usize {
        let count = self.sender.send(Frame { origin, bytes }).unwrap_or(0);
        self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            frames_sent: self.stats.frames_sent.load(Ordering::Relaxed),
            frames_dropped: self.stats.frames_dropped.load(Ordering::Relaxed),
            receivers: self.sender.receiver_count(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Why a [`FrameReceiver`] returned no frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// The receiver fell behind and this many frames were lost.
    Lagged(u64),
    /// The group was dropped.
    Closed,
}

/// One session's view of a [`BroadcastGroup`], without its own frames.
pub struct FrameReceiver {
    session: Uuid,
    rx: broadcast::Receiver<Frame>,
    stats: Arc<AtomicBroadcastStats>,
}

impl FrameReceiver {
    /// Next frame from another session or from the server. Cancel safe.
    pub async fn recv(&mut self) -> Result<Arc<Vec<u8>>, FrameError> {
        loop {
            match self.rx.recv().await {
                Ok(frame) if frame.origin == Some(self.session) => continue,
                Ok(frame) => return Ok(frame.bytes),
                Err(RecvError::Lagged(n)) => {
                    self.stats.frames_dropped.fetch_add(n, Ordering::Relaxed);
                    return Err(FrameError::Lagged(n));
                }
                Err(RecvError::Closed) => return Err(FrameError::Closed),
            }
        }
    }

    pub fn session(&self) -> Uuid {
        self.session
    }
}
