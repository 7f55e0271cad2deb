//! Live viewer connection registry.
//!
//! Maps each session to the set of viewer connections currently watching
//! it. Every connection owns a bounded channel drained by its transport
//! task. Sends never block: a full channel drops the frame for that viewer
//! only, a closed channel drops the viewer from the registry.
//!
//! The close frame travels on its own one-shot channel and is delivered
//! after any queued events, even when the data channel is full.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};

/// Identifier of one viewer connection.
pub type ConnectionId = u64;

/// Default per-viewer channel capacity.
pub const DEFAULT_VIEWER_CHANNEL_CAPACITY: usize = 256;

/// WebSocket close codes used by the relay.
pub mod close_code {
    /// Normal closure.
    pub const NORMAL: u16 = 1000;
    /// The server is going away.
    pub const GOING_AWAY: u16 = 1001;
    /// Policy violation (no such session).
    pub const POLICY: u16 = 1008;
}

/// A frame queued for one viewer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewerFrame {
    /// A serialized event.
    Text(String),
    /// Close the connection with the given code and reason.
    Close { code: u16, reason: String },
}

/// Counters for one viewer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct ViewerStats {
    messages_sent: u64,
    messages_dropped: u64,
}

/// Outcome of a single send attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SendOutcome {
    Sent,
    Dropped,
    Closed,
}

/// Transport-side end of a viewer connection.
pub struct ViewerReceiver {
    frames: mpsc::Receiver<String>,
    close: Option<oneshot::Receiver<(u16, String)>>,
}

impl ViewerReceiver {
    /// Receives the next frame.
    ///
    /// Queued events come first. Once the registry has let go of the
    /// viewer, the close frame (if any) is returned, then `None`.
    pub async fn recv(&mut self) -> Option<ViewerFrame> {
        match self.frames.recv().await {
            Some(text) => Some(ViewerFrame::Text(text)),
            None => self.take_close(),
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Result<ViewerFrame, mpsc::error::TryRecvError> {
        match self.frames.try_recv() {
            Ok(text) => Ok(ViewerFrame::Text(text)),
            Err(mpsc::error::TryRecvError::Disconnected) => self
                .take_close()
                .ok_or(mpsc::error::TryRecvError::Disconnected),
            Err(e) => Err(e),
        }
    }

    fn take_close(&mut self) -> Option<ViewerFrame> {
        let mut close = self.close.take()?;
        close
            .try_recv()
            .ok()
            .map(|(code, reason)| ViewerFrame::Close { code, reason })
    }
}

/// Registry-side handle of a viewer connection.
struct ViewerHandle {
    tx: mpsc::Sender<String>,
    close_tx: Option<oneshot::Sender<(u16, String)>>,
    stats: ViewerStats,
    backpressured: AtomicBool,
}

impl ViewerHandle {
    fn try_send(&mut self, session_id: &str, id: ConnectionId, text: String) -> SendOutcome {
        match self.tx.try_send(text) {
            Ok(()) => {
                self.stats.messages_sent += 1;
                if self.backpressured.swap(false, Ordering::Relaxed) {
                    tracing::debug!(session_id = %session_id, connection_id = id, "Viewer recovered from backpressure");
                }
                SendOutcome::Sent
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.stats.messages_dropped += 1;
                if !self.backpressured.swap(true, Ordering::Relaxed) {
                    tracing::warn!(
                        session_id = %session_id,
                        connection_id = id,
                        dropped = self.stats.messages_dropped,
                        "Viewer is backpressured, dropping events"
                    );
                }
                SendOutcome::Dropped
            }
            Err(mpsc::error::TrySendError::Closed(_)) => SendOutcome::Closed,
        }
    }
}

/// Session to live-viewer mapping.
pub struct ConnectionRegistry {
    sessions: DashMap<String, HashMap<ConnectionId, ViewerHandle>>,
    next_id: AtomicU64,
    capacity: usize,
}

impl ConnectionRegistry {
    /// Creates a registry with the default per-viewer channel capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_VIEWER_CHANNEL_CAPACITY)
    }

    /// Creates a registry with a specific per-viewer channel capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            next_id: AtomicU64::new(1),
            capacity: capacity.max(1),
        }
    }

    /// Registers a viewer for `session_id`.
    ///
    /// Returns the connection id and the receiver the transport task drains.
    pub fn connect(&self, session_id: &str) -> (ConnectionId, ViewerReceiver) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, frames) = mpsc::channel(self.capacity);
        let (close_tx, close_rx) = oneshot::channel();
        let handle = ViewerHandle {
            tx,
            close_tx: Some(close_tx),
            stats: ViewerStats::default(),
            backpressured: AtomicBool::new(false),
        };
        self.sessions
            .entry(session_id.to_string())
            .or_default()
            .insert(id, handle);
        tracing::debug!(session_id = %session_id, connection_id = id, "Viewer connected");
        (
            id,
            ViewerReceiver {
                frames,
                close: Some(close_rx),
            },
        )
    }

    /// Removes one viewer. Returns true if it was registered.
    ///
    /// The session entry is dropped once its last viewer leaves.
    pub fn disconnect(&self, session_id: &str, id: ConnectionId) -> bool {
        let removed = match self.sessions.entry(session_id.to_string()) {
            Entry::Occupied(mut entry) => {
                let removed = entry.get_mut().remove(&id);
                if entry.get().is_empty() {
                    entry.remove();
                }
                removed
            }
            Entry::Vacant(_) => None,
        };
        match removed {
            Some(handle) => {
                tracing::debug!(
                    session_id = %session_id,
                    connection_id = id,
                    sent = handle.stats.messages_sent,
                    dropped = handle.stats.messages_dropped,
                    "Viewer disconnected"
                );
                true
            }
            None => false,
        }
    }

    /// Sends `message` to every viewer of `session_id`.
    ///
    /// Viewers whose channel is closed are removed. Returns the number of
    /// viewers the message was queued for.
    pub fn broadcast(&self, session_id: &str, message: &str) -> usize {
        let Entry::Occupied(mut entry) = self.sessions.entry(session_id.to_string()) else {
            return 0;
        };

        let mut delivered = 0;
        let mut dead = Vec::new();
        for (id, handle) in entry.get_mut().iter_mut() {
            match handle.try_send(session_id, *id, message.to_string()) {
                SendOutcome::Sent => delivered += 1,
                SendOutcome::Dropped => {}
                SendOutcome::Closed => dead.push(*id),
            }
        }

        for id in &dead {
            entry.get_mut().remove(id);
            tracing::debug!(session_id = %session_id, connection_id = *id, "Dropped closed viewer");
        }
        if entry.get().is_empty() {
            entry.remove();
        }
        delivered
    }

    /// Closes every viewer of `session_id` with a normal closure and `reason`,
    /// then forgets the session. Returns the number of viewers closed.
    ///
    /// A session with no viewers is a no-op.
    pub fn disconnect_all(&self, session_id: &str, reason: &str) -> usize {
        self.close_session(session_id, close_code::NORMAL, reason)
    }

    /// Closes every viewer of every session. Used at shutdown.
    pub fn close_all(&self, reason: &str) -> usize {
        let sessions: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        sessions
            .iter()
            .map(|id| self.close_session(id, close_code::GOING_AWAY, reason))
            .sum()
    }

    fn close_session(&self, session_id: &str, code: u16, reason: &str) -> usize {
        let Some((_, mut viewers)) = self.sessions.remove(session_id) else {
            return 0;
        };

        let count = viewers.len();
        for handle in viewers.values_mut() {
            if let Some(close_tx) = handle.close_tx.take() {
                let _ = close_tx.send((code, reason.to_string()));
            }
        }
        // Dropping the handles ends the data channels.
        drop(viewers);
        tracing::info!(session_id = %session_id, viewers = count, reason = %reason, "Disconnected all viewers");
        count
    }

    /// Number of viewers of `session_id`.
    pub fn connection_count(&self, session_id: &str) -> usize {
        self.sessions.get(session_id).map(|v| v.len()).unwrap_or(0)
    }

    /// Number of sessions with at least one viewer.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Total number of viewers across all sessions.
    pub fn total_connections(&self) -> usize {
        self.sessions.iter().map(|e| e.value().len()).sum()
    }

    #[cfg(test)]
    fn viewer_stats(&self, session_id: &str, id: ConnectionId) -> Option<ViewerStats> {
        self.sessions
            .get(session_id)
            .and_then(|viewers| viewers.get(&id).map(|h| h.stats))
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
