//! Event relay.
//!
//! Bridges the inbound result feed to the session store and to live
//! viewers:
//!
//! ```text
//! feed ──▶ topic check ──▶ parse ──▶ append to log ──▶ broadcast to viewers
//! ```
//!
//! Delivery is at-most-once. A message that fails any step is logged and
//! dropped.

pub mod registry;

use std::sync::Arc;

use protocol::{topic, ProtocolError, TestEvent};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::store::{SessionStore, StoreError};

pub use registry::{
    close_code, ConnectionId, ConnectionRegistry, ViewerFrame, ViewerReceiver,
    DEFAULT_VIEWER_CHANNEL_CAPACITY,
};

/// Default capacity of the inbound feed channel.
pub const DEFAULT_FEED_CAPACITY: usize = 1024;

/// One message from the result feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl FeedMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// Errors raised while ingesting one feed message.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The topic does not match `tests/+/result`.
    #[error("topic does not carry a session id: {0}")]
    MalformedTopic(String),

    /// The payload is not a valid test event.
    #[error("invalid event: {0}")]
    InvalidEvent(#[from] ProtocolError),

    /// The event could not be logged.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result of a successful ingest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestOutcome {
    pub session_id: String,
    /// Length of the session's event log after the append.
    pub log_len: usize,
    /// Viewers the event was queued for.
    pub delivered: usize,
}

/// Non-blocking producer handle for the feed channel.
#[derive(Clone)]
pub struct FeedSender {
    tx: mpsc::Sender<FeedMessage>,
}

impl FeedSender {
    /// Creates a feed channel with the given capacity.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<FeedMessage>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Queues a message. Returns false if it was dropped.
    pub fn offer(&self, message: FeedMessage) -> bool {
        match self.tx.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(message)) => {
                tracing::warn!(topic = %message.topic, "Feed channel full, dropping message");
                false
            }
            Err(mpsc::error::TrySendError::Closed(message)) => {
                tracing::warn!(topic = %message.topic, "Feed channel closed, dropping message");
                false
            }
        }
    }
}

/// Ingests feed messages into the store and fans them out to viewers.
pub struct EventRelay<S: SessionStore> {
    store: Arc<S>,
    registry: Arc<ConnectionRegistry>,
    clock: Arc<dyn Clock>,
}

impl<S: SessionStore> EventRelay<S> {
    pub fn new(store: Arc<S>, registry: Arc<ConnectionRegistry>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            registry,
            clock,
        }
    }

    /// The viewer registry.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Handles one message published on `topic`.
    pub async fn ingest(&self, topic: &str, payload: &[u8]) -> Result<IngestOutcome, RelayError> {
        let session_id = topic::session_from_result_topic(topic)
            .ok_or_else(|| RelayError::MalformedTopic(topic.to_string()))?;

        let event = TestEvent::parse(payload, self.clock.now())?;
        let json = event.to_json()?;

        let log_len = self.store.append_event(session_id, &event).await?;
        let delivered = self.registry.broadcast(session_id, &json);

        tracing::debug!(
            session_id = %session_id,
            test_name = %event.test_name,
            status = %event.status,
            log_len,
            delivered,
            "Relayed test event"
        );

        Ok(IngestOutcome {
            session_id: session_id.to_string(),
            log_len,
            delivered,
        })
    }

    /// Ingests a message and logs any failure. Never fails.
    pub async fn handle(&self, message: FeedMessage) {
        match self.ingest(&message.topic, &message.payload).await {
            Ok(_) => {}
            Err(RelayError::MalformedTopic(topic)) => {
                tracing::debug!(topic = %topic, "Ignoring message on unrelated topic");
            }
            Err(RelayError::InvalidEvent(e)) => {
                tracing::warn!(topic = %message.topic, error = %e, "Dropping malformed test event");
            }
            Err(RelayError::Store(StoreError::NotFound(session_id))) => {
                tracing::warn!(session_id = %session_id, "Dropping event for unknown session");
            }
            Err(RelayError::Store(e)) => {
                tracing::error!(topic = %message.topic, error = %e, "Failed to log test event");
            }
        }
    }

    /// Consumes the feed until it closes or `cancel` fires.
    pub async fn run(self: Arc<Self>, mut feed: mpsc::Receiver<FeedMessage>, cancel: CancellationToken) {
        tracing::info!("Event relay started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                message = feed.recv() => match message {
                    Some(message) => self.handle(message).await,
                    None => break,
                },
            }
        }
        tracing::info!("Event relay stopped");
    }
}
