//! Lifecycle notification channel.
//!
//! Transitions are announced fire-and-forget. Delivery failures never fail
//! the transition that produced them.

use std::sync::RwLock;

use protocol::LifecycleNotification;
use thiserror::Error;
use tokio::sync::broadcast;

/// Default number of notifications buffered per subscriber.
pub const DEFAULT_NOTIFY_CAPACITY: usize = 256;

/// Errors returned when publishing a notification.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification channel closed")]
    Closed,
}

/// Sink for lifecycle notifications.
pub trait Notifier: Send + Sync + 'static {
    /// Publishes a notification.
    fn publish(&self, notification: LifecycleNotification) -> Result<(), NotifyError>;
}

/// Notifier that fans out over a tokio broadcast channel.
pub struct BroadcastNotifier {
    tx: RwLock<Option<broadcast::Sender<LifecycleNotification>>>,
}

impl BroadcastNotifier {
    /// Creates a notifier buffering up to `capacity` notifications per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx: RwLock::new(Some(tx)),
        }
    }

    /// Subscribes to notifications published from now on.
    ///
    /// Returns `None` once the notifier is closed.
    pub fn subscribe(&self) -> Option<broadcast::Receiver<LifecycleNotification>> {
        self.tx
            .read()
            .ok()
            .and_then(|tx| tx.as_ref().map(broadcast::Sender::subscribe))
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx
            .read()
            .ok()
            .and_then(|tx| tx.as_ref().map(broadcast::Sender::receiver_count))
            .unwrap_or(0)
    }

    /// Closes the channel. Subscribers drain what is buffered and then end.
    pub fn close(&self) {
        let mut tx = self.tx.write().unwrap_or_else(|e| e.into_inner());
        if tx.take().is_some() {
            tracing::debug!("Notification channel closed");
        }
    }
}

impl Default for BroadcastNotifier {
    fn default() -> Self {
        Self::new(DEFAULT_NOTIFY_CAPACITY)
    }
}

impl Notifier for BroadcastNotifier {
    fn publish(&self, notification: LifecycleNotification) -> Result<(), NotifyError> {
        let guard = self.tx.read().map_err(|_| NotifyError::Closed)?;
        let tx = guard.as_ref().ok_or(NotifyError::Closed)?;

        let topic = notification.topic.clone();
        match tx.send(notification) {
            Ok(receivers) => {
                tracing::debug!(topic = %topic, receivers, "Published notification");
            }
            Err(_) => {
                tracing::debug!(topic = %topic, "Published notification with no subscribers");
            }
        }
        Ok(())
    }
}
