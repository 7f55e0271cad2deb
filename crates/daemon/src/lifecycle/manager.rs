//! Session lifecycle manager.
//!
//! All transitions for one session are serialized by a per-key lock: start
//! requests lock on the build number, pause/resume/finish on the session
//! id. Finish also takes the build lock while it removes the session, so a
//! concurrent start sees either the open session or none. Locks are always
//! taken session first, then build. Different sessions never wait on each
//! other.

use std::sync::Arc;

use protocol::{ArchiveRecord, LifecycleNotification, SessionStatus};

use super::{
    FinishOutcome, KeyedLocks, LifecycleError, SessionView, StartKind, StartOutcome,
    TransitionOutcome, FINISHED_REASON, PAUSED_REASON,
};
use crate::archive::{Archive, ArchiveError};
use crate::clock::Clock;
use crate::notify::Notifier;
use crate::relay::ConnectionRegistry;
use crate::store::{SessionDelta, SessionStore};

const RECONNECTED_ACTIVE: &str = "Reconnected to active session.";
const RECONNECTED_PENDING: &str = "Session is currently pending/paused.";
const ALREADY_PAUSED: &str = "Already paused";
const ALREADY_ACTIVE: &str = "Already active";

fn build_lock_key(build_number: &str) -> String {
    format!("build:{}", build_number)
}

fn session_lock_key(session_id: &str) -> String {
    format!("session:{}", session_id)
}

/// Drives sessions through start, pause, resume and finish.
pub struct SessionLifecycleManager<S, A, N> {
    store: Arc<S>,
    archive: Arc<A>,
    notifier: Arc<N>,
    registry: Arc<ConnectionRegistry>,
    clock: Arc<dyn Clock>,
    locks: KeyedLocks,
}

impl<S, A, N> SessionLifecycleManager<S, A, N>
where
    S: SessionStore,
    A: Archive,
    N: Notifier,
{
    pub fn new(
        store: Arc<S>,
        archive: Arc<A>,
        notifier: Arc<N>,
        registry: Arc<ConnectionRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            archive,
            notifier,
            registry,
            clock,
            locks: KeyedLocks::new(),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Number of lock entries currently in use.
    pub fn held_locks(&self) -> usize {
        self.locks.held()
    }

    fn notify(&self, notification: LifecycleNotification) {
        let topic = notification.topic.clone();
        if let Err(e) = self.notifier.publish(notification) {
            tracing::warn!(topic = %topic, error = %e, "Failed to publish lifecycle notification");
        }
    }

    /// Opens a session for `build_number`, or reconnects to the open one.
    ///
    /// A new session is only created for builds known to the archive's
    /// build catalog.
    pub async fn start(
        &self,
        build_number: &str,
        operator: &str,
    ) -> Result<StartOutcome, LifecycleError> {
        let _guard = self.locks.lock(build_lock_key(build_number)).await;
        let now = self.clock.now();

        if let Some(record) = self.store.lookup_by_build(build_number).await? {
            let elapsed_seconds = record.elapsed_at(now);
            let message = match record.status {
                SessionStatus::Pending => RECONNECTED_PENDING,
                _ => RECONNECTED_ACTIVE,
            };
            tracing::info!(
                session_id = %record.session_id,
                build_number = %build_number,
                status = %record.status,
                elapsed_seconds,
                "Reconnected to open session"
            );
            return Ok(StartOutcome {
                kind: StartKind::Reconnected,
                record,
                elapsed_seconds,
                message: Some(message.to_string()),
            });
        }

        if !self.archive.record_exists_for_build(build_number).await? {
            return Err(LifecycleError::NotFound(format!(
                "build number not found: {}",
                build_number
            )));
        }

        let record = self
            .store
            .create_if_absent(build_number, operator, now)
            .await?;
        self.notify(LifecycleNotification::started(&record));

        tracing::info!(
            session_id = %record.session_id,
            build_number = %build_number,
            operator = %operator,
            "Session started"
        );
        Ok(StartOutcome {
            kind: StartKind::Created,
            record,
            elapsed_seconds: 0.0,
            message: None,
        })
    }

    /// Pauses an active session, freezing its active time.
    ///
    /// Live viewers are disconnected. Pausing a paused session is a no-op.
    pub async fn pause(&self, session_id: &str) -> Result<TransitionOutcome, LifecycleError> {
        let _guard = self.locks.lock(session_lock_key(session_id)).await;
        let record = self.store.lookup_by_session(session_id).await?;

        if record.status == SessionStatus::Pending {
            return Ok(TransitionOutcome {
                elapsed_seconds: record.total_active_seconds,
                record,
                changed: false,
                message: Some(ALREADY_PAUSED.to_string()),
            });
        }

        let total = record.elapsed_at(self.clock.now());
        let record = self
            .store
            .update(session_id, SessionDelta::pause(total))
            .await?;

        let closed = self.registry.disconnect_all(session_id, PAUSED_REASON);
        self.notify(LifecycleNotification::paused(session_id));

        tracing::info!(
            session_id = %session_id,
            total_active_seconds = total,
            viewers_closed = closed,
            "Session paused"
        );
        Ok(TransitionOutcome {
            record,
            elapsed_seconds: total,
            changed: true,
            message: None,
        })
    }

    /// Resumes a paused session. Resuming an active session is a no-op.
    pub async fn resume(&self, session_id: &str) -> Result<TransitionOutcome, LifecycleError> {
        let _guard = self.locks.lock(session_lock_key(session_id)).await;
        let now = self.clock.now();
        let record = self.store.lookup_by_session(session_id).await?;

        if record.status == SessionStatus::Active {
            return Ok(TransitionOutcome {
                elapsed_seconds: record.elapsed_at(now),
                record,
                changed: false,
                message: Some(ALREADY_ACTIVE.to_string()),
            });
        }

        let record = self
            .store
            .update(session_id, SessionDelta::resume(now))
            .await?;
        self.notify(LifecycleNotification::resumed(session_id));

        tracing::info!(
            session_id = %session_id,
            total_active_seconds = record.total_active_seconds,
            "Session resumed"
        );
        Ok(TransitionOutcome {
            elapsed_seconds: record.total_active_seconds,
            record,
            changed: true,
            message: None,
        })
    }

    /// Finishes a session: archives it with its event log and removes it
    /// from the store.
    ///
    /// If the archive write fails the session is left open and unchanged.
    pub async fn finish(&self, session_id: &str) -> Result<FinishOutcome, LifecycleError> {
        let _guard = self.locks.lock(session_lock_key(session_id)).await;
        let record = self.store.lookup_by_session(session_id).await?;
        let _build_guard = self.locks.lock(build_lock_key(&record.build_number)).await;

        let now = self.clock.now();
        let total = record.elapsed_at(now);
        let events = self.store.drain_events(session_id).await?;
        let event_count = events.len();
        let build_number = record.build_number.clone();

        let archived = ArchiveRecord::complete(record, total, now, events);
        match self.archive.insert_final_record(&archived).await {
            Ok(()) => {}
            Err(ArchiveError::AlreadyArchived(_)) => {
                // An earlier finish archived the session but did not get to
                // clean up the store.
                tracing::warn!(
                    session_id = %session_id,
                    "Session already archived, completing cleanup"
                );
            }
            Err(e) => {
                tracing::error!(session_id = %session_id, error = %e, "Failed to archive session");
                return Err(e.into());
            }
        }

        self.store.delete_session(session_id, &build_number).await?;
        let viewers_closed = self.registry.disconnect_all(session_id, FINISHED_REASON);
        self.notify(LifecycleNotification::finished(session_id));

        tracing::info!(
            session_id = %session_id,
            build_number = %build_number,
            total_duration_seconds = total,
            events = event_count,
            "Session finished"
        );
        Ok(FinishOutcome {
            session_id: session_id.to_string(),
            build_number,
            total_duration_seconds: total,
            events: event_count,
            viewers_closed,
        })
    }

    /// Returns an open session and its displayed active time.
    pub async fn status(&self, session_id: &str) -> Result<SessionView, LifecycleError> {
        let record = self.store.lookup_by_session(session_id).await?;
        Ok(SessionView {
            elapsed_seconds: record.elapsed_at(self.clock.now()),
            record,
        })
    }

    /// Lists every open session.
    pub async fn list(&self) -> Result<Vec<SessionView>, LifecycleError> {
        let now = self.clock.now();
        Ok(self
            .store
            .list_sessions()
            .await?
            .into_iter()
            .map(|record| SessionView {
                elapsed_seconds: record.elapsed_at(now),
                record,
            })
            .collect())
    }
}
