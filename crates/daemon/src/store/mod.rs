//! Session store.
//!
//! The store is the single source of truth for open sessions and their
//! event logs. Every record is reachable through two keys, its build number
//! and its session id, and every mutation writes both views in one
//! transaction.
//!
//! Layout:
//! - `session:{build_number}`: hash holding the record fields
//! - `session_hash:{session_id}`: hash holding the same fields
//! - `tests:{session_id}`: list of serialized events, in arrival order

pub mod kv;
pub mod session_store;

use std::future::Future;

use chrono::{DateTime, Utc};
use protocol::{SessionRecord, SessionStatus, TestEvent};
use thiserror::Error;

pub use kv::MemoryKv;
pub use session_store::KvSessionStore;

/// Default time-to-live for an abandoned session (24 hours).
pub const DEFAULT_SESSION_TTL_SECS: u64 = 24 * 60 * 60;

/// Errors returned by the session store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No open session matches the key.
    #[error("session not found: {0}")]
    NotFound(String),

    /// An open session already exists for the build number.
    #[error("an open session already exists for build {0}")]
    Conflict(String),

    /// The backing store could not be reached.
    #[error("session store unavailable: {0}")]
    Unavailable(String),

    /// A stored value could not be decoded.
    #[error("corrupt entry at {key}: {reason}")]
    Corrupt {
        /// The key holding the bad value.
        key: String,
        /// What was wrong with it.
        reason: String,
    },
}

/// A partial set of record fields to merge into both record views.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionDelta {
    pub status: Option<SessionStatus>,
    /// `Some(None)` clears the field.
    pub last_active_start: Option<Option<DateTime<Utc>>>,
    pub total_active_seconds: Option<f64>,
}

impl SessionDelta {
    /// Delta for moving into `pending` with a folded total.
    pub fn pause(total_active_seconds: f64) -> Self {
        Self {
            status: Some(SessionStatus::Pending),
            last_active_start: Some(None),
            total_active_seconds: Some(total_active_seconds),
        }
    }

    /// Delta for moving back into `active` at `now`.
    pub fn resume(now: DateTime<Utc>) -> Self {
        Self {
            status: Some(SessionStatus::Active),
            last_active_start: Some(Some(now)),
            total_active_seconds: None,
        }
    }

    /// Returns true if the delta changes nothing.
    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.last_active_start.is_none()
            && self.total_active_seconds.is_none()
    }

    /// Applies the delta to a record in place.
    pub fn apply(&self, record: &mut SessionRecord) {
        if let Some(status) = self.status {
            record.status = status;
        }
        if let Some(last) = self.last_active_start {
            record.last_active_start = last;
        }
        if let Some(total) = self.total_active_seconds {
            record.total_active_seconds = total;
        }
    }
}

/// Storage contract for open sessions and their event logs.
///
/// Implementations must keep the build-keyed and session-keyed views of a
/// record consistent: a mutation is applied to both or to neither.
pub trait SessionStore: Send + Sync + 'static {
    /// Creates an active record for `build_number`.
    ///
    /// Fails with [`StoreError::Conflict`] if an open record already exists
    /// for the build.
    fn create_if_absent(
        &self,
        build_number: &str,
        operator: &str,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<SessionRecord, StoreError>> + Send;

    /// Looks up the open record for a build number.
    fn lookup_by_build(
        &self,
        build_number: &str,
    ) -> impl Future<Output = Result<Option<SessionRecord>, StoreError>> + Send;

    /// Looks up a record by session id, failing with [`StoreError::NotFound`].
    fn lookup_by_session(
        &self,
        session_id: &str,
    ) -> impl Future<Output = Result<SessionRecord, StoreError>> + Send;

    /// Merges `delta` into both views of the record and returns the result.
    fn update(
        &self,
        session_id: &str,
        delta: SessionDelta,
    ) -> impl Future<Output = Result<SessionRecord, StoreError>> + Send;

    /// Appends an event to the session's log. Returns the new log length.
    ///
    /// Fails with [`StoreError::NotFound`] if the session is not open.
    fn append_event(
        &self,
        session_id: &str,
        event: &TestEvent,
    ) -> impl Future<Output = Result<usize, StoreError>> + Send;

    /// Returns the session's whole event log in arrival order.
    ///
    /// The log itself is removed by [`SessionStore::delete_session`].
    fn drain_events(
        &self,
        session_id: &str,
    ) -> impl Future<Output = Result<Vec<TestEvent>, StoreError>> + Send;

    /// Number of events logged for the session.
    fn event_count(&self, session_id: &str)
        -> impl Future<Output = Result<usize, StoreError>> + Send;

    /// Removes both record views and the event log.
    fn delete_session(
        &self,
        session_id: &str,
        build_number: &str,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Lists every open record.
    fn list_sessions(&self) -> impl Future<Output = Result<Vec<SessionRecord>, StoreError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pause_delta_clears_last_active_start() {
        let now = Utc::now();
        let mut record = SessionRecord::new_active("s", "b", "o", now);
        SessionDelta::pause(12.0).apply(&mut record);
        assert_eq!(record.status, SessionStatus::Pending);
        assert_eq!(record.last_active_start, None);
        assert_eq!(record.total_active_seconds, 12.0);
    }

    #[test]
    fn test_resume_delta_keeps_total() {
        let now = Utc::now();
        let mut record = SessionRecord::new_active("s", "b", "o", now);
        record.total_active_seconds = 7.0;
        SessionDelta::pause(7.0).apply(&mut record);
        SessionDelta::resume(now).apply(&mut record);
        assert_eq!(record.status, SessionStatus::Active);
        assert_eq!(record.last_active_start, Some(now));
        assert_eq!(record.total_active_seconds, 7.0);
    }

    #[test]
    fn test_empty_delta() {
        assert!(SessionDelta::default().is_empty());
        assert!(!SessionDelta::pause(0.0).is_empty());
    }
}
