//! Session lifecycle state machine.
//!
//! ```text
//!            start                pause
//! (absent) ───────▶ active ◀──────────────▶ pending
//!                     │        resume          │
//!                     └──────── finish ────────┴──▶ completed
//! ```
//!
//! `completed` is terminal: a finished session leaves the store and exists
//! only in the archive.

mod locks;
mod manager;

use protocol::SessionRecord;
use serde::Serialize;
use thiserror::Error;

use crate::archive::ArchiveError;
use crate::store::StoreError;

pub use locks::{KeyedGuard, KeyedLocks};
pub use manager::SessionLifecycleManager;

/// Reason sent to viewers when their session is paused.
pub const PAUSED_REASON: &str = "Session Paused";
/// Reason sent to viewers when their session is finished.
pub const FINISHED_REASON: &str = "Session Finished";

/// Errors returned by lifecycle operations.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// No open session, or the build is not in the catalog.
    #[error("{0}")]
    NotFound(String),

    /// Another request created the session first.
    #[error("{0}")]
    Conflict(String),

    #[error("session store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("archive write failed: {0}")]
    Archive(#[from] ArchiveError),
}

impl LifecycleError {
    /// Returns true if the caller sent a request that cannot succeed as is.
    pub fn is_client_error(&self) -> bool {
        matches!(self, LifecycleError::NotFound(_) | LifecycleError::Conflict(_))
    }
}

impl From<StoreError> for LifecycleError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => LifecycleError::NotFound(format!("session not found: {}", id)),
            StoreError::Conflict(build) => LifecycleError::Conflict(format!(
                "an open session already exists for build {}",
                build
            )),
            other => LifecycleError::StoreUnavailable(other.to_string()),
        }
    }
}

/// How a start request was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StartKind {
    /// A new session was created.
    Created,
    /// An open session for the build already existed.
    Reconnected,
}

/// Result of a start request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StartOutcome {
    pub kind: StartKind,
    pub record: SessionRecord,
    /// Displayed active time at the moment of the request.
    pub elapsed_seconds: f64,
    pub message: Option<String>,
}

/// A session together with its displayed active time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionView {
    pub record: SessionRecord,
    pub elapsed_seconds: f64,
}

/// Result of a pause or resume request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransitionOutcome {
    pub record: SessionRecord,
    pub elapsed_seconds: f64,
    /// False when the session was already in the requested state.
    pub changed: bool,
    pub message: Option<String>,
}

/// Result of a finish request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FinishOutcome {
    pub session_id: String,
    pub build_number: String,
    pub total_duration_seconds: f64,
    pub events: usize,
    /// Viewers that were disconnected.
    pub viewers_closed: usize,
}
