//! Durable archive of completed sessions.
//!
//! The archive owns a session's record once it is finished. It also holds
//! the build catalog that gates creation of new sessions.

pub mod file_archive;

use std::future::Future;

use protocol::ArchiveRecord;
use thiserror::Error;

pub use file_archive::{default_archive_dir, FileArchive};

/// Errors returned by an archive.
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("archive I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("archive serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// A final record already exists for the session.
    #[error("session {0} is already archived")]
    AlreadyArchived(String),

    #[error("archive lock poisoned")]
    LockPoisoned,
}

/// Storage contract for finished sessions.
pub trait Archive: Send + Sync + 'static {
    /// Returns true if `build_number` is in the build catalog.
    fn record_exists_for_build(
        &self,
        build_number: &str,
    ) -> impl Future<Output = Result<bool, ArchiveError>> + Send;

    /// Writes the final record of a session. Write-once.
    fn insert_final_record(
        &self,
        record: &ArchiveRecord,
    ) -> impl Future<Output = Result<(), ArchiveError>> + Send;
}
