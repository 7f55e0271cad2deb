//! Filesystem-backed archive.
//!
//! Layout under the archive directory:
//!
//! ```text
//! builds.json              build catalog
//! sessions/<id>.json       one final record per completed session
//! ```

use std::collections::BTreeSet;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use protocol::ArchiveRecord;
use serde::{Deserialize, Serialize};

use super::{Archive, ArchiveError};

const CATALOG_FILE: &str = "builds.json";
const SESSIONS_DIR: &str = "sessions";
const CATALOG_VERSION: u32 = 1;

/// On-disk form of the build catalog.
#[derive(Debug, Serialize, Deserialize)]
struct BuildCatalogData {
    /// Version of the catalog format.
    version: u32,
    builds: Vec<String>,
}

impl Default for BuildCatalogData {
    fn default() -> Self {
        Self {
            version: CATALOG_VERSION,
            builds: Vec::new(),
        }
    }
}

/// Archive that stores JSON documents in a directory.
pub struct FileArchive {
    dir: PathBuf,
    builds: RwLock<BTreeSet<String>>,
}

impl FileArchive {
    /// Creates an archive rooted at `dir`.
    ///
    /// This does not read the catalog; call [`FileArchive::load`] or use
    /// [`FileArchive::open`].
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            builds: RwLock::new(BTreeSet::new()),
        }
    }

    /// Creates an archive rooted at `dir` and loads its catalog.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self, ArchiveError> {
        let archive = Self::new(dir);
        archive.load()?;
        Ok(archive)
    }

    /// The archive directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn catalog_path(&self) -> PathBuf {
        self.dir.join(CATALOG_FILE)
    }

    fn record_path(&self, session_id: &str) -> PathBuf {
        self.dir
            .join(SESSIONS_DIR)
            .join(format!("{}.json", session_id))
    }

    /// Loads the build catalog from disk.
    ///
    /// A missing catalog file leaves the catalog empty.
    pub fn load(&self) -> Result<(), ArchiveError> {
        let path = self.catalog_path();
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "Build catalog not found, starting empty");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let data: BuildCatalogData = serde_json::from_str(&contents)?;
        if data.version != CATALOG_VERSION {
            tracing::warn!(
                version = data.version,
                expected = CATALOG_VERSION,
                "Build catalog has unexpected version, loading anyway"
            );
        }

        let mut builds = self.builds.write().map_err(|_| ArchiveError::LockPoisoned)?;
        builds.clear();
        builds.extend(data.builds);

        tracing::info!(count = builds.len(), path = %path.display(), "Loaded build catalog");
        Ok(())
    }

    /// Writes the build catalog atomically (temp file, then rename).
    fn save_catalog(&self, builds: &BTreeSet<String>) -> Result<(), ArchiveError> {
        fs::create_dir_all(&self.dir)?;

        let data = BuildCatalogData {
            version: CATALOG_VERSION,
            builds: builds.iter().cloned().collect(),
        };
        let contents = serde_json::to_string_pretty(&data)?;

        let path = self.catalog_path();
        let temp_path = path.with_extension("json.tmp");
        fs::write(&temp_path, contents)?;
        fs::rename(&temp_path, &path)?;

        tracing::debug!(count = builds.len(), "Saved build catalog");
        Ok(())
    }

    /// Adds a build number to the catalog and persists it.
    ///
    /// Returns false if the build was already registered.
    pub fn register_build(&self, build_number: &str) -> Result<bool, ArchiveError> {
        let mut builds = self.builds.write().map_err(|_| ArchiveError::LockPoisoned)?;
        if !builds.insert(build_number.to_string()) {
            return Ok(false);
        }
        if let Err(e) = self.save_catalog(&builds) {
            builds.remove(build_number);
            return Err(e);
        }
        tracing::info!(build_number = %build_number, "Registered build");
        Ok(true)
    }

    /// Lists registered build numbers in sorted order.
    pub fn list_builds(&self) -> Result<Vec<String>, ArchiveError> {
        let builds = self.builds.read().map_err(|_| ArchiveError::LockPoisoned)?;
        Ok(builds.iter().cloned().collect())
    }

    /// Reads the final record of a session, if one was written.
    pub fn read_record(&self, session_id: &str) -> Result<Option<ArchiveRecord>, ArchiveError> {
        match fs::read_to_string(self.record_path(session_id)) {
            Ok(contents) => Ok(Some(serde_json::from_str(&contents)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write_record(&self, record: &ArchiveRecord) -> Result<(), ArchiveError> {
        let session_id = &record.session.session_id;
        let path = self.record_path(session_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let contents = serde_json::to_vec_pretty(record)?;
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(ArchiveError::AlreadyArchived(session_id.clone()));
            }
            Err(e) => return Err(e.into()),
        };
        file.write_all(&contents)?;
        file.sync_all()?;
        Ok(())
    }
}

impl Archive for FileArchive {
    async fn record_exists_for_build(&self, build_number: &str) -> Result<bool, ArchiveError> {
        let builds = self.builds.read().map_err(|_| ArchiveError::LockPoisoned)?;
        Ok(builds.contains(build_number))
    }

    async fn insert_final_record(&self, record: &ArchiveRecord) -> Result<(), ArchiveError> {
        self.write_record(record)?;
        tracing::info!(
            session_id = %record.session.session_id,
            build_number = %record.session.build_number,
            total_duration_seconds = record.total_duration_seconds,
            events = record.summary.total,
            "Archived session"
        );
        Ok(())
    }
}

/// Returns the default archive directory.
///
/// This is `~/.local/share/testhub/archive` on Linux.
pub fn default_archive_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("testhub")
        .join("archive")
}
