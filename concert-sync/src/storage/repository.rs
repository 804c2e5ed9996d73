//! On-disk lifecycle of session directories.
//!
//! ```text
//! <working_dir>/
//!     <session_id>/
//!         session.json        {identity, created_at, archived}
//!         endpoints.json      (see endpoints)
//!         events/000000.log   (see event_log)
//!     .deleting-<uuid>/       renamed aside, being removed
//! <archive_dir>/
//!     <session_id>-<yyyymmddHHMMSS>/   same layout, archived = true
//!     .staging-<uuid>/                 archive under construction
//! ```
//!
//! Destructive operations on one path are serialized by a per-path lock.
//! Deletion renames the tree aside first, so other observers see the live
//! path either intact or gone, never half removed.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::copy;
use super::endpoints::ENDPOINTS_FILE;
use super::event_log::{self, EventLog, LogError};
use crate::config::{ArchiveFilter, LogConfig};
use crate::event::SessionIdentity;

/// Metadata file inside every session directory.
pub const METADATA_FILE: &str = "session.json";

const DELETING_PREFIX: &str = ".deleting-";
const STAGING_PREFIX: &str = ".staging-";

/// Repository errors.
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("session already exists: {0}")]
    AlreadyExists(String),
    #[error("session not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("invalid session metadata at {}: {source}", path.display())]
    Metadata {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("repository I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Log(#[from] LogError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SessionMetadata {
    identity: SessionIdentity,
    created_at: DateTime<Utc>,
    archived: bool,
}

/// A session directory and what its metadata says about it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDirectoryRecord {
    pub path: PathBuf,
    pub identity: SessionIdentity,
    pub created_at: DateTime<Utc>,
    pub archived: bool,
}

impl SessionDirectoryRecord {
    pub fn events_dir(&self) -> PathBuf {
        event_log::events_dir(&self.path)
    }
}

/// Result of `archive_and_delete`. Archive failure does not stop deletion.
#[derive(Debug)]
pub struct ArchiveOutcome {
    pub archive_path: Option<PathBuf>,
    pub archive_error: Option<RepositoryError>,
    /// The live directory is gone
    pub deleted: bool,
}

/// Creates, lists, archives, restores and deletes session directories.
pub struct SessionRepository {
    working_dir: PathBuf,
    archive_dir: PathBuf,
    log_config: LogConfig,
    create_lock: Mutex<()>,
    path_locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl SessionRepository {
    /// Open the repository, creating both roots and sweeping leftovers of
    /// interrupted deletes and archives.
    pub fn open(
        working_dir: impl Into<PathBuf>,
        archive_dir: impl Into<PathBuf>,
        log_config: LogConfig,
    ) -> Result<Self, RepositoryError> {
        let repo = Self {
            working_dir: working_dir.into(),
            archive_dir: archive_dir.into(),
            log_config,
            create_lock: Mutex::new(()),
            path_locks: Mutex::new(HashMap::new()),
        };
        fs::create_dir_all(&repo.working_dir)?;
        fs::create_dir_all(&repo.archive_dir)?;
        repo.sweep_leftovers(&repo.working_dir, DELETING_PREFIX);
        repo.sweep_leftovers(&repo.archive_dir, STAGING_PREFIX);
        Ok(repo)
    }

    fn sweep_leftovers(&self, root: &Path, prefix: &str) {
        let Ok(entries) = fs::read_dir(root) else {
            return;
        };
        for entry in entries.flatten() {
            if entry.file_name().to_string_lossy().starts_with(prefix) {
                let path = entry.path();
                match fs::remove_dir_all(&path) {
                    Ok(()) => log::info!("Removed leftover {}", path.display()),
                    Err(e) => log::warn!("Failed to remove leftover {}: {e}", path.display()),
                }
            }
        }
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub fn archive_dir(&self) -> &Path {
        &self.archive_dir
    }

    pub fn log_config(&self) -> &LogConfig {
        &self.log_config
    }

    /// Live directory for a session id.
    pub fn session_path(&self, session_id: Uuid) -> PathBuf {
        self.working_dir.join(session_id.to_string())
    }

    /// Run `op` holding the lock for `path`. The lock entry is dropped
    /// again once no other caller holds or waits for it.
    fn with_path_lock<T>(&self, path: &Path, op: impl FnOnce() -> T) -> T {
        let lock = self
            .path_locks
            .lock()
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let result = {
            let _guard = lock.lock();
            op()
        };

        let mut locks = self.path_locks.lock();
        // Clones are only handed out under this map lock: the map and `lock`
        // being the sole owners means nobody else can be waiting
        if Arc::strong_count(&lock) == 2 {
            locks.remove(path);
        }
        result
    }

    /// Allocate a fresh directory for `identity`.
    ///
    /// Fails with `AlreadyExists` if the id or the friendly name is taken
    /// by a live session.
    pub fn create_session(
        &self,
        identity: &SessionIdentity,
    ) -> Result<SessionDirectoryRecord, RepositoryError> {
        let _guard = self.create_lock.lock();

        let path = self.session_path(identity.session_id);
        if path.exists() {
            return Err(RepositoryError::AlreadyExists(identity.session_id.to_string()));
        }
        if self
            .list_sessions()?
            .iter()
            .any(|record| record.identity.friendly_name == identity.friendly_name)
        {
            return Err(RepositoryError::AlreadyExists(identity.friendly_name.clone()));
        }

        fs::create_dir_all(event_log::events_dir(&path))?;
        let record = SessionDirectoryRecord {
            path,
            identity: identity.clone(),
            created_at: Utc::now(),
            archived: false,
        };
        if let Err(e) = write_metadata(&record) {
            let _ = fs::remove_dir_all(&record.path);
            return Err(e);
        }

        log::info!(
            "Created session {} '{}' (role '{}') at {}",
            identity.session_id,
            identity.friendly_name,
            identity.role,
            record.path.display()
        );
        Ok(record)
    }

    /// Read the metadata record of a session or archive directory.
    pub fn load_record(&self, path: &Path) -> Result<SessionDirectoryRecord, RepositoryError> {
        read_record(path)
    }

    /// Live sessions, oldest first.
    pub fn list_sessions(&self) -> Result<Vec<SessionDirectoryRecord>, RepositoryError> {
        list_records(&self.working_dir)
    }

    /// Archived sessions, oldest first.
    pub fn list_archives(&self) -> Result<Vec<SessionDirectoryRecord>, RepositoryError> {
        list_records(&self.archive_dir)
    }

    /// Copy the events of the session at `path` that pass `filter` into a
    /// new archive directory. Returns the archive path.
    pub fn archive(&self, path: &Path, filter: &ArchiveFilter) -> Result<PathBuf, RepositoryError> {
        self.with_path_lock(path, || self.archive_locked(path, filter))
    }

    fn archive_locked(&self, path: &Path, filter: &ArchiveFilter) -> Result<PathBuf, RepositoryError> {
        let record = read_record(path)?;
        let staging = self.archive_dir.join(format!("{STAGING_PREFIX}{}", Uuid::new_v4()));
        fs::create_dir_all(event_log::events_dir(&staging))?;

        let result = self
            .fill_archive(&record, &staging, filter)
            .and_then(|()| {
                let archived = SessionDirectoryRecord {
                    path: staging.clone(),
                    archived: true,
                    ..record.clone()
                };
                write_metadata(&archived)
            })
            .and_then(|()| {
                let dest = self.unique_archive_path(&record.identity);
                fs::rename(&staging, &dest)?;
                Ok(dest)
            });

        match result {
            Ok(dest) => {
                log::info!(
                    "Archived session {} to {}",
                    record.identity.session_id,
                    dest.display()
                );
                Ok(dest)
            }
            Err(e) => {
                let _ = fs::remove_dir_all(&staging);
                Err(e)
            }
        }
    }

    fn fill_archive(
        &self,
        record: &SessionDirectoryRecord,
        staging: &Path,
        filter: &ArchiveFilter,
    ) -> Result<(), RepositoryError> {
        copy_endpoint_table(&record.path, staging)?;
        let dest_events = event_log::events_dir(staging);
        if filter.is_all() {
            return copy_segments(&record.events_dir(), &dest_events);
        }

        let source = EventLog::open_read_only(record.events_dir(), self.log_config.clone())?;
        let mut dest = EventLog::open(dest_events, self.log_config.clone())?;
        let mut kept = 0usize;
        for item in source.read_from(source.first_retained())? {
            match item {
                Ok(event) if filter.matches(&event) => {
                    dest.append_sequenced(&event)?;
                    kept += 1;
                }
                Ok(_) => {}
                Err(LogError::CorruptEntry { sequence, reason }) => {
                    log::warn!("Archive skips corrupt entry {sequence}: {reason}");
                }
                Err(e) => return Err(e.into()),
            }
        }
        dest.flush()?;
        log::debug!("Filtered archive kept {kept} of {} events", source.len());
        Ok(())
    }

    fn unique_archive_path(&self, identity: &SessionIdentity) -> PathBuf {
        let stamp = Utc::now().format("%Y%m%d%H%M%S");
        let base = format!("{}-{stamp}", identity.session_id);
        let mut candidate = self.archive_dir.join(&base);
        let mut n = 1;
        while candidate.exists() {
            candidate = self.archive_dir.join(format!("{base}-{n}"));
            n += 1;
        }
        candidate
    }

    /// Archive the session, then delete its live directory.
    ///
    /// Deletion runs even when archiving fails; the failure is reported in
    /// the outcome.
    pub fn archive_and_delete(&self, path: &Path, filter: &ArchiveFilter) -> ArchiveOutcome {
        self.with_path_lock(path, || {
            let (archive_path, archive_error) = match self.archive_locked(path, filter) {
                Ok(dest) => (Some(dest), None),
                Err(e) => {
                    log::warn!("Archiving {} failed, deleting anyway: {e}", path.display());
                    (None, Some(e))
                }
            };
            let deleted = self.delete_locked(path);
            ArchiveOutcome {
                archive_path,
                archive_error,
                deleted,
            }
        })
    }

    /// Delete a session tree. True if the path is absent afterwards.
    pub fn delete_session_tree(&self, path: &Path) -> bool {
        self.with_path_lock(path, || self.delete_locked(path))
    }

    fn delete_locked(&self, path: &Path) -> bool {
        if !path.exists() {
            return true;
        }

        let parent = path.parent().unwrap_or(&self.working_dir);
        let aside = parent.join(format!("{DELETING_PREFIX}{}", Uuid::new_v4()));
        let target = match fs::rename(path, &aside) {
            Ok(()) => aside,
            Err(e) => {
                log::warn!(
                    "Could not move {} aside ({e}); deleting in place",
                    path.display()
                );
                path.to_path_buf()
            }
        };

        match fs::remove_dir_all(&target) {
            Ok(()) => {
                log::info!("Deleted session directory {}", path.display());
                true
            }
            Err(e) => {
                log::warn!("Failed to delete {}: {e}", target.display());
                !path.exists()
            }
        }
    }

    /// Bring an archive back as a new live session under `identity`.
    ///
    /// Events are renumbered densely from 1 so the restored log has no gaps.
    pub fn restore_archive(
        &self,
        archive_path: &Path,
        identity: &SessionIdentity,
    ) -> Result<SessionDirectoryRecord, RepositoryError> {
        let archive = read_record(archive_path)?;
        let record = self.create_session(identity)?;

        let copied = self
            .copy_renumbered(&archive.events_dir(), &record.events_dir())
            .and_then(|count| {
                copy_endpoint_table(&archive.path, &record.path)?;
                Ok(count)
            });
        match copied {
            Ok(count) => {
                log::info!(
                    "Restored {count} events from {} into session {}",
                    archive_path.display(),
                    identity.session_id
                );
                Ok(record)
            }
            Err(e) => {
                self.delete_session_tree(&record.path);
                Err(e)
            }
        }
    }

    fn copy_renumbered(&self, from: &Path, to: &Path) -> Result<u64, RepositoryError> {
        let source = EventLog::open_read_only(from, self.log_config.clone())?;
        let mut dest = EventLog::open(to, self.log_config.clone())?;
        let mut next = 1;
        for item in source.read_from(source.first_retained())? {
            match item {
                Ok(mut event) => {
                    event.sequence = next;
                    dest.append_sequenced(&event)?;
                    next += 1;
                }
                Err(LogError::CorruptEntry { sequence, reason }) => {
                    log::warn!("Restore skips corrupt archived entry {sequence}: {reason}");
                }
                Err(e) => return Err(e.into()),
            }
        }
        dest.flush()?;
        Ok(next - 1)
    }
}

fn write_metadata(record: &SessionDirectoryRecord) -> Result<(), RepositoryError> {
    let metadata = SessionMetadata {
        identity: record.identity.clone(),
        created_at: record.created_at,
        archived: record.archived,
    };
    let path = record.path.join(METADATA_FILE);
    let bytes = serde_json::to_vec_pretty(&metadata).map_err(|source| RepositoryError::Metadata {
        path: path.clone(),
        source,
    })?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, &path)?;
    Ok(())
}

fn read_record(path: &Path) -> Result<SessionDirectoryRecord, RepositoryError> {
    let meta_path = path.join(METADATA_FILE);
    let bytes = match fs::read(&meta_path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(RepositoryError::NotFound(path.to_path_buf()));
        }
        Err(e) => return Err(e.into()),
    };
    let metadata: SessionMetadata =
        serde_json::from_slice(&bytes).map_err(|source| RepositoryError::Metadata {
            path: meta_path,
            source,
        })?;
    Ok(SessionDirectoryRecord {
        path: path.to_path_buf(),
        identity: metadata.identity,
        created_at: metadata.created_at,
        archived: metadata.archived,
    })
}

fn list_records(root: &Path) -> Result<Vec<SessionDirectoryRecord>, RepositoryError> {
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut records = Vec::new();
    for entry in entries {
        let entry = entry?;
        if entry.file_name().to_string_lossy().starts_with('.') || !entry.file_type()?.is_dir() {
            continue;
        }
        match read_record(&entry.path()) {
            Ok(record) => records.push(record),
            Err(e) => log::warn!("Skipping {}: {e}", entry.path().display()),
        }
    }
    records.sort_by_key(|record| record.created_at);
    Ok(records)
}

fn copy_endpoint_table(src_dir: &Path, dst_dir: &Path) -> Result<(), RepositoryError> {
    let src = src_dir.join(ENDPOINTS_FILE);
    if src.is_file() {
        copy::copy_file(&src, &dst_dir.join(ENDPOINTS_FILE))?;
    }
    Ok(())
}

fn copy_segments(src: &Path, dst: &Path) -> Result<(), RepositoryError> {
    fs::create_dir_all(dst)?;
    let entries = match fs::read_dir(src) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            copy::copy_file(&entry.path(), &dst.join(entry.file_name()))?;
        }
    }
    Ok(())
}
