//! Persisted table of every endpoint that joined a session.
//!
//! Lives next to the event log as `endpoints.json` and survives restarts,
//! archive and restore. The in-memory registrations of a `Session` come and
//! go with connections; this table only grows.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// File name inside the session directory.
pub const ENDPOINTS_FILE: &str = "endpoints.json";

#[derive(Debug, thiserror::Error)]
pub enum EndpointTableError {
    #[error("endpoint table I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid endpoint table {}: {source}", path.display())]
    Format {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// What is remembered about one endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointInfo {
    pub endpoint_id: Uuid,
    pub display_name: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

pub struct EndpointTable {
    path: PathBuf,
    entries: BTreeMap<Uuid, EndpointInfo>,
}

impl EndpointTable {
    /// Load the table of the session stored in `session_dir`.
    ///
    /// A missing file is an empty table.
    pub fn open(session_dir: &Path) -> Result<Self, EndpointTableError> {
        let path = session_dir.join(ENDPOINTS_FILE);
        let entries = match fs::read(&path) {
            Ok(bytes) => {
                let list: Vec<EndpointInfo> =
                    serde_json::from_slice(&bytes).map_err(|source| EndpointTableError::Format {
                        path: path.clone(),
                        source,
                    })?;
                list.into_iter().map(|info| (info.endpoint_id, info)).collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self { path, entries })
    }

    /// Record that `endpoint_id` was seen as `display_name` at `now`.
    pub fn set(
        &mut self,
        endpoint_id: Uuid,
        display_name: &str,
        now: DateTime<Utc>,
    ) -> Result<(), EndpointTableError> {
        let previous = self.entries.insert(
            endpoint_id,
            EndpointInfo {
                endpoint_id,
                display_name: display_name.to_string(),
                first_seen: now,
                last_seen: now,
            },
        );
        if let (Some(previous), Some(info)) = (previous, self.entries.get_mut(&endpoint_id)) {
            info.first_seen = previous.first_seen;
        }
        self.store()
    }

    pub fn get(&self, endpoint_id: Uuid) -> Option<&EndpointInfo> {
        self.entries.get(&endpoint_id)
    }

    /// Every known endpoint, ordered by id.
    pub fn list(&self) -> Vec<EndpointInfo> {
        self.entries.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn store(&self) -> Result<(), EndpointTableError> {
        let list: Vec<&EndpointInfo> = self.entries.values().collect();
        let bytes = serde_json::to_vec_pretty(&list).map_err(|source| EndpointTableError::Format {
            path: self.path.clone(),
            source,
        })?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let table = EndpointTable::open(dir.path()).unwrap();
        assert!(table.is_empty());
        assert!(table.get(Uuid::new_v4()).is_none());
    }

    #[test]
    fn test_set_keeps_first_seen_and_persists() {
        let dir = tempdir().unwrap();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let start = Utc::now();
        let later = start + Duration::seconds(30);
        {
            let mut table = EndpointTable::open(dir.path()).unwrap();
            table.set(alice, "Alice", start).unwrap();
            table.set(bob, "Bob", start).unwrap();
            table.set(alice, "Alice (laptop)", later).unwrap();
        }

        let table = EndpointTable::open(dir.path()).unwrap();
        assert_eq!(table.len(), 2);
        let info = table.get(alice).unwrap();
        assert_eq!(info.display_name, "Alice (laptop)");
        assert_eq!(info.first_seen, start);
        assert_eq!(info.last_seen, later);

        let mut ids: Vec<_> = table.list().into_iter().map(|info| info.endpoint_id).collect();
        let mut expected = vec![alice, bob];
        ids.sort();
        expected.sort();
        assert_eq!(ids, expected);
        assert!(!dir.path().join("endpoints.json.tmp").exists());
    }

    #[test]
    fn test_garbage_file_reported() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(ENDPOINTS_FILE), b"{ not a list").unwrap();
        assert!(matches!(
            EndpointTable::open(dir.path()),
            Err(EndpointTableError::Format { .. })
        ));
    }
}
