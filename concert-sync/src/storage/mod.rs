//! Persistent storage layer for sessions.
//!
//! ```text
//! ┌─────────────┐  append / read_from  ┌──────────────┐
//! │ Session     │ ───────────────────► │ EventLog     │  events/<segment>.log
//! └──────┬──────┘                      └──────────────┘
//!        │ shutdown
//!        ▼
//! ┌───────────────────┐  archive / delete  ┌──────────────────────┐
//! │ SessionRepository │ ─────────────────► │ <archive_dir>/<id>-… │
//! └───────────────────┘                    └──────────────────────┘
//!
//! FileSharing (LocalBlobStore): large payload bytes, content addressed
//! EndpointTable: endpoints.json, everyone who ever joined
//! ```

pub mod blob;
pub mod copy;
pub mod endpoints;
pub mod event_log;
pub mod record;
pub mod repository;

pub use blob::{content_digest, BlobError, FileSharing, LocalBlobStore};
pub use copy::{copy_bytes, copy_file, COPY_BLOCK_SIZE};
pub use endpoints::{EndpointInfo, EndpointTable, EndpointTableError, ENDPOINTS_FILE};
pub use event_log::{EventLog, LogError, ReplayIter};
pub use record::RecordError;
pub use repository::{ArchiveOutcome, RepositoryError, SessionDirectoryRecord, SessionRepository};
