//! Session data model.
//!
//! ```text
//! PendingEvent ──(Session: assign sequence, timestamp, revision)──► SessionEvent
//!                                                                   │
//!                         EventPayload::Inline(bytes) ◄─────────────┤
//!                         EventPayload::File(FileHandle) ◄──────────┘
//!                               │
//!                               └── bytes live in the file sharing side-channel
//! ```
//!
//! A `SessionEvent` is immutable once the Session has stamped it with a
//! sequence number. Clients never assign sequence numbers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Server-assigned position of an event in a session's total order.
///
/// Starts at 1; 0 means "nothing applied yet".
pub type SequenceNumber = u64;

/// Immutable identity of a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionIdentity {
    pub session_id: Uuid,
    /// Role name; selects `SessionFlags` and server-side policy.
    pub role: String,
    pub friendly_name: String,
}

impl SessionIdentity {
    pub fn new(role: impl Into<String>, friendly_name: impl Into<String>) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            role: role.into(),
            friendly_name: friendly_name.into(),
        }
    }

    /// Create with an explicit session id (for restore and tests).
    pub fn with_id(
        session_id: Uuid,
        role: impl Into<String>,
        friendly_name: impl Into<String>,
    ) -> Self {
        Self {
            session_id,
            role: role.into(),
            friendly_name: friendly_name.into(),
        }
    }
}

/// Feature sets enabled for a session, chosen by its role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionFlags {
    pub transactions: bool,
    pub packages: bool,
    pub locks: bool,
    /// Allow `EventPayload::File` handles in submitted events.
    pub file_sharing: bool,
    /// Append a `Connection` event whenever an endpoint joins or leaves.
    pub record_connection_events: bool,
}

impl Default for SessionFlags {
    fn default() -> Self {
        Self {
            transactions: true,
            packages: true,
            locks: true,
            file_sharing: true,
            record_connection_events: false,
        }
    }
}

impl SessionFlags {
    /// Whether clients may submit events of this kind.
    ///
    /// `Connection` events are produced by the Session itself.
    pub fn allows(&self, kind: EventKind) -> bool {
        match kind {
            EventKind::Connection => false,
            EventKind::Lock => self.locks,
            EventKind::Transaction => self.transactions,
            EventKind::Package => self.packages,
        }
    }
}

/// What an event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum EventKind {
    /// Endpoint joined or left
    Connection = 1,
    /// Object lock acquired or released
    Lock = 2,
    /// Object modification
    Transaction = 3,
    /// Package state (saved asset blob)
    Package = 4,
}

/// Content-addressed reference to bytes held by the file sharing side-channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileHandle {
    /// Lowercase hex SHA-256 of the content
    pub digest: String,
    pub size: u64,
}

/// Event body: small payloads travel inline, large ones by handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventPayload {
    Inline(Vec<u8>),
    File(FileHandle),
}

impl EventPayload {
    /// Logical size of the payload in bytes.
    pub fn size(&self) -> u64 {
        match self {
            EventPayload::Inline(bytes) => bytes.len() as u64,
            EventPayload::File(handle) => handle.size,
        }
    }

    pub fn as_inline(&self) -> Option<&[u8]> {
        match self {
            EventPayload::Inline(bytes) => Some(bytes),
            EventPayload::File(_) => None,
        }
    }

    pub fn file_handle(&self) -> Option<&FileHandle> {
        match self {
            EventPayload::File(handle) => Some(handle),
            EventPayload::Inline(_) => None,
        }
    }
}

/// Package name plus a revision.
///
/// On a `Package` event it is the revision the event creates. On a
/// `Transaction` that names a package it is the revision the transaction
/// was applied on top of.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PackageRef {
    pub name: String,
    pub revision: u64,
}

/// A sequenced, immutable session event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionEvent {
    pub sequence: SequenceNumber,
    pub origin_endpoint_id: Uuid,
    /// Client-generated id of the submission that produced this event
    pub submission_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
    /// Set for `Package` events and for transactions naming a package
    pub package: Option<PackageRef>,
    pub payload: EventPayload,
}

impl SessionEvent {
    pub fn encode(&self) -> Result<Vec<u8>, bincode::error::EncodeError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::error::DecodeError> {
        let (event, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())?;
        Ok(event)
    }
}

/// An event that has not been sequenced yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingEvent {
    pub origin_endpoint_id: Uuid,
    pub submission_id: Uuid,
    pub kind: EventKind,
    /// Required for `Package` events, optional for transactions
    pub package_name: Option<String>,
    pub payload: EventPayload,
}

impl PendingEvent {
    pub fn new(origin_endpoint_id: Uuid, kind: EventKind, payload: EventPayload) -> Self {
        Self {
            origin_endpoint_id,
            submission_id: Uuid::new_v4(),
            kind,
            package_name: None,
            payload,
        }
    }

    /// Inline transaction event (the common case).
    pub fn transaction(origin_endpoint_id: Uuid, bytes: impl Into<Vec<u8>>) -> Self {
        Self::new(
            origin_endpoint_id,
            EventKind::Transaction,
            EventPayload::Inline(bytes.into()),
        )
    }

    /// Package event; the store assigns the next revision of `name`.
    pub fn package(origin_endpoint_id: Uuid, name: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            origin_endpoint_id,
            submission_id: Uuid::new_v4(),
            kind: EventKind::Package,
            package_name: Some(name.into()),
            payload,
        }
    }

    /// Tie a transaction to the package it modifies.
    pub fn with_package_name(mut self, name: impl Into<String>) -> Self {
        self.package_name = Some(name.into());
        self
    }

    pub fn with_submission_id(mut self, submission_id: Uuid) -> Self {
        self.submission_id = submission_id;
        self
    }

    /// Stamp the event. Only the event log calls this.
    pub(crate) fn into_event(
        self,
        sequence: SequenceNumber,
        timestamp: DateTime<Utc>,
        package: Option<PackageRef>,
    ) -> SessionEvent {
        SessionEvent {
            sequence,
            origin_endpoint_id: self.origin_endpoint_id,
            submission_id: self.submission_id,
            timestamp,
            kind: self.kind,
            package,
            payload: self.payload,
        }
    }
}

/// Body of a `Connection` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionActivity {
    pub endpoint_id: Uuid,
    pub display_name: String,
    pub connected: bool,
}

impl ConnectionActivity {
    pub fn encode(&self) -> Result<Vec<u8>, bincode::error::EncodeError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .ok()
            .map(|(activity, _)| activity)
    }
}

/// Body of a `Lock` event: resources taken or released together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockActivity {
    pub acquired: bool,
    /// Object or package paths
    pub resources: Vec<String>,
}

impl LockActivity {
    pub fn acquire(resources: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            acquired: true,
            resources: resources.into_iter().map(Into::into).collect(),
        }
    }

    pub fn release(resources: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            acquired: false,
            resources: resources.into_iter().map(Into::into).collect(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, bincode::error::EncodeError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::error::DecodeError> {
        let (activity, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())?;
        Ok(activity)
    }
}

/// Server-side state of a registered endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndpointState {
    /// Replay in flight; receives only its replay stream plus queued live events
    Joining,
    /// Caught up; receives live broadcasts
    Synchronized,
    /// Transport lost; registration retained for the grace period
    Disconnected,
}

/// Snapshot of an endpoint registration owned by a Session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointRegistration {
    pub endpoint_id: Uuid,
    pub display_name: String,
    pub state: EndpointState,
    pub last_acked: SequenceNumber,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_default_excludes_connection_kind() {
        let flags = SessionFlags::default();
        assert!(flags.allows(EventKind::Transaction));
        assert!(flags.allows(EventKind::Package));
        assert!(flags.allows(EventKind::Lock));
        assert!(!flags.allows(EventKind::Connection));
        assert!(!flags.record_connection_events);
    }

    #[test]
    fn test_flags_disable_packages() {
        let flags = SessionFlags {
            packages: false,
            ..SessionFlags::default()
        };
        assert!(!flags.allows(EventKind::Package));
        assert!(flags.allows(EventKind::Transaction));
    }

    #[test]
    fn test_pending_into_event_keeps_submission() {
        let origin = Uuid::new_v4();
        let pending = PendingEvent::transaction(origin, b"move".to_vec());
        let submission_id = pending.submission_id;
        let now = Utc::now();

        let event = pending.into_event(7, now, None);
        assert_eq!(event.sequence, 7);
        assert_eq!(event.origin_endpoint_id, origin);
        assert_eq!(event.submission_id, submission_id);
        assert_eq!(event.timestamp, now);
        assert_eq!(event.payload.as_inline(), Some(&b"move"[..]));
    }

    #[test]
    fn test_event_codec_preserves_file_handle() {
        let handle = FileHandle {
            digest: "ab".repeat(32),
            size: 10 * 1024 * 1024,
        };
        let event = PendingEvent::package(Uuid::new_v4(), "/Game/Map", EventPayload::File(handle.clone()))
            .into_event(
                3,
                Utc::now(),
                Some(PackageRef {
                    name: "/Game/Map".into(),
                    revision: 2,
                }),
            );

        let decoded = SessionEvent::decode(&event.encode().unwrap()).unwrap();
        assert_eq!(decoded, event);
        assert_eq!(decoded.payload.file_handle(), Some(&handle));
        assert_eq!(decoded.payload.size(), 10 * 1024 * 1024);
    }

    #[test]
    fn test_connection_activity_decode_garbage() {
        assert!(ConnectionActivity::decode(&[0xFF, 0xFF, 0xFF]).is_none());
        let activity = ConnectionActivity {
            endpoint_id: Uuid::new_v4(),
            display_name: "Alice".into(),
            connected: true,
        };
        assert_eq!(ConnectionActivity::decode(&activity.encode().unwrap()), Some(activity));
    }

    #[test]
    fn test_lock_activity_codec() {
        let activity = LockActivity::acquire(["/Game/Map.Cube1", "/Game/Map.Light"]);
        assert!(activity.acquired);
        let decoded = LockActivity::decode(&activity.encode().unwrap()).unwrap();
        assert_eq!(decoded, activity);
        assert!(!LockActivity::release(["/Game/Map.Cube1"]).acquired);
    }

    #[test]
    fn test_pending_transaction_names_package() {
        let pending = PendingEvent::transaction(Uuid::new_v4(), b"move".to_vec()).with_package_name("/Game/Map");
        assert_eq!(pending.kind, EventKind::Transaction);
        assert_eq!(pending.package_name.as_deref(), Some("/Game/Map"));
    }
}
