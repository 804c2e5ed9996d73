//! # concert-sync: multi-user session synchronization core
//!
//! Every client of a session applies the same events in the same order.
//! The server assigns each event a sequence number, persists it, then fans
//! it out; late joiners and reconnecting clients catch up by replay.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────┐   Connection   ┌───────────────┐
//! │ SessionClient │ ◄────────────► │ SessionServer │
//! │ (per user)    │  Binary Proto  │ (context)     │
//! └───────┬───────┘                └───────┬───────┘
//!         │                                │
//!         ▼                                ▼
//! ┌───────────────┐                ┌───────────────┐     ┌──────────────┐
//! │ ClientSession │                │ Session       │ ──► │ EventLog     │
//! │ (seq. guard)  │                │ (one lock)    │     │ (segments)   │
//! └───────────────┘                └───────┬───────┘     └──────────────┘
//!                                          │
//!                                  ┌───────┴────────┐
//!                                  │ BroadcastGroup │
//!                                  │ (per-endpoint  │
//!                                  │  delivery)     │
//!                                  └────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - Binary wire protocol (bincode-encoded SessionMessage)
//! - [`event`] - Session events and identities
//! - [`config`] - TOML configuration
//! - [`storage`] - Event log, session repository, blob store
//! - [`broadcast`] - Replay/live reconciliation and fan-out
//! - [`session`] - The per-session ordering point
//! - [`server`] - Session server context and WebSocket listener
//! - [`transport`] - Connections over WebSocket or in-process links
//! - [`client`] - Client session proxy with offline queue

pub mod broadcast;
pub mod client;
pub mod config;
pub mod event;
pub mod protocol;
pub mod server;
pub mod session;
pub mod storage;
pub mod transport;

// Re-exports for convenience
pub use broadcast::{BroadcastGroup, BroadcastStats, Delivery, DeliveryQueue, JoinTicket};
pub use client::{
    Checkpoint, ClientError, ClientEvent, ClientSession, ClientState, LocalChange, OfflineQueue,
    PendingSequence, SessionClient,
};
pub use config::{ArchiveFilter, ClientConfig, ConfigError, LogConfig, RolePolicy, ServerConfig};
pub use event::{
    ConnectionActivity, EndpointRegistration, EndpointState, EventKind, EventPayload, FileHandle,
    LockActivity, PackageRef, PendingEvent, SequenceNumber, SessionEvent, SessionFlags,
    SessionIdentity,
};
pub use protocol::{MessageType, ProtocolError, SessionMessage};
pub use server::{ServerError, ServerStats, SessionServer, ShutdownReport};
pub use session::{PurgeReport, Session, SessionError, SessionStats};
pub use storage::{
    ArchiveOutcome, BlobError, EndpointInfo, EndpointTable, EventLog, FileSharing, LocalBlobStore,
    LogError, RepositoryError, SessionDirectoryRecord, SessionRepository,
};
pub use transport::{Connection, Connector, LocalConnector, WsConnector};
