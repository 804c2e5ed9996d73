//! Session server: the context object that owns every live session.
//!
//! Architecture:
//! ```text
//! Client A ──┐                         ┌── Session (id 1) ── EventLog
//!            ├── serve_connection ─────┤        └── BroadcastGroup
//! Client B ──┘   (one task per conn)   └── Session (id 2) ── ...
//!
//! SessionServer
//!   ├── SessionRepository   create / archive / delete directories
//!   ├── LocalBlobStore      file sharing side-channel
//!   ├── sessions map        id → Arc<Session>
//!   └── heartbeat task      purge stale endpoints, retry halted sessions
//! ```
//!
//! There is no global state: tests run several servers in one process.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use tokio::net::TcpListener;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::{ConfigError, ServerConfig};
use crate::event::SessionIdentity;
use crate::protocol::{MessageType, ProtocolError, SessionMessage, SubmitRejected};
use crate::session::{Session, SessionError};
use crate::storage::{BlobError, LocalBlobStore, RepositoryError, SessionRepository};
use crate::transport::{self, Connection, LocalConnector};

/// Server errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Blob(#[from] BlobError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("server I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unknown session {0}")]
    UnknownSession(Uuid),
    #[error("background task failed: {0}")]
    Task(String),
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_sessions: usize,
    pub events_appended: u64,
}

#[derive(Default)]
struct AtomicServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    total_messages: AtomicU64,
    total_bytes: AtomicU64,
    events_appended: AtomicU64,
}

/// What happened to a session's directory on shutdown.
#[derive(Debug)]
pub struct ShutdownReport {
    pub session_id: Uuid,
    pub archive_path: Option<std::path::PathBuf>,
    /// Archiving failed; the directory was deleted regardless
    pub archive_error: Option<RepositoryError>,
    pub deleted: bool,
}

/// The session server context.
pub struct SessionServer {
    config: ServerConfig,
    repository: Arc<SessionRepository>,
    blobs: Arc<LocalBlobStore>,
    sessions: RwLock<HashMap<Uuid, Arc<Session>>>,
    stats: AtomicServerStats,
}

impl SessionServer {
    /// Validate the configuration and open the repository and blob store.
    pub fn open(config: ServerConfig) -> Result<Arc<Self>, ServerError> {
        config.validate()?;
        let repository = SessionRepository::open(
            &config.working_dir,
            &config.archive_dir,
            config.log.clone(),
        )?;
        let blobs = LocalBlobStore::open(&config.blob_dir)?;
        Ok(Arc::new(Self {
            config,
            repository: Arc::new(repository),
            blobs: Arc::new(blobs),
            sessions: RwLock::new(HashMap::new()),
            stats: AtomicServerStats::default(),
        }))
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn repository(&self) -> &Arc<SessionRepository> {
        &self.repository
    }

    /// The file sharing side-channel served next to the sessions.
    pub fn blob_store(&self) -> Arc<LocalBlobStore> {
        self.blobs.clone()
    }

    /// Load every live session directory found on disk.
    pub async fn recover(&self) -> Result<usize, ServerError> {
        let records = self.repository.list_sessions()?;
        let mut sessions = self.sessions.write().await;
        let mut recovered = 0;

        for record in &records {
            if sessions.contains_key(&record.identity.session_id) {
                continue;
            }
            let policy = self.config.role_policy(&record.identity.role).clone();
            match Session::open(record, policy, self.config.log.clone()) {
                Ok(session) => {
                    sessions.insert(session.id(), session);
                    recovered += 1;
                }
                Err(e) => log::warn!("Failed to recover session at {}: {e}", record.path.display()),
            }
        }

        log::info!("Recovery complete: {recovered}/{} sessions restored", records.len());
        Ok(recovered)
    }

    /// Create a new session for `role`.
    pub async fn create_session(
        &self,
        friendly_name: &str,
        role: &str,
    ) -> Result<Arc<Session>, ServerError> {
        self.create_session_with(SessionIdentity::new(role, friendly_name)).await
    }

    /// Create a session with a caller-chosen identity.
    pub async fn create_session_with(&self, identity: SessionIdentity) -> Result<Arc<Session>, ServerError> {
        let repository = self.repository.clone();
        let record = tokio::task::spawn_blocking(move || repository.create_session(&identity))
            .await
            .map_err(|e| ServerError::Task(e.to_string()))??;
        self.activate(&record).await
    }

    /// Bring an archive back as a new live session.
    pub async fn restore_archive(
        &self,
        archive_path: &Path,
        identity: SessionIdentity,
    ) -> Result<Arc<Session>, ServerError> {
        let repository = self.repository.clone();
        let archive_path = archive_path.to_path_buf();
        let record = tokio::task::spawn_blocking(move || repository.restore_archive(&archive_path, &identity))
            .await
            .map_err(|e| ServerError::Task(e.to_string()))??;
        self.activate(&record).await
    }

    async fn activate(&self, record: &crate::storage::SessionDirectoryRecord) -> Result<Arc<Session>, ServerError> {
        let policy = self.config.role_policy(&record.identity.role).clone();
        let session = Session::open(record, policy, self.config.log.clone())?;
        self.sessions.write().await.insert(session.id(), session.clone());
        Ok(session)
    }

    pub async fn session(&self, session_id: Uuid) -> Option<Arc<Session>> {
        self.sessions.read().await.get(&session_id).cloned()
    }

    pub async fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.read().await.values().cloned().collect()
    }

    /// Shut a session down and archive and/or delete its directory.
    ///
    /// `archive = None` follows the role's `auto_archive` policy. An archive
    /// failure is reported in the result and does not prevent deletion.
    pub async fn shutdown_session(
        &self,
        session_id: Uuid,
        archive: Option<bool>,
    ) -> Result<ShutdownReport, ServerError> {
        let session = self
            .sessions
            .write()
            .await
            .remove(&session_id)
            .ok_or(ServerError::UnknownSession(session_id))?;
        session.shutdown().await?;

        let archive = archive.unwrap_or(session.policy().auto_archive);
        let filter = session.policy().archive_filter.clone();
        let path = session.path().to_path_buf();
        let repository = self.repository.clone();

        let report = tokio::task::spawn_blocking(move || {
            if archive {
                let outcome = repository.archive_and_delete(&path, &filter);
                ShutdownReport {
                    session_id,
                    archive_path: outcome.archive_path,
                    archive_error: outcome.archive_error,
                    deleted: outcome.deleted,
                }
            } else {
                ShutdownReport {
                    session_id,
                    archive_path: None,
                    archive_error: None,
                    deleted: repository.delete_session_tree(&path),
                }
            }
        })
        .await
        .map_err(|e| ServerError::Task(e.to_string()))?;

        if let Some(e) = &report.archive_error {
            log::warn!("Session {session_id} deleted without a complete archive: {e}");
        }
        Ok(report)
    }

    /// Close every session, keeping directories for the next `recover`.
    pub async fn close_all(&self) {
        let sessions: Vec<_> = self.sessions.write().await.drain().map(|(_, s)| s).collect();
        for session in sessions {
            if let Err(e) = session.shutdown().await {
                log::warn!("Failed to close session {}: {e}", session.id());
            }
        }
    }

    pub async fn stats(&self) -> ServerStats {
        ServerStats {
            total_connections: self.stats.total_connections.load(Ordering::Relaxed),
            active_connections: self.stats.active_connections.load(Ordering::Relaxed),
            total_messages: self.stats.total_messages.load(Ordering::Relaxed),
            total_bytes: self.stats.total_bytes.load(Ordering::Relaxed),
            active_sessions: self.sessions.read().await.len(),
            events_appended: self.stats.events_appended.load(Ordering::Relaxed),
        }
    }

    /// In-process connector whose links are served by this server.
    pub fn local_connector(self: &Arc<Self>) -> LocalConnector {
        let server = Arc::downgrade(self);
        LocalConnector::new(move |connection| {
            if let Some(server) = server.upgrade() {
                tokio::spawn(server.serve_connection(connection, "local".to_string()));
            }
        })
    }

    /// Bind the WebSocket listener.
    pub async fn bind(&self) -> Result<TcpListener, ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Session server listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Accept WebSocket connections forever.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<(), ServerError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let server = self.clone();
            tokio::spawn(async move {
                match tokio_tungstenite::accept_async(stream).await {
                    Ok(ws) => {
                        let connection = transport::spawn_websocket(ws, addr.to_string());
                        server.serve_connection(connection, addr.to_string()).await;
                    }
                    Err(e) => log::warn!("WebSocket handshake with {addr} failed: {e}"),
                }
            });
        }
    }

    /// Recover, start the heartbeat task and serve on the configured address.
    pub async fn run(self: Arc<Self>) -> Result<(), ServerError> {
        let recovered = self.recover().await?;
        if recovered > 0 {
            log::info!("Recovered {recovered} sessions from {}", self.config.working_dir.display());
        }
        let listener = self.bind().await?;
        let heartbeat = self.spawn_heartbeat();
        let result = self.serve(listener).await;
        heartbeat.abort();
        result
    }

    /// Periodically purge stale endpoints and retry halted sessions.
    ///
    /// The task holds a weak reference and ends once the server is dropped.
    pub fn spawn_heartbeat(self: &Arc<Self>) -> JoinHandle<()> {
        let server: Weak<Self> = Arc::downgrade(self);
        let interval = self.config.heartbeat_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(server) = server.upgrade() else {
                    break;
                };
                server.heartbeat_tick(Instant::now()).await;
            }
        })
    }

    /// One heartbeat pass over every session.
    pub async fn heartbeat_tick(&self, now: Instant) {
        let timeout = self.config.heartbeat_timeout();
        let grace = self.config.disconnect_grace();
        for session in self.sessions().await {
            if session.is_halted().await {
                session.recover().await;
            }
            let report = session.purge_stale(now, timeout, grace).await;
            if !report.disconnected.is_empty() || !report.purged.is_empty() {
                log::debug!(
                    "Session {}: {} timed out, {} purged",
                    session.id(),
                    report.disconnected.len(),
                    report.purged.len()
                );
            }
        }
    }

    /// Drive one client connection until it closes.
    pub async fn serve_connection(self: Arc<Self>, connection: Connection, peer: String) {
        self.stats.total_connections.fetch_add(1, Ordering::Relaxed);
        self.stats.active_connections.fetch_add(1, Ordering::Relaxed);
        log::info!("Connection established from {peer}");

        let Connection {
            outgoing,
            mut incoming,
        } = connection;
        let mut link = ConnectionLink {
            outgoing,
            joined: None,
            outbox: None,
        };

        loop {
            tokio::select! {
                msg = incoming.recv() => {
                    let Some(msg) = msg else {
                        log::info!("Connection closed from {peer}");
                        break;
                    };
                    self.stats.total_messages.fetch_add(1, Ordering::Relaxed);
                    self.stats.total_bytes.fetch_add(msg.payload.len() as u64, Ordering::Relaxed);
                    if !self.handle_message(&mut link, msg).await {
                        break;
                    }
                }

                msg = async {
                    match link.outbox.as_mut() {
                        Some(rx) => rx.recv().await,
                        None => std::future::pending().await,
                    }
                } => {
                    match msg {
                        Some(msg) => {
                            if link.outgoing.send(msg).is_err() {
                                break;
                            }
                        }
                        None => {
                            // Session dropped this endpoint (halt, shutdown, timeout)
                            log::info!("Session released {peer}; closing connection");
                            break;
                        }
                    }
                }
            }
        }

        if let Some(joined) = link.joined.take() {
            let _ = joined.session.detach(joined.endpoint_id, joined.generation).await;
        }
        self.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    /// Returns false when the connection should close.
    async fn handle_message(&self, link: &mut ConnectionLink, msg: SessionMessage) -> bool {
        match msg.msg_type {
            MessageType::JoinRequest => self.handle_join(link, msg).await,

            MessageType::SubmitEvent => {
                let Some(Joined {
                    session,
                    endpoint_id,
                    generation,
                }) = link.joined.clone()
                else {
                    log::debug!("Submit before join from {}", msg.endpoint_id);
                    return true;
                };
                let submission = match msg.submission() {
                    Ok(submission) => submission,
                    Err(e) => {
                        log::warn!("Bad submission from {endpoint_id}: {e}");
                        return true;
                    }
                };
                let submission_id = submission.submission_id;
                match session.submit(endpoint_id, generation, submission).await {
                    Ok(_) => {
                        self.stats.events_appended.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        log::debug!("Rejected submission {submission_id} from {endpoint_id}: {e}");
                        let rejected = SubmitRejected {
                            submission_id,
                            reason: e.to_string(),
                        };
                        match SessionMessage::submit_rejected(endpoint_id, session.id(), &rejected) {
                            Ok(reply) => {
                                let _ = link.outgoing.send(reply);
                            }
                            Err(e) => log::warn!("Failed to encode rejection of {submission_id}: {e}"),
                        }
                    }
                }
                true
            }

            MessageType::Heartbeat => {
                let Some(Joined {
                    session,
                    endpoint_id,
                    ..
                }) = link.joined.clone()
                else {
                    return true;
                };
                let reply = match session.heartbeat(endpoint_id, msg.sequence).await {
                    Ok(tail) => SessionMessage::heartbeat_ack(endpoint_id, session.id(), tail),
                    Err(e) => SessionMessage::resync_required(endpoint_id, session.id(), 0, &e.to_string()),
                };
                link.outgoing.send(reply).is_ok()
            }

            MessageType::Leave => {
                if let Some(joined) = link.joined.take() {
                    let _ = joined.session.detach(joined.endpoint_id, joined.generation).await;
                }
                link.outbox = None;
                true
            }

            other => {
                log::debug!("Unhandled message type from client: {other:?}");
                true
            }
        }
    }

    async fn handle_join(&self, link: &mut ConnectionLink, msg: SessionMessage) -> bool {
        let reject = |reason: &str| {
            log::info!("Rejected join of {} to {}: {reason}", msg.endpoint_id, msg.session_id);
            link.outgoing
                .send(SessionMessage::join_rejected(msg.endpoint_id, msg.session_id, reason))
                .is_ok()
        };

        if link.joined.is_some() {
            return reject("connection already joined a session");
        }
        let request = match msg.join_request_payload() {
            Ok(request) => request,
            Err(e) => return reject(&e.to_string()),
        };
        let Some(session) = self.session(msg.session_id).await else {
            return reject("unknown session");
        };
        if !request.role.is_empty() && request.role != session.identity().role {
            return reject(&format!(
                "role '{}' does not match session role '{}'",
                request.role,
                session.identity().role
            ));
        }

        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
        match session
            .join(msg.endpoint_id, &request.display_name, msg.sequence, outbox_tx)
            .await
        {
            Ok(ticket) => {
                link.joined = Some(Joined {
                    session,
                    endpoint_id: msg.endpoint_id,
                    generation: ticket.generation,
                });
                link.outbox = Some(outbox_rx);
                true
            }
            Err(e) => reject(&e.to_string()),
        }
    }
}

#[derive(Clone)]
struct Joined {
    session: Arc<Session>,
    endpoint_id: Uuid,
    generation: u64,
}

struct ConnectionLink {
    outgoing: mpsc::UnboundedSender<SessionMessage>,
    joined: Option<Joined>,
    outbox: Option<mpsc::UnboundedReceiver<SessionMessage>>,
}
