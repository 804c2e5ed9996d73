//! Client session proxy.
//!
//! Two layers:
//! - [`ClientSession`]: the sequencing state machine. Pure and synchronous;
//!   it turns server messages into [`ClientOutput`]s and enforces that
//!   events are applied exactly once, in sequence order.
//! - [`SessionClient`]: the async driver. Owns the connection, heartbeats,
//!   reconnect backoff, the checkpoint file and the file sharing side-channel.
//!
//! A local change is never applied when it is submitted. It is applied when
//! the server acknowledges it with its sequence number, through the same
//! ordered path as everyone else's events.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::ClientConfig;
use crate::event::{EventKind, EventPayload, SequenceNumber, SessionEvent, SessionFlags};
use crate::protocol::{JoinRequest, MessageType, ProtocolError, SessionMessage, Submission};
use crate::storage::{BlobError, FileSharing};
use crate::transport::{Connection, Connector};

/// Heartbeat intervals of silence before the connection is presumed lost.
const HEARTBEAT_MISSES: u32 = 3;

/// Client errors.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("sequencing violation: expected {expected}, got {got}")]
    Sequencing {
        expected: SequenceNumber,
        got: SequenceNumber,
    },
    #[error("replay ended at {through} but only {applied} was applied")]
    ReplayIncomplete {
        through: SequenceNumber,
        applied: SequenceNumber,
    },
    #[error("acknowledgement for unknown submission {0}")]
    UnknownSubmission(Uuid),
    #[error("join rejected: {0}")]
    JoinRejected(String),
    #[error("submission rejected: {0}")]
    SubmitRejected(String),
    #[error("offline queue full ({0} changes)")]
    QueueFull(usize),
    #[error("failed to access checkpoint {path}: {source}")]
    Checkpoint {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid checkpoint {path}: {source}")]
    CheckpointFormat {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Blob(#[from] BlobError),
    #[error("client task failed: {0}")]
    Task(String),
    #[error("client is closed")]
    Closed,
}

impl ClientError {
    /// Violations that are repaired by rejoining from the last good checkpoint.
    pub fn requires_resync(&self) -> bool {
        matches!(
            self,
            ClientError::Sequencing { .. }
                | ClientError::ReplayIncomplete { .. }
                | ClientError::UnknownSubmission(_)
        )
    }
}

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    /// Joined; replay in progress
    Joining,
    Synchronized,
    Reconnecting,
}

/// Events emitted by the client.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    StateChanged(ClientState),
    /// An event was applied. `content` holds the inline bytes or the bytes
    /// fetched through the file sharing side-channel.
    Applied {
        event: SessionEvent,
        content: Vec<u8>,
    },
    /// The sequence number was consumed but its event could not be applied
    ApplyFailed {
        sequence: SequenceNumber,
        reason: String,
    },
    SubmitRejected {
        submission_id: Uuid,
        reason: String,
    },
    JoinRejected(String),
}

/// What the state machine wants done after a message.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientOutput {
    Send(SessionMessage),
    Apply(SessionEvent),
    Skipped {
        sequence: SequenceNumber,
        reason: String,
    },
    /// A local submission was sequenced
    Resolved {
        submission_id: Uuid,
        sequence: SequenceNumber,
    },
    Rejected {
        submission_id: Uuid,
        reason: String,
    },
    ResyncRequired {
        tail: SequenceNumber,
        reason: String,
    },
    JoinRejected(String),
    /// The server closed the session for this endpoint
    Released,
}

/// Offline queue for changes made while not synchronized.
///
/// Queued submissions are sent once replay completes.
pub struct OfflineQueue {
    queue: VecDeque<Submission>,
    max_size: usize,
}

impl OfflineQueue {
    /// Create a new offline queue with max capacity.
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Queue a submission for later. Returns false when full.
    pub fn enqueue(&mut self, submission: Submission) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back(submission);
        true
    }

    /// Drain queued submissions in submission order.
    pub fn drain(&mut self) -> Vec<Submission> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.max_size
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    /// Total logical payload bytes queued.
    pub fn total_bytes(&self) -> u64 {
        self.queue.iter().map(|s| s.payload.size()).sum()
    }

    fn ids(&self) -> impl Iterator<Item = Uuid> + '_ {
        self.queue.iter().map(|s| s.submission_id)
    }
}

/// Persisted `{session_id, last_applied}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub session_id: Uuid,
    pub last_applied: SequenceNumber,
}

impl Checkpoint {
    /// Load a checkpoint; a missing file is `None`.
    pub fn load(path: &Path) -> Result<Option<Self>, ClientError> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(ClientError::Checkpoint {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| ClientError::CheckpointFormat {
                path: path.to_path_buf(),
                source,
            })
    }

    /// Write via a temporary file and rename.
    pub fn store(&self, path: &Path) -> Result<(), ClientError> {
        let io_err = |source| ClientError::Checkpoint {
            path: path.to_path_buf(),
            source,
        };
        let json = serde_json::to_vec(self).map_err(|source| ClientError::CheckpointFormat {
            path: path.to_path_buf(),
            source,
        })?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, json).map_err(io_err)?;
        std::fs::rename(&tmp, path).map_err(io_err)
    }
}

/// Sequencing state machine of one client endpoint.
pub struct ClientSession {
    endpoint_id: Uuid,
    session_id: Uuid,
    state: ClientState,
    last_applied: SequenceNumber,
    server_tail: SequenceNumber,
    flags: Option<SessionFlags>,
    /// Sent, not yet sequenced, in send order
    in_flight: VecDeque<Submission>,
    offline: OfflineQueue,
}

impl ClientSession {
    pub fn new(
        endpoint_id: Uuid,
        session_id: Uuid,
        last_applied: SequenceNumber,
        queue_capacity: usize,
    ) -> Self {
        Self {
            endpoint_id,
            session_id,
            state: ClientState::Disconnected,
            last_applied,
            server_tail: 0,
            flags: None,
            in_flight: VecDeque::new(),
            offline: OfflineQueue::new(queue_capacity),
        }
    }

    pub fn endpoint_id(&self) -> Uuid {
        self.endpoint_id
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn set_state(&mut self, state: ClientState) {
        self.state = state;
    }

    pub fn last_applied(&self) -> SequenceNumber {
        self.last_applied
    }

    /// Tail reported by the last JoinAccepted / HeartbeatAck.
    pub fn server_tail(&self) -> SequenceNumber {
        self.server_tail
    }

    /// Flags granted by the server at join.
    pub fn flags(&self) -> Option<SessionFlags> {
        self.flags
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn queued_len(&self) -> usize {
        self.offline.len()
    }

    /// Build the join request carrying the checkpoint; enters `Joining`.
    pub fn join_request(&mut self, display_name: &str, role: &str) -> Result<SessionMessage, ClientError> {
        let msg = SessionMessage::join_request(
            self.endpoint_id,
            self.session_id,
            self.last_applied,
            &JoinRequest {
                display_name: display_name.to_string(),
                role: role.to_string(),
            },
        )?;
        self.state = ClientState::Joining;
        Ok(msg)
    }

    pub fn heartbeat(&self) -> SessionMessage {
        SessionMessage::heartbeat(self.endpoint_id, self.session_id, self.last_applied)
    }

    pub fn leave_message(&self) -> SessionMessage {
        SessionMessage::leave(self.endpoint_id, self.session_id)
    }

    /// Submit a local change.
    ///
    /// Returns the message to send when synchronized; otherwise the change
    /// is queued until replay completes.
    pub fn submit(&mut self, submission: Submission) -> Result<Option<SessionMessage>, ClientError> {
        if self.state == ClientState::Synchronized {
            let msg = SessionMessage::submit(self.endpoint_id, self.session_id, &submission)?;
            self.in_flight.push_back(submission);
            return Ok(Some(msg));
        }
        if !self.offline.enqueue(submission) {
            return Err(ClientError::QueueFull(self.offline.capacity()));
        }
        Ok(None)
    }

    /// The transport went away. In-flight submissions are kept: the next
    /// replay either resolves them or they are sent again.
    pub fn connection_lost(&mut self) {
        if matches!(self.state, ClientState::Joining | ClientState::Synchronized) {
            self.state = ClientState::Disconnected;
        }
    }

    /// Forget every unresolved submission; returns their ids.
    pub fn abandon(&mut self) -> Vec<Uuid> {
        let mut ids: Vec<Uuid> = self.in_flight.drain(..).map(|s| s.submission_id).collect();
        ids.extend(self.offline.ids());
        self.offline.clear();
        ids
    }

    /// Process one server message.
    ///
    /// On error nothing was applied and the caller must rejoin from
    /// `last_applied`.
    pub fn handle(&mut self, msg: SessionMessage) -> Result<Vec<ClientOutput>, ClientError> {
        if msg.session_id != self.session_id {
            log::debug!("Ignoring {:?} for foreign session {}", msg.msg_type, msg.session_id);
            return Ok(Vec::new());
        }

        let mut out = Vec::new();
        match msg.msg_type {
            MessageType::JoinAccepted => {
                let accepted = msg.join_accepted_payload()?;
                let expected = self.last_applied + 1;
                if accepted.replay_from != expected {
                    return Err(ClientError::Sequencing {
                        expected,
                        got: accepted.replay_from,
                    });
                }
                self.flags = Some(accepted.flags);
                self.server_tail = msg.sequence;
                log::info!(
                    "Joined session {} at tail {}, replaying from {}",
                    self.session_id,
                    msg.sequence,
                    accepted.replay_from
                );
            }

            MessageType::JoinRejected => {
                self.state = ClientState::Disconnected;
                out.push(ClientOutput::JoinRejected(msg.reason()));
            }

            MessageType::ReplayEvent | MessageType::Event => {
                let event = msg.session_event()?;
                self.check_next(event.sequence)?;
                self.last_applied = event.sequence;
                let resolved = self.resolve(event.submission_id, event.origin_endpoint_id);
                let sequence = event.sequence;
                out.push(ClientOutput::Apply(event));
                if let Some(submission_id) = resolved {
                    out.push(ClientOutput::Resolved {
                        submission_id,
                        sequence,
                    });
                }
            }

            MessageType::SubmitAck => {
                let ack = msg.submit_ack_payload()?;
                let Some(position) = self
                    .in_flight
                    .iter()
                    .position(|s| s.submission_id == ack.submission_id)
                else {
                    return Err(ClientError::UnknownSubmission(ack.submission_id));
                };
                self.check_next(msg.sequence)?;
                let Some(submission) = self.in_flight.remove(position) else {
                    return Err(ClientError::UnknownSubmission(ack.submission_id));
                };
                self.last_applied = msg.sequence;
                out.push(ClientOutput::Apply(SessionEvent {
                    sequence: msg.sequence,
                    origin_endpoint_id: self.endpoint_id,
                    submission_id: submission.submission_id,
                    timestamp: ack.timestamp,
                    kind: submission.kind,
                    package: ack.package,
                    payload: submission.payload,
                }));
                out.push(ClientOutput::Resolved {
                    submission_id: submission.submission_id,
                    sequence: msg.sequence,
                });
            }

            MessageType::SubmitRejected => {
                let rejected = msg.submit_rejected_payload()?;
                self.in_flight.retain(|s| s.submission_id != rejected.submission_id);
                out.push(ClientOutput::Rejected {
                    submission_id: rejected.submission_id,
                    reason: rejected.reason,
                });
            }

            MessageType::ReplaySkipped => {
                self.check_next(msg.sequence)?;
                self.last_applied = msg.sequence;
                out.push(ClientOutput::Skipped {
                    sequence: msg.sequence,
                    reason: msg.reason(),
                });
            }

            MessageType::ReplayComplete => {
                if msg.sequence != self.last_applied {
                    return Err(ClientError::ReplayIncomplete {
                        through: msg.sequence,
                        applied: self.last_applied,
                    });
                }
                self.state = ClientState::Synchronized;

                // Unresolved submissions were never sequenced: send them again
                // ahead of anything queued while offline.
                let queued = self.offline.drain();
                if !queued.is_empty() {
                    log::info!("Sending {} queued changes", queued.len());
                }
                self.in_flight.extend(queued);
                for submission in &self.in_flight {
                    out.push(ClientOutput::Send(SessionMessage::submit(
                        self.endpoint_id,
                        self.session_id,
                        submission,
                    )?));
                }
            }

            MessageType::HeartbeatAck => {
                self.server_tail = msg.sequence;
            }

            MessageType::ResyncRequired => {
                self.state = ClientState::Disconnected;
                out.push(ClientOutput::ResyncRequired {
                    tail: msg.sequence,
                    reason: msg.reason(),
                });
            }

            MessageType::Leave => {
                self.state = ClientState::Disconnected;
                out.push(ClientOutput::Released);
            }

            other => log::debug!("Unexpected {other:?} from server"),
        }
        Ok(out)
    }

    fn check_next(&self, sequence: SequenceNumber) -> Result<(), ClientError> {
        let expected = self.last_applied + 1;
        if sequence != expected {
            log::warn!(
                "Session {}: expected sequence {expected}, got {sequence}",
                self.session_id
            );
            return Err(ClientError::Sequencing {
                expected,
                got: sequence,
            });
        }
        Ok(())
    }

    /// Resolve an own in-flight submission seen in the history.
    fn resolve(&mut self, submission_id: Uuid, origin: Uuid) -> Option<Uuid> {
        if origin != self.endpoint_id {
            return None;
        }
        let position = self
            .in_flight
            .iter()
            .position(|s| s.submission_id == submission_id)?;
        self.in_flight.remove(position).map(|s| s.submission_id)
    }
}

/// A local change to submit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalChange {
    pub kind: EventKind,
    pub package_name: Option<String>,
    pub bytes: Vec<u8>,
}

impl LocalChange {
    pub fn transaction(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: EventKind::Transaction,
            package_name: None,
            bytes: bytes.into(),
        }
    }

    pub fn lock(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: EventKind::Lock,
            package_name: None,
            bytes: bytes.into(),
        }
    }

    pub fn package(name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: EventKind::Package,
            package_name: Some(name.into()),
            bytes: bytes.into(),
        }
    }
}

type Reply = oneshot::Sender<Result<SequenceNumber, ClientError>>;

/// Sequence number of a submitted change, available once the server
/// sequences it.
pub struct PendingSequence {
    rx: oneshot::Receiver<Result<SequenceNumber, ClientError>>,
}

impl PendingSequence {
    pub async fn wait(self) -> Result<SequenceNumber, ClientError> {
        self.rx.await.map_err(|_| ClientError::Closed)?
    }
}

enum Command {
    Submit { change: LocalChange, reply: Reply },
    Disconnect,
}

/// Async client session proxy.
pub struct SessionClient {
    endpoint_id: Uuid,
    session_id: Uuid,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ClientState>,
    last_applied: Arc<AtomicU64>,
    event_rx: Option<mpsc::UnboundedReceiver<ClientEvent>>,
    task: JoinHandle<Result<(), ClientError>>,
}

impl SessionClient {
    /// Start connecting in the background.
    ///
    /// The checkpoint at `config.checkpoint_path` is loaded first; a
    /// checkpoint for a different session is ignored.
    pub fn connect(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
        files: Option<Arc<dyn FileSharing>>,
    ) -> Result<Self, ClientError> {
        let last_applied = match &config.checkpoint_path {
            Some(path) => match Checkpoint::load(path)? {
                Some(checkpoint) if checkpoint.session_id == config.session_id => checkpoint.last_applied,
                Some(checkpoint) => {
                    log::warn!(
                        "Ignoring checkpoint for session {} (joining {})",
                        checkpoint.session_id,
                        config.session_id
                    );
                    0
                }
                None => 0,
            },
            None => 0,
        };

        let session = ClientSession::new(
            config.endpoint_id,
            config.session_id,
            last_applied,
            config.offline_queue_capacity,
        );
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ClientState::Disconnected);
        let last_applied = Arc::new(AtomicU64::new(last_applied));

        let driver = Driver {
            connector,
            files,
            session,
            commands: command_rx,
            events: event_tx,
            state: state_tx,
            last_applied: last_applied.clone(),
            replies: HashMap::new(),
            attempt: 0,
            config: config.clone(),
        };
        let task = tokio::spawn(driver.run());

        Ok(Self {
            endpoint_id: config.endpoint_id,
            session_id: config.session_id,
            commands: command_tx,
            state: state_rx,
            last_applied,
            event_rx: Some(event_rx),
            task,
        })
    }

    pub fn endpoint_id(&self) -> Uuid {
        self.endpoint_id
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn state(&self) -> ClientState {
        *self.state.borrow()
    }

    pub fn last_applied(&self) -> SequenceNumber {
        self.last_applied.load(Ordering::SeqCst)
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::UnboundedReceiver<ClientEvent>> {
        self.event_rx.take()
    }

    /// Wait until the client reaches `state`.
    pub async fn wait_for_state(&self, state: ClientState) -> Result<(), ClientError> {
        let mut rx = self.state.clone();
        rx.wait_for(|current| *current == state)
            .await
            .map(|_| ())
            .map_err(|_| ClientError::Closed)
    }

    /// Submit a local change. It is applied once sequenced.
    pub fn submit(&self, change: LocalChange) -> Result<PendingSequence, ClientError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Submit { change, reply })
            .map_err(|_| ClientError::Closed)?;
        Ok(PendingSequence { rx })
    }

    /// Leave the session and stop the background task.
    pub async fn disconnect(self) -> Result<(), ClientError> {
        let _ = self.commands.send(Command::Disconnect);
        self.task.await.map_err(|e| ClientError::Task(e.to_string()))?
    }
}

enum Exit {
    Lost,
    Stop,
    Rejected(String),
}

struct Driver {
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    files: Option<Arc<dyn FileSharing>>,
    session: ClientSession,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<ClientEvent>,
    state: watch::Sender<ClientState>,
    last_applied: Arc<AtomicU64>,
    replies: HashMap<Uuid, Reply>,
    attempt: u32,
}

impl Driver {
    async fn run(mut self) -> Result<(), ClientError> {
        let result = loop {
            let connecting = if self.attempt == 0 {
                ClientState::Connecting
            } else {
                ClientState::Reconnecting
            };
            self.session.set_state(connecting);
            self.publish_state();

            let connected = self.connector.connect().await;
            let exit = match connected {
                Ok(connection) => self.drive(connection).await,
                Err(e) => {
                    log::debug!("Connect attempt {} failed: {e}", self.attempt + 1);
                    Exit::Lost
                }
            };

            match exit {
                Exit::Stop => break Ok(()),
                Exit::Rejected(reason) => break Err(ClientError::JoinRejected(reason)),
                Exit::Lost => {
                    self.session.connection_lost();
                    self.publish_state();
                    let delay = self.config.reconnect_backoff(self.attempt);
                    self.attempt = self.attempt.saturating_add(1);
                    if !self.idle(delay).await {
                        break Ok(());
                    }
                }
            }
        };

        for submission_id in self.session.abandon() {
            if let Some(reply) = self.replies.remove(&submission_id) {
                let _ = reply.send(Err(ClientError::Closed));
            }
        }
        self.session.set_state(ClientState::Disconnected);
        self.publish_state();
        result
    }

    /// Wait out a backoff delay, queueing submissions meanwhile.
    /// Returns false when the client should stop.
    async fn idle(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Submit { change, reply }) => self.submit(change, reply, None).await,
                    Some(Command::Disconnect) | None => return false,
                },
            }
        }
    }

    async fn drive(&mut self, mut connection: Connection) -> Exit {
        let join = match self
            .session
            .join_request(&self.config.display_name, &self.config.role)
        {
            Ok(join) => join,
            Err(e) => return Exit::Rejected(e.to_string()),
        };
        self.publish_state();
        if connection.send(join).is_err() {
            return Exit::Lost;
        }

        let interval = self.config.heartbeat_interval();
        let silence_limit = interval * HEARTBEAT_MISSES;
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        let mut last_heard = Instant::now();

        loop {
            tokio::select! {
                msg = connection.incoming.recv() => {
                    let Some(msg) = msg else {
                        log::info!("Connection to session {} lost", self.session.session_id());
                        return Exit::Lost;
                    };
                    last_heard = Instant::now();
                    if let Some(exit) = self.on_message(msg, &connection).await {
                        return exit;
                    }
                }

                cmd = self.commands.recv() => match cmd {
                    Some(Command::Submit { change, reply }) => {
                        self.submit(change, reply, Some(&connection)).await;
                    }
                    Some(Command::Disconnect) | None => {
                        let _ = connection.send(self.session.leave_message());
                        return Exit::Stop;
                    }
                },

                _ = ticker.tick() => {
                    if last_heard.elapsed() > silence_limit {
                        log::warn!(
                            "No traffic from session {} for {:?}; reconnecting",
                            self.session.session_id(),
                            last_heard.elapsed()
                        );
                        return Exit::Lost;
                    }
                    let _ = connection.send(self.session.heartbeat());
                }
            }
        }
    }

    async fn on_message(&mut self, msg: SessionMessage, connection: &Connection) -> Option<Exit> {
        let outputs = match self.session.handle(msg) {
            Ok(outputs) => outputs,
            Err(e) if e.requires_resync() => {
                log::warn!(
                    "Rejoining session {} from {}: {e}",
                    self.session.session_id(),
                    self.session.last_applied()
                );
                return Some(Exit::Lost);
            }
            Err(e) => {
                log::warn!("Ignoring malformed message: {e}");
                return None;
            }
        };

        let mut exit = None;
        for output in outputs {
            match output {
                ClientOutput::Send(msg) => {
                    let _ = connection.send(msg);
                }
                ClientOutput::Apply(event) => self.apply(event).await,
                ClientOutput::Skipped { sequence, reason } => {
                    self.checkpoint(sequence);
                    self.emit(ClientEvent::ApplyFailed { sequence, reason });
                }
                ClientOutput::Resolved {
                    submission_id,
                    sequence,
                } => {
                    if let Some(reply) = self.replies.remove(&submission_id) {
                        let _ = reply.send(Ok(sequence));
                    }
                }
                ClientOutput::Rejected {
                    submission_id,
                    reason,
                } => {
                    if let Some(reply) = self.replies.remove(&submission_id) {
                        let _ = reply.send(Err(ClientError::SubmitRejected(reason.clone())));
                    }
                    self.emit(ClientEvent::SubmitRejected {
                        submission_id,
                        reason,
                    });
                }
                ClientOutput::ResyncRequired { tail, reason } => {
                    log::warn!(
                        "Server requested resync of session {} at tail {tail}: {reason}",
                        self.session.session_id()
                    );
                    exit = Some(Exit::Lost);
                }
                ClientOutput::JoinRejected(reason) => {
                    log::warn!("Join to session {} rejected: {reason}", self.session.session_id());
                    self.emit(ClientEvent::JoinRejected(reason.clone()));
                    exit = Some(Exit::Rejected(reason));
                }
                ClientOutput::Released => exit = Some(Exit::Lost),
            }
        }
        self.publish_state();
        exit
    }

    async fn apply(&mut self, event: SessionEvent) {
        let sequence = event.sequence;
        let materialized = self.materialize(&event.payload).await;
        self.checkpoint(sequence);
        match materialized {
            Ok(content) => self.emit(ClientEvent::Applied { event, content }),
            Err(e) => {
                log::warn!("Failed to apply event {sequence}: {e}");
                self.emit(ClientEvent::ApplyFailed {
                    sequence,
                    reason: e.to_string(),
                });
            }
        }
    }

    async fn materialize(&self, payload: &EventPayload) -> Result<Vec<u8>, ClientError> {
        match payload {
            EventPayload::Inline(bytes) => Ok(bytes.clone()),
            EventPayload::File(handle) => {
                let Some(files) = self.files.clone() else {
                    return Err(BlobError::NotFound(handle.digest.clone()).into());
                };
                let handle = handle.clone();
                let bytes = tokio::task::spawn_blocking(move || files.get_blob(&handle))
                    .await
                    .map_err(|e| ClientError::Task(e.to_string()))??;
                Ok(bytes)
            }
        }
    }

    async fn prepare_payload(&self, bytes: Vec<u8>) -> Result<EventPayload, ClientError> {
        let sharing = self.session.flags().map_or(true, |flags| flags.file_sharing);
        match &self.files {
            Some(files) if sharing && bytes.len() > self.config.inline_payload_limit => {
                let files = files.clone();
                let handle = tokio::task::spawn_blocking(move || files.put_blob(&bytes))
                    .await
                    .map_err(|e| ClientError::Task(e.to_string()))??;
                log::debug!("Shared {} bytes as {}", handle.size, handle.digest);
                Ok(EventPayload::File(handle))
            }
            _ => Ok(EventPayload::Inline(bytes)),
        }
    }

    async fn submit(&mut self, change: LocalChange, reply: Reply, connection: Option<&Connection>) {
        let payload = match self.prepare_payload(change.bytes).await {
            Ok(payload) => payload,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };
        let submission = Submission {
            submission_id: Uuid::new_v4(),
            kind: change.kind,
            package_name: change.package_name,
            payload,
        };
        let submission_id = submission.submission_id;

        match self.session.submit(submission) {
            Ok(Some(msg)) => {
                if let Some(connection) = connection {
                    let _ = connection.send(msg);
                }
            }
            Ok(None) => log::debug!("Queued submission {submission_id} until synchronized"),
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        }
        self.replies.insert(submission_id, reply);
    }

    fn checkpoint(&self, sequence: SequenceNumber) {
        self.last_applied.store(sequence, Ordering::SeqCst);
        let Some(path) = &self.config.checkpoint_path else {
            return;
        };
        let checkpoint = Checkpoint {
            session_id: self.session.session_id(),
            last_applied: sequence,
        };
        if let Err(e) = checkpoint.store(path) {
            log::warn!("Failed to persist checkpoint: {e}");
        }
    }

    fn publish_state(&mut self) {
        let state = self.session.state();
        if state == ClientState::Synchronized {
            self.attempt = 0;
        }
        let changed = self.state.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            *current = state;
            true
        });
        if changed {
            log::debug!("Client {} is {state:?}", self.session.endpoint_id());
            self.emit(ClientEvent::StateChanged(state));
        }
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }
}
