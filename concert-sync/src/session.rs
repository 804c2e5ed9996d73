//! Server-side aggregate for one collaboration session.
//!
//! A `Session` owns the event log and the broadcast group behind a single
//! per-session lock. "Assign sequence number, append, broadcast" happens in
//! one critical section, so the order clients observe is the order on disk.
//!
//! Endpoint lifecycle:
//! ```text
//! Unregistered ──join──► Joining ──replay reaches tail──► Synchronized
//!                           │                                  │
//!                           └──────leave / loss / stale────────┤
//!                                                              ▼
//!                          rejoin ◄──────────────────── Disconnected ──grace──► purged
//! ```
//!
//! Replay runs in its own task. It reads the log snapshot without the lock
//! and takes the lock only to push a batch into the endpoint's delivery
//! queue, so a long replay never stalls submissions.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

use crate::broadcast::{AtomicBroadcastStats, BroadcastGroup, Delivery, JoinTicket, Outbox};
use crate::config::{LogConfig, RolePolicy};
use crate::event::{
    ConnectionActivity, EndpointRegistration, EndpointState, EventKind, EventPayload, PackageRef,
    PendingEvent, SequenceNumber, SessionEvent, SessionFlags, SessionIdentity,
};
use crate::protocol::{JoinAccepted, ProtocolError, SessionMessage, SubmitAck, Submission};
use crate::storage::{
    EndpointInfo, EndpointTable, EndpointTableError, EventLog, LogError, ReplayIter,
    SessionDirectoryRecord,
};

/// Events read from disk per lock acquisition during replay.
const REPLAY_BATCH: usize = 64;

/// Session errors.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session {0} is shut down")]
    Closed(Uuid),
    #[error("session {0} halted after a persistence failure")]
    Halted(Uuid),
    #[error("endpoint {0} is not joined")]
    EndpointUnreachable(Uuid),
    #[error("join {generation} of endpoint {endpoint_id} was superseded")]
    StaleJoin { endpoint_id: Uuid, generation: u64 },
    #[error("{0:?} events are disabled for this session")]
    FeatureDisabled(EventKind),
    #[error("checkpoint {checkpoint} is ahead of the session tail {tail}")]
    CheckpointAhead {
        checkpoint: SequenceNumber,
        tail: SequenceNumber,
    },
    #[error("history before {first_retained} is no longer retained (requested {requested})")]
    HistoryUnavailable {
        requested: SequenceNumber,
        first_retained: SequenceNumber,
    },
    #[error(transparent)]
    Log(#[from] LogError),
    #[error(transparent)]
    Endpoints(#[from] EndpointTableError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Endpoints affected by one `purge_stale` pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PurgeReport {
    /// Connected endpoints that missed their heartbeats
    pub disconnected: Vec<Uuid>,
    /// Disconnected registrations past the grace period
    pub purged: Vec<Uuid>,
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStats {
    pub tail: SequenceNumber,
    pub connected_endpoints: usize,
    pub registered_endpoints: usize,
    pub events_appended: u64,
    pub messages_sent: u64,
    pub duplicates_dropped: u64,
    pub halted: bool,
}

struct SessionState {
    log: EventLog,
    endpoints: EndpointTable,
    group: BroadcastGroup,
    halted: bool,
    closed: bool,
}

/// One live collaboration session.
pub struct Session {
    identity: SessionIdentity,
    policy: RolePolicy,
    path: PathBuf,
    log_config: LogConfig,
    state: Mutex<SessionState>,
    broadcast_stats: Arc<AtomicBroadcastStats>,
    events_appended: AtomicU64,
}

impl Session {
    /// Open the session stored at `record`, loading its event log.
    pub fn open(
        record: &SessionDirectoryRecord,
        policy: RolePolicy,
        log_config: LogConfig,
    ) -> Result<Arc<Self>, SessionError> {
        let log = EventLog::open(record.events_dir(), log_config.clone())?;
        let endpoints = EndpointTable::open(&record.path)?;
        let group = BroadcastGroup::new(record.identity.session_id);
        let broadcast_stats = group.stats_handle();

        log::info!(
            "Opened session {} '{}' at tail {}",
            record.identity.session_id,
            record.identity.friendly_name,
            log.tail()
        );
        Ok(Arc::new(Self {
            identity: record.identity.clone(),
            policy,
            path: record.path.clone(),
            log_config,
            state: Mutex::new(SessionState {
                log,
                endpoints,
                group,
                halted: false,
                closed: false,
            }),
            broadcast_stats,
            events_appended: AtomicU64::new(0),
        }))
    }

    pub fn id(&self) -> Uuid {
        self.identity.session_id
    }

    pub fn identity(&self) -> &SessionIdentity {
        &self.identity
    }

    pub fn flags(&self) -> SessionFlags {
        self.policy.flags
    }

    pub fn policy(&self) -> &RolePolicy {
        &self.policy
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Register an endpoint and schedule its replay.
    ///
    /// `checkpoint` is the last sequence number the client applied (0 if
    /// none); replay starts right after it. Joining again with the same
    /// endpoint id replaces the previous registration in place.
    pub async fn join(
        self: &Arc<Self>,
        endpoint_id: Uuid,
        display_name: &str,
        checkpoint: SequenceNumber,
        outbox: Outbox,
    ) -> Result<JoinTicket, SessionError> {
        let mut state = self.state.lock().await;
        self.ensure_open(&state)?;

        let tail = state.log.tail();
        if checkpoint > tail {
            return Err(SessionError::CheckpointAhead { checkpoint, tail });
        }
        let replay_from = checkpoint + 1;
        let replay = match state.log.read_from(replay_from) {
            Ok(iter) => iter,
            Err(LogError::NotFound {
                requested,
                first_retained,
            }) => {
                return Err(SessionError::HistoryUnavailable {
                    requested,
                    first_retained,
                })
            }
            Err(e) => return Err(e.into()),
        };

        let ticket = state
            .group
            .register(endpoint_id, display_name, outbox, replay_from, tail, Instant::now());
        let accepted = JoinAccepted {
            replay_from: ticket.replay_from,
            flags: self.policy.flags,
        };
        let accepted = match SessionMessage::join_accepted(endpoint_id, self.id(), tail, &accepted) {
            Ok(msg) => msg,
            Err(e) => {
                state.group.remove(endpoint_id);
                return Err(e.into());
            }
        };
        state.group.send_to(endpoint_id, accepted);
        if ticket.synchronized {
            state
                .group
                .send_to(endpoint_id, SessionMessage::replay_complete(endpoint_id, self.id(), tail));
        }

        log::info!(
            "Endpoint {} '{}' joined session {} (replay {}..={})",
            endpoint_id,
            display_name,
            self.id(),
            ticket.replay_from,
            tail
        );
        if let Err(e) = state.endpoints.set(endpoint_id, display_name, Utc::now()) {
            log::warn!("Failed to record endpoint {endpoint_id} in session {}: {e}", self.id());
        }
        self.record_connection(&mut state, endpoint_id, display_name, true);
        drop(state);

        if !ticket.synchronized {
            tokio::spawn(self.clone().run_replay(endpoint_id, ticket.generation, replay));
        }
        Ok(ticket)
    }

    async fn run_replay(self: Arc<Self>, endpoint_id: Uuid, generation: u64, mut replay: ReplayIter) {
        let mut delivered = 0usize;
        loop {
            let batch: Vec<_> = replay.by_ref().take(REPLAY_BATCH).collect();
            if batch.is_empty() {
                break;
            }

            let mut state = self.state.lock().await;
            for item in batch {
                let delivery = match item {
                    Ok(event) => Delivery::Replay(event),
                    Err(LogError::CorruptEntry { sequence, reason }) => {
                        log::warn!(
                            "Replay to {endpoint_id} skips corrupt entry {sequence} in session {}: {reason}",
                            self.id()
                        );
                        Delivery::Skipped {
                            sequence,
                            reason: reason.to_string(),
                        }
                    }
                    Err(e) => {
                        log::error!("Replay to {endpoint_id} in session {} failed: {e}", self.id());
                        let tail = state.log.tail();
                        state.group.send_to(
                            endpoint_id,
                            SessionMessage::resync_required(endpoint_id, self.id(), tail, "replay failed"),
                        );
                        state.group.mark_disconnected(endpoint_id, Instant::now());
                        return;
                    }
                };
                if !state.group.deliver(endpoint_id, Some(generation), delivery) {
                    log::debug!("Replay to {endpoint_id} cancelled after {delivered} events");
                    return;
                }
                delivered += 1;
            }
            drop(state);
            tokio::task::yield_now().await;
        }
        log::debug!("Replay to {endpoint_id} read {delivered} events");
    }

    /// Sequence, persist and broadcast one submission.
    ///
    /// `generation` identifies the join the submission arrived through; a
    /// connection superseded by a newer join of the same endpoint is
    /// refused. The originator receives a `SubmitAck` through its delivery
    /// queue; every other connected endpoint receives the event.
    pub async fn submit(
        &self,
        endpoint_id: Uuid,
        generation: u64,
        submission: Submission,
    ) -> Result<SequenceNumber, SessionError> {
        let mut state = self.state.lock().await;
        self.ensure_open(&state)?;

        match state.group.registration(endpoint_id) {
            Some(registration) if registration.state != EndpointState::Disconnected => {}
            _ => return Err(SessionError::EndpointUnreachable(endpoint_id)),
        }
        if state.group.generation(endpoint_id) != Some(generation) {
            return Err(SessionError::StaleJoin {
                endpoint_id,
                generation,
            });
        }
        let flags = self.policy.flags;
        if !flags.allows(submission.kind) {
            return Err(SessionError::FeatureDisabled(submission.kind));
        }
        if matches!(submission.payload, EventPayload::File(_)) && !flags.file_sharing {
            return Err(SessionError::FeatureDisabled(submission.kind));
        }

        let pending = PendingEvent {
            origin_endpoint_id: endpoint_id,
            submission_id: submission.submission_id,
            kind: submission.kind,
            package_name: submission.package_name,
            payload: submission.payload,
        };
        let event = self.append_and_broadcast(&mut state, pending)?;
        Ok(event.sequence)
    }

    fn append_and_broadcast(
        &self,
        state: &mut SessionState,
        pending: PendingEvent,
    ) -> Result<SessionEvent, SessionError> {
        let event = match state.log.append(pending, Utc::now()) {
            Ok(event) => event,
            Err(LogError::Io(e)) => {
                self.halt(state, &e.to_string());
                return Err(SessionError::Halted(self.id()));
            }
            Err(e) => return Err(e.into()),
        };
        self.events_appended.fetch_add(1, Ordering::Relaxed);

        let ack = SubmitAck {
            submission_id: event.submission_id,
            timestamp: event.timestamp,
            package: event.package.clone(),
        };
        let closed = state.group.broadcast(&event, &ack);
        for endpoint_id in closed {
            log::debug!("Endpoint {endpoint_id} outbox closed during broadcast");
            state.group.mark_disconnected(endpoint_id, Instant::now());
        }
        log::trace!("Session {} appended {}", self.id(), event.sequence);
        Ok(event)
    }

    fn record_connection(
        &self,
        state: &mut SessionState,
        endpoint_id: Uuid,
        display_name: &str,
        connected: bool,
    ) {
        if !self.policy.flags.record_connection_events || state.halted {
            return;
        }
        let activity = ConnectionActivity {
            endpoint_id,
            display_name: display_name.to_string(),
            connected,
        };
        let payload = match activity.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                log::warn!("Failed to encode connection event for {endpoint_id}: {e}");
                return;
            }
        };
        // Origin is nil so no endpoint receives an ack for it
        let pending = PendingEvent::new(Uuid::nil(), EventKind::Connection, EventPayload::Inline(payload));
        if let Err(e) = self.append_and_broadcast(state, pending) {
            log::warn!("Failed to record connection event for {endpoint_id}: {e}");
        }
    }

    /// Stop accepting submissions and force every endpoint to resync.
    ///
    /// The log rolled the failed append back, so it is reopened from disk
    /// right away; if that succeeds the session resumes.
    fn halt(&self, state: &mut SessionState, reason: &str) {
        log::error!("Session {} halted: append failed: {reason}", self.id());
        state.halted = true;

        let tail = state.log.tail();
        let session_id = self.id();
        state
            .group
            .send_all(|endpoint_id| SessionMessage::resync_required(endpoint_id, session_id, tail, reason));
        let now = Instant::now();
        for registration in state.group.registrations() {
            state.group.mark_disconnected(registration.endpoint_id, now);
        }

        self.reopen(state);
    }

    fn reopen(&self, state: &mut SessionState) -> bool {
        match EventLog::open(state.log.dir().to_path_buf(), self.log_config.clone()) {
            Ok(log) => {
                log::info!("Session {} recovered at tail {}", self.id(), log.tail());
                state.log = log;
                state.halted = false;
                true
            }
            Err(e) => {
                log::error!("Session {} stays halted: reopen failed: {e}", self.id());
                false
            }
        }
    }

    /// Retry reopening the log of a halted session.
    pub async fn recover(&self) -> bool {
        let mut state = self.state.lock().await;
        if !state.halted {
            return true;
        }
        self.reopen(&mut state)
    }

    /// Mark an endpoint Disconnected, keeping its registration for the
    /// grace period. Also used when the transport reports loss.
    pub async fn leave(&self, endpoint_id: Uuid) -> Result<(), SessionError> {
        let mut state = self.state.lock().await;
        self.leave_locked(&mut state, endpoint_id)
    }

    /// Like `leave`, but only if the registration still belongs to the join
    /// identified by `generation`.
    ///
    /// A connection that lost the race to a newer join of the same endpoint
    /// must not disconnect its successor.
    pub async fn detach(&self, endpoint_id: Uuid, generation: u64) -> Result<bool, SessionError> {
        let mut state = self.state.lock().await;
        if state.group.generation(endpoint_id) != Some(generation) {
            return Ok(false);
        }
        self.leave_locked(&mut state, endpoint_id)?;
        Ok(true)
    }

    fn leave_locked(&self, state: &mut SessionState, endpoint_id: Uuid) -> Result<(), SessionError> {
        let Some(display_name) = state
            .group
            .registration(endpoint_id)
            .map(|registration| registration.display_name.clone())
        else {
            return Err(SessionError::EndpointUnreachable(endpoint_id));
        };
        if state.group.mark_disconnected(endpoint_id, Instant::now()) {
            log::info!("Endpoint {endpoint_id} left session {}", self.id());
            if !state.closed {
                self.record_connection(state, endpoint_id, &display_name, false);
            }
        }
        Ok(())
    }

    /// Record a heartbeat; returns the session tail.
    pub async fn heartbeat(
        &self,
        endpoint_id: Uuid,
        last_applied: SequenceNumber,
    ) -> Result<SequenceNumber, SessionError> {
        let mut state = self.state.lock().await;
        if !state.group.touch(endpoint_id, last_applied, Instant::now()) {
            return Err(SessionError::EndpointUnreachable(endpoint_id));
        }
        Ok(state.log.tail())
    }

    /// Disconnect endpoints silent for longer than `timeout` and purge
    /// registrations disconnected for longer than `grace`.
    pub async fn purge_stale(&self, now: Instant, timeout: Duration, grace: Duration) -> PurgeReport {
        let mut state = self.state.lock().await;
        let mut report = PurgeReport::default();

        for endpoint_id in state.group.stale(now, timeout) {
            let display_name = state
                .group
                .registration(endpoint_id)
                .map(|registration| registration.display_name.clone())
                .unwrap_or_default();
            if state.group.mark_disconnected(endpoint_id, now) {
                log::info!("Endpoint {endpoint_id} timed out in session {}", self.id());
                self.record_connection(&mut state, endpoint_id, &display_name, false);
                report.disconnected.push(endpoint_id);
            }
        }
        for endpoint_id in state.group.expired(now, grace) {
            state.group.remove(endpoint_id);
            log::info!("Purged endpoint {endpoint_id} from session {}", self.id());
            report.purged.push(endpoint_id);
        }
        report
    }

    /// Stop accepting joins and submissions, tell every endpoint and flush.
    pub async fn shutdown(&self) -> Result<(), SessionError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Ok(());
        }
        state.closed = true;

        let session_id = self.id();
        state
            .group
            .send_all(|endpoint_id| SessionMessage::leave(endpoint_id, session_id));
        for registration in state.group.registrations() {
            state.group.remove(registration.endpoint_id);
        }
        state.log.flush()?;
        log::info!("Session {} shut down at tail {}", self.id(), state.log.tail());
        Ok(())
    }

    fn ensure_open(&self, state: &SessionState) -> Result<(), SessionError> {
        if state.closed {
            return Err(SessionError::Closed(self.id()));
        }
        if state.halted {
            return Err(SessionError::Halted(self.id()));
        }
        Ok(())
    }

    pub async fn tail(&self) -> SequenceNumber {
        self.state.lock().await.log.tail()
    }

    pub async fn is_halted(&self) -> bool {
        self.state.lock().await.halted
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }

    pub async fn registration(&self, endpoint_id: Uuid) -> Option<EndpointRegistration> {
        self.state.lock().await.group.registration(endpoint_id).cloned()
    }

    pub async fn registrations(&self) -> Vec<EndpointRegistration> {
        self.state.lock().await.group.registrations()
    }

    /// Read the log directly (diagnostics, archive checks).
    pub async fn read_from(&self, from: SequenceNumber) -> Result<ReplayIter, SessionError> {
        Ok(self.state.lock().await.log.read_from(from)?)
    }

    pub async fn package_head_revision(&self, package: &str) -> u64 {
        self.state.lock().await.log.package_head_revision(package)
    }

    /// One event by sequence number, `None` if the log has no such record.
    pub async fn read_event(&self, sequence: SequenceNumber) -> Result<Option<SessionEvent>, SessionError> {
        Ok(self.state.lock().await.log.read_event(sequence)?)
    }

    /// Package data at `revision`, or at the head revision when `None`.
    pub async fn package_event(
        &self,
        package: &str,
        revision: Option<u64>,
    ) -> Result<Option<SessionEvent>, SessionError> {
        Ok(self.state.lock().await.log.package_event(package, revision)?)
    }

    pub async fn head_packages(&self) -> Vec<PackageRef> {
        self.state.lock().await.log.head_packages()
    }

    /// Head revision event of every package, in log order.
    pub async fn head_package_events(&self) -> ReplayIter {
        self.state.lock().await.log.head_package_events()
    }

    pub async fn live_transactions(&self, package: &str) -> Vec<SequenceNumber> {
        self.state.lock().await.log.live_transactions(package)
    }

    pub async fn packages_with_live_transactions(&self) -> Vec<String> {
        self.state.lock().await.log.packages_with_live_transactions()
    }

    pub async fn lock_events_for(&self, resource: &str) -> Vec<SequenceNumber> {
        self.state.lock().await.log.lock_events_for(resource)
    }

    /// Browse up to `limit` events from `from`, optionally of one kind.
    pub async fn activities(&self, from: SequenceNumber, limit: usize, kind: Option<EventKind>) -> ReplayIter {
        self.state.lock().await.log.activities(from, limit, kind)
    }

    /// Every endpoint that ever joined, including ones long gone.
    pub async fn known_endpoints(&self) -> Vec<EndpointInfo> {
        self.state.lock().await.endpoints.list()
    }

    pub async fn known_endpoint(&self, endpoint_id: Uuid) -> Option<EndpointInfo> {
        self.state.lock().await.endpoints.get(endpoint_id).cloned()
    }

    pub async fn stats(&self) -> SessionStats {
        let state = self.state.lock().await;
        SessionStats {
            tail: state.log.tail(),
            connected_endpoints: state.group.connected_count(),
            registered_endpoints: state.group.registrations().len(),
            events_appended: self.events_appended.load(Ordering::Relaxed),
            messages_sent: self.broadcast_stats.messages_sent(),
            duplicates_dropped: self.broadcast_stats.duplicates_dropped(),
            halted: state.halted,
        }
    }
}
