//! Per-endpoint delivery queues and fan-out for one session.
//!
//! Every registered endpoint owns a [`DeliveryQueue`] fed by two producers:
//! the replay task (historical events) and the live broadcaster (new
//! events plus the originator's own acks). The queue releases items strictly
//! by sequence number, so the handoff from replay to live can neither drop
//! nor repeat an event:
//!
//! ```text
//! replay task ──Replay(3)──┐
//!                          ▼
//!                   ┌─────────────┐ next_expected = 3
//!  live ──Live(6)──►│ BTreeMap    │────► 3, 4, 5, [ReplayComplete], 6, ...
//!                   └─────────────┘
//! ```
//!
//! The group itself is not synchronized: it lives inside the session's
//! state and is only touched while the session lock is held. Sending never
//! blocks; every endpoint has an unbounded outbox drained by its connection
//! task.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

use crate::event::{EndpointRegistration, EndpointState, SequenceNumber, SessionEvent};
use crate::protocol::{SessionMessage, SubmitAck};

/// Outbound message channel of one connected endpoint.
pub type Outbox = mpsc::UnboundedSender<SessionMessage>;

/// One item waiting in a delivery queue.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    Replay(SessionEvent),
    Live(SessionEvent),
    /// The endpoint's own submission was sequenced
    Ack {
        sequence: SequenceNumber,
        ack: SubmitAck,
    },
    /// Replay could not read this entry
    Skipped {
        sequence: SequenceNumber,
        reason: String,
    },
}

impl Delivery {
    pub fn sequence(&self) -> SequenceNumber {
        match self {
            Delivery::Replay(event) | Delivery::Live(event) => event.sequence,
            Delivery::Ack { sequence, .. } | Delivery::Skipped { sequence, .. } => *sequence,
        }
    }
}

/// Reorders deliveries from the replay and live producers.
#[derive(Debug)]
pub struct DeliveryQueue {
    next_expected: SequenceNumber,
    replay_target: SequenceNumber,
    replay_complete: bool,
    pending: BTreeMap<SequenceNumber, Delivery>,
    duplicates: u64,
}

impl DeliveryQueue {
    /// Queue that first expects `replay_from` and finishes replay once
    /// `replay_target` (the tail at join time) has been released.
    pub fn new(replay_from: SequenceNumber, replay_target: SequenceNumber) -> Self {
        let replay_from = replay_from.max(1);
        Self {
            next_expected: replay_from,
            replay_target,
            replay_complete: replay_target < replay_from,
            pending: BTreeMap::new(),
            duplicates: 0,
        }
    }

    /// Add an item; returns everything now releasable, in order.
    ///
    /// The flag on each released item is true for the item that completes
    /// the replay.
    pub fn offer(&mut self, delivery: Delivery) -> Vec<(Delivery, bool)> {
        let sequence = delivery.sequence();
        if sequence < self.next_expected || self.pending.contains_key(&sequence) {
            self.duplicates += 1;
            return Vec::new();
        }
        self.pending.insert(sequence, delivery);

        let mut ready = Vec::new();
        while let Some(delivery) = self.pending.remove(&self.next_expected) {
            let completes = !self.replay_complete && self.next_expected == self.replay_target;
            if completes {
                self.replay_complete = true;
            }
            ready.push((delivery, completes));
            self.next_expected += 1;
        }
        ready
    }

    pub fn next_expected(&self) -> SequenceNumber {
        self.next_expected
    }

    pub fn replay_target(&self) -> SequenceNumber {
        self.replay_target
    }

    pub fn replay_complete(&self) -> bool {
        self.replay_complete
    }

    /// Items held back waiting for an earlier sequence number.
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    pub fn duplicates(&self) -> u64 {
        self.duplicates
    }
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub duplicates_dropped: u64,
    pub active_endpoints: usize,
}

/// Counters shared with the server without taking the session lock.
#[derive(Debug, Default)]
pub struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    duplicates_dropped: AtomicU64,
}

impl AtomicBroadcastStats {
    pub fn messages_sent(&self) -> u64 {
        self.messages_sent.load(Ordering::Relaxed)
    }

    pub fn duplicates_dropped(&self) -> u64 {
        self.duplicates_dropped.load(Ordering::Relaxed)
    }
}

/// Result of registering an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinTicket {
    /// Changes on every (re)join and on disconnect; stale replay tasks stop
    pub generation: u64,
    pub replay_from: SequenceNumber,
    pub replay_target: SequenceNumber,
    /// Nothing to replay: the endpoint is already synchronized
    pub synchronized: bool,
}

struct EndpointSlot {
    registration: EndpointRegistration,
    outbox: Option<Outbox>,
    queue: DeliveryQueue,
    generation: u64,
    last_seen: Instant,
    disconnected_at: Option<Instant>,
}

/// The endpoints of one session and their delivery queues.
pub struct BroadcastGroup {
    session_id: Uuid,
    endpoints: HashMap<Uuid, EndpointSlot>,
    stats: Arc<AtomicBroadcastStats>,
}

impl BroadcastGroup {
    pub fn new(session_id: Uuid) -> Self {
        Self {
            session_id,
            endpoints: HashMap::new(),
            stats: Arc::new(AtomicBroadcastStats::default()),
        }
    }

    /// Register (or re-register) an endpoint in the `Joining` state.
    ///
    /// Re-joining with a known id updates the display name and outbox in
    /// place and restarts delivery at `replay_from`.
    pub fn register(
        &mut self,
        endpoint_id: Uuid,
        display_name: &str,
        outbox: Outbox,
        replay_from: SequenceNumber,
        replay_target: SequenceNumber,
        now: Instant,
    ) -> JoinTicket {
        let queue = DeliveryQueue::new(replay_from, replay_target);
        let synchronized = queue.replay_complete();
        let state = if synchronized {
            EndpointState::Synchronized
        } else {
            EndpointState::Joining
        };
        let replay_from = queue.next_expected();

        let slot = self.endpoints.entry(endpoint_id).or_insert_with(|| EndpointSlot {
            registration: EndpointRegistration {
                endpoint_id,
                display_name: display_name.to_string(),
                state,
                last_acked: 0,
            },
            outbox: None,
            queue: DeliveryQueue::new(replay_from, replay_target),
            generation: 0,
            last_seen: now,
            disconnected_at: None,
        });
        slot.registration.display_name = display_name.to_string();
        slot.registration.state = state;
        slot.registration.last_acked = replay_from - 1;
        slot.outbox = Some(outbox);
        slot.queue = queue;
        slot.generation += 1;
        slot.last_seen = now;
        slot.disconnected_at = None;

        JoinTicket {
            generation: slot.generation,
            replay_from,
            replay_target,
            synchronized,
        }
    }

    /// Send a message directly, bypassing the delivery queue.
    pub fn send_to(&self, endpoint_id: Uuid, msg: SessionMessage) -> bool {
        let Some(outbox) = self.endpoints.get(&endpoint_id).and_then(|slot| slot.outbox.as_ref()) else {
            return false;
        };
        if outbox.send(msg).is_ok() {
            self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    /// Feed one item into an endpoint's queue and flush what is ready.
    ///
    /// `generation` guards replay deliveries: a task started for an older
    /// join gets `false` and must stop. Returns false as well when the
    /// endpoint is gone or its outbox is closed.
    pub fn deliver(&mut self, endpoint_id: Uuid, generation: Option<u64>, delivery: Delivery) -> bool {
        let session_id = self.session_id;
        let Some(slot) = self.endpoints.get_mut(&endpoint_id) else {
            return false;
        };
        if generation.is_some_and(|g| g != slot.generation) {
            return false;
        }
        let Some(outbox) = slot.outbox.as_ref() else {
            return false;
        };

        let before = slot.queue.duplicates();
        let ready = slot.queue.offer(delivery);
        let dropped = slot.queue.duplicates() - before;
        if dropped > 0 {
            self.stats.duplicates_dropped.fetch_add(dropped, Ordering::Relaxed);
            log::debug!("Dropped duplicate delivery for {endpoint_id}");
        }

        let mut sent = 0u64;
        let mut open = true;
        for (delivery, completes) in ready {
            let encoded = match delivery {
                Delivery::Replay(event) => SessionMessage::replay_event(endpoint_id, session_id, &event),
                Delivery::Live(event) => SessionMessage::event(endpoint_id, session_id, &event),
                Delivery::Ack { sequence, ack } => {
                    SessionMessage::submit_ack(endpoint_id, session_id, sequence, &ack)
                }
                Delivery::Skipped { sequence, reason } => Ok(SessionMessage::replay_skipped(
                    endpoint_id,
                    session_id,
                    sequence,
                    &reason,
                )),
            };
            let msg = match encoded {
                Ok(msg) => msg,
                Err(e) => {
                    // The stream now has a hole; only a fresh join repairs it
                    log::error!("Failed to encode delivery for {endpoint_id}: {e}");
                    let through = slot.queue.replay_target();
                    let _ = outbox.send(SessionMessage::resync_required(
                        endpoint_id,
                        session_id,
                        through,
                        "delivery encoding failed",
                    ));
                    open = false;
                    break;
                }
            };
            open &= outbox.send(msg).is_ok();
            sent += 1;

            if completes {
                let through = slot.queue.replay_target();
                open &= outbox
                    .send(SessionMessage::replay_complete(endpoint_id, session_id, through))
                    .is_ok();
                sent += 1;
                slot.registration.state = EndpointState::Synchronized;
                log::info!(
                    "Endpoint {} '{}' synchronized at {through}",
                    endpoint_id,
                    slot.registration.display_name
                );
            }
        }
        self.stats.messages_sent.fetch_add(sent, Ordering::Relaxed);
        open
    }

    /// Fan a freshly sequenced event out to every connected endpoint.
    ///
    /// The originator gets `ack` instead of the event. Returns the ids whose
    /// outbox turned out to be closed.
    pub fn broadcast(&mut self, event: &SessionEvent, ack: &SubmitAck) -> Vec<Uuid> {
        let targets: Vec<Uuid> = self
            .endpoints
            .iter()
            .filter(|(_, slot)| slot.outbox.is_some())
            .map(|(id, _)| *id)
            .collect();

        let mut closed = Vec::new();
        for endpoint_id in targets {
            let delivery = if endpoint_id == event.origin_endpoint_id {
                Delivery::Ack {
                    sequence: event.sequence,
                    ack: ack.clone(),
                }
            } else {
                Delivery::Live(event.clone())
            };
            if !self.deliver(endpoint_id, None, delivery) {
                closed.push(endpoint_id);
            }
        }
        closed
    }

    /// Send a message built per endpoint to everyone connected.
    pub fn send_all(&self, build: impl Fn(Uuid) -> SessionMessage) -> usize {
        self.endpoints
            .iter()
            .filter(|(_, slot)| slot.outbox.is_some())
            .filter(|(id, _)| self.send_to(**id, build(**id)))
            .count()
    }

    /// Drop the outbox and keep the registration for the grace period.
    ///
    /// Bumps the generation so an in-flight replay stops.
    pub fn mark_disconnected(&mut self, endpoint_id: Uuid, now: Instant) -> bool {
        let Some(slot) = self.endpoints.get_mut(&endpoint_id) else {
            return false;
        };
        if slot.registration.state == EndpointState::Disconnected {
            return false;
        }
        slot.registration.state = EndpointState::Disconnected;
        slot.outbox = None;
        slot.queue = DeliveryQueue::new(slot.registration.last_acked + 1, 0);
        slot.generation += 1;
        slot.disconnected_at = Some(now);
        true
    }

    pub fn remove(&mut self, endpoint_id: Uuid) -> Option<EndpointRegistration> {
        self.endpoints.remove(&endpoint_id).map(|slot| slot.registration)
    }

    /// Record liveness and the client's last applied sequence number.
    pub fn touch(&mut self, endpoint_id: Uuid, last_applied: SequenceNumber, now: Instant) -> bool {
        let Some(slot) = self.endpoints.get_mut(&endpoint_id) else {
            return false;
        };
        slot.last_seen = now;
        slot.registration.last_acked = slot.registration.last_acked.max(last_applied);
        true
    }

    /// Connected endpoints not heard from within `timeout`.
    pub fn stale(&self, now: Instant, timeout: Duration) -> Vec<Uuid> {
        self.endpoints
            .iter()
            .filter(|(_, slot)| slot.outbox.is_some())
            .filter(|(_, slot)| now.saturating_duration_since(slot.last_seen) > timeout)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Disconnected registrations older than `grace`.
    pub fn expired(&self, now: Instant, grace: Duration) -> Vec<Uuid> {
        self.endpoints
            .iter()
            .filter(|(_, slot)| {
                slot.disconnected_at
                    .is_some_and(|at| now.saturating_duration_since(at) > grace)
            })
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn registration(&self, endpoint_id: Uuid) -> Option<&EndpointRegistration> {
        self.endpoints.get(&endpoint_id).map(|slot| &slot.registration)
    }

    pub fn registrations(&self) -> Vec<EndpointRegistration> {
        self.endpoints.values().map(|slot| slot.registration.clone()).collect()
    }

    pub fn generation(&self, endpoint_id: Uuid) -> Option<u64> {
        self.endpoints.get(&endpoint_id).map(|slot| slot.generation)
    }

    /// Endpoints with a live outbox.
    pub fn connected_count(&self) -> usize {
        self.endpoints.values().filter(|slot| slot.outbox.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn stats_handle(&self) -> Arc<AtomicBroadcastStats> {
        self.stats.clone()
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.stats.messages_sent(),
            duplicates_dropped: self.stats.duplicates_dropped(),
            active_endpoints: self.connected_count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::PendingEvent;
    use crate::protocol::MessageType;
    use chrono::Utc;

    fn event(sequence: SequenceNumber, origin: Uuid) -> SessionEvent {
        PendingEvent::transaction(origin, vec![sequence as u8]).into_event(sequence, Utc::now(), None)
    }

    fn ack(sequence: SequenceNumber) -> Delivery {
        Delivery::Ack {
            sequence,
            ack: SubmitAck {
                submission_id: Uuid::new_v4(),
                timestamp: Utc::now(),
                package: None,
            },
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<SessionMessage>) -> Vec<(MessageType, u64)> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push((msg.msg_type, msg.sequence));
        }
        out
    }

    #[test]
    fn test_queue_holds_live_until_replay_catches_up() {
        let origin = Uuid::new_v4();
        let mut queue = DeliveryQueue::new(1, 2);
        assert!(queue.offer(Delivery::Live(event(3, origin))).is_empty());
        assert_eq!(queue.buffered(), 1);

        let ready = queue.offer(Delivery::Replay(event(1, origin)));
        assert_eq!(ready.len(), 1);
        assert!(!ready[0].1);

        let ready = queue.offer(Delivery::Replay(event(2, origin)));
        let sequences: Vec<_> = ready.iter().map(|(d, c)| (d.sequence(), *c)).collect();
        assert_eq!(sequences, vec![(2, true), (3, false)]);
        assert!(queue.replay_complete());
        assert_eq!(queue.next_expected(), 4);
    }

    #[test]
    fn test_queue_drops_duplicates() {
        let origin = Uuid::new_v4();
        let mut queue = DeliveryQueue::new(1, 0);
        assert!(queue.replay_complete());
        assert_eq!(queue.offer(Delivery::Live(event(1, origin))).len(), 1);
        assert!(queue.offer(Delivery::Live(event(1, origin))).is_empty());
        assert!(queue.offer(Delivery::Live(event(3, origin))).is_empty());
        assert!(queue.offer(Delivery::Live(event(3, origin))).is_empty());
        assert_eq!(queue.duplicates(), 2);
        assert_eq!(queue.offer(ack(2)).len(), 2);
    }

    #[test]
    fn test_queue_zero_checkpoint_starts_at_one() {
        let queue = DeliveryQueue::new(0, 5);
        assert_eq!(queue.next_expected(), 1);
        assert!(!queue.replay_complete());
    }

    #[tokio::test]
    async fn test_join_with_history_then_live() {
        let mut group = BroadcastGroup::new(Uuid::new_v4());
        let writer = Uuid::new_v4();
        let joiner = Uuid::new_v4();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let ticket = group.register(joiner, "D", tx, 1, 2, Instant::now());
        assert!(!ticket.synchronized);
        assert_eq!(group.registration(joiner).unwrap().state, EndpointState::Joining);

        // Live event 3 arrives while replay is in flight
        let closed = group.broadcast(&event(3, writer), &SubmitAck {
            submission_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            package: None,
        });
        assert!(closed.is_empty());
        assert!(drain(&mut rx).is_empty());

        assert!(group.deliver(joiner, Some(ticket.generation), Delivery::Replay(event(1, writer))));
        assert!(group.deliver(joiner, Some(ticket.generation), Delivery::Replay(event(2, writer))));
        assert_eq!(
            drain(&mut rx),
            vec![
                (MessageType::ReplayEvent, 1),
                (MessageType::ReplayEvent, 2),
                (MessageType::ReplayComplete, 2),
                (MessageType::Event, 3),
            ]
        );
        assert_eq!(group.registration(joiner).unwrap().state, EndpointState::Synchronized);
    }

    #[tokio::test]
    async fn test_originator_gets_ack_not_echo() {
        let mut group = BroadcastGroup::new(Uuid::new_v4());
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        assert!(group.register(a, "A", tx_a, 1, 0, Instant::now()).synchronized);
        assert!(group.register(b, "B", tx_b, 1, 0, Instant::now()).synchronized);

        let ack = SubmitAck {
            submission_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            package: None,
        };
        group.broadcast(&event(1, a), &ack);
        assert_eq!(drain(&mut rx_a), vec![(MessageType::SubmitAck, 1)]);
        assert_eq!(drain(&mut rx_b), vec![(MessageType::Event, 1)]);
        assert_eq!(group.stats().messages_sent, 2);
    }

    #[tokio::test]
    async fn test_stale_generation_rejected_after_rejoin() {
        let mut group = BroadcastGroup::new(Uuid::new_v4());
        let id = Uuid::new_v4();
        let (tx, _rx) = mpsc::unbounded_channel();
        let first = group.register(id, "A", tx.clone(), 1, 5, Instant::now());
        let second = group.register(id, "A2", tx, 1, 5, Instant::now());
        assert_ne!(first.generation, second.generation);
        assert_eq!(group.registration(id).unwrap().display_name, "A2");
        assert_eq!(group.registrations().len(), 1);

        let origin = Uuid::new_v4();
        assert!(!group.deliver(id, Some(first.generation), Delivery::Replay(event(1, origin))));
        assert!(group.deliver(id, Some(second.generation), Delivery::Replay(event(1, origin))));
    }

    #[tokio::test]
    async fn test_disconnect_and_expiry() {
        let mut group = BroadcastGroup::new(Uuid::new_v4());
        let id = Uuid::new_v4();
        let (tx, _rx) = mpsc::unbounded_channel();
        let start = Instant::now();
        let ticket = group.register(id, "A", tx, 1, 0, start);
        assert!(group.touch(id, 7, start));

        assert!(group.mark_disconnected(id, start));
        assert!(!group.mark_disconnected(id, start));
        let registration = group.registration(id).unwrap();
        assert_eq!(registration.state, EndpointState::Disconnected);
        assert_eq!(registration.last_acked, 7);
        assert_eq!(group.connected_count(), 0);
        assert!(!group.deliver(id, Some(ticket.generation), Delivery::Replay(event(1, id))));

        let grace = Duration::from_secs(10);
        assert!(group.expired(start + Duration::from_secs(5), grace).is_empty());
        assert_eq!(group.expired(start + Duration::from_secs(11), grace), vec![id]);
    }

    #[tokio::test]
    async fn test_stale_detection() {
        let mut group = BroadcastGroup::new(Uuid::new_v4());
        let id = Uuid::new_v4();
        let (tx, _rx) = mpsc::unbounded_channel();
        let start = Instant::now();
        group.register(id, "A", tx, 1, 0, start);

        let timeout = Duration::from_secs(3);
        assert!(group.stale(start + Duration::from_secs(2), timeout).is_empty());
        group.touch(id, 0, start + Duration::from_secs(2));
        assert!(group.stale(start + Duration::from_secs(4), timeout).is_empty());
        assert_eq!(group.stale(start + Duration::from_secs(6), timeout), vec![id]);
    }

    #[tokio::test]
    async fn test_closed_outbox_reported() {
        let mut group = BroadcastGroup::new(Uuid::new_v4());
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        group.register(id, "A", tx, 1, 0, Instant::now());
        drop(rx);

        let closed = group.broadcast(&event(1, Uuid::new_v4()), &SubmitAck {
            submission_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            package: None,
        });
        assert_eq!(closed, vec![id]);
    }
}
