//! Message routing: priority batching, host relay, heartbeat, and peer
//! lifecycle.
//!
//! The [`MessageRouter`] owns every live [`SessionHandle`] plus one
//! [`Negotiator`]. It is driven from the frame loop: [`MessageRouter::update`]
//! drains transport events, dispatches and relays received messages, flushes
//! batches whose deadline has passed, and runs the heartbeat — then returns
//! the frame's [`RouterEvent`]s for the layer above to consume. Nothing here
//! blocks and nothing here is a global: construct a router, pass it around.
//!
//! Batching: each priority has at most one open batch. The batch's flush
//! deadline is set when its first message is enqueued; flushing is polled
//! once per frame, so worst-case flush latency is the nominal delay plus one
//! frame. On flush, messages are grouped by kind and a group of two or more
//! `EntityUpdate`s collapses into a single `EntityStateBatch`.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::mpsc::error::TryRecvError;

use crate::messages::{
    Envelope, EntityStateBatch, MessageBody, MessageKind, PeerId, Ping, PlayerLeave, Pong,
    Priority, deserialize_envelope, serialize_envelope, unix_millis,
};
use crate::negotiation::{NegotiationError, Negotiator};
use crate::transport::{
    ConnectionState, EventReceiver, SessionHandle, TransportConfig, TransportEvent, event_channel,
};

// ---------------------------------------------------------------------------
// Role & configuration
// ---------------------------------------------------------------------------

/// Which side of the star topology this process is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Authoritative center: creates offers, relays traffic, mints ids.
    Host,
    /// Leaf: answers one offer, talks only to the host, never relays.
    Client,
}

/// Tunables for a [`MessageRouter`].
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Interval between heartbeat pings to every peer. Default: 5 s.
    pub heartbeat_interval: Duration,
    /// Transport-level settings applied to every session.
    pub transport: TransportConfig,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(5),
            transport: TransportConfig::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// What the router reports to the layer above, drained once per frame from
/// [`MessageRouter::update`]. Each logical event is emitted at most once.
#[derive(Debug, Clone, PartialEq)]
pub enum RouterEvent {
    /// A peer's transport handshake completed.
    PeerConnected {
        /// The peer in question.
        peer: PeerId,
    },
    /// A peer's message channel is open; gameplay traffic can flow.
    PeerReady {
        /// The peer in question.
        peer: PeerId,
    },
    /// A peer was dropped (remote close, failure, or staleness).
    PeerLeft {
        /// The peer in question.
        peer: PeerId,
        /// Why the session ended.
        reason: String,
    },
    /// `true` when the first peer connects, `false` when the last one goes.
    ConnectionChanged(bool),
    /// A decoded non-heartbeat message. Relay (on the host) has already
    /// happened by the time this is surfaced.
    Message {
        /// Transport-level sender of this message (for relayed messages,
        /// the relaying host — the payload names the original author).
        peer: PeerId,
        /// The full wire envelope.
        envelope: Envelope,
        /// The decoded body.
        body: MessageBody,
    },
}

// ---------------------------------------------------------------------------
// Peer session bookkeeping
// ---------------------------------------------------------------------------

/// Exponentially weighted moving average of heartbeat round-trip latency.
#[derive(Debug, Clone, Default)]
pub struct LatencyTracker {
    ewma_ms: f32,
    last_ms: f32,
    samples: u32,
}

/// EWMA smoothing factor for latency samples.
const LATENCY_ALPHA: f32 = 0.125;

impl LatencyTracker {
    /// Fold one round-trip sample into the estimate.
    pub fn record(&mut self, sample_ms: f32) {
        self.last_ms = sample_ms;
        if self.samples == 0 {
            self.ewma_ms = sample_ms;
        } else {
            self.ewma_ms += LATENCY_ALPHA * (sample_ms - self.ewma_ms);
        }
        self.samples += 1;
    }

    /// Smoothed latency estimate. Zero until the first sample arrives.
    pub fn latency_ms(&self) -> f32 {
        self.ewma_ms
    }

    /// The most recent raw sample.
    pub fn last_ms(&self) -> f32 {
        self.last_ms
    }

    /// Number of samples folded in so far.
    pub fn samples(&self) -> u32 {
        self.samples
    }
}

/// One tracked peer: the session handle plus router-side state.
struct PeerSession {
    handle: SessionHandle,
    /// Whether the remote peer is the session host (a client's one session
    /// points at the host; a host's sessions never do).
    remote_is_host: bool,
    connected: bool,
    channel_ready: bool,
    last_seen: Instant,
    latency: LatencyTracker,
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

/// Running wire totals. Plain counters: the router is only touched from the
/// frame thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct RouterStats {
    /// Messages handed to sessions for transmission.
    pub messages_sent: u64,
    /// Serialized bytes handed to sessions.
    pub bytes_sent: u64,
    /// Messages received from sessions.
    pub messages_received: u64,
    /// Serialized bytes received from sessions.
    pub bytes_received: u64,
}

impl RouterStats {
    fn record_send(&mut self, bytes: usize) {
        self.messages_sent += 1;
        self.bytes_sent += bytes as u64;
    }

    fn record_receive(&mut self, bytes: usize) {
        self.messages_received += 1;
        self.bytes_received += bytes as u64;
    }
}

// ---------------------------------------------------------------------------
// Batching
// ---------------------------------------------------------------------------

/// Open batch for one priority. Ephemeral: exists between the first enqueue
/// and the flush.
struct MessageBatch {
    priority: Priority,
    envelopes: Vec<Envelope>,
    flush_at: Instant,
}

fn priority_index(priority: Priority) -> usize {
    match priority {
        Priority::Critical => 0,
        Priority::High => 1,
        Priority::Medium => 2,
        Priority::Low => 3,
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Central per-process message router. See the module docs for the update
/// cycle.
pub struct MessageRouter {
    role: Role,
    config: RouterConfig,
    local_peer: PeerId,
    negotiator: Negotiator,
    sessions: HashMap<PeerId, PeerSession>,
    events_rx: EventReceiver,
    batches: [Option<MessageBatch>; 4],
    next_sequence: u64,
    last_heartbeat: Instant,
    is_connected: bool,
    stats: RouterStats,
    out_events: Vec<RouterEvent>,
}

impl MessageRouter {
    /// Construct a router with a fresh random local peer id.
    pub fn new(role: Role, config: RouterConfig) -> Self {
        Self::with_peer_id(role, config, PeerId::random())
    }

    /// Construct a router with an explicit local peer id.
    pub fn with_peer_id(role: Role, config: RouterConfig, local_peer: PeerId) -> Self {
        let (events_tx, events_rx) = event_channel();
        let negotiator = Negotiator::new(local_peer.clone(), config.transport.clone(), events_tx);
        Self {
            role,
            config,
            local_peer,
            negotiator,
            sessions: HashMap::new(),
            events_rx,
            batches: [None, None, None, None],
            next_sequence: 0,
            last_heartbeat: Instant::now(),
            is_connected: false,
            stats: RouterStats::default(),
            out_events: Vec::new(),
        }
    }

    /// This process's stable peer id.
    pub fn local_peer(&self) -> &PeerId {
        &self.local_peer
    }

    /// Host or client.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Whether at least one peer is connected.
    pub fn is_connected(&self) -> bool {
        self.is_connected
    }

    /// Number of tracked peers (including ones still handshaking).
    pub fn peer_count(&self) -> usize {
        self.sessions.len()
    }

    /// Ids of all tracked peers.
    pub fn peers(&self) -> Vec<PeerId> {
        self.sessions.keys().cloned().collect()
    }

    /// Whether `peer`'s message channel is open.
    pub fn is_peer_ready(&self, peer: &PeerId) -> bool {
        self.sessions
            .get(peer)
            .is_some_and(|s| s.channel_ready)
    }

    /// Smoothed heartbeat latency to `peer`, if any samples exist.
    pub fn latency_ms(&self, peer: &PeerId) -> Option<f32> {
        let session = self.sessions.get(peer)?;
        (session.latency.samples() > 0).then(|| session.latency.latency_ms())
    }

    /// Running wire totals.
    pub fn stats(&self) -> RouterStats {
        self.stats
    }

    // -- negotiation ------------------------------------------------------

    /// Host: produce an offer blob for the next joining client.
    pub async fn create_offer(&mut self) -> Result<String, NegotiationError> {
        if self.role != Role::Host {
            return Err(NegotiationError::InvalidState);
        }
        self.negotiator.create_offer().await
    }

    /// Client: consume the host's offer, return the answer blob, and start
    /// connecting.
    pub async fn create_answer(&mut self, offer_blob: &str) -> Result<String, NegotiationError> {
        if self.role != Role::Client {
            return Err(NegotiationError::InvalidState);
        }
        let (blob, handle) = self.negotiator.create_answer(offer_blob).await?;
        self.register_session(handle, true);
        Ok(blob)
    }

    /// Host: apply a client's answer blob, registering the new peer session.
    /// Returns the new peer's id.
    pub fn process_answer(&mut self, answer_blob: &str) -> Result<PeerId, NegotiationError> {
        if self.role != Role::Host {
            return Err(NegotiationError::InvalidState);
        }
        let handle = self.negotiator.process_answer(answer_blob)?;
        let peer = handle.peer_id().clone();
        self.register_session(handle, false);
        Ok(peer)
    }

    fn register_session(&mut self, handle: SessionHandle, remote_is_host: bool) {
        let peer = handle.peer_id().clone();
        let session = PeerSession {
            handle,
            remote_is_host,
            connected: false,
            channel_ready: false,
            last_seen: Instant::now(),
            latency: LatencyTracker::default(),
        };
        if let Some(old) = self.sessions.insert(peer.clone(), session) {
            tracing::warn!("replacing existing session for {peer}");
            old.handle.close();
        }
    }

    // -- sending ----------------------------------------------------------

    /// Stamp `body` and enqueue it for broadcast at `priority`. Critical
    /// messages flush immediately; everything else waits out its batch
    /// window.
    pub fn send_message(&mut self, body: MessageBody, priority: Priority) {
        let Some(envelope) = self.stamp(&body, priority) else {
            return;
        };
        let idx = priority_index(priority);
        let batch = self.batches[idx].get_or_insert_with(|| MessageBatch {
            priority,
            envelopes: Vec::new(),
            flush_at: Instant::now() + priority.flush_delay(),
        });
        batch.envelopes.push(envelope);
        if priority == Priority::Critical {
            self.flush_batch(idx);
        }
    }

    /// Stamp `body` and send it to one peer immediately, bypassing batching.
    /// Used for targeted payloads like a full-state push.
    pub fn send_to_peer(&mut self, peer: &PeerId, body: MessageBody, priority: Priority) {
        let Some(envelope) = self.stamp(&body, priority) else {
            return;
        };
        self.unicast(peer, &envelope);
    }

    fn stamp(&mut self, body: &MessageBody, priority: Priority) -> Option<Envelope> {
        match body.encode() {
            Ok(bytes) => {
                self.next_sequence += 1;
                Some(Envelope {
                    kind: body.kind().code(),
                    priority,
                    timestamp_ms: unix_millis(),
                    sequence: self.next_sequence,
                    body: bytes,
                })
            }
            Err(e) => {
                tracing::error!("failed to encode {:?} message: {e}", body.kind());
                None
            }
        }
    }

    fn unicast(&mut self, peer: &PeerId, envelope: &Envelope) {
        let bytes = match serialize_envelope(envelope) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!("failed to serialize envelope: {e}");
                return;
            }
        };
        match self.sessions.get(peer) {
            Some(session) => {
                self.stats.record_send(bytes.len());
                session.handle.send(bytes);
            }
            None => tracing::warn!("unicast to unknown peer {peer}, dropping"),
        }
    }

    fn broadcast_envelope(&mut self, envelope: &Envelope) {
        let bytes = match serialize_envelope(envelope) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!("failed to serialize envelope: {e}");
                return;
            }
        };
        let mut sent = 0;
        for session in self.sessions.values() {
            if session.channel_ready {
                session.handle.send(bytes.clone());
                sent += 1;
            }
        }
        for _ in 0..sent {
            self.stats.record_send(bytes.len());
        }
    }

    /// Host-only fan-out of raw received bytes to everyone but the sender.
    fn relay_raw(&mut self, bytes: &[u8], except: &PeerId) {
        if self.role != Role::Host {
            return;
        }
        let mut sent = 0;
        for (peer, session) in &self.sessions {
            if peer != except && session.channel_ready {
                session.handle.send(bytes.to_vec());
                sent += 1;
            }
        }
        for _ in 0..sent {
            self.stats.record_send(bytes.len());
        }
    }

    // -- frame update -----------------------------------------------------

    /// Drive the router for one frame. Never blocks. Returns the events the
    /// frame produced.
    pub fn update(&mut self) -> Vec<RouterEvent> {
        self.drain_transport_events();
        self.flush_due_batches();
        self.heartbeat_if_due();
        std::mem::take(&mut self.out_events)
    }

    /// Tear down every session and clear all pending batches. In-flight
    /// sends are not cancelled (fire-and-forget).
    pub fn disconnect(&mut self) {
        for (_, session) in self.sessions.drain() {
            session.handle.close();
        }
        self.batches = [None, None, None, None];
        if self.is_connected {
            self.is_connected = false;
            self.out_events.push(RouterEvent::ConnectionChanged(false));
        }
    }

    fn drain_transport_events(&mut self) {
        loop {
            match self.events_rx.try_recv() {
                Ok((peer, event)) => self.handle_transport_event(peer, event),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
    }

    fn handle_transport_event(&mut self, peer: PeerId, event: TransportEvent) {
        match event {
            TransportEvent::Connected => {
                let Some(session) = self.sessions.get_mut(&peer) else {
                    return;
                };
                session.connected = true;
                session.last_seen = Instant::now();
                self.out_events
                    .push(RouterEvent::PeerConnected { peer: peer.clone() });
                if !self.is_connected {
                    self.is_connected = true;
                    self.out_events.push(RouterEvent::ConnectionChanged(true));
                }
            }
            TransportEvent::ChannelReady => {
                let Some(session) = self.sessions.get_mut(&peer) else {
                    return;
                };
                session.channel_ready = true;
                self.out_events.push(RouterEvent::PeerReady { peer });
            }
            TransportEvent::Message(bytes) => self.handle_incoming(peer, bytes),
            TransportEvent::Disconnected { reason } => self.drop_peer(&peer, &reason),
        }
    }

    fn handle_incoming(&mut self, peer: PeerId, bytes: Vec<u8>) {
        self.stats.record_receive(bytes.len());

        if let Some(session) = self.sessions.get_mut(&peer) {
            session.last_seen = Instant::now();
        } else {
            tracing::debug!("message from untracked peer {peer}, ignoring");
            return;
        }

        let envelope = match deserialize_envelope(&bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::debug!("discarding malformed message from {peer}: {e}");
                return;
            }
        };

        match envelope.message_kind() {
            None => {
                // A newer peer is speaking. Keep the star intact, stay quiet
                // locally.
                tracing::debug!("unknown message kind {} from {peer}", envelope.kind);
                self.relay_raw(&bytes, &peer);
            }
            Some(MessageKind::Ping) => match envelope.decode_body() {
                Ok(MessageBody::Ping(ping)) => {
                    let reply = MessageBody::Pong(Pong {
                        echo_timestamp_ms: ping.timestamp_ms,
                    });
                    if let Some(pong) = self.stamp(&reply, Priority::Low) {
                        self.unicast(&peer, &pong);
                    }
                }
                _ => tracing::debug!("malformed ping from {peer}"),
            },
            Some(MessageKind::Pong) => match envelope.decode_body() {
                Ok(MessageBody::Pong(pong)) => {
                    let rtt = unix_millis().saturating_sub(pong.echo_timestamp_ms);
                    if let Some(session) = self.sessions.get_mut(&peer) {
                        session.latency.record(rtt as f32);
                    }
                }
                _ => tracing::debug!("malformed pong from {peer}"),
            },
            Some(kind) => {
                self.relay_raw(&bytes, &peer);
                match envelope.decode_body() {
                    Ok(body) => self.out_events.push(RouterEvent::Message {
                        peer,
                        envelope,
                        body,
                    }),
                    Err(e) => tracing::warn!("failed to decode {kind:?} from {peer}: {e}"),
                }
            }
        }
    }

    fn drop_peer(&mut self, peer: &PeerId, reason: &str) {
        let Some(session) = self.sessions.remove(peer) else {
            return;
        };
        session.handle.close();
        tracing::info!("peer {peer} left: {reason}");

        // Tell the remaining peers (host fan-out; a client has no one left
        // to tell, so this is a no-op there).
        self.send_message(
            MessageBody::PlayerLeave(PlayerLeave {
                peer: Some(peer.clone()),
                reason: reason.to_string(),
            }),
            Priority::Critical,
        );

        self.out_events.push(RouterEvent::PeerLeft {
            peer: peer.clone(),
            reason: reason.to_string(),
        });
        if self.sessions.is_empty() && self.is_connected {
            self.is_connected = false;
            self.out_events.push(RouterEvent::ConnectionChanged(false));
        }
    }

    fn flush_due_batches(&mut self) {
        let now = Instant::now();
        for idx in 0..self.batches.len() {
            if self.batches[idx]
                .as_ref()
                .is_some_and(|batch| now >= batch.flush_at)
            {
                self.flush_batch(idx);
            }
        }
    }

    fn flush_batch(&mut self, idx: usize) {
        let Some(batch) = self.batches[idx].take() else {
            return;
        };
        for envelope in self.coalesce(batch.priority, batch.envelopes) {
            self.broadcast_envelope(&envelope);
        }
    }

    /// Group a flushed batch by kind (first-appearance order) and merge any
    /// group of two or more `EntityUpdate`s into one `EntityStateBatch`.
    fn coalesce(&mut self, priority: Priority, envelopes: Vec<Envelope>) -> Vec<Envelope> {
        let mut order: Vec<u16> = Vec::new();
        let mut groups: HashMap<u16, Vec<Envelope>> = HashMap::new();
        for envelope in envelopes {
            if !groups.contains_key(&envelope.kind) {
                order.push(envelope.kind);
            }
            groups.entry(envelope.kind).or_default().push(envelope);
        }

        let mut out = Vec::new();
        for kind in order {
            let Some(group) = groups.remove(&kind) else {
                continue;
            };
            if kind == MessageKind::EntityUpdate.code() && group.len() > 1 {
                let mut snapshots = Vec::with_capacity(group.len());
                for envelope in &group {
                    match envelope.decode_body() {
                        Ok(MessageBody::EntityUpdate(update)) => snapshots.push(update.snapshot),
                        _ => {
                            snapshots.clear();
                            break;
                        }
                    }
                }
                if snapshots.is_empty() {
                    // Self-authored envelopes failing to decode would be a
                    // bug; send them unmerged rather than dropping them.
                    out.extend(group);
                } else if let Some(merged) =
                    self.stamp(&MessageBody::EntityStateBatch(EntityStateBatch { snapshots }), priority)
                {
                    out.push(merged);
                } else {
                    out.extend(group);
                }
            } else {
                out.extend(group);
            }
        }
        out
    }

    fn heartbeat_if_due(&mut self) {
        if self.last_heartbeat.elapsed() < self.config.heartbeat_interval {
            return;
        }
        self.last_heartbeat = Instant::now();
        let ping = MessageBody::Ping(Ping {
            timestamp_ms: unix_millis(),
        });
        // Direct broadcast: heartbeats never sit in a batch.
        if let Some(envelope) = self.stamp(&ping, Priority::Low) {
            self.broadcast_envelope(&envelope);
        }
    }

    /// Connection state of one peer's underlying session, if tracked.
    pub fn peer_connection_state(&self, peer: &PeerId) -> Option<ConnectionState> {
        self.sessions.get(peer).map(|s| s.handle.state())
    }

    /// Whether `peer` is the session host from this router's point of view.
    pub fn peer_is_host(&self, peer: &PeerId) -> Option<bool> {
        self.sessions.get(peer).map(|s| s.remote_is_host)
    }

    /// Seconds since anything was heard from `peer`.
    pub fn peer_idle_secs(&self, peer: &PeerId) -> Option<f32> {
        self.sessions
            .get(peer)
            .map(|s| s.last_seen.elapsed().as_secs_f32())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{Chat, EntityKind, EntitySnapshot, EntityUpdate, NetworkId};

    fn test_router(role: Role) -> MessageRouter {
        MessageRouter::new(role, RouterConfig::default())
    }

    fn update_body(id: &str) -> MessageBody {
        MessageBody::EntityUpdate(EntityUpdate {
            snapshot: EntitySnapshot {
                entity_id: id.to_string(),
                position: [0.0; 3],
                rotation: [0.0, 0.0, 0.0, 1.0],
                velocity: None,
                kind: EntityKind::Entity,
                owner: Some(NetworkId(1)),
                model_id: None,
                frame: None,
            },
        })
    }

    #[test]
    fn test_stamp_assigns_monotonic_sequence() {
        let mut router = test_router(Role::Host);
        let a = router.stamp(&update_body("a"), Priority::Medium).unwrap();
        let b = router.stamp(&update_body("b"), Priority::Medium).unwrap();
        assert!(b.sequence > a.sequence);
        assert!(a.timestamp_ms > 0);
    }

    #[test]
    fn test_batch_opens_with_delay_and_accumulates() {
        let mut router = test_router(Role::Host);
        router.send_message(update_body("a"), Priority::Medium);
        router.send_message(update_body("b"), Priority::Medium);

        let idx = priority_index(Priority::Medium);
        let batch = router.batches[idx].as_ref().expect("batch should be open");
        assert_eq!(batch.envelopes.len(), 2);
        assert!(batch.flush_at > Instant::now());

        // An immediate update must not flush an unexpired batch.
        router.update();
        assert!(router.batches[idx].is_some());

        std::thread::sleep(Duration::from_millis(25));
        router.update();
        assert!(router.batches[idx].is_none(), "expired batch should flush");
    }

    #[test]
    fn test_critical_messages_flush_immediately() {
        let mut router = test_router(Role::Host);
        router.send_message(
            MessageBody::Chat(Chat {
                sender_name: "host".into(),
                text: "hi".into(),
            }),
            Priority::Critical,
        );
        assert!(
            router.batches[priority_index(Priority::Critical)].is_none(),
            "critical batch must not stay open"
        );
    }

    #[test]
    fn test_coalesce_merges_entity_updates_in_order() {
        let mut router = test_router(Role::Host);
        let envelopes: Vec<Envelope> = ["a", "b", "c"]
            .iter()
            .map(|id| router.stamp(&update_body(id), Priority::Medium).unwrap())
            .collect();

        let out = router.coalesce(Priority::Medium, envelopes);
        assert_eq!(out.len(), 1);
        match out[0].decode_body().unwrap() {
            MessageBody::EntityStateBatch(batch) => {
                let ids: Vec<&str> =
                    batch.snapshots.iter().map(|s| s.entity_id.as_str()).collect();
                assert_eq!(ids, vec!["a", "b", "c"]);
            }
            other => panic!("expected EntityStateBatch, got {other:?}"),
        }
    }

    #[test]
    fn test_coalesce_leaves_single_update_alone() {
        let mut router = test_router(Role::Host);
        let envelope = router.stamp(&update_body("solo"), Priority::Medium).unwrap();
        let out = router.coalesce(Priority::Medium, vec![envelope.clone()]);
        assert_eq!(out, vec![envelope]);
    }

    #[test]
    fn test_coalesce_keeps_other_kinds_individual() {
        let mut router = test_router(Role::Host);
        let chat = |text: &str| {
            MessageBody::Chat(Chat {
                sender_name: "x".into(),
                text: text.into(),
            })
        };
        let envelopes = vec![
            router.stamp(&chat("one"), Priority::Low).unwrap(),
            router.stamp(&chat("two"), Priority::Low).unwrap(),
            router.stamp(&update_body("a"), Priority::Low).unwrap(),
            router.stamp(&update_body("b"), Priority::Low).unwrap(),
        ];
        let out = router.coalesce(Priority::Low, envelopes);
        // Two chats stay individual, two updates merge.
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].message_kind(), Some(MessageKind::Chat));
        assert_eq!(out[1].message_kind(), Some(MessageKind::Chat));
        assert_eq!(out[2].message_kind(), Some(MessageKind::EntityStateBatch));
    }

    #[test]
    fn test_latency_tracker_ewma() {
        let mut tracker = LatencyTracker::default();
        tracker.record(100.0);
        assert_eq!(tracker.latency_ms(), 100.0);

        tracker.record(200.0);
        let expected = 100.0 + 0.125 * 100.0;
        assert!((tracker.latency_ms() - expected).abs() < f32::EPSILON * 1000.0);
        assert_eq!(tracker.last_ms(), 200.0);
        assert_eq!(tracker.samples(), 2);
    }

    #[test]
    fn test_disconnect_clears_batches_and_sessions() {
        let mut router = test_router(Role::Host);
        router.send_message(update_body("a"), Priority::Low);
        router.disconnect();
        assert!(router.batches.iter().all(|b| b.is_none()));
        assert_eq!(router.peer_count(), 0);
    }

    #[test]
    fn test_role_guards_on_negotiation_entry_points() {
        let mut client = test_router(Role::Client);
        let result = futures_block_on(client.create_offer());
        assert!(matches!(result, Err(NegotiationError::InvalidState)));

        let mut host = test_router(Role::Host);
        let result = host.process_answer("anything");
        // Host with no pending offer fails on the blob or the state, never
        // panics.
        assert!(result.is_err());
    }

    /// Minimal block_on for tests that never actually wait on I/O.
    fn futures_block_on<F: std::future::Future>(future: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
            .block_on(future)
    }
}
