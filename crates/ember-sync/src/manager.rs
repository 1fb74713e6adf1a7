//! Host-authoritative entity synchronization over the message router.
//!
//! The [`SyncManager`] sits between the router and the game's entity store.
//! Each frame it drains router events, applies incoming entity state to the
//! store under the ownership and echo rules, pushes full snapshots to newly
//! ready peers (host), and broadcasts the entities this process authors at a
//! fixed cadence. The application drains the returned [`SyncEvent`]s.

use std::time::{Duration, Instant};

use ember_net::{
    Chat, EntitySnapshot, EntityUpdate, Envelope, FullGameState, MessageBody, MessageRouter,
    NegotiationError, NetworkId, PeerId, PlayerJoin, Priority, Role, RouterConfig, RouterEvent,
};

use crate::identity::{IdAllocator, PeerIdentityMap};
use crate::store::EntityStore;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Tunables for a [`SyncManager`].
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Display name announced in this process's `PlayerJoin`.
    pub player_name: String,
    /// Cadence of authored-entity broadcasts. Default: 50 ms (20 Hz).
    pub broadcast_interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            player_name: "player".to_string(),
            broadcast_interval: Duration::from_millis(50),
        }
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// What the manager reports to the application, drained once per frame from
/// [`SyncManager::update`]. Each logical event fires at most once.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// A player announced itself (directly or relayed).
    PlayerJoined {
        /// The joiner's peer id.
        peer: PeerId,
        /// The joiner's display name.
        name: String,
    },
    /// A player left or was lost.
    PlayerLeft {
        /// The leaver's peer id.
        peer: PeerId,
    },
    /// Chat line ready for display.
    Chat {
        /// Sender display name.
        sender_name: String,
        /// Message text.
        text: String,
        /// Sender wall-clock milliseconds at send time.
        timestamp_ms: u64,
    },
    /// `true` when the first peer connects, `false` when the last one goes.
    ConnectionChanged(bool),
    /// Catch-all for messages the manager does not consume
    /// (`PlayerInput`, `PlayerAction`).
    Message {
        /// Transport-level sender.
        peer: PeerId,
        /// The wire envelope.
        envelope: Envelope,
        /// The decoded body.
        body: MessageBody,
    },
}

// ---------------------------------------------------------------------------
// SyncManager
// ---------------------------------------------------------------------------

/// Host-authoritative synchronization between the entity store and the
/// network. One per process; constructed explicitly and passed by reference.
pub struct SyncManager {
    router: MessageRouter,
    config: SyncConfig,
    identity: PeerIdentityMap,
    allocator: IdAllocator,
    local_network_id: Option<NetworkId>,
    host_network_id: Option<NetworkId>,
    last_broadcast: Instant,
    out: Vec<SyncEvent>,
}

impl SyncManager {
    /// Construct a manager and its router. A host mints its own network id
    /// immediately; a client learns its id from the first full-state push.
    pub fn new(role: Role, config: SyncConfig, router_config: RouterConfig) -> Self {
        let router = MessageRouter::new(role, router_config);
        let mut allocator = IdAllocator::new();
        let local_network_id = (role == Role::Host).then(|| allocator.allocate());
        let host_network_id = local_network_id;
        Self {
            router,
            config,
            identity: PeerIdentityMap::new(),
            allocator,
            local_network_id,
            host_network_id,
            last_broadcast: Instant::now(),
            out: Vec::new(),
        }
    }

    /// The underlying router (latency, stats, peer queries).
    pub fn router(&self) -> &MessageRouter {
        &self.router
    }

    /// Network id of this process's player, once known.
    pub fn local_network_id(&self) -> Option<NetworkId> {
        self.local_network_id
    }

    /// Network id of the session host, once known.
    pub fn host_network_id(&self) -> Option<NetworkId> {
        self.host_network_id
    }

    /// The peer ↔ network identity map.
    pub fn identity(&self) -> &PeerIdentityMap {
        &self.identity
    }

    // -- negotiation passthrough ------------------------------------------

    /// Host: produce an offer blob for the next joining client.
    pub async fn create_offer(&mut self) -> Result<String, NegotiationError> {
        self.router.create_offer().await
    }

    /// Client: consume the host's offer and return the answer blob.
    pub async fn create_answer(&mut self, offer_blob: &str) -> Result<String, NegotiationError> {
        self.router.create_answer(offer_blob).await
    }

    /// Host: apply a client's answer blob.
    pub fn process_answer(&mut self, answer_blob: &str) -> Result<PeerId, NegotiationError> {
        self.router.process_answer(answer_blob)
    }

    /// Tear down every session and clear pending state.
    pub fn disconnect(&mut self) {
        self.router.disconnect();
        self.identity = PeerIdentityMap::new();
    }

    // -- application-facing sends -----------------------------------------

    /// Broadcast a chat line under this process's display name.
    pub fn send_chat(&mut self, text: &str) {
        let chat = Chat {
            sender_name: self.config.player_name.clone(),
            text: text.to_string(),
        };
        self.router.send_message(MessageBody::Chat(chat), Priority::High);
    }

    /// Broadcast an arbitrary message body (inputs, actions).
    pub fn send_message(&mut self, body: MessageBody, priority: Priority) {
        self.router.send_message(body, priority);
    }

    /// Client: ask the host for a fresh full snapshot.
    pub fn request_full_state(&mut self) {
        self.router.send_message(
            MessageBody::GameStateRequest(ember_net::GameStateRequest {}),
            Priority::Critical,
        );
    }

    // -- frame update ------------------------------------------------------

    /// Drive synchronization for one frame. Never blocks. Call once per
    /// rendered frame, in frame order.
    pub fn update(&mut self, store: &mut dyn EntityStore) -> Vec<SyncEvent> {
        for event in self.router.update() {
            self.handle_router_event(event, store);
        }
        self.broadcast_if_due(store);
        std::mem::take(&mut self.out)
    }

    fn handle_router_event(&mut self, event: RouterEvent, store: &mut dyn EntityStore) {
        match event {
            RouterEvent::PeerConnected { peer } => {
                tracing::debug!("peer {peer} connected, waiting for channel");
            }
            RouterEvent::PeerReady { peer } => self.on_peer_ready(peer, store),
            RouterEvent::PeerLeft { peer, reason } => {
                if let Some(id) = self.identity.remove_peer(&peer) {
                    tracing::info!("peer {peer} (network id {id}) left: {reason}");
                } else {
                    tracing::info!("peer {peer} left: {reason}");
                }
                self.out.push(SyncEvent::PlayerLeft { peer });
            }
            RouterEvent::ConnectionChanged(up) => {
                self.out.push(SyncEvent::ConnectionChanged(up));
            }
            RouterEvent::Message {
                peer,
                envelope,
                body,
            } => self.handle_message(&peer, envelope, body, store),
        }
    }

    /// A peer's channel is usable. The host mints its identity and pushes
    /// the world; a client announces itself to the host.
    fn on_peer_ready(&mut self, peer: PeerId, store: &mut dyn EntityStore) {
        match self.router.role() {
            Role::Host => {
                if self.identity.network_id(&peer).is_none() {
                    let id = self.allocator.allocate();
                    tracing::info!("assigned network id {id} to peer {peer}");
                    self.identity.insert(peer.clone(), id);
                }
                self.push_full_state(&peer, store, false);
            }
            Role::Client => {
                let join = PlayerJoin {
                    peer: self.router.local_peer().clone(),
                    name: self.config.player_name.clone(),
                };
                self.router
                    .send_message(MessageBody::PlayerJoin(join), Priority::Critical);
            }
        }
    }

    fn handle_message(
        &mut self,
        sender: &PeerId,
        envelope: Envelope,
        body: MessageBody,
        store: &mut dyn EntityStore,
    ) {
        match body {
            MessageBody::PlayerJoin(join) => {
                let subject = if self.router.role() == Role::Host {
                    // Spoof guard: the transport-level sender is the joiner,
                    // whatever the payload claims.
                    if join.peer != *sender {
                        tracing::warn!(
                            "join from {sender} claims peer {}, using transport identity",
                            join.peer
                        );
                    }
                    sender.clone()
                } else {
                    join.peer.clone()
                };
                if subject == *self.router.local_peer() {
                    return; // our own join, relayed back around the star
                }
                self.out.push(SyncEvent::PlayerJoined {
                    peer: subject,
                    name: join.name,
                });
            }
            MessageBody::PlayerLeave(leave) => {
                if self.router.role() == Role::Host {
                    // The transport-level drop is authoritative on the host;
                    // the message alone must not double-fire the event.
                    return;
                }
                let Some(subject) = leave.peer else {
                    tracing::debug!("leave without a subject from {sender}, ignoring");
                    return;
                };
                if subject == *self.router.local_peer() {
                    return;
                }
                self.out.push(SyncEvent::PlayerLeft { peer: subject });
            }
            MessageBody::Chat(chat) => {
                self.out.push(SyncEvent::Chat {
                    sender_name: chat.sender_name,
                    text: chat.text,
                    timestamp_ms: envelope.timestamp_ms,
                });
            }
            MessageBody::EntityUpdate(update) => {
                self.apply_snapshot(sender, update.snapshot, store);
            }
            MessageBody::EntityStateBatch(batch) => {
                // Unpack and apply each snapshot under the same rules as a
                // single update.
                for snapshot in batch.snapshots {
                    self.apply_snapshot(sender, snapshot, store);
                }
            }
            MessageBody::FullGameState(state) => {
                self.apply_full_state(sender, state, store);
            }
            MessageBody::GameStateRequest(_) => {
                if self.router.role() == Role::Host {
                    self.push_full_state(sender, store, true);
                } else {
                    tracing::debug!("ignoring state request from {sender}: not the host");
                }
            }
            MessageBody::GameStateResponse(state) => {
                self.apply_full_state(sender, state, store);
            }
            body @ (MessageBody::PlayerInput(_) | MessageBody::PlayerAction(_)) => {
                self.out.push(SyncEvent::Message {
                    peer: sender.clone(),
                    envelope,
                    body,
                });
            }
            MessageBody::Ping(_) | MessageBody::Pong(_) => {
                // Heartbeats are consumed by the router and never surface.
            }
        }
    }

    /// Apply one entity snapshot under the echo and ownership rules.
    fn apply_snapshot(
        &mut self,
        sender: &PeerId,
        mut snapshot: EntitySnapshot,
        store: &mut dyn EntityStore,
    ) {
        // Echo suppression: never act on state claiming to be our own.
        if let (Some(owner), Some(local)) = (snapshot.owner, self.local_network_id) {
            if owner == local {
                tracing::trace!("suppressing echoed update for own entity {}", snapshot.entity_id);
                return;
            }
        }

        if self.router.role() == Role::Host {
            // The authoring player is whoever sent this, not whoever the
            // payload names.
            let Some(author) = self.identity.network_id(sender) else {
                tracing::warn!("entity update from unmapped peer {sender}, dropping");
                return;
            };
            if snapshot.owner != Some(author) {
                tracing::warn!(
                    "peer {sender} claimed owner {:?} for entity {}, overriding with {author}",
                    snapshot.owner,
                    snapshot.entity_id
                );
                snapshot.owner = Some(author);
            }
            if let Some(existing) = store.get_entity(&snapshot.entity_id) {
                if existing.owner.is_some() && existing.owner != Some(author) {
                    tracing::warn!(
                        "peer {sender} tried to update entity {} owned by {:?}, dropping",
                        snapshot.entity_id,
                        existing.owner
                    );
                    return;
                }
            }
        }

        if store.apply_update(&snapshot) {
            return;
        }
        // Unknown entity: log and self-heal by creating it from the update
        // rather than failing.
        tracing::warn!(
            "update names unknown entity {} (owner {:?}), spawning it",
            snapshot.entity_id,
            snapshot.owner
        );
        store.spawn_entity(&snapshot);
    }

    /// Client bootstrap: clear everything not locally owned, then load the
    /// authoritative snapshot set. Applying the same state twice leaves the
    /// store identical.
    fn apply_full_state(
        &mut self,
        sender: &PeerId,
        state: FullGameState,
        store: &mut dyn EntityStore,
    ) {
        if self.router.role() == Role::Host {
            tracing::warn!("host ignoring full state from {sender}");
            return;
        }

        self.identity.insert(sender.clone(), state.host_id);
        self.host_network_id = Some(state.host_id);
        if self.local_network_id.is_none() {
            tracing::info!("assigned network id {}", state.assigned_id);
            self.local_network_id = Some(state.assigned_id);
        }

        store.despawn_all_except(self.local_network_id);
        let mut spawned = 0;
        for snapshot in &state.entities {
            if snapshot.owner.is_some() && snapshot.owner == self.local_network_id {
                continue; // we stay authoritative for our own player
            }
            store.spawn_entity(snapshot);
            spawned += 1;
        }
        tracing::info!(
            "loaded full game state from {sender}: {spawned} entities ({} total in push)",
            state.entities.len()
        );
    }

    /// Host: unicast the complete world to one peer.
    fn push_full_state(&mut self, peer: &PeerId, store: &dyn EntityStore, response: bool) {
        let Some(assigned_id) = self.identity.network_id(peer) else {
            tracing::warn!("no network id for peer {peer}, cannot push state");
            return;
        };
        let Some(host_id) = self.local_network_id else {
            return;
        };
        let state = FullGameState {
            host_id,
            assigned_id,
            entities: store.snapshot_entities(),
        };
        tracing::info!(
            "pushing full game state to {peer}: {} entities",
            state.entities.len()
        );
        let body = if response {
            MessageBody::GameStateResponse(state)
        } else {
            MessageBody::FullGameState(state)
        };
        self.router.send_to_peer(peer, body, Priority::Critical);
    }

    /// Emit `EntityUpdate`s for every entity this process authors, at the
    /// configured cadence.
    fn broadcast_if_due(&mut self, store: &mut dyn EntityStore) {
        if !self.router.is_connected() {
            return;
        }
        if self.last_broadcast.elapsed() < self.config.broadcast_interval {
            return;
        }
        self.last_broadcast = Instant::now();

        for snapshot in self.authored_snapshots(store) {
            self.router.send_message(
                MessageBody::EntityUpdate(EntityUpdate { snapshot }),
                Priority::Medium,
            );
        }
    }

    /// The entities this process is authoritative for. The host authors
    /// everything not owned by a connected remote peer (including orphans of
    /// departed peers); a client authors exactly its own player.
    fn authored_snapshots(&self, store: &dyn EntityStore) -> Vec<EntitySnapshot> {
        let local = self.local_network_id;
        store
            .snapshot_entities()
            .into_iter()
            .filter(|snapshot| match self.router.role() {
                Role::Host => match snapshot.owner {
                    None => true,
                    Some(owner) => Some(owner) == local || self.identity.peer_id(owner).is_none(),
                },
                Role::Client => local.is_some() && snapshot.owner == local,
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
