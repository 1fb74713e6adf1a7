//! Wire protocol: message kinds, priorities, envelopes, and serialization.
//!
//! Every message travels inside an [`Envelope`] carrying a kind code, a
//! priority, a send timestamp, and a per-sender sequence number. The body is
//! postcard-encoded separately from the envelope so that an envelope with an
//! unrecognized kind code can still be relayed verbatim by the host. Use
//! [`serialize_envelope`] and [`deserialize_envelope`] for encoding/decoding.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Current wire-protocol version. Prepended to every serialized envelope.
pub const PROTOCOL_VERSION: u8 = 1;

/// Wall-clock Unix time in milliseconds, used for envelope timestamps.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Priority
// ---------------------------------------------------------------------------

/// Send priority of a message. Determines how long its batch may accumulate
/// before being flushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Priority {
    /// Flushed immediately, never batched with anything.
    Critical,
    /// Batched for up to 8 ms.
    High,
    /// Batched for up to 16 ms. The default for entity state traffic.
    Medium,
    /// Batched for up to 100 ms.
    Low,
}

impl Priority {
    /// All priorities, in flush-check order.
    pub const ALL: [Priority; 4] = [
        Priority::Critical,
        Priority::High,
        Priority::Medium,
        Priority::Low,
    ];

    /// Maximum time a batch of this priority may accumulate before flushing.
    pub fn flush_delay(self) -> std::time::Duration {
        let ms = match self {
            Priority::Critical => 0,
            Priority::High => 8,
            Priority::Medium => 16,
            Priority::Low => 100,
        };
        std::time::Duration::from_millis(ms)
    }
}

// ---------------------------------------------------------------------------
// Message kinds
// ---------------------------------------------------------------------------

/// Every message kind the protocol knows about.
///
/// The wire carries the numeric code, not the enum, so a newer peer can add
/// kinds without breaking older peers: an unknown code is relayed (on the
/// host) and otherwise ignored with a log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// A peer announces itself with a display name.
    PlayerJoin,
    /// A peer left, either gracefully or synthesized on disconnect.
    PlayerLeave,
    /// Text chat.
    Chat,
    /// One entity's authoritative state.
    EntityUpdate,
    /// Several entity updates merged by the batch flusher.
    EntityStateBatch,
    /// Complete entity snapshot pushed to a newly joined peer.
    FullGameState,
    /// Raw per-tick player input, passed through to the application.
    PlayerInput,
    /// Discrete player action, passed through to the application.
    PlayerAction,
    /// Heartbeat probe.
    Ping,
    /// Heartbeat reply echoing the probe timestamp.
    Pong,
    /// Client asks the host for a fresh full snapshot.
    GameStateRequest,
    /// Host's reply to [`MessageKind::GameStateRequest`].
    GameStateResponse,
}

impl MessageKind {
    /// Numeric code used on the wire.
    pub fn code(self) -> u16 {
        match self {
            MessageKind::PlayerJoin => 1,
            MessageKind::PlayerLeave => 2,
            MessageKind::Chat => 3,
            MessageKind::EntityUpdate => 4,
            MessageKind::EntityStateBatch => 5,
            MessageKind::FullGameState => 6,
            MessageKind::PlayerInput => 7,
            MessageKind::PlayerAction => 8,
            MessageKind::Ping => 9,
            MessageKind::Pong => 10,
            MessageKind::GameStateRequest => 11,
            MessageKind::GameStateResponse => 12,
        }
    }

    /// Reverse lookup of [`MessageKind::code`]. `None` for codes this build
    /// does not know.
    pub fn from_code(code: u16) -> Option<MessageKind> {
        Some(match code {
            1 => MessageKind::PlayerJoin,
            2 => MessageKind::PlayerLeave,
            3 => MessageKind::Chat,
            4 => MessageKind::EntityUpdate,
            5 => MessageKind::EntityStateBatch,
            6 => MessageKind::FullGameState,
            7 => MessageKind::PlayerInput,
            8 => MessageKind::PlayerAction,
            9 => MessageKind::Ping,
            10 => MessageKind::Pong,
            11 => MessageKind::GameStateRequest,
            12 => MessageKind::GameStateResponse,
            _ => return None,
        })
    }

    /// Heartbeat messages are answered by the router itself and are never
    /// relayed.
    pub fn is_heartbeat(self) -> bool {
        matches!(self, MessageKind::Ping | MessageKind::Pong)
    }
}

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Stable identifier for a remote peer, fixed at negotiation time and carried
/// in session descriptors and join/leave payloads.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub String);

impl PeerId {
    /// Generate a fresh random peer id.
    pub fn random() -> Self {
        PeerId(format!("peer-{:08x}", rand::random::<u32>()))
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Stable identifier the host assigns to a peer's player entity. Gameplay
/// messages reference players by `NetworkId`, never by raw peer id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct NetworkId(pub u64);

impl std::fmt::Display for NetworkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Entity snapshots
// ---------------------------------------------------------------------------

/// Whether a snapshot describes a player avatar or a plain world entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntityKind {
    /// A player-controlled avatar.
    Player,
    /// Any other synchronized entity.
    Entity,
}

/// Point-in-time state of one entity, copied into and out of messages.
///
/// The network layer never owns entities; snapshots are produced by and
/// applied to the external entity store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySnapshot {
    /// Store-level entity identifier.
    pub entity_id: String,
    /// World position.
    pub position: [f32; 3],
    /// Orientation as a unit quaternion (x, y, z, w).
    pub rotation: [f32; 4],
    /// Linear velocity, if the entity has one.
    pub velocity: Option<[f32; 3]>,
    /// Player avatar or plain entity.
    pub kind: EntityKind,
    /// Network id of the owning player, if any.
    pub owner: Option<NetworkId>,
    /// Visual model identifier, if relevant to the receiver.
    pub model_id: Option<String>,
    /// Animation frame, if relevant to the receiver.
    pub frame: Option<u32>,
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// A peer announces itself. Sent once the message channel is ready.
///
/// The payload names the joiner so relayed copies stay meaningful; the host
/// nevertheless trusts only the transport-level sender when it acts on a
/// directly received join.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerJoin {
    /// Peer id of the joiner.
    pub peer: PeerId,
    /// Display name chosen by the player.
    pub name: String,
}

/// A peer left the session. Synthesized by the router on connection loss.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerLeave {
    /// Peer id of the leaver, if the author knows it.
    pub peer: Option<PeerId>,
    /// Human-readable reason ("quit", "connection lost", ...).
    pub reason: String,
}

/// Text chat message. The delivery timestamp is the envelope timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chat {
    /// Display name of the sender.
    pub sender_name: String,
    /// Message text.
    pub text: String,
}

/// Authoritative state for a single entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityUpdate {
    /// The entity's current state.
    pub snapshot: EntitySnapshot,
}

/// Several entity updates merged into one wire message by the batch flusher.
/// Receivers unpack and apply each snapshot as if it arrived alone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityStateBatch {
    /// Snapshots in their original enqueue order.
    pub snapshots: Vec<EntitySnapshot>,
}

/// Complete state push to one peer: every live entity, plus the identities
/// the recipient needs to orient itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FullGameState {
    /// The host's own player network id.
    pub host_id: NetworkId,
    /// Network id minted for the recipient.
    pub assigned_id: NetworkId,
    /// One snapshot per live entity.
    pub entities: Vec<EntitySnapshot>,
}

/// Raw per-tick input. The core does not interpret this; it reaches the
/// application through the catch-all message event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerInput {
    /// Sender-local tick the input belongs to.
    pub tick: u64,
    /// Movement axes (forward/strafe), each in [-1, 1].
    pub axes: [f32; 2],
    /// View yaw in radians.
    pub yaw: f32,
    /// View pitch in radians.
    pub pitch: f32,
    /// Bitmask of pressed action buttons.
    pub buttons: u32,
}

/// Discrete player action (use, attack, interact, ...). Passed through to the
/// application like [`PlayerInput`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerAction {
    /// Application-defined action discriminant.
    pub action_code: u16,
    /// Target entity, if the action has one.
    pub target: Option<String>,
    /// Action-specific payload bytes.
    pub payload: Vec<u8>,
}

/// Heartbeat probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ping {
    /// Sender wall-clock milliseconds at send time.
    pub timestamp_ms: u64,
}

/// Heartbeat reply. Latency = receiver's now − `echo_timestamp_ms`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pong {
    /// The probe timestamp, echoed unchanged.
    pub echo_timestamp_ms: u64,
}

/// Client-initiated request for a fresh full snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameStateRequest {}

// ---------------------------------------------------------------------------
// Body union
// ---------------------------------------------------------------------------

/// Decoded message body: one variant per known [`MessageKind`].
///
/// `GameStateResponse` reuses the [`FullGameState`] payload; the requester
/// applies it through the same bootstrap path.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageBody {
    PlayerJoin(PlayerJoin),
    PlayerLeave(PlayerLeave),
    Chat(Chat),
    EntityUpdate(EntityUpdate),
    EntityStateBatch(EntityStateBatch),
    FullGameState(FullGameState),
    PlayerInput(PlayerInput),
    PlayerAction(PlayerAction),
    Ping(Ping),
    Pong(Pong),
    GameStateRequest(GameStateRequest),
    GameStateResponse(FullGameState),
}

impl MessageBody {
    /// The kind this body serializes under.
    pub fn kind(&self) -> MessageKind {
        match self {
            MessageBody::PlayerJoin(_) => MessageKind::PlayerJoin,
            MessageBody::PlayerLeave(_) => MessageKind::PlayerLeave,
            MessageBody::Chat(_) => MessageKind::Chat,
            MessageBody::EntityUpdate(_) => MessageKind::EntityUpdate,
            MessageBody::EntityStateBatch(_) => MessageKind::EntityStateBatch,
            MessageBody::FullGameState(_) => MessageKind::FullGameState,
            MessageBody::PlayerInput(_) => MessageKind::PlayerInput,
            MessageBody::PlayerAction(_) => MessageKind::PlayerAction,
            MessageBody::Ping(_) => MessageKind::Ping,
            MessageBody::Pong(_) => MessageKind::Pong,
            MessageBody::GameStateRequest(_) => MessageKind::GameStateRequest,
            MessageBody::GameStateResponse(_) => MessageKind::GameStateResponse,
        }
    }

    /// Postcard-encode the payload (without the envelope).
    pub fn encode(&self) -> Result<Vec<u8>, postcard::Error> {
        match self {
            MessageBody::PlayerJoin(p) => postcard::to_allocvec(p),
            MessageBody::PlayerLeave(p) => postcard::to_allocvec(p),
            MessageBody::Chat(p) => postcard::to_allocvec(p),
            MessageBody::EntityUpdate(p) => postcard::to_allocvec(p),
            MessageBody::EntityStateBatch(p) => postcard::to_allocvec(p),
            MessageBody::FullGameState(p) => postcard::to_allocvec(p),
            MessageBody::PlayerInput(p) => postcard::to_allocvec(p),
            MessageBody::PlayerAction(p) => postcard::to_allocvec(p),
            MessageBody::Ping(p) => postcard::to_allocvec(p),
            MessageBody::Pong(p) => postcard::to_allocvec(p),
            MessageBody::GameStateRequest(p) => postcard::to_allocvec(p),
            MessageBody::GameStateResponse(p) => postcard::to_allocvec(p),
        }
    }

    /// Decode a payload for a known kind.
    pub fn decode(kind: MessageKind, bytes: &[u8]) -> Result<MessageBody, postcard::Error> {
        Ok(match kind {
            MessageKind::PlayerJoin => MessageBody::PlayerJoin(postcard::from_bytes(bytes)?),
            MessageKind::PlayerLeave => MessageBody::PlayerLeave(postcard::from_bytes(bytes)?),
            MessageKind::Chat => MessageBody::Chat(postcard::from_bytes(bytes)?),
            MessageKind::EntityUpdate => MessageBody::EntityUpdate(postcard::from_bytes(bytes)?),
            MessageKind::EntityStateBatch => {
                MessageBody::EntityStateBatch(postcard::from_bytes(bytes)?)
            }
            MessageKind::FullGameState => {
                MessageBody::FullGameState(postcard::from_bytes(bytes)?)
            }
            MessageKind::PlayerInput => MessageBody::PlayerInput(postcard::from_bytes(bytes)?),
            MessageKind::PlayerAction => MessageBody::PlayerAction(postcard::from_bytes(bytes)?),
            MessageKind::Ping => MessageBody::Ping(postcard::from_bytes(bytes)?),
            MessageKind::Pong => MessageBody::Pong(postcard::from_bytes(bytes)?),
            MessageKind::GameStateRequest => {
                MessageBody::GameStateRequest(postcard::from_bytes(bytes)?)
            }
            MessageKind::GameStateResponse => {
                MessageBody::GameStateResponse(postcard::from_bytes(bytes)?)
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// The wire unit: a kind code, routing metadata, and the encoded body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Numeric message kind (see [`MessageKind::code`]).
    pub kind: u16,
    /// Send priority. Informational on the receive side.
    pub priority: Priority,
    /// Sender wall-clock milliseconds at stamp time.
    pub timestamp_ms: u64,
    /// Per-sender monotonic counter. Carried for wire compatibility; not
    /// consulted for ordering or loss detection.
    pub sequence: u64,
    /// Postcard-encoded payload.
    pub body: Vec<u8>,
}

impl Envelope {
    /// The kind, if this build knows its code.
    pub fn message_kind(&self) -> Option<MessageKind> {
        MessageKind::from_code(self.kind)
    }

    /// Decode the body. Fails on unknown kinds and malformed payloads.
    pub fn decode_body(&self) -> Result<MessageBody, ParseError> {
        let kind = self
            .message_kind()
            .ok_or(ParseError::UnknownKind(self.kind))?;
        MessageBody::decode(kind, &self.body).map_err(ParseError::Postcard)
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur while decoding incoming bytes. Always non-fatal:
/// the message is logged and discarded, the connection stays alive.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    /// The payload was empty (no version byte).
    #[error("empty payload — no version byte")]
    EmptyPayload,

    /// The version byte does not match [`PROTOCOL_VERSION`].
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// This build does not know the envelope's kind code.
    #[error("unknown message kind code: {0}")]
    UnknownKind(u16),

    /// Postcard deserialization failed.
    #[error("deserialization error: {0}")]
    Postcard(#[from] postcard::Error),
}

// ---------------------------------------------------------------------------
// Serialization helpers
// ---------------------------------------------------------------------------

/// Serialize an [`Envelope`] into a versioned binary payload.
///
/// Wire format: `[version: u8] [postcard-encoded Envelope]`
pub fn serialize_envelope(envelope: &Envelope) -> Result<Vec<u8>, postcard::Error> {
    let body = postcard::to_allocvec(envelope)?;
    let mut out = Vec::with_capacity(1 + body.len());
    out.push(PROTOCOL_VERSION);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Deserialize a versioned binary payload into an [`Envelope`].
pub fn deserialize_envelope(data: &[u8]) -> Result<Envelope, ParseError> {
    if data.is_empty() {
        return Err(ParseError::EmptyPayload);
    }

    let version = data[0];
    if version != PROTOCOL_VERSION {
        return Err(ParseError::UnsupportedVersion(version));
    }

    let envelope = postcard::from_bytes(&data[1..])?;
    Ok(envelope)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(id: &str) -> EntitySnapshot {
        EntitySnapshot {
            entity_id: id.to_string(),
            position: [1.0, 2.0, 3.0],
            rotation: [0.0, 0.0, 0.0, 1.0],
            velocity: Some([0.5, 0.0, -0.5]),
            kind: EntityKind::Player,
            owner: Some(NetworkId(7)),
            model_id: None,
            frame: Some(3),
        }
    }

    fn envelope_for(body: &MessageBody) -> Envelope {
        Envelope {
            kind: body.kind().code(),
            priority: Priority::Medium,
            timestamp_ms: 1_000,
            sequence: 1,
            body: body.encode().unwrap(),
        }
    }

    #[test]
    fn test_envelope_roundtrip_preserves_body() {
        let body = MessageBody::FullGameState(FullGameState {
            host_id: NetworkId(1),
            assigned_id: NetworkId(4),
            entities: vec![snapshot("5"), snapshot("6")],
        });
        let env = envelope_for(&body);

        let bytes = serialize_envelope(&env).unwrap();
        let decoded = deserialize_envelope(&bytes).unwrap();
        assert_eq!(decoded, env);
        assert_eq!(decoded.decode_body().unwrap(), body);
    }

    #[test]
    fn test_kind_codes_roundtrip() {
        for kind in [
            MessageKind::PlayerJoin,
            MessageKind::PlayerLeave,
            MessageKind::Chat,
            MessageKind::EntityUpdate,
            MessageKind::EntityStateBatch,
            MessageKind::FullGameState,
            MessageKind::PlayerInput,
            MessageKind::PlayerAction,
            MessageKind::Ping,
            MessageKind::Pong,
            MessageKind::GameStateRequest,
            MessageKind::GameStateResponse,
        ] {
            assert_eq!(MessageKind::from_code(kind.code()), Some(kind));
        }
    }

    #[test]
    fn test_unknown_kind_still_deserializes_as_envelope() {
        // A future peer sends kind 999. The envelope must survive decoding so
        // the host can relay it; only the body decode fails.
        let env = Envelope {
            kind: 999,
            priority: Priority::Low,
            timestamp_ms: 5,
            sequence: 9,
            body: vec![1, 2, 3],
        };
        let bytes = serialize_envelope(&env).unwrap();
        let decoded = deserialize_envelope(&bytes).unwrap();
        assert_eq!(decoded.kind, 999);
        assert_eq!(decoded.message_kind(), None);
        assert!(matches!(
            decoded.decode_body(),
            Err(ParseError::UnknownKind(999))
        ));
    }

    #[test]
    fn test_unsupported_version_rejected() {
        let env = envelope_for(&MessageBody::Ping(Ping { timestamp_ms: 1 }));
        let mut bytes = serialize_envelope(&env).unwrap();
        bytes[0] = 200;
        assert!(matches!(
            deserialize_envelope(&bytes),
            Err(ParseError::UnsupportedVersion(200))
        ));
    }

    #[test]
    fn test_empty_payload_rejected() {
        assert!(matches!(
            deserialize_envelope(&[]),
            Err(ParseError::EmptyPayload)
        ));
    }

    #[test]
    fn test_corrupted_body_is_parse_error_not_panic() {
        let env = Envelope {
            kind: MessageKind::Chat.code(),
            priority: Priority::High,
            timestamp_ms: 0,
            sequence: 0,
            body: vec![0xFF; 3],
        };
        assert!(env.decode_body().is_err());
    }

    #[test]
    fn test_flush_delays_match_protocol() {
        use std::time::Duration;
        assert_eq!(Priority::Critical.flush_delay(), Duration::ZERO);
        assert_eq!(Priority::High.flush_delay(), Duration::from_millis(8));
        assert_eq!(Priority::Medium.flush_delay(), Duration::from_millis(16));
        assert_eq!(Priority::Low.flush_delay(), Duration::from_millis(100));
    }

    #[test]
    fn test_envelope_logical_shape_is_stable() {
        // The envelope's logical shape (kind, priority, timestamp, sequence,
        // data) is part of the protocol contract; renaming a field is a wire
        // break even though postcard does not carry names.
        let env = envelope_for(&MessageBody::Ping(Ping { timestamp_ms: 9 }));
        let value = serde_json::to_value(&env).unwrap();
        for field in ["kind", "priority", "timestamp_ms", "sequence", "body"] {
            assert!(value.get(field).is_some(), "missing envelope field {field}");
        }
    }

    #[test]
    fn test_heartbeat_classification() {
        assert!(MessageKind::Ping.is_heartbeat());
        assert!(MessageKind::Pong.is_heartbeat());
        assert!(!MessageKind::EntityUpdate.is_heartbeat());
        assert!(!MessageKind::PlayerJoin.is_heartbeat());
    }
}
