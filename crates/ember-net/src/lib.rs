//! Peer-to-peer networking: datagram transport sessions, manual offer/answer
//! signaling, and the typed, prioritized message router.

pub mod compression;
pub mod messages;
pub mod negotiation;
pub mod router;
pub mod transport;

pub use compression::{CompressionConfig, CompressionError};
pub use messages::{
    Chat, EntityKind, EntitySnapshot, EntityStateBatch, EntityUpdate, Envelope, FullGameState,
    GameStateRequest, MessageBody, MessageKind, NetworkId, ParseError, PeerId, Ping, PlayerAction,
    PlayerInput, PlayerJoin, PlayerLeave, Pong, Priority, PROTOCOL_VERSION, deserialize_envelope,
    serialize_envelope, unix_millis,
};
pub use negotiation::{
    DescriptorRole, GATHERING_TIMEOUT, NegotiationError, NegotiationState, Negotiator,
    SessionDescriptor,
};
pub use router::{
    LatencyTracker, MessageRouter, Role, RouterConfig, RouterEvent, RouterStats,
};
pub use transport::{
    ConnectionState, ConnectionStateWatch, SessionRole, TransportConfig, TransportEvent,
};
