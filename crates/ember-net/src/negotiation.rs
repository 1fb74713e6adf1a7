//! Manual offer/answer signaling: no signaling server, no side channel.
//!
//! The negotiator produces opaque descriptor blobs (base64 over postcard)
//! that a human copy-pastes between two machines: the host's offer one way,
//! the client's answer back. Each blob carries the sender's stable peer id,
//! a shared session token, and the gathered socket candidates the remote
//! side should try. Blobs round-trip byte-for-byte; nothing inspects them in
//! transit.
//!
//! Candidate gathering plays the role ICE plays in a browser: the loopback
//! address, the concretely bound address, and the default-route interface
//! address (found with a connected UDP probe that sends no packets). Gathering
//! runs under a bounded timeout and proceeds with a partial set when it
//! expires.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;

use crate::messages::PeerId;
use crate::transport::{
    EventSender, SessionHandle, SessionRole, TransportConfig, bind_socket, spawn_session,
};

/// How long candidate gathering may run before we ship whatever we have.
pub const GATHERING_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors surfaced by the negotiation calls. Never retried automatically;
/// the embedding UI decides whether to restart the flow.
#[derive(Debug, thiserror::Error)]
pub enum NegotiationError {
    /// No usable transport: the socket could not be bound.
    #[error("no usable transport: {0}")]
    NoTransport(#[from] std::io::Error),

    /// The descriptor blob could not be decoded.
    #[error("malformed descriptor blob: {0}")]
    Malformed(String),

    /// A descriptor of the wrong role was supplied (answer where an offer
    /// was expected, or vice versa).
    #[error("expected {expected:?} descriptor, got {got:?}")]
    WrongRole {
        /// Role the call required.
        expected: DescriptorRole,
        /// Role found in the blob.
        got: DescriptorRole,
    },

    /// The answer does not belong to the pending offer.
    #[error("answer token does not match the pending offer")]
    TokenMismatch,

    /// The operation is not valid in the current negotiation phase, e.g.
    /// processing an answer with no offer pending.
    #[error("no negotiation in progress that can accept this descriptor")]
    InvalidState,
}

// ---------------------------------------------------------------------------
// Descriptor
// ---------------------------------------------------------------------------

/// Which direction a descriptor travels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DescriptorRole {
    /// Host → client.
    Offer,
    /// Client → host.
    Answer,
}

/// Everything one endpoint needs to reach the other. Serialized into the
/// opaque blob exchanged out of band.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDescriptor {
    /// Offer or answer.
    pub role: DescriptorRole,
    /// Shared secret of this negotiation; both sides must present it during
    /// the transport handshake.
    pub session_token: u64,
    /// Stable peer id of the descriptor's author.
    pub peer_id: PeerId,
    /// Socket addresses the remote side should try, in preference order.
    pub candidates: Vec<SocketAddr>,
}

impl SessionDescriptor {
    /// Encode into the copy-pasteable blob form.
    pub fn to_blob(&self) -> Result<String, NegotiationError> {
        let bytes =
            postcard::to_allocvec(self).map_err(|e| NegotiationError::Malformed(e.to_string()))?;
        Ok(base64::encode(bytes))
    }

    /// Decode from a blob produced by [`SessionDescriptor::to_blob`].
    pub fn from_blob(blob: &str) -> Result<Self, NegotiationError> {
        let bytes = base64::decode(blob.trim())
            .map_err(|e| NegotiationError::Malformed(e.to_string()))?;
        postcard::from_bytes(&bytes).map_err(|e| NegotiationError::Malformed(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

/// Signaling phase of the current negotiation. Transport-level progress
/// (`Connecting → Connected`/`Disconnected`) is observed on the returned
/// session handle, not here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    /// Nothing in flight.
    Idle,
    /// Gathering candidates for an offer.
    Offering,
    /// Offer produced; waiting for the remote answer blob.
    AwaitingAnswer,
    /// Gathering candidates for an answer.
    Answering,
    /// Descriptors exchanged; the transport handshake is running.
    Connecting,
}

// ---------------------------------------------------------------------------
// Negotiator
// ---------------------------------------------------------------------------

/// Pending host-side session between `create_offer` and `process_answer`.
struct PendingOffer {
    socket: UdpSocket,
    token: u64,
}

/// Drives one manual offer/answer exchange at a time.
///
/// The host calls [`Negotiator::create_offer`], passes the blob out of band,
/// and feeds the reply to [`Negotiator::process_answer`]. The client calls
/// [`Negotiator::create_answer`] with the received offer. There is no
/// renegotiation: a failed exchange starts over, and a fresh `create_offer`
/// discards any pending one.
pub struct Negotiator {
    local_peer: PeerId,
    config: TransportConfig,
    events: EventSender,
    gathering_timeout: Duration,
    pending: Option<PendingOffer>,
    state: NegotiationState,
}

impl Negotiator {
    /// Create a negotiator for the given local identity. Session drivers it
    /// spawns report into `events`.
    pub fn new(local_peer: PeerId, config: TransportConfig, events: EventSender) -> Self {
        Self {
            local_peer,
            config,
            events,
            gathering_timeout: GATHERING_TIMEOUT,
            pending: None,
            state: NegotiationState::Idle,
        }
    }

    /// Override the gathering timeout (tests).
    #[cfg(test)]
    pub(crate) fn set_gathering_timeout(&mut self, timeout: Duration) {
        self.gathering_timeout = timeout;
    }

    /// Current signaling phase.
    pub fn state(&self) -> NegotiationState {
        self.state
    }

    /// Host side: bind a fresh session socket, gather candidates, and return
    /// the offer blob. Any previously pending offer is discarded.
    pub async fn create_offer(&mut self) -> Result<String, NegotiationError> {
        if self.pending.take().is_some() {
            tracing::info!("discarding pending offer, starting a new negotiation");
        }
        self.state = NegotiationState::Offering;

        let socket = bind_socket(unspecified_addr()).map_err(NegotiationError::NoTransport)?;
        let candidates = gather_candidates(&socket, self.gathering_timeout).await;
        let token = rand::random::<u64>();

        let descriptor = SessionDescriptor {
            role: DescriptorRole::Offer,
            session_token: token,
            peer_id: self.local_peer.clone(),
            candidates,
        };
        let blob = descriptor.to_blob()?;

        self.pending = Some(PendingOffer { socket, token });
        self.state = NegotiationState::AwaitingAnswer;
        tracing::info!("offer ready ({} candidates)", descriptor.candidates.len());
        Ok(blob)
    }

    /// Client side: consume an offer blob, bind the local session socket,
    /// and return the answer blob plus the live session handle. The session
    /// starts its handshake immediately; the host completes its own side
    /// when it processes the answer.
    pub async fn create_answer(
        &mut self,
        offer_blob: &str,
    ) -> Result<(String, SessionHandle), NegotiationError> {
        let offer = SessionDescriptor::from_blob(offer_blob)?;
        if offer.role != DescriptorRole::Offer {
            return Err(NegotiationError::WrongRole {
                expected: DescriptorRole::Offer,
                got: offer.role,
            });
        }
        self.state = NegotiationState::Answering;

        let socket = bind_socket(unspecified_addr()).map_err(NegotiationError::NoTransport)?;
        let candidates = gather_candidates(&socket, self.gathering_timeout).await;

        let answer = SessionDescriptor {
            role: DescriptorRole::Answer,
            session_token: offer.session_token,
            peer_id: self.local_peer.clone(),
            candidates,
        };
        let blob = answer.to_blob()?;

        let handle = spawn_session(
            socket,
            offer.candidates,
            offer.session_token,
            SessionRole::Answerer,
            offer.peer_id.clone(),
            self.events.clone(),
            self.config.clone(),
        );
        self.state = NegotiationState::Connecting;
        tracing::info!("answer ready, connecting to host {}", offer.peer_id);
        Ok((blob, handle))
    }

    /// Host side: apply the remote answer to the pending offer, promoting it
    /// to a live session registered under the answerer's stable peer id.
    pub fn process_answer(&mut self, answer_blob: &str) -> Result<SessionHandle, NegotiationError> {
        let answer = SessionDescriptor::from_blob(answer_blob)?;
        if answer.role != DescriptorRole::Answer {
            return Err(NegotiationError::WrongRole {
                expected: DescriptorRole::Answer,
                got: answer.role,
            });
        }

        let Some(pending) = self.pending.take() else {
            return Err(NegotiationError::InvalidState);
        };
        if answer.session_token != pending.token {
            // Keep the offer pending: the right answer may still be pasted.
            self.pending = Some(pending);
            return Err(NegotiationError::TokenMismatch);
        }

        let handle = spawn_session(
            pending.socket,
            answer.candidates,
            pending.token,
            SessionRole::Offerer,
            answer.peer_id.clone(),
            self.events.clone(),
            self.config.clone(),
        );
        self.state = NegotiationState::Connecting;
        tracing::info!("answer accepted, connecting to peer {}", answer.peer_id);
        Ok(handle)
    }
}

// ---------------------------------------------------------------------------
// Candidate gathering
// ---------------------------------------------------------------------------

fn unspecified_addr() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
}

/// Collect the addresses the remote side should try for `socket`.
///
/// Loopback and the concrete bound address are immediate; the default-route
/// probe runs under `timeout` and is skipped with a warning when it expires.
async fn gather_candidates(socket: &UdpSocket, timeout: Duration) -> Vec<SocketAddr> {
    let mut candidates = Vec::new();
    let Ok(local) = socket.local_addr() else {
        return candidates;
    };
    let port = local.port();

    if !local.ip().is_unspecified() {
        candidates.push(local);
    }
    candidates.push(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port));

    match tokio::time::timeout(timeout, default_route_ip()).await {
        Ok(Some(ip)) => candidates.push(SocketAddr::new(ip, port)),
        Ok(None) => {}
        Err(_) => {
            tracing::warn!(
                "candidate gathering timed out after {timeout:?}, proceeding with {} candidates",
                candidates.len()
            );
        }
    }

    candidates.dedup();
    candidates
}

/// The local address a packet toward the public internet would leave from.
/// Connecting a UDP socket selects a route without sending anything.
async fn default_route_ip() -> Option<IpAddr> {
    let probe = UdpSocket::bind(unspecified_addr()).await.ok()?;
    probe.connect("8.8.8.8:53").await.ok()?;
    probe.local_addr().ok().map(|addr| addr.ip())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{ConnectionState, TransportEvent, event_channel};

    fn fast_config() -> TransportConfig {
        TransportConfig {
            hello_interval: Duration::from_millis(50),
            ..Default::default()
        }
    }

    fn negotiator(name: &str) -> (Negotiator, crate::transport::EventReceiver) {
        let (tx, rx) = event_channel();
        let mut n = Negotiator::new(PeerId(name.to_string()), fast_config(), tx);
        n.set_gathering_timeout(Duration::from_secs(2));
        (n, rx)
    }

    #[test]
    fn test_descriptor_blob_roundtrips() {
        let descriptor = SessionDescriptor {
            role: DescriptorRole::Offer,
            session_token: 0xDEAD_BEEF,
            peer_id: PeerId("host".into()),
            candidates: vec!["127.0.0.1:4000".parse().unwrap(), "10.0.0.2:4000".parse().unwrap()],
        };
        let blob = descriptor.to_blob().unwrap();
        let parsed = SessionDescriptor::from_blob(&blob).unwrap();
        assert_eq!(parsed, descriptor);
        // The blob itself must survive a copy-paste unchanged.
        assert_eq!(parsed.to_blob().unwrap(), blob);
    }

    #[test]
    fn test_malformed_blob_rejected() {
        assert!(matches!(
            SessionDescriptor::from_blob("definitely not base64!!!"),
            Err(NegotiationError::Malformed(_))
        ));
        // Valid base64, garbage contents.
        assert!(matches!(
            SessionDescriptor::from_blob(&base64::encode([0xFFu8; 4])),
            Err(NegotiationError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn test_process_answer_without_offer_is_invalid_state() {
        let (mut host, _rx) = negotiator("host");
        let fake = SessionDescriptor {
            role: DescriptorRole::Answer,
            session_token: 1,
            peer_id: PeerId("client".into()),
            candidates: vec!["127.0.0.1:1234".parse().unwrap()],
        };
        let result = host.process_answer(&fake.to_blob().unwrap());
        assert!(matches!(result, Err(NegotiationError::InvalidState)));
    }

    #[tokio::test]
    async fn test_answer_requires_offer_descriptor() {
        let (mut client, _rx) = negotiator("client");
        let answer = SessionDescriptor {
            role: DescriptorRole::Answer,
            session_token: 1,
            peer_id: PeerId("x".into()),
            candidates: vec![],
        };
        let result = client.create_answer(&answer.to_blob().unwrap()).await;
        assert!(matches!(result, Err(NegotiationError::WrongRole { .. })));
    }

    #[tokio::test]
    async fn test_stale_answer_token_rejected() {
        let (mut host, _rx) = negotiator("host");
        let _first_offer = host.create_offer().await.unwrap();
        let answer = SessionDescriptor {
            role: DescriptorRole::Answer,
            session_token: 12345, // not the pending token
            peer_id: PeerId("client".into()),
            candidates: vec!["127.0.0.1:1234".parse().unwrap()],
        };
        let result = host.process_answer(&answer.to_blob().unwrap());
        assert!(matches!(result, Err(NegotiationError::TokenMismatch)));
    }

    #[tokio::test]
    async fn test_offer_answer_roundtrip_connects_both_sides() {
        let (mut host, mut host_rx) = negotiator("host");
        let (mut client, mut client_rx) = negotiator("client");

        let offer = host.create_offer().await.unwrap();
        assert!(!offer.is_empty());
        assert_eq!(host.state(), NegotiationState::AwaitingAnswer);

        let (answer, client_session) = client.create_answer(&offer).await.unwrap();
        assert_eq!(client.state(), NegotiationState::Connecting);

        let host_session = host.process_answer(&answer).unwrap();
        assert_eq!(host.state(), NegotiationState::Connecting);

        let deadline = Duration::from_secs(2);
        let host_connected = tokio::time::timeout(deadline, async {
            loop {
                if let Some((_, TransportEvent::Connected)) = host_rx.recv().await {
                    break;
                }
            }
        })
        .await;
        let client_connected = tokio::time::timeout(deadline, async {
            loop {
                if let Some((_, TransportEvent::Connected)) = client_rx.recv().await {
                    break;
                }
            }
        })
        .await;

        assert!(host_connected.is_ok(), "host side never connected");
        assert!(client_connected.is_ok(), "client side never connected");
        assert_eq!(host_session.state(), ConnectionState::Connected);
        assert_eq!(client_session.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_new_offer_discards_pending_one() {
        let (mut host, _rx) = negotiator("host");
        let first = host.create_offer().await.unwrap();
        let _second = host.create_offer().await.unwrap();

        // An answer to the first offer no longer matches the pending token
        // (a fresh token is minted per offer).
        let first_descriptor = SessionDescriptor::from_blob(&first).unwrap();
        let stale_answer = SessionDescriptor {
            role: DescriptorRole::Answer,
            session_token: first_descriptor.session_token,
            peer_id: PeerId("client".into()),
            candidates: vec!["127.0.0.1:9".parse().unwrap()],
        };
        let result = host.process_answer(&stale_answer.to_blob().unwrap());
        assert!(matches!(result, Err(NegotiationError::TokenMismatch)));
    }
}
