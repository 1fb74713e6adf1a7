//! Datagram transport sessions: one UDP socket per remote peer.
//!
//! A session owns a connection handshake (`Hello`/`HelloAck`), a message
//! channel (`ChannelOpen`/`ChannelAck`, opened by the offerer), and the data
//! path. Each session runs a background driver task; lifecycle changes and
//! received messages cross back to the frame thread through an mpsc channel
//! the router drains once per frame.
//!
//! The data path is deliberately lossy: sends while the channel is not open
//! are dropped silently, and there is no retransmission of data datagrams.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use crate::compression::{CompressionConfig, unwrap_payload, wrap_payload};
use crate::messages::{PROTOCOL_VERSION, PeerId};

// ---------------------------------------------------------------------------
// Connection state
// ---------------------------------------------------------------------------

/// Connection lifecycle state of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Handshake in progress.
    Connecting,
    /// Handshake complete; datagrams flow both ways.
    Connected,
    /// Session torn down, by either side or by staleness.
    Disconnected,
}

/// Observable connection state backed by a [`watch`] channel, so the router
/// and tests can read or await transitions without polling the driver.
pub struct ConnectionStateWatch {
    tx: watch::Sender<ConnectionState>,
    rx: watch::Receiver<ConnectionState>,
}

impl ConnectionStateWatch {
    /// Create a new watch initialized to [`ConnectionState::Connecting`].
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(ConnectionState::Connecting);
        Self { tx, rx }
    }

    /// Set the current state, notifying all subscribers.
    pub fn set(&self, state: ConnectionState) {
        let _ = self.tx.send(state);
    }

    /// Return the current state without blocking.
    pub fn current(&self) -> ConnectionState {
        *self.rx.borrow()
    }

    /// Return a new subscriber receiver.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.rx.clone()
    }
}

impl Default for ConnectionStateWatch {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Tunables for a transport session.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Retransmit interval for `Hello` and `ChannelOpen`. Default: 500 ms.
    pub hello_interval: Duration,
    /// After this long without a completed handshake, log a warning but keep
    /// trying. A soft timeout, not a failure. Default: 30 s.
    pub connect_warn_after: Duration,
    /// Tear the session down after this long without receiving any datagram
    /// while connected. Default: 15 s.
    pub idle_timeout: Duration,
    /// Largest datagram payload we will put on the wire. Oversized sends are
    /// dropped with a warning. Default: 60 000 bytes.
    pub max_datagram: usize,
    /// Data payload compression settings.
    pub compression: CompressionConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            hello_interval: Duration::from_millis(500),
            connect_warn_after: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(15),
            max_datagram: 60_000,
            compression: CompressionConfig::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Events a session driver reports to the router, tagged with the session's
/// [`PeerId`] on the shared event channel.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Handshake completed.
    Connected,
    /// Message channel is open in both directions.
    ChannelReady,
    /// A data payload arrived (decompressed envelope bytes).
    Message(Vec<u8>),
    /// The session ended.
    Disconnected {
        /// Why the session ended ("closed by remote", "timed out", ...).
        reason: String,
    },
}

/// Sender half of the shared event channel, cloned into every driver.
pub type EventSender = mpsc::UnboundedSender<(PeerId, TransportEvent)>;

/// Receiver half, drained by the router once per frame.
pub type EventReceiver = mpsc::UnboundedReceiver<(PeerId, TransportEvent)>;

/// Create the shared transport event channel.
pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

// ---------------------------------------------------------------------------
// Datagrams
// ---------------------------------------------------------------------------

/// Which side of the negotiation this session is. The offerer opens the
/// message channel once connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    /// Created the offer; opens the channel.
    Offerer,
    /// Created the answer; initiates the handshake and waits for the channel.
    Answerer,
}

/// Everything that can appear on the wire between two sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum Datagram {
    /// Handshake probe. Retransmitted to every remote candidate until one
    /// side answers.
    Hello { token: u64 },
    /// Handshake confirmation.
    HelloAck { token: u64 },
    /// Offerer opens the message channel.
    ChannelOpen,
    /// Answerer confirms the channel.
    ChannelAck,
    /// One compression-wrapped envelope.
    Data(Vec<u8>),
    /// Graceful close.
    Bye { reason: String },
}

fn encode_datagram(datagram: &Datagram) -> Result<Vec<u8>, postcard::Error> {
    let body = postcard::to_allocvec(datagram)?;
    let mut out = Vec::with_capacity(1 + body.len());
    out.push(PROTOCOL_VERSION);
    out.extend_from_slice(&body);
    Ok(out)
}

fn decode_datagram(data: &[u8]) -> Option<Datagram> {
    match data.split_first() {
        Some((&PROTOCOL_VERSION, body)) => postcard::from_bytes(body).ok(),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Socket setup
// ---------------------------------------------------------------------------

/// Bind and tune a UDP socket for a session, then hand it to tokio.
pub(crate) fn bind_socket(addr: SocketAddr) -> std::io::Result<UdpSocket> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_nonblocking(true)?;
    socket.set_recv_buffer_size(1 << 20)?;
    socket.set_send_buffer_size(1 << 20)?;
    socket.bind(&addr.into())?;
    UdpSocket::from_std(socket.into())
}

// ---------------------------------------------------------------------------
// Session handle
// ---------------------------------------------------------------------------

/// Frame-thread handle to one session. Owned by the router; dropping it does
/// not stop the driver — call [`SessionHandle::close`] for that.
pub struct SessionHandle {
    peer_id: PeerId,
    outgoing: mpsc::UnboundedSender<Vec<u8>>,
    state: Arc<ConnectionStateWatch>,
    channel_open: Arc<AtomicBool>,
    shutdown_tx: watch::Sender<bool>,
}

impl SessionHandle {
    /// The remote peer this session talks to.
    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.state.current()
    }

    /// Whether the message channel is open in both directions.
    pub fn channel_is_open(&self) -> bool {
        self.channel_open.load(Ordering::Acquire)
    }

    /// Queue envelope bytes for transmission. Best-effort: if the channel is
    /// not open the bytes are dropped silently — the protocol is lossy and
    /// callers observe loss only through the absence of a response.
    pub fn send(&self, bytes: Vec<u8>) {
        if !self.channel_is_open() {
            tracing::trace!("channel to {} not open, dropping {} bytes", self.peer_id, bytes.len());
            return;
        }
        let _ = self.outgoing.send(bytes);
    }

    /// Tear the session down. The driver sends a best-effort `Bye` and exits.
    pub fn close(&self) {
        let _ = self.shutdown_tx.send(true);
        self.state.set(ConnectionState::Disconnected);
    }
}

/// Spawn a session driver on the tokio runtime and return its handle.
///
/// `remote_candidates` come from the remote descriptor; the first candidate
/// that answers the handshake is locked in as the peer address.
pub(crate) fn spawn_session(
    socket: UdpSocket,
    remote_candidates: Vec<SocketAddr>,
    token: u64,
    role: SessionRole,
    peer_id: PeerId,
    events: EventSender,
    config: TransportConfig,
) -> SessionHandle {
    let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let state = Arc::new(ConnectionStateWatch::new());
    let channel_open = Arc::new(AtomicBool::new(false));

    let driver = Driver {
        socket,
        remote_candidates,
        token,
        role,
        peer_id: peer_id.clone(),
        events,
        state: Arc::clone(&state),
        channel_open: Arc::clone(&channel_open),
        config,
    };
    tokio::spawn(driver.run(outgoing_rx, shutdown_rx));

    SessionHandle {
        peer_id,
        outgoing: outgoing_tx,
        state,
        channel_open,
        shutdown_tx,
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

struct Driver {
    socket: UdpSocket,
    remote_candidates: Vec<SocketAddr>,
    token: u64,
    role: SessionRole,
    peer_id: PeerId,
    events: EventSender,
    state: Arc<ConnectionStateWatch>,
    channel_open: Arc<AtomicBool>,
    config: TransportConfig,
}

impl Driver {
    async fn run(
        self,
        mut outgoing: mpsc::UnboundedReceiver<Vec<u8>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let started = Instant::now();
        let mut last_recv = Instant::now();
        let mut remote_addr: Option<SocketAddr> = None;
        let mut connected = false;
        let mut warned_slow = false;
        let mut ticker = tokio::time::interval(self.config.hello_interval);
        let mut buf = vec![0u8; 65_536];

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if !connected {
                        self.send_hellos(remote_addr).await;
                        if !warned_slow && started.elapsed() >= self.config.connect_warn_after {
                            tracing::warn!(
                                "connection to {} not established after {:?}, still trying",
                                self.peer_id,
                                self.config.connect_warn_after
                            );
                            warned_slow = true;
                        }
                    } else {
                        if last_recv.elapsed() >= self.config.idle_timeout {
                            tracing::warn!("peer {} silent for {:?}, dropping session",
                                self.peer_id, self.config.idle_timeout);
                            self.emit(TransportEvent::Disconnected { reason: "timed out".into() });
                            self.state.set(ConnectionState::Disconnected);
                            break;
                        }
                        // The offerer retries ChannelOpen until acked.
                        if self.role == SessionRole::Offerer && !self.channel_open.load(Ordering::Acquire) {
                            if let Some(addr) = remote_addr {
                                self.send_to(&Datagram::ChannelOpen, addr).await;
                            }
                        }
                    }
                }
                result = self.socket.recv_from(&mut buf) => {
                    match result {
                        Ok((n, from)) => {
                            last_recv = Instant::now();
                            let done = self.handle_datagram(
                                &buf[..n], from, &mut remote_addr, &mut connected,
                            ).await;
                            if done {
                                break;
                            }
                        }
                        Err(e) => {
                            tracing::trace!("recv error on session {}: {e}", self.peer_id);
                            tokio::time::sleep(Duration::from_millis(20)).await;
                        }
                    }
                }
                Some(bytes) = outgoing.recv() => {
                    if let Some(addr) = remote_addr {
                        let wrapped = wrap_payload(&bytes, &self.config.compression);
                        if wrapped.len() > self.config.max_datagram {
                            tracing::warn!(
                                "dropping oversized datagram to {} ({} bytes > {})",
                                self.peer_id, wrapped.len(), self.config.max_datagram
                            );
                        } else {
                            self.send_to(&Datagram::Data(wrapped), addr).await;
                        }
                    }
                }
                changed = shutdown.changed() => {
                    // A dropped sender counts as shutdown too.
                    if changed.is_err() || *shutdown.borrow() {
                        if let Some(addr) = remote_addr {
                            self.send_to(&Datagram::Bye { reason: "closed".into() }, addr).await;
                        }
                        break;
                    }
                }
            }
        }
    }

    /// Process one incoming datagram. Returns `true` when the session is over.
    async fn handle_datagram(
        &self,
        data: &[u8],
        from: SocketAddr,
        remote_addr: &mut Option<SocketAddr>,
        connected: &mut bool,
    ) -> bool {
        let Some(datagram) = decode_datagram(data) else {
            tracing::debug!("undecodable datagram from {from}, ignoring");
            return false;
        };

        match datagram {
            Datagram::Hello { token } => {
                if token != self.token {
                    tracing::debug!("Hello with wrong token from {from}, ignoring");
                    return false;
                }
                remote_addr.get_or_insert(from);
                self.send_to(&Datagram::HelloAck { token }, from).await;
                if self.mark_connected(connected) && self.role == SessionRole::Offerer {
                    self.send_to(&Datagram::ChannelOpen, from).await;
                }
            }
            Datagram::HelloAck { token } => {
                if token != self.token {
                    return false;
                }
                remote_addr.get_or_insert(from);
                if self.mark_connected(connected) && self.role == SessionRole::Offerer {
                    self.send_to(&Datagram::ChannelOpen, from).await;
                }
            }
            Datagram::ChannelOpen => {
                // Answerer side: the channel may arrive any time after (or,
                // with reordering, before) the handshake completes; both
                // orders must work and opening twice is a no-op.
                remote_addr.get_or_insert(from);
                self.mark_connected(connected);
                self.send_to(&Datagram::ChannelAck, from).await;
                if !self.channel_open.swap(true, Ordering::AcqRel) {
                    self.emit(TransportEvent::ChannelReady);
                }
            }
            Datagram::ChannelAck => {
                remote_addr.get_or_insert(from);
                self.mark_connected(connected);
                if !self.channel_open.swap(true, Ordering::AcqRel) {
                    self.emit(TransportEvent::ChannelReady);
                }
            }
            Datagram::Data(payload) => {
                if !self.channel_open.load(Ordering::Acquire) {
                    tracing::trace!("data before channel open from {from}, dropping");
                    return false;
                }
                match unwrap_payload(&payload) {
                    Ok(bytes) => self.emit(TransportEvent::Message(bytes)),
                    Err(e) => tracing::debug!("bad data payload from {}: {e}", self.peer_id),
                }
            }
            Datagram::Bye { reason } => {
                tracing::info!("peer {} closed the session: {reason}", self.peer_id);
                self.emit(TransportEvent::Disconnected {
                    reason: format!("closed by remote: {reason}"),
                });
                self.state.set(ConnectionState::Disconnected);
                return true;
            }
        }
        false
    }

    /// Returns `true` the first time the session transitions to connected.
    fn mark_connected(&self, connected: &mut bool) -> bool {
        if *connected {
            return false;
        }
        *connected = true;
        self.state.set(ConnectionState::Connected);
        self.emit(TransportEvent::Connected);
        true
    }

    async fn send_hellos(&self, locked: Option<SocketAddr>) {
        let hello = Datagram::Hello { token: self.token };
        match locked {
            Some(addr) => self.send_to(&hello, addr).await,
            None => {
                for addr in self.remote_candidates.clone() {
                    self.send_to(&hello, addr).await;
                }
            }
        }
    }

    async fn send_to(&self, datagram: &Datagram, addr: SocketAddr) {
        match encode_datagram(datagram) {
            Ok(bytes) => {
                if let Err(e) = self.socket.send_to(&bytes, addr).await {
                    tracing::trace!("send to {addr} failed: {e}");
                }
            }
            Err(e) => tracing::error!("datagram encode failed: {e}"),
        }
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send((self.peer_id.clone(), event));
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> TransportConfig {
        TransportConfig {
            hello_interval: Duration::from_millis(50),
            ..Default::default()
        }
    }

    /// Wire two sessions to each other over loopback and return their handles
    /// and event receivers.
    async fn session_pair(
        offer_token: u64,
        answer_token: u64,
    ) -> (SessionHandle, EventReceiver, SessionHandle, EventReceiver) {
        let sock_a = bind_socket("127.0.0.1:0".parse().unwrap()).unwrap();
        let sock_b = bind_socket("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr_a = sock_a.local_addr().unwrap();
        let addr_b = sock_b.local_addr().unwrap();

        let (tx_a, rx_a) = event_channel();
        let (tx_b, rx_b) = event_channel();

        let a = spawn_session(
            sock_a,
            vec![addr_b],
            offer_token,
            SessionRole::Offerer,
            PeerId("b".into()),
            tx_a,
            test_config(),
        );
        let b = spawn_session(
            sock_b,
            vec![addr_a],
            answer_token,
            SessionRole::Answerer,
            PeerId("a".into()),
            tx_b,
            test_config(),
        );
        (a, rx_a, b, rx_b)
    }

    /// Drain events until `want` shows up or the timeout passes.
    async fn wait_for(rx: &mut EventReceiver, want: fn(&TransportEvent) -> bool) -> bool {
        tokio::time::timeout(Duration::from_secs(2), async {
            while let Some((_, event)) = rx.recv().await {
                if want(&event) {
                    return true;
                }
            }
            false
        })
        .await
        .unwrap_or(false)
    }

    #[tokio::test]
    async fn test_sessions_connect_and_open_channel() {
        let (_a, mut rx_a, _b, mut rx_b) = session_pair(42, 42).await;

        assert!(wait_for(&mut rx_a, |e| *e == TransportEvent::Connected).await);
        assert!(wait_for(&mut rx_b, |e| *e == TransportEvent::Connected).await);
        assert!(wait_for(&mut rx_a, |e| *e == TransportEvent::ChannelReady).await);
        assert!(wait_for(&mut rx_b, |e| *e == TransportEvent::ChannelReady).await);
    }

    #[tokio::test]
    async fn test_data_flows_after_channel_ready() {
        let (a, mut rx_a, _b, mut rx_b) = session_pair(7, 7).await;
        assert!(wait_for(&mut rx_a, |e| *e == TransportEvent::ChannelReady).await);
        assert!(wait_for(&mut rx_b, |e| *e == TransportEvent::ChannelReady).await);

        a.send(vec![9, 8, 7, 6]);
        assert!(
            wait_for(&mut rx_b, |e| matches!(
                e,
                TransportEvent::Message(bytes) if bytes == &[9, 8, 7, 6]
            ))
            .await
        );
    }

    #[tokio::test]
    async fn test_send_before_channel_open_is_dropped() {
        let (a, _rx_a, _b, mut rx_b) = session_pair(1, 1).await;
        // No channel yet — the send must be a silent no-op.
        a.send(vec![1, 2, 3]);

        assert!(wait_for(&mut rx_b, |e| *e == TransportEvent::ChannelReady).await);
        // Give any stray delivery a moment, then confirm nothing arrived.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let mut got_message = false;
        while let Ok((_, event)) = rx_b.try_recv() {
            if matches!(event, TransportEvent::Message(_)) {
                got_message = true;
            }
        }
        assert!(!got_message, "pre-channel send must not be delivered");
    }

    #[tokio::test]
    async fn test_token_mismatch_never_connects() {
        let (_a, mut rx_a, _b, _rx_b) = session_pair(1, 2).await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        let mut connected = false;
        while let Ok((_, event)) = rx_a.try_recv() {
            if event == TransportEvent::Connected {
                connected = true;
            }
        }
        assert!(!connected, "mismatched tokens must not shake hands");
    }

    #[tokio::test]
    async fn test_close_notifies_remote() {
        let (a, mut rx_a, _b, mut rx_b) = session_pair(3, 3).await;
        assert!(wait_for(&mut rx_a, |e| *e == TransportEvent::ChannelReady).await);

        a.close();
        assert_eq!(a.state(), ConnectionState::Disconnected);
        assert!(
            wait_for(&mut rx_b, |e| matches!(e, TransportEvent::Disconnected { .. })).await
        );
    }

    #[tokio::test]
    async fn test_datagram_codec_rejects_garbage() {
        assert_eq!(decode_datagram(&[]), None);
        assert_eq!(decode_datagram(&[0xFF, 0x00]), None);

        let bytes = encode_datagram(&Datagram::Hello { token: 5 }).unwrap();
        assert_eq!(decode_datagram(&bytes), Some(Datagram::Hello { token: 5 }));
    }
}
