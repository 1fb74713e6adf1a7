//! Peer ↔ network identity mapping.
//!
//! The host mints a [`NetworkId`] for every peer whose channel comes up and
//! records the pairing here. Gameplay messages name players by network id;
//! the transport names them by peer id; this map translates both ways.

use std::collections::HashMap;

use ember_net::{NetworkId, PeerId};

// ---------------------------------------------------------------------------
// IdAllocator
// ---------------------------------------------------------------------------

/// Monotonic [`NetworkId`] allocator. Only the host allocates; ids are never
/// reused within a session.
#[derive(Debug)]
pub struct IdAllocator {
    next: u64,
}

impl IdAllocator {
    /// Create an allocator starting at id 1.
    pub fn new() -> Self {
        Self { next: 1 }
    }

    /// Mint the next id.
    pub fn allocate(&mut self) -> NetworkId {
        let id = NetworkId(self.next);
        self.next += 1;
        id
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// PeerIdentityMap
// ---------------------------------------------------------------------------

/// Bidirectional peer-id ↔ network-id map.
///
/// Invariant: each mapped peer has exactly one network id and vice versa.
/// Entries live as long as the peer's connection.
#[derive(Debug, Default)]
pub struct PeerIdentityMap {
    by_peer: HashMap<PeerId, NetworkId>,
    by_network: HashMap<NetworkId, PeerId>,
}

impl PeerIdentityMap {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a pairing, displacing any stale mapping either key held.
    pub fn insert(&mut self, peer: PeerId, network_id: NetworkId) {
        if let Some(old_id) = self.by_peer.remove(&peer) {
            self.by_network.remove(&old_id);
        }
        if let Some(old_peer) = self.by_network.remove(&network_id) {
            self.by_peer.remove(&old_peer);
        }
        self.by_peer.insert(peer.clone(), network_id);
        self.by_network.insert(network_id, peer);
    }

    /// Network id of a peer, if mapped.
    pub fn network_id(&self, peer: &PeerId) -> Option<NetworkId> {
        self.by_peer.get(peer).copied()
    }

    /// Peer owning a network id, if mapped.
    pub fn peer_id(&self, network_id: NetworkId) -> Option<&PeerId> {
        self.by_network.get(&network_id)
    }

    /// Drop a peer's mapping, returning its network id if it had one.
    pub fn remove_peer(&mut self, peer: &PeerId) -> Option<NetworkId> {
        let network_id = self.by_peer.remove(peer)?;
        self.by_network.remove(&network_id);
        Some(network_id)
    }

    /// Number of mapped peers.
    pub fn len(&self) -> usize {
        self.by_peer.len()
    }

    /// Whether the map is empty.
    pub fn is_empty(&self) -> bool {
        self.by_peer.is_empty()
    }
}
