//! Host-authoritative game-state synchronization on top of `ember-net`:
//! peer ↔ network identity mapping, full-state bootstrap for joining peers,
//! and fixed-cadence incremental entity sync.

pub mod identity;
pub mod manager;
pub mod store;

pub use identity::{IdAllocator, PeerIdentityMap};
pub use manager::{SyncConfig, SyncEvent, SyncManager};
pub use store::{EntityStore, MemoryStore};
