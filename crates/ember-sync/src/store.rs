//! The entity-store seam between synchronization and the game world.
//!
//! The sync layer never owns entities. It reads snapshots out of the store,
//! writes transform fields back on incoming updates, and creates/destroys
//! entities only on the full-state bootstrap path (plus the self-heal spawn
//! for updates naming entities the store has never seen).

use std::collections::BTreeMap;

use ember_net::{EntitySnapshot, NetworkId};

/// Narrow interface the [`crate::SyncManager`] drives the external entity
/// world through.
pub trait EntityStore {
    /// Snapshot every live entity.
    fn snapshot_entities(&self) -> Vec<EntitySnapshot>;

    /// Snapshot one entity by id.
    fn get_entity(&self, entity_id: &str) -> Option<EntitySnapshot>;

    /// Write `snapshot`'s transform fields (position, rotation, velocity,
    /// frame) onto the existing entity. Returns `false` if the entity is
    /// unknown; the store is left untouched in that case.
    fn apply_update(&mut self, snapshot: &EntitySnapshot) -> bool;

    /// Create an entity from a snapshot. Bootstrap and self-heal path only.
    fn spawn_entity(&mut self, snapshot: &EntitySnapshot);

    /// Remove every entity except those owned by `keep_owner`. Bootstrap
    /// path only.
    fn despawn_all_except(&mut self, keep_owner: Option<NetworkId>);
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

/// Reference in-process [`EntityStore`]: a plain ordered map of snapshots.
/// The tests run against it; a real game adapts its ECS instead.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entities: BTreeMap<String, EntitySnapshot>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entities.
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// Whether the store holds no entities.
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

impl EntityStore for MemoryStore {
    fn snapshot_entities(&self) -> Vec<EntitySnapshot> {
        self.entities.values().cloned().collect()
    }

    fn get_entity(&self, entity_id: &str) -> Option<EntitySnapshot> {
        self.entities.get(entity_id).cloned()
    }

    fn apply_update(&mut self, snapshot: &EntitySnapshot) -> bool {
        let Some(entity) = self.entities.get_mut(&snapshot.entity_id) else {
            return false;
        };
        entity.position = snapshot.position;
        entity.rotation = snapshot.rotation;
        entity.velocity = snapshot.velocity;
        entity.frame = snapshot.frame;
        true
    }

    fn spawn_entity(&mut self, snapshot: &EntitySnapshot) {
        self.entities
            .insert(snapshot.entity_id.clone(), snapshot.clone());
    }

    fn despawn_all_except(&mut self, keep_owner: Option<NetworkId>) {
        self.entities
            .retain(|_, entity| keep_owner.is_some() && entity.owner == keep_owner);
    }
}
