//! The replica-side mirror: a mapping from id to materialized entity plus a
//! named set of secondary indices.
//!
//! [`Table::apply`] folds committed [`Change`]s into the mapping and pushes
//! each mutation through every index before returning, so no reader ever
//! sees an index out of step with the base map. A table has exactly one
//! owner; nothing here is synchronized.
//!
//! The table remembers the version of every entity it holds. A change older
//! than what the table already holds is ignored, which makes redelivery
//! after a resubscription harmless. Deleted ids are forgotten unless the
//! table was built with [`TableBuilder::keep_tombstones`], in which case the
//! delete version is kept (a tombstone) and blocks stale resurrection until
//! [`Table::prune_tombstones`] drops it.
//!
//! # Example
//!
//! ```
//! use tessel_ecs::prelude::*;
//! use serde_json::json;
//!
//! let mut table = Table::builder()
//!     .index("spatial", SpatialIndex::new(SpatialIndexConfig::default()))
//!     .build()
//!     .unwrap();
//!
//! let id = EntityId::new(1).unwrap();
//! table.apply(&[Change::create(1, Entity::new(id).with("position", json!({"v": [0, 0, 0]})))]);
//! let spatial = table.index::<SpatialIndex>("spatial").unwrap();
//! assert_eq!(spatial.scan_sphere([0.0; 3], 1.0), vec![id]);
//!
//! // Deleting an id the table never held changes nothing.
//! let ghost = EntityId::new(99).unwrap();
//! assert!(!table.apply(&[Change::delete(2, ghost)]));
//! ```

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;

use crate::change::Change;
use crate::entity::{Entity, EntityId};
use crate::index::SecondaryIndex;
use crate::EcsError;

#[derive(Debug, Clone)]
struct Stored {
    version: u64,
    entity: Entity,
}

// ---------------------------------------------------------------------------
// TableBuilder
// ---------------------------------------------------------------------------

/// Collects named indices for a new [`Table`].
#[derive(Default)]
pub struct TableBuilder {
    indices: Vec<(String, Box<dyn SecondaryIndex>)>,
    keep_tombstones: bool,
}

impl TableBuilder {
    pub fn index(mut self, name: impl Into<String>, index: impl SecondaryIndex) -> Self {
        self.indices.push((name.into(), Box::new(index)));
        self
    }

    /// Remember the delete version of every deleted id.
    pub fn keep_tombstones(mut self) -> Self {
        self.keep_tombstones = true;
        self
    }

    /// Fails if two indices share a name.
    pub fn build(self) -> Result<Table, EcsError> {
        let mut table = Table::new();
        table.keep_tombstones = self.keep_tombstones;
        for (name, index) in self.indices {
            table.add_boxed_index(name, index)?;
        }
        Ok(table)
    }
}

// ---------------------------------------------------------------------------
// Table
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct Table {
    entities: HashMap<EntityId, Stored>,
    tombstones: HashMap<EntityId, u64>,
    indices: Vec<(String, Box<dyn SecondaryIndex>)>,
    keep_tombstones: bool,
    max_version: u64,
}

impl Table {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builder() -> TableBuilder {
        TableBuilder::default()
    }

    /// Register an index, backfilling it from the current contents.
    pub fn add_index(
        &mut self,
        name: impl Into<String>,
        index: impl SecondaryIndex,
    ) -> Result<(), EcsError> {
        self.add_boxed_index(name.into(), Box::new(index))
    }

    fn add_boxed_index(
        &mut self,
        name: String,
        mut index: Box<dyn SecondaryIndex>,
    ) -> Result<(), EcsError> {
        if self.indices.iter().any(|(n, _)| *n == name) {
            return Err(EcsError::DuplicateIndex { name });
        }
        for stored in self.entities.values() {
            index.update(None, &stored.entity);
        }
        self.indices.push((name, index));
        Ok(())
    }

    /// Fetch a typed index by name.
    pub fn index<I: SecondaryIndex>(&self, name: &str) -> Option<&I> {
        self.index_dyn(name)?.as_any().downcast_ref::<I>()
    }

    pub fn index_dyn(&self, name: &str) -> Option<&dyn SecondaryIndex> {
        self.indices
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, index)| index.as_ref())
    }

    pub fn index_names(&self) -> impl Iterator<Item = &str> {
        self.indices.iter().map(|(n, _)| n.as_str())
    }

    // -- reads --------------------------------------------------------------

    pub fn get(&self, id: EntityId) -> Option<&Entity> {
        self.entities.get(&id).map(|s| &s.entity)
    }

    pub fn get_with_version(&self, id: EntityId) -> Option<(u64, &Entity)> {
        self.entities.get(&id).map(|s| (s.version, &s.entity))
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.entities.contains_key(&id)
    }

    /// Version of a live entity.
    pub fn version_of(&self, id: EntityId) -> Option<u64> {
        self.entities.get(&id).map(|s| s.version)
    }

    /// Version of the last change seen for `id`. Deleted ids only report a
    /// version while their tombstone is kept.
    pub fn last_version(&self, id: EntityId) -> Option<u64> {
        self.version_of(id)
            .or_else(|| self.tombstones.get(&id).copied())
    }

    /// Highest version applied so far.
    pub fn max_version(&self) -> u64 {
        self.max_version
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn tombstone_count(&self) -> usize {
        self.tombstones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.entities.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (EntityId, &Entity)> {
        self.entities.iter().map(|(id, s)| (*id, &s.entity))
    }

    // -- writes -------------------------------------------------------------

    /// Apply committed changes in order. Returns `true` iff the visible
    /// contents changed.
    pub fn apply(&mut self, changes: &[Change]) -> bool {
        let mut changed = false;
        for change in changes {
            changed |= self.apply_one(change);
        }
        changed
    }

    fn apply_one(&mut self, change: &Change) -> bool {
        let id = change.id();
        let version = change.version();
        if let Some(seen) = self.last_version(id) {
            if version < seen {
                tracing::trace!(
                    entity = %id,
                    version,
                    seen,
                    "ignoring stale change"
                );
                return false;
            }
        }
        self.max_version = self.max_version.max(version);

        if change.is_delete() {
            if self.keep_tombstones {
                self.tombstones.insert(id, version);
            }
            if self.entities.remove(&id).is_none() {
                return false;
            }
            for (_, index) in &mut self.indices {
                index.delete(id);
            }
            return true;
        }

        let old = self.entities.remove(&id);
        self.tombstones.remove(&id);
        let Some(new) = change.apply_to(old.as_ref().map(|s| &s.entity)) else {
            return false;
        };
        let changed = old.as_ref().map_or(true, |s| s.entity != new);
        if changed {
            for (_, index) in &mut self.indices {
                index.update(old.as_ref().map(|s| &s.entity), &new);
            }
        }
        self.entities.insert(id, Stored { version, entity: new });
        changed
    }

    /// Forget tombstones at or below `through`. Returns how many were
    /// dropped.
    pub fn prune_tombstones(&mut self, through: u64) -> usize {
        let before = self.tombstones.len();
        self.tombstones.retain(|_, version| *version > through);
        before - self.tombstones.len()
    }

    /// Drop every entity and tombstone and clear every index.
    pub fn clear(&mut self) {
        self.entities.clear();
        self.tombstones.clear();
        for (_, index) in &mut self.indices {
            index.clear();
        }
        self.max_version = 0;
    }

    /// Content hash over `(id, version, components)` in id order. Two tables
    /// fed the same committed stream hash identically.
    pub fn state_hash(&self) -> Result<String, EcsError> {
        #[derive(Serialize)]
        struct HashableEntry<'a> {
            version: u64,
            components: &'a crate::entity::Components,
        }

        let ordered: BTreeMap<u64, HashableEntry<'_>> = self
            .entities
            .iter()
            .map(|(id, s)| {
                (
                    id.to_raw(),
                    HashableEntry {
                        version: s.version,
                        components: &s.entity.components,
                    },
                )
            })
            .collect();

        let bytes = serde_json::to_vec(&ordered).map_err(|e| EcsError::Serialization {
            details: e.to_string(),
        })?;
        Ok(blake3::hash(&bytes).to_hex().to_string())
    }
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("entities", &self.entities.len())
            .field("tombstones", &self.tombstones.len())
            .field("indices", &self.index_names().collect::<Vec<_>>())
            .field("max_version", &self.max_version)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::ComponentMatcher;
    use crate::entity::EntityDelta;
    use crate::index::presence::PresenceIndex;
    use serde_json::json;

    fn id(raw: u64) -> EntityId {
        EntityId::new(raw).unwrap()
    }

    fn table() -> Table {
        Table::builder()
            .index("hp", PresenceIndex::new(ComponentMatcher::new(["hp"])))
            .build()
            .unwrap()
    }

    // -- 1. idempotence -----------------------------------------------------

    #[test]
    fn delete_of_absent_id_is_noop() {
        let mut t = table();
        assert!(!t.apply(&[Change::delete(1, id(5))]));
        assert!(t.is_empty());
    }

    #[test]
    fn reapplying_identical_create_reports_no_change() {
        let mut t = table();
        let c = Change::create(1, Entity::new(id(1)).with("hp", json!(1)));
        assert!(t.apply(&[c.clone()]));
        assert!(!t.apply(&[c]));
    }

    // -- 2. staleness -------------------------------------------------------

    #[test]
    fn stale_update_is_ignored() {
        let mut t = table();
        t.apply(&[Change::create(5, Entity::new(id(1)).with("hp", json!(10)))]);
        let stale = Change::update(4, EntityDelta::new(id(1)).with("hp", json!(0)));
        assert!(!t.apply(&[stale]));
        assert_eq!(t.get(id(1)).unwrap().get("hp"), Some(&json!(10)));
    }

    #[test]
    fn tombstone_blocks_stale_resurrection() {
        let mut t = Table::builder().keep_tombstones().build().unwrap();
        t.apply(&[
            Change::create(1, Entity::new(id(1)).with("hp", json!(1))),
            Change::delete(3, id(1)),
        ]);
        assert!(!t.apply(&[Change::update(2, EntityDelta::new(id(1)).with("hp", json!(2)))]));
        assert!(!t.contains(id(1)));
        assert_eq!(t.last_version(id(1)), Some(3));
    }

    #[test]
    fn deleted_ids_are_forgotten_by_default() {
        let mut t = table();
        for raw in 1..=10_000 {
            t.apply(&[
                Change::create(2 * raw - 1, Entity::new(id(raw)).with("hp", json!(1))),
                Change::delete(2 * raw, id(raw)),
            ]);
        }
        assert!(t.is_empty());
        assert_eq!(t.tombstone_count(), 0);
        assert!((1..=10_000).all(|raw| t.last_version(id(raw)).is_none()));
    }

    #[test]
    fn prune_drops_tombstones_up_to_version() {
        let mut t = Table::builder().keep_tombstones().build().unwrap();
        for raw in 1..=4 {
            t.apply(&[
                Change::create(raw, Entity::new(id(raw))),
                Change::delete(10 + raw, id(raw)),
            ]);
        }
        assert_eq!(t.tombstone_count(), 4);
        assert_eq!(t.prune_tombstones(12), 2);
        assert_eq!(t.last_version(id(2)), None);
        assert_eq!(t.last_version(id(3)), Some(13));
    }

    // -- 3. index sync ------------------------------------------------------

    #[test]
    fn indices_follow_every_mutation() {
        let mut t = table();
        t.apply(&[Change::create(1, Entity::new(id(1)).with("hp", json!(1)))]);
        assert!(t.index::<PresenceIndex>("hp").unwrap().contains(id(1)));

        t.apply(&[Change::update(2, EntityDelta::new(id(1)).without("hp"))]);
        assert!(!t.index::<PresenceIndex>("hp").unwrap().contains(id(1)));
        assert!(t.contains(id(1)));

        t.apply(&[Change::update(3, EntityDelta::new(id(1)).with("hp", json!(2)))]);
        t.apply(&[Change::delete(4, id(1))]);
        assert!(t.index::<PresenceIndex>("hp").unwrap().is_empty());
    }

    #[test]
    fn late_index_is_backfilled() {
        let mut t = Table::new();
        t.apply(&[Change::create(1, Entity::new(id(1)).with("hp", json!(1)))]);
        t.add_index("hp", PresenceIndex::new(ComponentMatcher::new(["hp"])))
            .unwrap();
        assert_eq!(t.index_dyn("hp").unwrap().len(), 1);
    }

    #[test]
    fn duplicate_index_name_rejected() {
        let err = Table::builder()
            .index("a", PresenceIndex::new(ComponentMatcher::default()))
            .index("a", PresenceIndex::new(ComponentMatcher::default()))
            .build()
            .unwrap_err();
        assert_eq!(err, EcsError::DuplicateIndex { name: "a".to_owned() });
    }

    #[test]
    fn wrong_index_type_is_none() {
        let t = table();
        assert!(t.index::<crate::index::spatial::SpatialIndex>("hp").is_none());
        assert!(t.index::<PresenceIndex>("missing").is_none());
    }

    #[test]
    fn clear_empties_indices_too() {
        let mut t = table();
        t.apply(&[Change::create(1, Entity::new(id(1)).with("hp", json!(1)))]);
        t.clear();
        assert!(t.is_empty());
        assert!(t.index_dyn("hp").unwrap().is_empty());
        assert_eq!(t.max_version(), 0);
    }

    // -- 4. hashing ---------------------------------------------------------

    #[test]
    fn state_hash_is_order_independent() {
        let a = Change::create(1, Entity::new(id(1)).with("hp", json!(1)));
        let b = Change::create(2, Entity::new(id(2)).with("hp", json!(2)));
        let mut t1 = table();
        let mut t2 = table();
        t1.apply(&[a.clone(), b.clone()]);
        t2.apply(&[b, a]);
        assert_eq!(t1.state_hash().unwrap(), t2.state_hash().unwrap());

        t2.apply(&[Change::update(3, EntityDelta::new(id(1)).with("hp", json!(0)))]);
        assert_ne!(t1.state_hash().unwrap(), t2.state_hash().unwrap());
    }
}
