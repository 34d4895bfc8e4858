//! Changes: the immutable deltas that flow from writers to the canonical
//! store and from the store to every replica.
//!
//! Writers submit [`ProposedChange`]s, which carry no version. Once the store
//! commits a transaction it stamps each of its changes with the commit
//! version, producing a [`Change`]. Versions are monotonically increasing
//! integers; comparing them is the only ordering readers rely on.
//!
//! [`Change::merge`] coalesces two changes to the same entity into one with
//! the same net effect. The subscription path uses it to collapse bursts of
//! updates before they reach a replica.

use serde::{Deserialize, Serialize};

use crate::entity::{Entity, EntityDelta, EntityId};

/// Discriminant of a change, for logging and filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Create,
    Update,
    Delete,
}

// ---------------------------------------------------------------------------
// ProposedChange
// ---------------------------------------------------------------------------

/// A change as submitted by a writer, before the store assigns a version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProposedChange {
    /// Create or fully replace an entity.
    Create { entity: Entity },
    /// Set and remove individual components.
    Update { delta: EntityDelta },
    /// Remove the entity.
    Delete { id: EntityId },
}

impl ProposedChange {
    pub fn create(entity: Entity) -> Self {
        Self::Create { entity }
    }

    pub fn update(delta: EntityDelta) -> Self {
        Self::Update { delta }
    }

    pub fn delete(id: EntityId) -> Self {
        Self::Delete { id }
    }

    pub fn id(&self) -> EntityId {
        match self {
            Self::Create { entity } => entity.id,
            Self::Update { delta } => delta.id,
            Self::Delete { id } => *id,
        }
    }

    pub fn kind(&self) -> ChangeKind {
        match self {
            Self::Create { .. } => ChangeKind::Create,
            Self::Update { .. } => ChangeKind::Update,
            Self::Delete { .. } => ChangeKind::Delete,
        }
    }

    /// The entity that results from applying this change to `prior`.
    pub fn apply_to(&self, prior: Option<&Entity>) -> Option<Entity> {
        match self {
            Self::Create { entity } => Some(entity.clone()),
            Self::Update { delta } => Some(apply_update(prior, delta)),
            Self::Delete { .. } => None,
        }
    }

    /// Stamp with a committed version.
    pub fn commit(self, version: u64) -> Change {
        match self {
            Self::Create { entity } => Change::Create { version, entity },
            Self::Update { delta } => Change::Update { version, delta },
            Self::Delete { id } => Change::Delete { version, id },
        }
    }
}

// ---------------------------------------------------------------------------
// Change
// ---------------------------------------------------------------------------

/// A committed change, stamped with the version of the commit that made it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Change {
    Create { version: u64, entity: Entity },
    Update { version: u64, delta: EntityDelta },
    Delete { version: u64, id: EntityId },
}

impl Change {
    pub fn create(version: u64, entity: Entity) -> Self {
        Self::Create { version, entity }
    }

    pub fn update(version: u64, delta: EntityDelta) -> Self {
        Self::Update { version, delta }
    }

    pub fn delete(version: u64, id: EntityId) -> Self {
        Self::Delete { version, id }
    }

    pub fn id(&self) -> EntityId {
        match self {
            Self::Create { entity, .. } => entity.id,
            Self::Update { delta, .. } => delta.id,
            Self::Delete { id, .. } => *id,
        }
    }

    pub fn version(&self) -> u64 {
        match self {
            Self::Create { version, .. }
            | Self::Update { version, .. }
            | Self::Delete { version, .. } => *version,
        }
    }

    pub fn kind(&self) -> ChangeKind {
        match self {
            Self::Create { .. } => ChangeKind::Create,
            Self::Update { .. } => ChangeKind::Update,
            Self::Delete { .. } => ChangeKind::Delete,
        }
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, Self::Delete { .. })
    }

    /// Strip the version, e.g. to resubmit a change in a new transaction.
    pub fn to_proposed(&self) -> ProposedChange {
        match self {
            Self::Create { entity, .. } => ProposedChange::create(entity.clone()),
            Self::Update { delta, .. } => ProposedChange::update(delta.clone()),
            Self::Delete { id, .. } => ProposedChange::delete(*id),
        }
    }

    /// The entity that results from applying this change to `prior`.
    ///
    /// An update against a missing entity materializes the entity from the
    /// delta alone.
    pub fn apply_to(&self, prior: Option<&Entity>) -> Option<Entity> {
        match self {
            Self::Create { entity, .. } => Some(entity.clone()),
            Self::Update { delta, .. } => Some(apply_update(prior, delta)),
            Self::Delete { .. } => None,
        }
    }

    /// Coalesce `incoming` on top of `buffered`. Both must target the same
    /// entity.
    ///
    /// | buffered \ incoming | Create  | Update                    | Delete |
    /// |---------------------|---------|---------------------------|--------|
    /// | Create              | incoming| Create with delta applied | incoming |
    /// | Update              | incoming| merged Update             | incoming |
    /// | Delete              | incoming| incoming                  | incoming |
    ///
    /// An incoming change older than the buffered one is dropped.
    pub fn merge(buffered: Change, incoming: Change) -> Change {
        if incoming.version() < buffered.version() {
            return buffered;
        }
        match (buffered, incoming) {
            (
                Change::Create { mut entity, .. },
                Change::Update {
                    version,
                    delta,
                },
            ) => {
                entity.apply_delta(&delta);
                Change::Create { version, entity }
            }
            (
                Change::Update {
                    delta: mut merged, ..
                },
                Change::Update { version, delta },
            ) => {
                merged.merge(&delta);
                Change::Update {
                    version,
                    delta: merged,
                }
            }
            (_, incoming) => incoming,
        }
    }
}

fn apply_update(prior: Option<&Entity>, delta: &EntityDelta) -> Entity {
    let mut entity = prior.cloned().unwrap_or_else(|| Entity::new(delta.id));
    entity.apply_delta(delta);
    entity
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn id(raw: u64) -> EntityId {
        EntityId::new(raw).unwrap()
    }

    fn orc(hp: i64) -> Entity {
        Entity::new(id(1)).with("hp", json!(hp)).with("name", json!("orc"))
    }

    // -- 1. merge table -----------------------------------------------------

    #[test]
    fn update_on_create_folds_into_create() {
        let merged = Change::merge(
            Change::create(1, orc(10)),
            Change::update(2, EntityDelta::new(id(1)).with("hp", json!(4)).without("name")),
        );
        assert_eq!(
            merged,
            Change::create(2, Entity::new(id(1)).with("hp", json!(4)))
        );
    }

    #[test]
    fn update_on_update_merges_deltas() {
        let merged = Change::merge(
            Change::update(3, EntityDelta::new(id(1)).with("hp", json!(4))),
            Change::update(5, EntityDelta::new(id(1)).with("mana", json!(1))),
        );
        let Change::Update { version, delta } = merged else {
            panic!("expected an update");
        };
        assert_eq!(version, 5);
        assert_eq!(delta.set.len(), 2);
    }

    #[test]
    fn update_on_delete_is_the_update() {
        let update = Change::update(4, EntityDelta::new(id(1)).with("hp", json!(1)));
        let merged = Change::merge(Change::delete(3, id(1)), update.clone());
        assert_eq!(merged, update);
    }

    #[test]
    fn create_and_delete_replace() {
        let merged = Change::merge(Change::create(1, orc(1)), Change::delete(2, id(1)));
        assert_eq!(merged, Change::delete(2, id(1)));
        let merged = Change::merge(Change::delete(2, id(1)), Change::create(3, orc(9)));
        assert_eq!(merged, Change::create(3, orc(9)));
    }

    #[test]
    fn stale_incoming_is_dropped() {
        let buffered = Change::create(7, orc(10));
        let merged = Change::merge(
            buffered.clone(),
            Change::update(6, EntityDelta::new(id(1)).with("hp", json!(0))),
        );
        assert_eq!(merged, buffered);
    }

    // -- 2. apply -----------------------------------------------------------

    #[test]
    fn update_against_missing_entity_materializes_delta() {
        let change = Change::update(1, EntityDelta::new(id(1)).with("hp", json!(2)));
        let entity = change.apply_to(None).unwrap();
        assert_eq!(entity, Entity::new(id(1)).with("hp", json!(2)));
    }

    #[test]
    fn delete_yields_nothing() {
        assert!(Change::delete(1, id(1)).apply_to(Some(&orc(3))).is_none());
    }

    #[test]
    fn commit_then_strip_round_trips_proposal() {
        let proposed = ProposedChange::update(EntityDelta::new(id(1)).without("hp"));
        let committed = proposed.clone().commit(11);
        assert_eq!(committed.version(), 11);
        assert_eq!(committed.to_proposed(), proposed);
    }

    #[test]
    fn wire_form_is_tagged() {
        let json = serde_json::to_value(Change::delete(2, id(5))).unwrap();
        assert_eq!(json, json!({"kind": "delete", "version": 2, "id": 5}));
    }
}
