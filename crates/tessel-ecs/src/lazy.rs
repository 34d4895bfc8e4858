//! Lazy change materialization.
//!
//! On the wire every component travels as its own JSON byte payload
//! ([`EncodedChange`]). A [`LazyChange`] wraps that payload and defers
//! decoding until a component is first read, caching the result. Presence
//! checks ([`LazyEntity::has`]) never decode, so subscribers whose filters
//! reject most traffic pay nothing for the payloads they skip.
//!
//! A payload that fails to decode surfaces as [`EcsError::ProtocolFault`] on
//! access. [`materialize_batch`] skips such changes with a warning rather than
//! failing the whole batch, which keeps unrelated entities live.
//!
//! # Example
//!
//! ```
//! use tessel_ecs::prelude::*;
//! use serde_json::json;
//!
//! let id = EntityId::new(3).unwrap();
//! let change = Change::create(1, Entity::new(id).with("hp", json!(10)));
//! let lazy = LazyChange::encode(&change).unwrap();
//!
//! let entity = lazy.entity().unwrap();
//! assert!(entity.has("hp"));
//! assert_eq!(entity.decoded_count(), 0);
//! assert_eq!(entity.get("hp").unwrap(), Some(&json!(10)));
//! assert_eq!(lazy.materialize().unwrap(), change);
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};

use crate::change::{Change, ChangeKind};
use crate::component::ComponentSet;
use crate::entity::{Components, Entity, EntityDelta, EntityId};
use crate::EcsError;

/// Component name to encoded payload bytes.
pub type EncodedComponents = BTreeMap<String, Vec<u8>>;

// ---------------------------------------------------------------------------
// EncodedChange (wire form)
// ---------------------------------------------------------------------------

/// The wire form of a [`Change`]: identical shape, component payloads left
/// as bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EncodedChange {
    Create {
        version: u64,
        id: EntityId,
        components: EncodedComponents,
    },
    Update {
        version: u64,
        id: EntityId,
        set: EncodedComponents,
        removed: BTreeSet<String>,
    },
    Delete {
        version: u64,
        id: EntityId,
    },
}

impl EncodedChange {
    pub fn encode(change: &Change) -> Result<Self, EcsError> {
        Ok(match change {
            Change::Create { version, entity } => EncodedChange::Create {
                version: *version,
                id: entity.id,
                components: encode_components(&entity.components)?,
            },
            Change::Update { version, delta } => EncodedChange::Update {
                version: *version,
                id: delta.id,
                set: encode_components(&delta.set)?,
                removed: delta.removed.clone(),
            },
            Change::Delete { version, id } => EncodedChange::Delete {
                version: *version,
                id: *id,
            },
        })
    }

    pub fn id(&self) -> EntityId {
        match self {
            Self::Create { id, .. } | Self::Update { id, .. } | Self::Delete { id, .. } => *id,
        }
    }

    pub fn version(&self) -> u64 {
        match self {
            Self::Create { version, .. }
            | Self::Update { version, .. }
            | Self::Delete { version, .. } => *version,
        }
    }
}

fn encode_components(components: &Components) -> Result<EncodedComponents, EcsError> {
    components
        .iter()
        .map(|(name, value)| {
            serde_json::to_vec(value)
                .map(|bytes| (name.clone(), bytes))
                .map_err(|e| EcsError::Serialization {
                    details: format!("component '{name}': {e}"),
                })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Slots
// ---------------------------------------------------------------------------

/// One encoded component plus its decode cache.
struct Slot {
    bytes: Vec<u8>,
    decoded: OnceLock<Result<serde_json::Value, String>>,
}

impl Slot {
    fn new(bytes: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            bytes,
            decoded: OnceLock::new(),
        })
    }

    fn decode(&self) -> &Result<serde_json::Value, String> {
        self.decoded
            .get_or_init(|| serde_json::from_slice(&self.bytes).map_err(|e| e.to_string()))
    }

    fn is_decoded(&self) -> bool {
        self.decoded.get().is_some()
    }
}

type Slots = BTreeMap<String, Arc<Slot>>;

fn slots_from(encoded: EncodedComponents) -> Slots {
    encoded
        .into_iter()
        .map(|(name, bytes)| (name, Slot::new(bytes)))
        .collect()
}

// ---------------------------------------------------------------------------
// LazyEntity
// ---------------------------------------------------------------------------

/// A set of encoded components for one entity, decoded on demand.
///
/// Cloning is cheap and clones share the decode cache.
#[derive(Clone)]
pub struct LazyEntity {
    id: EntityId,
    slots: Arc<Slots>,
}

impl LazyEntity {
    fn from_slots(id: EntityId, slots: Slots) -> Self {
        Self {
            id,
            slots: Arc::new(slots),
        }
    }

    pub fn id(&self) -> EntityId {
        self.id
    }

    /// Presence check. Never decodes.
    pub fn has(&self, name: &str) -> bool {
        self.slots.contains_key(name)
    }

    pub fn component_names(&self) -> impl Iterator<Item = &str> {
        self.slots.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Decode a single component, caching the result.
    pub fn get(&self, name: &str) -> Result<Option<&serde_json::Value>, EcsError> {
        let Some(slot) = self.slots.get(name) else {
            return Ok(None);
        };
        match slot.decode() {
            Ok(value) => Ok(Some(value)),
            Err(details) => Err(EcsError::ProtocolFault {
                entity: self.id,
                component: Some(name.to_owned()),
                details: details.clone(),
            }),
        }
    }

    /// Number of components decoded so far.
    pub fn decoded_count(&self) -> usize {
        self.slots.values().filter(|s| s.is_decoded()).count()
    }

    fn decode_all(&self) -> Result<Components, EcsError> {
        let mut components = Components::new();
        for name in self.slots.keys() {
            if let Some(value) = self.get(name)? {
                components.insert(name.clone(), value.clone());
            }
        }
        Ok(components)
    }

    pub fn materialize(&self) -> Result<Entity, EcsError> {
        Ok(Entity {
            id: self.id,
            components: self.decode_all()?,
        })
    }

    fn encoded(&self) -> EncodedComponents {
        self.slots
            .iter()
            .map(|(name, slot)| (name.clone(), slot.bytes.clone()))
            .collect()
    }
}

impl ComponentSet for LazyEntity {
    fn has_component(&self, name: &str) -> bool {
        self.has(name)
    }
}

impl fmt::Debug for LazyEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazyEntity")
            .field("id", &self.id)
            .field("components", &self.slots.keys().collect::<Vec<_>>())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// LazyDelta
// ---------------------------------------------------------------------------

/// An encoded partial entity: components to set (decoded on demand) plus
/// names to remove.
#[derive(Debug, Clone)]
pub struct LazyDelta {
    set: LazyEntity,
    removed: Arc<BTreeSet<String>>,
}

impl LazyDelta {
    pub fn id(&self) -> EntityId {
        self.set.id
    }

    /// Whether this delta sets `name`.
    pub fn sets(&self, name: &str) -> bool {
        self.set.has(name)
    }

    /// Whether this delta removes `name`.
    pub fn removes(&self, name: &str) -> bool {
        self.removed.contains(name)
    }

    /// The components this delta sets, as a lazy entity.
    pub fn set_components(&self) -> &LazyEntity {
        &self.set
    }

    pub fn removed(&self) -> impl Iterator<Item = &str> {
        self.removed.iter().map(String::as_str)
    }

    pub fn get(&self, name: &str) -> Result<Option<&serde_json::Value>, EcsError> {
        self.set.get(name)
    }

    pub fn materialize(&self) -> Result<EntityDelta, EcsError> {
        Ok(EntityDelta {
            id: self.set.id,
            set: self.set.decode_all()?,
            removed: (*self.removed).clone(),
        })
    }
}

// ---------------------------------------------------------------------------
// LazyChange
// ---------------------------------------------------------------------------

/// A committed change whose component payloads are decoded on first access.
#[derive(Debug, Clone)]
pub enum LazyChange {
    Create { version: u64, entity: LazyEntity },
    Update { version: u64, delta: LazyDelta },
    Delete { version: u64, id: EntityId },
}

impl LazyChange {
    pub fn from_encoded(encoded: EncodedChange) -> Self {
        match encoded {
            EncodedChange::Create {
                version,
                id,
                components,
            } => LazyChange::Create {
                version,
                entity: LazyEntity::from_slots(id, slots_from(components)),
            },
            EncodedChange::Update {
                version,
                id,
                set,
                removed,
            } => LazyChange::Update {
                version,
                delta: LazyDelta {
                    set: LazyEntity::from_slots(id, slots_from(set)),
                    removed: Arc::new(removed),
                },
            },
            EncodedChange::Delete { version, id } => LazyChange::Delete { version, id },
        }
    }

    /// Encode a materialized change.
    pub fn encode(change: &Change) -> Result<Self, EcsError> {
        EncodedChange::encode(change).map(Self::from_encoded)
    }

    pub fn to_encoded(&self) -> EncodedChange {
        match self {
            LazyChange::Create { version, entity } => EncodedChange::Create {
                version: *version,
                id: entity.id,
                components: entity.encoded(),
            },
            LazyChange::Update { version, delta } => EncodedChange::Update {
                version: *version,
                id: delta.id(),
                set: delta.set.encoded(),
                removed: (*delta.removed).clone(),
            },
            LazyChange::Delete { version, id } => EncodedChange::Delete {
                version: *version,
                id: *id,
            },
        }
    }

    pub fn id(&self) -> EntityId {
        match self {
            LazyChange::Create { entity, .. } => entity.id,
            LazyChange::Update { delta, .. } => delta.id(),
            LazyChange::Delete { id, .. } => *id,
        }
    }

    pub fn version(&self) -> u64 {
        match self {
            LazyChange::Create { version, .. }
            | LazyChange::Update { version, .. }
            | LazyChange::Delete { version, .. } => *version,
        }
    }

    pub fn kind(&self) -> ChangeKind {
        match self {
            LazyChange::Create { .. } => ChangeKind::Create,
            LazyChange::Update { .. } => ChangeKind::Update,
            LazyChange::Delete { .. } => ChangeKind::Delete,
        }
    }

    /// The full entity carried by a Create.
    pub fn entity(&self) -> Option<&LazyEntity> {
        match self {
            LazyChange::Create { entity, .. } => Some(entity),
            _ => None,
        }
    }

    pub fn delta(&self) -> Option<&LazyDelta> {
        match self {
            LazyChange::Update { delta, .. } => Some(delta),
            _ => None,
        }
    }

    /// Whether this change could alter the presence or value of `name`.
    pub fn touches(&self, name: &str) -> bool {
        match self {
            LazyChange::Create { .. } | LazyChange::Delete { .. } => true,
            LazyChange::Update { delta, .. } => delta.sets(name) || delta.removes(name),
        }
    }

    /// Decode every payload into a [`Change`].
    pub fn materialize(&self) -> Result<Change, EcsError> {
        Ok(match self {
            LazyChange::Create { version, entity } => Change::Create {
                version: *version,
                entity: entity.materialize()?,
            },
            LazyChange::Update { version, delta } => Change::Update {
                version: *version,
                delta: delta.materialize()?,
            },
            LazyChange::Delete { version, id } => Change::Delete {
                version: *version,
                id: *id,
            },
        })
    }

    /// Coalesce two changes to the same entity without decoding any payload.
    /// Follows the same table as [`Change::merge`].
    pub fn merge(buffered: LazyChange, incoming: LazyChange) -> LazyChange {
        if incoming.version() < buffered.version() {
            return buffered;
        }
        match (buffered, incoming) {
            (LazyChange::Create { entity, .. }, LazyChange::Update { version, delta }) => {
                let mut slots = (*entity.slots).clone();
                for name in delta.removed.iter() {
                    slots.remove(name);
                }
                for (name, slot) in delta.set.slots.iter() {
                    slots.insert(name.clone(), Arc::clone(slot));
                }
                LazyChange::Create {
                    version,
                    entity: LazyEntity::from_slots(entity.id, slots),
                }
            }
            (LazyChange::Update { delta: older, .. }, LazyChange::Update { version, delta }) => {
                let mut slots = (*older.set.slots).clone();
                let mut removed = (*older.removed).clone();
                for name in delta.removed.iter() {
                    slots.remove(name);
                    removed.insert(name.clone());
                }
                for (name, slot) in delta.set.slots.iter() {
                    removed.remove(name);
                    slots.insert(name.clone(), Arc::clone(slot));
                }
                LazyChange::Update {
                    version,
                    delta: LazyDelta {
                        set: LazyEntity::from_slots(older.set.id, slots),
                        removed: Arc::new(removed),
                    },
                }
            }
            (_, incoming) => incoming,
        }
    }
}

/// Materialize a batch, skipping (and logging) changes whose payloads fault.
pub fn materialize_batch(changes: &[LazyChange]) -> Vec<Change> {
    let mut out = Vec::with_capacity(changes.len());
    for change in changes {
        match change.materialize() {
            Ok(c) => out.push(c),
            Err(e) => {
                tracing::warn!(
                    entity = %change.id(),
                    version = change.version(),
                    error = %e,
                    "skipping undecodable change"
                );
            }
        }
    }
    out
}

// ---------------------------------------------------------------------------
// LazyChangeBuffer
// ---------------------------------------------------------------------------

/// Per-entity coalescing buffer. Keeps one merged change per entity, in the
/// order each entity was first seen.
#[derive(Debug, Default)]
pub struct LazyChangeBuffer {
    order: Vec<EntityId>,
    pending: HashMap<EntityId, LazyChange>,
}

impl LazyChangeBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, change: LazyChange) {
        let id = change.id();
        let merged = match self.pending.remove(&id) {
            Some(buffered) => LazyChange::merge(buffered, change),
            None => {
                self.order.push(id);
                change
            }
        };
        self.pending.insert(id, merged);
    }

    pub fn extend(&mut self, changes: impl IntoIterator<Item = LazyChange>) {
        for change in changes {
            self.push(change);
        }
    }

    /// Drain every buffered change.
    pub fn pop(&mut self) -> Vec<LazyChange> {
        let mut out = Vec::with_capacity(self.order.len());
        for id in self.order.drain(..) {
            if let Some(change) = self.pending.remove(&id) {
                out.push(change);
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
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

    fn broken_create(raw: u64) -> LazyChange {
        let mut components = EncodedComponents::new();
        components.insert("hp".to_owned(), b"{not json".to_vec());
        components.insert("name".to_owned(), br#""ok""#.to_vec());
        LazyChange::from_encoded(EncodedChange::Create {
            version: 1,
            id: id(raw),
            components,
        })
    }

    #[test]
    fn presence_does_not_decode() {
        let change = Change::create(
            1,
            Entity::new(id(1))
                .with("a", json!(1))
                .with("b", json!({"deep": [1, 2, 3]})),
        );
        let lazy = LazyChange::encode(&change).unwrap();
        let entity = lazy.entity().unwrap();
        assert!(entity.has("a") && entity.has("b") && !entity.has("c"));
        assert_eq!(entity.decoded_count(), 0);

        assert_eq!(entity.get("a").unwrap(), Some(&json!(1)));
        assert_eq!(entity.decoded_count(), 1);

        // Clones share the cache.
        let clone = lazy.clone();
        assert_eq!(clone.entity().unwrap().decoded_count(), 1);
    }

    #[test]
    fn undecodable_component_is_a_protocol_fault() {
        let lazy = broken_create(9);
        let entity = lazy.entity().unwrap();
        assert_eq!(entity.get("name").unwrap(), Some(&json!("ok")));
        let err = entity.get("hp").unwrap_err();
        assert!(matches!(
            err,
            EcsError::ProtocolFault { entity, ref component, .. }
                if entity == id(9) && component.as_deref() == Some("hp")
        ));
        assert!(lazy.materialize().is_err());
    }

    #[test]
    fn batch_skips_faulted_changes_only() {
        let good = LazyChange::encode(&Change::create(2, Entity::new(id(2)))).unwrap();
        let changes = vec![broken_create(1), good, LazyChange::Delete { version: 3, id: id(3) }];
        let out = materialize_batch(&changes);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].id(), id(2));
        assert!(out[1].is_delete());
    }

    #[test]
    fn lazy_merge_agrees_with_materialized_merge() {
        let a = Change::create(1, Entity::new(id(1)).with("hp", json!(3)).with("x", json!(0)));
        let b = Change::update(2, EntityDelta::new(id(1)).with("hp", json!(2)).without("x"));
        let c = Change::update(4, EntityDelta::new(id(1)).with("y", json!(7)));

        let eager = Change::merge(Change::merge(a.clone(), b.clone()), c.clone());
        let lazy = LazyChange::merge(
            LazyChange::merge(LazyChange::encode(&a).unwrap(), LazyChange::encode(&b).unwrap()),
            LazyChange::encode(&c).unwrap(),
        );
        assert_eq!(lazy.materialize().unwrap(), eager);

        let bc_eager = Change::merge(b.clone(), c.clone());
        let bc_lazy = LazyChange::merge(LazyChange::encode(&b).unwrap(), LazyChange::encode(&c).unwrap());
        assert_eq!(bc_lazy.materialize().unwrap(), bc_eager);
    }

    #[test]
    fn buffer_coalesces_per_entity_in_first_seen_order() {
        let mut buf = LazyChangeBuffer::new();
        let e2 = Change::create(1, Entity::new(id(2)).with("hp", json!(1)));
        let e1 = Change::create(2, Entity::new(id(1)));
        let e2_up = Change::update(3, EntityDelta::new(id(2)).with("hp", json!(0)));
        for c in [&e2, &e1, &e2_up] {
            buf.push(LazyChange::encode(c).unwrap());
        }
        assert_eq!(buf.len(), 2);

        let drained: Vec<Change> = buf.pop().iter().map(|c| c.materialize().unwrap()).collect();
        assert!(buf.is_empty());
        assert_eq!(drained[0], Change::create(3, Entity::new(id(2)).with("hp", json!(0))));
        assert_eq!(drained[1], e1);
    }

    #[test]
    fn encoded_round_trip_through_wire() {
        let change = Change::update(5, EntityDelta::new(id(4)).with("hp", json!(1)).without("x"));
        let encoded = EncodedChange::encode(&change).unwrap();
        let wire = serde_json::to_vec(&encoded).unwrap();
        let back: EncodedChange = serde_json::from_slice(&wire).unwrap();
        assert_eq!(LazyChange::from_encoded(back).materialize().unwrap(), change);
    }
}
