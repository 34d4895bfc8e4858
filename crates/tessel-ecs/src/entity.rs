//! Entity identifiers, entities, and partial entity deltas.
//!
//! An [`EntityId`] is a process-wide unique, non-zero 64-bit integer handed
//! out by the canonical store. Ids are never recycled, so unlike a
//! generational handle there is nothing to pack into the bits.
//!
//! An [`Entity`] is a sparse mapping from component name to an opaque
//! [`serde_json::Value`]. This layer never looks inside a component; it only
//! asks whether one is present.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::num::NonZeroU64;

use serde::{Deserialize, Serialize};

use crate::EcsError;

/// Component name to value. `BTreeMap` keeps serialization order stable.
pub type Components = BTreeMap<String, serde_json::Value>;

// ---------------------------------------------------------------------------
// EntityId
// ---------------------------------------------------------------------------

/// A non-zero entity identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u64", into = "u64")]
pub struct EntityId(NonZeroU64);

impl EntityId {
    /// Wrap a raw id. Returns `None` for zero.
    #[inline]
    pub fn new(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(Self)
    }

    /// Raw `u64` representation.
    #[inline]
    pub fn to_raw(self) -> u64 {
        self.0.get()
    }
}

impl TryFrom<u64> for EntityId {
    type Error = EcsError;

    fn try_from(raw: u64) -> Result<Self, Self::Error> {
        Self::new(raw).ok_or(EcsError::InvalidEntityId { raw })
    }
}

impl From<EntityId> for u64 {
    fn from(id: EntityId) -> Self {
        id.to_raw()
    }
}

impl fmt::Debug for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityId({})", self.0)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Entity
// ---------------------------------------------------------------------------

/// A fully materialized entity: its id plus every component it carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    #[serde(default)]
    pub components: Components,
}

impl Entity {
    /// An entity with no components.
    pub fn new(id: EntityId) -> Self {
        Self {
            id,
            components: Components::new(),
        }
    }

    /// Builder-style component insert.
    pub fn with(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.components.insert(name.into(), value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&serde_json::Value> {
        self.components.get(name)
    }

    pub fn has(&self, name: &str) -> bool {
        self.components.contains_key(name)
    }

    /// Set a component, returning the previous value.
    pub fn set(
        &mut self,
        name: impl Into<String>,
        value: serde_json::Value,
    ) -> Option<serde_json::Value> {
        self.components.insert(name.into(), value)
    }

    /// Remove a component, returning the previous value.
    pub fn remove(&mut self, name: &str) -> Option<serde_json::Value> {
        self.components.remove(name)
    }

    pub fn component_names(&self) -> impl Iterator<Item = &str> {
        self.components.keys().map(String::as_str)
    }

    /// Apply a delta in place. The delta's id is not checked.
    pub fn apply_delta(&mut self, delta: &EntityDelta) {
        for name in &delta.removed {
            self.components.remove(name);
        }
        for (name, value) in &delta.set {
            self.components.insert(name.clone(), value.clone());
        }
    }

    /// The delta that turns `self` into `other` (components only).
    pub fn diff(&self, other: &Entity) -> EntityDelta {
        let mut delta = EntityDelta::new(self.id);
        for (name, value) in &other.components {
            if self.components.get(name) != Some(value) {
                delta.set.insert(name.clone(), value.clone());
            }
        }
        for name in self.components.keys() {
            if !other.components.contains_key(name) {
                delta.removed.insert(name.clone());
            }
        }
        delta
    }
}

// ---------------------------------------------------------------------------
// EntityDelta
// ---------------------------------------------------------------------------

/// A partial entity: components to set plus component names to remove.
///
/// A name never appears in both `set` and `removed`; the builder methods
/// maintain that.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityDelta {
    pub id: EntityId,
    #[serde(default)]
    pub set: Components,
    #[serde(default)]
    pub removed: BTreeSet<String>,
}

impl EntityDelta {
    pub fn new(id: EntityId) -> Self {
        Self {
            id,
            set: Components::new(),
            removed: BTreeSet::new(),
        }
    }

    pub fn with(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        let name = name.into();
        self.removed.remove(&name);
        self.set.insert(name, value);
        self
    }

    pub fn without(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.set.remove(&name);
        self.removed.insert(name);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.removed.is_empty()
    }

    /// Every component name this delta touches, set or removed.
    pub fn touched(&self) -> impl Iterator<Item = &str> {
        self.set
            .keys()
            .chain(self.removed.iter())
            .map(String::as_str)
    }

    /// Fold a newer delta for the same entity into this one.
    pub fn merge(&mut self, newer: &EntityDelta) {
        for name in &newer.removed {
            self.set.remove(name);
            self.removed.insert(name.clone());
        }
        for (name, value) in &newer.set {
            self.removed.remove(name);
            self.set.insert(name.clone(), value.clone());
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
