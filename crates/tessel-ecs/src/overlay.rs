//! Speculative edits layered over a [`Table`].
//!
//! A writer that wants its own edits to show up before the store confirms
//! them pushes them into a [`SpeculativeOverlay`]. Each layer remembers the
//! table version of its entity at the moment it was pushed. Once the table
//! moves past that version (the store confirmed the edit, or someone else's
//! change superseded it) the layer is stale and [`reconcile`] drops it:
//! server-confirmed state always wins.
//!
//! [`reconcile`]: SpeculativeOverlay::reconcile

use std::collections::BTreeMap;

use crate::change::ProposedChange;
use crate::entity::{Entity, EntityId};
use crate::table::Table;

#[derive(Debug, Clone)]
struct Layer {
    base_version: u64,
    change: ProposedChange,
}

#[derive(Debug, Default)]
pub struct SpeculativeOverlay {
    layers: BTreeMap<EntityId, Vec<Layer>>,
}

impl SpeculativeOverlay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Layer `change` over the table's current state of its entity.
    pub fn push(&mut self, table: &Table, change: ProposedChange) {
        let id = change.id();
        let base_version = table.last_version(id).unwrap_or(0);
        self.layers.entry(id).or_default().push(Layer {
            base_version,
            change,
        });
    }

    /// The table's entity with every live layer applied on top.
    pub fn view(&self, table: &Table, id: EntityId) -> Option<Entity> {
        let base = table.get(id).cloned();
        match self.layers.get(&id) {
            None => base,
            Some(layers) => layers
                .iter()
                .fold(base, |acc, layer| layer.change.apply_to(acc.as_ref())),
        }
    }

    /// Drop layers the table has moved past. Returns the ids whose view
    /// changed as a result.
    pub fn reconcile(&mut self, table: &Table) -> Vec<EntityId> {
        let mut touched = Vec::new();
        self.layers.retain(|id, layers| {
            let current = table.last_version(*id);
            let before = layers.len();
            layers.retain(|layer| match current {
                Some(version) => layer.base_version >= version,
                // Gone without a tombstone: only layers pushed while the
                // entity was unknown survive.
                None => layer.base_version == 0,
            });
            if layers.len() != before {
                touched.push(*id);
            }
            !layers.is_empty()
        });
        if !touched.is_empty() {
            tracing::debug!(entities = touched.len(), "reconciled speculative layers");
        }
        touched
    }

    /// Drop every layer for `id`. Returns whether any existed.
    pub fn expire(&mut self, id: EntityId) -> bool {
        self.layers.remove(&id).is_some()
    }

    pub fn is_speculative(&self, id: EntityId) -> bool {
        self.layers.contains_key(&id)
    }

    /// Number of entities with live layers.
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}
