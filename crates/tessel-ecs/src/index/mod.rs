//! Secondary indices over a [`Table`](crate::table::Table).
//!
//! An index sees every mutation the table applies, as an `(old, new)` pair
//! for creates and updates and as a bare id for deletes. It must be exactly
//! synchronized with the base mapping by the time
//! [`Table::apply`](crate::table::Table::apply) returns.
//!
//! Deletes carry only the id: a deleted entity's components are gone, so an
//! index that needs to know where the entity *was* keeps its own reverse
//! mapping.

use std::any::Any;

use crate::entity::{Entity, EntityId};

pub mod key;
pub mod presence;
pub mod spatial;

/// A secondary index maintained alongside a table's base mapping.
pub trait SecondaryIndex: Send + Sync + 'static {
    /// Reflect a create or update. `old` is the entity before the change.
    ///
    /// An update that makes the entity stop qualifying must drop it, exactly
    /// as [`delete`](SecondaryIndex::delete) would.
    fn update(&mut self, old: Option<&Entity>, new: &Entity);

    /// Drop every entry for `id`. Unknown ids are ignored.
    fn delete(&mut self, id: EntityId);

    /// Drop everything.
    fn clear(&mut self);

    /// Number of entities currently indexed.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}
