//! Versioned working copies shared by every side effect in one tick.

use std::collections::BTreeMap;

use tessel_ecs::change::{Change, ProposedChange};
use tessel_ecs::entity::{Entity, EntityId};
use tessel_ecs::table::Table;
use tessel_ecs::transaction::{Iff, Transaction};

#[derive(Debug, Clone)]
struct Edit {
    /// Table state when the entity was first touched this tick.
    base: Option<Entity>,
    base_version: u64,
    current: Option<Entity>,
    causes: Vec<Change>,
}

impl Edit {
    fn add_cause(&mut self, cause: &Change) {
        if !self.causes.contains(cause) {
            self.causes.push(cause.clone());
        }
    }
}

/// A transaction derived by side effects, with the changes that led to it.
#[derive(Debug, Clone, PartialEq)]
pub struct DerivedTransaction {
    pub transaction: Transaction,
    pub causes: Vec<Change>,
}

/// Reads fall through to the table until an entity is first edited; after
/// that every reader sees the working copy, so two effects editing one
/// entity in the same tick build on each other.
///
/// Each touched entity becomes one transaction guarded by the version it
/// was read at. A create is guarded by the entity not existing.
#[derive(Debug)]
pub struct ChangeSet<'a> {
    table: &'a Table,
    edits: BTreeMap<EntityId, Edit>,
}

/// Saved edit state, restored when a side effect fails midway.
#[derive(Debug, Clone)]
pub(crate) struct Checkpoint(BTreeMap<EntityId, Edit>);

impl<'a> ChangeSet<'a> {
    pub fn new(table: &'a Table) -> Self {
        Self {
            table,
            edits: BTreeMap::new(),
        }
    }

    /// The processor's table, after this tick's incoming changes.
    pub fn table(&self) -> &'a Table {
        self.table
    }

    pub fn get(&self, id: EntityId) -> Option<&Entity> {
        match self.edits.get(&id) {
            Some(edit) => edit.current.as_ref(),
            None => self.table.get(id),
        }
    }

    fn edit(&mut self, id: EntityId) -> &mut Edit {
        let table = self.table;
        self.edits.entry(id).or_insert_with(|| {
            let base = table.get(id).cloned();
            Edit {
                current: base.clone(),
                base,
                base_version: table.last_version(id).unwrap_or(0),
                causes: Vec::new(),
            }
        })
    }

    /// Modify an existing entity. Returns `false` (and records nothing) if
    /// the entity does not exist.
    pub fn update(&mut self, id: EntityId, cause: &Change, f: impl FnOnce(&mut Entity)) -> bool {
        let edit = self.edit(id);
        let Some(entity) = edit.current.as_mut() else {
            return false;
        };
        f(entity);
        edit.add_cause(cause);
        true
    }

    /// Create (or replace) an entity.
    pub fn create(&mut self, entity: Entity, cause: &Change) {
        let edit = self.edit(entity.id);
        edit.current = Some(entity);
        edit.add_cause(cause);
    }

    pub fn delete(&mut self, id: EntityId, cause: &Change) {
        let edit = self.edit(id);
        edit.current = None;
        edit.add_cause(cause);
    }

    /// Entities with pending edits.
    pub fn touched(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.edits.keys().copied()
    }

    pub(crate) fn checkpoint(&self) -> Checkpoint {
        Checkpoint(self.edits.clone())
    }

    pub(crate) fn restore(&mut self, checkpoint: Checkpoint) {
        self.edits = checkpoint.0;
    }

    /// One transaction per entity whose working copy differs from its base.
    pub fn into_transactions(self) -> Vec<DerivedTransaction> {
        let mut out = Vec::new();
        for (id, edit) in self.edits {
            let guarded = |change: ProposedChange| {
                Transaction::new()
                    .with_iff(Iff::at_version(id, edit.base_version))
                    .with_change(change)
            };
            let transaction = match (&edit.base, edit.current) {
                (None, None) => continue,
                (Some(base), Some(current)) if *base == current => continue,
                (Some(base), Some(current)) => guarded(ProposedChange::update(base.diff(&current))),
                (Some(_), None) => guarded(ProposedChange::delete(id)),
                (None, Some(current)) => Transaction::new()
                    .with_iff(Iff::absent(id))
                    .create(current),
            };
            out.push(DerivedTransaction {
                transaction,
                causes: edit.causes,
            });
        }
        out
    }
}
