//! Ownership cascade: an entity carrying `deletes_with` is deleted when the
//! entity it names is.
//!
//! Owners are found through a [`KeyIndex`](tessel_ecs::index::key::KeyIndex)
//! from owner id to dependents, installed on the processor's table when the
//! effect is registered.

use async_trait::async_trait;

use tessel_ecs::change::Change;
use tessel_ecs::component::ComponentMatcher;
use tessel_ecs::entity::{Entity, EntityId};
use tessel_ecs::index::key::KeyIndex;
use tessel_ecs::table::Table;
use tessel_ecs::EcsError;

use super::{ChangeSet, SideEffect};

/// Component (and index) name. Its value is the raw id of the owner.
pub const DELETES_WITH: &str = "deletes_with";

fn owner_of(entity: &Entity) -> Vec<EntityId> {
    entity
        .get(DELETES_WITH)
        .and_then(|v| v.as_u64())
        .and_then(EntityId::new)
        .into_iter()
        .collect()
}

/// Deletes every entity whose `deletes_with` component names an entity that
/// was just deleted. Chains resolve one link per tick.
#[derive(Debug, Default)]
pub struct DeletesWithEffect;

impl DeletesWithEffect {
    pub fn new() -> Self {
        Self
    }

    /// The owner index this effect queries.
    pub fn index() -> KeyIndex<EntityId> {
        KeyIndex::with_matcher(ComponentMatcher::new([DELETES_WITH]), owner_of)
    }
}

#[async_trait]
impl SideEffect for DeletesWithEffect {
    fn name(&self) -> &str {
        DELETES_WITH
    }

    fn install(&self, table: &mut Table) -> Result<(), EcsError> {
        if table.index::<KeyIndex<EntityId>>(DELETES_WITH).is_some() {
            return Ok(());
        }
        table.add_index(DELETES_WITH, Self::index())
    }

    async fn post_apply(&mut self, changes: &[Change], set: &mut ChangeSet<'_>) -> anyhow::Result<()> {
        let Some(owners) = set.table().index::<KeyIndex<EntityId>>(DELETES_WITH) else {
            anyhow::bail!("index `{DELETES_WITH}` is not installed");
        };
        for change in changes.iter().filter(|c| c.is_delete()) {
            let dependents: Vec<EntityId> = owners.lookup(&change.id()).collect();
            for dependent in dependents {
                tracing::debug!(owner = %change.id(), %dependent, "deleting dependent entity");
                set.delete(dependent, change);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn id(raw: u64) -> EntityId {
        EntityId::new(raw).unwrap()
    }

    #[tokio::test]
    async fn dependents_of_deleted_owner_are_deleted() {
        let mut table = Table::new();
        DeletesWithEffect.install(&mut table).unwrap();
        DeletesWithEffect.install(&mut table).unwrap();
        table.apply(&[
            Change::create(1, Entity::new(id(1))),
            Change::create(2, Entity::new(id(2)).with(DELETES_WITH, json!(1))),
            Change::create(3, Entity::new(id(3)).with(DELETES_WITH, json!(7))),
            Change::delete(4, id(1)),
        ]);

        let mut set = ChangeSet::new(&table);
        DeletesWithEffect
            .post_apply(&[Change::delete(4, id(1))], &mut set)
            .await
            .unwrap();
        assert_eq!(set.touched().collect::<Vec<_>>(), vec![id(2)]);
        assert!(set.get(id(2)).is_none());
    }
}
