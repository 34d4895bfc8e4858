//! Component-presence index: the set of ids whose entity satisfies a
//! [`ComponentMatcher`].

use std::any::Any;
use std::collections::BTreeSet;

use crate::component::ComponentMatcher;
use crate::entity::{Entity, EntityId};
use crate::index::SecondaryIndex;

#[derive(Debug, Clone)]
pub struct PresenceIndex {
    matcher: ComponentMatcher,
    ids: BTreeSet<EntityId>,
}

impl PresenceIndex {
    pub fn new(matcher: ComponentMatcher) -> Self {
        Self {
            matcher,
            ids: BTreeSet::new(),
        }
    }

    pub fn matcher(&self) -> &ComponentMatcher {
        &self.matcher
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.ids.contains(&id)
    }

    /// Matching ids in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.ids.iter().copied()
    }
}

impl SecondaryIndex for PresenceIndex {
    fn update(&mut self, _old: Option<&Entity>, new: &Entity) {
        if self.matcher.matches(new) {
            self.ids.insert(new.id);
        } else {
            self.ids.remove(&new.id);
        }
    }

    fn delete(&mut self, id: EntityId) {
        self.ids.remove(&id);
    }

    fn clear(&mut self) {
        self.ids.clear();
    }

    fn len(&self) -> usize {
        self.ids.len()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
