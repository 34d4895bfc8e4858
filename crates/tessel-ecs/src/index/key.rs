//! Key-projection index.
//!
//! A [`KeyIndex`] maps keys computed from an entity (an owner id, a team
//! name, a grid chunk) to the set of ids currently holding that key. One
//! entity may hold several keys, and an entity whose projection yields none
//! is simply absent.
//!
//! The index keeps an explicit reverse map (id to held keys). A delete only
//! carries the id, and the deleted entity's keys can no longer be derived
//! from its state, so the reverse map is what lets the forward entries be
//! removed.
//!
//! # Example
//!
//! ```
//! use tessel_ecs::prelude::*;
//! use serde_json::json;
//!
//! let by_team = KeyIndex::new(|e: &Entity| {
//!     e.get("team").and_then(|v| v.as_str()).map(str::to_owned).into_iter().collect()
//! });
//! let mut table = Table::builder().index("by_team", by_team).build().unwrap();
//!
//! let id = EntityId::new(5).unwrap();
//! table.apply(&[Change::create(1, Entity::new(id).with("team", json!("red")))]);
//! let index = table.index::<KeyIndex<String>>("by_team").unwrap();
//! assert_eq!(index.first(&"red".to_owned()), Some(id));
//! ```

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use crate::component::ComponentMatcher;
use crate::entity::{Entity, EntityId};
use crate::index::SecondaryIndex;

type Projection<K> = Box<dyn Fn(&Entity) -> Vec<K> + Send + Sync>;

pub struct KeyIndex<K> {
    matcher: ComponentMatcher,
    project: Projection<K>,
    forward: BTreeMap<K, BTreeSet<EntityId>>,
    reverse: HashMap<EntityId, BTreeSet<K>>,
}

impl<K> KeyIndex<K>
where
    K: Ord + Clone + Send + Sync + 'static,
{
    /// Index every entity by the keys `project` returns.
    pub fn new(project: impl Fn(&Entity) -> Vec<K> + Send + Sync + 'static) -> Self {
        Self::with_matcher(ComponentMatcher::default(), project)
    }

    /// Only entities satisfying `matcher` are projected.
    pub fn with_matcher(
        matcher: ComponentMatcher,
        project: impl Fn(&Entity) -> Vec<K> + Send + Sync + 'static,
    ) -> Self {
        Self {
            matcher,
            project: Box::new(project),
            forward: BTreeMap::new(),
            reverse: HashMap::new(),
        }
    }

    /// Ids currently holding `key`, ascending.
    pub fn lookup(&self, key: &K) -> impl Iterator<Item = EntityId> + '_ {
        self.forward.get(key).into_iter().flatten().copied()
    }

    /// The lowest id holding `key`.
    pub fn first(&self, key: &K) -> Option<EntityId> {
        self.forward.get(key).and_then(|ids| ids.first().copied())
    }

    /// Keys currently held by `id`.
    pub fn keys_for(&self, id: EntityId) -> Option<&BTreeSet<K>> {
        self.reverse.get(&id)
    }

    pub fn key_count(&self) -> usize {
        self.forward.len()
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.forward.keys()
    }

    fn unlink(&mut self, id: EntityId, key: &K) {
        if let Some(ids) = self.forward.get_mut(key) {
            ids.remove(&id);
            if ids.is_empty() {
                self.forward.remove(key);
            }
        }
    }
}

impl<K> SecondaryIndex for KeyIndex<K>
where
    K: Ord + Clone + Send + Sync + 'static,
{
    fn update(&mut self, _old: Option<&Entity>, new: &Entity) {
        let id = new.id;
        let next: BTreeSet<K> = if self.matcher.matches(new) {
            (self.project)(new).into_iter().collect()
        } else {
            BTreeSet::new()
        };
        let prev = self.reverse.remove(&id).unwrap_or_default();

        for key in prev.difference(&next) {
            self.unlink(id, key);
        }
        for key in next.difference(&prev) {
            self.forward.entry(key.clone()).or_default().insert(id);
        }
        if !next.is_empty() {
            self.reverse.insert(id, next);
        }
    }

    fn delete(&mut self, id: EntityId) {
        if let Some(keys) = self.reverse.remove(&id) {
            for key in &keys {
                self.unlink(id, key);
            }
        }
    }

    fn clear(&mut self) {
        self.forward.clear();
        self.reverse.clear();
    }

    fn len(&self) -> usize {
        self.reverse.len()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl<K: fmt::Debug> fmt::Debug for KeyIndex<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyIndex")
            .field("matcher", &self.matcher)
            .field("keys", &self.forward.len())
            .field("entities", &self.reverse.len())
            .finish()
    }
}
