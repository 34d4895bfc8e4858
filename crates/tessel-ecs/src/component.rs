//! Component presence predicates.
//!
//! The data layer never interprets component payloads. Everything that needs
//! to classify entities (secondary indices, subscription filters) does so
//! through [`ComponentSet`], which only answers "is this component present?".
//! That lets the same predicate run over a materialized [`Entity`] or over a
//! [`LazyEntity`](crate::lazy::LazyEntity) whose payloads were never decoded.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::entity::{Components, Entity};

// ---------------------------------------------------------------------------
// ComponentSet
// ---------------------------------------------------------------------------

/// Anything that can answer component-presence questions.
pub trait ComponentSet {
    fn has_component(&self, name: &str) -> bool;
}

impl ComponentSet for Entity {
    fn has_component(&self, name: &str) -> bool {
        self.has(name)
    }
}

impl ComponentSet for Components {
    fn has_component(&self, name: &str) -> bool {
        self.contains_key(name)
    }
}

impl<T: ComponentSet + ?Sized> ComponentSet for &T {
    fn has_component(&self, name: &str) -> bool {
        (**self).has_component(name)
    }
}

// ---------------------------------------------------------------------------
// ComponentMatcher
// ---------------------------------------------------------------------------

/// Matches entities that carry every component in a required set.
///
/// An empty matcher matches every entity.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ComponentMatcher {
    required: BTreeSet<String>,
}

impl ComponentMatcher {
    pub fn new<I, S>(required: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            required: required.into_iter().map(Into::into).collect(),
        }
    }

    pub fn required(&self) -> impl Iterator<Item = &str> {
        self.required.iter().map(String::as_str)
    }

    pub fn matches(&self, entity: &impl ComponentSet) -> bool {
        self.required.iter().all(|name| entity.has_component(name))
    }

    /// Whether a change touching `component` could flip this matcher.
    pub fn depends_on(&self, component: &str) -> bool {
        self.required.contains(component)
    }
}
