//! Conditional transactions.
//!
//! A [`Transaction`] is a batch of [`ProposedChange`]s guarded by [`Iff`]
//! preconditions. The store checks every iff at commit time; if any fails
//! the whole transaction aborts and none of its changes become visible.
//! Iffs are the only cross-transaction coordination primitive.

use serde::{Deserialize, Serialize};

use crate::change::{Change, ProposedChange};
use crate::entity::{Entity, EntityDelta, EntityId};

// ---------------------------------------------------------------------------
// Iff
// ---------------------------------------------------------------------------

/// A commit-time precondition on one entity.
///
/// | `version`  | `components` | holds when                                        |
/// |------------|--------------|---------------------------------------------------|
/// | `None`     | any          | the entity exists and carries `components`        |
/// | `Some(0)`  | empty        | the entity does not exist                         |
/// | `Some(v)`  | empty        | the entity (or its tombstone) is at version <= v  |
/// | `Some(v)`  | non-empty    | the entity exists, carries `components`, and none |
/// |            |              | of them changed after `v`                         |
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Iff {
    pub id: EntityId,
    #[serde(default)]
    pub version: Option<u64>,
    #[serde(default)]
    pub components: Vec<String>,
}

impl Iff {
    /// The entity must exist.
    pub fn exists(id: EntityId) -> Self {
        Self {
            id,
            version: None,
            components: Vec::new(),
        }
    }

    /// The entity must not exist.
    pub fn absent(id: EntityId) -> Self {
        Self {
            id,
            version: Some(0),
            components: Vec::new(),
        }
    }

    /// The entity must be unmodified since `version`.
    pub fn at_version(id: EntityId, version: u64) -> Self {
        Self {
            id,
            version: Some(version),
            components: Vec::new(),
        }
    }

    /// The named components must be present and unmodified since `version`.
    pub fn components_at<I, S>(id: EntityId, version: u64, components: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id,
            version: Some(version),
            components: components.into_iter().map(Into::into).collect(),
        }
    }

    /// Require components on top of an existing condition.
    pub fn requiring<I, S>(mut self, components: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.components
            .extend(components.into_iter().map(Into::into));
        self
    }
}

// ---------------------------------------------------------------------------
// Transaction
// ---------------------------------------------------------------------------

/// An atomic batch of changes guarded by iffs.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Transaction {
    #[serde(default)]
    pub changes: Vec<ProposedChange>,
    #[serde(default)]
    pub iffs: Vec<Iff>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_change(mut self, change: ProposedChange) -> Self {
        self.changes.push(change);
        self
    }

    pub fn with_iff(mut self, iff: Iff) -> Self {
        self.iffs.push(iff);
        self
    }

    pub fn create(self, entity: Entity) -> Self {
        self.with_change(ProposedChange::create(entity))
    }

    pub fn update(self, delta: EntityDelta) -> Self {
        self.with_change(ProposedChange::update(delta))
    }

    pub fn delete(self, id: EntityId) -> Self {
        self.with_change(ProposedChange::delete(id))
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty() && self.iffs.is_empty()
    }

    /// Ids touched by changes, in first-touch order without duplicates.
    pub fn touched_ids(&self) -> Vec<EntityId> {
        let mut ids: Vec<EntityId> = Vec::new();
        for change in &self.changes {
            let id = change.id();
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        ids
    }

    /// Append another transaction's changes and iffs.
    pub fn absorb(&mut self, other: Transaction) {
        self.changes.extend(other.changes);
        self.iffs.extend(other.iffs);
    }
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyOutcome {
    Success,
    Aborted,
}

/// The outcome of one transaction plus the changes it committed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionOutcome {
    pub outcome: ApplyOutcome,
    /// Empty when aborted.
    #[serde(default)]
    pub changes: Vec<Change>,
}

impl TransactionOutcome {
    pub fn success(changes: Vec<Change>) -> Self {
        Self {
            outcome: ApplyOutcome::Success,
            changes,
        }
    }

    pub fn aborted() -> Self {
        Self {
            outcome: ApplyOutcome::Aborted,
            changes: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == ApplyOutcome::Success
    }
}

/// One [`TransactionOutcome`] per submitted transaction, in submission order.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ApplyResult {
    pub outcomes: Vec<TransactionOutcome>,
}

impl ApplyResult {
    /// Every committed change, in commit order.
    pub fn changes(&self) -> impl Iterator<Item = &Change> {
        self.outcomes.iter().flat_map(|o| o.changes.iter())
    }

    pub fn all_succeeded(&self) -> bool {
        self.outcomes.iter().all(TransactionOutcome::is_success)
    }

    pub fn aborted_count(&self) -> usize {
        self.outcomes.iter().filter(|o| !o.is_success()).count()
    }
}
