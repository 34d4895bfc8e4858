//! The contract any canonical store must satisfy.
//!
//! A [`World`] offers three operations:
//!
//! - `get`: point reads, returning the entity and its version.
//! - `apply`: a batch of independent conditional transactions. Each commits
//!   fully or aborts fully, and one aborting never affects its siblings.
//! - `subscribe`: a cancellable stream of [`WorldUpdate`] frames. A fresh
//!   subscription delivers a bootstrap burst (one Create per live matching
//!   entity), then a frame with `bootstrapped` set, then incremental changes
//!   in commit order. There is no resume cursor; resubscribing always
//!   bootstraps again.
//!
//! Every observer of a given entity sees its changes in the same relative
//! order. Nothing is promised across entities.

use std::collections::HashSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use tessel_ecs::component::ComponentSet;
use tessel_ecs::entity::{Entity, EntityId};
use tessel_ecs::lazy::{EncodedChange, LazyChange};
use tessel_ecs::transaction::{ApplyResult, Transaction, TransactionOutcome};

use crate::cancel::CancelSignal;
use crate::WorldError;

// ---------------------------------------------------------------------------
// Frames
// ---------------------------------------------------------------------------

/// One subscription frame.
#[derive(Debug, Clone, Default)]
pub struct WorldUpdate {
    pub changes: Vec<LazyChange>,
    /// Set on the frame that ends the bootstrap burst.
    pub bootstrapped: bool,
}

impl WorldUpdate {
    pub fn changes(changes: Vec<LazyChange>) -> Self {
        Self {
            changes,
            bootstrapped: false,
        }
    }

    pub fn bootstrapped() -> Self {
        Self {
            changes: Vec::new(),
            bootstrapped: true,
        }
    }
}

/// Wire form of a [`WorldUpdate`].
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct WorldFrame {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub changes: Vec<EncodedChange>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub bootstrapped: bool,
}

impl From<&WorldUpdate> for WorldFrame {
    fn from(update: &WorldUpdate) -> Self {
        Self {
            changes: update.changes.iter().map(LazyChange::to_encoded).collect(),
            bootstrapped: update.bootstrapped,
        }
    }
}

impl From<WorldFrame> for WorldUpdate {
    fn from(frame: WorldFrame) -> Self {
        Self {
            changes: frame
                .changes
                .into_iter()
                .map(LazyChange::from_encoded)
                .collect(),
            bootstrapped: frame.bootstrapped,
        }
    }
}

// ---------------------------------------------------------------------------
// Filters
// ---------------------------------------------------------------------------

/// Component-presence filter for a subscription.
///
/// An entity matches when it carries every `all_of` component, at least one
/// `any_of` component (if any are listed), and no `none_of` component.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EntityFilter {
    pub all_of: Vec<String>,
    pub any_of: Vec<String>,
    pub none_of: Vec<String>,
}

impl EntityFilter {
    pub fn all_of<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            all_of: names.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn with_any_of<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.any_of.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn with_none_of<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.none_of.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn matches(&self, entity: &impl ComponentSet) -> bool {
        self.all_of.iter().all(|c| entity.has_component(c))
            && (self.any_of.is_empty() || self.any_of.iter().any(|c| entity.has_component(c)))
            && !self.none_of.iter().any(|c| entity.has_component(c))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriptionConfig {
    /// `None` subscribes to everything.
    pub filter: Option<EntityFilter>,
    /// Creates per bootstrap frame.
    pub bootstrap_batch_size: usize,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            filter: None,
            bootstrap_batch_size: 100,
        }
    }
}

impl SubscriptionConfig {
    pub fn filtered(filter: EntityFilter) -> Self {
        Self {
            filter: Some(filter),
            ..Default::default()
        }
    }
}

// ---------------------------------------------------------------------------
// UpdateStream
// ---------------------------------------------------------------------------

/// The receiving end of a subscription.
///
/// Ends (`None`) once cancelled or once the store drops the subscription.
/// Cancellation is observed promptly even while waiting for a frame.
#[derive(Debug)]
pub struct UpdateStream {
    rx: mpsc::UnboundedReceiver<Result<WorldUpdate, WorldError>>,
    cancel: CancelSignal,
}

impl UpdateStream {
    pub fn new(
        rx: mpsc::UnboundedReceiver<Result<WorldUpdate, WorldError>>,
        cancel: CancelSignal,
    ) -> Self {
        Self { rx, cancel }
    }

    pub async fn next(&mut self) -> Option<Result<WorldUpdate, WorldError>> {
        if self.cancel.is_cancelled() {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            item = self.rx.recv() => item,
        }
    }
}

// ---------------------------------------------------------------------------
// World
// ---------------------------------------------------------------------------

#[async_trait]
pub trait World: Send + Sync {
    /// Current `(version, entity)` per id. An absent entity reports the
    /// version of its tombstone, or 0 if it never existed or the store has
    /// since forgotten the tombstone.
    async fn get(&self, ids: &[EntityId]) -> Result<Vec<(u64, Option<Entity>)>, WorldError>;

    /// Apply independent transactions; one outcome per transaction, in order.
    async fn apply(&self, transactions: Vec<Transaction>) -> Result<ApplyResult, WorldError>;

    async fn subscribe(
        &self,
        config: SubscriptionConfig,
        cancel: CancelSignal,
    ) -> Result<UpdateStream, WorldError>;

    /// Cheap liveness probe.
    async fn healthy(&self) -> bool;

    /// Reserve `count` fresh ids.
    async fn generate_ids(&self, count: usize) -> Result<Vec<EntityId>, WorldError>;

    async fn get_one(&self, id: EntityId) -> Result<Option<(u64, Entity)>, WorldError> {
        let mut found = self.get(&[id]).await?;
        Ok(match found.pop() {
            Some((version, Some(entity))) => Some((version, entity)),
            _ => None,
        })
    }

    async fn apply_one(&self, transaction: Transaction) -> Result<TransactionOutcome, WorldError> {
        let mut result = self.apply(vec![transaction]).await?;
        result
            .outcomes
            .pop()
            .ok_or_else(|| WorldError::unavailable("store returned no outcome"))
    }
}

/// Ids present in a set of entities, used when reconciling bootstraps.
pub(crate) fn ids_of<'a>(changes: impl IntoIterator<Item = &'a LazyChange>) -> HashSet<EntityId> {
    changes.into_iter().map(LazyChange::id).collect()
}
