//! An in-process canonical store.
//!
//! [`InMemoryWorld`] keeps every entity with its last committed version and
//! the version at which each component was last written, which is what
//! component-scoped iffs are checked against. Every commit takes the next
//! global version; a transaction with no changes commits nothing and takes
//! no version.
//!
//! Subscribers are fed from inside the commit, under the same lock, so
//! every subscriber sees transactions in commit order and a subscription
//! opened mid-stream never misses or duplicates a commit.
//!
//! Tombstones are kept for the last [`DEFAULT_TOMBSTONE_RETENTION`] versions
//! (see [`InMemoryWorld::with_tombstone_retention`]). A version-only iff on
//! an id with no record is checked against the newest pruned tombstone, so
//! pruning can only turn a success into an abort, never the reverse.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;

use tessel_ecs::change::{Change, ProposedChange};
use tessel_ecs::entity::{Entity, EntityId};
use tessel_ecs::lazy::{EncodedChange, LazyChange};
use tessel_ecs::transaction::{ApplyResult, Iff, Transaction, TransactionOutcome};

use crate::cancel::CancelSignal;
use crate::world::{EntityFilter, SubscriptionConfig, UpdateStream, World, WorldFrame, WorldUpdate};
use crate::WorldError;

type FrameSender = mpsc::UnboundedSender<Result<WorldUpdate, WorldError>>;

/// How many versions a tombstone outlives its delete by default.
pub const DEFAULT_TOMBSTONE_RETENTION: u64 = 4096;

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Record {
    version: u64,
    entity: Entity,
    component_versions: BTreeMap<String, u64>,
}

#[derive(Debug)]
struct Subscriber {
    tx: FrameSender,
    cancel: CancelSignal,
    filter: Option<EntityFilter>,
    /// Ids this subscriber currently sees. Only tracked when filtered.
    visible: HashSet<EntityId>,
}

impl Subscriber {
    /// What this subscriber should see for `change`, given the entity's state
    /// right after it. Entering the filter reads as a Create of the full
    /// entity and leaving it as a Delete.
    fn route(&mut self, change: &Change, current: Option<&Entity>) -> Option<Change> {
        let Some(filter) = &self.filter else {
            return Some(change.clone());
        };
        let id = change.id();
        let was = self.visible.contains(&id);
        let now = current.filter(|e| filter.matches(*e));
        match (was, now) {
            (false, None) => None,
            (false, Some(entity)) => {
                self.visible.insert(id);
                Some(Change::create(change.version(), entity.clone()))
            }
            (true, None) => {
                self.visible.remove(&id);
                Some(Change::delete(change.version(), id))
            }
            (true, Some(_)) => Some(change.clone()),
        }
    }

    /// Whether anyone can still read this subscription.
    fn is_live(&self) -> bool {
        !self.cancel.is_cancelled() && !self.tx.is_closed()
    }

    fn send(&self, changes: Vec<Change>) -> bool {
        if changes.is_empty() {
            return true;
        }
        let lazy = changes.iter().filter_map(encode_or_log).collect();
        self.tx.send(Ok(WorldUpdate::changes(lazy))).is_ok()
    }
}

fn encode_or_log(change: &Change) -> Option<LazyChange> {
    match LazyChange::encode(change) {
        Ok(lazy) => Some(lazy),
        Err(e) => {
            tracing::error!(entity = %change.id(), error = %e, "failed to encode change");
            None
        }
    }
}

#[derive(Debug)]
struct Inner {
    entities: HashMap<EntityId, Record>,
    tombstones: HashMap<EntityId, u64>,
    /// Deletes in commit order, for pruning.
    tombstone_log: VecDeque<(u64, EntityId)>,
    tombstone_retention: u64,
    /// Newest tombstone version pruned so far.
    pruned_through: u64,
    version: u64,
    next_id: u64,
    subscribers: Vec<Subscriber>,
    unavailable: bool,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            entities: HashMap::new(),
            tombstones: HashMap::new(),
            tombstone_log: VecDeque::new(),
            tombstone_retention: DEFAULT_TOMBSTONE_RETENTION,
            pruned_through: 0,
            version: 0,
            next_id: 0,
            subscribers: Vec::new(),
            unavailable: false,
        }
    }
}

impl Inner {
    fn last_version(&self, id: EntityId) -> u64 {
        self.entities
            .get(&id)
            .map(|r| r.version)
            .or_else(|| self.tombstones.get(&id).copied())
            .unwrap_or(0)
    }

    fn unmodified_since(&self, id: EntityId, version: u64) -> bool {
        if let Some(record) = self.entities.get(&id) {
            return record.version <= version;
        }
        match self.tombstones.get(&id) {
            Some(deleted) => *deleted <= version,
            // A pruned tombstone could have been newer than `version`.
            None => self.pruned_through <= version,
        }
    }

    /// Forget tombstones that fell out of the retention window.
    fn prune_tombstones(&mut self) {
        let cutoff = self.version.saturating_sub(self.tombstone_retention);
        while let Some(&(version, id)) = self.tombstone_log.front() {
            if version > cutoff {
                break;
            }
            self.tombstone_log.pop_front();
            if self.tombstones.get(&id) == Some(&version) {
                self.tombstones.remove(&id);
                self.pruned_through = self.pruned_through.max(version);
            }
        }
    }

    fn prune_subscribers(&mut self) {
        let before = self.subscribers.len();
        self.subscribers.retain(Subscriber::is_live);
        let pruned = before - self.subscribers.len();
        if pruned > 0 {
            tracing::debug!(pruned, "dropped closed subscriptions");
        }
    }

    fn holds(&self, iff: &Iff) -> bool {
        let record = self.entities.get(&iff.id);
        match (iff.version, iff.components.is_empty()) {
            (None, _) => record.map_or(false, |r| {
                iff.components.iter().all(|c| r.entity.has(c))
            }),
            (Some(v), false) => record.map_or(false, |r| {
                iff.components
                    .iter()
                    .all(|c| r.component_versions.get(c).map_or(false, |cv| *cv <= v))
            }),
            (Some(0), true) => record.is_none(),
            (Some(v), true) => self.unmodified_since(iff.id, v),
        }
    }

    fn check_available(&self) -> Result<(), WorldError> {
        if self.unavailable {
            Err(WorldError::unavailable("in-memory world marked unavailable"))
        } else {
            Ok(())
        }
    }

    /// Write one committed change into the store. Returns the entity as it
    /// stands afterwards.
    fn write(&mut self, change: &Change) -> Option<Entity> {
        let id = change.id();
        let version = change.version();
        match change {
            Change::Delete { .. } => {
                self.entities.remove(&id);
                self.tombstones.insert(id, version);
                self.tombstone_log.push_back((version, id));
                None
            }
            Change::Create { entity, .. } => {
                let component_versions = entity
                    .component_names()
                    .map(|c| (c.to_owned(), version))
                    .collect();
                self.tombstones.remove(&id);
                self.entities.insert(
                    id,
                    Record {
                        version,
                        entity: entity.clone(),
                        component_versions,
                    },
                );
                Some(entity.clone())
            }
            Change::Update { delta, .. } => {
                self.tombstones.remove(&id);
                let record = self.entities.entry(id).or_insert_with(|| Record {
                    version,
                    entity: Entity::new(id),
                    component_versions: BTreeMap::new(),
                });
                record.version = version;
                record.entity.apply_delta(delta);
                for name in &delta.removed {
                    record.component_versions.remove(name);
                }
                for name in delta.set.keys() {
                    record.component_versions.insert(name.clone(), version);
                }
                Some(record.entity.clone())
            }
        }
    }

    fn commit(&mut self, transaction: Transaction) -> TransactionOutcome {
        if let Some(failed) = transaction.iffs.iter().find(|iff| !self.holds(iff)) {
            tracing::debug!(entity = %failed.id, "transaction aborted: iff failed");
            return TransactionOutcome::aborted();
        }
        if transaction.changes.is_empty() {
            return TransactionOutcome::success(Vec::new());
        }

        self.prune_subscribers();
        self.version += 1;
        let version = self.version;
        let mut committed = Vec::with_capacity(transaction.changes.len());
        let mut frames: Vec<Vec<Change>> = vec![Vec::new(); self.subscribers.len()];
        for proposed in transaction.changes {
            let change = ProposedChange::commit(proposed, version);
            let current = self.write(&change);
            for (frame, sub) in frames.iter_mut().zip(self.subscribers.iter_mut()) {
                if let Some(routed) = sub.route(&change, current.as_ref()) {
                    frame.push(routed);
                }
            }
            committed.push(change);
        }

        let mut frames = frames.into_iter();
        self.subscribers.retain(|sub| {
            let frame = frames.next().unwrap_or_default();
            sub.send(frame)
        });
        self.prune_tombstones();
        tracing::debug!(version, changes = committed.len(), "transaction committed");
        TransactionOutcome::success(committed)
    }

    fn close_subscribers(&mut self, error: WorldError) -> usize {
        let count = self.subscribers.len();
        for sub in self.subscribers.drain(..) {
            let _ = sub.tx.send(Err(error.clone()));
        }
        count
    }
}

// ---------------------------------------------------------------------------
// InMemoryWorld
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct InMemoryWorld {
    inner: Mutex<Inner>,
}

impl InMemoryWorld {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store pre-populated with `(version, entity)` records. The commit
    /// counter resumes after the highest version given.
    pub fn from_snapshot(records: impl IntoIterator<Item = (u64, Entity)>) -> Self {
        let mut inner = Inner::default();
        for (version, entity) in records {
            inner.version = inner.version.max(version);
            inner.next_id = inner.next_id.max(entity.id.to_raw());
            inner.write(&Change::create(version, entity));
        }
        Self {
            inner: Mutex::new(inner),
        }
    }

    /// Keep tombstones for `versions` commits after their delete instead of
    /// [`DEFAULT_TOMBSTONE_RETENTION`]. Zero drops them at the next commit.
    pub fn with_tombstone_retention(self, versions: u64) -> Self {
        {
            let mut inner = self.lock();
            inner.tombstone_retention = versions;
            inner.prune_tombstones();
        }
        self
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Simulate connectivity loss. Going unavailable also drops every open
    /// subscription with a transient error.
    pub fn set_available(&self, available: bool) {
        let mut inner = self.lock();
        inner.unavailable = !available;
        if !available {
            let dropped = inner.close_subscribers(WorldError::unavailable("connection lost"));
            tracing::info!(dropped, "in-memory world went unavailable");
        }
    }

    /// Drop every open subscription with a transient error. Returns how many
    /// were dropped.
    pub fn disconnect_subscribers(&self) -> usize {
        self.lock()
            .close_subscribers(WorldError::unavailable("subscription dropped"))
    }

    /// Drop every open subscription with a non-retryable error.
    pub fn fail_subscribers(&self, reason: &str) -> usize {
        self.lock().close_subscribers(WorldError::ReplicationFailure {
            reason: reason.to_owned(),
        })
    }

    /// Push a raw frame to every subscriber, bypassing the store.
    pub fn inject_frame(&self, changes: Vec<EncodedChange>) {
        let inner = self.lock();
        let frame = WorldFrame {
            changes,
            bootstrapped: false,
        };
        for sub in &inner.subscribers {
            let _ = sub.tx.send(Ok(WorldUpdate::from(frame.clone())));
        }
    }

    pub fn entity_count(&self) -> usize {
        self.lock().entities.len()
    }

    /// The last committed version.
    pub fn version(&self) -> u64 {
        self.lock().version
    }

    /// Tombstones currently retained.
    pub fn tombstone_count(&self) -> usize {
        self.lock().tombstones.len()
    }

    /// Open subscriptions. Cancelled or dropped streams are not counted.
    pub fn subscriber_count(&self) -> usize {
        let mut inner = self.lock();
        inner.prune_subscribers();
        inner.subscribers.len()
    }
}

#[async_trait]
impl World for InMemoryWorld {
    async fn get(&self, ids: &[EntityId]) -> Result<Vec<(u64, Option<Entity>)>, WorldError> {
        let inner = self.lock();
        inner.check_available()?;
        Ok(ids
            .iter()
            .map(|id| match inner.entities.get(id) {
                Some(r) => (r.version, Some(r.entity.clone())),
                None => (inner.last_version(*id), None),
            })
            .collect())
    }

    async fn apply(&self, transactions: Vec<Transaction>) -> Result<ApplyResult, WorldError> {
        let mut inner = self.lock();
        inner.check_available()?;
        let outcomes = transactions
            .into_iter()
            .map(|tx| inner.commit(tx))
            .collect();
        Ok(ApplyResult { outcomes })
    }

    async fn subscribe(
        &self,
        config: SubscriptionConfig,
        cancel: CancelSignal,
    ) -> Result<UpdateStream, WorldError> {
        let mut inner = self.lock();
        inner.check_available()?;
        inner.prune_subscribers();
        let (tx, rx) = mpsc::unbounded_channel();

        let mut live: Vec<&Record> = inner
            .entities
            .values()
            .filter(|r| config.filter.as_ref().map_or(true, |f| f.matches(&r.entity)))
            .collect();
        live.sort_by_key(|r| r.entity.id);

        let visible: HashSet<EntityId> = if config.filter.is_some() {
            live.iter().map(|r| r.entity.id).collect()
        } else {
            HashSet::new()
        };
        for chunk in live.chunks(config.bootstrap_batch_size.max(1)) {
            let changes = chunk
                .iter()
                .map(|r| Change::create(r.version, r.entity.clone()))
                .filter_map(|c| encode_or_log(&c))
                .collect();
            let _ = tx.send(Ok(WorldUpdate::changes(changes)));
        }
        let _ = tx.send(Ok(WorldUpdate::bootstrapped()));
        tracing::debug!(
            entities = live.len(),
            filtered = config.filter.is_some(),
            "subscription bootstrapped"
        );

        inner.subscribers.push(Subscriber {
            tx,
            cancel: cancel.clone(),
            filter: config.filter,
            visible,
        });
        Ok(UpdateStream::new(rx, cancel))
    }

    async fn healthy(&self) -> bool {
        !self.lock().unavailable
    }

    async fn generate_ids(&self, count: usize) -> Result<Vec<EntityId>, WorldError> {
        let mut inner = self.lock();
        inner.check_available()?;
        let mut ids = Vec::with_capacity(count);
        for _ in 0..count {
            inner.next_id += 1;
            ids.push(EntityId::try_from(inner.next_id)?);
        }
        Ok(ids)
    }
}
