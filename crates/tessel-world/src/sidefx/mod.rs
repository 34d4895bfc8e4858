//! Reactive processing of the change stream.
//!
//! A [`SideEffectProcessor`] mirrors a replica's ticks into its own
//! [`Table`] and, on a fixed cadence, hands everything that arrived since
//! the last cycle to each registered [`SideEffect`]. Effects write through a
//! shared [`ChangeSet`]; the resulting transactions go to the store in one
//! `apply`. When one of them aborts, only the changes that caused it are
//! queued for the next cycle, so a lost race is retried rather than dropped
//! and unrelated work keeps flowing.

mod changeset;
mod deletes_with;

pub use changeset::{ChangeSet, DerivedTransaction};
pub use deletes_with::{DeletesWithEffect, DELETES_WITH};

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use tessel_ecs::change::Change;
use tessel_ecs::entity::EntityId;
use tessel_ecs::table::Table;
use tessel_ecs::EcsError;

use crate::cancel::CancelSignal;
use crate::config::ProcessorConfig;
use crate::replica::TickEvent;
use crate::world::World;
use crate::WorldError;

// ---------------------------------------------------------------------------
// SideEffect
// ---------------------------------------------------------------------------

#[async_trait]
pub trait SideEffect: Send + Sync {
    fn name(&self) -> &str;

    /// Called once on registration, e.g. to add the indices this effect
    /// queries.
    fn install(&self, _table: &mut Table) -> Result<(), EcsError> {
        Ok(())
    }

    /// Sees the table before `changes` land.
    fn pre_apply(&mut self, _table: &Table, _changes: &[Change]) {}

    /// React to `changes`, which have already been applied to the table.
    /// Changes re-queued after an abort are passed again, ahead of fresh
    /// ones.
    async fn post_apply(&mut self, changes: &[Change], set: &mut ChangeSet<'_>) -> anyhow::Result<()>;
}

// ---------------------------------------------------------------------------
// Processor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TickReport {
    /// Fresh changes applied to the local table.
    pub applied: usize,
    /// Re-queued changes evaluated again this tick.
    pub retried: usize,
    pub committed: usize,
    pub aborted: usize,
    /// Changes queued for the next tick.
    pub requeued: usize,
    pub failed_effects: usize,
}

pub struct SideEffectProcessor {
    world: Arc<dyn World>,
    table: Table,
    config: ProcessorConfig,
    effects: Vec<Box<dyn SideEffect>>,
    incoming: Vec<Change>,
    requeued: Vec<Change>,
    /// Positions in `requeued` by `(id, version)`.
    requeued_at: HashMap<(EntityId, u64), Vec<usize>>,
}

impl SideEffectProcessor {
    pub fn new(world: Arc<dyn World>, table: Table, config: ProcessorConfig) -> Self {
        Self {
            world,
            table,
            config,
            effects: Vec::new(),
            incoming: Vec::new(),
            requeued: Vec::new(),
            requeued_at: HashMap::new(),
        }
    }

    pub fn register(&mut self, effect: impl SideEffect + 'static) -> Result<(), WorldError> {
        effect.install(&mut self.table)?;
        tracing::debug!(effect = effect.name(), "side effect registered");
        self.effects.push(Box::new(effect));
        Ok(())
    }

    pub fn table(&self) -> &Table {
        &self.table
    }

    /// Changes waiting for the next tick, fresh and re-queued.
    pub fn pending(&self) -> usize {
        self.incoming.len() + self.requeued.len()
    }

    pub fn enqueue(&mut self, event: &TickEvent) {
        self.incoming.extend(event.changes.iter().cloned());
    }

    fn requeue(&mut self, causes: impl IntoIterator<Item = Change>) -> usize {
        let mut added = 0;
        for cause in causes {
            let slots = self.requeued_at.entry((cause.id(), cause.version())).or_default();
            if slots.iter().any(|&i| self.requeued[i] == cause) {
                continue;
            }
            slots.push(self.requeued.len());
            self.requeued.push(cause);
            added += 1;
        }
        added
    }

    fn take_requeued(&mut self) -> Vec<Change> {
        self.requeued_at.clear();
        std::mem::take(&mut self.requeued)
    }

    /// Run one cycle over everything queued since the last one.
    pub async fn tick(&mut self) -> TickReport {
        let fresh = std::mem::take(&mut self.incoming);
        let retry = self.take_requeued();
        let mut report = TickReport {
            applied: fresh.len(),
            retried: retry.len(),
            ..Default::default()
        };
        if fresh.is_empty() && retry.is_empty() {
            return report;
        }

        for effect in &mut self.effects {
            effect.pre_apply(&self.table, &fresh);
        }
        self.table.apply(&fresh);

        let mut batch = retry;
        batch.extend(fresh);

        let mut failed_batch = false;
        let derived = {
            let mut set = ChangeSet::new(&self.table);
            for effect in &mut self.effects {
                let saved = set.checkpoint();
                if let Err(e) = effect.post_apply(&batch, &mut set).await {
                    tracing::warn!(effect = effect.name(), error = %e, "side effect failed");
                    set.restore(saved);
                    report.failed_effects += 1;
                    failed_batch = true;
                }
            }
            set.into_transactions()
        };
        if failed_batch {
            report.requeued += self.requeue(batch);
        }
        if derived.is_empty() {
            return report;
        }

        let transactions = derived.iter().map(|d| d.transaction.clone()).collect();
        match self.world.apply(transactions).await {
            Ok(result) => {
                for (d, outcome) in derived.into_iter().zip(result.outcomes) {
                    if outcome.is_success() {
                        report.committed += 1;
                    } else {
                        report.aborted += 1;
                        report.requeued += self.requeue(d.causes);
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, transactions = derived.len(), "side effect apply failed");
                for d in derived {
                    report.requeued += self.requeue(d.causes);
                }
            }
        }
        if report.aborted > 0 {
            tracing::debug!(aborted = report.aborted, requeued = report.requeued, "side effects re-queued");
        }
        report
    }

    /// Consume tick events until cancelled or the sender closes, running a
    /// cycle every `1 / flush_hz` seconds over whatever arrived.
    pub async fn run(
        &mut self,
        mut events: mpsc::UnboundedReceiver<Arc<TickEvent>>,
        mut cancel: CancelSignal,
    ) {
        let mut interval = tokio::time::interval(self.config.period());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => self.enqueue(&event),
                    None => {
                        self.tick().await;
                        break;
                    }
                },
                _ = interval.tick() => {
                    let report = self.tick().await;
                    if report != TickReport::default() {
                        tracing::trace!(?report, "side effect tick");
                    }
                }
            }
        }
        tracing::info!(pending = self.pending(), "side effect processor stopped");
    }
}

impl std::fmt::Debug for SideEffectProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SideEffectProcessor")
            .field("effects", &self.effects.iter().map(|e| e.name()).collect::<Vec<_>>())
            .field("pending", &self.pending())
            .finish_non_exhaustive()
    }
}
