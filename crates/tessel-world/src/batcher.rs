//! Buffered event submission.
//!
//! Callers hand an [`EventBatcher`] events that each become one
//! transaction. A flush submits every pending event as its own transaction
//! in a single `apply` call, so one event's iff failing aborts that event
//! alone and its caller alone hears about it.
//!
//! Short circuits are blind per-entity updates that skip the event path.
//! Deltas for the same entity merge while queued, each flush sends one
//! transaction per entity guarded only by existence, and an abort (the
//! entity is gone) is dropped silently. Events and short circuits are
//! flushed concurrently.
//!
//! When the store is unreachable, both queues are kept in order and retried
//! by [`EventBatcher::drain`], which probes [`World::healthy`] between
//! attempts and gives up after a bounded number of failures.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;

use tessel_ecs::change::Change;
use tessel_ecs::entity::{EntityDelta, EntityId};
use tessel_ecs::transaction::{ApplyResult, Iff, Transaction};

use crate::backoff::Backoff;
use crate::config::BatcherConfig;
use crate::world::World;
use crate::WorldError;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Something that can be submitted as exactly one transaction.
pub trait BatchEvent: Send + 'static {
    fn to_transaction(&self) -> Transaction;
}

impl BatchEvent for Transaction {
    fn to_transaction(&self) -> Transaction {
        self.clone()
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BatchError {
    /// An iff failed; the store is unchanged by this event.
    #[error("transaction aborted")]
    TransactionAborted,

    /// The store stayed unreachable for every drain attempt.
    #[error("store unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("submission failed: {reason}")]
    Failed { reason: String },

    /// The batcher was dropped with the event still queued.
    #[error("event dropped before submission")]
    Dropped,
}

type EventResult = Result<Vec<Change>, BatchError>;

/// Resolves once the submitted event commits or fails.
#[derive(Debug)]
pub struct EventTicket {
    rx: oneshot::Receiver<EventResult>,
}

impl EventTicket {
    /// The committed changes, or why the event did not commit.
    pub async fn wait(self) -> EventResult {
        self.rx.await.unwrap_or(Err(BatchError::Dropped))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlushReport {
    pub committed: usize,
    pub aborted: usize,
    pub short_circuits: usize,
    /// Events and short circuits put back after a transient failure.
    pub requeued: usize,
}

/// A flush that hit a store error. `report` still counts everything that
/// went through before or beside the failure.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("flush incomplete: {error}")]
pub struct FlushError {
    pub report: FlushReport,
    #[source]
    pub error: WorldError,
}

impl FlushError {
    pub fn is_transient(&self) -> bool {
        self.error.is_transient()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DrainReport {
    pub flushes: u32,
    pub failed_attempts: u32,
    /// Flushes that failed with a non-retryable store error.
    pub fatal_errors: u32,
    pub committed: usize,
    pub aborted: usize,
    pub short_circuits: usize,
    /// Events failed with [`BatchError::Unavailable`] when attempts ran out.
    pub abandoned: usize,
}

impl DrainReport {
    fn absorb(&mut self, flushed: &FlushReport) {
        self.committed += flushed.committed;
        self.aborted += flushed.aborted;
        self.short_circuits += flushed.short_circuits;
    }
}

// ---------------------------------------------------------------------------
// EventBatcher
// ---------------------------------------------------------------------------

struct Pending<E> {
    event: E,
    done: oneshot::Sender<EventResult>,
}

struct Queues<E> {
    events: VecDeque<Pending<E>>,
    short_circuits: BTreeMap<EntityId, EntityDelta>,
}

pub struct EventBatcher<E> {
    world: Arc<dyn World>,
    config: BatcherConfig,
    queues: Mutex<Queues<E>>,
}

impl<E: BatchEvent> EventBatcher<E> {
    pub fn new(world: Arc<dyn World>, config: BatcherConfig) -> Self {
        Self {
            world,
            config,
            queues: Mutex::new(Queues {
                events: VecDeque::new(),
                short_circuits: BTreeMap::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Queues<E>> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue an event for the next flush.
    pub fn submit(&self, event: E) -> EventTicket {
        let (done, rx) = oneshot::channel();
        self.lock().events.push_back(Pending { event, done });
        EventTicket { rx }
    }

    /// Queue a blind update, merging it over any delta already queued for
    /// the same entity.
    pub fn short_circuit(&self, delta: EntityDelta) {
        let mut queues = self.lock();
        match queues.short_circuits.get_mut(&delta.id) {
            Some(queued) => queued.merge(&delta),
            None => {
                queues.short_circuits.insert(delta.id, delta);
            }
        }
    }

    pub fn pending_events(&self) -> usize {
        self.lock().events.len()
    }

    pub fn pending_short_circuits(&self) -> usize {
        self.lock().short_circuits.len()
    }

    fn is_idle(&self) -> bool {
        let queues = self.lock();
        queues.events.is_empty() && queues.short_circuits.is_empty()
    }

    /// Submit everything queued so far. On error, transient failures have
    /// already been re-queued and fatal ones reported to their tickets; the
    /// error carries the counts for whatever half did go through.
    pub async fn flush(&self) -> Result<FlushReport, FlushError> {
        let (events, short_circuits) = {
            let mut queues = self.lock();
            (
                std::mem::take(&mut queues.events),
                std::mem::take(&mut queues.short_circuits),
            )
        };
        if events.is_empty() && short_circuits.is_empty() {
            return Ok(FlushReport::default());
        }

        let event_txs: Vec<Transaction> = events.iter().map(|p| p.event.to_transaction()).collect();
        let short_txs: Vec<Transaction> = short_circuits
            .iter()
            .map(|(id, delta)| Transaction::new().with_iff(Iff::exists(*id)).update(delta.clone()))
            .collect();
        let (event_result, short_result) = tokio::join!(
            apply_nonempty(self.world.as_ref(), event_txs),
            apply_nonempty(self.world.as_ref(), short_txs),
        );

        let mut report = FlushReport::default();
        let mut first_error = None;

        match event_result {
            Ok(result) => {
                let mut outcomes = result.outcomes.into_iter();
                for pending in events {
                    let outcome = match outcomes.next() {
                        Some(o) if o.is_success() => {
                            report.committed += 1;
                            Ok(o.changes)
                        }
                        Some(_) => {
                            report.aborted += 1;
                            Err(BatchError::TransactionAborted)
                        }
                        None => Err(BatchError::Failed {
                            reason: "store returned fewer outcomes than transactions".into(),
                        }),
                    };
                    let _ = pending.done.send(outcome);
                }
            }
            Err(e) if e.is_transient() => {
                report.requeued += events.len();
                let mut queues = self.lock();
                for pending in events.into_iter().rev() {
                    queues.events.push_front(pending);
                }
                first_error = Some(e);
            }
            Err(e) => {
                tracing::error!(error = %e, events = events.len(), "event flush failed");
                for pending in events {
                    let _ = pending.done.send(Err(BatchError::Failed {
                        reason: e.to_string(),
                    }));
                }
                first_error = Some(e);
            }
        }

        match short_result {
            Ok(result) => {
                for ((id, _), outcome) in short_circuits.iter().zip(&result.outcomes) {
                    if outcome.is_success() {
                        report.short_circuits += 1;
                    } else {
                        tracing::debug!(entity = %id, "short circuit dropped: entity gone");
                    }
                }
            }
            Err(e) if e.is_transient() => {
                report.requeued += short_circuits.len();
                let mut queues = self.lock();
                for (id, mut older) in short_circuits {
                    if let Some(newer) = queues.short_circuits.remove(&id) {
                        older.merge(&newer);
                    }
                    queues.short_circuits.insert(id, older);
                }
                first_error.get_or_insert(e);
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    count = short_circuits.len(),
                    "short circuits dropped"
                );
                first_error.get_or_insert(e);
            }
        }

        tracing::debug!(
            committed = report.committed,
            aborted = report.aborted,
            short_circuits = report.short_circuits,
            requeued = report.requeued,
            "flushed"
        );
        match first_error {
            Some(error) => Err(FlushError { report, error }),
            None => Ok(report),
        }
    }

    /// Flush until both queues are empty, retrying transient failures with
    /// backoff. After `max_drain_attempts` failures every event still
    /// queued fails with [`BatchError::Unavailable`] and queued short
    /// circuits are discarded.
    pub async fn drain(&self) -> DrainReport {
        let mut report = DrainReport::default();
        let mut backoff = Backoff::new(self.config.backoff.clone());
        let max_failures = self.config.max_drain_attempts.max(1);
        let mut last_error = String::from("store unhealthy");

        while !self.is_idle() {
            if report.failed_attempts >= max_failures {
                report.abandoned = self.abandon(&last_error);
                break;
            }
            if report.failed_attempts > 0 && !self.world.healthy().await {
                report.failed_attempts += 1;
                last_error = "store unhealthy".into();
                self.pause(&mut backoff).await;
                continue;
            }
            report.flushes += 1;
            match self.flush().await {
                Ok(flushed) => report.absorb(&flushed),
                Err(FlushError {
                    report: flushed,
                    error,
                }) => {
                    report.absorb(&flushed);
                    if !error.is_transient() {
                        report.fatal_errors += 1;
                        tracing::error!(error = %error, "flush failed permanently");
                    }
                    // Anything re-queued waits out a backoff before retrying.
                    if flushed.requeued > 0 {
                        report.failed_attempts += 1;
                        tracing::warn!(
                            error = %error,
                            attempt = report.failed_attempts,
                            requeued = flushed.requeued,
                            "flush failed, retrying"
                        );
                        last_error = error.to_string();
                        self.pause(&mut backoff).await;
                    }
                }
            }
        }
        report
    }

    async fn pause(&self, backoff: &mut Backoff) {
        let delay = backoff
            .next_delay()
            .unwrap_or_else(|| self.config.backoff.ceiling(backoff.attempt()));
        tokio::time::sleep(delay).await;
    }

    fn abandon(&self, reason: &str) -> usize {
        let (events, short_circuits) = {
            let mut queues = self.lock();
            (
                std::mem::take(&mut queues.events),
                std::mem::take(&mut queues.short_circuits),
            )
        };
        tracing::error!(
            events = events.len(),
            short_circuits = short_circuits.len(),
            %reason,
            "drain gave up"
        );
        let count = events.len();
        for pending in events {
            let _ = pending.done.send(Err(BatchError::Unavailable {
                reason: reason.to_owned(),
            }));
        }
        count
    }
}

impl<E> std::fmt::Debug for EventBatcher<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBatcher")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

async fn apply_nonempty(
    world: &dyn World,
    transactions: Vec<Transaction>,
) -> Result<ApplyResult, WorldError> {
    if transactions.is_empty() {
        return Ok(ApplyResult::default());
    }
    world.apply(transactions).await
}
