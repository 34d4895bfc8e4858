//! A self-healing local replica of the canonical store.
//!
//! A [`Replica`] owns its [`Table`] inside a background task. The task
//! subscribes, folds every frame into the table, and fans each applied batch
//! out to listeners as a [`TickEvent`]. When the subscription drops it
//! resubscribes with backoff and re-bootstraps; ids the fresh bootstrap no
//! longer carries are deleted locally so the table converges on the store.
//!
//! Reads are closures run against the table inside the task, so a reader
//! always sees a table between two applied frames, never in the middle of
//! one.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use tessel_ecs::change::Change;
use tessel_ecs::entity::EntityId;
use tessel_ecs::lazy::materialize_batch;
use tessel_ecs::table::Table;

use crate::backoff::Backoff;
use crate::cancel::{cancel_pair, CancelHandle, CancelSignal};
use crate::config::{FailurePolicy, ReplicaConfig};
use crate::world::{ids_of, World};
use crate::WorldError;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// One batch of changes applied to the replica's table.
#[derive(Debug, Clone, PartialEq)]
pub struct TickEvent {
    /// Changes exactly as applied, including local deletes produced by
    /// bootstrap reconciliation.
    pub changes: Vec<Change>,
    /// Set on the tick that completes a (re)bootstrap.
    pub bootstrapped: bool,
    /// Increments on every successful subscription.
    pub epoch: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicaState {
    Unstarted,
    /// Subscribing, or waiting for the bootstrap burst to finish.
    Bootstrapping,
    Live,
    Stopped,
    /// Gave up replicating. Reads still see the last applied state.
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ReplicaError {
    #[error("replica not started")]
    NotStarted,

    #[error("replica already started")]
    AlreadyStarted,

    #[error("replica stopped")]
    Stopped,

    #[error("replica failed: {reason}")]
    Failed { reason: String },

    #[error("replica task panicked: {details}")]
    Join { details: String },
}

type ReadFn = Box<dyn FnOnce(&Table) + Send>;

enum Command {
    Read(ReadFn),
    Listen(mpsc::UnboundedSender<Arc<TickEvent>>),
}

// ---------------------------------------------------------------------------
// Replica
// ---------------------------------------------------------------------------

pub struct Replica {
    world: Arc<dyn World>,
    config: ReplicaConfig,
    table: Option<Table>,
    commands: mpsc::UnboundedSender<Command>,
    command_rx: Option<mpsc::UnboundedReceiver<Command>>,
    state: Arc<watch::Sender<ReplicaState>>,
    cancel: CancelHandle,
    cancel_signal: CancelSignal,
    task: Option<JoinHandle<()>>,
}

impl Replica {
    /// A replica that will fill `table` (with whatever indices it carries)
    /// once started.
    pub fn new(world: Arc<dyn World>, table: Table, config: ReplicaConfig) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ReplicaState::Unstarted);
        let (cancel, cancel_signal) = cancel_pair();
        Self {
            world,
            config,
            table: Some(table),
            commands,
            command_rx: Some(command_rx),
            state: Arc::new(state),
            cancel,
            cancel_signal,
            task: None,
        }
    }

    /// Spawn the replication task and wait for the first bootstrap to
    /// complete.
    pub async fn start(&mut self) -> Result<(), ReplicaError> {
        let (Some(table), Some(commands)) = (self.table.take(), self.command_rx.take()) else {
            return Err(ReplicaError::AlreadyStarted);
        };
        self.state.send_replace(ReplicaState::Bootstrapping);
        let actor = Actor {
            world: Arc::clone(&self.world),
            config: self.config.clone(),
            table,
            commands,
            listeners: Vec::new(),
            state: Arc::clone(&self.state),
            cancel: self.cancel_signal.clone(),
            epoch: 0,
        };
        self.task = Some(tokio::spawn(actor.run()));

        let settled = self
            .wait_for_state(|s| !matches!(s, ReplicaState::Bootstrapping))
            .await;
        match settled {
            ReplicaState::Live => Ok(()),
            ReplicaState::Failed { reason } => Err(ReplicaError::Failed { reason }),
            _ => Err(ReplicaError::Stopped),
        }
    }

    pub fn state(&self) -> ReplicaState {
        self.state.borrow().clone()
    }

    /// Whether the replica is live and caught up with its subscription.
    pub fn healthy(&self) -> bool {
        matches!(*self.state.borrow(), ReplicaState::Live)
    }

    /// Wait until the state satisfies `predicate` and return it.
    pub async fn wait_for_state(&self, predicate: impl Fn(&ReplicaState) -> bool) -> ReplicaState {
        let mut rx = self.state.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let state = match rx.wait_for(|s| predicate(s)).await {
            Ok(state) => state.clone(),
            Err(_) => self.state(),
        };
        state
    }

    /// Run `f` against the table between two applied frames.
    pub async fn read<R, F>(&self, f: F) -> Result<R, ReplicaError>
    where
        R: Send + 'static,
        F: FnOnce(&Table) -> R + Send + 'static,
    {
        if matches!(*self.state.borrow(), ReplicaState::Unstarted) {
            return Err(ReplicaError::NotStarted);
        }
        let (tx, rx) = oneshot::channel();
        let command = Command::Read(Box::new(move |table| {
            let _ = tx.send(f(table));
        }));
        self.commands
            .send(command)
            .map_err(|_| ReplicaError::Stopped)?;
        rx.await.map_err(|_| ReplicaError::Stopped)
    }

    /// Receive every tick applied from now on. Listeners registered before
    /// [`start`](Self::start) see the initial bootstrap.
    pub fn listen(&self) -> mpsc::UnboundedReceiver<Arc<TickEvent>> {
        let (tx, rx) = mpsc::unbounded_channel();
        if self.commands.send(Command::Listen(tx)).is_err() {
            tracing::debug!("listen on a stopped replica");
        }
        rx
    }

    /// Cancel replication and wait for the task to finish. Idempotent.
    pub async fn stop(&mut self) -> Result<(), ReplicaError> {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            task.await.map_err(|e| ReplicaError::Join {
                details: e.to_string(),
            })?;
        }
        self.state.send_if_modified(|s| {
            if matches!(s, ReplicaState::Failed { .. } | ReplicaState::Stopped) {
                false
            } else {
                *s = ReplicaState::Stopped;
                true
            }
        });
        Ok(())
    }
}

impl Drop for Replica {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for Replica {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replica")
            .field("state", &*self.state.borrow())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

/// How one subscription session ended.
enum Session {
    Cancelled,
    /// Every `Replica` handle is gone.
    Orphaned,
    Lost(WorldError),
}

struct Actor {
    world: Arc<dyn World>,
    config: ReplicaConfig,
    table: Table,
    commands: mpsc::UnboundedReceiver<Command>,
    listeners: Vec<mpsc::UnboundedSender<Arc<TickEvent>>>,
    state: Arc<watch::Sender<ReplicaState>>,
    cancel: CancelSignal,
    epoch: u64,
}

impl Actor {
    async fn run(mut self) {
        // Listeners queued before start must see the first bootstrap.
        while let Ok(command) = self.commands.try_recv() {
            self.serve(command);
        }

        let mut backoff = Backoff::new(self.config.backoff.clone());
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            match self.session(&mut backoff).await {
                Session::Cancelled | Session::Orphaned => break,
                Session::Lost(err) if err.is_transient() => {
                    self.state.send_replace(ReplicaState::Bootstrapping);
                    let Some(delay) = backoff.next_delay() else {
                        let reason = format!("retry budget exhausted: {err}");
                        return self.fail(reason).await;
                    };
                    tracing::warn!(
                        error = %err,
                        attempt = backoff.attempt(),
                        delay_ms = delay.as_millis() as u64,
                        "subscription lost, resubscribing"
                    );
                    if !self.idle(delay).await {
                        break;
                    }
                }
                Session::Lost(err) => return self.fail(err.to_string()).await,
            }
        }
        self.state.send_replace(ReplicaState::Stopped);
        tracing::info!(epoch = self.epoch, "replica stopped");
    }

    async fn session(&mut self, backoff: &mut Backoff) -> Session {
        self.state.send_replace(ReplicaState::Bootstrapping);
        let subscribed = self
            .world
            .subscribe(self.config.subscription.clone(), self.cancel.clone())
            .await;
        let mut stream = match subscribed {
            Ok(stream) => stream,
            Err(e) => return Session::Lost(e),
        };
        self.epoch += 1;
        tracing::debug!(epoch = self.epoch, "subscribed");

        let mut bootstrapping = true;
        let mut seen: HashSet<EntityId> = HashSet::new();
        loop {
            tokio::select! {
                biased;
                command = self.commands.recv() => match command {
                    Some(command) => self.serve(command),
                    None => return Session::Orphaned,
                },
                _ = self.cancel.cancelled() => return Session::Cancelled,
                frame = stream.next() => match frame {
                    Some(Ok(update)) => {
                        if bootstrapping {
                            seen.extend(ids_of(&update.changes));
                        }
                        let mut changes = materialize_batch(&update.changes);
                        let completes_bootstrap = bootstrapping && update.bootstrapped;
                        if completes_bootstrap {
                            bootstrapping = false;
                            changes.extend(self.vanished(&seen));
                            seen.clear();
                            backoff.reset();
                        }
                        self.table.apply(&changes);
                        if completes_bootstrap {
                            // The stream never redelivers anything older
                            // than the bootstrap it just finished.
                            let through = self.table.max_version();
                            self.table.prune_tombstones(through);
                        }
                        self.emit(changes, completes_bootstrap);
                        if completes_bootstrap {
                            self.state.send_replace(ReplicaState::Live);
                            tracing::info!(
                                epoch = self.epoch,
                                entities = self.table.len(),
                                "replica live"
                            );
                        }
                    }
                    Some(Err(e)) => return Session::Lost(e),
                    None if self.cancel.is_cancelled() => return Session::Cancelled,
                    None => return Session::Lost(WorldError::unavailable("subscription closed")),
                },
            }
        }
    }

    /// Deletes for every local entity the latest bootstrap did not carry.
    fn vanished(&self, seen: &HashSet<EntityId>) -> Vec<Change> {
        let mut gone: Vec<EntityId> = self.table.ids().filter(|id| !seen.contains(id)).collect();
        gone.sort();
        if !gone.is_empty() {
            tracing::debug!(count = gone.len(), "removing entities absent from bootstrap");
        }
        gone.into_iter()
            .map(|id| Change::delete(self.table.version_of(id).unwrap_or(0), id))
            .collect()
    }

    fn emit(&mut self, changes: Vec<Change>, bootstrapped: bool) {
        if changes.is_empty() && !bootstrapped {
            return;
        }
        let event = Arc::new(TickEvent {
            changes,
            bootstrapped,
            epoch: self.epoch,
        });
        self.listeners.retain(|l| l.send(Arc::clone(&event)).is_ok());
    }

    fn serve(&mut self, command: Command) {
        match command {
            Command::Read(f) => f(&self.table),
            Command::Listen(tx) => self.listeners.push(tx),
        }
    }

    /// Keep serving commands for `delay`. Returns `false` if the actor
    /// should stop instead of resubscribing.
    async fn idle(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                biased;
                command = self.commands.recv() => match command {
                    Some(command) => self.serve(command),
                    None => return false,
                },
                _ = self.cancel.cancelled() => return false,
                _ = &mut sleep => return true,
            }
        }
    }

    async fn fail(mut self, reason: String) {
        match self.config.failure_policy {
            FailurePolicy::ExitProcess => {
                let code = self.config.effective_exit_code();
                tracing::error!(%reason, code, "replication failed, exiting");
                std::process::exit(code);
            }
            FailurePolicy::MarkStale => {
                tracing::error!(%reason, "replication failed, serving stale state");
                self.state.send_replace(ReplicaState::Failed { reason });
                loop {
                    tokio::select! {
                        biased;
                        command = self.commands.recv() => match command {
                            Some(command) => self.serve(command),
                            None => return,
                        },
                        _ = self.cancel.cancelled() => return,
                    }
                }
            }
        }
    }
}
