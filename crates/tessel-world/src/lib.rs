//! Tessel World -- asynchronous replication of a canonical entity store.
//!
//! A single canonical store (anything implementing [`World`](world::World))
//! is mutated through conditional transactions and streams its committed
//! changes to any number of readers. Each reader folds that stream into a
//! private [`Table`](tessel_ecs::table::Table):
//!
//! - [`Replica`](replica::Replica) owns a table inside a background task and
//!   keeps it current across disconnects, re-bootstrapping on every
//!   resubscription.
//! - [`EventBatcher`](batcher::EventBatcher) buffers caller-submitted
//!   mutations, submits them as transactions, and maps per-transaction
//!   aborts back to the individual caller.
//! - [`SideEffectProcessor`](sidefx::SideEffectProcessor) derives new
//!   transactions from an observed change stream.
//! - [`Notifier`](notify::Notifier) is a small key/latest-value broadcast
//!   primitive, independent of the entity stream.
//!
//! [`InMemoryWorld`](memory::InMemoryWorld) is a complete in-process store
//! used by tests and single-process deployments.

#![deny(unsafe_code)]

pub use tessel_ecs as ecs;

pub mod backoff;
pub mod batcher;
pub mod cancel;
pub mod config;
pub mod memory;
pub mod notify;
pub mod replica;
pub mod sidefx;
pub mod telemetry;
pub mod world;

use tessel_ecs::EcsError;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors surfaced by a [`World`](world::World) and the loops that drive one.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum WorldError {
    /// Transient connectivity loss. Retried with backoff.
    #[error("canonical store unavailable: {reason}")]
    Unavailable { reason: String },

    /// The subscription itself broke in a way retrying will not fix.
    #[error("replication failure: {reason}")]
    ReplicationFailure { reason: String },

    /// A configuration document could not be parsed.
    #[error("invalid configuration: {details}")]
    Config { details: String },

    #[error(transparent)]
    Ecs(#[from] EcsError),
}

impl WorldError {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable {
            reason: reason.into(),
        }
    }

    /// Whether a retry could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use crate::backoff::{Backoff, BackoffConfig};
    pub use crate::batcher::{
        BatchError, BatchEvent, DrainReport, EventBatcher, EventTicket, FlushError, FlushReport,
    };
    pub use crate::cancel::{cancel_pair, CancelHandle, CancelSignal};
    pub use crate::config::{BatcherConfig, FailurePolicy, NotifierConfig, ProcessorConfig, ReplicaConfig};
    pub use crate::memory::InMemoryWorld;
    pub use crate::notify::{InMemoryNotifyBackend, ListenerHandle, NotifyBackend, NotifyError, Notifier};
    pub use crate::replica::{Replica, ReplicaError, ReplicaState, TickEvent};
    pub use crate::sidefx::{ChangeSet, DeletesWithEffect, DerivedTransaction, SideEffect, SideEffectProcessor, TickReport};
    pub use crate::world::{EntityFilter, SubscriptionConfig, UpdateStream, World, WorldFrame, WorldUpdate};
    pub use crate::WorldError;
    pub use tessel_ecs::prelude::*;
}
