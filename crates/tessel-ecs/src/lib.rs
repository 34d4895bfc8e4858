//! Tessel ECS -- the synchronous data layer of the Tessel world-replication
//! protocol.
//!
//! Entities are sparse bags of named, opaque JSON components keyed by a
//! process-wide unique [`EntityId`](entity::EntityId). Every mutation travels
//! as a versioned [`Change`](change::Change); writers submit
//! [`Transaction`](transaction::Transaction)s of proposed changes guarded by
//! iffs, and readers fold the committed change stream into a local
//! [`Table`](table::Table) that keeps its secondary indices in lock-step with
//! the base mapping.
//!
//! Nothing in this crate performs I/O or spawns tasks. The asynchronous
//! replication machinery lives in `tessel-world`.
//!
//! # Quick Start
//!
//! ```
//! use tessel_ecs::prelude::*;
//!
//! let mut table = Table::builder()
//!     .index("alive", PresenceIndex::new(ComponentMatcher::new(["hp"])))
//!     .build()
//!     .unwrap();
//!
//! let id = EntityId::new(7).unwrap();
//! let entity = Entity::new(id).with("hp", serde_json::json!(10));
//! assert!(table.apply(&[Change::create(3, entity)]));
//!
//! let alive = table.index::<PresenceIndex>("alive").unwrap();
//! assert!(alive.contains(id));
//! assert_eq!(table.version_of(id), Some(3));
//! ```

#![deny(unsafe_code)]

pub mod change;
pub mod component;
pub mod entity;
pub mod index;
pub mod lazy;
pub mod overlay;
pub mod table;
pub mod transaction;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced by the data layer.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EcsError {
    /// Entity ids are non-zero; zero is reserved as "no entity".
    #[error("invalid entity id {raw}: ids must be non-zero")]
    InvalidEntityId { raw: u64 },

    /// A wire payload could not be decoded into a component value.
    #[error("protocol fault on entity {entity}{}: {details}", component_suffix(.component))]
    ProtocolFault {
        entity: entity::EntityId,
        component: Option<String>,
        details: String,
    },

    /// A second index was registered under a name already in use.
    #[error("index '{name}' is already registered on this table")]
    DuplicateIndex { name: String },

    /// A value could not be serialized.
    #[error("serialization failed: {details}")]
    Serialization { details: String },
}

fn component_suffix(component: &Option<String>) -> String {
    match component {
        Some(name) => format!(" (component '{name}')"),
        None => String::new(),
    }
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use crate::change::{Change, ChangeKind, ProposedChange};
    pub use crate::component::{ComponentMatcher, ComponentSet};
    pub use crate::entity::{Components, Entity, EntityDelta, EntityId};
    pub use crate::index::key::KeyIndex;
    pub use crate::index::presence::PresenceIndex;
    pub use crate::index::spatial::{Aabb, Shape, SpatialIndex, SpatialIndexConfig};
    pub use crate::index::SecondaryIndex;
    pub use crate::lazy::{
        materialize_batch, EncodedChange, LazyChange, LazyChangeBuffer, LazyDelta, LazyEntity,
    };
    pub use crate::overlay::SpeculativeOverlay;
    pub use crate::table::{Table, TableBuilder};
    pub use crate::transaction::{ApplyOutcome, ApplyResult, Iff, Transaction, TransactionOutcome};
    pub use crate::EcsError;
}
