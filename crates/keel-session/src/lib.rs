//! Unit of work for Keel.
//!
//! `keel-session` is the **change-tracking layer**. It coordinates object
//! identity, change tracking, relationship loading and transactional
//! persistence against a [`Store`](keel_core::Store).
//!
//! # Role In The Architecture
//!
//! - **Schema registry**: one declarative descriptor per entity type.
//! - **Identity map**: a single in-memory instance per primary key.
//! - **Change tracking**: snapshots taken at load time, diffed at commit.
//! - **Relationship loading**: batched eager loads and explicit on-demand loads.
//! - **Transactional safety**: every commit is one store transaction; any
//!   failure restores the in-memory state the unit of work started from.
//!
//! # Example
//!
//! ```ignore
//! let mut registry = SchemaRegistry::new();
//! registry.register::<Dealer>()?;
//! registry.register::<Car>()?;
//! let registry = Arc::new(registry);
//!
//! let mut uow = UnitOfWork::new(store, Arc::clone(&registry));
//! uow.begin()?;
//! let dealer = uow.add(Dealer::new("BestCars", "New York"))?;
//! uow.commit().await?;
//!
//! let mut uow = UnitOfWork::new(uow.into_store(), registry);
//! let cars = uow.query::<Car>().include("dealer").all().await?;
//! ```

pub mod change_tracker;
pub mod flush;
pub mod identity_map;
pub mod loader;
pub mod query;
pub mod registry;
pub mod unit_of_work;

#[cfg(test)]
pub(crate) mod test_support;

pub use change_tracker::{ChangeSet, ChangeTracker, EntityChange, FieldChange, ObjectSnapshot};
pub use flush::{
    Dependency, FlushSummary, InsertOrder, ModifiedEntity, UpdatePlan, order_deletes,
    order_inserts, plan_updates,
};
pub use identity_map::{ErasedEntity, IdentityMap, erase};
pub use loader::{LoadContext, LoadNode, StagedLoad};
pub use query::Query;
pub use registry::{Materializer, SchemaRegistry};
pub use unit_of_work::{PendingCounts, UnitOfWork, UnitOfWorkConfig, UnitOfWorkState};

use keel_core::Value;
use serde::Serialize;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, RwLock};

/// Shared handle to a tracked entity.
///
/// Every navigation path reaching the same row yields a clone of the same
/// `Arc`, so a write through one handle is visible through all of them.
pub type EntityRef<E> = Arc<RwLock<E>>;

/// How an entity is identified inside one unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Identity {
    /// Primary key values are known (hashed).
    Stored(u64),
    /// Added entity whose key the store has not generated yet.
    Pending(u64),
}

/// Unique key for a tracked entity: table plus identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    table: &'static str,
    identity: Identity,
}

impl ObjectKey {
    /// Key for a row whose primary key values are known.
    pub fn stored(table: &'static str, pk_values: &[Value]) -> Self {
        Self {
            table,
            identity: Identity::Stored(hash_values(pk_values)),
        }
    }

    /// Provisional key for an Added entity awaiting a generated key.
    pub fn pending(table: &'static str, sequence: u64) -> Self {
        Self {
            table,
            identity: Identity::Pending(sequence),
        }
    }

    /// Key for `pk_values`, pending when any component is still NULL.
    pub fn for_values(table: &'static str, pk_values: &[Value], sequence: u64) -> Self {
        if pk_values.is_empty() || pk_values.iter().any(Value::is_null) {
            Self::pending(table, sequence)
        } else {
            Self::stored(table, pk_values)
        }
    }

    pub fn table(&self) -> &'static str {
        self.table
    }

    pub fn identity(&self) -> Identity {
        self.identity
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.identity, Identity::Pending(_))
    }
}

/// Hash primary key values; integer widths hash alike.
pub fn hash_values(values: &[Value]) -> u64 {
    let mut hasher = DefaultHasher::new();
    values.len().hash(&mut hasher);
    for v in values {
        v.hash_key(&mut hasher);
    }
    hasher.finish()
}

/// Lifecycle state of a tracked entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EntityState {
    /// No backing row yet.
    Added,
    /// Matches its snapshot.
    Unchanged,
    /// At least one field differs from its snapshot.
    Modified,
    /// Will be removed at commit.
    Deleted,
}
