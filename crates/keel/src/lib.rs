//! Keel - a unit-of-work persistence engine for Rust.
//!
//! Keel tracks changes to plain Rust structs and turns them into ordered,
//! transactional writes:
//!
//! - Declarative entity descriptors instead of runtime reflection
//! - One in-memory instance per row inside a unit of work
//! - Parent-before-child inserts with generated key propagation
//! - Batched eager loading, one lookup per relationship hop
//! - Idempotent schema creation and versioned migrations
//!
//! # Quick Start
//!
//! ```ignore
//! use keel::prelude::*;
//!
//! let mut registry = SchemaRegistry::new();
//! registry.register::<Dealer>()?;
//! registry.register::<Car>()?;
//! let registry = Arc::new(registry);
//!
//! let store = SqliteStore::open(&SqliteConfig::file("cars.db"))?;
//! MigrationRunner::default()
//!     .seed(&[Dealer::new("BestCars", "New York")])
//!     .ensure_schema(&store, &registry)
//!     .await?;
//!
//! let mut uow = UnitOfWork::new(store, Arc::clone(&registry));
//! let dealer = uow.find::<Dealer>(&[Value::BigInt(1)]).await?.unwrap();
//! let car = uow.add(Car::new("Toyota", "Camry", 2020))?;
//! uow.relate(&car, "dealer", &dealer)?;
//! uow.commit().await?;
//! ```
//!
//! # Crates
//!
//! - `keel-core`: values, rows, descriptors, errors and the [`Store`] trait
//! - `keel-session`: registry, identity map, change tracking, loading and
//!   the [`UnitOfWork`]
//! - `keel-schema`: DDL generation and the [`MigrationRunner`]
//! - `keel-sqlite`: the bundled SQLite [`Store`]

pub use keel_core::{
    ColumnInfo, ConnectionError, ConnectionErrorKind, Entity, EntityDescriptor, Error,
    FieldInfo, FieldValidationError, FromValue, LinkTableInfo, QueryError, QueryErrorKind,
    ReferentialAction, RelationshipInfo, RelationshipKind, Result, Row, SqlType, Store,
    TypeError, ValidationError, ValidationErrorKind, Value, placeholders, quote_ident,
};

pub use keel_session::{
    ChangeSet, EntityChange, EntityRef, EntityState, FieldChange, FlushSummary, PendingCounts,
    Query, SchemaRegistry, UnitOfWork, UnitOfWorkConfig, UnitOfWorkState,
};

pub use keel_schema::{
    CreateTable, DEFAULT_MARKER_TABLE, EnsureOutcome, Migration, MigrationRunner,
    MigrationStatus, create_all, create_table, drop_table,
};

pub use keel_sqlite::{OpenFlags, SqliteConfig, SqliteStore};

use std::sync::Arc;

/// Open a SQLite store and bring its schema up to date.
///
/// Convenience for the common startup sequence: open the store, run
/// `runner` against it and hand back the store ready for a first
/// [`UnitOfWork`].
pub async fn open_sqlite(
    config: &SqliteConfig,
    registry: &Arc<SchemaRegistry>,
    runner: &MigrationRunner,
) -> Result<(SqliteStore, EnsureOutcome)> {
    let store = SqliteStore::open(config)?;
    let outcome = runner.ensure_schema(&store, registry).await?;
    tracing::debug!(path = store.path(), ?outcome, "Store ready");
    Ok((store, outcome))
}

/// Commonly used items.
pub mod prelude {
    pub use crate::{
        Entity, EntityRef, Error, FieldInfo, LinkTableInfo, Migration, MigrationRunner,
        ReferentialAction, RelationshipInfo, Result, Row, SchemaRegistry, SqlType,
        SqliteConfig, SqliteStore, Store, UnitOfWork, UnitOfWorkConfig, Value, open_sqlite,
    };
    pub use std::sync::Arc;
}
