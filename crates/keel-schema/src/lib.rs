//! Schema creation and migration support for Keel.
//!
//! This crate provides:
//! - CREATE TABLE generation from registered entity descriptors
//! - Whole-registry table creation in foreign key order
//! - Versioned migrations tracked in a marker table, with seed data for
//!   freshly created schemas

pub mod create;
pub mod migrate;

#[cfg(test)]
pub(crate) mod test_entities;

pub use create::{CreateTable, drop_table_sql};
pub use migrate::{
    DEFAULT_MARKER_TABLE, EnsureOutcome, Migration, MigrationRunner, MigrationStatus,
};

use keel_core::{Entity, Result, Store};
use keel_session::SchemaRegistry;

/// CREATE TABLE builder for an entity type.
///
/// # Example
///
/// ```ignore
/// let sql = create_table::<Car>().if_not_exists().build();
/// store.execute(&sql, &[]).await?;
/// ```
pub fn create_table<E: Entity>() -> CreateTable {
    CreateTable::of::<E>()
}

/// Statements creating every registered table, referenced tables first.
pub fn create_all_sql(registry: &SchemaRegistry, if_not_exists: bool) -> Vec<String> {
    registry
        .creation_order()
        .into_iter()
        .map(|d| {
            let builder = CreateTable::new(*d);
            if if_not_exists {
                builder.if_not_exists().build()
            } else {
                builder.build()
            }
        })
        .collect()
}

/// Create every registered table that does not exist yet.
///
/// Unlike [`MigrationRunner::ensure_schema`] this records nothing in a
/// marker table and runs outside a transaction.
pub async fn create_all<S: Store>(store: &S, registry: &SchemaRegistry) -> Result<()> {
    for sql in create_all_sql(registry, true) {
        store.execute(&sql, &[]).await?;
    }
    tracing::debug!(tables = registry.len(), "Created tables");
    Ok(())
}

/// Drop a table.
pub async fn drop_table<S: Store>(store: &S, table: &str, if_exists: bool) -> Result<()> {
    store
        .execute(&drop_table_sql(table, if_exists), &[])
        .await
        .map(|_| ())
}
