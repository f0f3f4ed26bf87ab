//! Schema migration support.
//!
//! A [`MigrationRunner`] brings a store's schema up to date in one of two
//! ways:
//!
//! - **Fresh store** (no marker table): every registered table is created in
//!   dependency order, seed rows are inserted, the marker table is created and
//!   every known migration is marked applied. All of it happens in one store
//!   transaction.
//! - **Existing store**: each migration missing from the marker table runs in
//!   version order, in its own store transaction together with its marker
//!   row. A failure stops the sequence; everything before it stays applied.
//!
//! Running the same runner twice is a no-op the second time.

use crate::create::CreateTable;
use keel_core::{Entity, Error, Result, Store, Value, placeholders, quote_ident};
use keel_session::SchemaRegistry;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::time::{SystemTime, UNIX_EPOCH};

/// Default name of the marker table.
pub const DEFAULT_MARKER_TABLE: &str = "__keel_migrations";

/// A versioned schema-change step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    /// Ordering key; also the marker table's primary key
    pub version: i64,
    /// Human-readable description
    pub description: String,
    /// Statements executed in order inside one transaction
    pub statements: Vec<String>,
}

impl Migration {
    /// Create a migration with no statements.
    pub fn new(version: i64, description: impl Into<String>) -> Self {
        Self {
            version,
            description: description.into(),
            statements: Vec::new(),
        }
    }

    /// Append a statement.
    #[must_use]
    pub fn statement(mut self, sql: impl Into<String>) -> Self {
        self.statements.push(sql.into());
        self
    }
}

/// Status of a migration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MigrationStatus {
    /// Migration has not been applied
    Pending,
    /// Migration has been applied (unix seconds)
    Applied { at: i64 },
}

/// What [`MigrationRunner::ensure_schema`] did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum EnsureOutcome {
    /// The schema was created from scratch.
    Created { tables: usize, seed_rows: usize },
    /// Pending migrations were applied; empty when already up to date.
    Migrated { applied: Vec<i64> },
}

#[derive(Debug, Clone)]
struct SeedRow {
    table: &'static str,
    values: Vec<(&'static str, Value)>,
}

/// Migration runner for creating and upgrading a schema.
#[derive(Debug, Clone)]
pub struct MigrationRunner {
    /// The migrations to manage, kept sorted by version
    migrations: Vec<Migration>,
    /// Name of the marker table
    table_name: String,
    seed: Vec<SeedRow>,
}

impl Default for MigrationRunner {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl MigrationRunner {
    /// Create a new migration runner with the given migrations.
    pub fn new(mut migrations: Vec<Migration>) -> Self {
        migrations.sort_by_key(|m| m.version);
        Self {
            migrations,
            table_name: DEFAULT_MARKER_TABLE.to_string(),
            seed: Vec::new(),
        }
    }

    /// Add one migration.
    #[must_use]
    pub fn migration(mut self, migration: Migration) -> Self {
        self.migrations.push(migration);
        self.migrations.sort_by_key(|m| m.version);
        self
    }

    /// Set a custom marker table name.
    #[must_use]
    pub fn table_name(mut self, name: impl Into<String>) -> Self {
        self.table_name = name.into();
        self
    }

    /// Rows inserted when the schema is first created.
    ///
    /// Seed rows are never inserted into an existing schema.
    #[must_use]
    pub fn seed<E: Entity>(mut self, entities: &[E]) -> Self {
        self.seed.extend(entities.iter().map(|e| SeedRow {
            table: E::TABLE_NAME,
            values: e.to_row(),
        }));
        self
    }

    pub fn migrations(&self) -> &[Migration] {
        &self.migrations
    }

    pub fn marker_table(&self) -> &str {
        &self.table_name
    }

    fn marker_ddl(&self) -> String {
        format!(
            "CREATE TABLE {} (\n  \"version\" INTEGER PRIMARY KEY,\n  \"applied_at\" TIMESTAMP NOT NULL\n)",
            quote_ident(&self.table_name)
        )
    }

    fn marker_insert(&self) -> String {
        format!(
            "INSERT INTO {} (\"version\", \"applied_at\") VALUES ($1, $2)",
            quote_ident(&self.table_name)
        )
    }

    fn check_versions(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for m in &self.migrations {
            if !seen.insert(m.version) {
                return Err(Error::schema_conflict(
                    &self.table_name,
                    format!("migration version {} declared twice", m.version),
                ));
            }
        }
        Ok(())
    }

    /// Applied versions with their timestamps, or `None` without a marker table.
    async fn applied<S: Store>(&self, store: &S) -> Result<Option<BTreeMap<i64, i64>>> {
        if !store.table_exists(&self.table_name).await? {
            return Ok(None);
        }

        let sql = format!(
            "SELECT \"version\", \"applied_at\" FROM {} ORDER BY \"version\"",
            quote_ident(&self.table_name)
        );
        let rows = store.query(&sql, &[]).await?;

        let mut applied = BTreeMap::new();
        for row in rows {
            let version: i64 = row.get_named("version")?;
            let at: i64 = row.get_named("applied_at")?;
            applied.insert(version, at);
        }
        Ok(Some(applied))
    }

    /// Get the status of all migrations.
    pub async fn status<S: Store>(&self, store: &S) -> Result<Vec<(i64, MigrationStatus)>> {
        let applied = self.applied(store).await?.unwrap_or_default();

        Ok(self
            .migrations
            .iter()
            .map(|m| {
                let status = match applied.get(&m.version) {
                    Some(&at) => MigrationStatus::Applied { at },
                    None => MigrationStatus::Pending,
                };
                (m.version, status)
            })
            .collect())
    }

    /// Create the schema, or apply pending migrations to an existing one.
    #[tracing::instrument(level = "info", skip_all, fields(marker = %self.table_name))]
    pub async fn ensure_schema<S: Store>(
        &self,
        store: &S,
        registry: &SchemaRegistry,
    ) -> Result<EnsureOutcome> {
        self.check_versions()?;

        match self.applied(store).await? {
            None => self.create_schema(store, registry).await,
            Some(applied) => self.apply_pending(store, &applied).await,
        }
    }

    async fn create_schema<S: Store>(
        &self,
        store: &S,
        registry: &SchemaRegistry,
    ) -> Result<EnsureOutcome> {
        let order = registry.creation_order();
        let position = |table: &str| order.iter().position(|d| d.table == table);

        let mut seed: Vec<&SeedRow> = Vec::with_capacity(self.seed.len());
        for row in &self.seed {
            if position(row.table).is_none() {
                return Err(Error::UnknownEntity(row.table.to_string()));
            }
            seed.push(row);
        }
        seed.sort_by_key(|row| position(row.table));

        tracing::info!(
            tables = order.len(),
            seed_rows = seed.len(),
            migrations = self.migrations.len(),
            "Creating schema"
        );

        store.begin_transaction().await?;
        let result = async {
            for descriptor in &order {
                store
                    .execute(&CreateTable::new(**descriptor).build(), &[])
                    .await?;
            }

            for row in &seed {
                let values: Vec<&(&'static str, Value)> = row
                    .values
                    .iter()
                    .filter(|(column, value)| {
                        !(value.is_null() && is_generated(registry, row.table, column))
                    })
                    .collect();
                let columns: Vec<String> = values.iter().map(|(c, _)| quote_ident(c)).collect();
                let params: Vec<Value> = values.iter().map(|(_, v)| v.clone()).collect();
                let sql = format!(
                    "INSERT INTO {} ({}) VALUES ({})",
                    quote_ident(row.table),
                    columns.join(", "),
                    placeholders(1, params.len())
                );
                store.execute(&sql, &params).await?;
            }

            store.execute(&self.marker_ddl(), &[]).await?;
            let now = unix_now();
            let insert = self.marker_insert();
            for m in &self.migrations {
                store
                    .execute(&insert, &[Value::BigInt(m.version), Value::BigInt(now)])
                    .await?;
            }
            store.commit().await
        }
        .await;

        match result {
            Ok(()) => Ok(EnsureOutcome::Created {
                tables: order.len(),
                seed_rows: seed.len(),
            }),
            Err(e) => {
                tracing::warn!(error = %e, "Schema creation failed, rolling back");
                rollback_quietly(store).await;
                Err(e)
            }
        }
    }

    async fn apply_pending<S: Store>(
        &self,
        store: &S,
        applied: &BTreeMap<i64, i64>,
    ) -> Result<EnsureOutcome> {
        let mut last_applied = applied.keys().next_back().copied();
        let mut newly_applied = Vec::new();

        for m in self.migrations.iter().filter(|m| !applied.contains_key(&m.version)) {
            tracing::info!(version = m.version, description = %m.description, "Applying migration");

            if let Err(e) = self.apply_one(store, m).await {
                tracing::warn!(version = m.version, error = %e, "Migration failed");
                rollback_quietly(store).await;
                return Err(Error::MigrationFailed {
                    version: m.version,
                    last_applied,
                    source: Box::new(e),
                });
            }

            last_applied = Some(last_applied.map_or(m.version, |v| v.max(m.version)));
            newly_applied.push(m.version);
        }

        if newly_applied.is_empty() {
            tracing::debug!("Schema up to date");
        }
        Ok(EnsureOutcome::Migrated {
            applied: newly_applied,
        })
    }

    async fn apply_one<S: Store>(&self, store: &S, migration: &Migration) -> Result<()> {
        store.begin_transaction().await?;
        for sql in &migration.statements {
            store.execute(sql, &[]).await?;
        }
        store
            .execute(
                &self.marker_insert(),
                &[Value::BigInt(migration.version), Value::BigInt(unix_now())],
            )
            .await?;
        store.commit().await
    }
}

fn is_generated(registry: &SchemaRegistry, table: &str, column: &str) -> bool {
    registry
        .get(table)
        .ok()
        .and_then(|reg| reg.descriptor.generated_key())
        .is_some_and(|f| f.name == column)
}

async fn rollback_quietly<S: Store>(store: &S) {
    if let Err(e) = store.rollback().await {
        tracing::debug!(error = %e, "Rollback after failure also failed");
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
}
