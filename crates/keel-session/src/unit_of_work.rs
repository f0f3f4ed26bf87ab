//! The unit of work: a bounded scope of tracked changes.
//!
//! A unit of work owns one [`Store`] and moves through
//! `Idle -> Open -> Flushing -> Committed | RolledBack`. While open it
//! tracks every entity it loads or is given, and [`commit`](UnitOfWork::commit)
//! writes all pending changes inside a single store transaction.
//!
//! If anything fails while flushing, the store transaction is rolled back
//! and every tracked entity is restored to the state it had before the unit
//! of work began, so the caller can retry from the same in-memory state.
//!
//! # Example
//!
//! ```ignore
//! let mut uow = UnitOfWork::new(store, registry);
//! let dealer = uow.add(Dealer::new("BestCars", "New York"))?;
//! let car = uow.add(Car::new("Toyota", "Camry", 2020))?;
//! uow.relate(&car, "dealer", &dealer)?;
//! let summary = uow.commit().await?;
//! assert_eq!(summary.inserted, 2);
//! ```

use crate::change_tracker::{ChangeSet, ChangeTracker, EntityChange, FieldChange};
use crate::flush::{
    Dependency, FlushSummary, ModifiedEntity, PendingOp, order_deletes, order_inserts,
    plan_updates,
};
use crate::identity_map::{ErasedEntity, IdentityMap};
use crate::loader::{LoadContext, LoadNode, Navigations, StagedLoad, column_list};
use crate::query::Query;
use crate::registry::SchemaRegistry;
use crate::{EntityRef, EntityState, ObjectKey, hash_values};
use keel_core::{
    Entity, EntityDescriptor, Error, RelationshipKind, Result, Store, Value, quote_ident,
};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};

/// Lifecycle of a unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnitOfWorkState {
    Idle,
    Open,
    /// A commit is writing to the store.
    Flushing,
    Committed,
    RolledBack,
}

impl UnitOfWorkState {
    pub const fn as_str(&self) -> &'static str {
        match self {
            UnitOfWorkState::Idle => "idle",
            UnitOfWorkState::Open => "open",
            UnitOfWorkState::Flushing => "flushing",
            UnitOfWorkState::Committed => "committed",
            UnitOfWorkState::RolledBack => "rolled back",
        }
    }

    /// Committed or rolled back; the unit of work accepts no more work.
    pub const fn is_completed(&self) -> bool {
        matches!(self, UnitOfWorkState::Committed | UnitOfWorkState::RolledBack)
    }
}

/// Configuration for a [`UnitOfWork`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitOfWorkConfig {
    /// Open an idle unit of work on its first operation.
    pub auto_begin: bool,
    /// Check field constraints of Added and Modified entities before flushing.
    pub validate: bool,
}

impl Default for UnitOfWorkConfig {
    fn default() -> Self {
        Self {
            auto_begin: true,
            validate: true,
        }
    }
}

impl UnitOfWorkConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn auto_begin(mut self, value: bool) -> Self {
        self.auto_begin = value;
        self
    }

    #[must_use]
    pub fn validate(mut self, value: bool) -> Self {
        self.validate = value;
        self
    }
}

/// Count of pending changes by kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingCounts {
    pub added: usize,
    pub modified: usize,
    pub deleted: usize,
}

impl PendingCounts {
    #[must_use]
    pub fn total(&self) -> usize {
        self.added + self.modified + self.deleted
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

/// A foreign key waiting for its parent's generated key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PendingLink {
    child: ObjectKey,
    column: &'static str,
    /// Column of the parent whose value is copied into `column`.
    source: &'static str,
    parent: ObjectKey,
}

/// Tracks entities and writes their changes atomically.
pub struct UnitOfWork<S: Store> {
    pub(crate) store: S,
    pub(crate) registry: Arc<SchemaRegistry>,
    config: UnitOfWorkConfig,
    state: UnitOfWorkState,
    pub(crate) map: IdentityMap,
    pub(crate) tracker: ChangeTracker,
    pub(crate) navigations: Navigations,
    links: Vec<PendingLink>,
    next_pending: u64,
    store_transaction: bool,
}

impl<S: Store> std::fmt::Debug for UnitOfWork<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("state", &self.state)
            .field("tracked", &self.tracker.len())
            .field("links", &self.links.len())
            .finish_non_exhaustive()
    }
}

fn read<E>(entity: &RwLock<E>) -> std::sync::RwLockReadGuard<'_, E> {
    entity.read().unwrap_or_else(PoisonError::into_inner)
}

fn value_of(row: &[(&'static str, Value)], column: &str) -> Value {
    row.iter()
        .find(|(name, _)| *name == column)
        .map_or(Value::Null, |(_, v)| v.clone())
}

impl<S: Store> UnitOfWork<S> {
    pub fn new(store: S, registry: Arc<SchemaRegistry>) -> Self {
        Self::with_config(store, registry, UnitOfWorkConfig::default())
    }

    pub fn with_config(store: S, registry: Arc<SchemaRegistry>, config: UnitOfWorkConfig) -> Self {
        Self {
            store,
            registry,
            config,
            state: UnitOfWorkState::Idle,
            map: IdentityMap::new(),
            tracker: ChangeTracker::new(),
            navigations: Navigations::new(),
            links: Vec::new(),
            next_pending: 0,
            store_transaction: false,
        }
    }

    pub fn state(&self) -> UnitOfWorkState {
        self.state
    }

    pub fn config(&self) -> &UnitOfWorkConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Give the store back, e.g. to start the next unit of work on it.
    pub fn into_store(self) -> S {
        self.store
    }

    /// Number of tracked entities.
    pub fn tracked_count(&self) -> usize {
        self.tracker.len()
    }

    /// Open the unit of work.
    pub fn begin(&mut self) -> Result<()> {
        match self.state {
            UnitOfWorkState::Idle => {
                self.state = UnitOfWorkState::Open;
                tracing::debug!("Unit of work opened");
                Ok(())
            }
            UnitOfWorkState::Open => Err(Error::TransactionAlreadyOpen),
            other => Err(Error::UnitOfWorkClosed {
                state: other.as_str(),
            }),
        }
    }

    pub(crate) fn ensure_open(&mut self) -> Result<()> {
        match self.state {
            UnitOfWorkState::Open => Ok(()),
            UnitOfWorkState::Idle if self.config.auto_begin => self.begin(),
            UnitOfWorkState::Idle => Err(Error::NotInTransaction),
            other => Err(Error::UnitOfWorkClosed {
                state: other.as_str(),
            }),
        }
    }

    fn tracked_key<E: Entity>(&self, entity: &EntityRef<E>, operation: &str) -> Result<ObjectKey> {
        self.map
            .key_of(entity)
            .filter(|k| self.tracker.is_tracked(k))
            .ok_or_else(|| Error::DetachedEntity {
                entity: E::TABLE_NAME.to_string(),
                operation: operation.to_string(),
            })
    }

    fn slot(&self, key: &ObjectKey) -> Result<Arc<dyn ErasedEntity>> {
        self.map
            .get_erased(key)
            .cloned()
            .ok_or_else(|| Error::Custom(format!("'{}' entry missing from identity map", key.table())))
    }

    fn descriptor_of(&self, table: &str) -> Result<EntityDescriptor> {
        Ok(self.registry.get(table)?.descriptor)
    }

    /// Start tracking a new entity; it is inserted at commit.
    #[tracing::instrument(level = "debug", skip(self, entity), fields(table = E::TABLE_NAME))]
    pub fn add<E: Entity>(&mut self, entity: E) -> Result<EntityRef<E>> {
        self.ensure_open()?;
        self.registry.descriptor::<E>()?;

        let handle = Arc::new(RwLock::new(entity));
        let key = ObjectKey::pending(E::TABLE_NAME, self.next_pending);
        self.next_pending += 1;
        let image = read(&handle).to_row();
        self.map.insert(key, &handle);
        self.tracker.mark_added(key, image);
        Ok(handle)
    }

    /// Mark an entity for physical deletion at commit.
    ///
    /// Deleting an entity that was added in this unit of work simply stops
    /// tracking it.
    pub fn delete<E: Entity>(&mut self, entity: &EntityRef<E>) -> Result<()> {
        self.ensure_open()?;
        let key = self.tracked_key(entity, "delete")?;
        if self.tracker.is_added(&key) {
            tracing::debug!(table = E::TABLE_NAME, "Discarding added entity");
            self.map.forget(&key);
            self.tracker.forget(&key);
            self.links.retain(|l| l.child != key && l.parent != key);
            self.drop_navigations(&key);
        } else {
            self.tracker.mark_deleted(&key);
        }
        Ok(())
    }

    /// Set the entity's soft-delete flag. This is an ordinary modification.
    pub fn soft_delete<E: Entity>(&mut self, entity: &EntityRef<E>) -> Result<()> {
        self.ensure_open()?;
        let key = self.tracked_key(entity, "soft-delete")?;
        let descriptor = self.registry.descriptor::<E>()?;
        let flag = descriptor
            .soft_delete
            .ok_or_else(|| Error::schema_conflict(E::TABLE_NAME, "no soft-delete flag declared"))?;
        self.slot(&key)?.apply(&[(flag, Value::Bool(true))])
    }

    /// Point `child`'s many-to-one relationship `relationship` at `parent`.
    ///
    /// If the parent's key is not known yet, the foreign key is filled in at
    /// commit right after the parent is inserted.
    pub fn relate<C: Entity, P: Entity>(
        &mut self,
        child: &EntityRef<C>,
        relationship: &str,
        parent: &EntityRef<P>,
    ) -> Result<()> {
        self.ensure_open()?;
        let rel = self.registry.relationship(C::TABLE_NAME, relationship)?;
        if rel.kind != RelationshipKind::ManyToOne || rel.related_table != P::TABLE_NAME {
            return Err(Error::schema_conflict(
                C::TABLE_NAME,
                format!(
                    "'{}' is not a many-to-one relationship to '{}'",
                    relationship,
                    P::TABLE_NAME
                ),
            ));
        }
        let column = rel.local_key.unwrap_or_default();
        let child_key = self.tracked_key(child, "relate")?;
        let parent_key = self.tracked_key(parent, "relate")?;

        let child_desc = self.descriptor_of(C::TABLE_NAME)?;
        let parent_desc = self.descriptor_of(P::TABLE_NAME)?;
        let source = child_desc
            .field(column)
            .and_then(|f| f.references())
            .map(|(_, c)| c)
            .or_else(|| parent_desc.primary_key.first().copied())
            .unwrap_or("id");

        self.links
            .retain(|l| !(l.child == child_key && l.column == column));
        if parent_key.is_pending() {
            self.links.push(PendingLink {
                child: child_key,
                column,
                source,
                parent: parent_key,
            });
        } else {
            let value = value_of(&self.slot(&parent_key)?.row(), source);
            self.slot(&child_key)?.apply(&[(column, value)])?;
        }
        self.navigations
            .insert((child_key, rel.name), vec![parent_key]);
        tracing::trace!(
            child = C::TABLE_NAME,
            parent = P::TABLE_NAME,
            column,
            pending = parent_key.is_pending(),
            "Related entities"
        );
        Ok(())
    }

    /// Current state of `entity`, or `None` if it is not tracked.
    pub fn state_of<E: Entity>(&self, entity: &EntityRef<E>) -> Option<EntityState> {
        let key = self.map.key_of(entity)?;
        self.tracker.state(&key, &read(entity).to_row())
    }

    pub fn is_tracked<E: Entity>(&self, entity: &EntityRef<E>) -> bool {
        self.map
            .key_of(entity)
            .is_some_and(|k| self.tracker.is_tracked(&k))
    }

    /// Fields of `entity` that differ from its snapshot.
    pub fn diff<E: Entity>(&self, entity: &EntityRef<E>) -> Vec<FieldChange> {
        match self.map.key_of(entity) {
            Some(key) => self.tracker.diff(&key, &read(entity).to_row()),
            None => Vec::new(),
        }
    }

    fn classify(&self) -> Vec<(ObjectKey, EntityState, Vec<(&'static str, Value)>)> {
        self.tracker
            .keys_in_order()
            .into_iter()
            .filter_map(|key| {
                let row = self.map.get_erased(&key)?.row();
                let state = self.tracker.state(&key, &row)?;
                Some((key, state, row))
            })
            .collect()
    }

    /// How many entities would be inserted, updated and deleted by a commit.
    pub fn pending(&self) -> PendingCounts {
        let mut counts = PendingCounts::default();
        for (_, state, _) in self.classify() {
            match state {
                EntityState::Added => counts.added += 1,
                EntityState::Modified => counts.modified += 1,
                EntityState::Deleted => counts.deleted += 1,
                EntityState::Unchanged => {}
            }
        }
        counts
    }

    /// Every pending change, in tracking order.
    pub fn changes(&self) -> ChangeSet {
        let entities = self
            .classify()
            .into_iter()
            .filter(|(_, state, _)| *state != EntityState::Unchanged)
            .map(|(key, state, row)| {
                let pk = self
                    .map
                    .get_erased(&key)
                    .map(|slot| slot.primary_key())
                    .unwrap_or_default();
                let fields = match state {
                    EntityState::Deleted => Vec::new(),
                    _ => self.tracker.diff(&key, &row),
                };
                EntityChange {
                    table: key.table(),
                    key: pk,
                    state,
                    fields,
                }
            })
            .collect();
        ChangeSet { entities }
    }

    /// Look up an entity by primary key, reading the store only if it is
    /// not already tracked.
    #[tracing::instrument(level = "debug", skip(self, pk), fields(table = E::TABLE_NAME))]
    pub async fn find<E: Entity>(&mut self, pk: &[Value]) -> Result<Option<EntityRef<E>>> {
        self.ensure_open()?;
        let descriptor = *self.registry.descriptor::<E>()?;
        if pk.len() != descriptor.primary_key.len() || pk.iter().any(Value::is_null) {
            return Err(Error::Custom(format!(
                "'{}' is keyed by {} column(s), got {} usable value(s)",
                E::TABLE_NAME,
                descriptor.primary_key.len(),
                pk.iter().filter(|v| !v.is_null()).count()
            )));
        }

        let key = ObjectKey::stored(E::TABLE_NAME, pk);
        if self.map.contains(&key) {
            tracing::trace!("Identity map hit");
            if self.tracker.is_deleted(&key) {
                return Ok(None);
            }
            return Ok(self.map.get::<E>(&key));
        }

        let filter = descriptor
            .primary_key
            .iter()
            .enumerate()
            .map(|(i, col)| format!("{} = ${}", quote_ident(col), i + 1))
            .collect::<Vec<_>>()
            .join(" AND ");
        let sql = format!(
            "SELECT {} FROM {} WHERE {}",
            column_list(&descriptor, None),
            quote_ident(E::TABLE_NAME),
            filter
        );

        let staged = {
            let ctx = LoadContext::new(&self.registry, &self.map);
            let rows = self.store.query(&sql, pk).await?;
            let mut staged = StagedLoad::default();
            LoadContext::count_query(&mut staged);
            let roots = ctx.stage_rows(E::TABLE_NAME, &rows, &mut staged)?;
            LoadContext::set_roots(&mut staged, &roots);
            staged
        };
        let roots = staged.apply(&mut self.map, &mut self.tracker, &mut self.navigations);
        Ok(roots.first().and_then(|k| self.map.get::<E>(k)))
    }

    /// Start a query over `E`.
    pub fn query<E: Entity>(&mut self) -> Query<'_, S, E> {
        Query::new(self)
    }

    fn load_nodes<E: Entity>(&self, roots: &[EntityRef<E>], operation: &str) -> Result<Vec<LoadNode>> {
        roots
            .iter()
            .map(|root| {
                let key = self.tracked_key(root, operation)?;
                Ok(LoadNode::new(key, self.slot(&key)?.row()))
            })
            .collect()
    }

    /// Load `path` for every root with one lookup per relationship hop.
    ///
    /// `path` may be dotted (`"dealer.cars"`). Nothing is registered unless
    /// every lookup succeeds.
    #[tracing::instrument(level = "debug", skip(self, roots), fields(table = E::TABLE_NAME, roots = roots.len()))]
    pub async fn load_eager<E: Entity>(&mut self, roots: &[EntityRef<E>], path: &str) -> Result<usize> {
        self.ensure_open()?;
        let nodes = self.load_nodes(roots, &format!("load '{}' of", path))?;
        let staged = LoadContext::new(&self.registry, &self.map)
            .fetch_all(&self.store, E::TABLE_NAME, nodes, &[path])
            .await?;
        let queries = staged.queries();
        staged.apply(&mut self.map, &mut self.tracker, &mut self.navigations);
        Ok(queries)
    }

    /// Resolve one navigation of `entity`, reading the store only if it has
    /// not been loaded yet.
    ///
    /// Fails with [`Error::DetachedEntity`] if the unit of work is no longer
    /// open or does not track `entity`.
    pub async fn load_on_demand<E: Entity, C: Entity>(
        &mut self,
        entity: &EntityRef<E>,
        relationship: &str,
    ) -> Result<Vec<EntityRef<C>>> {
        let operation = format!("load '{}' of", relationship);
        if self.state.is_completed() || self.state == UnitOfWorkState::Flushing {
            return Err(Error::DetachedEntity {
                entity: E::TABLE_NAME.to_string(),
                operation,
            });
        }
        self.ensure_open()?;
        let key = self.tracked_key(entity, &operation)?;
        let rel = self.typed_relationship::<E, C>(relationship)?;

        if !self.navigations.contains_key(&(key, rel)) {
            self.load_eager(std::slice::from_ref(entity), relationship)
                .await?;
        }
        Ok(self.resolve_navigation::<C>(key, rel).unwrap_or_default())
    }

    /// A navigation loaded earlier, without any I/O. `None` if it was never
    /// loaded.
    pub fn related<E: Entity, C: Entity>(
        &self,
        entity: &EntityRef<E>,
        relationship: &str,
    ) -> Result<Option<Vec<EntityRef<C>>>> {
        let key = self.tracked_key(entity, &format!("read '{}' of", relationship))?;
        let rel = self.typed_relationship::<E, C>(relationship)?;
        Ok(self.resolve_navigation::<C>(key, rel))
    }

    fn typed_relationship<E: Entity, C: Entity>(&self, name: &str) -> Result<&'static str> {
        let rel = self.registry.relationship(E::TABLE_NAME, name)?;
        if rel.related_table != C::TABLE_NAME {
            return Err(Error::schema_conflict(
                E::TABLE_NAME,
                format!(
                    "relationship '{}' leads to '{}', not '{}'",
                    name,
                    rel.related_table,
                    C::TABLE_NAME
                ),
            ));
        }
        Ok(rel.name)
    }

    fn resolve_navigation<C: Entity>(
        &self,
        key: ObjectKey,
        relationship: &'static str,
    ) -> Option<Vec<EntityRef<C>>> {
        self.navigations.get(&(key, relationship)).map(|keys| {
            keys.iter()
                .filter(|k| !self.tracker.is_deleted(k))
                .filter_map(|k| self.map.get::<C>(k))
                .collect()
        })
    }

    fn drop_navigations(&mut self, key: &ObjectKey) {
        self.navigations.retain(|(owner, _), _| owner != key);
        for targets in self.navigations.values_mut() {
            targets.retain(|k| k != key);
        }
    }

    /// Move `old` to `new` everywhere the unit of work refers to it.
    fn rekey(&mut self, old: ObjectKey, new: ObjectKey) {
        self.map.rekey(&old, new);
        self.tracker.rekey(&old, new);
        for link in &mut self.links {
            if link.child == old {
                link.child = new;
            }
            if link.parent == old {
                link.parent = new;
            }
        }
        let stale: Vec<_> = self
            .navigations
            .keys()
            .filter(|(owner, _)| *owner == old)
            .copied()
            .collect();
        for nav in stale {
            if let Some(targets) = self.navigations.remove(&nav) {
                self.navigations.insert((new, nav.1), targets);
            }
        }
        for targets in self.navigations.values_mut() {
            for k in targets.iter_mut() {
                if *k == old {
                    *k = new;
                }
            }
        }
    }

    /// Write every pending change in one store transaction.
    ///
    /// On success the unit of work is Committed: added and modified
    /// entities become Unchanged with fresh snapshots and deleted entities
    /// are forgotten. On failure the store transaction is rolled back, the
    /// in-memory state is restored and the unit of work is RolledBack.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn commit(&mut self) -> Result<FlushSummary> {
        self.ensure_open()?;
        self.state = UnitOfWorkState::Flushing;
        let start = std::time::Instant::now();

        match self.flush().await {
            Ok(summary) => {
                self.finish_commit();
                self.state = UnitOfWorkState::Committed;
                tracing::info!(
                    elapsed_ms = start.elapsed().as_millis(),
                    inserted = summary.inserted,
                    updated = summary.updated,
                    deleted = summary.deleted,
                    "Unit of work committed"
                );
                Ok(summary)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Commit failed, rolling back");
                self.abort().await;
                Err(e)
            }
        }
    }

    /// Discard every pending change and restore tracked entities.
    ///
    /// Allowed while open, and after an interrupted commit (a commit future
    /// dropped while Flushing).
    pub async fn rollback(&mut self) -> Result<()> {
        match self.state {
            UnitOfWorkState::Idle | UnitOfWorkState::Open | UnitOfWorkState::Flushing => {
                self.abort().await;
                tracing::debug!("Unit of work rolled back");
                Ok(())
            }
            other => Err(Error::UnitOfWorkClosed {
                state: other.as_str(),
            }),
        }
    }

    async fn abort(&mut self) {
        if self.store_transaction {
            if let Err(e) = self.store.rollback().await {
                tracing::warn!(error = %e, "Store rollback failed");
            }
            self.store_transaction = false;
        }
        self.restore_all();
        self.state = UnitOfWorkState::RolledBack;
    }

    fn restore_all(&mut self) {
        for key in self.tracker.keys_in_order() {
            let slot = self.map.get_erased(&key).cloned();
            if self.tracker.is_added(&key) {
                if let (Some(slot), Some(image)) = (slot, self.tracker.added_image(&key)) {
                    if let Err(e) = slot.restore(image) {
                        tracing::warn!(table = key.table(), error = %e, "Could not restore added entity");
                    }
                }
                self.map.forget(&key);
                self.tracker.forget(&key);
            } else {
                if let (Some(slot), Some(snapshot)) = (slot, self.tracker.snapshot_of(&key)) {
                    if let Err(e) = slot.restore(snapshot.values()) {
                        tracing::warn!(table = key.table(), error = %e, "Could not restore entity");
                    }
                }
                self.tracker.unmark_deleted(&key);
            }
        }
        self.links.clear();
        self.navigations.clear();
    }

    fn finish_commit(&mut self) {
        for key in self.tracker.keys_in_order() {
            if self.tracker.is_deleted(&key) {
                self.map.forget(&key);
                self.tracker.forget(&key);
                self.drop_navigations(&key);
            } else if let Some(slot) = self.map.get_erased(&key) {
                let row = slot.row();
                self.tracker.snapshot(key, row);
            }
        }
        self.links.clear();
    }

    fn link_columns(&self, key: &ObjectKey) -> Vec<&'static str> {
        self.links
            .iter()
            .filter(|l| l.child == *key)
            .map(|l| l.column)
            .collect()
    }

    fn validate(&self, key: &ObjectKey, row: &[(&'static str, Value)]) -> Result<()> {
        let descriptor = self.descriptor_of(key.table())?;
        let linked = self.link_columns(key);
        let checked: Vec<(&'static str, Value)> = row
            .iter()
            .filter(|(c, _)| !linked.contains(c))
            .cloned()
            .collect();
        descriptor.validate(&checked)
    }

    /// Reject Added entities that would collide on a unique column set,
    /// either with each other or with an entity already tracked.
    fn check_pending_uniques(
        &self,
        added: &[(ObjectKey, Vec<(&'static str, Value)>)],
    ) -> Result<()> {
        let mut seen: HashSet<(&'static str, usize, u64)> = HashSet::new();
        for (key, row) in added {
            let descriptor = self.descriptor_of(key.table())?;
            let linked = self.link_columns(key);

            let pk = descriptor
                .primary_key
                .iter()
                .map(|c| value_of(row, c))
                .collect::<Vec<_>>();
            if !pk.iter().any(Value::is_null) {
                let existing = ObjectKey::stored(key.table(), &pk);
                if self.map.contains(&existing) && !self.tracker.is_deleted(&existing) {
                    return Err(Error::UniqueConstraintViolation {
                        entity: key.table().to_string(),
                        columns: descriptor.primary_key.iter().map(|c| c.to_string()).collect(),
                        message: "an entity with this key is already tracked".to_string(),
                    });
                }
            }

            let mut sets = vec![descriptor.primary_key.to_vec()];
            sets.extend(descriptor.unique_sets());
            for (i, set) in sets.iter().enumerate() {
                if set.iter().any(|c| linked.contains(c)) {
                    continue;
                }
                let values: Vec<Value> = set.iter().map(|c| value_of(row, c)).collect();
                if values.iter().any(Value::is_null) {
                    continue;
                }
                if !seen.insert((key.table(), i, hash_values(&values))) {
                    return Err(Error::UniqueConstraintViolation {
                        entity: key.table().to_string(),
                        columns: set.iter().map(|c| c.to_string()).collect(),
                        message: "two pending inserts share the same values".to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Foreign key edges among `keys`, found through column values.
    fn value_dependencies(
        &self,
        keys: &[(ObjectKey, Vec<(&'static str, Value)>)],
        by_stored: &HashMap<ObjectKey, ObjectKey>,
    ) -> Result<Vec<Dependency>> {
        let mut deps = Vec::new();
        for (child, row) in keys {
            let descriptor = self.descriptor_of(child.table())?;
            let linked = self.link_columns(child);
            for (field, table, _) in descriptor.foreign_keys() {
                if linked.contains(&field.name) {
                    continue;
                }
                let value = value_of(row, field.name);
                if value.is_null() {
                    continue;
                }
                if let Some(parent) = by_stored.get(&ObjectKey::stored(table, &[value])) {
                    deps.push(Dependency {
                        child: *child,
                        parent: *parent,
                        column: field.name,
                        nullable: field.nullable,
                        pending: false,
                    });
                }
            }
        }
        Ok(deps)
    }

    async fn flush(&mut self) -> Result<FlushSummary> {
        let mut added = Vec::new();
        let mut deleted = Vec::new();
        let mut modified = 0usize;
        for (key, state, row) in self.classify() {
            match state {
                EntityState::Added => added.push((key, row)),
                EntityState::Deleted => deleted.push((key, row)),
                EntityState::Modified => {
                    if self.config.validate {
                        self.validate(&key, &row)?;
                    }
                    modified += 1;
                }
                EntityState::Unchanged => {}
            }
        }
        if added.is_empty() && deleted.is_empty() && modified == 0 {
            tracing::debug!("Nothing to flush");
            return Ok(FlushSummary::default());
        }

        if self.config.validate {
            for (key, row) in &added {
                self.validate(key, row)?;
            }
        }
        self.check_pending_uniques(&added)?;

        // Insert order.
        let added_keys: Vec<ObjectKey> = added.iter().map(|(k, _)| *k).collect();
        let added_by_stored: HashMap<ObjectKey, ObjectKey> = added
            .iter()
            .filter_map(|(key, _)| {
                let pk = self.map.get_erased(key)?.primary_key();
                (!pk.iter().any(Value::is_null))
                    .then(|| (ObjectKey::stored(key.table(), &pk), *key))
            })
            .collect();
        let mut insert_deps = self.value_dependencies(&added, &added_by_stored)?;
        for link in &self.links {
            if self.tracker.is_added(&link.child) && self.tracker.is_added(&link.parent) {
                let nullable = self
                    .descriptor_of(link.child.table())?
                    .field(link.column)
                    .is_some_and(|f| f.nullable);
                insert_deps.push(Dependency {
                    child: link.child,
                    parent: link.parent,
                    column: link.column,
                    nullable,
                    pending: true,
                });
            }
        }
        let plan = order_inserts(&added_keys, &insert_deps)?;

        // Delete order.
        let deleted_keys: Vec<ObjectKey> = deleted.iter().map(|(k, _)| *k).collect();
        let deleted_by_stored: HashMap<ObjectKey, ObjectKey> =
            deleted_keys.iter().map(|k| (*k, *k)).collect();
        let delete_deps = self.value_dependencies(&deleted, &deleted_by_stored)?;
        let delete_order = order_deletes(&deleted_keys, &delete_deps);

        let moved = self.modified_edges(&deleted_by_stored, &added_by_stored)?;
        let updates = plan_updates(&moved, &delete_deps);

        tracing::info!(
            inserts = plan.order.len(),
            deferred = plan.deferred.len(),
            deletes = delete_order.len(),
            late_deletes = updates.late_deletes.len(),
            updates = modified,
            "Executing flush plan"
        );

        self.store.begin_transaction().await?;
        self.store_transaction = true;
        let mut summary = FlushSummary::default();
        let mut updated: HashSet<ObjectKey> = HashSet::new();

        for key in &updates.before_deletes {
            if self.write_update(*key).await? {
                summary.updated += 1;
            }
            updated.insert(*key);
        }

        for key in delete_order.iter().filter(|k| !updates.late_deletes.contains(k)) {
            self.write_delete(*key).await?;
            summary.deleted += 1;
        }

        for key in &updates.before_inserts {
            if self.write_update(*key).await? {
                summary.updated += 1;
            }
            updated.insert(*key);
        }

        let deferred: HashSet<(ObjectKey, &'static str)> =
            plan.deferred.iter().map(|d| (d.child, d.column)).collect();
        let mut renamed: HashMap<ObjectKey, ObjectKey> = HashMap::new();

        for key in plan.order {
            let descriptor = self.descriptor_of(key.table())?;
            let slot = self.slot(&key)?;
            let generated_column = descriptor.generated_key().map(|f| f.name);

            let mut columns = Vec::new();
            let mut values = Vec::new();
            let mut generated = false;
            for (column, value) in slot.row() {
                if Some(column) == generated_column && value.is_null() {
                    generated = true;
                    continue;
                }
                columns.push(column);
                values.push(if deferred.contains(&(key, column)) {
                    Value::Null
                } else {
                    value
                });
            }

            let new_id = PendingOp::Insert {
                key,
                table: key.table(),
                columns,
                values,
                generated,
            }
            .execute(&self.store)
            .await?;
            summary.inserted += 1;

            if let (Some(id), Some(column)) = (new_id, generated_column) {
                slot.apply(&[(column, Value::BigInt(id))])?;
                tracing::trace!(table = key.table(), id, "Assigned generated key");
            }
            let pk = slot.primary_key();
            let stored = if pk.iter().any(Value::is_null) {
                key
            } else {
                ObjectKey::stored(key.table(), &pk)
            };
            if stored != key {
                self.rekey(key, stored);
                renamed.insert(key, stored);
            }
            self.propagate(stored)?;
        }

        for dep in &plan.deferred {
            let child = renamed.get(&dep.child).copied().unwrap_or(dep.child);
            let descriptor = self.descriptor_of(child.table())?;
            let slot = self.slot(&child)?;
            let row = slot.row();
            PendingOp::Update {
                key: child,
                table: child.table(),
                pk_columns: descriptor.primary_key.to_vec(),
                pk_values: slot.primary_key(),
                set_columns: vec![dep.column],
                set_values: vec![value_of(&row, dep.column)],
            }
            .execute(&self.store)
            .await?;
            summary.updated += 1;
        }

        // Remaining modified entities, including children whose foreign key
        // was just filled in from a freshly inserted parent.
        for (key, state, _) in self.classify() {
            if state == EntityState::Modified
                && !updated.contains(&key)
                && self.write_update(key).await?
            {
                summary.updated += 1;
            }
        }

        for key in delete_order.iter().filter(|k| updates.late_deletes.contains(k)) {
            self.write_delete(*key).await?;
            summary.deleted += 1;
        }

        self.store.commit().await?;
        self.store_transaction = false;
        Ok(summary)
    }

    /// Foreign key columns each persisted entity is about to change, and
    /// which flush entities the old and new values point at.
    ///
    /// Entities linked to a pending parent take part even while they still
    /// look unchanged: their column is only filled in after the insert.
    fn modified_edges(
        &self,
        deleted: &HashMap<ObjectKey, ObjectKey>,
        added: &HashMap<ObjectKey, ObjectKey>,
    ) -> Result<Vec<ModifiedEntity>> {
        let mut edges = Vec::new();
        for (key, state, row) in self.classify() {
            let linked = self.link_columns(&key);
            let relinked = state == EntityState::Unchanged && !linked.is_empty();
            if state != EntityState::Modified && !relinked {
                continue;
            }
            let Some(snapshot) = self.tracker.snapshot_of(&key) else {
                continue;
            };
            let descriptor = self.descriptor_of(key.table())?;
            let mut entity = ModifiedEntity {
                key,
                releases: Vec::new(),
                awaits_insert: false,
            };
            for (field, table, _) in descriptor.foreign_keys() {
                let is_linked = linked.contains(&field.name);
                let old = snapshot.get(field.name).cloned().unwrap_or(Value::Null);
                let new = value_of(&row, field.name);
                if !is_linked && old == new {
                    continue;
                }
                if !old.is_null() {
                    if let Some(parent) = deleted.get(&ObjectKey::stored(table, &[old])) {
                        entity.releases.push(*parent);
                    }
                }
                if is_linked
                    || (!new.is_null() && added.contains_key(&ObjectKey::stored(table, &[new])))
                {
                    entity.awaits_insert = true;
                }
            }
            edges.push(entity);
        }
        Ok(edges)
    }

    /// Write the changed columns of a persisted entity; `false` if nothing
    /// differs from its snapshot.
    async fn write_update(&self, key: ObjectKey) -> Result<bool> {
        let descriptor = self.descriptor_of(key.table())?;
        let row = self.slot(&key)?.row();
        let changes = self.tracker.diff(&key, &row);
        if changes.is_empty() {
            return Ok(false);
        }
        let pk_values = match self.tracker.snapshot_of(&key) {
            Some(snapshot) => snapshot.project(descriptor.primary_key),
            None => self.slot(&key)?.primary_key(),
        };
        PendingOp::Update {
            key,
            table: key.table(),
            pk_columns: descriptor.primary_key.to_vec(),
            pk_values,
            set_columns: changes.iter().map(|c| c.column).collect(),
            set_values: changes.into_iter().map(|c| c.new).collect(),
        }
        .execute(&self.store)
        .await?;
        Ok(true)
    }

    async fn write_delete(&self, key: ObjectKey) -> Result<()> {
        let descriptor = self.descriptor_of(key.table())?;
        let pk_values = match self.tracker.snapshot_of(&key) {
            Some(snapshot) => snapshot.project(descriptor.primary_key),
            None => self.slot(&key)?.primary_key(),
        };
        PendingOp::Delete {
            key,
            table: key.table(),
            pk_columns: descriptor.primary_key.to_vec(),
            pk_values,
        }
        .execute(&self.store)
        .await?;
        Ok(())
    }

    /// Copy the key of a just-inserted parent into every linked child.
    fn propagate(&mut self, parent: ObjectKey) -> Result<()> {
        let links: Vec<PendingLink> = self
            .links
            .iter()
            .filter(|l| l.parent == parent)
            .copied()
            .collect();
        if links.is_empty() {
            return Ok(());
        }
        let parent_row = self.slot(&parent)?.row();
        for link in links {
            let value = value_of(&parent_row, link.source);
            self.slot(&link.child)?.apply(&[(link.column, value)])?;
        }
        Ok(())
    }
}
