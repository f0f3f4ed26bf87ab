//! Relationship loading in two phases.
//!
//! [`LoadContext::fetch`] performs every store lookup of a load and builds a
//! [`StagedLoad`] without touching the identity map; [`StagedLoad::apply`]
//! then registers the fetched instances and navigations synchronously. If
//! the fetch future is dropped (timeout, `select!`), nothing was changed.
//!
//! Each relationship hop costs exactly one lookup, keyed by the full set of
//! owner keys, however many owners there are (including none).

use crate::change_tracker::ChangeTracker;
use crate::identity_map::{ErasedEntity, IdentityMap};
use crate::registry::SchemaRegistry;
use crate::{ObjectKey, hash_values};
use keel_core::{
    EntityDescriptor, Error, QueryError, QueryErrorKind, RelationshipInfo, RelationshipKind,
    Result, Row, Store, Value, placeholders, quote_ident,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Loaded navigations: `(owner, relationship) -> related entities`.
pub type Navigations = HashMap<(ObjectKey, &'static str), Vec<ObjectKey>>;

/// Column carrying the owner key in many-to-many lookups.
const OWNER_COLUMN: &str = "__keel_owner";

/// One entity taking part in a load, with the values used to join on.
#[derive(Debug, Clone)]
pub struct LoadNode {
    pub key: ObjectKey,
    pub row: Vec<(&'static str, Value)>,
}

impl LoadNode {
    pub fn new(key: ObjectKey, row: Vec<(&'static str, Value)>) -> Self {
        Self { key, row }
    }

    pub fn value(&self, column: &str) -> Value {
        self.row
            .iter()
            .find(|(name, _)| *name == column)
            .map_or(Value::Null, |(_, v)| v.clone())
    }
}

struct StagedHop {
    relationship: &'static str,
    links: Vec<(ObjectKey, Vec<ObjectKey>)>,
}

/// The result of a fetch, ready to be applied to a unit of work.
#[derive(Default)]
pub struct StagedLoad {
    roots: Vec<ObjectKey>,
    fresh: Vec<(ObjectKey, Arc<dyn ErasedEntity>)>,
    hops: Vec<StagedHop>,
    queries: usize,
}

impl std::fmt::Debug for StagedLoad {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StagedLoad")
            .field("roots", &self.roots.len())
            .field("fresh", &self.fresh.len())
            .field("hops", &self.hops.len())
            .field("queries", &self.queries)
            .finish()
    }
}

impl StagedLoad {
    pub fn roots(&self) -> &[ObjectKey] {
        &self.roots
    }

    /// Number of store lookups the fetch issued.
    pub fn queries(&self) -> usize {
        self.queries
    }

    /// Register fetched instances and navigations.
    ///
    /// Instances already tracked win over fetched rows. Entities marked for
    /// deletion are left out of navigations and roots. Returns the roots.
    pub fn apply(
        self,
        map: &mut IdentityMap,
        tracker: &mut ChangeTracker,
        navigations: &mut Navigations,
    ) -> Vec<ObjectKey> {
        for (key, slot) in self.fresh {
            if map.contains(&key) {
                continue;
            }
            let row = slot.row();
            if let Ok((_, true)) = map.get_or_create_erased(key, || Ok(slot)) {
                tracker.snapshot(key, row);
            }
        }

        for hop in self.hops {
            for (owner, targets) in hop.links {
                let targets = targets
                    .into_iter()
                    .filter(|k| !tracker.is_deleted(k))
                    .collect();
                navigations.insert((owner, hop.relationship), targets);
            }
        }

        self.roots
            .into_iter()
            .filter(|k| !tracker.is_deleted(k))
            .collect()
    }
}

/// Read-only view of a unit of work used while fetching.
pub struct LoadContext<'a> {
    registry: &'a SchemaRegistry,
    map: &'a IdentityMap,
}

impl<'a> LoadContext<'a> {
    pub fn new(registry: &'a SchemaRegistry, map: &'a IdentityMap) -> Self {
        Self { registry, map }
    }

    /// Resolve a dotted relationship path (`"dealer.cars"`) starting at `table`.
    pub fn resolve_path(
        &self,
        table: &'static str,
        path: &str,
    ) -> Result<Vec<&'static RelationshipInfo>> {
        let mut current = table;
        let mut hops = Vec::new();
        for name in path.split('.') {
            let rel = self.registry.relationship(current, name)?;
            self.registry.get(rel.related_table)?;
            hops.push(rel);
            current = rel.related_table;
        }
        Ok(hops)
    }

    /// Turn rows of `table` into load nodes.
    ///
    /// Rows whose key is already tracked yield the tracked instance's
    /// current values; other rows are materialized and queued in `staged`.
    pub fn stage_rows(
        &self,
        table: &'static str,
        rows: &[Row],
        staged: &mut StagedLoad,
    ) -> Result<Vec<LoadNode>> {
        let registration = self.registry.get(table)?;
        let descriptor = &registration.descriptor;
        let mut queued: HashMap<ObjectKey, usize> = staged
            .fresh
            .iter()
            .enumerate()
            .map(|(i, (k, _))| (*k, i))
            .collect();
        let mut nodes = Vec::with_capacity(rows.len());

        for row in rows {
            let Some(key) = key_of_row(descriptor, row) else {
                tracing::warn!(table, "Skipping row without a primary key");
                continue;
            };
            if let Some(existing) = self.map.get_erased(&key) {
                nodes.push(LoadNode::new(key, existing.row()));
                continue;
            }
            if let Some(&i) = queued.get(&key) {
                nodes.push(LoadNode::new(key, staged.fresh[i].1.row()));
                continue;
            }
            let slot = (registration.materialize)(row)?;
            nodes.push(LoadNode::new(key, slot.row()));
            queued.insert(key, staged.fresh.len());
            staged.fresh.push((key, slot));
        }
        Ok(nodes)
    }

    /// Fetch `path` for `roots` (entities of `table`).
    #[tracing::instrument(level = "debug", skip(self, store, roots, staged), fields(roots = roots.len()))]
    pub async fn fetch<S: Store>(
        &self,
        store: &S,
        table: &'static str,
        roots: Vec<LoadNode>,
        path: &str,
        staged: &mut StagedLoad,
    ) -> Result<()> {
        let hops = self.resolve_path(table, path)?;
        let mut owners = roots;
        let mut owner_table = table;

        for rel in hops {
            let (links, targets) = self.fetch_hop(store, owner_table, rel, &owners, staged).await?;
            staged.hops.push(StagedHop {
                relationship: rel.name,
                links,
            });
            owners = targets;
            owner_table = rel.related_table;
        }
        Ok(())
    }

    /// Fetch and stage a whole load for `roots`, then return it.
    pub async fn fetch_all<S: Store>(
        &self,
        store: &S,
        table: &'static str,
        roots: Vec<LoadNode>,
        paths: &[&str],
    ) -> Result<StagedLoad> {
        let mut staged = StagedLoad {
            roots: roots.iter().map(|n| n.key).collect(),
            ..StagedLoad::default()
        };
        for path in paths {
            self.fetch(store, table, roots.clone(), path, &mut staged)
                .await?;
        }
        Ok(staged)
    }

    /// Record the roots of a load that started with a query.
    pub fn set_roots(staged: &mut StagedLoad, roots: &[LoadNode]) {
        staged.roots = roots.iter().map(|n| n.key).collect();
    }

    /// Count a lookup issued outside [`fetch`](Self::fetch).
    pub fn count_query(staged: &mut StagedLoad) {
        staged.queries += 1;
    }

    async fn fetch_hop<S: Store>(
        &self,
        store: &S,
        owner_table: &'static str,
        rel: &'static RelationshipInfo,
        owners: &[LoadNode],
        staged: &mut StagedLoad,
    ) -> Result<(Vec<(ObjectKey, Vec<ObjectKey>)>, Vec<LoadNode>)> {
        let owner_desc = self.registry.get(owner_table)?.descriptor;
        let target_desc = self.registry.get(rel.related_table)?.descriptor;

        let join_column = match rel.kind {
            RelationshipKind::ManyToOne => rel.local_key.unwrap_or_default(),
            RelationshipKind::OneToMany | RelationshipKind::ManyToMany => {
                single_key(&owner_desc, rel)?
            }
        };
        let keys = distinct_values(owners.iter().map(|o| o.value(join_column)));
        let limit = store.max_params();

        let (sql, params) = match rel.kind {
            RelationshipKind::ManyToOne => {
                let pk = single_key(&target_desc, rel)?;
                let (filter, params) = key_filter(&quote_ident(pk), &keys, limit)?;
                (select_sql(&target_desc, None, &filter), params)
            }
            RelationshipKind::OneToMany => {
                let remote = rel.remote_key.unwrap_or_default();
                let (filter, params) = key_filter(&quote_ident(remote), &keys, limit)?;
                (select_sql(&target_desc, None, &filter), params)
            }
            RelationshipKind::ManyToMany => {
                let pk = single_key(&target_desc, rel)?;
                let link = rel.link_table.ok_or_else(|| {
                    Error::schema_conflict(owner_table, format!("'{}' has no join entity", rel.name))
                })?;
                let (filter, params) = key_filter(
                    &format!("\"j\".{}", quote_ident(link.local_column)),
                    &keys,
                    limit,
                )?;
                let sql = format!(
                    "SELECT {}, \"j\".{} AS {} FROM {} AS \"t\" JOIN {} AS \"j\" ON \"j\".{} = \"t\".{} WHERE {}",
                    column_list(&target_desc, Some("t")),
                    quote_ident(link.local_column),
                    quote_ident(OWNER_COLUMN),
                    quote_ident(target_desc.table),
                    quote_ident(link.table_name),
                    quote_ident(link.remote_column),
                    quote_ident(pk),
                    filter
                );
                (sql, params)
            }
        };

        tracing::debug!(
            owner = owner_table,
            relationship = rel.name,
            owners = owners.len(),
            keys = keys.len(),
            "Batched relationship lookup"
        );
        let rows = store.query(&sql, &params).await?;
        staged.queries += 1;

        let targets = self.stage_rows(target_desc.table, &rows, staged)?;
        let mut links: Vec<(ObjectKey, Vec<ObjectKey>)> =
            owners.iter().map(|o| (o.key, Vec::new())).collect();

        match rel.kind {
            RelationshipKind::ManyToOne => {
                let present: HashSet<ObjectKey> = targets.iter().map(|t| t.key).collect();
                for (owner, link) in owners.iter().zip(links.iter_mut()) {
                    let fk = owner.value(join_column);
                    if fk.is_null() {
                        continue;
                    }
                    let key = ObjectKey::stored(target_desc.table, &[fk]);
                    if present.contains(&key) {
                        link.1.push(key);
                    }
                }
            }
            RelationshipKind::OneToMany => {
                let remote = rel.remote_key.unwrap_or_default();
                let index = owner_index(owners, join_column);
                for target in &targets {
                    let parent = hash_values(&[target.value(remote)]);
                    for &i in index.get(&parent).into_iter().flatten() {
                        push_unique(&mut links[i].1, target.key);
                    }
                }
            }
            RelationshipKind::ManyToMany => {
                let index = owner_index(owners, join_column);
                // stage_rows skips keyless rows, so walk rows and keys together.
                for (row, target) in rows
                    .iter()
                    .filter(|r| key_of_row(&target_desc, r).is_some())
                    .zip(&targets)
                {
                    let owner = row.get_by_name(OWNER_COLUMN).cloned().unwrap_or(Value::Null);
                    for &i in index.get(&hash_values(&[owner])).into_iter().flatten() {
                        push_unique(&mut links[i].1, target.key);
                    }
                }
            }
        }

        let mut seen = HashSet::new();
        let distinct_targets = targets.into_iter().filter(|t| seen.insert(t.key)).collect();
        Ok((links, distinct_targets))
    }
}

fn push_unique(list: &mut Vec<ObjectKey>, key: ObjectKey) {
    if !list.contains(&key) {
        list.push(key);
    }
}

fn owner_index(owners: &[LoadNode], column: &str) -> HashMap<u64, Vec<usize>> {
    let mut index: HashMap<u64, Vec<usize>> = HashMap::new();
    for (i, owner) in owners.iter().enumerate() {
        let value = owner.value(column);
        if !value.is_null() {
            index.entry(hash_values(&[value])).or_default().push(i);
        }
    }
    index
}

fn single_key(desc: &EntityDescriptor, rel: &RelationshipInfo) -> Result<&'static str> {
    match desc.primary_key {
        [only] => Ok(only),
        _ => Err(Error::schema_conflict(
            desc.table,
            format!("relationship '{}' needs a single-column key", rel.name),
        )),
    }
}

/// Distinct non-NULL values, in first-seen order.
fn distinct_values(values: impl Iterator<Item = Value>) -> Vec<Value> {
    let mut seen = HashSet::new();
    values
        .filter(|v| !v.is_null() && seen.insert(hash_values(std::slice::from_ref(v))))
        .collect()
}

pub(crate) fn key_of_row(desc: &EntityDescriptor, row: &Row) -> Option<ObjectKey> {
    let values: Vec<Value> = desc
        .primary_key
        .iter()
        .map(|pk| row.get_by_name(pk).cloned().unwrap_or(Value::Null))
        .collect();
    (!values.iter().any(Value::is_null)).then(|| ObjectKey::stored(desc.table, &values))
}

pub(crate) fn column_list(desc: &EntityDescriptor, alias: Option<&str>) -> String {
    desc.fields
        .iter()
        .map(|f| match alias {
            Some(a) => format!(
                "{}.{} AS {}",
                quote_ident(a),
                quote_ident(f.name),
                quote_ident(f.name)
            ),
            None => quote_ident(f.name),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn select_sql(desc: &EntityDescriptor, alias: Option<&str>, filter: &str) -> String {
    format!(
        "SELECT {} FROM {} WHERE {}",
        column_list(desc, alias),
        quote_ident(desc.table),
        filter
    )
}

/// `column IN (...)` over `keys`, which must already be distinct.
///
/// Keys are bound as parameters while the store accepts that many. Past the
/// limit integer keys are written inline so the hop stays a single lookup;
/// any other key type is an error.
fn key_filter(column: &str, keys: &[Value], limit: usize) -> Result<(String, Vec<Value>)> {
    if keys.is_empty() {
        return Ok(("1 = 0".to_string(), Vec::new()));
    }
    if keys.len() <= limit {
        let filter = format!("{} IN ({})", column, placeholders(1, keys.len()));
        return Ok((filter, keys.to_vec()));
    }
    let literals = keys
        .iter()
        .map(|key| match key {
            Value::Int(v) => Ok(v.to_string()),
            Value::BigInt(v) => Ok(v.to_string()),
            other => Err(Error::Query(QueryError::new(
                QueryErrorKind::Database,
                format!(
                    "{} keys exceed the store limit of {} parameters and {} keys cannot be inlined",
                    keys.len(),
                    limit,
                    other.type_name()
                ),
            ))),
        })
        .collect::<Result<Vec<_>>>()?;
    tracing::debug!(keys = keys.len(), limit, "Inlining integer keys past the parameter limit");
    Ok((format!("{} IN ({})", column, literals.join(", ")), Vec::new()))
}
