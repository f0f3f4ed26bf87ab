//! Flush ordering and statement generation.
//!
//! Pending changes reach the store in this order:
//! 1. UPDATE rows moved away from a parent that is about to be deleted
//! 2. DELETE children before parents
//! 3. UPDATE the remaining modified rows that do not wait on an insert, so
//!    unique values they give up can be reused by new rows
//! 4. INSERT parents before children (topological over foreign keys)
//! 5. UPDATE deferred foreign keys, then rows pointing at new parents
//! 6. DELETE parents whose children only left them in step 5
//!
//! Ordering works on individual entities, not tables, so two rows of the
//! same table that reference each other are still ordered correctly.

use crate::ObjectKey;
use keel_core::{
    Error, QueryError, QueryErrorKind, Result, Store, Value, placeholders, quote_ident,
};
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

/// A foreign key edge between two entities of one flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dependency {
    /// Entity holding the foreign key column.
    pub child: ObjectKey,
    /// Entity the column points at.
    pub parent: ObjectKey,
    pub column: &'static str,
    /// Whether `column` accepts NULL (the edge can be deferred).
    pub nullable: bool,
    /// The parent's key is generated by the store and must be copied into
    /// the child once known.
    pub pending: bool,
}

/// Insert order produced by [`order_inserts`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InsertOrder {
    /// Entities in the order they must be inserted.
    pub order: Vec<ObjectKey>,
    /// Edges broken to resolve a cycle: the child is inserted with NULL in
    /// `column` and updated once every insert is done.
    pub deferred: Vec<Dependency>,
}

struct Graph<'a> {
    nodes: &'a [ObjectKey],
    edges: Vec<(usize, usize, &'a Dependency)>,
    by_child: Vec<Vec<usize>>,
    by_parent: Vec<Vec<usize>>,
}

impl<'a> Graph<'a> {
    fn new(nodes: &'a [ObjectKey], deps: &'a [Dependency]) -> Self {
        let index: HashMap<ObjectKey, usize> =
            nodes.iter().enumerate().map(|(i, k)| (*k, i)).collect();
        let edges: Vec<_> = deps
            .iter()
            .filter_map(|d| {
                let child = *index.get(&d.child)?;
                let parent = *index.get(&d.parent)?;
                (child != parent).then_some((child, parent, d))
            })
            .collect();
        let mut by_child = vec![Vec::new(); nodes.len()];
        let mut by_parent = vec![Vec::new(); nodes.len()];
        for (e, (child, parent, _)) in edges.iter().enumerate() {
            by_child[*child].push(e);
            by_parent[*parent].push(e);
        }
        Self {
            nodes,
            edges,
            by_child,
            by_parent,
        }
    }

    /// Walk unsatisfied edges from `start` until a node repeats.
    ///
    /// Every node on the walk must have an unsatisfied edge, which holds
    /// whenever no remaining node is ready.
    fn find_cycle(&self, start: usize, active: &[bool], emitted: &[bool]) -> Vec<usize> {
        let mut seen: HashMap<usize, usize> = HashMap::new();
        let mut steps: Vec<usize> = Vec::new();
        let mut current = start;
        loop {
            if let Some(&at) = seen.get(&current) {
                return steps.split_off(at);
            }
            seen.insert(current, steps.len());
            let Some(&edge) = self.by_child[current]
                .iter()
                .find(|&&e| active[e] && !emitted[self.edges[e].1])
            else {
                return steps;
            };
            steps.push(edge);
            current = self.edges[edge].1;
        }
    }
}

fn cycle_labels(graph: &Graph<'_>, cycle: &[usize]) -> Vec<String> {
    cycle
        .iter()
        .map(|&e| {
            let dep = graph.edges[e].2;
            format!("{}.{}", dep.child.table(), dep.column)
        })
        .collect()
}

/// Order Added entities so every parent is inserted before its children.
///
/// `nodes` is the add order; among entities that are ready at the same time
/// the earlier-added one goes first. A cycle is broken at a nullable edge;
/// a cycle made only of required edges fails with
/// [`Error::UnresolvableInsertOrder`].
#[tracing::instrument(level = "debug", skip(nodes, deps), fields(nodes = nodes.len(), deps = deps.len()))]
pub fn order_inserts(nodes: &[ObjectKey], deps: &[Dependency]) -> Result<InsertOrder> {
    let graph = Graph::new(nodes, deps);
    let mut active = vec![true; graph.edges.len()];
    let mut emitted = vec![false; nodes.len()];
    // Unsatisfied parents per node.
    let mut waiting: Vec<usize> = graph.by_child.iter().map(Vec::len).collect();
    let mut ready: BinaryHeap<Reverse<usize>> = (0..nodes.len())
        .filter(|&i| waiting[i] == 0)
        .map(Reverse)
        .collect();
    let mut cursor = 0;
    let mut result = InsertOrder {
        order: Vec::with_capacity(nodes.len()),
        deferred: Vec::new(),
    };

    while result.order.len() < nodes.len() {
        if let Some(Reverse(i)) = ready.pop() {
            emitted[i] = true;
            result.order.push(graph.nodes[i]);
            for &e in &graph.by_parent[i] {
                if active[e] {
                    let child = graph.edges[e].0;
                    waiting[child] -= 1;
                    if waiting[child] == 0 {
                        ready.push(Reverse(child));
                    }
                }
            }
            continue;
        }

        while emitted[cursor] {
            cursor += 1;
        }
        let cycle = graph.find_cycle(cursor, &active, &emitted);
        match cycle.iter().copied().find(|&e| graph.edges[e].2.nullable) {
            Some(e) => {
                let dep = *graph.edges[e].2;
                tracing::debug!(
                    child = dep.child.table(),
                    parent = dep.parent.table(),
                    column = dep.column,
                    "Breaking insert cycle at nullable foreign key"
                );
                active[e] = false;
                let child = graph.edges[e].0;
                waiting[child] -= 1;
                if waiting[child] == 0 {
                    ready.push(Reverse(child));
                }
                result.deferred.push(dep);
            }
            None => {
                let cycle = cycle_labels(&graph, &cycle);
                tracing::warn!(cycle = ?cycle, "Required foreign keys form a cycle");
                return Err(Error::UnresolvableInsertOrder { cycle });
            }
        }
    }

    Ok(result)
}

/// Order Deleted entities so every child is deleted before its parent.
///
/// Cycles cannot be avoided here; the earliest-tracked entity of a cycle is
/// deleted first and the store's constraint checking decides the outcome.
pub fn order_deletes(nodes: &[ObjectKey], deps: &[Dependency]) -> Vec<ObjectKey> {
    let graph = Graph::new(nodes, deps);
    let mut emitted = vec![false; nodes.len()];
    // Children not yet deleted per node.
    let mut waiting: Vec<usize> = graph.by_parent.iter().map(Vec::len).collect();
    let mut ready: BinaryHeap<Reverse<usize>> = (0..nodes.len())
        .filter(|&i| waiting[i] == 0)
        .map(Reverse)
        .collect();
    let mut cursor = 0;
    let mut order = Vec::with_capacity(nodes.len());

    while order.len() < nodes.len() {
        let next = match ready.pop() {
            Some(Reverse(i)) if emitted[i] => continue,
            Some(Reverse(i)) => i,
            None => {
                while emitted[cursor] {
                    cursor += 1;
                }
                tracing::warn!(
                    table = nodes[cursor].table(),
                    "Deleted entities reference each other in a cycle"
                );
                cursor
            }
        };
        emitted[next] = true;
        order.push(nodes[next]);
        for &e in &graph.by_child[next] {
            let parent = graph.edges[e].1;
            waiting[parent] -= 1;
            if waiting[parent] == 0 && !emitted[parent] {
                ready.push(Reverse(parent));
            }
        }
    }

    order
}

/// A Modified entity and the foreign key edges its update changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModifiedEntity {
    pub key: ObjectKey,
    /// Deleted entities that the old foreign key values point at.
    pub releases: Vec<ObjectKey>,
    /// A new foreign key value belongs to an entity inserted by this flush.
    pub awaits_insert: bool,
}

/// Placement of Modified updates relative to the delete and insert phases.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdatePlan {
    /// Run before any delete.
    pub before_deletes: Vec<ObjectKey>,
    /// Run between deletes and inserts.
    pub before_inserts: Vec<ObjectKey>,
    /// Deletes held back until every insert and update has run.
    pub late_deletes: HashSet<ObjectKey>,
}

/// Decide when each Modified entity is updated.
///
/// Updates waiting on an insert run after the inserts; any Deleted entity
/// they release, and every Deleted ancestor of it, is then deleted last.
pub fn plan_updates(modified: &[ModifiedEntity], delete_deps: &[Dependency]) -> UpdatePlan {
    let mut plan = UpdatePlan::default();
    let mut pending: Vec<ObjectKey> = Vec::new();
    for entity in modified {
        if entity.awaits_insert {
            pending.extend(entity.releases.iter().copied());
        } else if entity.releases.is_empty() {
            plan.before_inserts.push(entity.key);
        } else {
            plan.before_deletes.push(entity.key);
        }
    }

    let mut parents: HashMap<ObjectKey, Vec<ObjectKey>> = HashMap::new();
    for dep in delete_deps {
        parents.entry(dep.child).or_default().push(dep.parent);
    }
    while let Some(key) = pending.pop() {
        if plan.late_deletes.insert(key) {
            pending.extend(parents.get(&key).into_iter().flatten().copied());
        }
    }
    plan
}

/// A single statement of a flush.
#[derive(Debug, Clone, PartialEq)]
pub enum PendingOp {
    /// Insert a new row.
    Insert {
        key: ObjectKey,
        table: &'static str,
        columns: Vec<&'static str>,
        values: Vec<Value>,
        /// The store generates the key; read it back after the insert.
        generated: bool,
    },
    /// Update some columns of an existing row.
    Update {
        key: ObjectKey,
        table: &'static str,
        pk_columns: Vec<&'static str>,
        pk_values: Vec<Value>,
        set_columns: Vec<&'static str>,
        set_values: Vec<Value>,
    },
    /// Delete an existing row.
    Delete {
        key: ObjectKey,
        table: &'static str,
        pk_columns: Vec<&'static str>,
        pk_values: Vec<Value>,
    },
}

fn where_pk(pk_columns: &[&str], start: usize) -> String {
    pk_columns
        .iter()
        .enumerate()
        .map(|(i, col)| format!("{} = ${}", quote_ident(col), start + i))
        .collect::<Vec<_>>()
        .join(" AND ")
}

fn column_list(columns: &[&str]) -> String {
    columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ")
}

impl PendingOp {
    pub fn table(&self) -> &'static str {
        match self {
            PendingOp::Insert { table, .. }
            | PendingOp::Update { table, .. }
            | PendingOp::Delete { table, .. } => table,
        }
    }

    pub fn key(&self) -> ObjectKey {
        match self {
            PendingOp::Insert { key, .. }
            | PendingOp::Update { key, .. }
            | PendingOp::Delete { key, .. } => *key,
        }
    }

    /// SQL text with `$n` placeholders matching [`params`](Self::params).
    pub fn sql(&self) -> String {
        match self {
            PendingOp::Insert { table, columns, .. } => {
                if columns.is_empty() {
                    format!("INSERT INTO {} DEFAULT VALUES", quote_ident(table))
                } else {
                    format!(
                        "INSERT INTO {} ({}) VALUES ({})",
                        quote_ident(table),
                        column_list(columns),
                        placeholders(1, columns.len())
                    )
                }
            }
            PendingOp::Update {
                table,
                pk_columns,
                set_columns,
                ..
            } => {
                let set = set_columns
                    .iter()
                    .enumerate()
                    .map(|(i, col)| format!("{} = ${}", quote_ident(col), i + 1))
                    .collect::<Vec<_>>()
                    .join(", ");
                format!(
                    "UPDATE {} SET {} WHERE {}",
                    quote_ident(table),
                    set,
                    where_pk(pk_columns, set_columns.len() + 1)
                )
            }
            PendingOp::Delete {
                table, pk_columns, ..
            } => format!(
                "DELETE FROM {} WHERE {}",
                quote_ident(table),
                where_pk(pk_columns, 1)
            ),
        }
    }

    pub fn params(&self) -> Vec<Value> {
        match self {
            PendingOp::Insert { values, .. } => values.clone(),
            PendingOp::Update {
                pk_values,
                set_values,
                ..
            } => set_values.iter().chain(pk_values).cloned().collect(),
            PendingOp::Delete { pk_values, .. } => pk_values.clone(),
        }
    }

    /// Run the statement. Returns the generated key of an insert that asked
    /// for one.
    ///
    /// An update that matches no row fails with a `NotFound` query error: the
    /// row was removed behind this unit of work's back.
    #[tracing::instrument(level = "debug", skip(self, store), fields(table = self.table()))]
    pub async fn execute<S: Store>(&self, store: &S) -> Result<Option<i64>> {
        let sql = self.sql();
        let params = self.params();
        tracing::trace!(sql = %sql, params = params.len(), "Executing flush statement");

        let outcome = match self {
            PendingOp::Insert {
                generated: true, ..
            } => store.insert(&sql, &params).await.map(Some),
            PendingOp::Insert { .. } => store.execute(&sql, &params).await.map(|_| None),
            PendingOp::Update { .. } => match store.execute(&sql, &params).await {
                Ok(0) => Err(Error::Query(
                    QueryError::new(
                        QueryErrorKind::NotFound,
                        format!("no row of '{}' matched the update", self.table()),
                    )
                    .with_sql(sql.as_str()),
                )),
                Ok(_) => Ok(None),
                Err(e) => Err(e),
            },
            PendingOp::Delete { .. } => match store.execute(&sql, &params).await {
                Ok(0) => {
                    tracing::warn!(table = self.table(), "Deleted row was already gone");
                    Ok(None)
                }
                Ok(_) => Ok(None),
                Err(e) => Err(e),
            },
        };
        outcome.map_err(|e| translate_unique(self.table(), e))
    }
}

/// Surface a store unique violation as [`Error::UniqueConstraintViolation`].
pub(crate) fn translate_unique(table: &str, err: Error) -> Error {
    match err {
        Error::Query(q) if q.is_unique_violation() => Error::UniqueConstraintViolation {
            entity: table.to_string(),
            columns: violated_columns(table, &q.message),
            message: q.message,
        },
        other => other,
    }
}

/// Columns named as `table.column` in a store's constraint message, such as
/// SQLite's `UNIQUE constraint failed: cars.make, cars.model`.
fn violated_columns(table: &str, message: &str) -> Vec<String> {
    let prefix = format!("{}.", table);
    message
        .split(|c: char| c.is_whitespace() || c == ',' || c == ':')
        .filter_map(|token| token.trim_matches('"').strip_prefix(prefix.as_str()))
        .filter(|column| !column.is_empty())
        .map(str::to_string)
        .collect()
}

/// Rows written by one flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlushSummary {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
}

impl FlushSummary {
    pub fn is_empty(&self) -> bool {
        self.inserted == 0 && self.updated == 0 && self.deleted == 0
    }
}
