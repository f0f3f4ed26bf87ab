//! Change tracking and dirty detection.
//!
//! Every tracked entity has an entry here. Loaded entities carry a snapshot
//! of the values they were read with; an entity counts as Modified whenever
//! its current row differs from that snapshot. Added entities carry the
//! image they were added with so a rollback can put them back exactly.

use crate::{EntityState, ObjectKey};
use keel_core::Value;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Instant;

/// Column values of an entity at a point in time.
#[derive(Debug, Clone)]
pub struct ObjectSnapshot {
    values: Vec<(&'static str, Value)>,
    taken_at: Instant,
}

impl ObjectSnapshot {
    pub fn new(values: Vec<(&'static str, Value)>) -> Self {
        Self {
            values,
            taken_at: Instant::now(),
        }
    }

    pub fn values(&self) -> &[(&'static str, Value)] {
        &self.values
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.values
            .iter()
            .find(|(name, _)| *name == column)
            .map(|(_, v)| v)
    }

    /// Values of `columns`, in that order (NULL for unknown columns).
    pub fn project(&self, columns: &[&str]) -> Vec<Value> {
        columns
            .iter()
            .map(|c| self.get(c).cloned().unwrap_or(Value::Null))
            .collect()
    }

    pub fn taken_at(&self) -> Instant {
        self.taken_at
    }
}

/// One column whose value differs from the snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldChange {
    pub column: &'static str,
    pub old: Value,
    pub new: Value,
}

/// Pending change of one entity, suitable for audit output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityChange {
    pub table: &'static str,
    /// Primary key values; NULL components are keys the store will generate.
    pub key: Vec<Value>,
    pub state: EntityState,
    pub fields: Vec<FieldChange>,
}

/// Every pending change of a unit of work, in tracking order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChangeSet {
    pub entities: Vec<EntityChange>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn count(&self, state: EntityState) -> usize {
        self.entities.iter().filter(|e| e.state == state).count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Added,
    Tracked,
    Deleted,
}

#[derive(Debug)]
struct Entry {
    mark: Mark,
    snapshot: Option<ObjectSnapshot>,
    added_image: Option<Vec<(&'static str, Value)>>,
    order: u64,
}

/// Tracks the lifecycle state of every entity in a unit of work.
#[derive(Debug, Default)]
pub struct ChangeTracker {
    entries: HashMap<ObjectKey, Entry>,
    next_order: u64,
}

impl ChangeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_order(&mut self) -> u64 {
        let order = self.next_order;
        self.next_order += 1;
        order
    }

    /// Record `values` as the last-known stored state of `key`.
    ///
    /// The entity becomes Unchanged. Tracking order is preserved for
    /// entities that were already tracked.
    #[tracing::instrument(level = "trace", skip(self, values))]
    pub fn snapshot(&mut self, key: ObjectKey, values: Vec<(&'static str, Value)>) {
        tracing::trace!(
            table = key.table(),
            columns = values.len(),
            "Taking object snapshot"
        );
        let snapshot = ObjectSnapshot::new(values);
        match self.entries.get_mut(&key) {
            Some(entry) => {
                entry.mark = Mark::Tracked;
                entry.snapshot = Some(snapshot);
                entry.added_image = None;
            }
            None => {
                let order = self.next_order();
                self.entries.insert(
                    key,
                    Entry {
                        mark: Mark::Tracked,
                        snapshot: Some(snapshot),
                        added_image: None,
                        order,
                    },
                );
            }
        }
    }

    /// Track a new entity that has no backing row yet.
    pub fn mark_added(&mut self, key: ObjectKey, image: Vec<(&'static str, Value)>) {
        let order = self.next_order();
        tracing::trace!(table = key.table(), "Marking object added");
        self.entries.insert(
            key,
            Entry {
                mark: Mark::Added,
                snapshot: None,
                added_image: Some(image),
                order,
            },
        );
    }

    /// Mark a stored entity for deletion.
    ///
    /// Returns `false` if `key` is not tracked or is Added (an Added entity
    /// has no row to delete and should simply be forgotten).
    pub fn mark_deleted(&mut self, key: &ObjectKey) -> bool {
        match self.entries.get_mut(key) {
            Some(entry) if entry.mark != Mark::Added => {
                entry.mark = Mark::Deleted;
                tracing::trace!(table = key.table(), "Marking object deleted");
                true
            }
            _ => false,
        }
    }

    pub fn is_tracked(&self, key: &ObjectKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn is_added(&self, key: &ObjectKey) -> bool {
        self.entries
            .get(key)
            .is_some_and(|e| e.mark == Mark::Added)
    }

    pub fn is_deleted(&self, key: &ObjectKey) -> bool {
        self.entries
            .get(key)
            .is_some_and(|e| e.mark == Mark::Deleted)
    }

    /// Classify `key` given its current values.
    pub fn state(&self, key: &ObjectKey, current: &[(&'static str, Value)]) -> Option<EntityState> {
        let entry = self.entries.get(key)?;
        Some(match entry.mark {
            Mark::Added => EntityState::Added,
            Mark::Deleted => EntityState::Deleted,
            Mark::Tracked => {
                if self.diff(key, current).is_empty() {
                    EntityState::Unchanged
                } else {
                    EntityState::Modified
                }
            }
        })
    }

    /// Columns whose current value differs from the snapshot.
    ///
    /// Entities without a snapshot (Added) report every non-NULL column.
    #[tracing::instrument(level = "trace", skip(self, current))]
    pub fn diff(&self, key: &ObjectKey, current: &[(&'static str, Value)]) -> Vec<FieldChange> {
        let snapshot = self.entries.get(key).and_then(|e| e.snapshot.as_ref());
        let changes: Vec<FieldChange> = match snapshot {
            None => current
                .iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(column, v)| FieldChange {
                    column: *column,
                    old: Value::Null,
                    new: v.clone(),
                })
                .collect(),
            Some(snapshot) => current
                .iter()
                .filter_map(|(column, new)| {
                    let old = snapshot.get(column).cloned().unwrap_or(Value::Null);
                    (!old.key_eq(new)).then(|| FieldChange {
                        column: *column,
                        old,
                        new: new.clone(),
                    })
                })
                .collect(),
        };
        if !changes.is_empty() {
            tracing::trace!(
                table = key.table(),
                changed = changes.len(),
                "Detected changed fields"
            );
        }
        changes
    }

    pub fn snapshot_of(&self, key: &ObjectKey) -> Option<&ObjectSnapshot> {
        self.entries.get(key).and_then(|e| e.snapshot.as_ref())
    }

    /// The values an Added entity had when it was added.
    pub fn added_image(&self, key: &ObjectKey) -> Option<&[(&'static str, Value)]> {
        self.entries
            .get(key)
            .and_then(|e| e.added_image.as_deref())
    }

    /// Move an entry to a new key, keeping its state and order.
    pub fn rekey(&mut self, old: &ObjectKey, new: ObjectKey) -> bool {
        match self.entries.remove(old) {
            Some(entry) => {
                self.entries.insert(new, entry);
                true
            }
            None => false,
        }
    }

    /// Put a Deleted entity back to Unchanged tracking.
    pub fn unmark_deleted(&mut self, key: &ObjectKey) {
        if let Some(entry) = self.entries.get_mut(key) {
            if entry.mark == Mark::Deleted {
                entry.mark = Mark::Tracked;
            }
        }
    }

    pub fn forget(&mut self, key: &ObjectKey) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Every tracked key, in the order it started being tracked.
    pub fn keys_in_order(&self) -> Vec<ObjectKey> {
        let mut keys: Vec<(u64, ObjectKey)> =
            self.entries.iter().map(|(k, e)| (e.order, *k)).collect();
        keys.sort_unstable_by_key(|(order, _)| *order);
        keys.into_iter().map(|(_, k)| k).collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
