//! Identity Map pattern: one in-memory instance per row.
//!
//! The map owns type-erased handles to every entity a unit of work tracks.
//! Each handle wraps an [`EntityRef`], so getting the same key twice yields
//! two `Arc`s to the same object and a write through either is visible
//! through both.
//!
//! # Example
//!
//! ```ignore
//! let mut map = IdentityMap::new();
//! let key = ObjectKey::stored("dealers", &[Value::BigInt(1)]);
//! let (dealer, created) = map.get_or_create::<Dealer>(key, || Ok(dealer))?;
//! let again = map.get::<Dealer>(&key).unwrap();
//! assert!(Arc::ptr_eq(&dealer, &again));
//! ```

use crate::{EntityRef, ObjectKey};
use keel_core::{Entity, Result, Row, Value};
use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Object-safe view of a tracked entity.
///
/// Lets the unit of work read and rewrite heterogeneous entities through
/// their row representation without knowing their Rust types.
pub trait ErasedEntity: Send + Sync {
    fn table(&self) -> &'static str;

    /// Current `(column, value)` pairs.
    fn row(&self) -> Vec<(&'static str, Value)>;

    fn primary_key(&self) -> Vec<Value>;

    /// Overwrite some columns, leaving the rest untouched.
    fn apply(&self, changes: &[(&'static str, Value)]) -> Result<()>;

    /// Replace every field with the values of `row`.
    fn restore(&self, row: &[(&'static str, Value)]) -> Result<()>;

    fn as_any(&self) -> &dyn Any;
}

struct Slot<E: Entity>(EntityRef<E>);

fn read<E>(lock: &RwLock<E>) -> RwLockReadGuard<'_, E> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<E>(lock: &RwLock<E>) -> RwLockWriteGuard<'_, E> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

impl<E: Entity> ErasedEntity for Slot<E> {
    fn table(&self) -> &'static str {
        E::TABLE_NAME
    }

    fn row(&self) -> Vec<(&'static str, Value)> {
        read(&self.0).to_row()
    }

    fn primary_key(&self) -> Vec<Value> {
        read(&self.0).primary_key_value()
    }

    fn apply(&self, changes: &[(&'static str, Value)]) -> Result<()> {
        let mut row = self.row();
        for (column, value) in changes {
            match row.iter_mut().find(|(name, _)| name == column) {
                Some(slot) => slot.1 = value.clone(),
                None => row.push((*column, value.clone())),
            }
        }
        self.restore(&row)
    }

    fn restore(&self, row: &[(&'static str, Value)]) -> Result<()> {
        let rebuilt = E::from_row(&Row::from_pairs(row.to_vec()))?;
        *write(&self.0) = rebuilt;
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Wrap a typed handle for storage in the identity map.
pub fn erase<E: Entity>(entity: &EntityRef<E>) -> Arc<dyn ErasedEntity> {
    Arc::new(Slot(Arc::clone(entity)))
}

/// Recover the typed handle, if `slot` holds an `E`.
pub fn downcast<E: Entity>(slot: &dyn ErasedEntity) -> Option<EntityRef<E>> {
    slot.as_any()
        .downcast_ref::<Slot<E>>()
        .map(|s| Arc::clone(&s.0))
}

fn is_instance<E: Entity>(slot: &dyn ErasedEntity, entity: &EntityRef<E>) -> bool {
    slot.as_any()
        .downcast_ref::<Slot<E>>()
        .is_some_and(|s| Arc::ptr_eq(&s.0, entity))
}

/// Per-unit-of-work map from [`ObjectKey`] to the tracked instance.
#[derive(Default)]
pub struct IdentityMap {
    entries: HashMap<ObjectKey, Arc<dyn ErasedEntity>>,
}

impl std::fmt::Debug for IdentityMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityMap")
            .field("entries", &self.entries.len())
            .finish()
    }
}

impl IdentityMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the tracked instance for `key`, or materialize one with
    /// `loader` and track it. The flag is `true` when `loader` ran.
    pub fn get_or_create_erased(
        &mut self,
        key: ObjectKey,
        loader: impl FnOnce() -> Result<Arc<dyn ErasedEntity>>,
    ) -> Result<(Arc<dyn ErasedEntity>, bool)> {
        if let Some(existing) = self.entries.get(&key) {
            return Ok((Arc::clone(existing), false));
        }
        let created = loader()?;
        self.entries.insert(key, Arc::clone(&created));
        tracing::trace!(table = key.table(), "Identity map registered instance");
        Ok((created, true))
    }

    /// Typed form of [`get_or_create_erased`](Self::get_or_create_erased).
    ///
    /// Returns `None` if `key` is already tracked with a different Rust type.
    pub fn get_or_create<E: Entity>(
        &mut self,
        key: ObjectKey,
        loader: impl FnOnce() -> Result<E>,
    ) -> Result<Option<(EntityRef<E>, bool)>> {
        let (slot, created) = self.get_or_create_erased(key, || {
            let entity = Arc::new(RwLock::new(loader()?));
            Ok(erase(&entity))
        })?;
        Ok(downcast::<E>(slot.as_ref()).map(|e| (e, created)))
    }

    /// Track `entity` under `key`, returning any instance it displaced.
    pub fn insert<E: Entity>(
        &mut self,
        key: ObjectKey,
        entity: &EntityRef<E>,
    ) -> Option<Arc<dyn ErasedEntity>> {
        self.entries.insert(key, erase(entity))
    }

    pub fn get<E: Entity>(&self, key: &ObjectKey) -> Option<EntityRef<E>> {
        self.entries
            .get(key)
            .and_then(|slot| downcast::<E>(slot.as_ref()))
    }

    pub fn get_erased(&self, key: &ObjectKey) -> Option<&Arc<dyn ErasedEntity>> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &ObjectKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Find the key under which this exact instance is tracked.
    pub fn key_of<E: Entity>(&self, entity: &EntityRef<E>) -> Option<ObjectKey> {
        let pk = read(entity).primary_key_value();
        if !pk.iter().any(Value::is_null) {
            let key = ObjectKey::stored(E::TABLE_NAME, &pk);
            if self
                .entries
                .get(&key)
                .is_some_and(|slot| is_instance(slot.as_ref(), entity))
            {
                return Some(key);
            }
        }
        // Pending keys, or a key column edited in memory.
        self.entries
            .iter()
            .find(|&(key, slot)| key.table() == E::TABLE_NAME && is_instance(slot.as_ref(), entity))
            .map(|(key, _)| *key)
    }

    /// Stop tracking `key`.
    pub fn forget(&mut self, key: &ObjectKey) -> Option<Arc<dyn ErasedEntity>> {
        self.entries.remove(key)
    }

    /// Move an entry to a new key (pending key replaced by a generated one).
    pub fn rekey(&mut self, old: &ObjectKey, new: ObjectKey) -> bool {
        match self.entries.remove(old) {
            Some(slot) => {
                self.entries.insert(new, slot);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn keys(&self) -> impl Iterator<Item = &ObjectKey> {
        self.entries.keys()
    }
}
