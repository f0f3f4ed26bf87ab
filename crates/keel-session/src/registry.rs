//! Schema registry: one validated descriptor per entity type.
//!
//! The registry is built once at startup and shared (usually behind an
//! `Arc`) by every unit of work. Besides the descriptor it keeps a
//! materializer per table, which lets the loader turn rows of any registered
//! table into tracked instances without knowing their Rust types.

use crate::identity_map::{ErasedEntity, erase};
use keel_core::{
    Entity, EntityDescriptor, Error, RelationshipInfo, RelationshipKind, Result, Row,
    is_valid_identifier,
};
use std::any::TypeId;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

/// Builds a tracked instance from a row of its table.
pub type Materializer = fn(&Row) -> Result<Arc<dyn ErasedEntity>>;

fn materialize<E: Entity>(row: &Row) -> Result<Arc<dyn ErasedEntity>> {
    let entity = Arc::new(RwLock::new(E::from_row(row)?));
    Ok(erase(&entity))
}

/// Everything known about one registered table.
#[derive(Debug, Clone, Copy)]
pub struct Registration {
    pub descriptor: EntityDescriptor,
    /// Rust type registered for the table, if it came from [`SchemaRegistry::register`].
    pub type_id: Option<TypeId>,
    pub type_name: &'static str,
    pub materialize: Materializer,
}

/// Registry of entity descriptors, keyed by table name.
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    entries: HashMap<&'static str, Registration>,
    order: Vec<&'static str>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `E` from its declarative descriptor.
    ///
    /// Registering the same type again is a no-op.
    pub fn register<E: Entity>(&mut self) -> Result<()> {
        self.insert(Registration {
            descriptor: E::descriptor(),
            type_id: Some(TypeId::of::<E>()),
            type_name: std::any::type_name::<E>(),
            materialize: materialize::<E>,
        })
    }

    /// Register a descriptor with an explicit materializer.
    pub fn register_descriptor(
        &mut self,
        descriptor: EntityDescriptor,
        materialize: Materializer,
    ) -> Result<()> {
        self.insert(Registration {
            descriptor,
            type_id: None,
            type_name: descriptor.table,
            materialize,
        })
    }

    #[tracing::instrument(level = "debug", skip(self, registration), fields(table = registration.descriptor.table))]
    fn insert(&mut self, registration: Registration) -> Result<()> {
        let table = registration.descriptor.table;
        if let Some(existing) = self.entries.get(table) {
            if existing.descriptor != registration.descriptor {
                return Err(Error::schema_conflict(
                    table,
                    "registered again with a different shape",
                ));
            }
            if let (Some(a), Some(b)) = (existing.type_id, registration.type_id) {
                if a != b {
                    return Err(Error::schema_conflict(
                        table,
                        format!(
                            "table already mapped by {}, cannot map {}",
                            existing.type_name, registration.type_name
                        ),
                    ));
                }
            }
            tracing::trace!("Entity already registered");
            return Ok(());
        }

        validate_descriptor(&registration.descriptor)?;
        tracing::debug!(
            fields = registration.descriptor.fields.len(),
            relationships = registration.descriptor.relationships.len(),
            "Registered entity"
        );
        self.entries.insert(table, registration);
        self.order.push(table);
        Ok(())
    }

    /// Look up a table's registration.
    pub fn get(&self, table: &str) -> Result<&Registration> {
        self.entries
            .get(table)
            .ok_or_else(|| Error::UnknownEntity(table.to_string()))
    }

    /// Descriptor of `E`, which must have been registered as `E`.
    pub fn descriptor<E: Entity>(&self) -> Result<&EntityDescriptor> {
        match self.entries.get(E::TABLE_NAME) {
            Some(reg) if reg.type_id.is_none_or(|id| id == TypeId::of::<E>()) => {
                Ok(&reg.descriptor)
            }
            _ => Err(Error::UnknownEntity(std::any::type_name::<E>().to_string())),
        }
    }

    pub fn materializer(&self, table: &str) -> Result<Materializer> {
        self.get(table).map(|reg| reg.materialize)
    }

    pub fn relationship(&self, table: &str, name: &str) -> Result<&'static RelationshipInfo> {
        self.get(table)?
            .descriptor
            .relationship(name)
            .ok_or_else(|| Error::UnknownRelationship {
                entity: table.to_string(),
                relationship: name.to_string(),
            })
    }

    pub fn contains(&self, table: &str) -> bool {
        self.entries.contains_key(table)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Descriptors in registration order.
    pub fn descriptors(&self) -> impl Iterator<Item = &EntityDescriptor> {
        self.order.iter().filter_map(|t| self.entries.get(t)).map(|r| &r.descriptor)
    }

    /// Descriptors with referenced tables before the tables referencing them.
    ///
    /// Tables caught in a foreign key cycle keep registration order.
    pub fn creation_order(&self) -> Vec<&EntityDescriptor> {
        let mut placed: HashSet<&str> = HashSet::new();
        let mut result = Vec::with_capacity(self.order.len());
        let mut remaining: Vec<&EntityDescriptor> = self.descriptors().collect();

        while !remaining.is_empty() {
            let ready = remaining.iter().position(|d| {
                d.foreign_keys().all(|(_, target, _)| {
                    target == d.table || placed.contains(target) || !self.contains(target)
                })
            });
            let next = remaining.remove(ready.unwrap_or(0));
            placed.insert(next.table);
            result.push(next);
        }
        result
    }
}

fn check_identifier(table: &str, kind: &str, name: &str) -> Result<()> {
    if is_valid_identifier(name) {
        Ok(())
    } else {
        Err(Error::schema_conflict(
            table,
            format!("invalid {} name '{}'", kind, name),
        ))
    }
}

fn validate_descriptor(d: &EntityDescriptor) -> Result<()> {
    check_identifier(d.table, "table", d.table)?;

    let mut seen = HashSet::new();
    for field in d.fields {
        check_identifier(d.table, "column", field.name)?;
        if !seen.insert(field.name) {
            return Err(Error::schema_conflict(
                d.table,
                format!("column '{}' declared twice", field.name),
            ));
        }
        if let Some(reference) = field.foreign_key {
            match field.references() {
                Some((t, c)) if is_valid_identifier(t) && is_valid_identifier(c) => {}
                _ => {
                    return Err(Error::schema_conflict(
                        d.table,
                        format!("malformed foreign key '{}' on '{}'", reference, field.name),
                    ));
                }
            }
        }
    }

    let has_column = |name: &str, what: &str| -> Result<()> {
        if d.field(name).is_some() {
            Ok(())
        } else {
            Err(Error::schema_conflict(
                d.table,
                format!("{} names unknown column '{}'", what, name),
            ))
        }
    };

    if d.primary_key.is_empty() {
        return Err(Error::schema_conflict(d.table, "no primary key declared"));
    }
    for pk in d.primary_key {
        has_column(pk, "primary key")?;
    }
    for set in d.unique {
        if set.is_empty() {
            return Err(Error::schema_conflict(d.table, "empty unique constraint"));
        }
        for col in *set {
            has_column(col, "unique constraint")?;
        }
    }
    if let Some(flag) = d.soft_delete {
        has_column(flag, "soft-delete flag")?;
    }

    let mut names = HashSet::new();
    for rel in d.relationships {
        check_identifier(d.table, "relationship", rel.name)?;
        check_identifier(d.table, "table", rel.related_table)?;
        if !names.insert(rel.name) {
            return Err(Error::schema_conflict(
                d.table,
                format!("relationship '{}' declared twice", rel.name),
            ));
        }
        validate_relationship(d, rel, &has_column)?;
    }
    Ok(())
}

fn validate_relationship(
    d: &EntityDescriptor,
    rel: &RelationshipInfo,
    has_column: &dyn Fn(&str, &str) -> Result<()>,
) -> Result<()> {
    let missing = |what: &str| {
        Error::schema_conflict(
            d.table,
            format!("relationship '{}' has no {}", rel.name, what),
        )
    };
    match rel.kind {
        RelationshipKind::ManyToOne => {
            let local = rel.local_key.ok_or_else(|| missing("local key"))?;
            has_column(local, "relationship")
        }
        RelationshipKind::OneToMany => {
            let remote = rel.remote_key.ok_or_else(|| missing("remote key"))?;
            check_identifier(d.table, "column", remote)?;
            if d.primary_key.len() == 1 {
                Ok(())
            } else {
                Err(Error::schema_conflict(
                    d.table,
                    format!("one-to-many '{}' needs a single-column key", rel.name),
                ))
            }
        }
        RelationshipKind::ManyToMany => {
            let link = rel.link_table.ok_or_else(|| missing("join entity"))?;
            check_identifier(d.table, "table", link.table_name)?;
            check_identifier(d.table, "column", link.local_column)?;
            check_identifier(d.table, "column", link.remote_column)?;
            if d.primary_key.len() == 1 {
                Ok(())
            } else {
                Err(Error::schema_conflict(
                    d.table,
                    format!("many-to-many '{}' needs a single-column key", rel.name),
                ))
            }
        }
    }
}
