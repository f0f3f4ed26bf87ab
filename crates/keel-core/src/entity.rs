//! Entity trait and declarative descriptors.
//!
//! An [`Entity`] is a plain Rust struct mapped to one table. Its shape is
//! described by an [`EntityDescriptor`] made entirely of `'static` data, so
//! descriptors are cheap to copy and can be compared to detect conflicting
//! registrations.

use crate::error::{Result, ValidationError};
use crate::field::FieldInfo;
use crate::relationship::{RelationshipInfo, find_relationship};
use crate::row::Row;
use crate::value::Value;

/// Declarative description of an entity's table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityDescriptor {
    pub table: &'static str,
    pub fields: &'static [FieldInfo],
    pub primary_key: &'static [&'static str],
    /// Multi-column unique constraints, e.g. `&[&["make", "model"]]`.
    pub unique: &'static [&'static [&'static str]],
    pub relationships: &'static [RelationshipInfo],
    /// Boolean column toggled by soft deletes.
    pub soft_delete: Option<&'static str>,
}

impl EntityDescriptor {
    pub fn field(&self, name: &str) -> Option<&'static FieldInfo> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn column_names(&self) -> Vec<&'static str> {
        self.fields.iter().map(|f| f.name).collect()
    }

    /// The single auto-increment key column, if the store generates keys.
    pub fn generated_key(&self) -> Option<&'static FieldInfo> {
        match self.primary_key {
            [only] => self.field(only).filter(|f| f.auto_increment),
            _ => None,
        }
    }

    /// Every unique column set: declared constraints plus `unique` fields.
    pub fn unique_sets(&self) -> Vec<Vec<&'static str>> {
        let mut sets: Vec<Vec<&'static str>> =
            self.unique.iter().map(|cols| cols.to_vec()).collect();
        sets.extend(
            self.fields
                .iter()
                .filter(|f| f.unique && !f.primary_key)
                .map(|f| vec![f.name]),
        );
        sets
    }

    pub fn relationship(&self, name: &str) -> Option<&'static RelationshipInfo> {
        find_relationship(self.relationships, name)
    }

    /// Fields carrying a foreign key, with the referenced `(table, column)`.
    pub fn foreign_keys(
        &self,
    ) -> impl Iterator<Item = (&'static FieldInfo, &'static str, &'static str)> {
        self.fields
            .iter()
            .filter_map(|f| f.references().map(|(table, column)| (f, table, column)))
    }

    /// Validate a row of values against the field constraints.
    pub fn validate(&self, values: &[(&'static str, Value)]) -> Result<()> {
        let mut errors = ValidationError::new(self.table);
        for (column, value) in values {
            if let Some(field) = self.field(column) {
                field.validate_into(value, &mut errors);
            }
        }
        errors.into_result()
    }
}

/// A Rust type persisted as one row of one table.
///
/// # Example
///
/// ```
/// use keel_core::{Entity, FieldInfo, Result, Row, SqlType, Value};
///
/// #[derive(Debug, Clone, PartialEq)]
/// struct Dealer {
///     id: Option<i64>,
///     name: String,
/// }
///
/// impl Entity for Dealer {
///     const TABLE_NAME: &'static str = "dealers";
///     const PRIMARY_KEY: &'static [&'static str] = &["id"];
///
///     fn fields() -> &'static [FieldInfo] {
///         const FIELDS: &[FieldInfo] = &[
///             FieldInfo::new("id", SqlType::BigInt).primary_key(true).auto_increment(true),
///             FieldInfo::new("name", SqlType::VarChar(100)).max_length(100),
///         ];
///         FIELDS
///     }
///
///     fn to_row(&self) -> Vec<(&'static str, Value)> {
///         vec![("id", self.id.into()), ("name", self.name.clone().into())]
///     }
///
///     fn from_row(row: &Row) -> Result<Self> {
///         Ok(Self { id: row.get_named("id")?, name: row.get_named("name")? })
///     }
/// }
///
/// let dealer = Dealer { id: Some(1), name: "BestCars".into() };
/// assert_eq!(dealer.primary_key_value(), vec![Value::BigInt(1)]);
/// ```
pub trait Entity: Sized + Send + Sync + 'static {
    const TABLE_NAME: &'static str;
    const PRIMARY_KEY: &'static [&'static str];
    const UNIQUE: &'static [&'static [&'static str]] = &[];
    const RELATIONSHIPS: &'static [RelationshipInfo] = &[];
    const SOFT_DELETE: Option<&'static str> = None;

    fn fields() -> &'static [FieldInfo];

    /// Current field values as `(column, value)` pairs.
    fn to_row(&self) -> Vec<(&'static str, Value)>;

    /// Build an instance from a row carrying at least every declared column.
    fn from_row(row: &Row) -> Result<Self>;

    fn descriptor() -> EntityDescriptor {
        EntityDescriptor {
            table: Self::TABLE_NAME,
            fields: Self::fields(),
            primary_key: Self::PRIMARY_KEY,
            unique: Self::UNIQUE,
            relationships: Self::RELATIONSHIPS,
            soft_delete: Self::SOFT_DELETE,
        }
    }

    /// Primary key values in `PRIMARY_KEY` order.
    fn primary_key_value(&self) -> Vec<Value> {
        let row = self.to_row();
        Self::PRIMARY_KEY
            .iter()
            .map(|pk| {
                row.iter()
                    .find(|(name, _)| name == pk)
                    .map_or(Value::Null, |(_, v)| v.clone())
            })
            .collect()
    }
}
