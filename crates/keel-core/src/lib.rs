//! Core types and traits for Keel.
//!
//! This crate provides the vocabulary shared by every other Keel crate:
//!
//! - [`Entity`] and [`EntityDescriptor`] for declarative table mapping
//! - [`FieldInfo`] and [`RelationshipInfo`] for columns and navigation edges
//! - [`Store`], the capability units of work write through
//! - [`Value`] and [`Row`] for data exchanged with a store
//! - [`Error`], the engine-wide error taxonomy

pub mod entity;
pub mod error;
pub mod field;
pub mod identifiers;
pub mod relationship;
pub mod row;
pub mod store;
pub mod types;
pub mod value;

pub use entity::{Entity, EntityDescriptor};
pub use error::{
    ConnectionError, ConnectionErrorKind, Error, FieldValidationError, QueryError, QueryErrorKind,
    Result, TypeError, ValidationError, ValidationErrorKind,
};
pub use field::{FieldInfo, ReferentialAction};
pub use identifiers::{is_valid_identifier, quote_ident};
pub use relationship::{LinkTableInfo, RelationshipInfo, RelationshipKind, find_relationship};
pub use row::{ColumnInfo, FromValue, Row};
pub use store::{Store, placeholders};
pub use types::SqlType;
pub use value::Value;
