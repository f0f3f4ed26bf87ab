//! Field and column definitions.

use crate::error::{ValidationError, ValidationErrorKind};
use crate::types::SqlType;
use crate::value::Value;

/// Referential action for foreign key constraints (ON DELETE).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReferentialAction {
    /// Raise an error if any references exist.
    #[default]
    NoAction,
    Restrict,
    Cascade,
    SetNull,
}

impl ReferentialAction {
    pub const fn as_sql(&self) -> &'static str {
        match self {
            ReferentialAction::NoAction => "NO ACTION",
            ReferentialAction::Restrict => "RESTRICT",
            ReferentialAction::Cascade => "CASCADE",
            ReferentialAction::SetNull => "SET NULL",
        }
    }
}

/// Metadata about an entity field.
///
/// Built with `const` builder methods so descriptors can live in statics:
///
/// ```
/// use keel_core::{FieldInfo, SqlType};
///
/// const DEALER_ID: FieldInfo = FieldInfo::new("dealer_id", SqlType::BigInt)
///     .nullable(true)
///     .foreign_key("dealers.id");
/// assert_eq!(DEALER_ID.references(), Some(("dealers", "id")));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldInfo {
    /// Column name
    pub name: &'static str,
    pub sql_type: SqlType,
    pub nullable: bool,
    pub primary_key: bool,
    /// Key generated by the store on insert
    pub auto_increment: bool,
    /// Single-column unique constraint
    pub unique: bool,
    /// Default value expression (SQL)
    pub default: Option<&'static str>,
    /// Foreign key reference (`table.column`)
    pub foreign_key: Option<&'static str>,
    pub on_delete: Option<ReferentialAction>,
    /// Maximum length in characters for text values
    pub max_length: Option<usize>,
    /// Inclusive numeric range
    pub range: Option<(i64, i64)>,
}

impl FieldInfo {
    pub const fn new(name: &'static str, sql_type: SqlType) -> Self {
        Self {
            name,
            sql_type,
            nullable: false,
            primary_key: false,
            auto_increment: false,
            unique: false,
            default: None,
            foreign_key: None,
            on_delete: None,
            max_length: None,
            range: None,
        }
    }

    pub const fn nullable(mut self, value: bool) -> Self {
        self.nullable = value;
        self
    }

    pub const fn primary_key(mut self, value: bool) -> Self {
        self.primary_key = value;
        self
    }

    pub const fn auto_increment(mut self, value: bool) -> Self {
        self.auto_increment = value;
        self
    }

    pub const fn unique(mut self, value: bool) -> Self {
        self.unique = value;
        self
    }

    pub const fn default(mut self, expr: &'static str) -> Self {
        self.default = Some(expr);
        self
    }

    pub const fn foreign_key(mut self, reference: &'static str) -> Self {
        self.foreign_key = Some(reference);
        self
    }

    pub const fn on_delete(mut self, action: ReferentialAction) -> Self {
        self.on_delete = Some(action);
        self
    }

    pub const fn max_length(mut self, len: usize) -> Self {
        self.max_length = Some(len);
        self
    }

    pub const fn range(mut self, min: i64, max: i64) -> Self {
        self.range = Some((min, max));
        self
    }

    /// Split the foreign key reference into `(table, column)`.
    pub fn references(&self) -> Option<(&'static str, &'static str)> {
        self.foreign_key.and_then(|fk| fk.split_once('.'))
    }

    /// Check a value against this field's constraints, collecting failures.
    pub fn validate_into(&self, value: &Value, errors: &mut ValidationError) {
        if value.is_null() {
            if !self.nullable && !self.auto_increment {
                errors.add(self.name, ValidationErrorKind::Required, "is required");
            }
            return;
        }

        if let (Some(max), Some(s)) = (self.max_length, value.as_str()) {
            let len = s.chars().count();
            if len > max {
                errors.add(
                    self.name,
                    ValidationErrorKind::MaxLength,
                    format!("length {} exceeds maximum of {}", len, max),
                );
            }
        }

        if let Some((min, max)) = self.range {
            if let Some(n) = value.as_i64() {
                if n < min {
                    errors.add(
                        self.name,
                        ValidationErrorKind::Min,
                        format!("must be at least {}", min),
                    );
                } else if n > max {
                    errors.add(
                        self.name,
                        ValidationErrorKind::Max,
                        format!("must be at most {}", max),
                    );
                }
            }
        }
    }
}
