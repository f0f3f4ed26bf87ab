//! Error types for Keel operations.

use std::fmt;

/// The primary error type for all Keel operations.
#[derive(Debug)]
pub enum Error {
    /// An entity was registered twice with different shapes, or its
    /// descriptor is internally inconsistent.
    SchemaConflict { entity: String, reason: String },
    /// The entity type was never registered.
    UnknownEntity(String),
    /// The entity has no relationship with this name.
    UnknownRelationship { entity: String, relationship: String },
    /// Added entities form a cycle of required foreign keys.
    UnresolvableInsertOrder { cycle: Vec<String> },
    /// A unique key or composite key would be duplicated.
    UniqueConstraintViolation {
        entity: String,
        columns: Vec<String>,
        message: String,
    },
    /// The entity is not tracked by an open unit of work.
    DetachedEntity { entity: String, operation: String },
    /// The unit of work already committed or rolled back.
    UnitOfWorkClosed { state: &'static str },
    /// `begin` was called on a unit of work that is already open.
    TransactionAlreadyOpen,
    /// An operation needs an open unit of work and auto-begin is disabled.
    NotInTransaction,
    /// A migration step failed; earlier steps stay applied.
    MigrationFailed {
        version: i64,
        last_applied: Option<i64>,
        source: Box<Error>,
    },
    /// The store cannot be reached (transient)
    StoreUnavailable(ConnectionError),
    /// Statement execution errors
    Query(QueryError),
    /// Type conversion errors
    Type(TypeError),
    /// Field validation errors
    Validation(ValidationError),
    /// Custom error with message
    Custom(String),
}

#[derive(Debug)]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// Failed to open the store
    Connect,
    /// Connection lost during operation
    Disconnected,
    /// Timed out waiting for the store
    Timeout,
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub sql: Option<String>,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Syntax error in SQL
    Syntax,
    /// Unique or primary key violation
    UniqueViolation,
    /// Foreign key violation
    ForeignKeyViolation,
    /// Other constraint violation (NOT NULL, CHECK)
    Constraint,
    /// Table or column not found
    NotFound,
    /// Store is locked by another writer (retry may succeed)
    Busy,
    /// Other database error
    Database,
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
}

/// Validation errors collected for one entity.
#[derive(Debug, Clone, Default)]
pub struct ValidationError {
    pub entity: String,
    pub errors: Vec<FieldValidationError>,
}

/// A single validation error for a field.
#[derive(Debug, Clone)]
pub struct FieldValidationError {
    pub field: String,
    pub kind: ValidationErrorKind,
    pub message: String,
}

/// The type of validation constraint that was violated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationErrorKind {
    /// Value is below minimum
    Min,
    /// Value is above maximum
    Max,
    /// String is longer than maximum length
    MaxLength,
    /// Required field is missing/null
    Required,
}

impl ValidationError {
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            errors: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn add(&mut self, field: &str, kind: ValidationErrorKind, message: impl Into<String>) {
        self.errors.push(FieldValidationError {
            field: field.to_string(),
            kind,
            message: message.into(),
        });
    }

    /// Convert into `Err` if any errors were collected.
    pub fn into_result(self) -> Result<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(Error::Validation(self))
        }
    }
}

impl QueryError {
    pub fn new(kind: QueryErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            sql: None,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_sql(mut self, sql: impl Into<String>) -> Self {
        self.sql = Some(sql.into());
        self
    }

    pub fn is_unique_violation(&self) -> bool {
        self.kind == QueryErrorKind::UniqueViolation
    }
}

impl Error {
    /// Shorthand for a [`QueryError`] without SQL attached.
    pub fn query(kind: QueryErrorKind, message: impl Into<String>) -> Self {
        Error::Query(QueryError::new(kind, message))
    }

    pub fn schema_conflict(entity: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::SchemaConflict {
            entity: entity.into(),
            reason: reason.into(),
        }
    }

    /// Is this a transient error the caller may retry from a fresh unit of work?
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Query(q) => q.kind == QueryErrorKind::Busy,
            Error::StoreUnavailable(_) => true,
            _ => false,
        }
    }

    /// Is this a mistake in how the engine is being driven, rather than a
    /// property of the stored data?
    pub fn is_programming_error(&self) -> bool {
        matches!(
            self,
            Error::SchemaConflict { .. }
                | Error::UnknownEntity(_)
                | Error::UnknownRelationship { .. }
                | Error::UnresolvableInsertOrder { .. }
                | Error::DetachedEntity { .. }
                | Error::UnitOfWorkClosed { .. }
                | Error::TransactionAlreadyOpen
                | Error::NotInTransaction
        )
    }

    pub fn is_unique_violation(&self) -> bool {
        match self {
            Error::UniqueConstraintViolation { .. } => true,
            Error::Query(q) => q.is_unique_violation(),
            _ => false,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::SchemaConflict { entity, reason } => {
                write!(f, "Schema conflict for '{}': {}", entity, reason)
            }
            Error::UnknownEntity(name) => write!(f, "Unknown entity '{}'", name),
            Error::UnknownRelationship {
                entity,
                relationship,
            } => write!(f, "Entity '{}' has no relationship '{}'", entity, relationship),
            Error::UnresolvableInsertOrder { cycle } => write!(
                f,
                "Cannot order inserts: required foreign keys form a cycle ({})",
                cycle.join(" -> ")
            ),
            Error::UniqueConstraintViolation {
                entity,
                columns,
                message,
            } => {
                if columns.is_empty() {
                    write!(f, "Unique constraint violated on '{}': {}", entity, message)
                } else {
                    write!(
                        f,
                        "Unique constraint violated on '{}' ({}): {}",
                        entity,
                        columns.join(", "),
                        message
                    )
                }
            }
            Error::DetachedEntity { entity, operation } => write!(
                f,
                "Cannot {} '{}': entity is not tracked by an open unit of work",
                operation, entity
            ),
            Error::UnitOfWorkClosed { state } => {
                write!(f, "Unit of work is closed (state: {})", state)
            }
            Error::TransactionAlreadyOpen => write!(f, "A transaction is already open"),
            Error::NotInTransaction => write!(f, "No transaction is open"),
            Error::MigrationFailed {
                version,
                last_applied,
                source,
            } => match last_applied {
                Some(last) => write!(
                    f,
                    "Migration {} failed (last applied: {}): {}",
                    version, last, source
                ),
                None => write!(
                    f,
                    "Migration {} failed (none applied): {}",
                    version, source
                ),
            },
            Error::StoreUnavailable(e) => write!(f, "Store unavailable: {}", e.message),
            Error::Query(e) => write!(f, "Query error: {}", e.message),
            Error::Type(e) => {
                if let Some(col) = &e.column {
                    write!(
                        f,
                        "Type error in column '{}': expected {}, found {}",
                        col, e.expected, e.actual
                    )
                } else {
                    write!(f, "Type error: expected {}, found {}", e.expected, e.actual)
                }
            }
            Error::Validation(e) => write!(f, "Validation error: {}", e),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::MigrationFailed { source, .. } => Some(source.as_ref()),
            Error::StoreUnavailable(e) => e
                .source
                .as_ref()
                .map(|e| e.as_ref() as &(dyn std::error::Error + 'static)),
            Error::Query(e) => e
                .source
                .as_ref()
                .map(|e| e.as_ref() as &(dyn std::error::Error + 'static)),
            Error::Validation(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.errors.is_empty() {
            write!(f, "validation passed")
        } else if self.errors.len() == 1 {
            let err = &self.errors[0];
            write!(
                f,
                "{}.{}: {}",
                self.entity, err.field, err.message
            )
        } else {
            writeln!(f, "{} has {} invalid fields:", self.entity, self.errors.len())?;
            for err in &self.errors {
                writeln!(f, "  - {}: {}", err.field, err.message)?;
            }
            Ok(())
        }
    }
}

impl std::error::Error for ValidationError {}

impl From<QueryError> for Error {
    fn from(err: QueryError) -> Self {
        Error::Query(err)
    }
}

impl From<ValidationError> for Error {
    fn from(err: ValidationError) -> Self {
        Error::Validation(err)
    }
}

/// Result type alias for Keel operations.
pub type Result<T> = std::result::Result<T, Error>;
