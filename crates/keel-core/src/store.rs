//! The store capability the engine writes through.
//!
//! A [`Store`] is a single connection-like handle. The engine never assumes
//! a wire protocol: it hands over SQL text with positional placeholders
//! (`$1`, `$2`, ...) and a parameter slice, and reads back [`Row`]s.
//!
//! A unit of work owns its store exclusively for its whole lifetime, so
//! implementations need no transaction bookkeeping beyond what the backing
//! database provides.

use crate::error::{Error, QueryErrorKind, Result};
use crate::identifiers::quote_ident;
use crate::row::Row;
use crate::value::Value;
use std::future::Future;

/// A connection to a relational store.
///
/// All futures are `Send` so units of work can run on a multi-threaded
/// runtime. Dropping a returned future before it resolves must leave the
/// store usable.
pub trait Store: Send + Sync {
    /// Execute a query and return every row.
    fn query(&self, sql: &str, params: &[Value]) -> impl Future<Output = Result<Vec<Row>>> + Send;

    /// Execute a statement and return the number of affected rows.
    fn execute(&self, sql: &str, params: &[Value]) -> impl Future<Output = Result<u64>> + Send;

    fn begin_transaction(&self) -> impl Future<Output = Result<()>> + Send;

    fn commit(&self) -> impl Future<Output = Result<()>> + Send;

    fn rollback(&self) -> impl Future<Output = Result<()>> + Send;

    /// The key generated by the most recent insert on this store.
    fn last_generated_key(&self) -> impl Future<Output = Result<i64>> + Send;

    /// Execute an INSERT and return the generated key.
    fn insert(&self, sql: &str, params: &[Value]) -> impl Future<Output = Result<i64>> + Send {
        async move {
            self.execute(sql, params).await?;
            self.last_generated_key().await
        }
    }

    /// Most parameters a single statement may bind.
    ///
    /// Batched lookups with more keys than this switch to inline literals.
    fn max_params(&self) -> usize {
        usize::MAX
    }

    /// Check whether a table exists.
    ///
    /// The default checks the table with a query that returns no rows and
    /// treats a `NotFound` failure as absence.
    fn table_exists(&self, table: &str) -> impl Future<Output = Result<bool>> + Send {
        async move {
            let sql = format!("SELECT 1 FROM {} WHERE 1 = 0", quote_ident(table));
            match self.query(&sql, &[]).await {
                Ok(_) => Ok(true),
                Err(Error::Query(e)) if e.kind == QueryErrorKind::NotFound => Ok(false),
                Err(e) => Err(e),
            }
        }
    }
}

/// Build `$start, $start+1, ...` placeholders for `count` parameters.
pub fn placeholders(start: usize, count: usize) -> String {
    (start..start + count)
        .map(|i| format!("${}", i))
        .collect::<Vec<_>>()
        .join(", ")
}
