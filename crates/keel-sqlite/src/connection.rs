//! SQLite store implementation.
//!
//! Safe wrappers around the SQLite C API implementing the
//! [`Store`] trait from keel-core. All statements run synchronously under
//! an internal mutex; the async methods complete without yielding.

// Casts and raw pointers mirror the C API exactly.
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_lossless)]
#![allow(clippy::borrow_as_ptr)]
#![allow(clippy::if_not_else)]

use crate::types;
use keel_core::{
    ColumnInfo, ConnectionError, ConnectionErrorKind, Error, QueryError, QueryErrorKind, Result,
    Row, Store, Value,
};
// libsqlite3-sys's pregenerated bundled bindings omit `sqlite3_close_v2`;
// the bundled amalgamation still compiles it, so declare the symbol here.
mod ffi {
    pub use libsqlite3_sys::*;

    unsafe extern "C" {
        pub fn sqlite3_close_v2(db: *mut sqlite3) -> std::ffi::c_int;
    }
}
use std::ffi::{CStr, CString, c_int};
use std::ptr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Configuration for opening a SQLite store.
#[derive(Debug, Clone)]
pub struct SqliteConfig {
    /// Path to the database file, or `":memory:"`.
    pub path: String,
    pub flags: OpenFlags,
    /// How long to wait for another writer's lock, in milliseconds.
    pub busy_timeout_ms: u32,
    /// Run `PRAGMA foreign_keys = ON` after opening.
    pub foreign_keys: bool,
}

/// Flags controlling how the database is opened.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenFlags {
    pub read_only: bool,
    pub read_write: bool,
    /// Create the database file if it does not exist.
    pub create: bool,
    /// Interpret the path as a `file:` URI.
    pub uri: bool,
}

impl OpenFlags {
    pub fn read_only() -> Self {
        Self {
            read_only: true,
            ..Default::default()
        }
    }

    /// Read-write access; the database must exist.
    pub fn read_write() -> Self {
        Self {
            read_write: true,
            ..Default::default()
        }
    }

    pub fn create_read_write() -> Self {
        Self {
            read_write: true,
            create: true,
            ..Default::default()
        }
    }

    fn to_sqlite_flags(self) -> c_int {
        let mut flags = 0;
        if self.read_only {
            flags |= ffi::SQLITE_OPEN_READONLY;
        }
        if self.read_write {
            flags |= ffi::SQLITE_OPEN_READWRITE;
        }
        if self.create {
            flags |= ffi::SQLITE_OPEN_CREATE;
        }
        if self.uri {
            flags |= ffi::SQLITE_OPEN_URI;
        }
        if flags & (ffi::SQLITE_OPEN_READONLY | ffi::SQLITE_OPEN_READWRITE) == 0 {
            flags |= ffi::SQLITE_OPEN_READWRITE | ffi::SQLITE_OPEN_CREATE;
        }
        // The store serializes access itself.
        flags | ffi::SQLITE_OPEN_NOMUTEX
    }
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            path: ":memory:".to_string(),
            flags: OpenFlags::create_read_write(),
            busy_timeout_ms: 5000,
            foreign_keys: true,
        }
    }
}

impl SqliteConfig {
    pub fn file(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn memory() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn flags(mut self, flags: OpenFlags) -> Self {
        self.flags = flags;
        self
    }

    #[must_use]
    pub fn busy_timeout(mut self, ms: u32) -> Self {
        self.busy_timeout_ms = ms;
        self
    }

    #[must_use]
    pub fn foreign_keys(mut self, enabled: bool) -> Self {
        self.foreign_keys = enabled;
        self
    }
}

struct SqliteInner {
    db: *mut ffi::sqlite3,
    in_transaction: bool,
}

// SAFETY: the handle is opened in multi-thread mode and only ever used
// while holding the store's mutex.
unsafe impl Send for SqliteInner {}

/// A [`Store`] backed by one SQLite database handle.
pub struct SqliteStore {
    inner: Mutex<SqliteInner>,
    path: String,
}

// SAFETY: every access to the handle goes through the mutex.
unsafe impl Send for SqliteStore {}
unsafe impl Sync for SqliteStore {}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("path", &self.path)
            .field("in_transaction", &self.in_transaction())
            .finish()
    }
}

fn connect_error(message: String) -> Error {
    Error::StoreUnavailable(ConnectionError {
        kind: ConnectionErrorKind::Connect,
        message,
        source: None,
    })
}

impl SqliteStore {
    /// Open a store with the given configuration.
    #[tracing::instrument(level = "debug", skip(config), fields(path = %config.path))]
    pub fn open(config: &SqliteConfig) -> Result<Self> {
        let c_path = CString::new(config.path.as_str())
            .map_err(|_| connect_error("Invalid path: contains null byte".to_string()))?;

        let mut db: *mut ffi::sqlite3 = ptr::null_mut();
        let flags = config.flags.to_sqlite_flags();

        // SAFETY: valid pointers; the return code is checked
        let rc = unsafe { ffi::sqlite3_open_v2(c_path.as_ptr(), &mut db, flags, ptr::null()) };

        if rc != ffi::SQLITE_OK {
            let msg = if !db.is_null() {
                // SAFETY: db is a valid (failed) handle that must still be closed
                unsafe {
                    let msg = errmsg(db);
                    ffi::sqlite3_close(db);
                    msg
                }
            } else {
                error_string(rc)
            };
            tracing::error!(error = %msg, "Failed to open SQLite database");
            return Err(connect_error(format!("Failed to open database: {}", msg)));
        }

        if config.busy_timeout_ms > 0 {
            // SAFETY: db is valid
            unsafe {
                ffi::sqlite3_busy_timeout(db, config.busy_timeout_ms as c_int);
            }
        }

        let store = Self {
            inner: Mutex::new(SqliteInner {
                db,
                in_transaction: false,
            }),
            path: config.path.clone(),
        };
        if config.foreign_keys {
            store.execute_raw("PRAGMA foreign_keys = ON")?;
        }
        tracing::debug!("SQLite store opened");
        Ok(store)
    }

    pub fn open_memory() -> Result<Self> {
        Self::open(&SqliteConfig::memory())
    }

    pub fn open_file(path: impl Into<String>) -> Result<Self> {
        Self::open(&SqliteConfig::file(path))
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, SqliteInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether a store transaction is open.
    pub fn in_transaction(&self) -> bool {
        self.lock().in_transaction
    }

    /// Execute one or more statements without parameters (DDL, pragmas).
    pub fn execute_raw(&self, sql: &str) -> Result<()> {
        let inner = self.lock();
        exec(inner.db, sql)
    }

    pub fn last_insert_rowid(&self) -> i64 {
        let inner = self.lock();
        // SAFETY: db is valid
        unsafe { ffi::sqlite3_last_insert_rowid(inner.db) }
    }

    /// Rows changed by the most recent statement.
    pub fn changes(&self) -> u64 {
        let inner = self.lock();
        // SAFETY: db is valid
        unsafe { ffi::sqlite3_changes(inner.db) as u64 }
    }

    /// The connection's `SQLITE_LIMIT_VARIABLE_NUMBER`.
    pub fn variable_limit(&self) -> usize {
        let inner = self.lock();
        // SAFETY: db is valid; a negative value reads the limit without changing it
        let limit =
            unsafe { ffi::sqlite3_limit(inner.db, ffi::SQLITE_LIMIT_VARIABLE_NUMBER, -1) };
        usize::try_from(limit).unwrap_or(0)
    }

    fn query_sync(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        let inner = self.lock();
        let stmt = Statement::prepare(inner.db, sql)?;
        stmt.bind(params)?;

        // SAFETY: stmt is valid
        let col_count = unsafe { ffi::sqlite3_column_count(stmt.raw) };
        let names = (0..col_count)
            // SAFETY: stmt is valid and i is in range
            .map(|i| unsafe { types::column_name(stmt.raw, i) }.unwrap_or_else(|| format!("col{}", i)))
            .collect();
        let columns = Arc::new(ColumnInfo::new(names));

        let mut rows = Vec::new();
        loop {
            // SAFETY: stmt is valid
            match unsafe { ffi::sqlite3_step(stmt.raw) } {
                ffi::SQLITE_ROW => {
                    let values = (0..col_count)
                        // SAFETY: the statement just returned a row
                        .map(|i| unsafe { types::read_column(stmt.raw, i) })
                        .collect();
                    rows.push(Row::with_columns(Arc::clone(&columns), values));
                }
                ffi::SQLITE_DONE => break,
                _ => return Err(step_error(inner.db, sql)),
            }
        }
        tracing::trace!(sql, rows = rows.len(), "Query finished");
        Ok(rows)
    }

    fn execute_locked(inner: &SqliteInner, sql: &str, params: &[Value]) -> Result<u64> {
        let stmt = Statement::prepare(inner.db, sql)?;
        stmt.bind(params)?;
        // SAFETY: stmt is valid
        match unsafe { ffi::sqlite3_step(stmt.raw) } {
            ffi::SQLITE_DONE | ffi::SQLITE_ROW => {
                // SAFETY: db is valid
                let changes = unsafe { ffi::sqlite3_changes(inner.db) } as u64;
                tracing::trace!(sql, changes, "Statement finished");
                Ok(changes)
            }
            _ => Err(step_error(inner.db, sql)),
        }
    }

    fn execute_sync(&self, sql: &str, params: &[Value]) -> Result<u64> {
        let inner = self.lock();
        Self::execute_locked(&inner, sql, params)
    }

    /// Execute an INSERT and read the rowid under the same lock.
    fn insert_sync(&self, sql: &str, params: &[Value]) -> Result<i64> {
        let inner = self.lock();
        Self::execute_locked(&inner, sql, params)?;
        // SAFETY: db is valid
        Ok(unsafe { ffi::sqlite3_last_insert_rowid(inner.db) })
    }

    fn begin_sync(&self) -> Result<()> {
        let mut inner = self.lock();
        if inner.in_transaction {
            return Err(Error::query(QueryErrorKind::Database, "Already in a transaction"));
        }
        exec(inner.db, "BEGIN IMMEDIATE")?;
        inner.in_transaction = true;
        tracing::trace!("BEGIN");
        Ok(())
    }

    fn commit_sync(&self) -> Result<()> {
        let mut inner = self.lock();
        if !inner.in_transaction {
            return Err(Error::query(QueryErrorKind::Database, "Not in a transaction"));
        }
        exec(inner.db, "COMMIT")?;
        inner.in_transaction = false;
        tracing::trace!("COMMIT");
        Ok(())
    }

    fn rollback_sync(&self) -> Result<()> {
        let mut inner = self.lock();
        if !inner.in_transaction {
            return Err(Error::query(QueryErrorKind::Database, "Not in a transaction"));
        }
        inner.in_transaction = false;
        // SAFETY: db is valid
        if unsafe { ffi::sqlite3_get_autocommit(inner.db) } != 0 {
            // SQLite already rolled the transaction back after an error.
            tracing::debug!("Transaction was already rolled back");
            return Ok(());
        }
        exec(inner.db, "ROLLBACK")?;
        tracing::trace!("ROLLBACK");
        Ok(())
    }

    fn table_exists_sync(&self, table: &str) -> Result<bool> {
        let rows = self.query_sync(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = $1",
            &[Value::Text(table.to_string())],
        )?;
        Ok(!rows.is_empty())
    }
}

impl Drop for SqliteStore {
    fn drop(&mut self) {
        let inner = self.lock();
        if !inner.db.is_null() {
            // SAFETY: db is valid and no statement outlives its call
            unsafe {
                ffi::sqlite3_close_v2(inner.db);
            }
        }
    }
}

impl Store for SqliteStore {
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        self.query_sync(sql, params)
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        self.execute_sync(sql, params)
    }

    async fn begin_transaction(&self) -> Result<()> {
        self.begin_sync()
    }

    async fn commit(&self) -> Result<()> {
        self.commit_sync()
    }

    async fn rollback(&self) -> Result<()> {
        self.rollback_sync()
    }

    async fn last_generated_key(&self) -> Result<i64> {
        Ok(self.last_insert_rowid())
    }

    async fn insert(&self, sql: &str, params: &[Value]) -> Result<i64> {
        self.insert_sync(sql, params)
    }

    async fn table_exists(&self, table: &str) -> Result<bool> {
        self.table_exists_sync(table)
    }

    fn max_params(&self) -> usize {
        self.variable_limit()
    }
}

/// A prepared statement, finalized on drop.
struct Statement {
    raw: *mut ffi::sqlite3_stmt,
    db: *mut ffi::sqlite3,
    sql: String,
}

impl Statement {
    fn prepare(db: *mut ffi::sqlite3, sql: &str) -> Result<Self> {
        let c_sql = CString::new(sql).map_err(|_| {
            Error::Query(
                QueryError::new(QueryErrorKind::Syntax, "SQL contains null byte").with_sql(sql),
            )
        })?;
        let mut raw: *mut ffi::sqlite3_stmt = ptr::null_mut();

        // SAFETY: all pointers are valid
        let rc = unsafe {
            ffi::sqlite3_prepare_v2(
                db,
                c_sql.as_ptr(),
                c_sql.as_bytes().len() as c_int,
                &mut raw,
                ptr::null_mut(),
            )
        };
        if rc != ffi::SQLITE_OK {
            return Err(step_error(db, sql));
        }
        Ok(Self {
            raw,
            db,
            sql: sql.to_string(),
        })
    }

    /// Bind `params[i]` to `$i+1`, or to the `i+1`th `?` when the statement
    /// has no `$` parameters.
    fn bind(&self, params: &[Value]) -> Result<()> {
        for (i, param) in params.iter().enumerate() {
            let name = CString::new(format!("${}", i + 1)).unwrap_or_default();
            // SAFETY: stmt is valid, name is NUL-terminated
            let named = unsafe { ffi::sqlite3_bind_parameter_index(self.raw, name.as_ptr()) };
            let index = if named > 0 { named } else { (i + 1) as c_int };
            // SAFETY: stmt is valid and index is 1-based
            let rc = unsafe { types::bind_value(self.raw, index, param) };
            if rc != ffi::SQLITE_OK {
                return Err(Error::Query(
                    QueryError::new(
                        QueryErrorKind::Database,
                        // SAFETY: db is valid
                        format!("Failed to bind parameter {}: {}", i + 1, unsafe {
                            errmsg(self.db)
                        }),
                    )
                    .with_sql(self.sql.as_str()),
                ));
            }
        }
        Ok(())
    }
}

impl Drop for Statement {
    fn drop(&mut self) {
        // SAFETY: raw came from sqlite3_prepare_v2 (finalizing NULL is a no-op)
        unsafe {
            ffi::sqlite3_finalize(self.raw);
        }
    }
}

fn exec(db: *mut ffi::sqlite3, sql: &str) -> Result<()> {
    let c_sql = CString::new(sql).map_err(|_| {
        Error::Query(QueryError::new(QueryErrorKind::Syntax, "SQL contains null byte").with_sql(sql))
    })?;
    let mut err: *mut std::ffi::c_char = ptr::null_mut();

    // SAFETY: all pointers are valid
    let rc = unsafe { ffi::sqlite3_exec(db, c_sql.as_ptr(), None, ptr::null_mut(), &mut err) };
    if rc != ffi::SQLITE_OK {
        if !err.is_null() {
            // SAFETY: err was allocated by SQLite
            unsafe { ffi::sqlite3_free(err.cast()) };
        }
        return Err(step_error(db, sql));
    }
    Ok(())
}

/// # Safety
/// `db` must be a valid handle.
unsafe fn errmsg(db: *mut ffi::sqlite3) -> String {
    // SAFETY: upheld by the caller
    unsafe {
        CStr::from_ptr(ffi::sqlite3_errmsg(db))
            .to_string_lossy()
            .into_owned()
    }
}

fn error_string(code: c_int) -> String {
    // SAFETY: sqlite3_errstr returns a static string
    unsafe {
        CStr::from_ptr(ffi::sqlite3_errstr(code))
            .to_string_lossy()
            .into_owned()
    }
}

fn step_error(db: *mut ffi::sqlite3, sql: &str) -> Error {
    // SAFETY: db is valid
    let (msg, code) = unsafe { (errmsg(db), ffi::sqlite3_extended_errcode(db)) };
    let kind = error_kind(code, &msg);
    tracing::debug!(code, kind = ?kind, error = %msg, "SQLite statement failed");
    Error::Query(QueryError::new(kind, msg).with_sql(sql))
}

fn error_kind(extended: c_int, message: &str) -> QueryErrorKind {
    match extended {
        ffi::SQLITE_CONSTRAINT_UNIQUE | ffi::SQLITE_CONSTRAINT_PRIMARYKEY => {
            return QueryErrorKind::UniqueViolation;
        }
        ffi::SQLITE_CONSTRAINT_FOREIGNKEY => return QueryErrorKind::ForeignKeyViolation,
        _ => {}
    }
    match extended & 0xff {
        ffi::SQLITE_CONSTRAINT => QueryErrorKind::Constraint,
        ffi::SQLITE_BUSY | ffi::SQLITE_LOCKED => QueryErrorKind::Busy,
        ffi::SQLITE_ERROR if message.starts_with("no such") => QueryErrorKind::NotFound,
        ffi::SQLITE_ERROR if message.contains("syntax error") => QueryErrorKind::Syntax,
        _ => QueryErrorKind::Database,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SqliteStore {
        let store = SqliteStore::open_memory().unwrap();
        store
            .execute_raw(
                "CREATE TABLE dealers (id INTEGER PRIMARY KEY, name TEXT NOT NULL UNIQUE);
                 CREATE TABLE cars (
                     id INTEGER PRIMARY KEY,
                     model TEXT NOT NULL,
                     dealer_id INTEGER REFERENCES dealers (id)
                 );",
            )
            .unwrap();
        store
    }

    #[test]
    fn open_memory() {
        let store = SqliteStore::open_memory().unwrap();
        assert_eq!(store.path(), ":memory:");
        assert!(!store.in_transaction());
    }

    #[test]
    fn variable_limit_is_reported() {
        let store = SqliteStore::open_memory().unwrap();
        assert!(store.variable_limit() >= 999);
        assert_eq!(store.max_params(), store.variable_limit());
    }

    #[test]
    fn dollar_placeholders_bind_by_number() {
        let store = store();
        store
            .execute_sync(
                "INSERT INTO dealers (name, id) VALUES ($2, $1)",
                &[Value::BigInt(7), Value::from("BestCars")],
            )
            .unwrap();
        let rows = store
            .query_sync("SELECT id, name FROM dealers WHERE name = $1", &[Value::from("BestCars")])
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get_named::<i64>("id").unwrap(), 7);
    }

    #[test]
    fn question_marks_bind_by_position() {
        let store = store();
        let id = store
            .insert_sync("INSERT INTO dealers (name) VALUES (?)", &[Value::from("A")])
            .unwrap();
        assert_eq!(id, 1);
        assert_eq!(store.changes(), 1);
    }

    #[test]
    fn null_round_trip() {
        let store = store();
        store
            .execute_sync(
                "INSERT INTO cars (model, dealer_id) VALUES ($1, $2)",
                &[Value::from("Camry"), Value::Null],
            )
            .unwrap();
        let rows = store.query_sync("SELECT dealer_id FROM cars", &[]).unwrap();
        assert_eq!(rows[0].get_named::<Option<i64>>("dealer_id").unwrap(), None);
    }

    #[test]
    fn constraint_failures_are_classified() {
        let store = store();
        store.execute_raw("INSERT INTO dealers (name) VALUES ('A')").unwrap();

        let dup = store
            .execute_sync("INSERT INTO dealers (name) VALUES ($1)", &[Value::from("A")])
            .unwrap_err();
        assert!(dup.is_unique_violation(), "{dup}");

        let orphan = store
            .execute_sync(
                "INSERT INTO cars (model, dealer_id) VALUES ($1, $2)",
                &[Value::from("Camry"), Value::BigInt(99)],
            )
            .unwrap_err();
        assert!(
            matches!(orphan, Error::Query(ref q) if q.kind == QueryErrorKind::ForeignKeyViolation),
            "{orphan}"
        );

        let missing = store.query_sync("SELECT * FROM nowhere", &[]).unwrap_err();
        assert!(matches!(missing, Error::Query(ref q) if q.kind == QueryErrorKind::NotFound));
    }

    #[test]
    fn transactions_commit_and_roll_back() {
        let store = store();
        store.begin_sync().unwrap();
        assert!(store.begin_sync().is_err());
        store.execute_raw("INSERT INTO dealers (name) VALUES ('A')").unwrap();
        store.rollback_sync().unwrap();
        assert!(store.query_sync("SELECT * FROM dealers", &[]).unwrap().is_empty());

        store.begin_sync().unwrap();
        store.execute_raw("INSERT INTO dealers (name) VALUES ('B')").unwrap();
        store.commit_sync().unwrap();
        assert_eq!(store.query_sync("SELECT * FROM dealers", &[]).unwrap().len(), 1);
        assert!(store.commit_sync().is_err());
    }

    #[test]
    fn table_lookup_uses_catalog() {
        let store = store();
        assert!(store.table_exists_sync("dealers").unwrap());
        assert!(!store.table_exists_sync("owners").unwrap());
    }

    #[test]
    fn value_types_survive() {
        let store = SqliteStore::open_memory().unwrap();
        store
            .execute_raw("CREATE TABLE t (b BOOLEAN, i INTEGER, f REAL, s TEXT, bl BLOB, j TEXT)")
            .unwrap();
        store
            .execute_sync(
                "INSERT INTO t VALUES ($1, $2, $3, $4, $5, $6)",
                &[
                    Value::Bool(true),
                    Value::BigInt(5_000_000_000),
                    Value::Double(2.5),
                    Value::from("hello"),
                    Value::Bytes(vec![1, 2, 3]),
                    Value::Json(serde_json::json!({"a": 1})),
                ],
            )
            .unwrap();
        let rows = store.query_sync("SELECT * FROM t", &[]).unwrap();
        let row = &rows[0];
        assert!(row.get_named::<bool>("b").unwrap());
        assert_eq!(row.get_by_name("i"), Some(&Value::BigInt(5_000_000_000)));
        assert_eq!(row.get_named::<f64>("f").unwrap(), 2.5);
        assert_eq!(row.get_named::<String>("s").unwrap(), "hello");
        assert_eq!(row.get_named::<Vec<u8>>("bl").unwrap(), vec![1, 2, 3]);
        assert_eq!(row.get_named::<String>("j").unwrap(), "{\"a\":1}");
    }

    #[test]
    fn read_only_open_rejects_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ro.db").to_string_lossy().into_owned();
        SqliteStore::open_file(path.clone())
            .unwrap()
            .execute_raw("CREATE TABLE t (id INTEGER)")
            .unwrap();

        let store =
            SqliteStore::open(&SqliteConfig::file(path).flags(OpenFlags::read_only())).unwrap();
        assert!(store.execute_raw("INSERT INTO t VALUES (1)").is_err());
    }
}
