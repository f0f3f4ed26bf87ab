//! SQLite store for Keel.
//!
//! This crate implements the [`Store`](keel_core::Store) capability on top
//! of libsqlite3 (compiled from the bundled amalgamation), so units of work
//! can persist to an in-memory or file-backed SQLite database.
//!
//! # Features
//!
//! - `$n` placeholders bound by name, `?` placeholders bound by position
//! - Store transactions with `BEGIN IMMEDIATE`
//! - Foreign key enforcement switched on at open
//! - Constraint failures mapped to the engine's error taxonomy
//!
//! # Example
//!
//! ```rust,ignore
//! use keel_sqlite::{SqliteConfig, SqliteStore};
//!
//! let store = SqliteStore::open(&SqliteConfig::file("cars.db").busy_timeout(2_000))?;
//! store.execute_raw("CREATE TABLE dealers (id INTEGER PRIMARY KEY, name TEXT)")?;
//! let mut uow = UnitOfWork::new(store, registry);
//! ```
//!
//! # Type Mapping
//!
//! | `Value` | SQLite storage class |
//! |---------|----------------------|
//! | `Bool` | INTEGER (0/1) |
//! | `Int`, `BigInt`, `Timestamp` | INTEGER |
//! | `Double` | REAL |
//! | `Text`, `Decimal`, `Json` | TEXT |
//! | `Bytes` | BLOB |
//!
//! # Thread Safety
//!
//! `SqliteStore` is `Send` and `Sync`; every call goes through an internal
//! mutex guarding the database handle.

// FFI calls into libsqlite3 require unsafe code.
#![allow(unsafe_code)]

pub mod connection;
pub mod types;

pub use connection::{OpenFlags, SqliteConfig, SqliteStore};

use libsqlite3_sys as ffi;

/// Version string of the linked SQLite library.
pub fn sqlite_version() -> &'static str {
    // SAFETY: sqlite3_libversion returns a static, NUL-terminated string
    unsafe {
        let ptr = ffi::sqlite3_libversion();
        std::ffi::CStr::from_ptr(ptr).to_str().unwrap_or("unknown")
    }
}

/// Version number of the linked SQLite library (`3XXYYZZ`).
pub fn sqlite_version_number() -> i32 {
    // SAFETY: always safe to call
    unsafe { ffi::sqlite3_libversion_number() }
}
