//! Caller-owned database handle.
//!
//! Every engine operation receives an explicit [`Database`] instead of
//! reaching for shared state. The handle owns one connection and the retry
//! policy used for every mutating statement issued through it; the
//! connection is closed when the handle is dropped.
//!
//! # Example
//!
//! ```no_run
//! use relforge_sqlite::Database;
//!
//! let db = Database::open("project.db").unwrap();
//! for table in db.tables().unwrap() {
//!     println!("{table}");
//! }
//! ```

use std::path::{Path, PathBuf};

use relforge_core::RetryConfig;
use rusqlite::{Connection, OpenFlags, Transaction};

use crate::error::Result;
use crate::introspect;
use crate::retry::RetryingExecutor;

/// An open SQLite database plus the retry policy used to write to it.
///
/// Foreign-key enforcement is switched off on every handle: rebuilds drop
/// and recreate tables other tables may reference, and declared constraints
/// are only checked when the caller enables them again.
///
/// # Examples
///
/// ```
/// use relforge_sqlite::Database;
///
/// let db = Database::open_in_memory().unwrap();
/// db.connection()
///     .execute_batch("CREATE TABLE orders (id INTEGER, total REAL);")
///     .unwrap();
/// assert_eq!(db.tables().unwrap(), vec!["orders".to_string()]);
/// ```
pub struct Database {
    conn: Connection,
    path: Option<PathBuf>,
    executor: RetryingExecutor,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.path)
            .field("retry", self.executor.policy())
            .finish()
    }
}

impl Database {
    /// Opens (or creates) the database file at `path` with the default
    /// retry policy.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(path, RetryConfig::default())
    }

    /// Opens (or creates) the database file at `path`.
    pub fn open_with(path: impl AsRef<Path>, retry: RetryConfig) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        let mut db = Self::from_connection(conn, retry)?;
        db.path = Some(path.to_path_buf());
        Ok(db)
    }

    /// Opens an existing database file without write access.
    ///
    /// Used by read-only operations such as relation discovery.
    pub fn open_read_only(path: impl AsRef<Path>, retry: RetryConfig) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_URI,
        )?;
        let mut db = Self::from_connection(conn, retry)?;
        db.path = Some(path.to_path_buf());
        Ok(db)
    }

    /// Opens a private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?, RetryConfig::default())
    }

    /// Wraps an already-open connection.
    pub fn from_connection(conn: Connection, retry: RetryConfig) -> Result<Self> {
        // Rebuilds drop a table and rename its replacement into place; the
        // legacy rename skips re-validating views against the dropped name.
        conn.execute_batch("PRAGMA foreign_keys = OFF; PRAGMA legacy_alter_table = ON;")?;
        Ok(Self {
            conn,
            path: None,
            executor: RetryingExecutor::new(retry),
        })
    }

    /// Returns a reference to the underlying connection.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Consumes the handle and returns the underlying connection.
    pub fn into_connection(self) -> Connection {
        self.conn
    }

    /// File the handle was opened from, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// The retrying executor used for every mutating statement.
    pub fn executor(&self) -> &RetryingExecutor {
        &self.executor
    }

    /// Opens a transaction; it rolls back unless committed via [`commit`](Self::commit).
    pub fn begin(&self) -> Result<Transaction<'_>> {
        self.executor.begin(&self.conn)
    }

    /// Commits a transaction opened with [`begin`](Self::begin).
    pub fn commit(&self, tx: Transaction<'_>) -> Result<()> {
        self.executor.commit(tx)
    }

    /// Executes one statement through the retrying executor.
    pub fn execute<P>(&self, sql: &str, params: P) -> Result<usize>
    where
        P: rusqlite::Params + Clone,
    {
        self.executor.execute(&self.conn, sql, params)
    }

    /// Lists user tables (shorthand for [`introspect::list_tables`]).
    pub fn tables(&self) -> Result<Vec<String>> {
        introspect::list_tables(&self.conn)
    }

    /// Checks whether `table` exists, ignoring case.
    pub fn has_table(&self, table: &str) -> Result<bool> {
        introspect::table_exists(&self.conn, table)
    }

    /// Short label for log messages and origin annotations: the file stem,
    /// or `memory` for in-memory databases.
    pub fn label(&self) -> String {
        self.path
            .as_deref()
            .and_then(Path::file_stem)
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "memory".to_string())
    }
}
