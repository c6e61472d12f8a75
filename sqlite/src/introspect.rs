//! Live schema introspection.
//!
//! Reads table, column, foreign-key and index metadata straight from
//! `sqlite_master` and the table-valued pragmas. Nothing is cached: every
//! operation reads the schema fresh, so results always describe the file as
//! it is now.
//!
//! Table names are resolved case-insensitively, matching SQLite's own
//! identifier rules; functions taking a table name accept any spelling and
//! report metadata under the on-disk one.
//!
//! # Example
//!
//! ```no_run
//! use relforge_sqlite::introspect;
//! use rusqlite::Connection;
//!
//! let conn = Connection::open("project.db").unwrap();
//! for table in introspect::list_tables(&conn).unwrap() {
//!     let columns = introspect::table_columns(&conn, &table).unwrap();
//!     println!("{table}: {} columns", columns.len());
//! }
//! ```

use std::collections::HashSet;

use relforge_core::{ColumnInfo, ForeignKeyInfo, TableSummary, is_system_table};
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OptionalExtension, params};

use crate::error::{EngineError, Result};
use crate::schema::quote_ident;

/// Lists user tables sorted by name, excluding every `sqlite_*` table.
pub fn list_tables(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt =
        conn.prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(names
        .into_iter()
        .filter(|name| !is_system_table(name))
        .collect())
}

/// Returns the on-disk spelling of `table`, or `None` if no table matches
/// case-insensitively.
pub fn resolve_table(conn: &Connection, table: &str) -> Result<Option<String>> {
    let name = conn
        .query_row(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1 COLLATE NOCASE",
            params![table],
            |row| row.get::<_, String>(0),
        )
        .optional()?;
    Ok(name)
}

/// Checks whether `table` exists, ignoring case.
pub fn table_exists(conn: &Connection, table: &str) -> Result<bool> {
    Ok(resolve_table(conn, table)?.is_some())
}

/// Resolves `table` or fails with [`EngineError::SchemaRead`].
pub(crate) fn require_table(conn: &Connection, table: &str) -> Result<String> {
    resolve_table(conn, table)?
        .ok_or_else(|| EngineError::schema_read(table, "table does not exist"))
}

/// Reads the columns of `table` in ordinal order.
///
/// # Errors
///
/// Returns [`EngineError::SchemaRead`] if the table does not exist.
pub fn table_columns(conn: &Connection, table: &str) -> Result<Vec<ColumnInfo>> {
    let table = require_table(conn, table)?;
    let mut stmt = conn.prepare(
        "SELECT cid, name, type, \"notnull\", dflt_value, pk \
         FROM pragma_table_info(?1) ORDER BY cid",
    )?;
    let columns = stmt
        .query_map(params![table], |row| {
            Ok(ColumnInfo {
                position: row.get::<_, i64>(0)? as usize,
                name: row.get(1)?,
                declared_type: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                not_null: row.get::<_, i64>(3)? != 0,
                default_value: row.get(4)?,
                primary_key: row.get::<_, i64>(5)? as usize,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    if columns.is_empty() {
        return Err(EngineError::schema_read(&table, "table has no columns"));
    }
    Ok(columns)
}

/// Primary-key column names of `columns`, in key order.
pub fn primary_key_columns(columns: &[ColumnInfo]) -> Vec<String> {
    let mut keyed: Vec<&ColumnInfo> = columns.iter().filter(|c| c.is_primary_key()).collect();
    keyed.sort_by_key(|c| c.primary_key);
    keyed.into_iter().map(|c| c.name.clone()).collect()
}

/// Reads the declared foreign keys of `table`.
pub fn foreign_keys(conn: &Connection, table: &str) -> Result<Vec<ForeignKeyInfo>> {
    let table = require_table(conn, table)?;
    let mut stmt = conn.prepare(
        "SELECT \"from\", \"table\", \"to\" FROM pragma_foreign_key_list(?1) ORDER BY id, seq",
    )?;
    let keys = stmt
        .query_map(params![table], |row| {
            Ok(ForeignKeyInfo {
                column: row.get(0)?,
                target_table: row.get(1)?,
                target_column: row.get(2)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(keys)
}

/// Distinct non-null values of `table.column`, stringified with SQLite's
/// `CAST(.. AS TEXT)`.
///
/// The same cast is used by the rebuild's lookup subquery, so a value that
/// overlaps here is exactly a value the lookup will resolve. Bytes that are
/// not valid UTF-8 (blobs, mis-encoded text) are rendered as an `X'..'`
/// hex literal instead of failing the read.
pub fn distinct_non_null_values(
    conn: &Connection,
    table: &str,
    column: &str,
) -> Result<HashSet<String>> {
    let table = require_table(conn, table)?;
    let col = quote_ident(column);
    let sql = format!(
        "SELECT DISTINCT CAST({col} AS TEXT) FROM {} WHERE {col} IS NOT NULL",
        quote_ident(&table)
    );
    let mut stmt = conn.prepare(&sql)?;
    let values = stmt
        .query_map([], |row| Ok(value_text(row.get_ref(0)?)))?
        .collect::<std::result::Result<HashSet<_>, _>>()?;
    Ok(values)
}

/// Text form of a value read after `CAST(.. AS TEXT)`.
fn value_text(value: ValueRef<'_>) -> String {
    match value {
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => match std::str::from_utf8(bytes) {
            Ok(text) => text.to_string(),
            Err(_) => hex_literal(bytes),
        },
        ValueRef::Integer(n) => n.to_string(),
        ValueRef::Real(f) => f.to_string(),
        ValueRef::Null => String::new(),
    }
}

fn hex_literal(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2 + 3);
    out.push_str("X'");
    for b in bytes {
        out.push_str(&format!("{b:02X}"));
    }
    out.push('\'');
    out
}

/// Returns `true` if no two non-null values of `table.column` share a
/// textual form.
///
/// A lookup against a non-unique column would pick an arbitrary match, so
/// relation targets must pass this check.
pub fn column_is_unique(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    let table = require_table(conn, table)?;
    let col = quote_ident(column);
    let sql = format!(
        "SELECT COUNT({col}) = COUNT(DISTINCT CAST({col} AS TEXT)) FROM {}",
        quote_ident(&table)
    );
    let unique: bool = conn.query_row(&sql, [], |row| row.get(0))?;
    Ok(unique)
}

/// Returns `true` if every value of `table.column` is `NULL` or the empty
/// string.
pub fn column_is_empty(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    let table = require_table(conn, table)?;
    let col = quote_ident(column);
    let sql = format!(
        "SELECT NOT EXISTS (SELECT 1 FROM {} WHERE {col} IS NOT NULL AND CAST({col} AS TEXT) <> '')",
        quote_ident(&table)
    );
    let empty: bool = conn.query_row(&sql, [], |row| row.get(0))?;
    Ok(empty)
}

/// Counts the rows of `table`.
pub fn row_count(conn: &Connection, table: &str) -> Result<u64> {
    let table = require_table(conn, table)?;
    let count: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM {}", quote_ident(&table)),
        [],
        |row| row.get(0),
    )?;
    Ok(count as u64)
}

/// Name, row count and column count of every user table.
pub fn table_summaries(conn: &Connection) -> Result<Vec<TableSummary>> {
    list_tables(conn)?
        .into_iter()
        .map(|name| {
            let row_count = row_count(conn, &name)?;
            let column_count = table_columns(conn, &name)?.len();
            Ok(TableSummary {
                name,
                row_count,
                column_count,
            })
        })
        .collect()
}

/// The `CREATE TABLE` statement stored for `table`.
pub fn create_statement(conn: &Connection, table: &str) -> Result<String> {
    let sql: Option<String> = conn
        .query_row(
            "SELECT sql FROM sqlite_master WHERE type = 'table' AND name = ?1 COLLATE NOCASE",
            params![table],
            |row| row.get(0),
        )
        .optional()?
        .flatten();
    sql.ok_or_else(|| EngineError::schema_read(table, "no stored definition"))
}

/// Returns `true` if `table` was declared with an `AUTOINCREMENT` key.
pub fn uses_autoincrement(conn: &Connection, table: &str) -> Result<bool> {
    Ok(create_statement(conn, table)?
        .to_ascii_uppercase()
        .contains("AUTOINCREMENT"))
}

/// An index or trigger with its stored `CREATE` statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaObject {
    /// Object name.
    pub name: String,
    /// Stored `CREATE` statement.
    pub sql: String,
}

fn schema_objects(conn: &Connection, kind: &str, table: &str) -> Result<Vec<SchemaObject>> {
    let mut stmt = conn.prepare(
        "SELECT name, sql FROM sqlite_master \
         WHERE type = ?1 AND tbl_name = ?2 COLLATE NOCASE AND sql IS NOT NULL \
         ORDER BY name",
    )?;
    let objects = stmt
        .query_map(params![kind, table], |row| {
            Ok(SchemaObject {
                name: row.get(0)?,
                sql: row.get(1)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(objects)
}

/// Explicit indexes on `table`; automatic indexes backing `UNIQUE` and
/// `PRIMARY KEY` constraints have no stored SQL and are omitted (see
/// [`unique_constraints`]).
pub fn index_statements(conn: &Connection, table: &str) -> Result<Vec<SchemaObject>> {
    schema_objects(conn, "index", table)
}

/// Triggers attached to `table`.
pub fn trigger_statements(conn: &Connection, table: &str) -> Result<Vec<SchemaObject>> {
    schema_objects(conn, "trigger", table)
}

/// Column sets of the `UNIQUE` constraints declared in `table`'s
/// definition, column-level and table-level alike.
pub fn unique_constraints(conn: &Connection, table: &str) -> Result<Vec<Vec<String>>> {
    let table = require_table(conn, table)?;
    let mut list =
        conn.prepare("SELECT name FROM pragma_index_list(?1) WHERE origin = 'u' ORDER BY name")?;
    let names = list
        .query_map(params![table], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut info = conn.prepare("SELECT name FROM pragma_index_info(?1) ORDER BY seqno")?;
    let mut sets = Vec::with_capacity(names.len());
    for name in names {
        let columns = info
            .query_map(params![name], |row| row.get::<_, Option<String>>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        if let Some(columns) = columns.into_iter().collect::<Option<Vec<_>>>() {
            sets.push(columns);
        }
    }
    Ok(sets)
}

/// Returns `true` if `table` has generated columns, which
/// [`table_columns`] does not report.
pub fn has_generated_columns(conn: &Connection, table: &str) -> Result<bool> {
    let table = require_table(conn, table)?;
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM pragma_table_xinfo(?1) WHERE hidden IN (2, 3)",
        params![table],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}
