//! Row-level transfer between databases.
//!
//! Reads rows as dynamically typed [`Value`]s, rewrites the tracking column
//! through an [`IdMapping`], and inserts them into another connection. Used
//! by the merger, which copies between two separate files.
//!
//! # Internal API
//!
//! Everything here is `pub(crate)` except [`InsertMode`] and
//! [`InsertCounts`], which appear in merge reports.

use relforge_core::IdMapping;
use rusqlite::Connection;
use rusqlite::types::Value;
use serde::Serialize;

use crate::error::{EngineError, Result, is_constraint_error};
use crate::retry::RetryingExecutor;
use crate::schema::{quote_ident, quoted_list};

/// How rows are inserted into the destination table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertMode {
    /// Plain `INSERT`; a constraint violation aborts the copy.
    Plain,
    /// `INSERT OR IGNORE`; rows violating a constraint are skipped.
    OrIgnore,
}

impl InsertMode {
    fn verb(self) -> &'static str {
        match self {
            Self::Plain => "INSERT",
            Self::OrIgnore => "INSERT OR IGNORE",
        }
    }
}

/// Counts of rows handled during a copy.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct InsertCounts {
    /// Rows written.
    pub inserted: usize,
    /// Rows skipped by `INSERT OR IGNORE`.
    pub ignored: usize,
    /// Rows whose tracking value was rewritten.
    pub remapped: usize,
}

impl InsertCounts {
    /// Merges another set of counts into this one.
    pub fn merge(&mut self, other: &InsertCounts) {
        self.inserted += other.inserted;
        self.ignored += other.ignored;
        self.remapped += other.remapped;
    }
}

/// Interprets a tracking value as an id: integers, and text that parses as
/// one. Anything else has no id.
pub(crate) fn value_as_id(value: &Value) -> Option<i64> {
    match value {
        Value::Integer(id) => Some(*id),
        Value::Text(text) => text.trim().parse().ok(),
        _ => None,
    }
}

/// Rewrites a tracking value through `mapping`.
///
/// Values without an id, and ids the mapping does not know, are returned
/// unchanged.
pub(crate) fn remap_tracking_value(value: Value, mapping: &IdMapping) -> Value {
    match value_as_id(&value).and_then(|id| mapping.get(id)) {
        Some(new_id) => Value::Integer(new_id),
        None => value,
    }
}

/// Reads `columns` of every row of `table`, in rowid order where one exists.
pub(crate) fn read_rows(
    conn: &Connection,
    table: &str,
    columns: &[String],
) -> Result<Vec<Vec<Value>>> {
    let sql = format!(
        "SELECT {} FROM {}",
        quoted_list(columns.iter().map(String::as_str)),
        quote_ident(table)
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([], |row| {
            (0..columns.len())
                .map(|i| row.get::<_, Value>(i))
                .collect::<rusqlite::Result<Vec<_>>>()
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Inserts `rows` into `table`, rewriting the value at `tracking_index`
/// through `mapping`.
///
/// In [`InsertMode::Plain`] a constraint failure becomes
/// [`EngineError::ConstraintViolation`] for `table`.
#[allow(clippy::too_many_arguments)]
pub(crate) fn insert_rows(
    conn: &Connection,
    executor: &RetryingExecutor,
    table: &str,
    columns: &[String],
    rows: Vec<Vec<Value>>,
    mode: InsertMode,
    tracking_index: Option<usize>,
    mapping: &IdMapping,
) -> Result<InsertCounts> {
    let mut counts = InsertCounts::default();
    if columns.is_empty() {
        return Ok(counts);
    }

    let placeholders = (1..=columns.len())
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "{} INTO {} ({}) VALUES ({placeholders})",
        mode.verb(),
        quote_ident(table),
        quoted_list(columns.iter().map(String::as_str))
    );
    let mut stmt = conn.prepare(&sql)?;

    for mut row in rows {
        if let Some(idx) = tracking_index {
            let original = std::mem::replace(&mut row[idx], Value::Null);
            let rewritten = remap_tracking_value(original.clone(), mapping);
            if rewritten != original {
                counts.remapped += 1;
            }
            row[idx] = rewritten;
        }

        let changed = executor
            .run(|| stmt.execute(rusqlite::params_from_iter(row.iter())))
            .map_err(|err| match err {
                EngineError::DatabaseError(source) if is_constraint_error(&source) => {
                    EngineError::ConstraintViolation {
                        table: table.to_string(),
                        source,
                    }
                }
                other => other,
            })?;
        if changed == 0 {
            counts.ignored += 1;
        } else {
            counts.inserted += 1;
        }
    }
    Ok(counts)
}
