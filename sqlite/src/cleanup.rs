//! Pruning of empty tables, empty columns, and leftover temp tables.
//!
//! Column removal goes through [`TableRebuilder`], so it works on SQLite
//! builds without `ALTER TABLE … DROP COLUMN` and keeps the table intact on
//! failure.

use relforge_core::{
    SkippedTable, TRACKING_COLUMN, is_project_table, is_system_table, same_identifier,
};
use serde::Serialize;
use tracing::{info, warn};

use crate::database::Database;
use crate::error::{EngineError, Result};
use crate::introspect;
use crate::rebuild::{RebuildOutcome, TableRebuilder};
use crate::schema::{quote_ident, temp_table_base};

/// Which cleanup passes [`cleanup_with`] runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleanupOptions {
    /// Drop user tables without rows.
    pub empty_tables: bool,
    /// Drop columns holding only `NULL` or empty strings.
    pub empty_columns: bool,
    /// Drop temp tables left behind by interrupted rebuilds.
    pub temp_tables: bool,
}

impl Default for CleanupOptions {
    fn default() -> Self {
        Self {
            empty_tables: true,
            empty_columns: true,
            temp_tables: false,
        }
    }
}

/// What a cleanup removed.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    /// Empty tables dropped.
    pub tables_dropped: Vec<String>,
    /// Columns dropped, as `table.column`.
    pub columns_dropped: Vec<String>,
    /// Leftover temp tables dropped.
    pub temp_tables_dropped: Vec<String>,
    /// Tables that could not be cleaned.
    pub skipped: Vec<SkippedTable>,
}

/// Drops every user table with zero rows.
///
/// System tables and the project table are never dropped.
pub fn delete_empty_tables(db: &Database) -> Result<Vec<String>> {
    let tables = introspect::list_tables(db.connection())?;
    let temps = leftover_temp_tables(&tables);
    let mut dropped = Vec::new();
    for table in tables {
        if is_project_table(&table) || temps.contains(&table) {
            continue;
        }
        if introspect::row_count(db.connection(), &table)? == 0 {
            drop_table(db, &table)?;
            dropped.push(table);
        }
    }
    Ok(dropped)
}

/// Rebuilds `table` without the columns whose every value is `NULL` or the
/// empty string, returning the dropped names.
///
/// Primary-key columns and the tracking column are always kept. Tables
/// without rows are left alone, as are tables where nothing would remain.
pub fn delete_empty_columns(db: &Database, table: &str) -> Result<Vec<String>> {
    let conn = db.connection();
    let table = introspect::require_table(conn, table)?;
    if introspect::row_count(conn, &table)? == 0 {
        return Ok(Vec::new());
    }

    let columns = introspect::table_columns(conn, &table)?;
    let mut empty = Vec::new();
    for column in &columns {
        if column.is_primary_key() || column.is_named(TRACKING_COLUMN) {
            continue;
        }
        if introspect::column_is_empty(conn, &table, &column.name)? {
            empty.push(column.name.clone());
        }
    }
    if empty.is_empty() || empty.len() == columns.len() {
        return Ok(Vec::new());
    }

    let names: Vec<&str> = empty.iter().map(String::as_str).collect();
    drop_columns(db, &table, &names)?;
    Ok(empty)
}

/// Drops `table`.
///
/// # Errors
///
/// Returns [`EngineError::SchemaRead`] if the table does not exist and
/// [`EngineError::InvalidPlan`] for SQLite's own tables.
pub fn drop_table(db: &Database, table: &str) -> Result<()> {
    if is_system_table(table) {
        return Err(EngineError::InvalidPlan {
            table: table.to_string(),
            reason: "system tables cannot be dropped".to_string(),
        });
    }
    let table = introspect::require_table(db.connection(), table)?;
    db.execute(&format!("DROP TABLE {}", quote_ident(&table)), [])?;
    info!(table = %table, "dropped table");
    Ok(())
}

/// Rebuilds `table` without `columns`.
///
/// # Errors
///
/// Returns [`EngineError::InvalidPlan`] if a named column does not exist or
/// no column would remain; rebuild failures leave the table unchanged.
pub fn drop_columns(db: &Database, table: &str, columns: &[&str]) -> Result<RebuildOutcome> {
    let rebuilder = TableRebuilder::new(db);
    let mut plan = rebuilder.plan(table)?;
    for column in columns {
        if !plan.remove_column(column) {
            return Err(EngineError::InvalidPlan {
                table: plan.table.clone(),
                reason: format!("no column named '{column}'"),
            });
        }
    }
    let outcome = rebuilder.rebuild(&plan)?;
    info!(table = %outcome.table, columns = ?columns, "dropped columns");
    Ok(outcome)
}

/// Tables named exactly like a rebuild's temp table,
/// `<table>_temp_<millis>_<n>`, whose `<table>` still exists.
fn leftover_temp_tables(tables: &[String]) -> Vec<String> {
    tables
        .iter()
        .filter(|name| {
            temp_table_base(name)
                .is_some_and(|base| tables.iter().any(|t| same_identifier(t, base)))
        })
        .cloned()
        .collect()
}

/// Drops temp tables left behind by an interrupted rebuild.
///
/// Only names of the exact shape the rebuilder generates, next to the
/// table they were derived from, are touched.
pub fn sweep_temp_tables(db: &Database) -> Result<Vec<String>> {
    let mut dropped = Vec::new();
    for table in leftover_temp_tables(&introspect::list_tables(db.connection())?) {
        drop_table(db, &table)?;
        dropped.push(table);
    }
    if !dropped.is_empty() {
        info!(count = dropped.len(), "swept leftover temp tables");
    }
    Ok(dropped)
}

/// Empty tables, then empty columns of every remaining table.
pub fn cleanup_database(db: &Database) -> Result<CleanupReport> {
    cleanup_with(db, &CleanupOptions::default())
}

/// Runs the passes selected in `options`, best effort per table.
///
/// Only a failure to list tables is returned as an error.
pub fn cleanup_with(db: &Database, options: &CleanupOptions) -> Result<CleanupReport> {
    let mut report = CleanupReport::default();

    if options.temp_tables {
        for table in leftover_temp_tables(&introspect::list_tables(db.connection())?) {
            match drop_table(db, &table) {
                Ok(()) => report.temp_tables_dropped.push(table),
                Err(err) => skip(&mut report, &table, &err),
            }
        }
    }

    let all_tables = introspect::list_tables(db.connection())?;
    let temps = leftover_temp_tables(&all_tables);
    let tables: Vec<String> = all_tables
        .into_iter()
        .filter(|t| !is_project_table(t) && !temps.contains(t))
        .collect();
    for table in tables {
        if options.empty_tables {
            let emptied = introspect::row_count(db.connection(), &table).and_then(|rows| {
                if rows > 0 {
                    return Ok(false);
                }
                drop_table(db, &table)?;
                Ok(true)
            });
            match emptied {
                Ok(true) => {
                    report.tables_dropped.push(table);
                    continue;
                }
                Ok(false) => {}
                Err(err) => {
                    skip(&mut report, &table, &err);
                    continue;
                }
            }
        }
        if options.empty_columns {
            match delete_empty_columns(db, &table) {
                Ok(columns) => report
                    .columns_dropped
                    .extend(columns.into_iter().map(|c| format!("{table}.{c}"))),
                Err(err) => skip(&mut report, &table, &err),
            }
        }
    }

    info!(
        tables = report.tables_dropped.len(),
        columns = report.columns_dropped.len(),
        temp_tables = report.temp_tables_dropped.len(),
        "cleanup finished"
    );
    Ok(report)
}

fn skip(report: &mut CleanupReport, table: &str, err: &EngineError) {
    warn!(table, error = %err, "cleanup skipped table");
    report.skipped.push(SkippedTable::new(table, err.to_string()));
}
