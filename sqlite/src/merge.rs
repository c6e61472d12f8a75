//! Merging one database into another.
//!
//! A merge runs in fixed phases:
//!
//! 1. **prepare** the source: project table, tracking columns, back-fill
//! 2. **project metadata**: copy the source's project rows into the target,
//!    keeping ids that are free and assigning fresh ids to the rest; the
//!    old → new translation is the merge's [`IdMapping`]
//! 3. **tables**: copy each source table into the target (create it when
//!    missing, otherwise add missing columns and `INSERT OR IGNORE`),
//!    rewriting tracking values through the mapping
//! 4. **post-step**: structural normalization of the target
//! 5. **reconcile**: every tracking value in the target points at a real
//!    project
//!
//! Failures in phases 1 and 2 abort the merge. A table that fails in
//! phase 3 is rolled back, logged, and skipped.

use std::collections::HashSet;

use relforge_core::{
    ColumnInfo, IdMapping, MergeConfig, NormalizeConfig, PROJECT_LABEL_COLUMN, PROJECT_TABLE,
    SkippedTable, TRACKING_COLUMN, is_project_table, is_system_table,
};
use rusqlite::types::Value;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::convert::{self, InsertCounts, InsertMode, value_as_id};
use crate::database::Database;
use crate::error::{EngineError, Result};
use crate::introspect;
use crate::normalize::{NormalizationReport, SchemaNormalizer, point_tracking_sql};
use crate::schema::{add_column_sql, quote_ident, quoted_list};

/// What a merge changed in the target.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct MergeReport {
    /// Label of the source database.
    pub source: String,
    /// Label of the target database.
    pub target: String,
    /// Source project id → target project id.
    pub id_mapping: IdMapping,
    /// Tables created in the target.
    pub tables_created: Vec<String>,
    /// Existing target tables that received rows.
    pub tables_merged: Vec<String>,
    /// Columns added to existing target tables, as `table.column`.
    pub columns_added: Vec<String>,
    /// Row totals over all copied tables.
    pub rows: InsertCounts,
    /// Target tracking values pointed at a real project afterwards.
    pub reconciled_rows: usize,
    /// Structural normalization applied to the target.
    pub post_normalization: Option<NormalizationReport>,
    /// Tables that could not be merged.
    pub skipped: Vec<SkippedTable>,
}

/// Merges `source` into `target`.
///
/// # Examples
///
/// ```
/// use relforge_core::{MergeConfig, NormalizeConfig};
/// use relforge_sqlite::{Database, DatabaseMerger};
///
/// let source = Database::open_in_memory().unwrap();
/// source
///     .connection()
///     .execute_batch("CREATE TABLE notes (notes_id INTEGER PRIMARY KEY, body TEXT); INSERT INTO notes VALUES (1, 'hi');")
///     .unwrap();
/// let target = Database::open_in_memory().unwrap();
///
/// let report = DatabaseMerger::new(&source, &target, MergeConfig::default())
///     .merge()
///     .unwrap();
/// assert_eq!(report.tables_created, vec!["notes".to_string()]);
/// assert_eq!(report.rows.inserted, 1);
/// ```
#[derive(Debug)]
pub struct DatabaseMerger<'a> {
    source: &'a Database,
    target: &'a Database,
    config: MergeConfig,
    normalize: NormalizeConfig,
}

impl<'a> DatabaseMerger<'a> {
    /// Creates a merger with default normalization settings.
    pub fn new(source: &'a Database, target: &'a Database, config: MergeConfig) -> Self {
        Self {
            source,
            target,
            config,
            normalize: NormalizeConfig::default(),
        }
    }

    /// Sets the normalization settings used to prepare the source and for
    /// the post-step.
    pub fn with_normalize_config(mut self, normalize: NormalizeConfig) -> Self {
        self.normalize = normalize;
        self
    }

    /// Runs every phase.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::MergeAbort`] if the source cannot be prepared,
    /// project metadata cannot be merged, or the target's tables cannot be
    /// listed. Per-table failures are recorded in the report instead.
    pub fn merge(&self) -> Result<MergeReport> {
        let mut report = MergeReport {
            source: self.source.label(),
            target: self.target.label(),
            ..MergeReport::default()
        };
        info!(source = %report.source, target = %report.target, "merge started");

        SchemaNormalizer::new(self.source, self.normalize.clone())
            .bootstrap()
            .map_err(|err| EngineError::MergeAbort(format!("cannot prepare source: {err}")))?;

        report.id_mapping = self
            .merge_project_metadata()
            .map_err(|err| EngineError::MergeAbort(format!("cannot merge project metadata: {err}")))?;
        info!(
            projects = report.id_mapping.len(),
            remapped = report.id_mapping.remapped_count(),
            "project metadata merged"
        );

        let tables = introspect::list_tables(self.source.connection())
            .map_err(|err| EngineError::MergeAbort(format!("cannot list source tables: {err}")))?;
        let mapping = report.id_mapping.clone();
        for table in tables {
            if is_project_table(&table) || is_system_table(&table) {
                continue;
            }
            if let Err(err) = self.merge_table(&table, &mapping, &mut report) {
                warn!(table = %table, error = %err, "skipping table");
                report.skipped.push(SkippedTable::new(&table, err.to_string()));
            }
        }

        if self.config.normalize_after {
            let post = SchemaNormalizer::new(self.target, self.normalize.clone())
                .normalize_structure()
                .map_err(|err| EngineError::MergeAbort(format!("cannot normalize target: {err}")))?;
            report.post_normalization = Some(post);
        }

        report.reconciled_rows = self.reconcile_tracking(&mut report)?;
        info!(
            created = report.tables_created.len(),
            merged = report.tables_merged.len(),
            rows = report.rows.inserted,
            skipped = report.skipped.len(),
            "merge finished"
        );
        Ok(report)
    }

    fn merge_project_metadata(&self) -> Result<IdMapping> {
        let mut ensure = NormalizationReport::default();
        SchemaNormalizer::new(self.target, self.normalize.clone())
            .ensure_project_table(&mut ensure)?;

        let source_columns = introspect::table_columns(self.source.connection(), PROJECT_TABLE)?;
        let column_names: Vec<String> = source_columns.iter().map(|c| c.name.clone()).collect();
        let rows = convert::read_rows(self.source.connection(), PROJECT_TABLE, &column_names)?;
        let id_index = column_names
            .iter()
            .position(|c| c.eq_ignore_ascii_case(TRACKING_COLUMN))
            .ok_or_else(|| EngineError::schema_read(PROJECT_TABLE, "source has no project id column"))?;
        let label_index = column_names
            .iter()
            .position(|c| c.eq_ignore_ascii_case(PROJECT_LABEL_COLUMN));

        let executor = self.target.executor();
        let tx = self.target.begin()?;
        let target_columns = introspect::table_columns(&tx, PROJECT_TABLE)?;
        for col in missing_columns(&source_columns, &target_columns) {
            executor.execute(&tx, &add_column_sql(PROJECT_TABLE, &col.name, &col.declared_type), [])?;
        }

        let existing: HashSet<i64> = {
            let mut stmt = tx.prepare(&format!(
                "SELECT {} FROM {}",
                quote_ident(TRACKING_COLUMN),
                quote_ident(PROJECT_TABLE)
            ))?;
            stmt.query_map([], |row| row.get::<_, Option<i64>>(0))?
                .filter_map(|r| r.transpose())
                .collect::<std::result::Result<_, _>>()?
        };

        let origin = self.config.annotate_origin.then(|| {
            format!(
                "merged from {} at {}",
                self.source.label(),
                chrono::Utc::now().format("%Y-%m-%d %H:%M:%S")
            )
        });

        let (free, colliding): (Vec<_>, Vec<_>) = rows
            .into_iter()
            .map(|mut row| {
                if let (Some(origin), Some(idx)) = (&origin, label_index) {
                    row[idx] = annotate_label(&row[idx], origin);
                }
                row
            })
            .partition(|row| {
                value_as_id(&row[id_index]).is_some_and(|id| !existing.contains(&id))
            });

        let mut mapping = IdMapping::default();
        let all_columns = quoted_list(column_names.iter().map(String::as_str));
        let insert_all = format!(
            "INSERT INTO {} ({all_columns}) VALUES ({})",
            quote_ident(PROJECT_TABLE),
            placeholders(column_names.len())
        );
        for row in free {
            executor.execute(&tx, &insert_all, rusqlite::params_from_iter(row.iter()))?;
            let new_id = tx.last_insert_rowid();
            if let Some(old) = value_as_id(&row[id_index]) {
                mapping.insert(old, new_id);
            }
        }

        let without_id: Vec<String> = column_names
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != id_index)
            .map(|(_, c)| c.clone())
            .collect();
        let insert_fresh = if without_id.is_empty() {
            format!("INSERT INTO {} DEFAULT VALUES", quote_ident(PROJECT_TABLE))
        } else {
            format!(
                "INSERT INTO {} ({}) VALUES ({})",
                quote_ident(PROJECT_TABLE),
                quoted_list(without_id.iter().map(String::as_str)),
                placeholders(without_id.len())
            )
        };
        for row in colliding {
            let values: Vec<&Value> = row
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != id_index)
                .map(|(_, v)| v)
                .collect();
            executor.execute(&tx, &insert_fresh, rusqlite::params_from_iter(values.iter()))?;
            let new_id = tx.last_insert_rowid();
            if let Some(old) = value_as_id(&row[id_index]) {
                debug!(old, new = new_id, "project id taken, assigned fresh id");
                mapping.insert(old, new_id);
            }
        }

        self.target.commit(tx)?;
        Ok(mapping)
    }

    fn merge_table(&self, table: &str, mapping: &IdMapping, report: &mut MergeReport) -> Result<()> {
        let source_columns = introspect::table_columns(self.source.connection(), table)?;
        let column_names: Vec<String> = source_columns.iter().map(|c| c.name.clone()).collect();
        let tracking_index = column_names
            .iter()
            .position(|c| c.eq_ignore_ascii_case(TRACKING_COLUMN));
        let rows = convert::read_rows(self.source.connection(), table, &column_names)?;

        let executor = self.target.executor();
        let tx = self.target.begin()?;
        let existing = introspect::resolve_table(&tx, table)?;
        let (mode, created) = match existing {
            None => {
                let ddl = introspect::create_statement(self.source.connection(), table)?;
                executor.execute_batch(&tx, &ddl)?;
                for index in introspect::index_statements(self.source.connection(), table)? {
                    if let Err(err) = executor.execute_batch(&tx, &index.sql) {
                        warn!(table, index = %index.name, error = %err, "could not copy index");
                    }
                }
                (InsertMode::Plain, true)
            }
            Some(ref target_table) => {
                let target_columns = introspect::table_columns(&tx, target_table)?;
                for col in missing_columns(&source_columns, &target_columns) {
                    executor.execute(
                        &tx,
                        &add_column_sql(target_table, &col.name, &col.declared_type),
                        [],
                    )?;
                    info!(table = %target_table, column = %col.name, "added column");
                    report.columns_added.push(format!("{target_table}.{}", col.name));
                }
                (InsertMode::OrIgnore, false)
            }
        };
        let target_name = existing.unwrap_or_else(|| table.to_string());
        if created && tracking_index.is_none() {
            executor.execute(&tx, &add_column_sql(&target_name, TRACKING_COLUMN, "INTEGER"), [])?;
        }

        let counts = convert::insert_rows(
            &tx,
            executor,
            &target_name,
            &column_names,
            rows,
            mode,
            tracking_index,
            mapping,
        )?;
        // Triggers go in after the copy so merged rows do not fire them.
        if created {
            for trigger in introspect::trigger_statements(self.source.connection(), table)? {
                if let Err(err) = executor.execute_batch(&tx, &trigger.sql) {
                    warn!(table, trigger = %trigger.name, error = %err, "could not copy trigger");
                }
            }
        }
        self.target.commit(tx)?;

        debug!(
            table = %target_name,
            inserted = counts.inserted,
            ignored = counts.ignored,
            "table merged"
        );
        report.rows.merge(&counts);
        if created {
            report.tables_created.push(target_name);
        } else {
            report.tables_merged.push(target_name);
        }
        Ok(())
    }

    /// Points `NULL` and dangling tracking values at the oldest project.
    fn reconcile_tracking(&self, report: &mut MergeReport) -> Result<usize> {
        let conn = self.target.connection();
        let oldest: Option<i64> = conn.query_row(
            &format!(
                "SELECT MIN({}) FROM {}",
                quote_ident(TRACKING_COLUMN),
                quote_ident(PROJECT_TABLE)
            ),
            [],
            |row| row.get(0),
        )?;
        let Some(oldest) = oldest else {
            return Ok(0);
        };

        let tables = introspect::list_tables(conn)
            .map_err(|err| EngineError::MergeAbort(format!("cannot list target tables: {err}")))?;
        let mut updated = 0;
        for table in tables {
            if is_project_table(&table) || is_system_table(&table) {
                continue;
            }
            let result = introspect::table_columns(conn, &table).and_then(|columns| {
                if !columns.iter().any(|c| c.is_named(TRACKING_COLUMN)) {
                    self.target
                        .execute(&add_column_sql(&table, TRACKING_COLUMN, "INTEGER"), [])?;
                }
                self.target.execute(&point_tracking_sql(&table), [oldest])
            });
            match result {
                Ok(rows) => updated += rows,
                Err(err) => {
                    warn!(table = %table, error = %err, "could not reconcile tracking column");
                    report.skipped.push(SkippedTable::new(&table, err.to_string()));
                }
            }
        }
        Ok(updated)
    }
}

/// Columns of `source` that `target` lacks, compared case-insensitively.
fn missing_columns<'c>(source: &'c [ColumnInfo], target: &[ColumnInfo]) -> Vec<&'c ColumnInfo> {
    source
        .iter()
        .filter(|s| !target.iter().any(|t| t.is_named(&s.name)))
        .collect()
}

fn placeholders(n: usize) -> String {
    (1..=n).map(|i| format!("?{i}")).collect::<Vec<_>>().join(", ")
}

/// Appends an origin note to a project label.
fn annotate_label(label: &Value, origin: &str) -> Value {
    match label {
        Value::Text(text) if !text.is_empty() => Value::Text(format!("{text} ({origin})")),
        _ => Value::Text(format!("({origin})")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn project_db(projects: &[(i64, &str)], items: &[(i64, &str, i64)]) -> Database {
        let db = Database::open_in_memory().unwrap();
        db.connection()
            .execute_batch(
                "CREATE TABLE ProjectInformation (
                     ProjectInformation_id INTEGER PRIMARY KEY AUTOINCREMENT,
                     ProjectName TEXT
                 );
                 CREATE TABLE items (
                     items_id INTEGER PRIMARY KEY,
                     name TEXT,
                     ProjectInformation_id INTEGER
                 );",
            )
            .unwrap();
        for (id, name) in projects {
            db.connection()
                .execute(
                    "INSERT INTO ProjectInformation VALUES (?1, ?2)",
                    rusqlite::params![id, name],
                )
                .unwrap();
        }
        for (id, name, project) in items {
            db.connection()
                .execute(
                    "INSERT INTO items VALUES (?1, ?2, ?3)",
                    rusqlite::params![id, name, project],
                )
                .unwrap();
        }
        db
    }

    fn projects(db: &Database) -> Vec<(i64, String)> {
        db.connection()
            .prepare("SELECT ProjectInformation_id, ProjectName FROM ProjectInformation ORDER BY 1")
            .unwrap()
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .unwrap()
            .collect::<std::result::Result<_, _>>()
            .unwrap()
    }

    #[test]
    fn test_colliding_project_ids_get_fresh_ids() {
        let source = project_db(&[(1, "beta")], &[(100, "from source", 1)]);
        let target = project_db(&[(1, "alpha")], &[(1, "from target", 1)]);

        let report = DatabaseMerger::new(&source, &target, MergeConfig::default())
            .merge()
            .unwrap();
        assert_eq!(report.id_mapping.get(1), Some(2));
        assert_eq!(
            projects(&target),
            vec![(1, "alpha".to_string()), (2, "beta".to_string())]
        );

        let owners: Vec<(i64, i64)> = target
            .connection()
            .prepare("SELECT items_id, ProjectInformation_id FROM items ORDER BY items_id")
            .unwrap()
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .unwrap()
            .collect::<std::result::Result<_, _>>()
            .unwrap();
        assert_eq!(owners, vec![(1, 1), (100, 2)]);
        assert_eq!(report.tables_merged, vec!["items"]);
    }

    #[test]
    fn test_free_project_ids_are_preserved() {
        let source = project_db(&[(5, "five")], &[]);
        let target = project_db(&[(1, "one")], &[]);
        let report = DatabaseMerger::new(&source, &target, MergeConfig::default())
            .merge()
            .unwrap();
        assert_eq!(report.id_mapping.get(5), Some(5));
        assert_eq!(report.id_mapping.remapped_count(), 0);
        assert_eq!(projects(&target).len(), 2);
    }

    #[test]
    fn test_existing_rows_are_not_overwritten() {
        let source = project_db(&[(1, "p")], &[(1, "source copy", 1)]);
        let target = project_db(&[(1, "p")], &[(1, "target copy", 1)]);
        let report = DatabaseMerger::new(&source, &target, MergeConfig::default())
            .merge()
            .unwrap();
        assert_eq!(report.rows.ignored, 1);
        let name: String = target
            .connection()
            .query_row("SELECT name FROM items WHERE items_id = 1", [], |row| row.get(0))
            .unwrap();
        assert_eq!(name, "target copy");
    }

    #[test]
    fn test_missing_columns_are_added() {
        let source = project_db(&[(1, "p")], &[(7, "x", 1)]);
        source
            .connection()
            .execute_batch("ALTER TABLE items ADD COLUMN colour TEXT; UPDATE items SET colour = 'red';")
            .unwrap();
        let target = project_db(&[(1, "q")], &[]);
        let report = DatabaseMerger::new(&source, &target, MergeConfig::default())
            .merge()
            .unwrap();
        assert_eq!(report.columns_added, vec!["items.colour"]);
        let colour: String = target
            .connection()
            .query_row("SELECT colour FROM items WHERE items_id = 7", [], |row| row.get(0))
            .unwrap();
        assert_eq!(colour, "red");
    }

    #[test]
    fn test_new_table_triggers_copied_after_rows() {
        let source = project_db(&[(1, "p")], &[]);
        source
            .connection()
            .execute_batch(
                "CREATE TABLE log (msg TEXT);
                 CREATE TABLE tags (label TEXT UNIQUE);
                 CREATE TRIGGER tags_log AFTER INSERT ON tags
                 BEGIN INSERT INTO log (msg) VALUES ('tag ' || NEW.label); END;
                 INSERT INTO tags VALUES ('red'), ('blue');",
            )
            .unwrap();
        let target = project_db(&[(1, "q")], &[]);
        DatabaseMerger::new(&source, &target, MergeConfig::default())
            .merge()
            .unwrap();

        let conn = target.connection();
        let logged = |conn: &rusqlite::Connection| -> i64 {
            conn.query_row("SELECT COUNT(*) FROM log", [], |row| row.get(0))
                .unwrap()
        };
        assert_eq!(logged(conn), 2);
        conn.execute("INSERT INTO tags (label) VALUES ('green')", [])
            .unwrap();
        assert_eq!(logged(conn), 3);
        assert!(
            conn.execute("INSERT INTO tags (label) VALUES ('red')", [])
                .is_err()
        );
    }

    #[test]
    fn test_unprepared_source_is_bootstrapped() {
        let source = Database::open_in_memory().unwrap();
        source
            .connection()
            .execute_batch("CREATE TABLE tags (tags_id INTEGER PRIMARY KEY, label TEXT); INSERT INTO tags VALUES (1, 'a');")
            .unwrap();
        let target = project_db(&[(1, "existing")], &[]);

        let report = DatabaseMerger::new(&source, &target, MergeConfig::default())
            .merge()
            .unwrap();
        assert_eq!(report.tables_created, vec!["tags"]);
        // the source's default project collided with id 1
        assert_eq!(report.id_mapping.get(1), Some(2));
        let owner: i64 = target
            .connection()
            .query_row("SELECT ProjectInformation_id FROM tags", [], |row| row.get(0))
            .unwrap();
        assert_eq!(owner, 2);
    }

    #[test]
    fn test_origin_annotation() {
        let source = project_db(&[(1, "beta")], &[]);
        let target = project_db(&[(1, "alpha")], &[]);
        let config = MergeConfig {
            annotate_origin: true,
            ..MergeConfig::default()
        };
        DatabaseMerger::new(&source, &target, config).merge().unwrap();
        let merged = &projects(&target)[1].1;
        assert!(merged.starts_with("beta (merged from memory at "));
    }

    #[test]
    fn test_reconcile_points_dangling_values_at_oldest_project() {
        let source = project_db(&[(1, "p")], &[]);
        let target = project_db(&[(3, "t")], &[(1, "orphan", 42)]);
        target
            .connection()
            .execute_batch("CREATE TABLE loose (v TEXT); INSERT INTO loose VALUES ('x');")
            .unwrap();

        let report = DatabaseMerger::new(&source, &target, MergeConfig::default())
            .merge()
            .unwrap();
        assert!(report.reconciled_rows >= 2);
        let dangling: i64 = target
            .connection()
            .query_row(
                "SELECT COUNT(*) FROM items WHERE ProjectInformation_id NOT IN (SELECT ProjectInformation_id FROM ProjectInformation)",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(dangling, 0);
        let loose_owner: i64 = target
            .connection()
            .query_row("SELECT ProjectInformation_id FROM loose", [], |row| row.get(0))
            .unwrap();
        assert_eq!(loose_owner, 1);
    }

    #[test]
    fn test_annotate_label() {
        assert_eq!(
            annotate_label(&Value::Text("a".into()), "o"),
            Value::Text("a (o)".into())
        );
        assert_eq!(annotate_label(&Value::Null, "o"), Value::Text("(o)".into()));
    }
}
