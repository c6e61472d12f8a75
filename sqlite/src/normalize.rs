//! Schema normalization.
//!
//! Brings a database into the normalized layout:
//!
//! 1. every table's key is a single `<table>_id` primary key (a plain `id`
//!    is renamed and promoted; keyless tables get one synthesized from
//!    `rowid`)
//! 2. every table carries an `INTEGER` tracking column,
//!    `ProjectInformation_id`
//! 3. accepted candidate relations become `<target>_id` columns with
//!    declared foreign keys, filled by looking the old values up in the
//!    target table
//! 4. a `ProjectInformation` table exists with at least one row, and every
//!    tracking value points at a real project
//!
//! A last pass rebuilds any table whose declared foreign keys still name a
//! column renamed in step 1 or 4.
//!
//! Steps 1, 3 and 4 rebuild tables. A table that fails is logged, recorded
//! in the report, and left unchanged; the remaining tables are still
//! processed.

use std::collections::{BTreeMap, HashMap};

use relforge_core::{
    CandidateRelation, NormalizeConfig, PROJECT_LABEL_COLUMN, PROJECT_TABLE, SkippedTable,
    TRACKING_COLUMN, id_column_name, is_project_table, is_system_table, validate_relation,
};
use rusqlite::params;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::database::Database;
use crate::error::{EngineError, Result};
use crate::introspect;
use crate::rebuild::{RebuildPlan, TableRebuilder, ValueSource};
use crate::schema::{
    ColumnDef, DEFAULT_PROJECT_LABEL, ForeignKeyClause, add_column_sql, project_table_sql,
    quote_ident,
};

/// Columns renamed during one operation, so later steps can follow them.
#[derive(Debug, Default, Clone)]
pub struct RenameTracker {
    renamed: HashMap<(String, String), String>,
}

impl RenameTracker {
    /// Records that `table.old` is now called `new`.
    pub fn track(&mut self, table: &str, old: &str, new: &str) {
        self.renamed.insert(
            (table.to_ascii_lowercase(), old.to_ascii_lowercase()),
            new.to_string(),
        );
    }

    /// Returns `true` if `table.column` was renamed.
    pub fn was_renamed(&self, table: &str, column: &str) -> bool {
        self.renamed
            .contains_key(&(table.to_ascii_lowercase(), column.to_ascii_lowercase()))
    }

    /// Current name of `table.column`.
    pub fn current_name(&self, table: &str, column: &str) -> String {
        self.renamed
            .get(&(table.to_ascii_lowercase(), column.to_ascii_lowercase()))
            .cloned()
            .unwrap_or_else(|| column.to_string())
    }
}

/// A relation turned into a foreign-key column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MaterializedRelation {
    /// Table that received the column.
    pub table: String,
    /// Column the values were read from.
    pub source_column: String,
    /// New foreign-key column.
    pub foreign_key_column: String,
    /// Referenced table.
    pub target_table: String,
    /// Referenced id column.
    pub target_column: String,
    /// Non-null source values with no match in the target.
    pub unresolved: u64,
    /// Whether the source column was dropped.
    pub source_removed: bool,
}

/// What a normalization run changed.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct NormalizationReport {
    /// Tables whose `id` column became `<table>_id`.
    pub renamed_ids: Vec<String>,
    /// Tables that received a synthesized `<table>_id` key.
    pub synthesized_ids: Vec<String>,
    /// Tables that received the tracking column.
    pub tracking_columns_added: Vec<String>,
    /// Relations materialized as foreign-key columns.
    pub materialized: Vec<MaterializedRelation>,
    /// Whether the project table was created.
    pub project_table_created: bool,
    /// Tracking values set to a real project.
    pub backfilled_rows: usize,
    /// Tables rebuilt so their foreign keys follow renamed columns.
    pub repointed_foreign_keys: Vec<String>,
    /// Tables (or relations) that could not be processed.
    pub skipped: Vec<SkippedTable>,
}

impl NormalizationReport {
    fn skip(&mut self, table: &str, err: &EngineError) {
        warn!(table, error = %err, "skipping table");
        self.skipped.push(SkippedTable::new(table, err.to_string()));
    }
}

/// Applies the normalization steps to one database.
///
/// # Examples
///
/// ```
/// use relforge_core::NormalizeConfig;
/// use relforge_sqlite::{Database, SchemaNormalizer};
///
/// let db = Database::open_in_memory().unwrap();
/// db.connection()
///     .execute_batch("CREATE TABLE orders (id INTEGER, total REAL);")
///     .unwrap();
///
/// let report = SchemaNormalizer::new(&db, NormalizeConfig::default())
///     .normalize(&[])
///     .unwrap();
/// assert_eq!(report.renamed_ids, vec!["orders".to_string()]);
/// assert!(report.project_table_created);
/// ```
#[derive(Debug)]
pub struct SchemaNormalizer<'a> {
    db: &'a Database,
    config: NormalizeConfig,
    tracker: RenameTracker,
}

impl<'a> SchemaNormalizer<'a> {
    /// Creates a normalizer over `db`.
    pub fn new(db: &'a Database, config: NormalizeConfig) -> Self {
        Self {
            db,
            config,
            tracker: RenameTracker::default(),
        }
    }

    /// Renames recorded so far.
    pub fn tracker(&self) -> &RenameTracker {
        &self.tracker
    }

    /// Runs every step: id keys, tracking columns, relation
    /// materialization, project bootstrap.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Normalization`] only when the table list
    /// cannot be read; per-table failures are recorded in the report.
    pub fn normalize(&mut self, relations: &[CandidateRelation]) -> Result<NormalizationReport> {
        let mut report = NormalizationReport::default();
        self.normalize_keys(&mut report)?;
        self.add_tracking_columns(&mut report)?;
        self.materialize_relations(relations, &mut report)?;
        if let Err(err) = self.bootstrap_project(&mut report) {
            report.skip(PROJECT_TABLE, &err);
        }
        self.repoint_foreign_keys(&mut report)?;
        info!(
            renamed = report.renamed_ids.len(),
            materialized = report.materialized.len(),
            skipped = report.skipped.len(),
            "normalization finished"
        );
        Ok(report)
    }

    /// Id keys and tracking columns only; no relations, no project rows.
    pub fn normalize_structure(&mut self) -> Result<NormalizationReport> {
        let mut report = NormalizationReport::default();
        self.normalize_keys(&mut report)?;
        self.add_tracking_columns(&mut report)?;
        self.repoint_foreign_keys(&mut report)?;
        Ok(report)
    }

    /// Strict bootstrap: project table, tracking columns, back-fill.
    ///
    /// Unlike [`normalize`](Self::normalize), any failure is returned.
    pub fn bootstrap(&mut self) -> Result<NormalizationReport> {
        let mut report = NormalizationReport::default();
        for table in self.user_tables()? {
            if !self.has_tracking_column(&table)? {
                self.db
                    .execute(&add_column_sql(&table, TRACKING_COLUMN, "INTEGER"), [])?;
                report.tracking_columns_added.push(table);
            }
        }
        self.bootstrap_project(&mut report)?;
        self.repoint_foreign_keys(&mut report)?;
        Ok(report)
    }

    fn user_tables(&self) -> Result<Vec<String>> {
        let tables = introspect::list_tables(self.db.connection())
            .map_err(|err| EngineError::Normalization(format!("cannot list tables: {err}")))?;
        Ok(tables
            .into_iter()
            .filter(|t| !is_project_table(t) && !is_system_table(t))
            .collect())
    }

    fn has_tracking_column(&self, table: &str) -> Result<bool> {
        Ok(introspect::table_columns(self.db.connection(), table)?
            .iter()
            .any(|c| c.is_named(TRACKING_COLUMN)))
    }

    fn normalize_keys(&mut self, report: &mut NormalizationReport) -> Result<()> {
        for table in self.user_tables()? {
            if let Err(err) = self.normalize_key(&table, report) {
                report.skip(&table, &err);
            }
        }
        Ok(())
    }

    fn normalize_key(&mut self, table: &str, report: &mut NormalizationReport) -> Result<()> {
        let columns = introspect::table_columns(self.db.connection(), table)?;
        let key = id_column_name(table);
        if columns.iter().any(|c| c.is_named(&key)) {
            return Ok(());
        }

        let rebuilder = TableRebuilder::new(self.db);
        let mut plan = rebuilder.plan(table)?;
        if let Some(id) = columns.iter().find(|c| c.is_named("id")) {
            plan.rename_column(&id.name, &key);
            plan.set_primary_key(&[key.as_str()]);
            rebuilder.rebuild(&plan)?;
            self.tracker.track(table, &id.name, &key);
            info!(table, column = %key, "renamed id column");
            report.renamed_ids.push(table.to_string());
        } else if self.config.synthesize_missing_ids && !columns.iter().any(|c| c.is_primary_key()) {
            plan.prepend_column(ColumnDef::new(&key, "INTEGER"), ValueSource::RowId);
            plan.set_primary_key(&[key.as_str()]);
            rebuilder.rebuild(&plan)?;
            info!(table, column = %key, "synthesized id column");
            report.synthesized_ids.push(table.to_string());
        }
        Ok(())
    }

    fn add_tracking_columns(&self, report: &mut NormalizationReport) -> Result<()> {
        for table in self.user_tables()? {
            let added = self.has_tracking_column(&table).and_then(|present| {
                if present {
                    return Ok(false);
                }
                self.db
                    .execute(&add_column_sql(&table, TRACKING_COLUMN, "INTEGER"), [])?;
                Ok(true)
            });
            match added {
                Ok(true) => {
                    debug!(table = %table, "added tracking column");
                    report.tracking_columns_added.push(table);
                }
                Ok(false) => {}
                Err(err) => report.skip(&table, &err),
            }
        }
        Ok(())
    }

    fn materialize_relations(
        &self,
        relations: &[CandidateRelation],
        report: &mut NormalizationReport,
    ) -> Result<()> {
        let mut by_table: BTreeMap<String, Vec<&CandidateRelation>> = BTreeMap::new();
        for relation in relations {
            let problems = validate_relation(relation);
            if !problems.is_empty() {
                warn!(
                    table = %relation.source_table,
                    column = %relation.source_column,
                    "discarding invalid relation: {}",
                    problems[0]
                );
                continue;
            }
            by_table
                .entry(relation.source_table.to_ascii_lowercase())
                .or_default()
                .push(relation);
        }

        for group in by_table.values() {
            let table = &group[0].source_table;
            if is_system_table(table) || is_project_table(table) {
                continue;
            }
            match introspect::resolve_table(self.db.connection(), table) {
                Ok(Some(resolved)) => {
                    if let Err(err) = self.materialize_table(&resolved, group, report) {
                        report.skip(&resolved, &err);
                    }
                }
                Ok(None) => warn!(table = %table, "relation source table no longer exists"),
                Err(err) => report.skip(table, &err),
            }
        }
        Ok(())
    }

    fn materialize_table(
        &self,
        table: &str,
        relations: &[&CandidateRelation],
        report: &mut NormalizationReport,
    ) -> Result<()> {
        let conn = self.db.connection();
        let rebuilder = TableRebuilder::new(self.db);
        let mut plan = rebuilder.plan(table)?;
        let mut pending = Vec::new();
        // Source column -> every relation reading it resolved fully.
        let mut removable: BTreeMap<String, bool> = BTreeMap::new();

        for relation in relations {
            let source_column = self.tracker.current_name(table, &relation.source_column);
            let Some(source) = plan
                .column(&source_column)
                .and_then(|c| c.source.source_column())
                .map(str::to_string)
            else {
                warn!(table, column = %relation.source_column, "relation source column no longer exists");
                continue;
            };
            let Some(target) = introspect::resolve_table(conn, &relation.target_table)? else {
                warn!(table, target = %relation.target_table, "relation target table no longer exists");
                continue;
            };
            let target_column = self.tracker.current_name(&target, &relation.target_id_column);
            let target_columns = introspect::table_columns(conn, &target)?;
            let Some(target_column) = target_columns
                .iter()
                .find(|c| c.is_named(&target_column))
                .map(|c| c.name.clone())
            else {
                warn!(table, target = %target, column = %target_column, "relation target column no longer exists");
                continue;
            };
            if !introspect::column_is_unique(conn, &target, &target_column)? {
                let reason = format!(
                    "{target}.{target_column} is not unique; relation from {table}.{source} skipped"
                );
                warn!(table, "{reason}");
                report.skipped.push(SkippedTable::new(table, reason));
                continue;
            }

            let fk_column = free_column_name(&plan, &id_column_name(&target));
            let unresolved = count_unresolved(conn, table, &source, &target, &target_column)?;
            plan.add_column(
                ColumnDef::new(&fk_column, "INTEGER"),
                ValueSource::Lookup {
                    column: source.clone(),
                    target_table: target.clone(),
                    target_column: target_column.clone(),
                },
            );
            plan.add_foreign_key(ForeignKeyClause::new(&fk_column, &target, &target_column));

            let entry = removable.entry(source.to_ascii_lowercase()).or_insert(true);
            *entry &= unresolved == 0;
            pending.push(MaterializedRelation {
                table: table.to_string(),
                source_column: source,
                foreign_key_column: fk_column,
                target_table: target,
                target_column,
                unresolved,
                source_removed: false,
            });
        }

        if pending.is_empty() {
            return Ok(());
        }

        for relation in &mut pending {
            let remove = removable
                .get(&relation.source_column.to_ascii_lowercase())
                .copied()
                .unwrap_or(false);
            if remove {
                plan.remove_column(&relation.source_column);
                relation.source_removed = true;
            } else {
                warn!(
                    table,
                    column = %relation.source_column,
                    unresolved = relation.unresolved,
                    "keeping source column, not every value resolved"
                );
            }
        }

        self.follow_renames(&mut plan);
        if plan.has_column(TRACKING_COLUMN) {
            plan.add_foreign_key(ForeignKeyClause::new(
                TRACKING_COLUMN,
                PROJECT_TABLE,
                TRACKING_COLUMN,
            ));
        }

        rebuilder.rebuild(&plan)?;
        for relation in &pending {
            info!(
                table,
                column = %relation.foreign_key_column,
                target = %relation.target_table,
                "materialized relation"
            );
        }
        report.materialized.extend(pending);
        Ok(())
    }

    /// Points foreign-key clauses of `plan` at the current names of their
    /// target columns.
    fn follow_renames(&self, plan: &mut RebuildPlan) {
        for fk in &mut plan.foreign_keys {
            if let Some(target_column) = &fk.target_column {
                fk.target_column = Some(self.tracker.current_name(&fk.target_table, target_column));
            }
        }
    }

    /// Rebuilds every table whose foreign keys reference a column renamed
    /// during this run.
    fn repoint_foreign_keys(&self, report: &mut NormalizationReport) -> Result<()> {
        let tables = introspect::list_tables(self.db.connection())
            .map_err(|err| EngineError::Normalization(format!("cannot list tables: {err}")))?;
        for table in tables {
            let stale = introspect::foreign_keys(self.db.connection(), &table).map(|keys| {
                keys.iter().any(|fk| {
                    fk.target_column
                        .as_deref()
                        .is_some_and(|column| self.tracker.was_renamed(&fk.target_table, column))
                })
            });
            let repointed = stale.and_then(|stale| {
                if !stale {
                    return Ok(false);
                }
                let rebuilder = TableRebuilder::new(self.db);
                let mut plan = rebuilder.plan(&table)?;
                self.follow_renames(&mut plan);
                rebuilder.rebuild(&plan)?;
                Ok(true)
            });
            match repointed {
                Ok(true) => {
                    info!(table = %table, "foreign keys follow renamed columns");
                    report.repointed_foreign_keys.push(table);
                }
                Ok(false) => {}
                Err(err) => report.skip(&table, &err),
            }
        }
        Ok(())
    }

    /// Makes sure the project table exists with its key and label columns.
    ///
    /// Returns `true` if the table was created. No rows are inserted.
    pub(crate) fn ensure_project_table(&mut self, report: &mut NormalizationReport) -> Result<bool> {
        let conn = self.db.connection();
        let mut created = false;
        match introspect::resolve_table(conn, PROJECT_TABLE)? {
            None => {
                self.db.execute(&project_table_sql(), [])?;
                info!("created project table");
                report.project_table_created = true;
                created = true;
            }
            Some(table) => {
                let columns = introspect::table_columns(conn, &table)?;
                if !columns.iter().any(|c| c.is_named(TRACKING_COLUMN)) {
                    let rebuilder = TableRebuilder::new(self.db);
                    let mut plan = rebuilder.plan(&table)?;
                    if let Some(id) = columns.iter().find(|c| c.is_named("id")) {
                        plan.rename_column(&id.name, TRACKING_COLUMN);
                        self.tracker.track(&table, &id.name, TRACKING_COLUMN);
                    } else {
                        plan.prepend_column(
                            ColumnDef::new(TRACKING_COLUMN, "INTEGER"),
                            ValueSource::RowId,
                        );
                    }
                    plan.set_primary_key(&[TRACKING_COLUMN]);
                    rebuilder.rebuild(&plan)?;
                    report.renamed_ids.push(table.clone());
                }
                if !columns.iter().any(|c| c.is_named(PROJECT_LABEL_COLUMN)) {
                    self.db
                        .execute(&add_column_sql(&table, PROJECT_LABEL_COLUMN, "TEXT"), [])?;
                }
            }
        }
        Ok(created)
    }

    fn bootstrap_project(&mut self, report: &mut NormalizationReport) -> Result<()> {
        self.ensure_project_table(report)?;
        let conn = self.db.connection();
        if introspect::row_count(conn, PROJECT_TABLE)? == 0 {
            self.db.execute(
                &format!(
                    "INSERT INTO {} ({}) VALUES (?1)",
                    quote_ident(PROJECT_TABLE),
                    quote_ident(PROJECT_LABEL_COLUMN)
                ),
                params![DEFAULT_PROJECT_LABEL],
            )?;
            debug!("inserted default project row");
        }

        report.backfilled_rows += self.backfill_tracking()?;
        Ok(())
    }

    /// Points `NULL` and dangling tracking values at the most recent project.
    fn backfill_tracking(&self) -> Result<usize> {
        let conn = self.db.connection();
        let latest: Option<i64> = conn.query_row(
            &format!(
                "SELECT MAX({}) FROM {}",
                quote_ident(TRACKING_COLUMN),
                quote_ident(PROJECT_TABLE)
            ),
            [],
            |row| row.get(0),
        )?;
        let Some(latest) = latest else {
            return Ok(0);
        };

        let mut updated = 0;
        for table in self.user_tables()? {
            if !self.has_tracking_column(&table)? {
                continue;
            }
            updated += self.db.execute(&point_tracking_sql(&table), params![latest])?;
        }
        if updated > 0 {
            info!(rows = updated, project = latest, "back-filled tracking column");
        }
        Ok(updated)
    }
}

/// `UPDATE` setting `NULL` or dangling tracking values of `table` to `?1`.
pub(crate) fn point_tracking_sql(table: &str) -> String {
    let tracking = quote_ident(TRACKING_COLUMN);
    format!(
        "UPDATE {} SET {tracking} = ?1 WHERE {tracking} IS NULL OR {tracking} NOT IN (SELECT {tracking} FROM {})",
        quote_ident(table),
        quote_ident(PROJECT_TABLE)
    )
}

/// `preferred`, or `preferred_2`, `preferred_3`, … if the plan already has it.
fn free_column_name(plan: &RebuildPlan, preferred: &str) -> String {
    if !plan.has_column(preferred) {
        return preferred.to_string();
    }
    (2..)
        .map(|n| format!("{preferred}_{n}"))
        .find(|name| !plan.has_column(name))
        .unwrap_or_else(|| preferred.to_string())
}

/// Counts non-null values of `table.column` with no text-equal match in
/// `target.target_column`.
fn count_unresolved(
    conn: &rusqlite::Connection,
    table: &str,
    column: &str,
    target: &str,
    target_column: &str,
) -> Result<u64> {
    let col = quote_ident(column);
    let target_col = quote_ident(target_column);
    let sql = format!(
        "SELECT COUNT(*) FROM {} AS t WHERE t.{col} IS NOT NULL AND NOT EXISTS \
         (SELECT 1 FROM {} AS m WHERE CAST(m.{target_col} AS TEXT) = CAST(t.{col} AS TEXT))",
        quote_ident(table),
        quote_ident(target)
    );
    let count: i64 = conn.query_row(&sql, [], |row| row.get(0))?;
    Ok(count as u64)
}
