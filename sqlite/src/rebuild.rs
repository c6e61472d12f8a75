//! Transactional table rebuilds.
//!
//! SQLite's `ALTER TABLE` cannot add constraints, change a primary key, or
//! (portably) drop columns. Every such change is made by rebuilding the
//! table:
//!
//! 1. read the current definition into a [`RebuildPlan`]
//! 2. edit the plan (rename, promote, add, remove, add foreign keys)
//! 3. create a uniquely named temp table from the plan
//! 4. `INSERT INTO temp … SELECT … FROM original`
//! 5. drop the original, rename the temp table into place
//! 6. recreate the indexes and triggers that still apply, commit
//!
//! All of it runs in one transaction. If any step fails the transaction
//! rolls back and the original table is left exactly as it was.
//!
//! The plan carries everything the original declared: defaults, `NOT NULL`,
//! collations, `UNIQUE` sets, `CHECK` expressions, foreign keys and table
//! options. Renames are followed into checks, indexes and triggers. A
//! constraint, index or trigger that names a removed column is dropped with
//! a warning. Tables whose definition cannot be reproduced (virtual tables,
//! tables with generated columns) are refused at the plan step.
//!
//! # Example
//!
//! ```no_run
//! use relforge_sqlite::{Database, TableRebuilder};
//!
//! let db = Database::open("project.db").unwrap();
//! let rebuilder = TableRebuilder::new(&db);
//! let mut plan = rebuilder.plan("orders").unwrap();
//! plan.rename_column("id", "orders_id");
//! plan.set_primary_key(&["orders_id"]);
//! rebuilder.rebuild(&plan).unwrap();
//! ```

use std::collections::HashSet;

use relforge_core::{ColumnInfo, is_system_table, same_identifier};
use tracing::{debug, info, warn};

use crate::database::Database;
use crate::ddl::{self, ColumnChanges};
use crate::error::{EngineError, RebuildStep, Result};
use crate::introspect;
use crate::schema::{
    ColumnDef, ForeignKeyClause, TableSpec, create_table_sql, quote_ident, temp_table_name,
};

/// Where a column of the rebuilt table takes its values from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueSource {
    /// Copy an existing column of the original table.
    Column(String),
    /// Leave the column `NULL`.
    Null,
    /// Copy the original row's `rowid`.
    RowId,
    /// Look the value up in another table: the first row of `target_table`
    /// whose `target_column` equals `column` when both are cast to text.
    Lookup {
        /// Column of the original table holding the raw value.
        column: String,
        /// Table to search.
        target_table: String,
        /// Column of `target_table` to match and return.
        target_column: String,
    },
}

impl ValueSource {
    fn select_expr(&self) -> String {
        match self {
            Self::Column(column) => format!("t.{}", quote_ident(column)),
            Self::Null => "NULL".to_string(),
            Self::RowId => "t.rowid".to_string(),
            Self::Lookup {
                column,
                target_table,
                target_column,
            } => {
                let target_column = quote_ident(target_column);
                format!(
                    "(SELECT m.{target_column} FROM {} AS m \
                     WHERE CAST(m.{target_column} AS TEXT) = CAST(t.{} AS TEXT) LIMIT 1)",
                    quote_ident(target_table),
                    quote_ident(column)
                )
            }
        }
    }

    /// The original column this source reads, if any.
    pub fn source_column(&self) -> Option<&str> {
        match self {
            Self::Column(column) | Self::Lookup { column, .. } => Some(column),
            Self::Null | Self::RowId => None,
        }
    }
}

/// One column of the replacement table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnPlan {
    /// Definition in the new table.
    pub def: ColumnDef,
    /// Where its values come from.
    pub source: ValueSource,
}

/// The full definition of a table's replacement.
///
/// Built from the live schema by [`TableRebuilder::plan`] with every column
/// copied as-is, then edited. Column defaults, `NOT NULL`, collations,
/// existing foreign keys and `AUTOINCREMENT` carry over unless an edit
/// changes them.
///
/// `unique` and `checks` stay in terms of the original column names; they
/// are mapped through the plan's renames and removals when the statement is
/// rendered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebuildPlan {
    /// Table being rebuilt (on-disk spelling).
    pub table: String,
    /// Columns in output order.
    pub columns: Vec<ColumnPlan>,
    /// Primary-key column names.
    pub primary_key: Vec<String>,
    /// Whether a single integer key is declared `AUTOINCREMENT`.
    pub autoincrement: bool,
    /// `FOREIGN KEY` clauses.
    pub foreign_keys: Vec<ForeignKeyClause>,
    /// `UNIQUE` column sets of the original table.
    pub unique: Vec<Vec<String>>,
    /// `CHECK` expressions of the original table.
    pub checks: Vec<String>,
    /// Table options such as `WITHOUT ROWID` or `STRICT`.
    pub options: String,
    original_columns: Vec<String>,
}

/// Unique sets and checks that survive a plan's column changes.
#[derive(Debug, Default)]
struct CarriedConstraints {
    unique: Vec<Vec<String>>,
    checks: Vec<String>,
    dropped: Vec<String>,
}

impl RebuildPlan {
    /// Plan that copies `columns` unchanged.
    pub fn from_columns(table: &str, columns: &[ColumnInfo]) -> Self {
        let columns_plan = columns
            .iter()
            .map(|col| ColumnPlan {
                def: ColumnDef {
                    name: col.name.clone(),
                    declared_type: col.declared_type.clone(),
                    not_null: col.not_null,
                    default_value: col.default_value.clone(),
                    collation: None,
                },
                source: ValueSource::Column(col.name.clone()),
            })
            .collect();
        Self {
            table: table.to_string(),
            columns: columns_plan,
            primary_key: introspect::primary_key_columns(columns),
            autoincrement: false,
            foreign_keys: Vec::new(),
            unique: Vec::new(),
            checks: Vec::new(),
            options: String::new(),
            original_columns: columns.iter().map(|c| c.name.clone()).collect(),
        }
    }

    /// Returns `true` if the plan has a column named `name` (ignoring case).
    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    /// Finds a column by name, ignoring case.
    pub fn column(&self, name: &str) -> Option<&ColumnPlan> {
        self.columns
            .iter()
            .find(|c| same_identifier(&c.def.name, name))
    }

    /// Renames a column, following the change into the primary key and
    /// foreign-key clauses. Values still come from the old column.
    pub fn rename_column(&mut self, old: &str, new: &str) {
        for col in &mut self.columns {
            if same_identifier(&col.def.name, old) {
                col.def.name = new.to_string();
            }
        }
        for key in &mut self.primary_key {
            if same_identifier(key, old) {
                *key = new.to_string();
            }
        }
        for fk in &mut self.foreign_keys {
            if same_identifier(&fk.column, old) {
                fk.column = new.to_string();
            }
        }
    }

    /// Replaces the primary key. `AUTOINCREMENT` is kept only when the key
    /// columns are unchanged.
    pub fn set_primary_key(&mut self, columns: &[&str]) {
        let unchanged = columns.len() == self.primary_key.len()
            && columns
                .iter()
                .zip(&self.primary_key)
                .all(|(a, b)| same_identifier(a, b));
        if !unchanged {
            self.autoincrement = false;
        }
        self.primary_key = columns.iter().map(|c| c.to_string()).collect();
    }

    /// Appends a new column.
    pub fn add_column(&mut self, def: ColumnDef, source: ValueSource) {
        self.columns.push(ColumnPlan { def, source });
    }

    /// Inserts a new column at the front, e.g. a synthesized key.
    pub fn prepend_column(&mut self, def: ColumnDef, source: ValueSource) {
        self.columns.insert(0, ColumnPlan { def, source });
    }

    /// Removes a column along with its primary-key and foreign-key entries.
    ///
    /// Returns `false` if no such column existed.
    pub fn remove_column(&mut self, name: &str) -> bool {
        let before = self.columns.len();
        self.columns.retain(|c| !same_identifier(&c.def.name, name));
        self.primary_key.retain(|k| !same_identifier(k, name));
        self.foreign_keys.retain(|fk| !same_identifier(&fk.column, name));
        self.columns.len() != before
    }

    /// Adds a foreign-key clause, replacing any existing clause on the same
    /// column.
    pub fn add_foreign_key(&mut self, clause: ForeignKeyClause) {
        self.foreign_keys
            .retain(|fk| !same_identifier(&fk.column, &clause.column));
        self.foreign_keys.push(clause);
    }

    /// Checks that the plan describes a valid table.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidPlan`] for an empty column list, column
    /// names that collide case-insensitively, or key and foreign-key clauses
    /// naming missing columns.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| EngineError::InvalidPlan {
            table: self.table.clone(),
            reason,
        };

        if self.columns.is_empty() {
            return Err(invalid("no columns".to_string()));
        }
        let mut seen = HashSet::new();
        for col in &self.columns {
            if col.def.name.trim().is_empty() {
                return Err(invalid("empty column name".to_string()));
            }
            if !seen.insert(col.def.name.to_ascii_lowercase()) {
                return Err(invalid(format!("duplicate column '{}'", col.def.name)));
            }
        }
        for key in &self.primary_key {
            if !self.has_column(key) {
                return Err(invalid(format!("primary key column '{key}' is missing")));
            }
        }
        for fk in &self.foreign_keys {
            if !self.has_column(&fk.column) {
                return Err(invalid(format!(
                    "foreign key column '{}' is missing",
                    fk.column
                )));
            }
        }
        if self.without_rowid() {
            if self.primary_key.is_empty() {
                return Err(invalid("WITHOUT ROWID table needs a primary key".to_string()));
            }
            if self.columns.iter().any(|c| c.source == ValueSource::RowId) {
                return Err(invalid("WITHOUT ROWID table has no rowid to copy".to_string()));
            }
        }
        Ok(())
    }

    fn without_rowid(&self) -> bool {
        ddl::tokenize(&self.options)
            .windows(2)
            .any(|w| w[0].is_keyword("WITHOUT") && w[1].is_keyword("ROWID"))
    }

    /// Original columns that were renamed or are no longer copied.
    pub(crate) fn column_changes(&self) -> ColumnChanges {
        let mut changes = ColumnChanges::default();
        for col in &self.columns {
            if let ValueSource::Column(source) = &col.source {
                if !same_identifier(source, &col.def.name) {
                    changes.renamed.push((source.clone(), col.def.name.clone()));
                }
            }
        }
        changes.removed = self
            .original_columns
            .iter()
            .filter(|orig| {
                !self.columns.iter().any(
                    |c| matches!(&c.source, ValueSource::Column(source) if same_identifier(source, orig)),
                )
            })
            .cloned()
            .collect();
        changes
    }

    fn carried_constraints(&self) -> CarriedConstraints {
        let changes = self.column_changes();
        let mut carried = CarriedConstraints::default();
        for set in &self.unique {
            if set.iter().any(|c| changes.is_removed(c)) {
                carried.dropped.push(format!("UNIQUE ({})", set.join(", ")));
                continue;
            }
            carried.unique.push(
                set.iter()
                    .map(|c| changes.new_name(c).unwrap_or(c.as_str()).to_string())
                    .collect(),
            );
        }
        for check in &self.checks {
            match ddl::rewrite_check(check, &changes) {
                Some(expr) => carried.checks.push(expr),
                None => carried.dropped.push(format!("CHECK ({check})")),
            }
        }
        carried
    }

    /// `CREATE TABLE` statement for the replacement under `name`.
    pub fn create_sql(&self, name: &str) -> String {
        let defs: Vec<ColumnDef> = self.columns.iter().map(|c| c.def.clone()).collect();
        let carried = self.carried_constraints();
        create_table_sql(
            name,
            &TableSpec {
                columns: &defs,
                primary_key: &self.primary_key,
                autoincrement: self.autoincrement,
                foreign_keys: &self.foreign_keys,
                unique: &carried.unique,
                checks: &carried.checks,
                options: &self.options,
            },
        )
    }

    /// `INSERT … SELECT` statement filling `temp` from the original table.
    pub fn copy_sql(&self, temp: &str) -> String {
        let targets = self
            .columns
            .iter()
            .map(|c| quote_ident(&c.def.name))
            .collect::<Vec<_>>()
            .join(", ");
        let exprs = self
            .columns
            .iter()
            .map(|c| c.source.select_expr())
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "INSERT INTO {} ({targets}) SELECT {exprs} FROM {} AS t",
            quote_ident(temp),
            quote_ident(&self.table)
        )
    }
}

/// What a completed rebuild did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebuildOutcome {
    /// Table that was rebuilt.
    pub table: String,
    /// Rows copied into the replacement.
    pub rows_copied: usize,
    /// Indexes that no longer applied and were not recreated.
    pub skipped_indexes: Vec<String>,
    /// Triggers that no longer applied and were not recreated.
    pub skipped_triggers: Vec<String>,
}

/// Runs the rebuild protocol against a [`Database`].
///
/// # Examples
///
/// ```
/// use relforge_sqlite::{Database, TableRebuilder};
///
/// let db = Database::open_in_memory().unwrap();
/// db.connection()
///     .execute_batch("CREATE TABLE t (id INTEGER, name TEXT); INSERT INTO t VALUES (1, 'a');")
///     .unwrap();
///
/// let rebuilder = TableRebuilder::new(&db);
/// let mut plan = rebuilder.plan("t").unwrap();
/// plan.remove_column("name");
/// let outcome = rebuilder.rebuild(&plan).unwrap();
/// assert_eq!(outcome.rows_copied, 1);
/// ```
#[derive(Debug)]
pub struct TableRebuilder<'a> {
    db: &'a Database,
    temp_name: Option<String>,
}

impl<'a> TableRebuilder<'a> {
    /// Creates a rebuilder that generates its own temp-table names.
    pub fn new(db: &'a Database) -> Self {
        Self { db, temp_name: None }
    }

    /// Pins the temp-table name. A name that already exists makes the
    /// create step fail; the existing table is left alone.
    pub fn with_temp_name(mut self, name: &str) -> Self {
        self.temp_name = Some(name.to_string());
        self
    }

    /// Reads the live definition of `table` into a plan that copies every
    /// column unchanged.
    pub fn plan(&self, table: &str) -> Result<RebuildPlan> {
        self.read_plan(table)
            .map_err(|err| err.at_step(table, RebuildStep::ReadSchema))
    }

    fn read_plan(&self, table: &str) -> Result<RebuildPlan> {
        let conn = self.db.connection();
        let table = introspect::require_table(conn, table)?;
        let refuse = |reason: &str| EngineError::InvalidPlan {
            table: table.clone(),
            reason: reason.to_string(),
        };

        let stored = introspect::create_statement(conn, &table)?;
        if ddl::is_virtual_table(&stored) {
            return Err(refuse("virtual tables cannot be rebuilt"));
        }
        if introspect::has_generated_columns(conn, &table)? {
            return Err(refuse("tables with generated columns cannot be rebuilt"));
        }
        let parsed = ddl::parse_create_table(&stored)
            .ok_or_else(|| refuse("stored definition has no column list"))?;

        let columns = introspect::table_columns(conn, &table)?;
        let mut plan = RebuildPlan::from_columns(&table, &columns);
        for (column, collation) in parsed.collations {
            if let Some(col) = plan
                .columns
                .iter_mut()
                .find(|c| same_identifier(&c.def.name, &column))
            {
                col.def.collation = Some(collation);
            }
        }
        plan.checks = parsed.checks;
        plan.options = parsed.options;
        plan.unique = introspect::unique_constraints(conn, &table)?;
        plan.autoincrement =
            plan.primary_key.len() == 1 && introspect::uses_autoincrement(conn, &table)?;
        plan.foreign_keys = introspect::foreign_keys(conn, &table)?
            .into_iter()
            .map(|fk| ForeignKeyClause {
                column: fk.column,
                target_table: fk.target_table,
                target_column: fk.target_column,
            })
            .collect();
        Ok(plan)
    }

    fn choose_temp_name(&self, table: &str) -> Result<String> {
        if let Some(name) = &self.temp_name {
            return Ok(name.clone());
        }
        loop {
            let name = temp_table_name(table);
            if !introspect::table_exists(self.db.connection(), &name)? {
                return Ok(name);
            }
        }
    }

    /// Replaces `plan.table` with the table `plan` describes.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Rebuild`] naming the failed step. The original
    /// table is unchanged after any error.
    pub fn rebuild(&self, plan: &RebuildPlan) -> Result<RebuildOutcome> {
        let table = plan.table.as_str();
        if is_system_table(table) {
            return Err(EngineError::InvalidPlan {
                table: table.to_string(),
                reason: "system tables are never rebuilt".to_string(),
            }
            .at_step(table, RebuildStep::Plan));
        }
        plan.validate()
            .map_err(|err| err.at_step(table, RebuildStep::Plan))?;

        let conn = self.db.connection();
        let indexes = introspect::index_statements(conn, table)
            .map_err(|err| err.at_step(table, RebuildStep::ReadSchema))?;
        let triggers = introspect::trigger_statements(conn, table)
            .map_err(|err| err.at_step(table, RebuildStep::ReadSchema))?;
        let changes = plan.column_changes();
        for dropped in plan.carried_constraints().dropped {
            warn!(table, constraint = %dropped, "constraint names a removed column, dropping it");
        }
        let temp = self
            .choose_temp_name(table)
            .map_err(|err| err.at_step(table, RebuildStep::Plan))?;

        let executor = self.db.executor();
        let tx = self
            .db
            .begin()
            .map_err(|err| err.at_step(table, RebuildStep::Begin))?;

        debug!(table, temp = %temp, "creating temp table");
        executor
            .execute_batch(&tx, &plan.create_sql(&temp))
            .map_err(|err| err.at_step(table, RebuildStep::CreateTemp))?;

        let copied = executor.execute(&tx, &plan.copy_sql(&temp), []);
        let rows_copied = match copied {
            Ok(rows) => rows,
            Err(err) => {
                discard_temp(&tx, &temp);
                return Err(err.at_step(table, RebuildStep::CopyRows));
            }
        };

        if let Err(err) = executor.execute_batch(&tx, &format!("DROP TABLE {}", quote_ident(table)))
        {
            discard_temp(&tx, &temp);
            return Err(err.at_step(table, RebuildStep::DropOriginal));
        }

        let rename = format!(
            "ALTER TABLE {} RENAME TO {}",
            quote_ident(&temp),
            quote_ident(table)
        );
        if let Err(err) = executor.execute_batch(&tx, &rename) {
            discard_temp(&tx, &temp);
            return Err(err.at_step(table, RebuildStep::RenameTemp));
        }

        let mut skipped_indexes = Vec::new();
        for index in indexes {
            let Some(sql) = ddl::rewrite_index(&index.sql, &changes) else {
                warn!(table, index = %index.name, "index names a removed column, skipping");
                skipped_indexes.push(index.name);
                continue;
            };
            if let Err(err) = executor.execute_batch(&tx, &sql) {
                warn!(table, index = %index.name, error = %err, "index no longer applies, skipping");
                skipped_indexes.push(index.name);
            }
        }

        let mut skipped_triggers = Vec::new();
        for trigger in triggers {
            let Some(sql) = ddl::rewrite_trigger(&trigger.sql, table, &changes) else {
                warn!(table, trigger = %trigger.name, "trigger names a changed column, skipping");
                skipped_triggers.push(trigger.name);
                continue;
            };
            if let Err(err) = executor.execute_batch(&tx, &sql) {
                warn!(table, trigger = %trigger.name, error = %err, "trigger no longer applies, skipping");
                skipped_triggers.push(trigger.name);
            }
        }

        self.db
            .commit(tx)
            .map_err(|err| err.at_step(table, RebuildStep::Commit))?;

        info!(table, rows = rows_copied, "table rebuilt");
        Ok(RebuildOutcome {
            table: table.to_string(),
            rows_copied,
            skipped_indexes,
            skipped_triggers,
        })
    }
}

/// Drops a temp table this rebuild created. The transaction is rolled back
/// afterwards either way.
fn discard_temp(tx: &rusqlite::Transaction<'_>, temp: &str) {
    if let Err(err) = tx.execute_batch(&format!("DROP TABLE IF EXISTS {}", quote_ident(temp))) {
        debug!(temp, error = %err, "could not drop temp table before rollback");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.connection()
            .execute_batch(
                "CREATE TABLE customers (id INTEGER, name TEXT);
                 INSERT INTO customers VALUES (1, 'ada'), (2, 'bob');
                 CREATE TABLE orders (
                     id INTEGER,
                     customer_id INTEGER,
                     qty INTEGER NOT NULL DEFAULT 1,
                     note TEXT
                 );
                 CREATE INDEX idx_orders_note ON orders (note);
                 CREATE INDEX idx_orders_id ON orders (id);
                 INSERT INTO orders VALUES (10, 1, 2, 'x'), (11, 2, 3, NULL), (12, 9, 1, 'y');",
            )
            .unwrap();
        db
    }

    fn count(db: &Database, table: &str) -> u64 {
        introspect::row_count(db.connection(), table).unwrap()
    }

    #[test]
    fn test_rename_and_promote() {
        let db = setup();
        let rebuilder = TableRebuilder::new(&db);
        let mut plan = rebuilder.plan("customers").unwrap();
        plan.rename_column("id", "customers_id");
        plan.set_primary_key(&["customers_id"]);
        rebuilder.rebuild(&plan).unwrap();

        let columns = introspect::table_columns(db.connection(), "customers").unwrap();
        assert_eq!(columns[0].name, "customers_id");
        assert_eq!(columns[0].primary_key, 1);
        assert_eq!(count(&db, "customers"), 2);
        let name: String = db
            .connection()
            .query_row("SELECT name FROM customers WHERE customers_id = 2", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(name, "bob");
    }

    #[test]
    fn test_lookup_column_and_foreign_key() {
        let db = setup();
        let rebuilder = TableRebuilder::new(&db);
        let mut plan = rebuilder.plan("orders").unwrap();
        plan.add_column(
            ColumnDef::new("customers_id", "INTEGER"),
            ValueSource::Lookup {
                column: "customer_id".to_string(),
                target_table: "customers".to_string(),
                target_column: "id".to_string(),
            },
        );
        plan.add_foreign_key(ForeignKeyClause::new("customers_id", "customers", "id"));
        rebuilder.rebuild(&plan).unwrap();

        let conn = db.connection();
        let resolved: Vec<Option<i64>> = conn
            .prepare("SELECT customers_id FROM orders ORDER BY id")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<_, _>>()
            .unwrap();
        assert_eq!(resolved, vec![Some(1), Some(2), None]);

        let keys = introspect::foreign_keys(conn, "orders").unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].target_table, "customers");
    }

    #[test]
    fn test_preserves_constraints_and_indexes() {
        let db = setup();
        let rebuilder = TableRebuilder::new(&db);
        let mut plan = rebuilder.plan("orders").unwrap();
        plan.rename_column("id", "orders_id");
        plan.set_primary_key(&["orders_id"]);
        let outcome = rebuilder.rebuild(&plan).unwrap();

        assert_eq!(outcome.rows_copied, 3);
        assert!(outcome.skipped_indexes.is_empty());

        let conn = db.connection();
        let columns = introspect::table_columns(conn, "orders").unwrap();
        let qty = columns.iter().find(|c| c.name == "qty").unwrap();
        assert!(qty.not_null);
        assert_eq!(qty.default_value.as_deref(), Some("1"));

        let indexes = introspect::index_statements(conn, "orders").unwrap();
        assert_eq!(indexes.len(), 2);
        assert_eq!(indexes[0].name, "idx_orders_id");
        assert!(indexes[0].sql.contains("\"orders_id\""));
    }

    #[test]
    fn test_index_on_removed_column_skipped() {
        let db = setup();
        let rebuilder = TableRebuilder::new(&db);
        let mut plan = rebuilder.plan("orders").unwrap();
        plan.remove_column("note");
        let outcome = rebuilder.rebuild(&plan).unwrap();
        assert_eq!(outcome.skipped_indexes, vec!["idx_orders_note".to_string()]);
    }

    fn setup_users() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.connection()
            .execute_batch(
                "CREATE TABLE users (
                     id INTEGER,
                     email TEXT COLLATE NOCASE UNIQUE,
                     age INTEGER CHECK (age > 0),
                     nickname TEXT,
                     CHECK (id IS NOT NULL)
                 );
                 CREATE TABLE audit (user_ref INTEGER, email TEXT);
                 CREATE TRIGGER users_audit AFTER INSERT ON users
                 BEGIN INSERT INTO audit VALUES (NEW.id, NEW.email); END;
                 CREATE TRIGGER users_nick AFTER UPDATE ON users
                 BEGIN UPDATE audit SET email = NEW.nickname WHERE user_ref = NEW.id; END;
                 INSERT INTO users VALUES (1, 'a@x', 30, 'al');",
            )
            .unwrap();
        db
    }

    #[test]
    fn test_rename_keeps_unique_check_and_triggers() {
        let db = setup_users();
        let rebuilder = TableRebuilder::new(&db);
        let mut plan = rebuilder.plan("users").unwrap();
        plan.rename_column("id", "users_id");
        plan.set_primary_key(&["users_id"]);
        let outcome = rebuilder.rebuild(&plan).unwrap();
        assert!(outcome.skipped_triggers.is_empty());

        let conn = db.connection();
        // unique under the column's NOCASE collation
        assert!(conn.execute("INSERT INTO users VALUES (2, 'A@X', 20, NULL)", []).is_err());
        assert!(conn.execute("INSERT INTO users VALUES (3, 'b@x', -5, NULL)", []).is_err());
        let stored = introspect::create_statement(conn, "users").unwrap();
        assert!(stored.contains("CHECK (\"users_id\" IS NOT NULL)"));

        conn.execute("INSERT INTO users VALUES (7, 'd@x', 40, NULL)", []).unwrap();
        let audited: i64 = conn
            .query_row("SELECT COUNT(*) FROM audit WHERE user_ref = 7", [], |row| row.get(0))
            .unwrap();
        assert_eq!(audited, 1);
        let triggers = introspect::trigger_statements(conn, "users").unwrap();
        assert_eq!(triggers.len(), 2);
        assert!(triggers.iter().all(|t| t.sql.contains("NEW.\"users_id\"")));
    }

    #[test]
    fn test_removed_column_drops_its_constraints_and_triggers() {
        let db = setup_users();
        let rebuilder = TableRebuilder::new(&db);
        let mut plan = rebuilder.plan("users").unwrap();
        plan.remove_column("nickname");
        plan.remove_column("age");
        let outcome = rebuilder.rebuild(&plan).unwrap();
        assert_eq!(outcome.skipped_triggers, vec!["users_nick".to_string()]);

        let conn = db.connection();
        assert!(conn.execute("INSERT INTO users VALUES (2, 'a@x')", []).is_err());
        assert!(conn.execute("INSERT INTO users VALUES (NULL, 'z@x')", []).is_err());
        let stored = introspect::create_statement(conn, "users").unwrap();
        assert!(!stored.contains("age"));
    }

    #[test]
    fn test_unreproducible_tables_refused() {
        let db = Database::open_in_memory().unwrap();
        db.connection()
            .execute_batch(
                "CREATE TABLE people (first TEXT, last TEXT, display TEXT AS (first || last));",
            )
            .unwrap();
        let err = TableRebuilder::new(&db).plan("people").unwrap_err();
        assert!(matches!(
            err,
            EngineError::Rebuild {
                step: RebuildStep::ReadSchema,
                ..
            }
        ));
    }

    #[test]
    fn test_without_rowid_preserved() {
        let db = Database::open_in_memory().unwrap();
        db.connection()
            .execute_batch(
                "CREATE TABLE codes (code TEXT PRIMARY KEY, label TEXT) WITHOUT ROWID;
                 INSERT INTO codes VALUES ('a', 'x');",
            )
            .unwrap();
        let rebuilder = TableRebuilder::new(&db);
        let mut plan = rebuilder.plan("codes").unwrap();
        plan.add_column(ColumnDef::new("extra", "TEXT"), ValueSource::Null);
        rebuilder.rebuild(&plan).unwrap();
        let stored = introspect::create_statement(db.connection(), "codes").unwrap();
        assert!(stored.ends_with("WITHOUT ROWID"));

        let mut plan = rebuilder.plan("codes").unwrap();
        plan.prepend_column(ColumnDef::new("codes_id", "INTEGER"), ValueSource::RowId);
        assert!(rebuilder.rebuild(&plan).is_err());
    }

    #[test]
    fn test_duplicate_columns_rejected_at_plan_step() {
        let db = setup();
        let rebuilder = TableRebuilder::new(&db);
        let mut plan = rebuilder.plan("orders").unwrap();
        plan.add_column(ColumnDef::new("NOTE", "TEXT"), ValueSource::Null);

        let err = rebuilder.rebuild(&plan).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Rebuild {
                step: RebuildStep::Plan,
                ..
            }
        ));
        assert_eq!(count(&db, "orders"), 3);
    }

    #[test]
    fn test_pinned_temp_collision_leaves_original_intact() {
        let db = setup();
        db.connection()
            .execute_batch("CREATE TABLE orders_shadow (x INTEGER); INSERT INTO orders_shadow VALUES (7);")
            .unwrap();
        let before = introspect::table_columns(db.connection(), "orders").unwrap();

        let rebuilder = TableRebuilder::new(&db).with_temp_name("orders_shadow");
        let mut plan = rebuilder.plan("orders").unwrap();
        plan.remove_column("note");
        let err = rebuilder.rebuild(&plan).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Rebuild {
                step: RebuildStep::CreateTemp,
                ..
            }
        ));

        let after = introspect::table_columns(db.connection(), "orders").unwrap();
        assert_eq!(before, after);
        assert_eq!(count(&db, "orders"), 3);
        assert_eq!(count(&db, "orders_shadow"), 1);
    }

    #[test]
    fn test_copy_failure_rolls_back() {
        let db = setup();
        let rebuilder = TableRebuilder::new(&db);
        let mut plan = rebuilder.plan("orders").unwrap();
        // customer_id is not unique, so the copy violates the new key
        plan.set_primary_key(&["customer_id"]);
        db.connection()
            .execute("UPDATE orders SET customer_id = 1", [])
            .unwrap();

        let err = rebuilder.rebuild(&plan).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Rebuild {
                step: RebuildStep::CopyRows,
                ..
            }
        ));
        assert_eq!(db.tables().unwrap(), vec!["customers", "orders"]);
        assert_eq!(count(&db, "orders"), 3);
    }

    #[test]
    fn test_system_tables_never_rebuilt() {
        let db = Database::open_in_memory().unwrap();
        db.connection()
            .execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY AUTOINCREMENT); INSERT INTO t DEFAULT VALUES;")
            .unwrap();
        let plan = RebuildPlan::from_columns(
            "sqlite_sequence",
            &[ColumnInfo::new(0, "name", ""), ColumnInfo::new(1, "seq", "")],
        );
        let err = TableRebuilder::new(&db).rebuild(&plan).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Rebuild {
                step: RebuildStep::Plan,
                ..
            }
        ));
    }

    #[test]
    fn test_zero_row_table() {
        let db = Database::open_in_memory().unwrap();
        db.connection()
            .execute_batch("CREATE TABLE empty (id INTEGER, v TEXT);")
            .unwrap();
        let rebuilder = TableRebuilder::new(&db);
        let mut plan = rebuilder.plan("empty").unwrap();
        plan.rename_column("id", "empty_id");
        plan.set_primary_key(&["empty_id"]);
        let outcome = rebuilder.rebuild(&plan).unwrap();
        assert_eq!(outcome.rows_copied, 0);
    }

    #[test]
    fn test_autoincrement_preserved() {
        let db = Database::open_in_memory().unwrap();
        db.connection()
            .execute_batch(
                "CREATE TABLE p (p_id INTEGER PRIMARY KEY AUTOINCREMENT, label TEXT);
                 INSERT INTO p (label) VALUES ('a'), ('b');",
            )
            .unwrap();
        let rebuilder = TableRebuilder::new(&db);
        let mut plan = rebuilder.plan("p").unwrap();
        assert!(plan.autoincrement);
        plan.add_column(ColumnDef::new("extra", "TEXT"), ValueSource::Null);
        rebuilder.rebuild(&plan).unwrap();
        assert!(introspect::uses_autoincrement(db.connection(), "p").unwrap());
    }

    #[test]
    fn test_rowid_source() {
        let db = Database::open_in_memory().unwrap();
        db.connection()
            .execute_batch("CREATE TABLE notes (body TEXT); INSERT INTO notes VALUES ('a'), ('b');")
            .unwrap();
        let rebuilder = TableRebuilder::new(&db);
        let mut plan = rebuilder.plan("notes").unwrap();
        plan.prepend_column(ColumnDef::new("notes_id", "INTEGER"), ValueSource::RowId);
        plan.set_primary_key(&["notes_id"]);
        rebuilder.rebuild(&plan).unwrap();

        let ids: Vec<i64> = db
            .connection()
            .prepare("SELECT notes_id FROM notes ORDER BY notes_id")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<_, _>>()
            .unwrap();
        assert_eq!(ids, vec![1, 2]);
    }
}
