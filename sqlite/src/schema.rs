//! SQL text generation.
//!
//! Identifier quoting, column and table definitions, and the fixed DDL of
//! the project-metadata table. Every statement the engine builds from
//! user-controlled table or column names goes through [`quote_ident`].
//!
//! # Project table
//!
//! The normalized layout carries one `ProjectInformation` table:
//!
//! - `ProjectInformation_id` — `INTEGER PRIMARY KEY AUTOINCREMENT`
//! - `ProjectName` — free-text project label

use std::sync::atomic::{AtomicU64, Ordering};

use relforge_core::{PROJECT_LABEL_COLUMN, PROJECT_TABLE, TRACKING_COLUMN};

/// Label given to the row inserted into an empty project table.
pub const DEFAULT_PROJECT_LABEL: &str = "Default project";

/// Quotes an identifier for SQLite, doubling embedded quotes.
///
/// # Examples
///
/// ```
/// use relforge_sqlite::quote_ident;
///
/// assert_eq!(quote_ident("orders"), "\"orders\"");
/// assert_eq!(quote_ident("odd\"name"), "\"odd\"\"name\"");
/// ```
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quotes a string literal for SQLite, doubling embedded single quotes.
pub(crate) fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Joins quoted identifiers with `, `.
pub(crate) fn quoted_list<'a>(names: impl IntoIterator<Item = &'a str>) -> String {
    names
        .into_iter()
        .map(quote_ident)
        .collect::<Vec<_>>()
        .join(", ")
}

/// One column of a `CREATE TABLE` statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    /// Column name.
    pub name: String,
    /// Declared type; may be empty.
    pub declared_type: String,
    /// `NOT NULL` constraint.
    pub not_null: bool,
    /// Default expression, verbatim SQL.
    pub default_value: Option<String>,
    /// Declared collation, e.g. `NOCASE`.
    pub collation: Option<String>,
}

impl ColumnDef {
    /// Creates a nullable column without default.
    pub fn new(name: &str, declared_type: &str) -> Self {
        Self {
            name: name.to_string(),
            declared_type: declared_type.to_string(),
            not_null: false,
            default_value: None,
            collation: None,
        }
    }

    /// Renders the column definition. `inline_primary_key` appends
    /// `PRIMARY KEY` (and `AUTOINCREMENT` when requested and legal).
    pub(crate) fn render(&self, inline_primary_key: bool, autoincrement: bool) -> String {
        let mut sql = quote_ident(&self.name);
        if !self.declared_type.trim().is_empty() {
            sql.push(' ');
            sql.push_str(self.declared_type.trim());
        }
        if inline_primary_key {
            sql.push_str(" PRIMARY KEY");
            if autoincrement && self.declared_type.trim().eq_ignore_ascii_case("INTEGER") {
                sql.push_str(" AUTOINCREMENT");
            }
        }
        if self.not_null {
            sql.push_str(" NOT NULL");
        }
        if let Some(default) = &self.default_value {
            sql.push_str(" DEFAULT ");
            sql.push_str(default);
        }
        if let Some(collation) = &self.collation {
            sql.push_str(" COLLATE ");
            sql.push_str(&quote_ident(collation));
        }
        sql
    }
}

/// A `FOREIGN KEY` table constraint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKeyClause {
    /// Referencing column.
    pub column: String,
    /// Referenced table.
    pub target_table: String,
    /// Referenced column; `None` references the target's primary key.
    pub target_column: Option<String>,
}

impl ForeignKeyClause {
    /// Creates a clause referencing `target_table(target_column)`.
    pub fn new(column: &str, target_table: &str, target_column: &str) -> Self {
        Self {
            column: column.to_string(),
            target_table: target_table.to_string(),
            target_column: Some(target_column.to_string()),
        }
    }

    pub(crate) fn render(&self) -> String {
        let mut sql = format!(
            "FOREIGN KEY ({}) REFERENCES {}",
            quote_ident(&self.column),
            quote_ident(&self.target_table)
        );
        if let Some(target_column) = &self.target_column {
            sql.push_str(&format!(" ({})", quote_ident(target_column)));
        }
        sql
    }
}

/// Everything a rebuilt `CREATE TABLE` statement declares.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct TableSpec<'a> {
    pub columns: &'a [ColumnDef],
    pub primary_key: &'a [String],
    pub autoincrement: bool,
    pub foreign_keys: &'a [ForeignKeyClause],
    /// Column sets declared `UNIQUE`.
    pub unique: &'a [Vec<String>],
    /// `CHECK` expressions.
    pub checks: &'a [String],
    /// Trailing table options such as `WITHOUT ROWID` or `STRICT`.
    pub options: &'a str,
}

/// Renders a complete `CREATE TABLE` statement.
///
/// A single primary-key column is declared inline (so an `INTEGER` key
/// stays a rowid alias); composite keys become a table constraint.
pub(crate) fn create_table_sql(table: &str, spec: &TableSpec<'_>) -> String {
    let primary_key = spec.primary_key;
    let inline_pk = primary_key.len() == 1;
    let mut parts: Vec<String> = spec
        .columns
        .iter()
        .map(|col| {
            let is_pk = inline_pk && col.name.eq_ignore_ascii_case(&primary_key[0]);
            col.render(is_pk, spec.autoincrement)
        })
        .collect();

    if primary_key.len() > 1 {
        parts.push(format!(
            "PRIMARY KEY ({})",
            quoted_list(primary_key.iter().map(String::as_str))
        ));
    }
    parts.extend(
        spec.unique
            .iter()
            .map(|set| format!("UNIQUE ({})", quoted_list(set.iter().map(String::as_str)))),
    );
    parts.extend(spec.checks.iter().map(|expr| format!("CHECK ({expr})")));
    parts.extend(spec.foreign_keys.iter().map(ForeignKeyClause::render));

    let mut sql = format!("CREATE TABLE {} ({})", quote_ident(table), parts.join(", "));
    if !spec.options.trim().is_empty() {
        sql.push(' ');
        sql.push_str(spec.options.trim());
    }
    sql
}

/// DDL of a fresh project-metadata table.
pub(crate) fn project_table_sql() -> String {
    format!(
        "CREATE TABLE {} ({} INTEGER PRIMARY KEY AUTOINCREMENT, {} TEXT)",
        quote_ident(PROJECT_TABLE),
        quote_ident(TRACKING_COLUMN),
        quote_ident(PROJECT_LABEL_COLUMN)
    )
}

/// `ALTER TABLE … ADD COLUMN` for a nullable column.
pub(crate) fn add_column_sql(table: &str, column: &str, declared_type: &str) -> String {
    let def = ColumnDef::new(column, declared_type);
    format!(
        "ALTER TABLE {} ADD COLUMN {}",
        quote_ident(table),
        def.render(false, false)
    )
}

/// Marker separating a table name from a temp-table suffix.
pub(crate) const TEMP_MARKER: &str = "_temp_";

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Builds a temp-table name derived from `table`: `<table>_temp_<millis>_<n>`.
///
/// The millisecond timestamp plus a process-wide counter keeps names unique
/// across calls; callers still check the name against existing tables.
pub(crate) fn temp_table_name(table: &str) -> String {
    let millis = chrono::Utc::now().timestamp_millis();
    let n = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{table}{TEMP_MARKER}{millis}_{n}")
}

/// Digits in the millisecond timestamp of a temp-table name.
const TEMP_MILLIS_DIGITS: usize = 13;

/// The table a temp name was derived from, if `name` has the exact
/// `<table>_temp_<millis>_<n>` shape produced by [`temp_table_name`].
pub(crate) fn temp_table_base(name: &str) -> Option<&str> {
    let idx = name.rfind(TEMP_MARKER)?;
    if idx == 0 {
        return None;
    }
    let (millis, counter) = name[idx + TEMP_MARKER.len()..].split_once('_')?;
    let digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    (millis.len() == TEMP_MILLIS_DIGITS && digits(millis) && digits(counter))
        .then(|| &name[..idx])
}
