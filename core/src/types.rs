//! Type definitions for inferred relational structure.
//!
//! This module defines the data model shared by every stage of the engine:
//! column and foreign-key metadata read from a live database, candidate
//! relations proposed by discovery, the project id mapping built during a
//! merge, and the naming conventions of the normalized layout. The types are
//! plain data with [`serde`] support so relation lists and reports can be
//! handed to collaborators as JSON.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Name of the project-metadata table every normalized database carries.
pub const PROJECT_TABLE: &str = "ProjectInformation";

/// Name of the tracking column that ties each row to a project.
pub const TRACKING_COLUMN: &str = "ProjectInformation_id";

/// Label column of the project-metadata table.
pub const PROJECT_LABEL_COLUMN: &str = "ProjectName";

/// Bookkeeping table SQLite maintains for `AUTOINCREMENT` keys.
pub const SEQUENCE_TABLE: &str = "sqlite_sequence";

/// Prefix reserved by SQLite for its internal tables (including the schema catalog).
pub const SYSTEM_TABLE_PREFIX: &str = "sqlite_";

/// Returns the canonical primary-key column name for `table` (`<table>_id`).
///
/// # Examples
///
/// ```
/// assert_eq!(relforge_core::id_column_name("orders"), "orders_id");
/// ```
pub fn id_column_name(table: &str) -> String {
    format!("{table}_id")
}

/// Returns `true` for tables the engine must never rewrite or report.
///
/// Covers `sqlite_sequence`, the schema catalog, and every other table in the
/// reserved `sqlite_` namespace.
///
/// # Examples
///
/// ```
/// use relforge_core::is_system_table;
///
/// assert!(is_system_table("sqlite_sequence"));
/// assert!(is_system_table("SQLITE_MASTER"));
/// assert!(!is_system_table("orders"));
/// ```
pub fn is_system_table(table: &str) -> bool {
    table
        .get(..SYSTEM_TABLE_PREFIX.len())
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case(SYSTEM_TABLE_PREFIX))
}

/// Returns `true` if `table` is the project-metadata table.
pub fn is_project_table(table: &str) -> bool {
    table.eq_ignore_ascii_case(PROJECT_TABLE)
}

/// Returns `true` if `column` is id-like: named `id` or ending in `id`,
/// case-insensitively.
///
/// # Examples
///
/// ```
/// use relforge_core::is_id_like;
///
/// assert!(is_id_like("id"));
/// assert!(is_id_like("CustomerID"));
/// assert!(is_id_like("orders_id"));
/// assert!(!is_id_like("name"));
/// ```
pub fn is_id_like(column: &str) -> bool {
    column.to_ascii_lowercase().ends_with("id")
}

/// Case-insensitive identifier comparison, matching how SQLite resolves
/// table and column names.
pub fn same_identifier(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

/// Metadata for one column, as reported by `PRAGMA table_info`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    /// Zero-based ordinal position within the table.
    pub position: usize,
    /// Column name as stored on disk.
    pub name: String,
    /// Declared type; free-form text, possibly empty.
    pub declared_type: String,
    /// Whether the column carries a `NOT NULL` constraint.
    pub not_null: bool,
    /// Default value expression, verbatim SQL text.
    pub default_value: Option<String>,
    /// One-based position within the primary key, `0` when not part of it.
    pub primary_key: usize,
}

impl ColumnInfo {
    /// Creates a nullable, non-key column.
    ///
    /// # Examples
    ///
    /// ```
    /// use relforge_core::ColumnInfo;
    ///
    /// let col = ColumnInfo::new(0, "name", "TEXT");
    /// assert!(!col.is_primary_key());
    /// assert!(!col.not_null);
    /// ```
    pub fn new(position: usize, name: &str, declared_type: &str) -> Self {
        Self {
            position,
            name: name.to_string(),
            declared_type: declared_type.to_string(),
            not_null: false,
            default_value: None,
            primary_key: 0,
        }
    }

    /// Marks this column as the sole primary key.
    pub fn as_primary_key(mut self) -> Self {
        self.primary_key = 1;
        self
    }

    /// Returns `true` if the column participates in the primary key.
    pub fn is_primary_key(&self) -> bool {
        self.primary_key > 0
    }

    /// Returns `true` if this column's name matches `name` case-insensitively.
    pub fn is_named(&self, name: &str) -> bool {
        same_identifier(&self.name, name)
    }
}

/// A declared foreign key, as reported by `PRAGMA foreign_key_list`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKeyInfo {
    /// Referencing column in the owning table.
    pub column: String,
    /// Referenced table.
    pub target_table: String,
    /// Referenced column; `None` when the constraint names only the table
    /// (it then refers to the target's primary key).
    pub target_column: Option<String>,
}

/// Row and column counts for one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSummary {
    /// Table name.
    pub name: String,
    /// Number of rows.
    pub row_count: u64,
    /// Number of columns.
    pub column_count: usize,
}

/// An inferred, unconfirmed foreign-key relationship.
///
/// Produced by relation discovery and consumed by normalization. Carries both
/// pieces of evidence so a reviewer can judge the proposal.
///
/// # Examples
///
/// ```
/// use relforge_core::CandidateRelation;
///
/// let rel = CandidateRelation::new("orders", "customer_id", "customers", "id")
///     .with_scores(0.8, 100.0);
/// assert!(!rel.is_self_reference());
/// assert_eq!(rel.foreign_key_column(), "customers_id");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateRelation {
    /// Table holding the referencing values.
    pub source_table: String,
    /// Column holding the referencing values.
    pub source_column: String,
    /// Table being referenced.
    pub target_table: String,
    /// Id-like column of the target whose values matched.
    pub target_id_column: String,
    /// Name similarity between `source_column` and `target_table`, in `[0, 1]`.
    pub name_score: f64,
    /// Percentage of value overlap, in `[0, 100]`.
    pub data_overlap: f64,
}

impl CandidateRelation {
    /// Creates a relation with zero scores.
    pub fn new(
        source_table: &str,
        source_column: &str,
        target_table: &str,
        target_id_column: &str,
    ) -> Self {
        Self {
            source_table: source_table.to_string(),
            source_column: source_column.to_string(),
            target_table: target_table.to_string(),
            target_id_column: target_id_column.to_string(),
            name_score: 0.0,
            data_overlap: 0.0,
        }
    }

    /// Sets both evidence scores.
    pub fn with_scores(mut self, name_score: f64, data_overlap: f64) -> Self {
        self.name_score = name_score;
        self.data_overlap = data_overlap;
        self
    }

    /// Returns `true` if the relation points back at its own table.
    pub fn is_self_reference(&self) -> bool {
        same_identifier(&self.source_table, &self.target_table)
    }

    /// Name of the foreign-key column materialization will create.
    pub fn foreign_key_column(&self) -> String {
        id_column_name(&self.target_table)
    }

    /// Case-insensitive identity key: (source table, source column, target table).
    pub fn key(&self) -> (String, String, String) {
        (
            self.source_table.to_ascii_lowercase(),
            self.source_column.to_ascii_lowercase(),
            self.target_table.to_ascii_lowercase(),
        )
    }

    /// Returns `true` if `self` carries stronger evidence than `other`.
    ///
    /// Data overlap is compared first, name similarity breaks ties.
    pub fn outranks(&self, other: &CandidateRelation) -> bool {
        (self.data_overlap, self.name_score) > (other.data_overlap, other.name_score)
    }
}

impl fmt::Display for CandidateRelation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{} -> {}.{} (name {:.2}, overlap {:.1}%)",
            self.source_table,
            self.source_column,
            self.target_table,
            self.target_id_column,
            self.name_score,
            self.data_overlap
        )
    }
}

/// Translation of a source database's project ids into the target's.
///
/// Ids absent from the mapping pass through unchanged; the mapping never
/// invents values.
///
/// # Examples
///
/// ```
/// use relforge_core::IdMapping;
///
/// let mut mapping = IdMapping::default();
/// mapping.insert(1, 7);
/// mapping.insert(2, 2);
/// assert_eq!(mapping.translate(1), 7);
/// assert_eq!(mapping.translate(2), 2);
/// assert_eq!(mapping.translate(99), 99);
/// assert_eq!(mapping.remapped_count(), 1);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdMapping {
    entries: BTreeMap<i64, i64>,
}

impl IdMapping {
    /// Records that source id `old` became target id `new`.
    pub fn insert(&mut self, old: i64, new: i64) {
        self.entries.insert(old, new);
    }

    /// Returns the mapped id, if `old` was recorded.
    pub fn get(&self, old: i64) -> Option<i64> {
        self.entries.get(&old).copied()
    }

    /// Returns the mapped id, or `old` itself when unmapped.
    pub fn translate(&self, old: i64) -> i64 {
        self.get(old).unwrap_or(old)
    }

    /// Number of recorded ids.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of ids that changed value.
    pub fn remapped_count(&self) -> usize {
        self.entries.iter().filter(|(old, new)| old != new).count()
    }

    /// Iterates `(old, new)` pairs in ascending source-id order.
    pub fn iter(&self) -> impl Iterator<Item = (i64, i64)> + '_ {
        self.entries.iter().map(|(old, new)| (*old, *new))
    }
}

/// A table the engine could not process, and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedTable {
    /// Table name.
    pub table: String,
    /// Human-readable failure reason.
    pub reason: String,
}

impl SkippedTable {
    /// Creates a skip record.
    pub fn new(table: &str, reason: impl Into<String>) -> Self {
        Self {
            table: table.to_string(),
            reason: reason.into(),
        }
    }
}
