//! Candidate relation discovery.
//!
//! Proposes `(table, column) → (target table, target id column)` relations
//! for databases that never declared their foreign keys. A column becomes a
//! candidate when its name resembles a table name and its values are
//! contained in one of that table's id-like columns.
//!
//! Discovery is read-only and deterministic: the same file always yields
//! the same sorted list.

use std::collections::{HashMap, HashSet};

use relforge_core::{
    CandidateRelation, ColumnInfo, DiscoveryConfig, TRACKING_COLUMN, data_overlap,
    dedup_relations, id_column_name, is_id_like, name_similarity, same_identifier,
};
use tracing::{debug, info, warn};

use crate::database::Database;
use crate::error::Result;
use crate::introspect;

/// Scores every column of every table against every other table.
///
/// # Examples
///
/// ```
/// use relforge_core::DiscoveryConfig;
/// use relforge_sqlite::{Database, RelationDiscovery};
///
/// let db = Database::open_in_memory().unwrap();
/// db.connection()
///     .execute_batch(
///         "CREATE TABLE customers (id INTEGER, name TEXT);
///          CREATE TABLE orders (id INTEGER, customer_id INTEGER);
///          INSERT INTO customers VALUES (1, 'a'), (2, 'b');
///          INSERT INTO orders VALUES (10, 1), (11, 2);",
///     )
///     .unwrap();
///
/// let found = RelationDiscovery::new(&db, DiscoveryConfig::default())
///     .discover()
///     .unwrap();
/// assert_eq!(found.len(), 1);
/// assert_eq!(found[0].source_column, "customer_id");
/// assert_eq!(found[0].target_table, "customers");
/// ```
#[derive(Debug)]
pub struct RelationDiscovery<'a> {
    db: &'a Database,
    config: DiscoveryConfig,
    values: HashMap<(String, String), HashSet<String>>,
}

impl<'a> RelationDiscovery<'a> {
    /// Creates a discovery pass over `db`.
    pub fn new(db: &'a Database, config: DiscoveryConfig) -> Self {
        Self {
            db,
            config,
            values: HashMap::new(),
        }
    }

    /// Runs discovery and returns deduplicated candidates sorted by
    /// (table, column, target).
    ///
    /// Tables whose schema cannot be read are logged and skipped, as are
    /// column pairs whose values cannot be compared.
    pub fn discover(mut self) -> Result<Vec<CandidateRelation>> {
        let conn = self.db.connection();
        let tables = introspect::list_tables(conn)?;

        let mut schema: Vec<(String, Vec<ColumnInfo>)> = Vec::with_capacity(tables.len());
        for table in tables {
            match introspect::table_columns(conn, &table) {
                Ok(columns) => schema.push((table, columns)),
                Err(err) => warn!(table = %table, error = %err, "skipping unreadable table"),
            }
        }

        let found = dedup_relations(self.score(&schema));
        info!(candidates = found.len(), "relation discovery finished");
        Ok(found)
    }

    /// Scores every column of `schema` against every other table in it.
    fn score(&mut self, schema: &[(String, Vec<ColumnInfo>)]) -> Vec<CandidateRelation> {
        let known_fk_names: HashSet<String> = schema
            .iter()
            .map(|(table, _)| id_column_name(table).to_ascii_lowercase())
            .collect();

        let mut found = Vec::new();
        for (table, columns) in schema {
            for column in columns {
                if column.is_named(TRACKING_COLUMN)
                    || known_fk_names.contains(&column.name.to_ascii_lowercase())
                {
                    continue;
                }
                for (target, target_columns) in schema {
                    if same_identifier(table, target) {
                        continue;
                    }
                    match self.evaluate(table, &column.name, target, target_columns) {
                        Ok(Some(relation)) => found.push(relation),
                        Ok(None) => {}
                        Err(err) => warn!(
                            table = %table,
                            column = %column.name,
                            target = %target,
                            error = %err,
                            "skipping column pair"
                        ),
                    }
                }
            }
        }
        found
    }

    fn evaluate(
        &mut self,
        table: &str,
        column: &str,
        target: &str,
        target_columns: &[ColumnInfo],
    ) -> Result<Option<CandidateRelation>> {
        let name_score = name_similarity(column, target);
        if name_score <= self.config.name_threshold {
            return Ok(None);
        }

        let source_values = self.values_of(table, column)?;
        if source_values.is_empty() {
            debug!(table, column, target, "no values to compare");
            return Ok(None);
        }

        let preferred = id_column_name(target);
        let mut best: Option<(f64, u8, usize, &ColumnInfo)> = None;
        for candidate in target_columns.iter().filter(|c| is_id_like(&c.name)) {
            let target_values = self.values_of(target, &candidate.name)?;
            let overlap = data_overlap(&source_values, &target_values);
            let rank = if candidate.is_named("id") {
                0
            } else if candidate.is_named(&preferred) {
                1
            } else {
                2
            };
            let better = match best {
                None => true,
                Some((best_overlap, best_rank, best_pos, _)) => {
                    overlap > best_overlap
                        || (overlap == best_overlap
                            && (rank, candidate.position) < (best_rank, best_pos))
                }
            };
            if better {
                best = Some((overlap, rank, candidate.position, candidate));
            }
        }

        let Some((overlap, _, _, id_column)) = best else {
            return Ok(None);
        };
        if !self.config.overlap.accepts(overlap) {
            debug!(table, column, target, overlap, "overlap below threshold");
            return Ok(None);
        }
        if self.config.require_unique_target
            && !introspect::column_is_unique(self.db.connection(), target, &id_column.name)?
        {
            debug!(table, column, target, id_column = %id_column.name, "target ids are not unique");
            return Ok(None);
        }

        debug!(table, column, target, name_score, overlap, "candidate relation");
        Ok(Some(
            CandidateRelation::new(table, column, target, &id_column.name)
                .with_scores(name_score, overlap),
        ))
    }

    fn values_of(&mut self, table: &str, column: &str) -> Result<HashSet<String>> {
        let key = (table.to_ascii_lowercase(), column.to_ascii_lowercase());
        if let Some(values) = self.values.get(&key) {
            return Ok(values.clone());
        }
        let values = introspect::distinct_non_null_values(self.db.connection(), table, column)?;
        self.values.insert(key, values.clone());
        Ok(values)
    }
}

/// Runs discovery over `db` with `config`.
pub fn discover_relations(db: &Database, config: &DiscoveryConfig) -> Result<Vec<CandidateRelation>> {
    RelationDiscovery::new(db, config.clone()).discover()
}
