//! Path-based entry points.
//!
//! Each function opens its own [`Database`], runs one operation, and drops
//! the connection before returning. Callers that already hold a `Database`
//! should use the component types directly.

use std::path::Path;

use relforge_core::{CandidateRelation, EngineConfig, TableSummary};
use tracing::{error, info};

use crate::cleanup::{self, CleanupReport};
use crate::database::Database;
use crate::discovery::discover_relations;
use crate::error::{EngineError, Result};
use crate::introspect;
use crate::merge::{DatabaseMerger, MergeReport};
use crate::normalize::{NormalizationReport, SchemaNormalizer};

/// Discovers candidate relations in the database at `path` with default
/// settings. The file is opened read-only.
pub fn discover_candidate_relations(path: impl AsRef<Path>) -> Result<Vec<CandidateRelation>> {
    discover_candidate_relations_with_config(path, &EngineConfig::default())
}

/// Like [`discover_candidate_relations`], with explicit settings.
pub fn discover_candidate_relations_with_config(
    path: impl AsRef<Path>,
    config: &EngineConfig,
) -> Result<Vec<CandidateRelation>> {
    config.validate()?;
    let db = Database::open_read_only(path, config.retry.clone())?;
    discover_relations(&db, &config.discovery)
}

/// Normalizes the database at `path` and materializes `relations` as
/// declared foreign keys.
///
/// # Errors
///
/// Returns [`EngineError::Normalization`] if the file cannot be opened or
/// its tables cannot be listed. Per-table failures are in the report.
pub fn normalize_and_materialize_relations(
    path: impl AsRef<Path>,
    relations: &[CandidateRelation],
) -> Result<NormalizationReport> {
    normalize_and_materialize_relations_with_config(path, relations, &EngineConfig::default())
}

/// Like [`normalize_and_materialize_relations`], with explicit settings.
pub fn normalize_and_materialize_relations_with_config(
    path: impl AsRef<Path>,
    relations: &[CandidateRelation],
    config: &EngineConfig,
) -> Result<NormalizationReport> {
    config.validate()?;
    let path = path.as_ref();
    let db = Database::open_with(path, config.retry.clone()).map_err(|err| {
        EngineError::Normalization(format!("cannot open {}: {err}", path.display()))
    })?;
    SchemaNormalizer::new(&db, config.normalize.clone()).normalize(relations)
}

/// Merges `source` into `target`, returning `false` after logging any
/// aborting failure.
pub fn merge_databases(source: impl AsRef<Path>, target: impl AsRef<Path>) -> bool {
    match merge_databases_with_config(source, target, &EngineConfig::default()) {
        Ok(report) => {
            info!(
                tables = report.tables_created.len() + report.tables_merged.len(),
                skipped = report.skipped.len(),
                "databases merged"
            );
            true
        }
        Err(err) => {
            error!(error = %err, "merge failed");
            false
        }
    }
}

/// Merges `source` into `target` with explicit settings and returns the
/// full report.
///
/// # Errors
///
/// Returns [`EngineError::MergeAbort`] if both paths name the same file, or
/// if preparation or project-metadata merging fails.
pub fn merge_databases_with_config(
    source: impl AsRef<Path>,
    target: impl AsRef<Path>,
    config: &EngineConfig,
) -> Result<MergeReport> {
    config.validate()?;
    let (source, target) = (source.as_ref(), target.as_ref());
    if same_file(source, target) {
        return Err(EngineError::MergeAbort(format!(
            "source and target are the same file: {}",
            source.display()
        )));
    }

    let source_db = Database::open_with(source, config.retry.clone())
        .map_err(|err| EngineError::MergeAbort(format!("cannot open source: {err}")))?;
    let target_db = Database::open_with(target, config.retry.clone())
        .map_err(|err| EngineError::MergeAbort(format!("cannot open target: {err}")))?;
    DatabaseMerger::new(&source_db, &target_db, config.merge.clone())
        .with_normalize_config(config.normalize.clone())
        .merge()
}

/// Drops empty tables and empty columns in the database at `path`.
pub fn cleanup_database(path: impl AsRef<Path>) -> Result<CleanupReport> {
    let db = Database::open(path)?;
    cleanup::cleanup_database(&db)
}

/// Row and column counts of every user table at `path`.
pub fn table_summaries(path: impl AsRef<Path>) -> Result<Vec<TableSummary>> {
    let db = Database::open_read_only(path, Default::default())?;
    introspect::table_summaries(db.connection())
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}
