//! Error types for engine operations.
//!
//! Provides a unified error type covering introspection, table rebuilds,
//! lock contention, merging, and normalization failures. Variants carry the
//! table they concern so callers can log a skipped table and continue.

use std::fmt;

use thiserror::Error;

/// Step of a table rebuild at which a failure occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebuildStep {
    /// Reading the current columns, keys, and indexes.
    ReadSchema,
    /// Computing the replacement definition.
    Plan,
    /// Opening the rebuild transaction.
    Begin,
    /// Creating the temporary table.
    CreateTemp,
    /// Copying rows into the temporary table.
    CopyRows,
    /// Dropping the original table.
    DropOriginal,
    /// Renaming the temporary table into place.
    RenameTemp,
    /// Committing the transaction.
    Commit,
}

impl fmt::Display for RebuildStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ReadSchema => "read schema",
            Self::Plan => "plan",
            Self::Begin => "begin transaction",
            Self::CreateTemp => "create temp table",
            Self::CopyRows => "copy rows",
            Self::DropOriginal => "drop original",
            Self::RenameTemp => "rename temp table",
            Self::Commit => "commit",
        };
        f.write_str(name)
    }
}

/// Errors that can occur during engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// SQLite operation failure outside a more specific context.
    #[error("database error: {0}")]
    DatabaseError(#[from] rusqlite::Error),

    /// Introspection against a table that is missing or malformed.
    #[error("cannot read schema of table '{table}': {reason}")]
    SchemaRead {
        /// Table being read.
        table: String,
        /// What went wrong.
        reason: String,
    },

    /// A table rebuild failed; the original table is unchanged.
    #[error("rebuild of table '{table}' failed at step '{step}': {source}")]
    Rebuild {
        /// Table being rebuilt.
        table: String,
        /// Step that failed.
        step: RebuildStep,
        /// Underlying failure.
        #[source]
        source: Box<EngineError>,
    },

    /// A replacement definition would be invalid (e.g., duplicate column names).
    #[error("invalid rebuild plan for table '{table}': {reason}")]
    InvalidPlan {
        /// Table being rebuilt.
        table: String,
        /// Why the plan was rejected.
        reason: String,
    },

    /// The database stayed locked after every retry.
    #[error("database is locked after {attempts} attempt(s): {source}")]
    LockContention {
        /// Attempts made, including the first.
        attempts: u32,
        /// Last lock error reported.
        #[source]
        source: rusqlite::Error,
    },

    /// Merge preparation or project-metadata merging failed.
    #[error("merge aborted: {0}")]
    MergeAbort(String),

    /// An insert violated a uniqueness or foreign-key constraint.
    #[error("constraint violation in table '{table}': {source}")]
    ConstraintViolation {
        /// Table being written.
        table: String,
        /// Underlying SQLite failure.
        #[source]
        source: rusqlite::Error,
    },

    /// Normalization could not start or could not complete its setup.
    #[error("normalization error: {0}")]
    Normalization(String),

    /// Candidate relations failed validation.
    #[error("invalid relation: {0}")]
    InvalidRelation(#[from] relforge_core::ValidationError),

    /// Configuration could not be loaded or is out of range.
    #[error("configuration error: {0}")]
    Config(#[from] relforge_core::ConfigError),
}

impl EngineError {
    /// Wraps `self` as a rebuild failure of `table` at `step`.
    ///
    /// Errors that already describe a rebuild are returned unchanged.
    pub(crate) fn at_step(self, table: &str, step: RebuildStep) -> Self {
        match self {
            Self::Rebuild { .. } => self,
            other => Self::Rebuild {
                table: table.to_string(),
                step,
                source: Box::new(other),
            },
        }
    }

    /// Builds a [`SchemaRead`](Self::SchemaRead) error.
    pub(crate) fn schema_read(table: &str, reason: impl fmt::Display) -> Self {
        Self::SchemaRead {
            table: table.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Returns `true` for failures that concern a single table and may be
    /// skipped by best-effort operations.
    pub fn is_table_local(&self) -> bool {
        matches!(
            self,
            Self::SchemaRead { .. }
                | Self::Rebuild { .. }
                | Self::InvalidPlan { .. }
                | Self::ConstraintViolation { .. }
        )
    }
}

/// Returns `true` if `err` is SQLite's "database is busy/locked" condition.
pub(crate) fn is_lock_error(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(failure, _)
            if matches!(
                failure.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            )
    )
}

/// Returns `true` if `err` is a uniqueness, primary-key, or foreign-key violation.
pub(crate) fn is_constraint_error(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

/// Convenience alias for results with [`EngineError`].
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn failure(code: std::os::raw::c_int) -> rusqlite::Error {
        rusqlite::Error::SqliteFailure(rusqlite::ffi::Error::new(code), None)
    }

    #[test]
    fn test_lock_errors_detected() {
        assert!(is_lock_error(&failure(rusqlite::ffi::SQLITE_BUSY)));
        assert!(is_lock_error(&failure(rusqlite::ffi::SQLITE_LOCKED)));
        assert!(!is_lock_error(&failure(rusqlite::ffi::SQLITE_CONSTRAINT)));
        assert!(!is_lock_error(&rusqlite::Error::QueryReturnedNoRows));
    }

    #[test]
    fn test_constraint_errors_detected() {
        assert!(is_constraint_error(&failure(rusqlite::ffi::SQLITE_CONSTRAINT)));
        assert!(!is_constraint_error(&failure(rusqlite::ffi::SQLITE_BUSY)));
    }

    #[test]
    fn test_at_step_does_not_double_wrap() {
        let err = EngineError::schema_read("orders", "gone").at_step("orders", RebuildStep::ReadSchema);
        let again = err.at_step("orders", RebuildStep::Commit);
        match again {
            EngineError::Rebuild { step, .. } => assert_eq!(step, RebuildStep::ReadSchema),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_rebuild_message_names_table_and_step() {
        let err = EngineError::schema_read("orders", "gone").at_step("orders", RebuildStep::CopyRows);
        let message = err.to_string();
        assert!(message.contains("'orders'"));
        assert!(message.contains("copy rows"));
        assert!(err.is_table_local());
    }
}
