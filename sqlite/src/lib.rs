//! Relation discovery, table rebuilds, normalization and merging for SQLite.
//!
//! This crate turns loosely structured SQLite files into a normalized
//! layout: every table keyed by `<table>_id`, every table tagged with the
//! project it belongs to, and inferred relations declared as real foreign
//! keys. It also merges two such files into one without id collisions.
//!
//! # Architecture
//!
//! - **`introspect`** — read-only schema and data queries
//! - **`rebuild`** — transactional create-copy-drop-rename table rebuilds
//! - **`ddl`** — checks, collations and triggers recovered from stored DDL
//! - **`discovery`** — candidate relations from name similarity and data overlap
//! - **`normalize`** — id renames, tracking columns, foreign-key materialization
//! - **`merge`** — project-aware merging of one database into another
//! - **`cleanup`** — empty table/column pruning and leftover temp tables
//! - **`api`** — path-based entry points wrapping the above
//!
//! Every mutating statement runs through a [`RetryingExecutor`], which
//! retries SQLite's "database is locked" errors with backoff.
//!
//! # Quick start — discovery and normalization
//!
//! ```no_run
//! use relforge_sqlite::api;
//!
//! let relations = api::discover_candidate_relations("project.db").unwrap();
//! for rel in &relations {
//!     println!("{rel}");
//! }
//! let report = api::normalize_and_materialize_relations("project.db", &relations).unwrap();
//! println!("materialized {} relation(s)", report.materialized.len());
//! ```
//!
//! # Quick start — merging
//!
//! ```no_run
//! use relforge_sqlite::api;
//!
//! if !api::merge_databases("incoming.db", "project.db") {
//!     eprintln!("merge failed, see log");
//! }
//! ```
//!
//! # Table naming
//!
//! Table lookups ignore ASCII case, matching SQLite. Tables whose names start
//! with `sqlite_` are never read or modified.

pub mod api;
mod cleanup;
mod convert;
mod database;
mod ddl;
mod discovery;
mod error;
pub mod introspect;
mod merge;
mod normalize;
mod rebuild;
mod retry;
mod schema;

pub use cleanup::{
    CleanupOptions, CleanupReport, cleanup_database, cleanup_with, delete_empty_columns,
    delete_empty_tables, drop_columns, drop_table, sweep_temp_tables,
};
pub use convert::{InsertCounts, InsertMode};
pub use database::Database;
pub use discovery::{RelationDiscovery, discover_relations};
pub use error::{EngineError, RebuildStep, Result};
pub use merge::{DatabaseMerger, MergeReport};
pub use normalize::{MaterializedRelation, NormalizationReport, RenameTracker, SchemaNormalizer};
pub use rebuild::{ColumnPlan, RebuildOutcome, RebuildPlan, TableRebuilder, ValueSource};
pub use retry::RetryingExecutor;
pub use schema::{ColumnDef, DEFAULT_PROJECT_LABEL, ForeignKeyClause, quote_ident};
