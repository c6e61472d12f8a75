//! Core types, similarity scoring, and configuration for relation inference.
//!
//! This crate holds everything about inferring relational structure in a
//! denormalized SQLite database that does not need a database connection:
//!
//! - [`CandidateRelation`] — an inferred foreign key with its name and data
//!   evidence.
//! - [`ColumnInfo`], [`ForeignKeyInfo`], [`TableSummary`] — schema metadata
//!   as read from a live database.
//! - [`IdMapping`] — project id translation built during a merge.
//! - [`name_similarity`], [`data_overlap`] — the two scoring primitives used
//!   by discovery.
//! - [`EngineConfig`] — YAML configuration for thresholds, retries, and merge
//!   options.
//!
//! Validation ([`validate_relations`], [`dedup_relations`]) catches malformed
//! relation lists before they reach the normalizer.
//!
//! # Example
//!
//! ```
//! use relforge_core::*;
//!
//! let score = name_similarity("customer_id", "customers");
//! let config = DiscoveryConfig::default();
//! assert!(score > config.name_threshold);
//!
//! let rel = CandidateRelation::new("orders", "customer_id", "customers", "id")
//!     .with_scores(score, 100.0);
//! assert!(config.overlap.accepts(rel.data_overlap));
//! assert!(validate_relations(&[rel]).is_empty());
//! ```

mod config;
mod similarity;
mod types;
mod validate;

pub use config::{
    Backoff, ConfigError, DEFAULT_MIN_OVERLAP, DEFAULT_NAME_THRESHOLD, DiscoveryConfig,
    EngineConfig, MergeConfig, NormalizeConfig, OverlapMode, RetryConfig,
};
pub use similarity::{data_overlap, name_similarity};
pub use types::*;
pub use validate::{ValidationError, dedup_relations, validate_relation, validate_relations};
