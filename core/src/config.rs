//! Engine configuration.
//!
//! Defines the YAML-serializable settings for relation discovery thresholds,
//! lock-contention retries, normalization, and merging. Every section has a
//! `Default`, so a configuration file only needs the keys it changes.
//!
//! # Example YAML
//!
//! ```yaml
//! discovery:
//!   name_threshold: 0.65
//!   overlap:
//!     mode: at_least
//!     percent: 95.0
//!   require_unique_target: true
//! retry:
//!   max_attempts: 5
//!   delay_ms: 500
//!   backoff: linear
//! normalize:
//!   synthesize_missing_ids: true
//! merge:
//!   annotate_origin: false
//!   normalize_after: true
//! ```

use std::io::{BufReader, BufWriter};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default name-similarity threshold for accepting a candidate relation.
pub const DEFAULT_NAME_THRESHOLD: f64 = 0.65;

/// Default minimum data overlap (percent) for the `at_least` overlap mode.
pub const DEFAULT_MIN_OVERLAP: f64 = 95.0;

/// Errors raised while loading, saving, or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File I/O failure.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// YAML parsing or serialization failure.
    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// A setting is outside its allowed range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Rule deciding whether a data overlap percentage is strong enough.
///
/// Callers pick exactly one mode; modes are never combined.
///
/// # Examples
///
/// ```
/// use relforge_core::OverlapMode;
///
/// assert!(OverlapMode::Exact.accepts(100.0));
/// assert!(!OverlapMode::Exact.accepts(99.5));
/// assert!(OverlapMode::AtLeast { percent: 95.0 }.accepts(95.0));
/// assert!(OverlapMode::AnyIntersection.accepts(0.1));
/// assert!(!OverlapMode::AnyIntersection.accepts(0.0));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum OverlapMode {
    /// Every value of the smaller set must be present (100%).
    Exact,
    /// At least `percent` of the smaller set must be present.
    AtLeast {
        /// Minimum overlap percentage, in `[0, 100]`.
        percent: f64,
    },
    /// Any shared value at all is enough.
    AnyIntersection,
}

impl Default for OverlapMode {
    fn default() -> Self {
        Self::AtLeast {
            percent: DEFAULT_MIN_OVERLAP,
        }
    }
}

impl OverlapMode {
    /// Returns `true` if `overlap` (a percentage) satisfies this mode.
    pub fn accepts(&self, overlap: f64) -> bool {
        match self {
            Self::Exact => overlap >= 100.0 - f64::EPSILON * 100.0,
            Self::AtLeast { percent } => overlap > 0.0 && overlap >= *percent,
            Self::AnyIntersection => overlap > 0.0,
        }
    }
}

/// Relation discovery thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Name similarity (0.0–1.0) a column must strictly exceed against a
    /// table name to be considered.
    pub name_threshold: f64,
    /// Data overlap acceptance rule.
    pub overlap: OverlapMode,
    /// Reject targets whose id column holds duplicate values.
    pub require_unique_target: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            name_threshold: DEFAULT_NAME_THRESHOLD,
            overlap: OverlapMode::default(),
            require_unique_target: true,
        }
    }
}

/// How the delay between retries grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    /// The same delay before every retry.
    Fixed,
    /// `delay × attempt` before each retry.
    #[default]
    Linear,
}

/// Retry policy for statements that hit a locked database.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use relforge_core::{Backoff, RetryConfig};
///
/// let retry = RetryConfig { max_attempts: 3, delay_ms: 100, backoff: Backoff::Linear };
/// assert_eq!(retry.delay_before(1), Duration::from_millis(100));
/// assert_eq!(retry.delay_before(2), Duration::from_millis(200));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Base delay between attempts, in milliseconds.
    pub delay_ms: u64,
    /// Delay growth strategy.
    pub backoff: Backoff,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay_ms: 500,
            backoff: Backoff::Linear,
        }
    }
}

impl RetryConfig {
    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay_before(&self, attempt: u32) -> Duration {
        let base = Duration::from_millis(self.delay_ms);
        match self.backoff {
            Backoff::Fixed => base,
            Backoff::Linear => base * attempt.max(1),
        }
    }
}

/// Normalization switches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizeConfig {
    /// Give tables with no `id`, no `<table>_id`, and no primary key a
    /// `<table>_id` key populated from `rowid`.
    pub synthesize_missing_ids: bool,
}

impl Default for NormalizeConfig {
    fn default() -> Self {
        Self {
            synthesize_missing_ids: true,
        }
    }
}

/// Merge switches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    /// Append the source file name to the label of each merged project row.
    pub annotate_origin: bool,
    /// Run structural normalization on the target before reconciling
    /// tracking columns.
    pub normalize_after: bool,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            annotate_origin: false,
            normalize_after: true,
        }
    }
}

/// Top-level engine configuration.
///
/// Loaded from a YAML file (typically `relforge.yml`); command-line flags
/// override individual values afterwards.
///
/// # Examples
///
/// ```no_run
/// use relforge_core::EngineConfig;
///
/// let config = EngineConfig::load("relforge.yml").unwrap();
/// println!("name threshold: {}", config.discovery.name_threshold);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct EngineConfig {
    /// Relation discovery thresholds.
    pub discovery: DiscoveryConfig,
    /// Lock-contention retry policy.
    pub retry: RetryConfig,
    /// Normalization switches.
    pub normalize: NormalizeConfig,
    /// Merge switches.
    pub merge: MergeConfig,
}

impl EngineConfig {
    /// Loads and validates configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::IoError`] if the file cannot be read,
    /// [`ConfigError::YamlError`] if parsing fails, or
    /// [`ConfigError::Invalid`] if a value is out of range.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let file = std::fs::File::open(path)?;
        let reader = BufReader::new(file);
        let config: Self = serde_yaml::from_reader(reader)?;
        config.validate()?;
        Ok(config)
    }

    /// Saves the configuration as YAML.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::IoError`] if the file cannot be written, or
    /// [`ConfigError::YamlError`] if serialization fails.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let file = std::fs::File::create(path)?;
        let writer = BufWriter::new(file);
        serde_yaml::to_writer(writer, self)?;
        Ok(())
    }

    /// Checks that every value is within its allowed range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let threshold = self.discovery.name_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(ConfigError::Invalid(format!(
                "discovery.name_threshold must be between 0.0 and 1.0, got {threshold}"
            )));
        }
        if let OverlapMode::AtLeast { percent } = self.discovery.overlap {
            if !(0.0..=100.0).contains(&percent) {
                return Err(ConfigError::Invalid(format!(
                    "discovery.overlap.percent must be between 0 and 100, got {percent}"
                )));
            }
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
