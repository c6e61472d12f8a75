//! Candidate relation validation.
//!
//! Checks structural invariants of relation lists before they reach the
//! normalizer: empty names, self-references, out-of-range scores, and
//! duplicate proposals for the same (table, column, target) triple.
//!
//! # Examples
//!
//! ```
//! use relforge_core::*;
//!
//! let rel = CandidateRelation::new("orders", "customer_id", "customers", "id")
//!     .with_scores(0.8, 100.0);
//! assert!(validate_relation(&rel).is_empty());
//!
//! // Invalid: relation points back at its own table
//! let bad = CandidateRelation::new("orders", "parent_id", "orders", "id");
//! assert!(!validate_relation(&bad).is_empty());
//! ```

use std::collections::{BTreeMap, HashSet};

use thiserror::Error;

use crate::CandidateRelation;

/// Relation validation errors.
///
/// Each variant describes a specific structural problem found during
/// validation. The `Display` impl provides a human-readable message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// A table or column name is empty or whitespace-only.
    #[error("relation has an empty {0} name")]
    EmptyName(&'static str),
    /// Source and target are the same table.
    #[error("self-referencing relation on table: {0}")]
    SelfReference(String),
    /// Name score outside `[0, 1]` or overlap outside `[0, 100]`.
    #[error("relation score out of range: {0}")]
    ScoreOutOfRange(String),
    /// Two relations share the same (table, column, target) triple.
    #[error("duplicate relation: {0}")]
    DuplicateRelation(String),
}

/// Validates a single candidate relation.
pub fn validate_relation(relation: &CandidateRelation) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    let names = [
        ("source table", &relation.source_table),
        ("source column", &relation.source_column),
        ("target table", &relation.target_table),
        ("target id column", &relation.target_id_column),
    ];
    for (label, value) in names {
        if value.trim().is_empty() {
            errors.push(ValidationError::EmptyName(label));
            return errors;
        }
    }

    if relation.is_self_reference() {
        errors.push(ValidationError::SelfReference(relation.source_table.clone()));
        return errors;
    }

    if !(0.0..=1.0).contains(&relation.name_score)
        || !(0.0..=100.0).contains(&relation.data_overlap)
    {
        errors.push(ValidationError::ScoreOutOfRange(describe(relation)));
    }

    errors
}

/// Validates a relation list, including duplicate detection.
///
/// Stops at the first invalid relation, like [`validate_relation`].
pub fn validate_relations(relations: &[CandidateRelation]) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    let mut seen = HashSet::new();

    for relation in relations {
        errors.extend(validate_relation(relation));
        if !errors.is_empty() {
            return errors;
        }
        if !seen.insert(relation.key()) {
            errors.push(ValidationError::DuplicateRelation(describe(relation)));
            return errors;
        }
    }

    errors
}

/// Drops self-references and collapses duplicates, keeping the strongest
/// evidence for each (table, column, target) triple.
///
/// The result is sorted by that triple so repeated runs compare equal.
///
/// # Examples
///
/// ```
/// use relforge_core::{CandidateRelation, dedup_relations};
///
/// let relations = vec![
///     CandidateRelation::new("orders", "cust", "customers", "id").with_scores(0.7, 96.0),
///     CandidateRelation::new("orders", "cust", "customers", "id").with_scores(0.7, 100.0),
///     CandidateRelation::new("orders", "ref", "orders", "id"),
/// ];
/// let kept = dedup_relations(relations);
/// assert_eq!(kept.len(), 1);
/// assert_eq!(kept[0].data_overlap, 100.0);
/// ```
pub fn dedup_relations(relations: Vec<CandidateRelation>) -> Vec<CandidateRelation> {
    let mut best: BTreeMap<(String, String, String), CandidateRelation> = BTreeMap::new();

    for relation in relations {
        if relation.is_self_reference() {
            continue;
        }
        match best.get(&relation.key()) {
            Some(existing) if !relation.outranks(existing) => {}
            _ => {
                best.insert(relation.key(), relation);
            }
        }
    }

    best.into_values().collect()
}

fn describe(relation: &CandidateRelation) -> String {
    format!(
        "{}.{} -> {}.{}",
        relation.source_table,
        relation.source_column,
        relation.target_table,
        relation.target_id_column
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn relation(table: &str, column: &str, target: &str) -> CandidateRelation {
        CandidateRelation::new(table, column, target, "id").with_scores(0.8, 100.0)
    }

    #[test]
    fn test_validate_relation_accepts_valid() {
        assert!(validate_relation(&relation("orders", "customer_id", "customers")).is_empty());
    }

    #[test]
    fn test_validate_relation_rejects_empty_names() {
        let errors = validate_relation(&relation("orders", " ", "customers"));
        assert_eq!(errors, vec![ValidationError::EmptyName("source column")]);
    }

    #[test]
    fn test_validate_relation_rejects_self_reference() {
        let errors = validate_relation(&relation("Orders", "parent", "orders"));
        assert_eq!(
            errors,
            vec![ValidationError::SelfReference("Orders".to_string())]
        );
    }

    #[test]
    fn test_validate_relation_rejects_bad_scores() {
        let rel = relation("orders", "customer_id", "customers").with_scores(1.2, 50.0);
        let errors = validate_relation(&rel);
        assert!(matches!(errors[..], [ValidationError::ScoreOutOfRange(_)]));
    }

    #[test]
    fn test_validate_relations_rejects_duplicates() {
        let relations = vec![
            relation("orders", "customer_id", "customers"),
            relation("ORDERS", "Customer_Id", "customers"),
        ];
        let errors = validate_relations(&relations);
        assert_eq!(
            errors,
            vec![ValidationError::DuplicateRelation(
                "ORDERS.Customer_Id -> customers.id".to_string()
            )]
        );
    }

    #[test]
    fn test_dedup_keeps_first_on_equal_evidence() {
        let first = CandidateRelation::new("orders", "c", "customers", "id").with_scores(0.8, 100.0);
        let second =
            CandidateRelation::new("orders", "c", "customers", "customer_id").with_scores(0.8, 100.0);
        let kept = dedup_relations(vec![first, second]);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].target_id_column, "id");
    }

    #[test]
    fn test_dedup_sorts_output() {
        let kept = dedup_relations(vec![
            relation("b", "x", "t"),
            relation("a", "y", "t"),
            relation("a", "x", "t"),
        ]);
        let order: Vec<_> = kept
            .iter()
            .map(|r| format!("{}.{}", r.source_table, r.source_column))
            .collect();
        assert_eq!(order, vec!["a.x", "a.y", "b.x"]);
    }
}
