//! String-similarity and set-overlap primitives used by relation discovery.
//!
//! Both scores are pure functions: [`name_similarity`] compares a column name
//! against a table name, [`data_overlap`] compares the stringified values of
//! a column against the values of a candidate id column.

use std::collections::HashSet;
use std::hash::{BuildHasher, Hash};

/// Scores how alike two identifiers are, in `[0, 1]`.
///
/// Both inputs are lower-cased. The base ratio is `2·L / (|a| + |b|)` where
/// `L` is the length of the longest common substring. When one string is a
/// prefix of the other the ratio is pulled halfway towards `1.0`. Equal
/// strings score `1.0`; an empty input scores `0.0`.
///
/// # Examples
///
/// ```
/// use relforge_core::name_similarity;
///
/// assert_eq!(name_similarity("Orders", "orders"), 1.0);
/// assert_eq!(name_similarity("orders", ""), 0.0);
/// assert!(name_similarity("customer_id", "customers") > 0.65);
/// assert!(name_similarity("quantity", "customers") < 0.65);
/// ```
pub fn name_similarity(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.to_lowercase().chars().collect();
    let b: Vec<char> = b.to_lowercase().chars().collect();

    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    if a == b {
        return 1.0;
    }

    let common = longest_common_substring(&a, &b);
    let mut ratio = (2 * common) as f64 / (a.len() + b.len()) as f64;
    if a.starts_with(&b) || b.starts_with(&a) {
        ratio = (ratio + 1.0) / 2.0;
    }
    ratio.clamp(0.0, 1.0)
}

/// Length of the longest run of characters shared by `a` and `b`.
fn longest_common_substring(a: &[char], b: &[char]) -> usize {
    // Rolling single-row dynamic program over `b`.
    let mut previous = vec![0usize; b.len() + 1];
    let mut current = vec![0usize; b.len() + 1];
    let mut best = 0;

    for ca in a {
        for (j, cb) in b.iter().enumerate() {
            current[j + 1] = if ca == cb { previous[j] + 1 } else { 0 };
            best = best.max(current[j + 1]);
        }
        std::mem::swap(&mut previous, &mut current);
    }
    best
}

/// Percentage of the smaller set that also appears in the larger, in `[0, 100]`.
///
/// Computed as `100 · |A ∩ B| / min(|A|, |B|)`; returns `0.0` when either set
/// is empty. Callers pass stringified values so that integers and text
/// representations of the same number compare equal.
///
/// # Examples
///
/// ```
/// use std::collections::HashSet;
/// use relforge_core::data_overlap;
///
/// let a: HashSet<String> = ["1", "2", "3"].iter().map(|s| s.to_string()).collect();
/// let b: HashSet<String> = ["2", "3", "4", "5"].iter().map(|s| s.to_string()).collect();
/// assert!((data_overlap(&a, &b) - 66.666).abs() < 0.01);
/// assert_eq!(data_overlap(&a, &a), 100.0);
/// assert_eq!(data_overlap(&a, &HashSet::new()), 0.0);
/// ```
pub fn data_overlap<T, S>(a: &HashSet<T, S>, b: &HashSet<T, S>) -> f64
where
    T: Eq + Hash,
    S: BuildHasher,
{
    let smaller = a.len().min(b.len());
    if smaller == 0 {
        return 0.0;
    }
    let (probe, other) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    let shared = probe.iter().filter(|v| other.contains(*v)).count();
    100.0 * shared as f64 / smaller as f64
}
