//! Assertions over what in-memory writers committed.

use crate::NodeId;
use crate::writers::MemoryWriterFactory;
use std::collections::BTreeMap;
use std::fmt::Debug;

/// Assert that two row lists hold the same rows, ignoring order.
///
/// Rows of one node may arrive in any order when several processors share
/// the buffer, so this compares sorted copies.
///
/// # Panics
///
/// Panics if the lists differ in content or multiplicity.
///
/// # Example
///
/// ```
/// use ironload::testing::assert_rows_unordered_equal;
///
/// assert_rows_unordered_equal(&["2|b", "1|a"], &["1|a", "2|b"]);
/// ```
pub fn assert_rows_unordered_equal<T: Debug + Ord + Clone>(actual: &[T], expected: &[T]) {
    let mut a = actual.to_vec();
    let mut e = expected.to_vec();
    a.sort();
    e.sort();
    if a != e {
        let missing: Vec<_> = e.iter().filter(|x| !a.contains(x)).collect();
        let extra: Vec<_> = a.iter().filter(|x| !e.contains(x)).collect();
        panic!(
            "Row mismatch:\n  Missing rows: {missing:?}\n  Extra rows: {extra:?}\n  Expected: {e:?}\n  Actual: {a:?}"
        );
    }
}

/// Assert that `node` committed exactly `expected`, in any order.
///
/// # Panics
///
/// Panics if the committed rows differ.
pub fn assert_committed(factory: &MemoryWriterFactory, node: NodeId, expected: &[&str]) {
    let committed = factory.record(node).committed_strings();
    let expected: Vec<String> = expected.iter().map(|s| (*s).to_string()).collect();
    assert_rows_unordered_equal(&committed, &expected);
}

/// Assert that every writer of `nodes` was rolled back and closed and that
/// nothing was committed.
///
/// # Panics
///
/// Panics if any node committed rows or has a writer that was not rolled
/// back and closed.
pub fn assert_rolled_back(factory: &MemoryWriterFactory, nodes: &[NodeId]) {
    for &node in nodes {
        let rec = factory.record(node);
        assert!(
            rec.committed.is_empty(),
            "{node} committed {} rows",
            rec.committed.len()
        );
        assert_eq!(rec.commits, 0, "{node} committed");
        assert_eq!(
            rec.rollbacks, rec.writers,
            "{node}: {} of {} writers rolled back",
            rec.rollbacks, rec.writers
        );
        assert_eq!(rec.closes, rec.writers, "{node}: writers left open");
    }
}

/// Committed row counts per node.
#[must_use]
pub fn committed_counts(factory: &MemoryWriterFactory) -> BTreeMap<NodeId, usize> {
    factory
        .committed_sorted()
        .into_iter()
        .map(|(node, rows)| (node, rows.len()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[should_panic(expected = "Missing rows")]
    fn unordered_mismatch_panics() {
        assert_rows_unordered_equal(&[1, 2], &[1, 3]);
    }

    #[test]
    fn duplicates_count() {
        assert_rows_unordered_equal(&[1, 1, 2], &[1, 2, 1]);
    }
}
