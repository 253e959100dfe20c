//! Cross-validation helpers: the sequential oracle and result comparison.

use std::collections::HashMap;

use serde::Serialize;

use crate::engine::Record;

/// Sequential reference sort of the keys alone.
pub fn reference_sort(keys: &[u32]) -> Vec<u32> {
    let mut sorted = keys.to_vec();
    sorted.sort_unstable();
    sorted
}

/// Stable sequential reference sort of key/payload pairs.
pub fn reference_sort_pairs(keys: &[u32], payloads: &[u32]) -> Vec<Record> {
    let mut pairs: Vec<Record> = keys
        .iter()
        .zip(payloads)
        .map(|(&key, &payload)| Record { key, payload })
        .collect();
    pairs.sort_by_key(|r| r.key);
    pairs
}

/// Outcome of comparing two sorted outputs by key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Comparison {
    pub matches: bool,
    /// Positions whose keys differ, plus the length difference.
    pub difference_count: usize,
}

/// Compare two outputs position by position on keys only.
pub fn compare(a: &[Record], b: &[Record]) -> Comparison {
    let common = a.len().min(b.len());
    let differing = a[..common]
        .iter()
        .zip(&b[..common])
        .filter(|(x, y)| x.key != y.key)
        .count();
    let difference_count = differing + a.len().abs_diff(b.len());
    Comparison {
        matches: difference_count == 0,
        difference_count,
    }
}

pub fn keys_of(records: &[Record]) -> Vec<u32> {
    records.iter().map(|r| r.key).collect()
}

pub fn is_sorted_by_key(records: &[Record]) -> bool {
    records.windows(2).all(|w| w[0].key <= w[1].key)
}

/// Whether `output` is a permutation of the input pairs.
pub fn pairs_preserved(keys: &[u32], payloads: &[u32], output: &[Record]) -> bool {
    if keys.len() != payloads.len() || keys.len() != output.len() {
        return false;
    }
    let mut counts: HashMap<(u32, u32), i64> = HashMap::with_capacity(keys.len());
    for (&key, &payload) in keys.iter().zip(payloads) {
        *counts.entry((key, payload)).or_default() += 1;
    }
    for r in output {
        *counts.entry((r.key, r.payload)).or_default() -= 1;
    }
    counts.values().all(|&c| c == 0)
}

/// Whether equal keys kept their input order, given that every payload is
/// the input position of its key.
pub fn is_stable(output: &[Record]) -> bool {
    output
        .windows(2)
        .all(|w| w[0].key != w[1].key || w[0].payload < w[1].payload)
}

/// Result of validating several outputs of the same input.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CrossValidation {
    pub all_match: bool,
    /// Comparison of every output against the reference, in input order.
    pub against_reference: Vec<Comparison>,
    /// Comparison of every output against the first one.
    pub against_first: Vec<Comparison>,
}

/// Compare every output with the reference sort of `keys` and with each other.
pub fn cross_validate(keys: &[u32], outputs: &[&[Record]]) -> CrossValidation {
    let reference: Vec<Record> = reference_sort(keys)
        .into_iter()
        .map(|key| Record { key, payload: 0 })
        .collect();
    let against_reference: Vec<Comparison> =
        outputs.iter().map(|out| compare(out, &reference)).collect();
    let against_first: Vec<Comparison> = match outputs.first() {
        Some(first) => outputs.iter().map(|out| compare(out, first)).collect(),
        None => Vec::new(),
    };
    let all_match = against_reference
        .iter()
        .chain(&against_first)
        .all(|c| c.matches);
    CrossValidation {
        all_match,
        against_reference,
        against_first,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn records(pairs: &[(u32, u32)]) -> Vec<Record> {
        pairs.iter().map(|&(k, p)| Record::new(k, p)).collect()
    }

    #[test]
    fn test_compare_counts_key_differences() {
        let a = records(&[(1, 0), (2, 0), (3, 0)]);
        let b = records(&[(1, 9), (5, 0), (3, 0), (4, 0)]);
        let c = compare(&a, &b);
        assert!(!c.matches);
        assert_eq!(c.difference_count, 2);
        assert!(compare(&a, &records(&[(1, 5), (2, 6), (3, 7)])).matches);
        assert!(compare(&[], &[]).matches);
    }

    #[test]
    fn test_pairs_preserved_detects_swapped_payloads() {
        let keys = [3, 1, 2];
        let payloads = [30, 10, 20];
        assert!(pairs_preserved(
            &keys,
            &payloads,
            &records(&[(1, 10), (2, 20), (3, 30)])
        ));
        assert!(!pairs_preserved(
            &keys,
            &payloads,
            &records(&[(1, 20), (2, 10), (3, 30)])
        ));
        assert!(!pairs_preserved(&keys, &payloads, &records(&[(1, 10)])));
    }

    #[test]
    fn test_sortedness_and_stability() {
        let out = records(&[(1, 1), (1, 3), (2, 0)]);
        assert!(is_sorted_by_key(&out));
        assert!(is_stable(&out));
        assert!(!is_stable(&records(&[(1, 3), (1, 1)])));
        assert!(!is_sorted_by_key(&records(&[(2, 0), (1, 0)])));
    }

    #[test]
    fn test_reference_sort_pairs_is_stable() {
        let sorted = reference_sort_pairs(&[3, 1, 2, 1], &[30, 10, 20, 11]);
        assert_eq!(sorted, records(&[(1, 10), (1, 11), (2, 20), (3, 30)]));
        assert_eq!(keys_of(&sorted), reference_sort(&[3, 1, 2, 1]));
    }

    #[test]
    fn test_cross_validate() {
        let keys = [5, 3, 9];
        let good = records(&[(3, 1), (5, 0), (9, 2)]);
        let bad = records(&[(3, 1), (9, 2), (5, 0)]);
        let result = cross_validate(&keys, &[&good, &good]);
        assert!(result.all_match);
        let result = cross_validate(&keys, &[&good, &bad]);
        assert!(!result.all_match);
        assert_eq!(result.against_reference[1].difference_count, 2);
        assert_eq!(result.against_first[1].difference_count, 2);
    }
}
