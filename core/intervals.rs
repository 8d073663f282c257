//! Pure interval-arithmetic helpers used by the clip-serving algorithm to
//! decide which parts of a requested time range are already on disk.

use std::cmp::{max, min};
use std::ops::Range;

/// Splits `target` against a set of `segments` already on disk, returning
/// the portions of `target` that are covered (as the intersection with each
/// overlapping segment, merged and sorted) and the portions that are not
/// covered by any segment (the gaps that still need to be downloaded).
///
/// `segments` need not be sorted or non-overlapping; this function sorts
/// and merges them internally.
pub fn find_intersections(
    target: Range<i64>,
    segments: &[Range<i64>],
) -> (Vec<Range<i64>>, Vec<Range<i64>>) {
    assert!(target.start <= target.end);

    let mut merged: Vec<Range<i64>> = segments
        .iter()
        .filter(|s| s.start < s.end)
        .cloned()
        .collect();
    merged.sort_by_key(|s| s.start);
    let mut coalesced: Vec<Range<i64>> = Vec::with_capacity(merged.len());
    for seg in merged {
        match coalesced.last_mut() {
            Some(last) if seg.start <= last.end => {
                last.end = max(last.end, seg.end);
            }
            _ => coalesced.push(seg),
        }
    }

    let mut covered = Vec::new();
    let mut uncovered = Vec::new();
    let mut cursor = target.start;
    for seg in &coalesced {
        if seg.end <= target.start || seg.start >= target.end {
            continue;
        }
        let lo = max(seg.start, target.start);
        let hi = min(seg.end, target.end);
        if cursor < lo {
            uncovered.push(cursor..lo);
        }
        covered.push(lo..hi);
        cursor = max(cursor, hi);
    }
    if cursor < target.end {
        uncovered.push(cursor..target.end);
    }

    (covered, uncovered)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_segments_is_fully_uncovered() {
        let (covered, uncovered) = find_intersections(0..100, &[]);
        assert!(covered.is_empty());
        assert_eq!(uncovered, vec![0..100]);
    }

    #[test]
    fn fully_covered_target() {
        let (covered, uncovered) = find_intersections(10..20, &[0..100]);
        assert_eq!(covered, vec![10..20]);
        assert!(uncovered.is_empty());
    }

    #[test]
    fn partial_overlap_leaves_gap_at_each_end() {
        let (covered, uncovered) = find_intersections(0..100, &[40..60]);
        assert_eq!(covered, vec![40..60]);
        assert_eq!(uncovered, vec![0..40, 60..100]);
    }

    #[test]
    fn adjacent_but_not_overlapping_segments_stay_distinct() {
        let (covered, uncovered) = find_intersections(0..20, &[0..10, 10..20]);
        // They're adjacent (touching at 10), so they coalesce into one run.
        assert_eq!(covered, vec![0..20]);
        assert!(uncovered.is_empty());
    }

    #[test]
    fn disjoint_segments_leave_a_middle_gap() {
        let (covered, uncovered) = find_intersections(0..30, &[0..10, 20..30]);
        assert_eq!(covered, vec![0..10, 20..30]);
        assert_eq!(uncovered, vec![10..20]);
    }

    #[test]
    fn segments_outside_target_are_ignored() {
        let (covered, uncovered) = find_intersections(10..20, &[0..5, 25..30]);
        assert!(covered.is_empty());
        assert_eq!(uncovered, vec![10..20]);
    }
}
