// File: src/consistency/gap.rs

use crate::types::{GapRange, TreeId};

/// Gap opened by observing `observed` on a tree whose log is contiguous up to
/// `last_contiguous` and whose highest observed seq is `max_seen`.
///
/// Only seqs above everything already observed can open a new gap; holes
/// below `max_seen` were reported when they first appeared.
pub fn detect_gap(
    tree: TreeId,
    last_contiguous: u64,
    max_seen: u64,
    observed: u64,
) -> Option<GapRange> {
    let known = last_contiguous.max(max_seen);
    if observed > known + 1 {
        Some(GapRange {
            tree,
            start_seq: known + 1,
            end_seq: observed - 1,
        })
    } else {
        None
    }
}

/// Inclusive ranges inside `[start, end]` not covered by `present`
/// (ascending, may contain values outside the range)
pub fn missing_ranges(present: &[u64], start: u64, end: u64) -> Vec<(u64, u64)> {
    let mut missing = Vec::new();
    if end < start {
        return missing;
    }
    let mut next = start;
    for &seq in present {
        if seq < next {
            continue;
        }
        if seq > end {
            break;
        }
        if seq > next {
            missing.push((next, seq - 1));
        }
        next = seq + 1;
    }
    if next <= end {
        missing.push((next, end));
    }
    missing
}
