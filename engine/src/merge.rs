//! Block merger (C3, §4.3): greedy adjacency merge with 10% tolerance,
//! followed by a hierarchical cap down to `maximum_threshold_blocks`.
//!
//! No teacher or `original_source/` analogue exists for this specific
//! two-stage consolidation (see `DESIGN.md`); it follows spec §4.3's
//! algorithm description directly, written in the style of the other
//! pure-function algorithm modules in this crate.

use crate::threshold::ThresholdGroup;

const TOLERANCE: f64 = 0.10;

/// Run both merge stages: greedy adjacency merge, then hierarchical cap.
pub fn merge_blocks(blocks: Vec<ThresholdGroup>, maximum_threshold_blocks: usize) -> Vec<ThresholdGroup> {
    let merged = greedy_adjacency_merge(blocks);
    hierarchical_cap(merged, maximum_threshold_blocks)
}

/// Stage 1 (§4.3): walk blocks left to right (already contiguous and sorted
/// by `start_hour`), extending the current group while `window_size` stays
/// equal and both bounds stay within 10% relative tolerance.
fn greedy_adjacency_merge(mut blocks: Vec<ThresholdGroup>) -> Vec<ThresholdGroup> {
    blocks.sort_by(|a, b| a.start_hour.partial_cmp(&b.start_hour).unwrap());
    if blocks.is_empty() {
        return blocks;
    }

    let mut result: Vec<ThresholdGroup> = Vec::with_capacity(blocks.len());
    let mut current = blocks[0];

    for &next in &blocks[1..] {
        if can_extend(&current, &next) {
            current = extend(&current, &next);
        } else {
            result.push(current);
            current = next;
        }
    }
    result.push(current);
    result
}

fn can_extend(group: &ThresholdGroup, next: &ThresholdGroup) -> bool {
    if group.window_size != next.window_size {
        return false;
    }
    bound_within_tolerance(group.upper_bound, next.upper_bound) && bound_within_tolerance(group.lower_bound, next.lower_bound)
}

/// `(max-min)/max <= tolerance`, with `max == 0` requiring exact equality.
/// A bound present on only one side blocks the merge (mismatched null-ness
/// means the ranges aren't comparable).
fn bound_within_tolerance(a: Option<f64>, b: Option<f64>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(x), Some(y)) => {
            let max = x.max(y);
            let min = x.min(y);
            if max == 0.0 {
                x == y
            } else {
                (max - min) / max <= TOLERANCE
            }
        }
        _ => false,
    }
}

fn extend(group: &ThresholdGroup, next: &ThresholdGroup) -> ThresholdGroup {
    ThresholdGroup {
        start_hour: group.start_hour,
        end_hour: next.end_hour,
        upper_bound: merge_bound(group.upper_bound, next.upper_bound, f64::max),
        lower_bound: merge_bound(group.lower_bound, next.lower_bound, f64::min),
        window_size: group.window_size,
    }
}

fn merge_bound(a: Option<f64>, b: Option<f64>, combine: impl Fn(f64, f64) -> f64) -> Option<f64> {
    match (a, b) {
        (Some(x), Some(y)) => Some(combine(x, y)),
        (Some(x), None) => Some(x),
        (None, Some(y)) => Some(y),
        (None, None) => None,
    }
}

/// Stage 2 (§4.3): while over the cap, repeatedly merge the adjacent pair
/// with the smallest combined relative distance, until at or under the cap
/// or no adjacent pair remains.
fn hierarchical_cap(mut blocks: Vec<ThresholdGroup>, maximum_threshold_blocks: usize) -> Vec<ThresholdGroup> {
    while blocks.len() > maximum_threshold_blocks && blocks.len() > 1 {
        let mut best_idx = 0usize;
        let mut best_distance = f64::INFINITY;
        for i in 0..blocks.len() - 1 {
            let distance = pair_distance(&blocks[i], &blocks[i + 1]);
            if distance < best_distance {
                best_distance = distance;
                best_idx = i;
            }
        }
        let merged = extend(&blocks[best_idx], &blocks[best_idx + 1]);
        blocks.splice(best_idx..=best_idx + 1, [merged]);
    }
    blocks
}

fn pair_distance(a: &ThresholdGroup, b: &ThresholdGroup) -> f64 {
    let upper_distance = relative_distance(a.upper_bound, b.upper_bound);
    let lower_distance = relative_distance(a.lower_bound, b.lower_bound);
    match (upper_distance, lower_distance) {
        (Some(u), Some(l)) => (u + l) / 2.0,
        (Some(u), None) => u,
        (None, Some(l)) => l,
        (None, None) => 0.0,
    }
}

fn relative_distance(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    match (a, b) {
        (Some(x), Some(y)) => {
            let max = x.max(y).abs();
            if max == 0.0 {
                Some(0.0)
            } else {
                Some((x - y).abs() / max)
            }
        }
        _ => None,
    }
}
