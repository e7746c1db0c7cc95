//! Daily-periodicity detector (C1, §4.1).
//!
//! Grounded on `robust_daily_period_detector.py`'s `RobustDailyPeriodDetector`,
//! translated from exception-absorbing control flow into explicit early
//! returns — the contract is the same "never fatal, worst case `false`"
//! heuristic gate, just expressed without a catch-all `except Exception`.

use std::collections::{HashMap, HashSet};

const SECONDS_PER_DAY: f64 = 86400.0;

/// Tunables threaded in from `EngineConfig` rather than hardcoded, per
/// spec §9's note that the 720-point defaults should stay configurable.
#[derive(Debug, Clone, Copy)]
pub struct PeriodDetectorConfig {
    pub min_days_for_analysis: u32,
    pub analysis_period_days: u32,
    pub min_data_points_per_day: usize,
    pub min_common_points: usize,
    pub correlation_threshold: f64,
}

struct DayBucket {
    slots: HashMap<i64, f64>,
    min_time_in_day: f64,
    max_time_in_day: f64,
}

/// Detect whether `(timestamps, values)` exhibits a repeating daily shape.
///
/// `timestamps` must already be in Unix seconds (see `crate::time`); any
/// failure mode along the way (insufficient span, no stable sampling
/// interval, too few complete days, drifting value ranges, weak
/// correlation) yields `false` rather than propagating an error — detection
/// is a heuristic gate, never a hard failure.
pub fn detect(timestamps: &[f64], values: &[f64], cfg: &PeriodDetectorConfig) -> bool {
    if timestamps.is_empty() || timestamps.len() != values.len() {
        return false;
    }

    let (min_ts, max_ts) = match min_max(timestamps) {
        Some(pair) => pair,
        None => return false,
    };
    if max_ts - min_ts < cfg.min_days_for_analysis as f64 * SECONDS_PER_DAY {
        return false;
    }

    // Sort by timestamp, then restrict to the trailing analysis window.
    let mut order: Vec<usize> = (0..timestamps.len()).collect();
    order.sort_by(|&a, &b| timestamps[a].partial_cmp(&timestamps[b]).unwrap_or(std::cmp::Ordering::Equal));
    let sorted_ts: Vec<f64> = order.iter().map(|&i| timestamps[i]).collect();
    let sorted_vals: Vec<f64> = order.iter().map(|&i| values[i]).collect();

    let cutoff = sorted_ts[sorted_ts.len() - 1] - SECONDS_PER_DAY * cfg.analysis_period_days as f64;
    let start_idx = sorted_ts.partition_point(|&ts| ts < cutoff);
    if start_idx >= sorted_ts.len() {
        return false;
    }
    let analysis_ts = &sorted_ts[start_idx..];
    let analysis_vals = &sorted_vals[start_idx..];

    let sampling_interval = determine_sampling_interval(analysis_ts);
    if sampling_interval <= 0.0 {
        return false;
    }

    let (daily_data, day_completeness) = organize_by_days(analysis_ts, analysis_vals, sampling_interval);

    let filtered: HashMap<i64, &HashMap<i64, f64>> = daily_data
        .iter()
        .filter(|(_, slots)| slots.len() >= cfg.min_data_points_per_day)
        .map(|(day, slots)| (*day, slots))
        .collect();
    if filtered.len() < 2 {
        return false;
    }

    if !value_ranges_overlap(&filtered, &day_completeness) {
        return false;
    }

    calculate_daily_correlations(&filtered, cfg)
}

fn min_max(values: &[f64]) -> Option<(f64, f64)> {
    if values.is_empty() {
        return None;
    }
    let mut min = values[0];
    let mut max = values[0];
    for &v in values {
        if v < min {
            min = v;
        }
        if v > max {
            max = v;
        }
    }
    Some((min, max))
}

/// Most frequent positive integer gap between consecutive sorted timestamps.
fn determine_sampling_interval(timestamps: &[f64]) -> f64 {
    if timestamps.len() < 2 {
        return 0.0;
    }
    let mut counts: HashMap<i64, u32> = HashMap::new();
    for w in timestamps.windows(2) {
        let interval = (w[1] - w[0]) as i64;
        if interval > 0 {
            *counts.entry(interval).or_insert(0) += 1;
        }
    }
    counts
        .into_iter()
        .max_by_key(|&(_, count)| count)
        .map(|(interval, _)| interval as f64)
        .unwrap_or(0.0)
}

fn organize_by_days(
    timestamps: &[f64],
    values: &[f64],
    sampling_interval: f64,
) -> (HashMap<i64, HashMap<i64, f64>>, HashMap<i64, bool>) {
    let start_ts = timestamps[0];
    let mut daily_data: HashMap<i64, HashMap<i64, f64>> = HashMap::new();
    let mut coverage: HashMap<i64, (f64, f64)> = HashMap::new();

    for (&ts, &value) in timestamps.iter().zip(values.iter()) {
        let day_key = ((ts - start_ts) / SECONDS_PER_DAY) as i64;
        let time_within_day = (ts - start_ts).rem_euclid(SECONDS_PER_DAY);
        let slot = (time_within_day / sampling_interval) as i64;

        daily_data.entry(day_key).or_default().insert(slot, value);
        let entry = coverage.entry(day_key).or_insert((time_within_day, time_within_day));
        entry.0 = entry.0.min(time_within_day);
        entry.1 = entry.1.max(time_within_day);
    }

    let expected_span = SECONDS_PER_DAY - sampling_interval;
    let completeness: HashMap<i64, bool> = coverage
        .into_iter()
        .map(|(day, (min_t, max_t))| (day, max_t - min_t >= expected_span))
        .collect();

    (daily_data, completeness)
}

fn value_ranges_overlap(daily_data: &HashMap<i64, &HashMap<i64, f64>>, completeness: &HashMap<i64, bool>) -> bool {
    struct Stat {
        min: f64,
        max: f64,
    }

    let stats: HashMap<i64, Stat> = daily_data
        .iter()
        .filter_map(|(&day, slots)| {
            let mut values = slots.values().copied();
            let first = values.next()?;
            let (mut min, mut max) = (first, first);
            for v in values {
                min = min.min(v);
                max = max.max(v);
            }
            Some((day, Stat { min, max }))
        })
        .collect();

    let complete_days: Vec<i64> = completeness
        .iter()
        .filter(|&(_, &is_complete)| is_complete)
        .map(|(&day, _)| day)
        .collect();

    for (i, &day_i) in complete_days.iter().enumerate() {
        for &day_j in &complete_days[i + 1..] {
            if let (Some(a), Some(b)) = (stats.get(&day_i), stats.get(&day_j)) {
                if a.min >= b.max || a.max <= b.min {
                    return false;
                }
            }
        }
    }
    true
}

fn calculate_daily_correlations(daily_data: &HashMap<i64, &HashMap<i64, f64>>, cfg: &PeriodDetectorConfig) -> bool {
    let days: Vec<i64> = daily_data.keys().copied().collect();

    let mut common: Option<HashSet<i64>> = None;
    for day in &days {
        let slots: HashSet<i64> = daily_data[day].keys().copied().collect();
        common = Some(match common {
            None => slots,
            Some(acc) => acc.intersection(&slots).copied().collect(),
        });
    }
    let common = common.unwrap_or_default();

    if common.len() >= cfg.min_common_points {
        let mut sorted_common: Vec<i64> = common.into_iter().collect();
        sorted_common.sort();

        let mut correlations = Vec::new();
        for i in 0..days.len() {
            for j in (i + 1)..days.len() {
                let a: Vec<f64> = sorted_common.iter().map(|s| daily_data[&days[i]][s]).collect();
                let b: Vec<f64> = sorted_common.iter().map(|s| daily_data[&days[j]][s]).collect();
                if let Some(corr) = pearson(&a, &b) {
                    correlations.push(corr);
                }
            }
        }
        mean_meets_threshold(&correlations, cfg.correlation_threshold)
    } else {
        let mut correlations = Vec::new();
        for i in 0..days.len() {
            for j in (i + 1)..days.len() {
                let slots_i: HashSet<i64> = daily_data[&days[i]].keys().copied().collect();
                let slots_j: HashSet<i64> = daily_data[&days[j]].keys().copied().collect();
                let mut pair_common: Vec<i64> = slots_i.intersection(&slots_j).copied().collect();
                if pair_common.len() < cfg.min_common_points {
                    continue;
                }
                pair_common.sort();
                let a: Vec<f64> = pair_common.iter().map(|s| daily_data[&days[i]][s]).collect();
                let b: Vec<f64> = pair_common.iter().map(|s| daily_data[&days[j]][s]).collect();
                if let Some(corr) = pearson(&a, &b) {
                    correlations.push(corr);
                }
            }
        }
        mean_meets_threshold(&correlations, cfg.correlation_threshold)
    }
}

fn mean_meets_threshold(correlations: &[f64], threshold: f64) -> bool {
    if correlations.is_empty() {
        return false;
    }
    let mean = correlations.iter().sum::<f64>() / correlations.len() as f64;
    mean >= threshold
}

/// Pearson correlation; `None` if either series is constant, mismatched in
/// length, empty, or the result is non-finite.
fn pearson(a: &[f64], b: &[f64]) -> Option<f64> {
    if a.is_empty() || b.is_empty() || a.len() != b.len() {
        return None;
    }
    if is_constant(a) || is_constant(b) {
        return None;
    }

    let n = a.len() as f64;
    let mean_a = a.iter().sum::<f64>() / n;
    let mean_b = b.iter().sum::<f64>() / n;

    let mut cov = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    for i in 0..a.len() {
        let da = a[i] - mean_a;
        let db = b[i] - mean_b;
        cov += da * db;
        var_a += da * da;
        var_b += db * db;
    }

    let denom = (var_a * var_b).sqrt();
    if denom == 0.0 {
        return None;
    }
    let corr = cov / denom;
    if corr.is_finite() {
        Some(corr)
    } else {
        None
    }
}

fn is_constant(values: &[f64]) -> bool {
    values.iter().all(|&v| v == values[0])
}

impl Default for PeriodDetectorConfig {
    fn default() -> Self {
        Self {
            min_days_for_analysis: 2,
            analysis_period_days: 7,
            min_data_points_per_day: 720,
            min_common_points: 720,
            correlation_threshold: 0.3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn series_for(days: usize, interval: f64, f: impl Fn(f64) -> f64) -> (Vec<f64>, Vec<f64>) {
        let points_per_day = (SECONDS_PER_DAY / interval) as usize;
        let total = days * points_per_day;
        let mut ts = Vec::with_capacity(total);
        let mut vals = Vec::with_capacity(total);
        for i in 0..total {
            let t = i as f64 * interval;
            ts.push(t);
            vals.push(f(t));
        }
        (ts, vals)
    }

    #[test]
    fn constant_series_is_not_periodic() {
        let cfg = PeriodDetectorConfig::default();
        let (ts, vals) = series_for(7, 60.0, |_| 50.0);
        assert!(!detect(&ts, &vals, &cfg));
    }

    #[test]
    fn short_span_is_not_periodic() {
        let cfg = PeriodDetectorConfig::default();
        let (ts, vals) = series_for(1, 60.0, |t| 50.0 + 10.0 * (t / 3600.0).sin());
        assert!(!detect(&ts, &vals, &cfg));
    }

    #[test]
    fn daily_sinusoid_plus_noise_is_periodic() {
        let cfg = PeriodDetectorConfig::default();
        let (ts, vals) = series_for(7, 60.0, |t| {
            let phase = (t % SECONDS_PER_DAY) / SECONDS_PER_DAY * std::f64::consts::TAU;
            50.0 + 20.0 * phase.sin()
        });
        assert!(detect(&ts, &vals, &cfg));
    }

    #[test]
    fn random_walk_is_not_periodic() {
        let cfg = PeriodDetectorConfig::default();
        // Deterministic pseudo-random walk (no RNG dependency in tests).
        let mut state: u64 = 0x2545F4914F6CDD1D;
        let mut next = || {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            (state % 1000) as f64 / 1000.0
        };
        let (ts, _) = series_for(7, 60.0, |_| 0.0);
        let mut vals = Vec::with_capacity(ts.len());
        let mut acc = 0.0;
        for _ in &ts {
            acc += next() - 0.5;
            vals.push(acc);
        }
        assert!(!detect(&ts, &vals, &cfg));
    }
}
