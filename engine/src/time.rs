//! Timestamp normalization and timezone-aware hour-of-day computation.
//!
//! Grounded on `threshold_recommendation_algorithm.py`'s
//! `normalize_timestamp_to_seconds` and `get_timestamp_hour`.

use chrono::{TimeZone, Timelike};
use chrono_tz::Tz;

const NANOSECOND_THRESHOLD: f64 = 1e18;
const MICROSECOND_THRESHOLD: f64 = 1e15;
const MILLISECOND_THRESHOLD: f64 = 1e12;

/// Convert timestamps of unknown precision to Unix seconds, by magnitude.
pub fn normalize_timestamp_to_seconds(timestamp: f64) -> f64 {
    if timestamp >= NANOSECOND_THRESHOLD {
        timestamp / 1_000_000_000.0
    } else if timestamp >= MICROSECOND_THRESHOLD {
        timestamp / 1_000_000.0
    } else if timestamp >= MILLISECOND_THRESHOLD {
        timestamp / 1_000.0
    } else {
        timestamp
    }
}

/// Hour-of-day, as a decimal in `[0, 24)`, for a Unix-seconds timestamp in
/// the given IANA timezone. Falls back to UTC if the zone name is unknown.
pub fn hour_of(timestamp_secs: f64, timezone: &str) -> f64 {
    let tz: Tz = timezone.parse().unwrap_or(chrono_tz::UTC);
    let secs = timestamp_secs.floor() as i64;
    let nanos = ((timestamp_secs - secs as f64) * 1_000_000_000.0) as u32;
    let dt = tz
        .timestamp_opt(secs, nanos)
        .single()
        .unwrap_or_else(|| tz.timestamp_opt(secs, 0).single().unwrap());
    dt.hour() as f64 + dt.minute() as f64 / 60.0 + dt.second() as f64 / 3600.0
}

/// Linear-interpolation percentile (matches `numpy.percentile` default mode).
///
/// `q` is in `[0, 100]`. Returns `0.0` for an empty slice.
pub fn percentile(values: &[f64], q: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted: Vec<f64> = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    if sorted.len() == 1 {
        return sorted[0];
    }
    let rank = (q / 100.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    if lo == hi {
        sorted[lo]
    } else {
        let frac = rank - lo as f64;
        sorted[lo] + (sorted[hi] - sorted[lo]) * frac
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_by_magnitude() {
        assert_eq!(normalize_timestamp_to_seconds(1_700_000_000.0), 1_700_000_000.0);
        assert_eq!(normalize_timestamp_to_seconds(1_700_000_000_000.0), 1_700_000_000.0);
        assert_eq!(normalize_timestamp_to_seconds(1_700_000_000_000_000.0), 1_700_000_000.0);
        assert_eq!(
            normalize_timestamp_to_seconds(1_700_000_000_000_000_000.0),
            1_700_000_000.0
        );
    }

    #[test]
    fn hour_of_utc_midnight() {
        // 1970-01-01T00:00:00Z
        assert_eq!(hour_of(0.0, "UTC"), 0.0);
        // 1970-01-01T12:30:00Z
        assert_eq!(hour_of(12.0 * 3600.0 + 30.0 * 60.0, "UTC"), 12.5);
    }

    #[test]
    fn hour_of_unknown_timezone_falls_back_to_utc() {
        assert_eq!(hour_of(3600.0, "Not/A_Zone"), hour_of(3600.0, "UTC"));
    }

    #[test]
    fn percentile_linear_interpolation() {
        let values = vec![1.0, 2.0, 3.0, 4.0];
        assert_eq!(percentile(&values, 0.0), 1.0);
        assert_eq!(percentile(&values, 100.0), 4.0);
        assert_eq!(percentile(&values, 50.0), 2.5);
    }

    #[test]
    fn percentile_95_of_constant_series() {
        let values = vec![50.0; 100];
        assert_eq!(percentile(&values, 95.0), 50.0);
    }
}
