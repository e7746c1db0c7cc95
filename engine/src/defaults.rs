//! Default values for configuration parameters.
//!
//! This module centralizes all default value functions used by `EngineConfig`.
//! These functions are used by serde when deserializing configuration files
//! that don't specify certain optional fields.

// Period detector (C1) defaults

/// Default minimum days of history required before detection runs (2 days)
pub fn default_min_days_for_analysis() -> u32 {
    2
}

/// Default trailing analysis window (7 days)
pub fn default_analysis_period_days() -> u32 {
    7
}

/// Default minimum filled slots per day to keep that day (720, ~1 point/2min)
pub fn default_min_data_points_per_day() -> usize {
    720
}

/// Default minimum common slots required across days for correlation (720)
pub fn default_min_common_points() -> usize {
    720
}

/// Default minimum mean pairwise correlation to call a series daily-periodic
pub fn default_correlation_threshold() -> f64 {
    0.3
}

// Threshold algorithm (C2) defaults

/// Default number of equal time-of-day splits when periodicity is detected
pub fn default_number_of_time_split() -> usize {
    4
}

/// Default sliding-window size (in sample points) before auto-adjustment
pub fn default_window_size() -> usize {
    3
}

/// Largest sliding-window size auto-adjustment will try
pub fn default_max_window_size() -> usize {
    9
}

/// Default minimum series length (in points) required for time-split analysis
pub fn default_min_ts_length() -> usize {
    1440
}

/// Default sensitivity dial in `[0,1]`
pub fn default_sensitivity() -> f64 {
    0.5
}

/// Host-inferred IANA timezone name used to compute "hour of day"
pub fn default_timezone() -> String {
    "UTC".to_string()
}

// Block merger (C3) defaults

/// Default relative tolerance for greedy adjacency merge (10%)
pub fn default_merge_tolerance() -> f64 {
    0.10
}

/// Default cap on the number of blocks retained after merge
pub fn default_maximum_threshold_blocks() -> usize {
    8
}

// Recommender (C4) defaults

/// Default historical window fetched per run (7 days)
pub fn default_historical_days() -> u32 {
    7
}

/// Default requested sample interval for fetched series (60 seconds)
pub fn default_timeseries_data_interval() -> u32 {
    60
}

/// Default per-run data fetch timeout (3600 seconds / 1 hour)
pub fn default_fetch_data_timeout_secs() -> u64 {
    3600
}

/// Default minimum series length (in points) accepted by the validation gate
pub fn default_min_series_points() -> usize {
    1440
}

// Priority scheduler (C5) defaults

/// Default maximum number of concurrently running recommender executions
pub fn default_max_concurrent() -> usize {
    5
}

/// Default scheduler persistence-write retry attempts
pub fn default_persist_retry_attempts() -> u32 {
    3
}

/// Default scheduler persistence-write retry base delay (1 second)
pub fn default_persist_retry_base_delay_secs() -> u64 {
    1
}

/// Default scheduler persistence-write retry max delay (10 seconds)
pub fn default_persist_retry_max_delay_secs() -> u64 {
    10
}

// Auto-refresh controller (C6) defaults

/// Default maximum number of iterations per `process` call
pub fn default_auto_refresh_max_iterations() -> u32 {
    100
}

/// Default wait between `process` iterations (10 minutes)
pub fn default_auto_refresh_gap_time_minutes() -> u64 {
    10
}

// Rule synchronizer (C7) defaults

/// Default per-call retry attempts against the monitoring provider
pub fn default_rule_sync_retry_attempts() -> u32 {
    3
}

/// Default rule-sync retry backoff base (`2 * 2^attempt` seconds starts here)
pub fn default_rule_sync_retry_base_secs() -> u64 {
    2
}

/// Default token-bucket refill rate when a datasource specifies none (5 qps)
pub fn default_rule_sync_qps() -> f64 {
    5.0
}

/// Default batch size for bulk rule deletion
pub fn default_rule_delete_batch_size() -> usize {
    10
}

/// Default engine identity tag stamped onto every managed rule
pub fn default_engine_id() -> String {
    "intelligent-threshold-engine".to_string()
}
