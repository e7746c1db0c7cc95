//! Engine configuration: every tunable named in spec §6/§9, with literal
//! defaults centralized in [`crate::defaults`].

use serde::{Deserialize, Serialize};

use crate::defaults::*;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_min_days_for_analysis")]
    pub min_days_for_analysis: u32,

    #[serde(default = "default_analysis_period_days")]
    pub analysis_period_days: u32,

    #[serde(default = "default_min_data_points_per_day")]
    pub min_data_points_per_day: usize,

    #[serde(default = "default_min_common_points")]
    pub min_common_points: usize,

    #[serde(default = "default_correlation_threshold")]
    pub correlation_threshold: f64,

    #[serde(default = "default_number_of_time_split")]
    pub number_of_time_split: usize,

    #[serde(default = "default_window_size")]
    pub default_window_size: usize,

    #[serde(default = "default_max_window_size")]
    pub max_window_size: usize,

    #[serde(default = "default_min_ts_length")]
    pub min_ts_length: usize,

    #[serde(default = "default_sensitivity")]
    pub default_sensitivity: f64,

    #[serde(default = "default_timezone")]
    pub timezone: String,

    #[serde(default = "default_merge_tolerance")]
    pub merge_tolerance: f64,

    #[serde(default = "default_maximum_threshold_blocks")]
    pub maximum_threshold_blocks: usize,

    #[serde(default = "default_historical_days")]
    pub historical_days: u32,

    #[serde(default = "default_timeseries_data_interval")]
    pub timeseries_data_interval: u32,

    #[serde(default = "default_fetch_data_timeout_secs")]
    pub fetch_data_timeout_secs: u64,

    #[serde(default = "default_min_series_points")]
    pub min_series_points: usize,

    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    #[serde(default = "default_persist_retry_attempts")]
    pub persist_retry_attempts: u32,

    #[serde(default = "default_persist_retry_base_delay_secs")]
    pub persist_retry_base_delay_secs: u64,

    #[serde(default = "default_persist_retry_max_delay_secs")]
    pub persist_retry_max_delay_secs: u64,

    #[serde(default = "default_auto_refresh_max_iterations")]
    pub auto_refresh_max_iterations: u32,

    #[serde(default = "default_auto_refresh_gap_time_minutes")]
    pub auto_refresh_gap_time_minutes: u64,

    #[serde(default = "default_rule_sync_retry_attempts")]
    pub rule_sync_retry_attempts: u32,

    #[serde(default = "default_rule_sync_retry_base_secs")]
    pub rule_sync_retry_base_secs: u64,

    #[serde(default = "default_rule_sync_qps")]
    pub rule_sync_qps: f64,

    #[serde(default = "default_rule_delete_batch_size")]
    pub rule_delete_batch_size: usize,

    #[serde(default = "default_engine_id")]
    pub engine_id: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            min_days_for_analysis: default_min_days_for_analysis(),
            analysis_period_days: default_analysis_period_days(),
            min_data_points_per_day: default_min_data_points_per_day(),
            min_common_points: default_min_common_points(),
            correlation_threshold: default_correlation_threshold(),
            number_of_time_split: default_number_of_time_split(),
            default_window_size: default_window_size(),
            max_window_size: default_max_window_size(),
            min_ts_length: default_min_ts_length(),
            default_sensitivity: default_sensitivity(),
            timezone: default_timezone(),
            merge_tolerance: default_merge_tolerance(),
            maximum_threshold_blocks: default_maximum_threshold_blocks(),
            historical_days: default_historical_days(),
            timeseries_data_interval: default_timeseries_data_interval(),
            fetch_data_timeout_secs: default_fetch_data_timeout_secs(),
            min_series_points: default_min_series_points(),
            max_concurrent: default_max_concurrent(),
            persist_retry_attempts: default_persist_retry_attempts(),
            persist_retry_base_delay_secs: default_persist_retry_base_delay_secs(),
            persist_retry_max_delay_secs: default_persist_retry_max_delay_secs(),
            auto_refresh_max_iterations: default_auto_refresh_max_iterations(),
            auto_refresh_gap_time_minutes: default_auto_refresh_gap_time_minutes(),
            rule_sync_retry_attempts: default_rule_sync_retry_attempts(),
            rule_sync_retry_base_secs: default_rule_sync_retry_base_secs(),
            rule_sync_qps: default_rule_sync_qps(),
            rule_delete_batch_size: default_rule_delete_batch_size(),
            engine_id: default_engine_id(),
        }
    }
}
