//! Recommender / task executor (C4, §4.4): fetch once, run C1→C2→C3 per
//! series per direction, merge up/down results.
//!
//! Grounded on `threshold_recommender.py`'s `ThresholdRecommender.calculate_threshold`
//! / `_process_time_series_data` / `_merge_threshold_results` /
//! `_fetch_and_validate_data`, and on `agent/src/tasks.rs`'s `TaskExecutor`
//! split between a pure result struct and an executing method.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::merge::merge_blocks;
use crate::model::{Direction, IntelligentThresholdConfig, MetricTemplateValue, MetricThresholdResult, SeriesStatus};
use crate::period_detector::PeriodDetectorConfig;
use crate::threshold::{recommend_threshold, ThresholdGroup, ThresholdParams};
use crate::traits::{Fetcher, TimeSeries};

const EXTREME_VALUE_THRESHOLD: f64 = 1e50;

/// Outcome of one `calculate_threshold` call (§4.4), mirroring the Python
/// source's `{status, result, message}` dict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionStatus {
    Success,
    Failed,
    NoData,
}

#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub status: ExecutionStatus,
    pub result: Vec<MetricThresholdResult>,
    pub message: String,
}

/// Run C4 for one task: fetch historical data, compute thresholds for the
/// requested direction(s), merge up/down if `direction=both`.
pub async fn calculate_threshold(
    fetcher: &dyn Fetcher,
    cfg: &EngineConfig,
    datasource_id: &str,
    metric_template_value: &MetricTemplateValue,
    window_size: usize,
    direction: Direction,
    sensitivity: f64,
) -> ExecutionOutcome {
    info!(datasource_id, ?direction, "starting threshold calculation");

    let series = match fetch_and_validate_data(fetcher, cfg, datasource_id).await {
        Ok(series) => series,
        Err(outcome) => return outcome,
    };

    let (min_value, max_value) = validate_and_normalize_values(metric_template_value.min_value, metric_template_value.max_value);

    if direction == Direction::Both {
        debug!("calculating both upper and lower bounds with a single data fetch");

        let normal_up = get_normal_threshold(metric_template_value, Direction::Up);
        let (up_results, up_success, up_data_errors) =
            process_time_series_data(&series, metric_template_value, cfg, window_size, Direction::Up, min_value, max_value, normal_up, sensitivity);

        let normal_down = get_normal_threshold(metric_template_value, Direction::Down);
        let (down_results, down_success, down_data_errors) = process_time_series_data(
            &series,
            metric_template_value,
            cfg,
            window_size,
            Direction::Down,
            min_value,
            max_value,
            normal_down,
            sensitivity,
        );

        let merged = merge_threshold_results(up_results, down_results, cfg.maximum_threshold_blocks);

        let total_success = up_success + down_success;
        let total_data_errors = up_data_errors + down_data_errors;

        info!(series_count = merged.len(), "merged up/down thresholds");

        if total_success == 0 {
            warn!(datasource_id, "no time series were successfully processed");
            let message = if total_data_errors > 0 { "Input Data Validation Error" } else { "Internal Server Error" };
            return ExecutionOutcome {
                status: ExecutionStatus::Failed,
                result: merged,
                message: message.to_string(),
            };
        }

        return ExecutionOutcome {
            status: ExecutionStatus::Success,
            result: merged,
            message: "Task Success!".to_string(),
        };
    }

    let normal_threshold = get_normal_threshold(metric_template_value, direction);
    let (results, success_count, data_errors) =
        process_time_series_data(&series, metric_template_value, cfg, window_size, direction, min_value, max_value, normal_threshold, sensitivity);

    info!(success_count, total = series.len(), "threshold calculation complete");

    if success_count == 0 {
        warn!(datasource_id, "no time series were successfully processed");
        let message = if data_errors > 0 { "Input Data Validation Error" } else { "Internal Server Error" };
        return ExecutionOutcome {
            status: ExecutionStatus::Failed,
            result: results,
            message: message.to_string(),
        };
    }

    ExecutionOutcome {
        status: ExecutionStatus::Success,
        result: results,
        message: "Task Success!".to_string(),
    }
}

async fn fetch_and_validate_data(fetcher: &dyn Fetcher, cfg: &EngineConfig, datasource_id: &str) -> std::result::Result<Vec<TimeSeries>, ExecutionOutcome> {
    let end_time = crate::utils::current_timestamp() as i64;
    let start_time = end_time - cfg.historical_days as i64 * 86400;

    debug!(start_time, end_time, datasource_id, "fetching historical data");

    let fetch_future = fetcher.fetch_data(datasource_id, start_time, end_time, cfg.timeseries_data_interval as i64);
    let timeout = Duration::from_secs(cfg.fetch_data_timeout_secs);

    let series = match tokio::time::timeout(timeout, fetch_future).await {
        Ok(Ok(series)) => series,
        Ok(Err(EngineError::Cancelled(msg))) => {
            warn!(datasource_id, "data fetch was cancelled");
            return Err(ExecutionOutcome {
                status: ExecutionStatus::Failed,
                result: Vec::new(),
                message: format!("Data fetch was cancelled: {msg}"),
            });
        }
        Ok(Err(err)) => {
            warn!(datasource_id, error = %err, "data fetch failed");
            return Err(ExecutionOutcome {
                status: ExecutionStatus::Failed,
                result: Vec::new(),
                message: format!("Error: {err}"),
            });
        }
        Err(_) => {
            warn!(datasource_id, "data fetch timeout");
            return Err(ExecutionOutcome {
                status: ExecutionStatus::Failed,
                result: Vec::new(),
                message: format!("Data fetch timeout after {} seconds", cfg.fetch_data_timeout_secs),
            });
        }
    };

    if series.is_empty() {
        warn!(datasource_id, "no data retrieved");
        return Err(ExecutionOutcome {
            status: ExecutionStatus::NoData,
            result: Vec::new(),
            message: "No data available for threshold calculation".to_string(),
        });
    }

    Ok(series)
}

/// Swap if `min > max`; treat magnitudes over `EXTREME_VALUE_THRESHOLD` as unbounded.
fn validate_and_normalize_values(min_value: Option<f64>, max_value: Option<f64>) -> (Option<f64>, Option<f64>) {
    let (mut min_value, mut max_value) = (min_value, max_value);
    if let (Some(min), Some(max)) = (min_value, max_value) {
        if min > max {
            std::mem::swap(&mut min_value, &mut max_value);
        }
    }
    let normalized_min = min_value.filter(|v| *v >= -EXTREME_VALUE_THRESHOLD);
    let normalized_max = max_value.filter(|v| *v <= EXTREME_VALUE_THRESHOLD);
    (normalized_min, normalized_max)
}

fn get_normal_threshold(metric_template_value: &MetricTemplateValue, direction: Direction) -> Option<f64> {
    let start = metric_template_value.normal_range_start.filter(|v| *v >= -EXTREME_VALUE_THRESHOLD);
    let end = metric_template_value.normal_range_end.filter(|v| *v <= EXTREME_VALUE_THRESHOLD);
    if direction == Direction::Up {
        end
    } else {
        start
    }
}

fn validate_input_data(timestamps: &[f64], values: &[f64], min_ts_length: usize) -> std::result::Result<(), String> {
    if timestamps.is_empty() || values.is_empty() {
        return Err("Empty timestamp or value list".to_string());
    }
    if timestamps.len() != values.len() {
        return Err("Timestamp and value lists have different lengths".to_string());
    }
    if timestamps.len() < min_ts_length {
        return Err("Insufficient data points (need at least 1 day data)".to_string());
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn process_time_series_data(
    series: &[TimeSeries],
    metric_template_value: &MetricTemplateValue,
    cfg: &EngineConfig,
    window_size: usize,
    direction: Direction,
    min_value: Option<f64>,
    max_value: Option<f64>,
    normal_threshold: Option<f64>,
    sensitivity: f64,
) -> (Vec<MetricThresholdResult>, usize, usize) {
    let mut results = Vec::with_capacity(series.len());
    let mut success_count = 0usize;
    let mut data_validation_errors = 0usize;

    let min_ts_length = metric_template_value.min_ts_length.max(cfg.min_series_points);

    for item in series {
        let timestamps: Vec<f64> = item.timestamps.iter().map(|&t| t as f64).collect();

        if let Err(msg) = validate_input_data(&timestamps, &item.values, min_ts_length) {
            data_validation_errors += 1;
            results.push(MetricThresholdResult {
                name: item.name.clone(),
                labels: item.labels.clone(),
                unique_key: item.unique_key.clone(),
                thresholds: Vec::new(),
                status: SeriesStatus::Failed,
                error_message: msg,
            });
            continue;
        }

        let params = ThresholdParams {
            default_window_size: window_size,
            time_split: true,
            auto_window_adjust: true,
            min_value,
            max_value,
            normal_threshold,
            min_ts_length,
            sensitivity,
            max_window_size: cfg.max_window_size,
            timezone: cfg.timezone.clone(),
            number_of_time_split: cfg.number_of_time_split,
        };
        let detector_cfg = PeriodDetectorConfig {
            min_data_points_per_day: cfg.min_data_points_per_day,
            min_common_points: cfg.min_common_points,
            correlation_threshold: cfg.correlation_threshold,
            ..PeriodDetectorConfig::default()
        };

        let groups: Vec<ThresholdGroup> = recommend_threshold(&timestamps, &item.values, &params, direction, &detector_cfg);
        let merged = merge_blocks(groups, cfg.maximum_threshold_blocks);

        let thresholds: Vec<IntelligentThresholdConfig> = merged
            .into_iter()
            .map(|g| IntelligentThresholdConfig {
                start_hour: g.start_hour,
                end_hour: g.end_hour,
                upper_bound: g.upper_bound,
                lower_bound: g.lower_bound,
                window_size: g.window_size,
            })
            .collect();

        results.push(MetricThresholdResult {
            name: item.name.clone(),
            labels: item.labels.clone(),
            unique_key: item.unique_key.clone(),
            thresholds,
            status: SeriesStatus::Success,
            error_message: String::new(),
        });
        success_count += 1;
    }

    (results, success_count, data_validation_errors)
}

/// §4.4.1 up/down merge semantics.
fn merge_threshold_results(up_results: Vec<MetricThresholdResult>, down_results: Vec<MetricThresholdResult>, maximum_threshold_blocks: usize) -> Vec<MetricThresholdResult> {
    use std::collections::HashMap;

    let mut down_by_key: HashMap<String, MetricThresholdResult> = down_results.into_iter().map(|r| (r.unique_key.clone(), r)).collect();
    let mut merged = Vec::new();

    for up_result in up_results {
        let Some(down_result) = down_by_key.remove(&up_result.unique_key) else {
            merged.push(up_result);
            continue;
        };

        if up_result.status != SeriesStatus::Success || down_result.status != SeriesStatus::Success {
            let error_message = if up_result.status != SeriesStatus::Success { up_result.error_message } else { down_result.error_message };
            merged.push(MetricThresholdResult {
                name: up_result.name,
                labels: up_result.labels,
                unique_key: up_result.unique_key,
                thresholds: Vec::new(),
                status: SeriesStatus::Failed,
                error_message,
            });
            continue;
        }

        let merged_thresholds = merge_paired_thresholds(&up_result.thresholds, &down_result.thresholds);
        let recombined = merge_blocks(
            merged_thresholds
                .into_iter()
                .map(|t| ThresholdGroup {
                    start_hour: t.start_hour,
                    end_hour: t.end_hour,
                    upper_bound: t.upper_bound,
                    lower_bound: t.lower_bound,
                    window_size: t.window_size,
                })
                .collect(),
            maximum_threshold_blocks,
        );

        merged.push(MetricThresholdResult {
            name: up_result.name,
            labels: up_result.labels,
            unique_key: up_result.unique_key,
            thresholds: recombined
                .into_iter()
                .map(|g| IntelligentThresholdConfig {
                    start_hour: g.start_hour,
                    end_hour: g.end_hour,
                    upper_bound: g.upper_bound,
                    lower_bound: g.lower_bound,
                    window_size: g.window_size,
                })
                .collect(),
            status: SeriesStatus::Success,
            error_message: String::new(),
        });
    }

    for (_, down_result) in down_by_key {
        merged.push(down_result);
    }

    merged
}

fn is_consolidated(thresholds: &[IntelligentThresholdConfig]) -> bool {
    thresholds.len() == 1 && thresholds[0].start_hour == 0.0 && thresholds[0].end_hour == 24.0
}

fn merge_paired_thresholds(up_thresholds: &[IntelligentThresholdConfig], down_thresholds: &[IntelligentThresholdConfig]) -> Vec<IntelligentThresholdConfig> {
    let up_consolidated = is_consolidated(up_thresholds);
    let down_consolidated = is_consolidated(down_thresholds);

    if up_consolidated && !down_consolidated {
        return down_thresholds
            .iter()
            .map(|d| IntelligentThresholdConfig {
                start_hour: d.start_hour,
                end_hour: d.end_hour,
                upper_bound: up_thresholds[0].upper_bound,
                lower_bound: d.lower_bound,
                window_size: d.window_size,
            })
            .collect();
    }

    if !up_consolidated && down_consolidated {
        return up_thresholds
            .iter()
            .map(|u| IntelligentThresholdConfig {
                start_hour: u.start_hour,
                end_hour: u.end_hour,
                upper_bound: u.upper_bound,
                lower_bound: down_thresholds[0].lower_bound,
                window_size: u.window_size,
            })
            .collect();
    }

    if up_consolidated && down_consolidated {
        return up_thresholds
            .iter()
            .map(|u| {
                let matching = down_thresholds.iter().find(|d| d.start_hour == u.start_hour && d.end_hour == u.end_hour);
                match matching {
                    Some(d) => IntelligentThresholdConfig {
                        start_hour: u.start_hour,
                        end_hour: u.end_hour,
                        upper_bound: u.upper_bound,
                        lower_bound: d.lower_bound,
                        window_size: u.window_size,
                    },
                    None => u.clone(),
                }
            })
            .collect();
    }

    let mut merged = Vec::with_capacity(up_thresholds.len() + down_thresholds.len());
    for u in up_thresholds {
        let matching = down_thresholds.iter().find(|d| d.start_hour == u.start_hour && d.end_hour == u.end_hour);
        match matching {
            Some(d) => merged.push(IntelligentThresholdConfig {
                start_hour: u.start_hour,
                end_hour: u.end_hour,
                upper_bound: u.upper_bound,
                lower_bound: d.lower_bound,
                window_size: u.window_size,
            }),
            None => merged.push(u.clone()),
        }
    }
    for d in down_thresholds {
        if !up_thresholds.iter().any(|u| u.start_hour == d.start_hour && u.end_hour == d.end_hour) {
            merged.push(d.clone());
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use async_trait::async_trait;

    struct StaticFetcher {
        series: Vec<TimeSeries>,
    }

    #[async_trait]
    impl Fetcher for StaticFetcher {
        async fn fetch_data(&self, _datasource_id: &str, _start_unix: i64, _end_unix: i64, _interval_seconds: i64) -> Result<Vec<TimeSeries>> {
            Ok(self.series.clone())
        }
    }

    fn sinusoid(days: usize, interval: i64) -> TimeSeries {
        let points_per_day = (86400 / interval) as usize;
        let total = days * points_per_day;
        let mut timestamps = Vec::with_capacity(total);
        let mut values = Vec::with_capacity(total);
        for i in 0..total {
            let t = i as i64 * interval;
            timestamps.push(t);
            let phase = ((t % 86400) as f64 / 86400.0) * std::f64::consts::TAU;
            values.push(50.0 + 20.0 * phase.sin());
        }
        TimeSeries {
            name: "cpu.usage".to_string(),
            labels: BTreeMap::new(),
            unique_key: "cpu.usage|".to_string(),
            timestamps,
            values,
        }
    }

    #[tokio::test]
    async fn scenario_5_consolidation_mismatch_broadcasts_up_bound() {
        let up = vec![IntelligentThresholdConfig {
            start_hour: 0.0,
            end_hour: 24.0,
            upper_bound: Some(80.0),
            lower_bound: None,
            window_size: 3,
        }];
        let down = vec![
            IntelligentThresholdConfig { start_hour: 0.0, end_hour: 6.0, upper_bound: None, lower_bound: Some(10.0), window_size: 3 },
            IntelligentThresholdConfig { start_hour: 6.0, end_hour: 12.0, upper_bound: None, lower_bound: Some(20.0), window_size: 3 },
            IntelligentThresholdConfig { start_hour: 12.0, end_hour: 18.0, upper_bound: None, lower_bound: Some(30.0), window_size: 3 },
            IntelligentThresholdConfig { start_hour: 18.0, end_hour: 24.0, upper_bound: None, lower_bound: Some(40.0), window_size: 3 },
        ];

        let merged = merge_paired_thresholds(&up, &down);
        assert_eq!(merged.len(), 4);
        for (m, d) in merged.iter().zip(down.iter()) {
            assert_eq!(m.upper_bound, Some(80.0));
            assert_eq!(m.lower_bound, d.lower_bound);
        }
    }

    #[tokio::test]
    async fn happy_path_single_direction_up_succeeds() {
        let fetcher = StaticFetcher { series: vec![sinusoid(7, 60)] };
        let cfg = EngineConfig::default();
        let mtv = MetricTemplateValue {
            min_value: None,
            max_value: None,
            normal_range_start: None,
            normal_range_end: None,
            min_ts_length: 1440,
        };
        let outcome = calculate_threshold(&fetcher, &cfg, "ds-1", &mtv, cfg.default_window_size, Direction::Up, 0.5).await;
        assert_eq!(outcome.status, ExecutionStatus::Success);
        assert_eq!(outcome.result.len(), 1);
        assert_eq!(outcome.result[0].status, SeriesStatus::Success);
    }

    #[tokio::test]
    async fn empty_fetch_yields_no_data() {
        let fetcher = StaticFetcher { series: Vec::new() };
        let cfg = EngineConfig::default();
        let mtv = MetricTemplateValue {
            min_value: None,
            max_value: None,
            normal_range_start: None,
            normal_range_end: None,
            min_ts_length: 1440,
        };
        let outcome = calculate_threshold(&fetcher, &cfg, "ds-1", &mtv, cfg.default_window_size, Direction::Up, 0.5).await;
        assert_eq!(outcome.status, ExecutionStatus::NoData);
    }
}
