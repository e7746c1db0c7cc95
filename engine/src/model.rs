//! Core data entities (§3): `Task`, `TaskVersion`, `MetricThresholdResult`,
//! `IntelligentThresholdConfig`, the auto-refresh batch rows, `TaskRequest`,
//! and `AlarmSyncRecord`.
//!
//! Grounded on `veaiops/schema/models/intelligent_threshold/task.py` and
//! `veaiops/schema/documents/intelligent_threshold/task_version.py`, adapted
//! to the crate's serde-struct convention (see `shared/src/metrics.rs` in the
//! monitoring system this crate descends from).

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Scheduler admission priority. Higher variants are admitted first;
/// `#[repr]` ordinal drives both `Ord` and the on-wire `priority_name`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    Low,
    Normal,
    High,
    Urgent,
}

impl Priority {
    pub fn name(&self) -> &'static str {
        match self {
            Priority::Low => "LOW",
            Priority::Normal => "NORMAL",
            Priority::High => "HIGH",
            Priority::Urgent => "URGENT",
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

/// `direction` dial shared by `Task`, `TaskVersion`, and the algorithm entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
    Both,
}

/// Terminal status of one `TaskVersion` execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Running,
    Success,
    Failed,
}

/// Per-series processing status inside a `TaskVersion::result`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SeriesStatus {
    Success,
    Failed,
}

/// One time-of-day threshold block (§3 `IntelligentThresholdConfig`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntelligentThresholdConfig {
    pub start_hour: f64,
    pub end_hour: f64,
    pub upper_bound: Option<f64>,
    pub lower_bound: Option<f64>,
    pub window_size: usize,
}

/// Per-series threshold output (§3 `MetricThresholdResult`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricThresholdResult {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub unique_key: String,
    pub thresholds: Vec<IntelligentThresholdConfig>,
    pub status: SeriesStatus,
    pub error_message: String,
}

/// `unique_key = name | k1=v1,k2=v2,...` with labels in lexicographic key
/// order — `BTreeMap` keeps this order for free.
///
/// Grounded on `veaiops/metrics/base.py::generate_unique_key`.
pub fn generate_unique_key(name: &str, labels: &BTreeMap<String, String>) -> String {
    let labels_str = labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",");
    format!("{name}|{labels_str}")
}

/// Task configuration for a recurring threshold recommendation (§3 `Task`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub name: String,
    pub datasource_id: String,
    pub datasource_type: String,
    pub auto_update: bool,
    pub projects: Vec<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub created_user: String,
    pub updated_user: String,
}

/// One execution attempt of a `Task` with a frozen parameter snapshot
/// (§3 `TaskVersion`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskVersion {
    pub id: String,
    pub task_id: String,
    pub version: u32,
    pub metric_template_value: MetricTemplateValue,
    pub n_count: usize,
    pub direction: Direction,
    pub sensitivity: f64,
    pub status: TaskStatus,
    pub error_message: Option<String>,
    pub result: Option<Vec<MetricThresholdResult>>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Frozen bounds/normal-range parameters carried by a `TaskVersion`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MetricTemplateValue {
    pub min_value: Option<f64>,
    pub max_value: Option<f64>,
    pub normal_range_start: Option<f64>,
    pub normal_range_end: Option<f64>,
    pub min_ts_length: usize,
}

/// Scheduler in-memory entry (§3 `TaskRequest`).
///
/// `Ord` is implemented to make `BinaryHeap<TaskRequest>` a max-heap on
/// priority with earliest `created_at` breaking ties — the scheduler pops
/// the greatest element first, so "earlier wins" must compare as *greater*.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    pub task_id: String,
    pub task_version: u32,
    pub datasource_id: String,
    pub metric_template_value: MetricTemplateValue,
    pub window_size: usize,
    pub direction: Direction,
    pub priority: Priority,
    pub sensitivity: f64,
    pub created_at: f64,
}

impl PartialEq for TaskRequest {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.created_at == other.created_at
    }
}
impl Eq for TaskRequest {}

impl PartialOrd for TaskRequest {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TaskRequest {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.created_at.partial_cmp(&self.created_at).unwrap_or(Ordering::Equal))
    }
}

/// One batch run of the auto-refresh controller (§3 `AutoRefreshRecord`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AutoRefreshStatus {
    Pending,
    Processing,
    Completed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoRefreshRecord {
    pub id: String,
    pub status: AutoRefreshStatus,
    pub task_all: Vec<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Per-task calculation lifecycle inside an `AutoRefreshDetail`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CalcStatus {
    Pending,
    Processing,
    Success,
    Failed,
}

/// Per-task alarm-injection lifecycle inside an `AutoRefreshDetail`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InjectStatus {
    Initialized,
    Pending,
    Success,
    Failed,
}

/// Per-task row inside an auto-refresh batch (§3 `AutoRefreshDetail`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoRefreshDetail {
    pub id: String,
    pub record_id: String,
    pub task_id: String,
    pub version: u32,
    pub status: AutoRefreshStatus,
    pub calc_status: CalcStatus,
    pub inject_status: InjectStatus,
}

/// Last known desired rule-sync parameterization, owned by a `Task`
/// (§3 `AlarmSyncRecord`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlarmSyncRecord {
    pub id: String,
    pub task_id: String,
    pub contact_group_ids: Vec<String>,
    pub alert_methods: Vec<String>,
    pub alarm_level: AlarmLevel,
    pub webhook: Option<String>,
    pub created_at: i64,
}

/// Alarm severity, mapped to provider-specific severities by `rule_sync`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlarmLevel {
    P0,
    P1,
    P2,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BinaryHeap;

    #[test]
    fn unique_key_is_order_independent() {
        let mut a = BTreeMap::new();
        a.insert("b".to_string(), "2".to_string());
        a.insert("a".to_string(), "1".to_string());

        let mut b = BTreeMap::new();
        b.insert("a".to_string(), "1".to_string());
        b.insert("b".to_string(), "2".to_string());

        assert_eq!(generate_unique_key("cpu", &a), generate_unique_key("cpu", &b));
        assert_eq!(generate_unique_key("cpu", &a), "cpu|a=1,b=2");
    }

    fn request(priority: Priority, created_at: f64) -> TaskRequest {
        TaskRequest {
            task_id: "t".to_string(),
            task_version: 1,
            datasource_id: "ds".to_string(),
            metric_template_value: MetricTemplateValue {
                min_value: None,
                max_value: None,
                normal_range_start: None,
                normal_range_end: None,
                min_ts_length: 1440,
            },
            window_size: 3,
            direction: Direction::Up,
            priority,
            sensitivity: 0.5,
            created_at,
        }
    }

    #[test]
    fn priority_admission_order() {
        // Scenario 4: LOW@0, HIGH@1, NORMAL@2, HIGH@3 -> HIGH@1, HIGH@3, NORMAL@2, LOW@0
        let mut heap = BinaryHeap::new();
        heap.push(request(Priority::Low, 0.0));
        heap.push(request(Priority::High, 1.0));
        heap.push(request(Priority::Normal, 2.0));
        heap.push(request(Priority::High, 3.0));

        let order: Vec<(Priority, f64)> = std::iter::from_fn(|| heap.pop().map(|r| (r.priority, r.created_at))).collect();

        assert_eq!(
            order,
            vec![
                (Priority::High, 1.0),
                (Priority::High, 3.0),
                (Priority::Normal, 2.0),
                (Priority::Low, 0.0),
            ]
        );
    }
}
