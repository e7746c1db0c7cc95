//! Abstract interfaces at the engine's I/O seams (§6, §9).
//!
//! Spec §9 calls out two source patterns to re-architect: dynamic dispatch
//! across monitoring-provider backends, and dynamic field-access on
//! heterogeneous time-series rows. Both are recast here as traits — the
//! engine fetches through `Fetcher`, persists through `Store`, and talks to
//! alarm providers through `RuleProvider`, and never branches on a concrete
//! backend's identity. Concrete implementations (SQLite, a specific
//! monitoring provider's HTTP client) live in `server`.

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{AlarmLevel, AlarmSyncRecord, AutoRefreshDetail, AutoRefreshRecord, MetricThresholdResult, Task, TaskStatus, TaskVersion};

/// The engine's single data-plane shape (§9): every fetcher normalizes into
/// this and nothing else.
#[derive(Debug, Clone)]
pub struct TimeSeries {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub unique_key: String,
    pub timestamps: Vec<i64>,
    pub values: Vec<f64>,
}

/// Historical data source (§6 "Data source fetch"). Idempotent,
/// side-effect-free; an empty result means "no data available".
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch_data(&self, datasource_id: &str, start_unix: i64, end_unix: i64, interval_seconds: i64) -> Result<Vec<TimeSeries>>;
}

/// One per-block threshold expression inside a `RuleSpec` (§4.7 step 4).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RuleBlockExpr {
    pub start_hour: f64,
    pub end_hour: f64,
    pub threshold: f64,
    pub operator: RuleOperator,
    pub aggregation_function: AggregationFunction,
    pub aggregation_period_minutes: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleOperator {
    GreaterThan,
    LessThan,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregationFunction {
    Min,
    Max,
}

/// A desired or live alarm rule, keyed by `unique_key` (§4.7 step 2).
#[derive(Debug, Clone)]
pub struct RuleSpec {
    pub unique_key: String,
    pub name: String,
    pub blocks: Vec<RuleBlockExpr>,
    pub tags: BTreeMap<String, String>,
    pub severity: RuleSeverity,
    pub contact_group_ids: Vec<String>,
    pub alert_methods: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleSeverity {
    Critical,
    Warning,
    Info,
}

impl From<AlarmLevel> for RuleSeverity {
    fn from(level: AlarmLevel) -> Self {
        match level {
            AlarmLevel::P0 => RuleSeverity::Critical,
            AlarmLevel::P1 => RuleSeverity::Warning,
            AlarmLevel::P2 => RuleSeverity::Info,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LiveRule {
    pub unique_key: String,
    pub name: String,
    pub spec: RuleSpec,
}

#[derive(Debug, Clone)]
pub struct ContactGroup {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct MediaType {
    pub id: String,
    pub name: String,
}

/// Monitoring provider (§6 "Monitoring provider", §9 `RuleSynchronizer`
/// redesign note). One implementation per backend (Zabbix, Aliyun,
/// Volcengine, ...); `engine::rule_sync` is written once against this trait
/// and never branches on which provider it holds.
#[async_trait]
pub trait RuleProvider: Send + Sync {
    async fn list_rules(&self, name_prefix: &str) -> Result<Vec<LiveRule>>;
    async fn create_rule(&self, spec: &RuleSpec) -> Result<()>;
    async fn update_rule(&self, spec: &RuleSpec, existing: &LiveRule) -> Result<()>;
    async fn delete_rules(&self, keys: &[String]) -> Result<()>;
    async fn list_contact_groups(&self) -> Result<Vec<ContactGroup>>;
    async fn list_media_types(&self) -> Result<Vec<MediaType>>;
}

/// Persisted-state interface (§3, §4.8). Every write is idempotent; callers
/// (scheduler completion hook, C6) are responsible for retrying through
/// `crate::retry::with_retry`.
#[async_trait]
pub trait Store: Send + Sync {
    async fn update_task_result(&self, task_id: &str, status: TaskStatus, task_version: u32, result: Option<Vec<MetricThresholdResult>>, error_message: Option<String>) -> Result<()>;

    async fn get_task(&self, task_id: &str) -> Result<Option<Task>>;
    async fn list_auto_update_tasks(&self) -> Result<Vec<Task>>;
    async fn get_latest_task_version(&self, task_id: &str) -> Result<Option<TaskVersion>>;
    /// Inserts a version, ignoring `version.id`, and returns the assigned id.
    async fn insert_task_version(&self, version: &TaskVersion) -> Result<String>;
    async fn get_task_version(&self, task_id: &str, version: u32) -> Result<Option<TaskVersion>>;

    /// Inserts a record, ignoring `record.id`, and returns the assigned id.
    async fn insert_auto_refresh_record(&self, record: &AutoRefreshRecord) -> Result<String>;
    async fn update_auto_refresh_record(&self, record: &AutoRefreshRecord) -> Result<()>;
    async fn get_latest_processing_record(&self) -> Result<Option<AutoRefreshRecord>>;
    async fn delete_auto_refresh_record(&self, record_id: &str) -> Result<()>;

    /// Inserts a detail, ignoring `detail.id`, and returns the assigned id.
    async fn insert_auto_refresh_detail(&self, detail: &AutoRefreshDetail) -> Result<String>;
    async fn update_auto_refresh_detail(&self, detail: &AutoRefreshDetail) -> Result<()>;
    async fn list_auto_refresh_details(&self, record_id: &str) -> Result<Vec<AutoRefreshDetail>>;
    async fn delete_auto_refresh_details(&self, record_id: &str) -> Result<()>;

    async fn get_latest_alarm_sync_record(&self, task_id: &str) -> Result<Option<AlarmSyncRecord>>;
}
