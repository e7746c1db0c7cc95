//! Auto-refresh controller (C6, §4.6): the batch initialize/process state
//! machine that drives recurring threshold recalculation for every
//! `auto_update=true` task.
//!
//! Grounded on `auto_refresh_task.py`'s `initialize_auto_refresh_task` /
//! `_rollback_auto_refresh_task_creation` / `process_record_detail_tasks` /
//! `process_detail_task_status` / `process_detail_alarm_inject_status` /
//! `check_and_update_overall_record_status`; the periodic-driver shape
//! (sleep between iterations, bounded iteration count) follows
//! `server/src/health_monitor.rs`'s interval loop.

use tracing::{error, info, warn};

use crate::config::EngineConfig;
use crate::error::Result;
use crate::model::{
    AutoRefreshDetail, AutoRefreshRecord, AutoRefreshStatus, CalcStatus, InjectStatus, Priority, TaskRequest, TaskStatus, TaskVersion,
};
use crate::rule_sync::{self, RateLimiter, SyncParams};
use crate::scheduler::Scheduler;
use crate::traits::RuleProvider;
use crate::utils::current_timestamp;

/// Atomically create a Record plus one Detail per `auto_update=true` task
/// (§4.6 `initialize`). On any insertion failure, every Detail already
/// inserted plus the Record itself are deleted — never leave a
/// half-initialized batch on disk.
pub async fn initialize(store: &dyn crate::traits::Store) -> Result<AutoRefreshRecord> {
    let tasks = store.list_auto_update_tasks().await?;
    let now = current_timestamp() as i64;

    if tasks.is_empty() {
        info!("no auto_update tasks found, recording an empty completed batch");
        let mut record = AutoRefreshRecord { id: String::new(), status: AutoRefreshStatus::Completed, task_all: Vec::new(), created_at: now, updated_at: now };
        record.id = store.insert_auto_refresh_record(&record).await?;
        return Ok(record);
    }

    let task_ids: Vec<String> = tasks.iter().map(|t| t.id.clone()).collect();
    let mut record = AutoRefreshRecord { id: String::new(), status: AutoRefreshStatus::Pending, task_all: task_ids, created_at: now, updated_at: now };
    record.id = store.insert_auto_refresh_record(&record).await?;

    for task in &tasks {
        let detail = AutoRefreshDetail {
            id: String::new(),
            record_id: record.id.clone(),
            task_id: task.id.clone(),
            version: 0,
            status: AutoRefreshStatus::Pending,
            calc_status: CalcStatus::Pending,
            inject_status: InjectStatus::Initialized,
        };
        if let Err(err) = store.insert_auto_refresh_detail(&detail).await {
            error!(record_id = %record.id, error = %err, "failed to insert auto-refresh detail, rolling back batch");
            rollback(store, &record.id).await;
            return Err(err);
        }
    }

    record.status = AutoRefreshStatus::Processing;
    record.updated_at = current_timestamp() as i64;
    if let Err(err) = store.update_auto_refresh_record(&record).await {
        error!(record_id = %record.id, error = %err, "failed to flip auto-refresh record to processing, rolling back batch");
        rollback(store, &record.id).await;
        return Err(err);
    }

    Ok(record)
}

async fn rollback(store: &dyn crate::traits::Store, record_id: &str) {
    if let Err(err) = store.delete_auto_refresh_details(record_id).await {
        warn!(record_id, error = %err, "rollback: failed to delete auto-refresh details");
    }
    if let Err(err) = store.delete_auto_refresh_record(record_id).await {
        warn!(record_id, error = %err, "rollback: failed to delete auto-refresh record");
    }
}

/// Process the most-recent Processing Record to completion or exhaustion of
/// `auto_refresh_max_iterations` (§4.6 `process`). Returns immediately if no
/// Record is eligible.
pub async fn process(store: &dyn crate::traits::Store, scheduler: &Scheduler, provider: &dyn RuleProvider, rate_limiter: &RateLimiter, cfg: &EngineConfig) -> Result<()> {
    let mut record = match store.get_latest_processing_record().await? {
        Some(record) => record,
        None => return Ok(()),
    };

    for iteration in 1..=cfg.auto_refresh_max_iterations {
        info!(record_id = %record.id, iteration, "auto-refresh iteration starting");

        process_detail_calc_status(store, scheduler, &record, cfg).await?;
        process_detail_inject_status(store, provider, rate_limiter, cfg, &record).await?;

        let completed = check_and_update_overall_status(store, &mut record).await?;
        if completed {
            info!(record_id = %record.id, iteration, "auto-refresh batch completed");
            return Ok(());
        }

        tokio::time::sleep(std::time::Duration::from_secs(cfg.auto_refresh_gap_time_minutes * 60)).await;
    }

    warn!(record_id = %record.id, "auto-refresh reached max iterations without completing");
    Ok(())
}

/// Phase A (§4.6): advance each Detail's calculation lifecycle one step.
async fn process_detail_calc_status(store: &dyn crate::traits::Store, scheduler: &Scheduler, record: &AutoRefreshRecord, cfg: &EngineConfig) -> Result<()> {
    let details: Vec<AutoRefreshDetail> = store
        .list_auto_refresh_details(&record.id)
        .await?
        .into_iter()
        .filter(|d| d.status != AutoRefreshStatus::Completed)
        .collect();

    for mut detail in details {
        match detail.calc_status {
            CalcStatus::Pending => {
                let task = match store.get_task(&detail.task_id).await? {
                    Some(task) => task,
                    None => {
                        error!(task_id = %detail.task_id, "task not found, completing detail");
                        detail.status = AutoRefreshStatus::Completed;
                        store.update_auto_refresh_detail(&detail).await?;
                        continue;
                    }
                };
                let latest_version = match store.get_latest_task_version(&task.id).await? {
                    Some(version) => version,
                    None => {
                        error!(task_id = %task.id, "no prior version found, completing detail");
                        detail.status = AutoRefreshStatus::Completed;
                        store.update_auto_refresh_detail(&detail).await?;
                        continue;
                    }
                };

                let new_version_number = latest_version.version + 1;
                let now = current_timestamp() as i64;
                let new_version = TaskVersion {
                    id: String::new(),
                    task_id: task.id.clone(),
                    version: new_version_number,
                    metric_template_value: latest_version.metric_template_value,
                    n_count: latest_version.n_count,
                    direction: latest_version.direction,
                    sensitivity: latest_version.sensitivity,
                    status: TaskStatus::Running,
                    error_message: None,
                    result: None,
                    created_at: now,
                    updated_at: now,
                };
                store.insert_task_version(&new_version).await?;

                detail.version = new_version_number;
                detail.status = AutoRefreshStatus::Processing;
                detail.calc_status = CalcStatus::Processing;
                store.update_auto_refresh_detail(&detail).await?;

                scheduler
                    .submit(TaskRequest {
                        task_id: task.id.clone(),
                        task_version: new_version_number,
                        datasource_id: task.datasource_id.clone(),
                        metric_template_value: latest_version.metric_template_value,
                        window_size: cfg.default_window_size,
                        direction: latest_version.direction,
                        priority: Priority::Low,
                        sensitivity: latest_version.sensitivity,
                        created_at: now as f64,
                    })
                    .await;
                info!(task_id = %task.id, version = new_version_number, "triggered threshold recalculation");
            }
            CalcStatus::Processing => {
                let task_version = match store.get_task_version(&detail.task_id, detail.version).await? {
                    Some(version) => version,
                    None => {
                        error!(task_id = %detail.task_id, version = detail.version, "task version disappeared");
                        detail.status = AutoRefreshStatus::Completed;
                        detail.calc_status = CalcStatus::Failed;
                        store.update_auto_refresh_detail(&detail).await?;
                        continue;
                    }
                };
                let new_calc_status = match task_version.status {
                    TaskStatus::Success => Some(CalcStatus::Success),
                    TaskStatus::Failed => Some(CalcStatus::Failed),
                    TaskStatus::Running => None,
                };
                if let Some(new_calc_status) = new_calc_status {
                    detail.calc_status = new_calc_status;
                    store.update_auto_refresh_detail(&detail).await?;
                }
            }
            CalcStatus::Success => {
                let alarm_sync = store.get_latest_alarm_sync_record(&detail.task_id).await?;
                if alarm_sync.is_none() {
                    detail.status = AutoRefreshStatus::Completed;
                    store.update_auto_refresh_detail(&detail).await?;
                    continue;
                }
                if detail.inject_status == InjectStatus::Initialized {
                    detail.inject_status = InjectStatus::Pending;
                    store.update_auto_refresh_detail(&detail).await?;
                }
            }
            CalcStatus::Failed => {
                detail.status = AutoRefreshStatus::Completed;
                store.update_auto_refresh_detail(&detail).await?;
            }
        }
    }

    Ok(())
}

/// Phase B (§4.6): advance each Detail's alarm-injection lifecycle one step.
async fn process_detail_inject_status(store: &dyn crate::traits::Store, provider: &dyn RuleProvider, rate_limiter: &RateLimiter, cfg: &EngineConfig, record: &AutoRefreshRecord) -> Result<()> {
    let details: Vec<AutoRefreshDetail> = store
        .list_auto_refresh_details(&record.id)
        .await?
        .into_iter()
        .filter(|d| d.status != AutoRefreshStatus::Completed)
        .collect();

    for mut detail in details {
        match detail.inject_status {
            InjectStatus::Initialized => {}
            InjectStatus::Pending => {
                detail.inject_status = inject_once(store, provider, rate_limiter, cfg, &detail).await;
                store.update_auto_refresh_detail(&detail).await?;
            }
            InjectStatus::Success | InjectStatus::Failed => {
                detail.status = AutoRefreshStatus::Completed;
                store.update_auto_refresh_detail(&detail).await?;
            }
        }
    }

    Ok(())
}

async fn inject_once(store: &dyn crate::traits::Store, provider: &dyn RuleProvider, rate_limiter: &RateLimiter, cfg: &EngineConfig, detail: &AutoRefreshDetail) -> InjectStatus {
    let alarm_sync = match store.get_latest_alarm_sync_record(&detail.task_id).await {
        Ok(Some(record)) => record,
        Ok(None) => {
            warn!(task_id = %detail.task_id, "no alarm sync record found when injecting");
            return InjectStatus::Failed;
        }
        Err(err) => {
            error!(task_id = %detail.task_id, error = %err, "failed to load alarm sync record");
            return InjectStatus::Failed;
        }
    };

    let task_version = match store.get_task_version(&detail.task_id, detail.version).await {
        Ok(Some(version)) => version,
        Ok(None) => {
            warn!(task_id = %detail.task_id, version = detail.version, "task version not found when injecting");
            return InjectStatus::Failed;
        }
        Err(err) => {
            error!(task_id = %detail.task_id, error = %err, "failed to load task version");
            return InjectStatus::Failed;
        }
    };

    let results = match task_version.result {
        Some(results) if !results.is_empty() => results,
        _ => {
            warn!(task_id = %detail.task_id, version = detail.version, "no results to inject");
            return InjectStatus::Failed;
        }
    };

    let params = SyncParams {
        datasource_name: &detail.task_id,
        rate_limit_key: &detail.task_id,
        qps: cfg.rule_sync_qps,
        contact_group_ids: &alarm_sync.contact_group_ids,
        alert_methods: &alarm_sync.alert_methods,
        alarm_level: alarm_sync.alarm_level,
    };
    let desired = rule_sync::build_desired_rules(&results, &params, &cfg.engine_id);

    match rule_sync::sync_rules(provider, cfg, rate_limiter, &params, desired).await {
        Ok(outcome) if outcome.failed.is_empty() => InjectStatus::Success,
        Ok(outcome) => {
            warn!(task_id = %detail.task_id, failed = outcome.failed.len(), "rule sync completed with failures");
            InjectStatus::Failed
        }
        Err(err) => {
            error!(task_id = %detail.task_id, error = %err, "rule sync call failed");
            InjectStatus::Failed
        }
    }
}

/// Phase C (§4.6): flip the Record to `Completed` once no Detail is still
/// `Processing`, and report whether the caller should stop looping.
async fn check_and_update_overall_status(store: &dyn crate::traits::Store, record: &mut AutoRefreshRecord) -> Result<bool> {
    let processing_count = store
        .list_auto_refresh_details(&record.id)
        .await?
        .iter()
        .filter(|d| d.status == AutoRefreshStatus::Processing)
        .count();

    let new_status = if processing_count == 0 { AutoRefreshStatus::Completed } else { AutoRefreshStatus::Processing };
    if record.status != new_status {
        record.status = new_status;
        record.updated_at = current_timestamp() as i64;
        store.update_auto_refresh_record(record).await?;
    }

    Ok(new_status == AutoRefreshStatus::Completed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::error::EngineError;
    use crate::model::{Direction, MetricTemplateValue, MetricThresholdResult, SeriesStatus, Task};
    use crate::traits::{ContactGroup, Fetcher, LiveRule, MediaType, RuleSpec, TimeSeries};

    #[derive(Default)]
    struct MemStore {
        tasks: Mutex<Vec<Task>>,
        versions: Mutex<Vec<TaskVersion>>,
        records: Mutex<Vec<AutoRefreshRecord>>,
        details: Mutex<Vec<AutoRefreshDetail>>,
        alarm_syncs: Mutex<Vec<crate::model::AlarmSyncRecord>>,
        next_id: Mutex<u64>,
    }

    impl MemStore {
        fn next(&self) -> String {
            let mut id = self.next_id.lock().unwrap();
            *id += 1;
            id.to_string()
        }
    }

    #[async_trait]
    impl crate::traits::Store for MemStore {
        async fn update_task_result(&self, task_id: &str, status: TaskStatus, task_version: u32, result: Option<Vec<MetricThresholdResult>>, error_message: Option<String>) -> Result<()> {
            let mut versions = self.versions.lock().unwrap();
            if let Some(v) = versions.iter_mut().find(|v| v.task_id == task_id && v.version == task_version) {
                v.status = status;
                v.result = result;
                v.error_message = error_message;
            }
            Ok(())
        }
        async fn get_task(&self, task_id: &str) -> Result<Option<Task>> {
            Ok(self.tasks.lock().unwrap().iter().find(|t| t.id == task_id).cloned())
        }
        async fn list_auto_update_tasks(&self) -> Result<Vec<Task>> {
            Ok(self.tasks.lock().unwrap().iter().filter(|t| t.auto_update).cloned().collect())
        }
        async fn get_latest_task_version(&self, task_id: &str) -> Result<Option<TaskVersion>> {
            Ok(self.versions.lock().unwrap().iter().filter(|v| v.task_id == task_id).max_by_key(|v| v.version).cloned())
        }
        async fn insert_task_version(&self, version: &TaskVersion) -> Result<String> {
            let id = self.next();
            let mut v = version.clone();
            v.id = id.clone();
            self.versions.lock().unwrap().push(v);
            Ok(id)
        }
        async fn get_task_version(&self, task_id: &str, version: u32) -> Result<Option<TaskVersion>> {
            Ok(self.versions.lock().unwrap().iter().find(|v| v.task_id == task_id && v.version == version).cloned())
        }
        async fn insert_auto_refresh_record(&self, record: &AutoRefreshRecord) -> Result<String> {
            let id = self.next();
            let mut r = record.clone();
            r.id = id.clone();
            self.records.lock().unwrap().push(r);
            Ok(id)
        }
        async fn update_auto_refresh_record(&self, record: &AutoRefreshRecord) -> Result<()> {
            let mut records = self.records.lock().unwrap();
            if let Some(r) = records.iter_mut().find(|r| r.id == record.id) {
                *r = record.clone();
            }
            Ok(())
        }
        async fn get_latest_processing_record(&self) -> Result<Option<AutoRefreshRecord>> {
            Ok(self.records.lock().unwrap().iter().filter(|r| r.status == AutoRefreshStatus::Processing).max_by_key(|r| r.created_at).cloned())
        }
        async fn delete_auto_refresh_record(&self, record_id: &str) -> Result<()> {
            self.records.lock().unwrap().retain(|r| r.id != record_id);
            Ok(())
        }
        async fn insert_auto_refresh_detail(&self, detail: &AutoRefreshDetail) -> Result<String> {
            let id = self.next();
            let mut d = detail.clone();
            d.id = id.clone();
            self.details.lock().unwrap().push(d);
            Ok(id)
        }
        async fn update_auto_refresh_detail(&self, detail: &AutoRefreshDetail) -> Result<()> {
            let mut details = self.details.lock().unwrap();
            if let Some(d) = details.iter_mut().find(|d| d.id == detail.id) {
                *d = detail.clone();
            }
            Ok(())
        }
        async fn list_auto_refresh_details(&self, record_id: &str) -> Result<Vec<AutoRefreshDetail>> {
            Ok(self.details.lock().unwrap().iter().filter(|d| d.record_id == record_id).cloned().collect())
        }
        async fn delete_auto_refresh_details(&self, record_id: &str) -> Result<()> {
            self.details.lock().unwrap().retain(|d| d.record_id != record_id);
            Ok(())
        }
        async fn get_latest_alarm_sync_record(&self, task_id: &str) -> Result<Option<crate::model::AlarmSyncRecord>> {
            Ok(self.alarm_syncs.lock().unwrap().iter().filter(|r| r.task_id == task_id).max_by_key(|r| r.created_at).cloned())
        }
    }

    struct FailingInsertStore(MemStore);

    #[async_trait]
    impl crate::traits::Store for FailingInsertStore {
        async fn update_task_result(&self, task_id: &str, status: TaskStatus, task_version: u32, result: Option<Vec<MetricThresholdResult>>, error_message: Option<String>) -> Result<()> {
            self.0.update_task_result(task_id, status, task_version, result, error_message).await
        }
        async fn get_task(&self, task_id: &str) -> Result<Option<Task>> {
            self.0.get_task(task_id).await
        }
        async fn list_auto_update_tasks(&self) -> Result<Vec<Task>> {
            self.0.list_auto_update_tasks().await
        }
        async fn get_latest_task_version(&self, task_id: &str) -> Result<Option<TaskVersion>> {
            self.0.get_latest_task_version(task_id).await
        }
        async fn insert_task_version(&self, version: &TaskVersion) -> Result<String> {
            self.0.insert_task_version(version).await
        }
        async fn get_task_version(&self, task_id: &str, version: u32) -> Result<Option<TaskVersion>> {
            self.0.get_task_version(task_id, version).await
        }
        async fn insert_auto_refresh_record(&self, record: &AutoRefreshRecord) -> Result<String> {
            self.0.insert_auto_refresh_record(record).await
        }
        async fn update_auto_refresh_record(&self, record: &AutoRefreshRecord) -> Result<()> {
            self.0.update_auto_refresh_record(record).await
        }
        async fn get_latest_processing_record(&self) -> Result<Option<AutoRefreshRecord>> {
            self.0.get_latest_processing_record().await
        }
        async fn delete_auto_refresh_record(&self, record_id: &str) -> Result<()> {
            self.0.delete_auto_refresh_record(record_id).await
        }
        async fn insert_auto_refresh_detail(&self, detail: &AutoRefreshDetail) -> Result<String> {
            if self.0.details.lock().unwrap().len() >= 1 {
                return Err(EngineError::Internal("simulated insert failure".to_string()));
            }
            self.0.insert_auto_refresh_detail(detail).await
        }
        async fn update_auto_refresh_detail(&self, detail: &AutoRefreshDetail) -> Result<()> {
            self.0.update_auto_refresh_detail(detail).await
        }
        async fn list_auto_refresh_details(&self, record_id: &str) -> Result<Vec<AutoRefreshDetail>> {
            self.0.list_auto_refresh_details(record_id).await
        }
        async fn delete_auto_refresh_details(&self, record_id: &str) -> Result<()> {
            self.0.delete_auto_refresh_details(record_id).await
        }
        async fn get_latest_alarm_sync_record(&self, task_id: &str) -> Result<Option<crate::model::AlarmSyncRecord>> {
            self.0.get_latest_alarm_sync_record(task_id).await
        }
    }

    fn task(id: &str) -> Task {
        Task {
            id: id.to_string(),
            name: id.to_string(),
            datasource_id: format!("ds-{id}"),
            datasource_type: "generic".to_string(),
            auto_update: true,
            projects: Vec::new(),
            created_at: 0,
            updated_at: 0,
            created_user: "cronjob".to_string(),
            updated_user: "cronjob".to_string(),
        }
    }

    fn template() -> MetricTemplateValue {
        MetricTemplateValue { min_value: None, max_value: None, normal_range_start: None, normal_range_end: None, min_ts_length: 1440 }
    }

    #[tokio::test]
    async fn initialize_with_no_tasks_records_empty_completed_batch() {
        let store = MemStore::default();
        let record = initialize(&store).await.unwrap();
        assert_eq!(record.status, AutoRefreshStatus::Completed);
        assert!(record.task_all.is_empty());
    }

    #[tokio::test]
    async fn initialize_creates_record_and_one_detail_per_task() {
        let store = MemStore::default();
        store.tasks.lock().unwrap().push(task("t1"));
        store.tasks.lock().unwrap().push(task("t2"));
        store.versions.lock().unwrap().push(TaskVersion {
            id: "v0".to_string(),
            task_id: "t1".to_string(),
            version: 1,
            metric_template_value: template(),
            n_count: 7,
            direction: Direction::Up,
            sensitivity: 0.5,
            status: TaskStatus::Success,
            error_message: None,
            result: None,
            created_at: 0,
            updated_at: 0,
        });

        let record = initialize(&store).await.unwrap();
        assert_eq!(record.status, AutoRefreshStatus::Processing);
        assert_eq!(record.task_all.len(), 2);
        let details = store.list_auto_refresh_details(&record.id).await.unwrap();
        assert_eq!(details.len(), 2);
        assert!(details.iter().all(|d| d.calc_status == CalcStatus::Pending));
    }

    #[tokio::test]
    async fn initialize_rolls_back_on_detail_insert_failure() {
        let inner = MemStore::default();
        inner.tasks.lock().unwrap().push(task("t1"));
        inner.tasks.lock().unwrap().push(task("t2"));
        let store = FailingInsertStore(inner);

        let err = initialize(&store).await;
        assert!(err.is_err());
        assert!(store.0.records.lock().unwrap().is_empty());
        assert!(store.0.details.lock().unwrap().is_empty());
    }

    struct NoopProvider;
    #[async_trait]
    impl RuleProvider for NoopProvider {
        async fn list_rules(&self, _name_prefix: &str) -> Result<Vec<LiveRule>> {
            Ok(Vec::new())
        }
        async fn create_rule(&self, _spec: &RuleSpec) -> Result<()> {
            Ok(())
        }
        async fn update_rule(&self, _spec: &RuleSpec, _existing: &LiveRule) -> Result<()> {
            Ok(())
        }
        async fn delete_rules(&self, _keys: &[String]) -> Result<()> {
            Ok(())
        }
        async fn list_contact_groups(&self) -> Result<Vec<ContactGroup>> {
            Ok(Vec::new())
        }
        async fn list_media_types(&self) -> Result<Vec<MediaType>> {
            Ok(Vec::new())
        }
    }

    /// Seven days of hourly-varying data, enough to clear every validation
    /// gate in `recommender::calculate_threshold` and land `Success` with a
    /// non-empty result, per the pattern in `recommender`'s own happy-path
    /// test.
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
        TimeSeries { name: "cpu.usage".to_string(), labels: BTreeMap::new(), unique_key: "cpu.usage|".to_string(), timestamps, values }
    }

    struct RichFetcher;
    #[async_trait]
    impl Fetcher for RichFetcher {
        async fn fetch_data(&self, _datasource_id: &str, _start_unix: i64, _end_unix: i64, _interval_seconds: i64) -> Result<Vec<TimeSeries>> {
            Ok(vec![sinusoid(7, 60)])
        }
    }

    #[tokio::test]
    async fn scenario_6_auto_refresh_happy_path_completes() {
        let store = MemStore::default();
        store.tasks.lock().unwrap().push(task("t1"));
        store.versions.lock().unwrap().push(TaskVersion {
            id: "v0".to_string(),
            task_id: "t1".to_string(),
            version: 1,
            metric_template_value: template(),
            n_count: 7,
            direction: Direction::Up,
            sensitivity: 0.5,
            status: TaskStatus::Success,
            error_message: None,
            result: Some(vec![MetricThresholdResult { name: "cpu".to_string(), labels: BTreeMap::new(), unique_key: "cpu|".to_string(), thresholds: Vec::new(), status: SeriesStatus::Success, error_message: String::new() }]),
            created_at: 0,
            updated_at: 0,
        });
        // A prior AlarmSyncRecord, as spec scenario 6 requires, so Phase A's
        // CalcStatus::Success arm advances inject_status past Initialized.
        store.alarm_syncs.lock().unwrap().push(crate::model::AlarmSyncRecord {
            id: "as1".to_string(),
            task_id: "t1".to_string(),
            contact_group_ids: vec!["cg1".to_string()],
            alert_methods: vec!["email".to_string()],
            alarm_level: crate::model::AlarmLevel::P1,
            webhook: None,
            created_at: 0,
        });

        let record = initialize(&store).await.unwrap();

        let fetcher = std::sync::Arc::new(RichFetcher);
        let store_arc: std::sync::Arc<dyn crate::traits::Store> = std::sync::Arc::new(store);
        let cfg = EngineConfig::default();

        let scheduler = Scheduler::new(fetcher, store_arc.clone(), cfg.clone());
        let provider = NoopProvider;
        let rate_limiter = RateLimiter::new();

        // Drive the phases directly rather than through `process`'s
        // minutes-granular sleep, so the scheduler's spawned completion
        // task has a deterministic chance to land between iterations.
        process_detail_calc_status(store_arc.as_ref(), &scheduler, &record, &cfg).await.unwrap();
        let details = store_arc.list_auto_refresh_details(&record.id).await.unwrap();
        assert_eq!(details[0].calc_status, CalcStatus::Processing);

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        // `RichFetcher` returns a real series, so the scheduled
        // recommendation run succeeds and calc_status mirrors that Success.
        process_detail_calc_status(store_arc.as_ref(), &scheduler, &record, &cfg).await.unwrap();
        let details = store_arc.list_auto_refresh_details(&record.id).await.unwrap();
        assert_eq!(details[0].calc_status, CalcStatus::Success);
        assert_eq!(details[0].status, AutoRefreshStatus::Processing);

        // Success arm: the prior AlarmSyncRecord advances inject_status
        // Initialized -> Pending instead of completing the Detail outright.
        process_detail_calc_status(store_arc.as_ref(), &scheduler, &record, &cfg).await.unwrap();
        let details = store_arc.list_auto_refresh_details(&record.id).await.unwrap();
        assert_eq!(details[0].inject_status, InjectStatus::Pending);
        assert_eq!(details[0].status, AutoRefreshStatus::Processing);

        // Phase B step 1: inject_once succeeds against the NoopProvider.
        process_detail_inject_status(store_arc.as_ref(), &provider, &rate_limiter, &cfg, &record).await.unwrap();
        let details = store_arc.list_auto_refresh_details(&record.id).await.unwrap();
        assert_eq!(details[0].inject_status, InjectStatus::Success);
        assert_eq!(details[0].status, AutoRefreshStatus::Processing);

        // Phase B step 2: a terminal inject_status completes the Detail.
        process_detail_inject_status(store_arc.as_ref(), &provider, &rate_limiter, &cfg, &record).await.unwrap();
        let details = store_arc.list_auto_refresh_details(&record.id).await.unwrap();
        assert_eq!(details[0].status, AutoRefreshStatus::Completed);
        assert_eq!(details[0].calc_status, CalcStatus::Success);
        assert_eq!(details[0].inject_status, InjectStatus::Success);

        let mut record = record;
        let completed = check_and_update_overall_status(store_arc.as_ref(), &mut record).await.unwrap();
        assert!(completed);
        assert_eq!(record.status, AutoRefreshStatus::Completed);
    }
}
