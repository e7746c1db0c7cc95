//! Priority scheduler (C5, §4.5): in-memory priority heap, a concurrency
//! gate, and a completion hook that persists the terminal status with
//! retried writes.
//!
//! Grounded on `threshold_recommender.py`'s `ThresholdRecommender`
//! (`task_queue`/`running_tasks`/`queue_lock`, `_process_queue`,
//! `_task_completion_callback`) and on `agent/src/scheduler.rs`'s
//! `Arc<RwLock<..>>`-plus-channel idiom, recast per spec §9's "global
//! mutable scheduler singleton" redesign note as an explicit `Scheduler`
//! value rather than a module-level instance.

use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::EngineConfig;
use crate::model::{MetricThresholdResult, Priority, TaskRequest, TaskStatus};
use crate::recommender::{calculate_threshold, ExecutionStatus};
use crate::retry::with_retry_unconditional;
use crate::traits::{Fetcher, Store};

/// A task's running work, keyed by `task_id` (§4.5: "a mapping `running:
/// task_id -> running-work-handle`"). `handle` is `None` for the brief
/// window between reserving the slot and `tokio::spawn` returning; a
/// `cancel()` racing that window just drops the not-yet-stored handle
/// instead of aborting it, since the run is about to register itself.
struct RunningEntry {
    handle: Option<JoinHandle<()>>,
    task_version: u32,
}

struct State {
    queue: BinaryHeap<TaskRequest>,
    running: HashMap<String, RunningEntry>,
}

struct Inner {
    state: Mutex<State>,
    fetcher: Arc<dyn Fetcher>,
    store: Arc<dyn Store>,
    cfg: EngineConfig,
}

/// Cheaply cloneable handle; every clone shares the same queue/running set.
#[derive(Clone)]
pub struct Scheduler(Arc<Inner>);

#[derive(Debug, Clone, serde::Serialize)]
pub struct SchedulerStatus {
    pub queue_size: usize,
    pub running: usize,
    pub max_concurrent: usize,
    pub priority_distribution: HashMap<String, usize>,
    pub running_task_ids: Vec<String>,
}

impl Scheduler {
    pub fn new(fetcher: Arc<dyn Fetcher>, store: Arc<dyn Store>, cfg: EngineConfig) -> Self {
        Scheduler(Arc::new(Inner {
            state: Mutex::new(State {
                queue: BinaryHeap::new(),
                running: HashMap::new(),
            }),
            fetcher,
            store,
            cfg,
        }))
    }

    /// Push onto the heap, then try to admit (§4.5 `submit`).
    pub async fn submit(&self, request: TaskRequest) {
        info!(task_id = %request.task_id, priority = request.priority.name(), "task submitted");
        {
            let mut state = self.0.state.lock().await;
            state.queue.push(request);
        }
        self.admit().await;
    }

    /// While `|running| < max_concurrent` and the queue is non-empty, pop
    /// the highest-priority request and spawn a C4 run with its
    /// completion hook (§4.5 `admit`).
    async fn admit(&self) {
        loop {
            let request = {
                let mut state = self.0.state.lock().await;
                if state.running.len() >= self.0.cfg.max_concurrent {
                    break;
                }
                match state.queue.pop() {
                    Some(request) => {
                        // Reserve the slot before spawning so the
                        // concurrency cap is accurate the instant the
                        // request leaves the queue.
                        state.running.insert(request.task_id.clone(), RunningEntry { handle: None, task_version: request.task_version });
                        request
                    }
                    None => break,
                }
            };

            info!(task_id = %request.task_id, priority = request.priority.name(), "task admitted");
            let task_id = request.task_id.clone();
            let scheduler = self.clone();
            let handle = tokio::spawn(async move {
                scheduler.run_and_complete(request).await;
            });

            let mut state = self.0.state.lock().await;
            if let Some(entry) = state.running.get_mut(&task_id) {
                entry.handle = Some(handle);
            }
            // Else: the run already finished and removed its own entry
            // before we could store the handle; nothing to track.
        }
    }

    async fn run_and_complete(&self, request: TaskRequest) {
        let outcome = calculate_threshold(
            self.0.fetcher.as_ref(),
            &self.0.cfg,
            &request.datasource_id,
            &request.metric_template_value,
            request.window_size,
            request.direction,
            request.sensitivity,
        )
        .await;

        let (status, result, message) = match outcome.status {
            ExecutionStatus::Success => (TaskStatus::Success, Some(outcome.result), None),
            ExecutionStatus::NoData => (TaskStatus::Failed, Some(outcome.result), Some(outcome.message)),
            ExecutionStatus::Failed => (TaskStatus::Failed, None, Some(outcome.message)),
        };

        self.persist_terminal(&request.task_id, request.task_version, status, result, message).await;
        self.complete(&request.task_id).await;
    }

    /// Write the terminal status with retried writes (§4.5/§4.8). Shared by
    /// the normal completion path and `cancel()`.
    async fn persist_terminal(&self, task_id: &str, task_version: u32, status: TaskStatus, result: Option<Vec<MetricThresholdResult>>, message: Option<String>) {
        let store = self.0.store.clone();
        let owned_task_id = task_id.to_string();
        let cfg = &self.0.cfg;

        let persisted = with_retry_unconditional(cfg.persist_retry_attempts, cfg.persist_retry_base_delay_secs, cfg.persist_retry_max_delay_secs, move || {
            let store = store.clone();
            let task_id = owned_task_id.clone();
            let result = result.clone();
            let message = message.clone();
            async move { store.update_task_result(&task_id, status, task_version, result, message).await }
        })
        .await;

        if let Err(err) = persisted {
            error!(task_id, error = %err, "failed to persist task result after retries");
        }
    }

    async fn complete(&self, task_id: &str) {
        {
            let mut state = self.0.state.lock().await;
            state.running.remove(task_id);
        }
        self.admit().await;
    }

    /// Cancel a running C4 run (§4.5/§5): abort its handle, run the
    /// completion hook in its place since the aborted future never reaches
    /// its own persistence step, then re-admit. Returns `false` if
    /// `task_id` was not running (already completed, or never submitted).
    pub async fn cancel(&self, task_id: &str) -> bool {
        let entry = {
            let mut state = self.0.state.lock().await;
            state.running.remove(task_id)
        };

        let Some(entry) = entry else {
            return false;
        };

        if let Some(handle) = entry.handle {
            handle.abort();
        }

        warn!(task_id, "task cancelled");
        self.persist_terminal(task_id, entry.task_version, TaskStatus::Failed, None, Some(format!("Task {task_id} was cancelled"))).await;
        self.admit().await;
        true
    }

    /// §4.5 `status()`.
    pub async fn status(&self) -> SchedulerStatus {
        let state = self.0.state.lock().await;
        let mut priority_distribution: HashMap<String, usize> = HashMap::new();
        for request in state.queue.iter() {
            *priority_distribution.entry(request.priority.name().to_string()).or_insert(0) += 1;
        }
        SchedulerStatus {
            queue_size: state.queue.len(),
            running: state.running.len(),
            max_concurrent: self.0.cfg.max_concurrent,
            priority_distribution,
            running_task_ids: state.running.keys().cloned().collect(),
        }
    }

    #[cfg(test)]
    async fn enqueue_only(&self, request: TaskRequest) {
        let mut state = self.0.state.lock().await;
        state.queue.push(request);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tokio::sync::Notify;

    use crate::error::Result as EngineResult;
    use crate::model::{Direction, MetricTemplateValue, MetricThresholdResult};
    use crate::traits::TimeSeries;

    struct RecordingFetcher {
        order: Arc<Mutex<Vec<String>>>,
        expected: usize,
        done: Arc<Notify>,
    }

    #[async_trait]
    impl Fetcher for RecordingFetcher {
        async fn fetch_data(&self, datasource_id: &str, _start_unix: i64, _end_unix: i64, _interval_seconds: i64) -> EngineResult<Vec<TimeSeries>> {
            let mut order = self.order.lock().await;
            order.push(datasource_id.to_string());
            if order.len() == self.expected {
                self.done.notify_one();
            }
            Ok(Vec::new())
        }
    }

    struct NoopStore;

    #[async_trait]
    impl Store for NoopStore {
        async fn update_task_result(&self, _task_id: &str, _status: TaskStatus, _task_version: u32, _result: Option<Vec<MetricThresholdResult>>, _error_message: Option<String>) -> EngineResult<()> {
            Ok(())
        }
        async fn get_task(&self, _task_id: &str) -> EngineResult<Option<crate::model::Task>> {
            Ok(None)
        }
        async fn list_auto_update_tasks(&self) -> EngineResult<Vec<crate::model::Task>> {
            Ok(Vec::new())
        }
        async fn get_latest_task_version(&self, _task_id: &str) -> EngineResult<Option<crate::model::TaskVersion>> {
            Ok(None)
        }
        async fn insert_task_version(&self, _version: &crate::model::TaskVersion) -> EngineResult<String> {
            Ok("v1".to_string())
        }
        async fn get_task_version(&self, _task_id: &str, _version: u32) -> EngineResult<Option<crate::model::TaskVersion>> {
            Ok(None)
        }
        async fn insert_auto_refresh_record(&self, _record: &crate::model::AutoRefreshRecord) -> EngineResult<String> {
            Ok("r1".to_string())
        }
        async fn update_auto_refresh_record(&self, _record: &crate::model::AutoRefreshRecord) -> EngineResult<()> {
            Ok(())
        }
        async fn get_latest_processing_record(&self) -> EngineResult<Option<crate::model::AutoRefreshRecord>> {
            Ok(None)
        }
        async fn delete_auto_refresh_record(&self, _record_id: &str) -> EngineResult<()> {
            Ok(())
        }
        async fn insert_auto_refresh_detail(&self, _detail: &crate::model::AutoRefreshDetail) -> EngineResult<String> {
            Ok("d1".to_string())
        }
        async fn update_auto_refresh_detail(&self, _detail: &crate::model::AutoRefreshDetail) -> EngineResult<()> {
            Ok(())
        }
        async fn list_auto_refresh_details(&self, _record_id: &str) -> EngineResult<Vec<crate::model::AutoRefreshDetail>> {
            Ok(Vec::new())
        }
        async fn delete_auto_refresh_details(&self, _record_id: &str) -> EngineResult<()> {
            Ok(())
        }
        async fn get_latest_alarm_sync_record(&self, _task_id: &str) -> EngineResult<Option<crate::model::AlarmSyncRecord>> {
            Ok(None)
        }
    }

    fn request(task_id: &str, priority: Priority, created_at: f64) -> TaskRequest {
        TaskRequest {
            task_id: task_id.to_string(),
            task_version: 1,
            datasource_id: task_id.to_string(),
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

    #[tokio::test]
    async fn scenario_4_admission_order_is_priority_major_fifo_minor() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let done = Arc::new(Notify::new());
        let fetcher = Arc::new(RecordingFetcher { order: order.clone(), expected: 4, done: done.clone() });
        let store = Arc::new(NoopStore);
        let mut cfg = EngineConfig::default();
        cfg.max_concurrent = 1;

        let scheduler = Scheduler::new(fetcher, store, cfg);

        // Populate the queue before any admission happens, matching the
        // spec's literal scenario framing (batch submission, not
        // online-arrival interleaving).
        scheduler.enqueue_only(request("low0", Priority::Low, 0.0)).await;
        scheduler.enqueue_only(request("high1", Priority::High, 1.0)).await;
        scheduler.enqueue_only(request("normal2", Priority::Normal, 2.0)).await;
        scheduler.enqueue_only(request("high3", Priority::High, 3.0)).await;

        scheduler.admit().await;
        done.notified().await;

        let recorded = order.lock().await.clone();
        assert_eq!(recorded, vec!["high1", "high3", "normal2", "low0"]);
    }

    #[tokio::test]
    async fn concurrency_cap_is_respected() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let done = Arc::new(Notify::new());
        let peak = Arc::new(AtomicUsize::new(0));

        struct GatedFetcher {
            order: Arc<Mutex<Vec<String>>>,
            expected: usize,
            done: Arc<Notify>,
            inflight: Arc<AtomicUsize>,
            peak: Arc<AtomicUsize>,
        }

        #[async_trait]
        impl Fetcher for GatedFetcher {
            async fn fetch_data(&self, datasource_id: &str, _start_unix: i64, _end_unix: i64, _interval_seconds: i64) -> EngineResult<Vec<TimeSeries>> {
                let current = self.inflight.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(current, Ordering::SeqCst);
                tokio::task::yield_now().await;
                self.inflight.fetch_sub(1, Ordering::SeqCst);
                let mut order = self.order.lock().await;
                order.push(datasource_id.to_string());
                if order.len() == self.expected {
                    self.done.notify_one();
                }
                Ok(Vec::new())
            }
        }

        let fetcher = Arc::new(GatedFetcher {
            order: order.clone(),
            expected: 6,
            done: done.clone(),
            inflight: Arc::new(AtomicUsize::new(0)),
            peak: peak.clone(),
        });
        let store = Arc::new(NoopStore);
        let mut cfg = EngineConfig::default();
        cfg.max_concurrent = 2;

        let scheduler = Scheduler::new(fetcher, store, cfg);
        for i in 0..6 {
            scheduler.submit(request(&format!("t{i}"), Priority::Normal, i as f64)).await;
        }
        done.notified().await;

        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    /// Never resolves; used to hold a C4 run open long enough to cancel it.
    struct BlockingFetcher {
        started: Arc<Notify>,
    }

    #[async_trait]
    impl Fetcher for BlockingFetcher {
        async fn fetch_data(&self, _datasource_id: &str, _start_unix: i64, _end_unix: i64, _interval_seconds: i64) -> EngineResult<Vec<TimeSeries>> {
            self.started.notify_one();
            std::future::pending::<()>().await;
            unreachable!("cancelled before this future could resolve")
        }
    }

    #[derive(Default)]
    struct RecordingStore {
        calls: Mutex<Vec<(String, TaskStatus, u32, Option<String>)>>,
    }

    #[async_trait]
    impl Store for RecordingStore {
        async fn update_task_result(&self, task_id: &str, status: TaskStatus, task_version: u32, _result: Option<Vec<MetricThresholdResult>>, error_message: Option<String>) -> EngineResult<()> {
            self.calls.lock().await.push((task_id.to_string(), status, task_version, error_message));
            Ok(())
        }
        async fn get_task(&self, _task_id: &str) -> EngineResult<Option<crate::model::Task>> {
            Ok(None)
        }
        async fn list_auto_update_tasks(&self) -> EngineResult<Vec<crate::model::Task>> {
            Ok(Vec::new())
        }
        async fn get_latest_task_version(&self, _task_id: &str) -> EngineResult<Option<crate::model::TaskVersion>> {
            Ok(None)
        }
        async fn insert_task_version(&self, _version: &crate::model::TaskVersion) -> EngineResult<String> {
            Ok("v1".to_string())
        }
        async fn get_task_version(&self, _task_id: &str, _version: u32) -> EngineResult<Option<crate::model::TaskVersion>> {
            Ok(None)
        }
        async fn insert_auto_refresh_record(&self, _record: &crate::model::AutoRefreshRecord) -> EngineResult<String> {
            Ok("r1".to_string())
        }
        async fn update_auto_refresh_record(&self, _record: &crate::model::AutoRefreshRecord) -> EngineResult<()> {
            Ok(())
        }
        async fn get_latest_processing_record(&self) -> EngineResult<Option<crate::model::AutoRefreshRecord>> {
            Ok(None)
        }
        async fn delete_auto_refresh_record(&self, _record_id: &str) -> EngineResult<()> {
            Ok(())
        }
        async fn insert_auto_refresh_detail(&self, _detail: &crate::model::AutoRefreshDetail) -> EngineResult<String> {
            Ok("d1".to_string())
        }
        async fn update_auto_refresh_detail(&self, _detail: &crate::model::AutoRefreshDetail) -> EngineResult<()> {
            Ok(())
        }
        async fn list_auto_refresh_details(&self, _record_id: &str) -> EngineResult<Vec<crate::model::AutoRefreshDetail>> {
            Ok(Vec::new())
        }
        async fn delete_auto_refresh_details(&self, _record_id: &str) -> EngineResult<()> {
            Ok(())
        }
        async fn get_latest_alarm_sync_record(&self, _task_id: &str) -> EngineResult<Option<crate::model::AlarmSyncRecord>> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn cancelling_a_running_task_persists_cancelled_failure() {
        let started = Arc::new(Notify::new());
        let fetcher = Arc::new(BlockingFetcher { started: started.clone() });
        let store = Arc::new(RecordingStore::default());
        let mut cfg = EngineConfig::default();
        cfg.max_concurrent = 1;

        let scheduler = Scheduler::new(fetcher, store.clone(), cfg);
        scheduler.submit(request("t1", Priority::Normal, 0.0)).await;
        started.notified().await;

        let status_before = scheduler.status().await;
        assert_eq!(status_before.running, 1);

        let cancelled = scheduler.cancel("t1").await;
        assert!(cancelled);

        let calls = store.calls.lock().await;
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "t1");
        assert_eq!(calls[0].1, TaskStatus::Failed);
        assert_eq!(calls[0].3.as_deref(), Some("Task t1 was cancelled"));
        drop(calls);

        let status_after = scheduler.status().await;
        assert_eq!(status_after.running, 0);
    }

    #[tokio::test]
    async fn cancelling_an_unknown_task_is_a_no_op() {
        let fetcher = Arc::new(BlockingFetcher { started: Arc::new(Notify::new()) });
        let store = Arc::new(RecordingStore::default());
        let scheduler = Scheduler::new(fetcher, store.clone(), EngineConfig::default());

        assert!(!scheduler.cancel("ghost").await);
        assert!(store.calls.lock().await.is_empty());
    }
}
