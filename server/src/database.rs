//! SQLite-backed persistence for the intelligent threshold engine.
//!
//! Implements `engine::traits::Store` over the five documents named in §3:
//! `Task`, `TaskVersion`, `AutoRefreshRecord`, `AutoRefreshDetail`, and
//! `AlarmSyncRecord`. Grounded on the monitoring system's `ServerDatabase`
//! (lazy connection, WAL pragmas, `busy_timeout`, transaction-wrapped
//! writes, `tempfile::TempDir`-backed tests) re-targeted at this schema
//! instead of aggregated-metrics tables.
//!
//! Rust-side ids are the decimal string of an `INTEGER PRIMARY KEY
//! AUTOINCREMENT`; complex fields (`projects`, `metric_template_value`,
//! `result`, `task_all`, `contact_group_ids`, `alert_methods`) are stored as
//! JSON text via `serde_json`, and enum fields as plain TEXT via small
//! to/from string helpers rather than JSON-quoted scalars.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result};
use async_trait::async_trait;
use engine::model::{
    AlarmLevel, AlarmSyncRecord, AutoRefreshDetail, AutoRefreshRecord, AutoRefreshStatus, CalcStatus, Direction, InjectStatus, MetricTemplateValue, MetricThresholdResult, Task, TaskStatus,
    TaskVersion,
};
use engine::traits::Store;
use engine::{EngineError, Result as EngineResult};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info, warn};

const DATABASE_FILE: &str = "ite.db";

fn db_err(context: &str, err: impl std::fmt::Display) -> EngineError {
    EngineError::Internal(format!("{context}: {err}"))
}

fn parse_id(id: &str, what: &str) -> EngineResult<i64> {
    id.parse::<i64>().map_err(|e| EngineError::InvalidInput(format!("invalid {what} id '{id}': {e}")))
}

fn task_status_str(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Running => "running",
        TaskStatus::Success => "success",
        TaskStatus::Failed => "failed",
    }
}

fn task_status_from_str(s: &str) -> EngineResult<TaskStatus> {
    match s {
        "running" => Ok(TaskStatus::Running),
        "success" => Ok(TaskStatus::Success),
        "failed" => Ok(TaskStatus::Failed),
        other => Err(EngineError::Internal(format!("unknown task status '{other}'"))),
    }
}

fn direction_str(direction: Direction) -> &'static str {
    match direction {
        Direction::Up => "up",
        Direction::Down => "down",
        Direction::Both => "both",
    }
}

fn direction_from_str(s: &str) -> EngineResult<Direction> {
    match s {
        "up" => Ok(Direction::Up),
        "down" => Ok(Direction::Down),
        "both" => Ok(Direction::Both),
        other => Err(EngineError::Internal(format!("unknown direction '{other}'"))),
    }
}

fn auto_refresh_status_str(status: AutoRefreshStatus) -> &'static str {
    match status {
        AutoRefreshStatus::Pending => "pending",
        AutoRefreshStatus::Processing => "processing",
        AutoRefreshStatus::Completed => "completed",
    }
}

fn auto_refresh_status_from_str(s: &str) -> EngineResult<AutoRefreshStatus> {
    match s {
        "pending" => Ok(AutoRefreshStatus::Pending),
        "processing" => Ok(AutoRefreshStatus::Processing),
        "completed" => Ok(AutoRefreshStatus::Completed),
        other => Err(EngineError::Internal(format!("unknown auto-refresh status '{other}'"))),
    }
}

fn calc_status_str(status: CalcStatus) -> &'static str {
    match status {
        CalcStatus::Pending => "pending",
        CalcStatus::Processing => "processing",
        CalcStatus::Success => "success",
        CalcStatus::Failed => "failed",
    }
}

fn calc_status_from_str(s: &str) -> EngineResult<CalcStatus> {
    match s {
        "pending" => Ok(CalcStatus::Pending),
        "processing" => Ok(CalcStatus::Processing),
        "success" => Ok(CalcStatus::Success),
        "failed" => Ok(CalcStatus::Failed),
        other => Err(EngineError::Internal(format!("unknown calc status '{other}'"))),
    }
}

fn inject_status_str(status: InjectStatus) -> &'static str {
    match status {
        InjectStatus::Initialized => "initialized",
        InjectStatus::Pending => "pending",
        InjectStatus::Success => "success",
        InjectStatus::Failed => "failed",
    }
}

fn inject_status_from_str(s: &str) -> EngineResult<InjectStatus> {
    match s {
        "initialized" => Ok(InjectStatus::Initialized),
        "pending" => Ok(InjectStatus::Pending),
        "success" => Ok(InjectStatus::Success),
        "failed" => Ok(InjectStatus::Failed),
        other => Err(EngineError::Internal(format!("unknown inject status '{other}'"))),
    }
}

fn alarm_level_str(level: AlarmLevel) -> &'static str {
    match level {
        AlarmLevel::P0 => "P0",
        AlarmLevel::P1 => "P1",
        AlarmLevel::P2 => "P2",
    }
}

fn alarm_level_from_str(s: &str) -> EngineResult<AlarmLevel> {
    match s {
        "P0" => Ok(AlarmLevel::P0),
        "P1" => Ok(AlarmLevel::P1),
        "P2" => Ok(AlarmLevel::P2),
        other => Err(EngineError::Internal(format!("unknown alarm level '{other}'"))),
    }
}

/// Manages the SQLite database backing the threshold engine's persisted
/// state. Encapsulates the connection and all related operations behind a
/// clean, high-level API; concrete `Store` implementation for `engine`.
///
/// The cached connection lives behind a `std::sync::Mutex` rather than a
/// plain field so that `Database` itself is `Sync` — required to hand an
/// `Arc<Database>` to `engine::Scheduler` as `Arc<dyn Store>`. `rusqlite`
/// calls are synchronous and short, so blocking the mutex briefly is fine.
pub struct Database {
    db_path: PathBuf,
    connection: Mutex<Option<Connection>>,
}

impl Database {
    /// Creates a new `Database` manager, ensuring the data directory exists.
    pub fn new<P: AsRef<Path>>(data_dir: P) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        if !data_dir.exists() {
            std::fs::create_dir_all(data_dir).with_context(|| format!("Failed to create data directory: {}", data_dir.display()))?;
        }

        let db_path = data_dir.join(DATABASE_FILE);

        Ok(Self { db_path, connection: Mutex::new(None) })
    }

    /// Initializes the database by creating tables and indexes if they
    /// don't exist. Idempotent and safe to call on every server startup.
    pub async fn initialize(&self) -> Result<()> {
        info!("Initializing threshold engine database at {}", self.db_path.display());

        let guard = self.get_connection()?;
        let conn = guard.as_ref().expect("connection set above");

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT UNIQUE NOT NULL,
                datasource_id TEXT UNIQUE NOT NULL,
                datasource_type TEXT NOT NULL,
                auto_update INTEGER NOT NULL,
                projects TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                created_user TEXT NOT NULL,
                updated_user TEXT NOT NULL
            )
            "#,
            [],
        )
        .context("Failed to create tasks table")?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS task_versions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id INTEGER NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
                version INTEGER NOT NULL,
                metric_template_value TEXT NOT NULL,
                n_count INTEGER NOT NULL,
                direction TEXT NOT NULL,
                sensitivity REAL NOT NULL,
                status TEXT NOT NULL,
                error_message TEXT,
                result TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                UNIQUE(task_id, version)
            )
            "#,
            [],
        )
        .context("Failed to create task_versions table")?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS auto_refresh_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                status TEXT NOT NULL,
                task_all TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
            [],
        )
        .context("Failed to create auto_refresh_records table")?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS auto_refresh_details (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                record_id INTEGER NOT NULL REFERENCES auto_refresh_records(id) ON DELETE CASCADE,
                task_id INTEGER NOT NULL,
                version INTEGER NOT NULL,
                status TEXT NOT NULL,
                calc_status TEXT NOT NULL,
                inject_status TEXT NOT NULL
            )
            "#,
            [],
        )
        .context("Failed to create auto_refresh_details table")?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS alarm_sync_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id INTEGER NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
                contact_group_ids TEXT NOT NULL,
                alert_methods TEXT NOT NULL,
                alarm_level TEXT NOT NULL,
                webhook TEXT,
                created_at INTEGER NOT NULL
            )
            "#,
            [],
        )
        .context("Failed to create alarm_sync_records table")?;

        conn.execute("CREATE INDEX IF NOT EXISTS idx_task_versions_task_id ON task_versions(task_id)", [])?;
        conn.execute("CREATE INDEX IF NOT EXISTS idx_auto_refresh_details_record_id ON auto_refresh_details(record_id)", [])?;
        conn.execute("CREATE INDEX IF NOT EXISTS idx_auto_refresh_records_status ON auto_refresh_records(status)", [])?;
        conn.execute("CREATE INDEX IF NOT EXISTS idx_alarm_sync_records_task_id ON alarm_sync_records(task_id)", [])?;

        info!("Threshold engine database initialization complete");
        Ok(())
    }

    /// Lazily opens the cached database connection, creating it if needed,
    /// and returns the lock guard holding it.
    fn get_connection(&self) -> Result<MutexGuard<'_, Option<Connection>>> {
        let mut guard = self.connection.lock().expect("connection mutex poisoned");
        if guard.is_none() {
            let conn = Connection::open(&self.db_path).with_context(|| format!("Failed to open database: {}", self.db_path.display()))?;

            conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(())).context("Failed to enable WAL mode")?;
            conn.query_row("PRAGMA wal_autocheckpoint=1000", [], |_| Ok(())).context("Failed to set WAL auto-checkpoint")?;
            conn.execute("PRAGMA foreign_keys=ON", []).context("Failed to enable foreign key constraints")?;
            conn.busy_timeout(std::time::Duration::from_secs(30)).context("Failed to set busy timeout")?;

            *guard = Some(conn);
        }

        Ok(guard)
    }

    /// Performs a WAL checkpoint, returning the number of frames
    /// checkpointed. Mirrors the monitoring system's periodic WAL
    /// checkpoint task.
    pub async fn checkpoint_wal(&self) -> Result<i64> {
        debug!("Performing WAL checkpoint on threshold engine database");

        let guard = self.get_connection()?;
        let conn = guard.as_ref().expect("connection set above");
        let (busy, log_frames, checkpointed): (i64, i64, i64) = conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?;

        if busy != 0 {
            warn!("WAL checkpoint was blocked (busy). Frames remaining in log: {}", log_frames);
        } else {
            debug!("WAL checkpoint complete: {} frames checkpointed, {} frames remaining", checkpointed, log_frames);
        }

        Ok(checkpointed)
    }

    /// Closes the database connection.
    pub async fn close(&self) {
        let mut guard = self.connection.lock().expect("connection mutex poisoned");
        if let Some(conn) = guard.take() {
            if let Err(e) = conn.close() {
                warn!("Error closing database connection: {:?}", e);
            } else {
                debug!("Database connection closed");
            }
        }
    }

    /// Creates a new `Task` row, returning the assigned id. Not part of
    /// `Store` (§6's HTTP surface has no task-CRUD endpoint); used to seed
    /// tasks ahead of agent submissions and auto-refresh batches.
    pub fn create_task(&self, name: &str, datasource_id: &str, datasource_type: &str, auto_update: bool, projects: &[String], created_user: &str) -> Result<String> {
        let now = current_timestamp();
        let projects_json = serde_json::to_string(projects).context("serializing projects")?;
        let guard = self.get_connection()?;
        let conn = guard.as_ref().expect("connection set above");
        conn.execute(
            r#"
            INSERT INTO tasks (name, datasource_id, datasource_type, auto_update, projects, created_at, updated_at, created_user, updated_user)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, ?7, ?7)
            "#,
            params![name, datasource_id, datasource_type, auto_update as i64, projects_json, now, created_user],
        )
        .context("Failed to insert task")?;
        Ok(conn.last_insert_rowid().to_string())
    }

    /// Deletes a `Task` and cascades to its `TaskVersion` and
    /// `AlarmSyncRecord` rows (§3 uniqueness/cascade note).
    pub fn delete_task(&self, task_id: &str) -> Result<()> {
        let id = task_id.parse::<i64>().with_context(|| format!("invalid task id '{task_id}'"))?;
        let guard = self.get_connection()?;
        let conn = guard.as_ref().expect("connection set above");
        conn.execute("DELETE FROM tasks WHERE id = ?1", params![id]).context("Failed to delete task")?;
        Ok(())
    }

    /// Inserts an `AlarmSyncRecord`, returning the assigned id. Not part of
    /// `Store`; used when a task's desired rule-sync parameterization is
    /// first configured or changed.
    pub fn insert_alarm_sync_record(&self, record: &AlarmSyncRecord) -> Result<String> {
        let task_id = record.task_id.parse::<i64>().with_context(|| format!("invalid task id '{}'", record.task_id))?;
        let contact_groups_json = serde_json::to_string(&record.contact_group_ids).context("serializing contact_group_ids")?;
        let alert_methods_json = serde_json::to_string(&record.alert_methods).context("serializing alert_methods")?;
        let guard = self.get_connection()?;
        let conn = guard.as_ref().expect("connection set above");
        conn.execute(
            r#"
            INSERT INTO alarm_sync_records (task_id, contact_group_ids, alert_methods, alarm_level, webhook, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![task_id, contact_groups_json, alert_methods_json, alarm_level_str(record.alarm_level), record.webhook, record.created_at],
        )
        .context("Failed to insert alarm sync record")?;
        Ok(conn.last_insert_rowid().to_string())
    }
}

fn row_to_task(row: &rusqlite::Row) -> rusqlite::Result<Task> {
    let id: i64 = row.get(0)?;
    let projects_json: String = row.get(5)?;
    let projects: Vec<String> = serde_json::from_str(&projects_json).unwrap_or_default();
    Ok(Task {
        id: id.to_string(),
        name: row.get(1)?,
        datasource_id: row.get(2)?,
        datasource_type: row.get(3)?,
        auto_update: row.get::<_, i64>(4)? != 0,
        projects,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
        created_user: row.get(8)?,
        updated_user: row.get(9)?,
    })
}

const TASK_COLUMNS: &str = "id, name, datasource_id, datasource_type, auto_update, projects, created_at, updated_at, created_user, updated_user";

fn row_to_task_version(row: &rusqlite::Row) -> rusqlite::Result<(TaskVersion, i64)> {
    let id: i64 = row.get(0)?;
    let task_id: i64 = row.get(1)?;
    let metric_template_value_json: String = row.get(3)?;
    let metric_template_value: MetricTemplateValue = serde_json::from_str(&metric_template_value_json).unwrap_or(MetricTemplateValue {
        min_value: None,
        max_value: None,
        normal_range_start: None,
        normal_range_end: None,
        min_ts_length: 0,
    });
    let direction_text: String = row.get(5)?;
    let status_text: String = row.get(7)?;
    let result_json: Option<String> = row.get(9)?;
    let result: Option<Vec<MetricThresholdResult>> = result_json.and_then(|s| serde_json::from_str(&s).ok());

    Ok((
        TaskVersion {
            id: id.to_string(),
            task_id: task_id.to_string(),
            version: row.get::<_, i64>(2)? as u32,
            metric_template_value,
            n_count: row.get::<_, i64>(4)? as usize,
            direction: direction_from_str(&direction_text).unwrap_or(Direction::Up),
            sensitivity: row.get(6)?,
            status: task_status_from_str(&status_text).unwrap_or(TaskStatus::Failed),
            error_message: row.get(8)?,
            result,
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
        },
        task_id,
    ))
}

const TASK_VERSION_COLUMNS: &str = "id, task_id, version, metric_template_value, n_count, direction, sensitivity, status, error_message, result, created_at, updated_at";

fn row_to_auto_refresh_record(row: &rusqlite::Row) -> rusqlite::Result<AutoRefreshRecord> {
    let id: i64 = row.get(0)?;
    let status_text: String = row.get(1)?;
    let task_all_json: String = row.get(2)?;
    let task_all: Vec<String> = serde_json::from_str(&task_all_json).unwrap_or_default();
    Ok(AutoRefreshRecord {
        id: id.to_string(),
        status: auto_refresh_status_from_str(&status_text).unwrap_or(AutoRefreshStatus::Pending),
        task_all,
        created_at: row.get(3)?,
        updated_at: row.get(4)?,
    })
}

fn row_to_auto_refresh_detail(row: &rusqlite::Row) -> rusqlite::Result<AutoRefreshDetail> {
    let id: i64 = row.get(0)?;
    let record_id: i64 = row.get(1)?;
    let task_id: i64 = row.get(2)?;
    let status_text: String = row.get(4)?;
    let calc_status_text: String = row.get(5)?;
    let inject_status_text: String = row.get(6)?;
    Ok(AutoRefreshDetail {
        id: id.to_string(),
        record_id: record_id.to_string(),
        task_id: task_id.to_string(),
        version: row.get::<_, i64>(3)? as u32,
        status: auto_refresh_status_from_str(&status_text).unwrap_or(AutoRefreshStatus::Pending),
        calc_status: calc_status_from_str(&calc_status_text).unwrap_or(CalcStatus::Pending),
        inject_status: inject_status_from_str(&inject_status_text).unwrap_or(InjectStatus::Initialized),
    })
}

fn row_to_alarm_sync_record(row: &rusqlite::Row) -> rusqlite::Result<AlarmSyncRecord> {
    let id: i64 = row.get(0)?;
    let task_id: i64 = row.get(1)?;
    let contact_groups_json: String = row.get(2)?;
    let alert_methods_json: String = row.get(3)?;
    let alarm_level_text: String = row.get(4)?;
    Ok(AlarmSyncRecord {
        id: id.to_string(),
        task_id: task_id.to_string(),
        contact_group_ids: serde_json::from_str(&contact_groups_json).unwrap_or_default(),
        alert_methods: serde_json::from_str(&alert_methods_json).unwrap_or_default(),
        alarm_level: alarm_level_from_str(&alarm_level_text).unwrap_or(AlarmLevel::P2),
        webhook: row.get(5)?,
        created_at: row.get(6)?,
    })
}

#[async_trait]
impl Store for Database {
    async fn update_task_result(&self, task_id: &str, status: TaskStatus, task_version: u32, result: Option<Vec<MetricThresholdResult>>, error_message: Option<String>) -> EngineResult<()> {
        let id = parse_id(task_id, "task")?;
        let result_json = result.map(|r| serde_json::to_string(&r)).transpose().map_err(|e| db_err("serializing result", e))?;
        let now = current_timestamp();

        let conn = self.open_ephemeral().map_err(|e| db_err("opening connection", e))?;
        let updated = conn
            .execute(
                "UPDATE task_versions SET status = ?1, error_message = ?2, result = ?3, updated_at = ?4 WHERE task_id = ?5 AND version = ?6",
                params![task_status_str(status), error_message, result_json, now, id, task_version],
            )
            .map_err(|e| db_err("updating task_versions", e))?;

        if updated == 0 {
            warn!(task_id, task_version, "update_task_result found no matching task_version row");
        }

        Ok(())
    }

    async fn get_task(&self, task_id: &str) -> EngineResult<Option<Task>> {
        let id = parse_id(task_id, "task")?;
        let conn = self.open_ephemeral().map_err(|e| db_err("opening connection", e))?;
        conn.query_row(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"), params![id], row_to_task)
            .optional()
            .map_err(|e| db_err("querying task", e))
    }

    async fn list_auto_update_tasks(&self) -> EngineResult<Vec<Task>> {
        let conn = self.open_ephemeral().map_err(|e| db_err("opening connection", e))?;
        let mut stmt = conn.prepare(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE auto_update = 1")).map_err(|e| db_err("preparing query", e))?;
        let rows = stmt.query_map([], row_to_task).map_err(|e| db_err("querying auto-update tasks", e))?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(|e| db_err("reading auto-update tasks", e))
    }

    async fn get_latest_task_version(&self, task_id: &str) -> EngineResult<Option<TaskVersion>> {
        let id = parse_id(task_id, "task")?;
        let conn = self.open_ephemeral().map_err(|e| db_err("opening connection", e))?;
        conn.query_row(
            &format!("SELECT {TASK_VERSION_COLUMNS} FROM task_versions WHERE task_id = ?1 ORDER BY version DESC LIMIT 1"),
            params![id],
            |row| row_to_task_version(row).map(|(v, _)| v),
        )
        .optional()
        .map_err(|e| db_err("querying latest task version", e))
    }

    async fn insert_task_version(&self, version: &TaskVersion) -> EngineResult<String> {
        let task_id = parse_id(&version.task_id, "task")?;
        let metric_template_value_json = serde_json::to_string(&version.metric_template_value).map_err(|e| db_err("serializing metric_template_value", e))?;
        let result_json = version.result.as_ref().map(|r| serde_json::to_string(r)).transpose().map_err(|e| db_err("serializing result", e))?;
        let now = current_timestamp();

        let conn = self.open_ephemeral().map_err(|e| db_err("opening connection", e))?;
        conn.execute(
            r#"
            INSERT INTO task_versions (task_id, version, metric_template_value, n_count, direction, sensitivity, status, error_message, result, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)
            "#,
            params![
                task_id,
                version.version,
                metric_template_value_json,
                version.n_count,
                direction_str(version.direction),
                version.sensitivity,
                task_status_str(version.status),
                version.error_message,
                result_json,
                now,
            ],
        )
        .map_err(|e| db_err("inserting task_version", e))?;

        Ok(conn.last_insert_rowid().to_string())
    }

    async fn get_task_version(&self, task_id: &str, version: u32) -> EngineResult<Option<TaskVersion>> {
        let id = parse_id(task_id, "task")?;
        let conn = self.open_ephemeral().map_err(|e| db_err("opening connection", e))?;
        conn.query_row(&format!("SELECT {TASK_VERSION_COLUMNS} FROM task_versions WHERE task_id = ?1 AND version = ?2"), params![id, version], |row| {
            row_to_task_version(row).map(|(v, _)| v)
        })
        .optional()
        .map_err(|e| db_err("querying task version", e))
    }

    async fn insert_auto_refresh_record(&self, record: &AutoRefreshRecord) -> EngineResult<String> {
        let task_all_json = serde_json::to_string(&record.task_all).map_err(|e| db_err("serializing task_all", e))?;
        let conn = self.open_ephemeral().map_err(|e| db_err("opening connection", e))?;
        conn.execute(
            "INSERT INTO auto_refresh_records (status, task_all, created_at, updated_at) VALUES (?1, ?2, ?3, ?3)",
            params![auto_refresh_status_str(record.status), task_all_json, record.created_at],
        )
        .map_err(|e| db_err("inserting auto_refresh_record", e))?;
        Ok(conn.last_insert_rowid().to_string())
    }

    async fn update_auto_refresh_record(&self, record: &AutoRefreshRecord) -> EngineResult<()> {
        let id = parse_id(&record.id, "auto_refresh_record")?;
        let task_all_json = serde_json::to_string(&record.task_all).map_err(|e| db_err("serializing task_all", e))?;
        let now = current_timestamp();
        let conn = self.open_ephemeral().map_err(|e| db_err("opening connection", e))?;
        conn.execute(
            "UPDATE auto_refresh_records SET status = ?1, task_all = ?2, updated_at = ?3 WHERE id = ?4",
            params![auto_refresh_status_str(record.status), task_all_json, now, id],
        )
        .map_err(|e| db_err("updating auto_refresh_record", e))?;
        Ok(())
    }

    async fn get_latest_processing_record(&self) -> EngineResult<Option<AutoRefreshRecord>> {
        let conn = self.open_ephemeral().map_err(|e| db_err("opening connection", e))?;
        conn.query_row(
            "SELECT id, status, task_all, created_at, updated_at FROM auto_refresh_records WHERE status = 'processing' ORDER BY created_at DESC LIMIT 1",
            [],
            row_to_auto_refresh_record,
        )
        .optional()
        .map_err(|e| db_err("querying latest processing record", e))
    }

    async fn delete_auto_refresh_record(&self, record_id: &str) -> EngineResult<()> {
        let id = parse_id(record_id, "auto_refresh_record")?;
        let conn = self.open_ephemeral().map_err(|e| db_err("opening connection", e))?;
        conn.execute("DELETE FROM auto_refresh_records WHERE id = ?1", params![id]).map_err(|e| db_err("deleting auto_refresh_record", e))?;
        Ok(())
    }

    async fn insert_auto_refresh_detail(&self, detail: &AutoRefreshDetail) -> EngineResult<String> {
        let record_id = parse_id(&detail.record_id, "auto_refresh_record")?;
        let task_id = parse_id(&detail.task_id, "task")?;
        let conn = self.open_ephemeral().map_err(|e| db_err("opening connection", e))?;
        conn.execute(
            r#"
            INSERT INTO auto_refresh_details (record_id, task_id, version, status, calc_status, inject_status)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                record_id,
                task_id,
                detail.version,
                auto_refresh_status_str(detail.status),
                calc_status_str(detail.calc_status),
                inject_status_str(detail.inject_status),
            ],
        )
        .map_err(|e| db_err("inserting auto_refresh_detail", e))?;
        Ok(conn.last_insert_rowid().to_string())
    }

    async fn update_auto_refresh_detail(&self, detail: &AutoRefreshDetail) -> EngineResult<()> {
        let id = parse_id(&detail.id, "auto_refresh_detail")?;
        let conn = self.open_ephemeral().map_err(|e| db_err("opening connection", e))?;
        conn.execute(
            "UPDATE auto_refresh_details SET version = ?1, status = ?2, calc_status = ?3, inject_status = ?4 WHERE id = ?5",
            params![detail.version, auto_refresh_status_str(detail.status), calc_status_str(detail.calc_status), inject_status_str(detail.inject_status), id],
        )
        .map_err(|e| db_err("updating auto_refresh_detail", e))?;
        Ok(())
    }

    async fn list_auto_refresh_details(&self, record_id: &str) -> EngineResult<Vec<AutoRefreshDetail>> {
        let id = parse_id(record_id, "auto_refresh_record")?;
        let conn = self.open_ephemeral().map_err(|e| db_err("opening connection", e))?;
        let mut stmt = conn
            .prepare("SELECT id, record_id, task_id, version, status, calc_status, inject_status FROM auto_refresh_details WHERE record_id = ?1")
            .map_err(|e| db_err("preparing query", e))?;
        let rows = stmt.query_map(params![id], row_to_auto_refresh_detail).map_err(|e| db_err("querying auto_refresh_details", e))?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(|e| db_err("reading auto_refresh_details", e))
    }

    async fn delete_auto_refresh_details(&self, record_id: &str) -> EngineResult<()> {
        let id = parse_id(record_id, "auto_refresh_record")?;
        let conn = self.open_ephemeral().map_err(|e| db_err("opening connection", e))?;
        conn.execute("DELETE FROM auto_refresh_details WHERE record_id = ?1", params![id]).map_err(|e| db_err("deleting auto_refresh_details", e))?;
        Ok(())
    }

    async fn get_latest_alarm_sync_record(&self, task_id: &str) -> EngineResult<Option<AlarmSyncRecord>> {
        let id = parse_id(task_id, "task")?;
        let conn = self.open_ephemeral().map_err(|e| db_err("opening connection", e))?;
        conn.query_row(
            "SELECT id, task_id, contact_group_ids, alert_methods, alarm_level, webhook, created_at FROM alarm_sync_records WHERE task_id = ?1 ORDER BY created_at DESC LIMIT 1",
            params![id],
            row_to_alarm_sync_record,
        )
        .optional()
        .map_err(|e| db_err("querying latest alarm sync record", e))
    }
}

impl Database {
    /// Opens a short-lived connection to the same file for `&self` trait
    /// methods, with the same pragmas `get_connection` applies.
    fn open_ephemeral(&self) -> Result<Connection> {
        let conn = Connection::open(&self.db_path).with_context(|| format!("Failed to open database: {}", self.db_path.display()))?;
        conn.execute("PRAGMA foreign_keys=ON", [])?;
        conn.busy_timeout(std::time::Duration::from_secs(30))?;
        Ok(conn)
    }
}

fn current_timestamp() -> i64 {
    std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default().as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn test_db() -> (TempDir, Database) {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::new(temp_dir.path()).unwrap();
        db.initialize().await.unwrap();
        (temp_dir, db)
    }

    #[tokio::test]
    async fn create_and_fetch_task() {
        let (_dir, db) = test_db().await;
        let id = db.create_task("cpu-high", "ds-1", "zabbix", true, &["proj-a".to_string()], "alice").unwrap();

        let task = db.get_task(&id).await.unwrap().expect("task exists");
        assert_eq!(task.name, "cpu-high");
        assert_eq!(task.datasource_id, "ds-1");
        assert!(task.auto_update);
        assert_eq!(task.projects, vec!["proj-a".to_string()]);
    }

    #[tokio::test]
    async fn list_auto_update_tasks_filters() {
        let (_dir, db) = test_db().await;
        db.create_task("auto-task", "ds-1", "zabbix", true, &[], "alice").unwrap();
        db.create_task("manual-task", "ds-2", "zabbix", false, &[], "alice").unwrap();

        let tasks = db.list_auto_update_tasks().await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].name, "auto-task");
    }

    #[tokio::test]
    async fn insert_and_update_task_result_is_idempotent() {
        let (_dir, db) = test_db().await;
        let task_id = db.create_task("t", "ds", "zabbix", true, &[], "alice").unwrap();

        let version = TaskVersion {
            id: String::new(),
            task_id: task_id.clone(),
            version: 1,
            metric_template_value: MetricTemplateValue {
                min_value: None,
                max_value: None,
                normal_range_start: None,
                normal_range_end: None,
                min_ts_length: 1440,
            },
            n_count: 0,
            direction: Direction::Up,
            sensitivity: 0.5,
            status: TaskStatus::Running,
            error_message: None,
            result: None,
            created_at: 0,
            updated_at: 0,
        };
        db.insert_task_version(&version).await.unwrap();

        db.update_task_result(&task_id, TaskStatus::Success, 1, None, None).await.unwrap();
        db.update_task_result(&task_id, TaskStatus::Success, 1, None, None).await.unwrap();

        let fetched = db.get_task_version(&task_id, 1).await.unwrap().expect("version exists");
        assert_eq!(fetched.status, TaskStatus::Success);
    }

    #[tokio::test]
    async fn auto_refresh_record_round_trip() {
        let (_dir, db) = test_db().await;
        let record = AutoRefreshRecord {
            id: String::new(),
            status: AutoRefreshStatus::Pending,
            task_all: vec!["1".to_string(), "2".to_string()],
            created_at: 100,
            updated_at: 100,
        };
        let id = db.insert_auto_refresh_record(&record).await.unwrap();

        let mut fetched_record = record.clone();
        fetched_record.id = id;
        fetched_record.status = AutoRefreshStatus::Processing;
        db.update_auto_refresh_record(&fetched_record).await.unwrap();

        let latest = db.get_latest_processing_record().await.unwrap().expect("record exists");
        assert_eq!(latest.status, AutoRefreshStatus::Processing);
        assert_eq!(latest.task_all, vec!["1".to_string(), "2".to_string()]);
    }

    #[tokio::test]
    async fn deleting_task_cascades_to_versions() {
        let (_dir, db) = test_db().await;
        let task_id = db.create_task("t", "ds", "zabbix", true, &[], "alice").unwrap();
        let version = TaskVersion {
            id: String::new(),
            task_id: task_id.clone(),
            version: 1,
            metric_template_value: MetricTemplateValue {
                min_value: None,
                max_value: None,
                normal_range_start: None,
                normal_range_end: None,
                min_ts_length: 1440,
            },
            n_count: 0,
            direction: Direction::Up,
            sensitivity: 0.5,
            status: TaskStatus::Running,
            error_message: None,
            result: None,
            created_at: 0,
            updated_at: 0,
        };
        db.insert_task_version(&version).await.unwrap();

        db.delete_task(&task_id).unwrap();

        assert!(db.get_task(&task_id).await.unwrap().is_none());
        assert!(db.get_task_version(&task_id, 1).await.unwrap().is_none());
    }
}
