//! HTTP surface (§6 "HTTP surface (JSON)"): the agent submission endpoint,
//! scheduler status, and the auto-refresh batch driver. Authentication,
//! rate limiting, and bandwidth/config distribution are out of scope
//! (§16) — this is the bare four-endpoint contract the spec names.

use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, Query, State},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use engine::model::{Direction, MetricTemplateValue, Priority, TaskRequest};
use engine::scheduler::{Scheduler, SchedulerStatus};
use engine::traits::{RuleProvider, Store};
use engine::utils::current_timestamp;
use engine::{config::EngineConfig, rule_sync::RateLimiter};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::database::Database;

/// Shared handles every handler needs. Construction happens once in `main`.
#[derive(Clone)]
pub struct AppState {
    pub scheduler: Scheduler,
    pub store: Arc<Database>,
    pub rule_provider: Arc<dyn RuleProvider>,
    pub rate_limiter: Arc<RateLimiter>,
    pub engine_config: EngineConfig,
}

pub fn create_router(state: AppState) -> Router {
    const MAX_REQUEST_SIZE: usize = 1024 * 1024;

    Router::new()
        .route("/health", get(health_check))
        .route("/apis/v1/intelligent-threshold/agent/", post(submit_task))
        .route("/apis/v1/intelligent-threshold/agent/status", get(scheduler_status))
        .route("/apis/v1/intelligent-threshold/task/auto-refresh/initialize", post(auto_refresh_initialize))
        .route("/apis/v1/intelligent-threshold/task/auto-refresh/process", post(auto_refresh_process))
        .layer(DefaultBodyLimit::max(MAX_REQUEST_SIZE))
        .with_state(state)
}

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "ite-server",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[derive(Debug, Deserialize)]
struct SubmitTaskRequest {
    task_id: String,
    task_version: u32,
    datasource_id: String,
    metric_template_value: MetricTemplateValue,
    n_count: usize,
    direction: Direction,
    sensitivity: f64,
    #[serde(default)]
    task_priority: Priority,
}

#[derive(Debug, Serialize)]
struct SubmitTaskResponse {
    task_id: String,
    priority_name: String,
}

/// `POST /apis/v1/intelligent-threshold/agent/` (§6, §4.8): enqueues a
/// `TaskRequest` onto the scheduler. Validation happens before admission;
/// submission itself never fails.
async fn submit_task(State(state): State<AppState>, Json(request): Json<SubmitTaskRequest>) -> Result<Json<SubmitTaskResponse>, ApiError> {
    if request.task_id.is_empty() {
        return Err(ApiError::BadRequest("task_id must not be empty".to_string()));
    }
    if request.datasource_id.is_empty() {
        return Err(ApiError::BadRequest("datasource_id must not be empty".to_string()));
    }
    if request.n_count == 0 {
        return Err(ApiError::BadRequest("n_count must be at least 1".to_string()));
    }
    if !(0.0..=1.0).contains(&request.sensitivity) {
        return Err(ApiError::BadRequest("sensitivity must be within [0,1]".to_string()));
    }

    let task_request = TaskRequest {
        task_id: request.task_id.clone(),
        task_version: request.task_version,
        datasource_id: request.datasource_id,
        metric_template_value: request.metric_template_value,
        window_size: request.n_count,
        direction: request.direction,
        priority: request.task_priority,
        sensitivity: request.sensitivity,
        created_at: current_timestamp() as f64,
    };

    let priority_name = task_request.priority.name().to_string();
    info!(task_id = %task_request.task_id, priority = %priority_name, "submitting task request");
    state.scheduler.submit(task_request).await;

    Ok(Json(SubmitTaskResponse { task_id: request.task_id, priority_name }))
}

/// `GET /apis/v1/intelligent-threshold/agent/status` (§4.5 `status()`).
async fn scheduler_status(State(state): State<AppState>) -> Json<SchedulerStatus> {
    Json(state.scheduler.status().await)
}

/// `POST /…/task/auto-refresh/initialize` (§4.6 `initialize`).
async fn auto_refresh_initialize(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let record = engine::auto_refresh::initialize(state.store.as_ref()).await.map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(serde_json::json!({
        "record_id": record.id,
        "status": record.status,
        "task_count": record.task_all.len(),
    })))
}

#[derive(Debug, Deserialize)]
struct AutoRefreshProcessQuery {
    max_iterations: Option<u32>,
    gap_time: Option<u64>,
}

/// `POST /…/task/auto-refresh/process?max_iterations=&gap_time=` (§4.6
/// `process`). Runs in the background; the request returns as soon as the
/// batch is dispatched rather than blocking on the whole (potentially
/// hours-long) iteration loop.
async fn auto_refresh_process(State(state): State<AppState>, Query(query): Query<AutoRefreshProcessQuery>) -> impl IntoResponse {
    let mut cfg = state.engine_config.clone();
    if let Some(max_iterations) = query.max_iterations {
        cfg.auto_refresh_max_iterations = max_iterations;
    }
    if let Some(gap_time) = query.gap_time {
        cfg.auto_refresh_gap_time_minutes = gap_time;
    }

    let store = state.store.clone();
    let scheduler = state.scheduler.clone();
    let provider = state.rule_provider.clone();
    let rate_limiter = state.rate_limiter.clone();

    tokio::spawn(async move {
        if let Err(e) = engine::auto_refresh::process(store.as_ref(), &scheduler, provider.as_ref(), rate_limiter.as_ref(), &cfg).await {
            error!(error = %e, "auto-refresh batch processing failed");
        }
    });

    StatusCode::ACCEPTED
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_message) = match &self {
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "Bad Request"),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error"),
        };

        let body = Json(serde_json::json!({
            "error": error_message,
            "details": self.to_string(),
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submit_task_request_defaults_priority_to_normal() {
        let json = serde_json::json!({
            "task_id": "t1",
            "task_version": 1,
            "datasource_id": "ds1",
            "metric_template_value": {
                "min_value": null,
                "max_value": null,
                "normal_range_start": null,
                "normal_range_end": null,
                "min_ts_length": 1440,
            },
            "n_count": 1,
            "direction": "up",
            "sensitivity": 0.5,
        });
        let request: SubmitTaskRequest = serde_json::from_value(json).unwrap();
        assert_eq!(request.task_priority, Priority::Normal);
    }
}
