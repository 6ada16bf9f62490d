//! Scheduled task endpoints.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};

use crate::scheduler::{ScheduledTask, SchedulerError, TaskSpec};

use super::routes::AppState;
use super::types::RunTaskResponse;

fn scheduler_error(e: SchedulerError) -> (StatusCode, String) {
    let status = match &e {
        SchedulerError::NotFound(_) => StatusCode::NOT_FOUND,
        SchedulerError::InvalidInterval => StatusCode::BAD_REQUEST,
        SchedulerError::Snapshot(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, e.to_string())
}

pub async fn list_tasks(State(state): State<Arc<AppState>>) -> Json<Vec<ScheduledTask>> {
    Json(state.scheduler.list().await)
}

pub async fn create_task(
    State(state): State<Arc<AppState>>,
    Json(spec): Json<TaskSpec>,
) -> Result<(StatusCode, Json<ScheduledTask>), (StatusCode, String)> {
    let task = state.scheduler.create(spec).await.map_err(scheduler_error)?;
    Ok((StatusCode::CREATED, Json(task)))
}

pub async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ScheduledTask>, (StatusCode, String)> {
    state
        .scheduler
        .get(&id)
        .await
        .map(Json)
        .map_err(scheduler_error)
}

pub async fn update_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(spec): Json<TaskSpec>,
) -> Result<Json<ScheduledTask>, (StatusCode, String)> {
    state
        .scheduler
        .update(&id, spec)
        .await
        .map(Json)
        .map_err(scheduler_error)
}

pub async fn delete_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, (StatusCode, String)> {
    state
        .scheduler
        .delete(&id)
        .await
        .map_err(scheduler_error)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn enable_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ScheduledTask>, (StatusCode, String)> {
    state
        .scheduler
        .enable(&id)
        .await
        .map(Json)
        .map_err(scheduler_error)
}

pub async fn disable_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ScheduledTask>, (StatusCode, String)> {
    state
        .scheduler
        .disable(&id)
        .await
        .map(Json)
        .map_err(scheduler_error)
}

pub async fn mark_task_seen(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ScheduledTask>, (StatusCode, String)> {
    state
        .scheduler
        .mark_seen(&id)
        .await
        .map(Json)
        .map_err(scheduler_error)
}

/// Run a task now, subject to the same re-entry guard as its timer.
pub async fn run_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<RunTaskResponse>, (StatusCode, String)> {
    let started = state
        .scheduler
        .run_now(&id)
        .await
        .map_err(scheduler_error)?;
    Ok(Json(RunTaskResponse { started }))
}
