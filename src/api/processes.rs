//! Shell command and background service endpoints.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};

use crate::process::{ExecError, ServiceError, ServiceLine, ShellOutput};

use super::routes::AppState;
use super::types::{RunShellRequest, ServicesResponse, SignalResponse, StartServiceRequest};

fn exec_error(e: ExecError) -> (StatusCode, String) {
    let status = match &e {
        ExecError::AlreadyRegistered(_) => StatusCode::CONFLICT,
        ExecError::InvalidDirectory(_) | ExecError::Spawn(_) => StatusCode::BAD_REQUEST,
        ExecError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, e.to_string())
}

fn service_error(e: ServiceError) -> (StatusCode, String) {
    let status = match &e {
        ServiceError::AlreadyRunning(_) => StatusCode::CONFLICT,
        ServiceError::InvalidDirectory(_) | ServiceError::Spawn(_) => StatusCode::BAD_REQUEST,
    };
    (status, e.to_string())
}

/// Run a command to completion or cancellation.
pub async fn run_shell(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RunShellRequest>,
) -> Result<Json<ShellOutput>, (StatusCode, String)> {
    if req.token.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "token must not be empty".to_string()));
    }
    state
        .shell
        .run(&req.token, &req.command, req.working_directory.as_deref())
        .await
        .map(Json)
        .map_err(exec_error)
}

pub async fn kill_shell(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
) -> Json<SignalResponse> {
    Json(SignalResponse {
        signalled: state.shell.kill(&token),
    })
}

pub async fn list_services(State(state): State<Arc<AppState>>) -> Json<ServicesResponse> {
    Json(ServicesResponse {
        running: state.services.list_running(),
        services: state.services.status(),
    })
}

pub async fn start_service(
    State(state): State<Arc<AppState>>,
    Json(req): Json<StartServiceRequest>,
) -> Result<(StatusCode, Json<SignalResponse>), (StatusCode, String)> {
    if req.id.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "id must not be empty".to_string()));
    }
    state
        .services
        .start(&req.id, &req.command, req.working_directory.as_deref())
        .await
        .map_err(service_error)?;
    Ok((StatusCode::ACCEPTED, Json(SignalResponse { signalled: true })))
}

pub async fn stop_service(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Json<SignalResponse> {
    Json(SignalResponse {
        signalled: state.services.stop(&id),
    })
}

/// Buffered output of a running service.
pub async fn service_output(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<ServiceLine>>, (StatusCode, String)> {
    state
        .services
        .recent_output(&id)
        .map(Json)
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("Service {} is not running", id)))
}
