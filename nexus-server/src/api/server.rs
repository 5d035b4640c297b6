//! Server API Handlers
//!
//! Status counters, server log retrieval, and SSH key authorization.

use axum::{extract::State, Json};
use nexus_core::domain::job::JobStatus;
use nexus_core::dto::server::{
    ServerLogsResponse, ServerStatusResponse, SshKeyRequest, SshKeyResponse,
};

use crate::api::error::{ApiError, ApiResult};
use crate::api::AppState;
use crate::auth;
use crate::repository::job_repository;
use crate::service::gpu_service;

/// How many trailing log lines the logs endpoint returns.
const LOG_TAIL_LINES: usize = 500;

/// GET /v1/server/status
pub async fn status(State(state): State<AppState>) -> ApiResult<Json<ServerStatusResponse>> {
    let queued = job_repository::count_by_status(&state.pool, JobStatus::Queued).await?;
    let running = job_repository::count_by_status(&state.pool, JobStatus::Running).await?;
    let completed = job_repository::count_by_status(&state.pool, JobStatus::Completed).await?
        + job_repository::count_by_status(&state.pool, JobStatus::Failed).await?
        + job_repository::count_by_status(&state.pool, JobStatus::Killed).await?;

    let gpus = gpu_service::list_gpus(&state.pool, &state.probe, false).await?;

    Ok(Json(ServerStatusResponse {
        gpu_count: gpus.len(),
        queued_jobs: queued,
        running_jobs: running,
        completed_jobs: completed,
        node_name: state.config.node_name.clone(),
        server_user: std::env::var("USER").unwrap_or_else(|_| "unknown".to_string()),
        server_version: env!("CARGO_PKG_VERSION").to_string(),
    }))
}

/// GET /v1/server/logs
pub async fn logs(State(state): State<AppState>) -> ApiResult<Json<ServerLogsResponse>> {
    let path = state.config.server_log_file();
    if !path.exists() {
        return Ok(Json(ServerLogsResponse {
            logs: String::new(),
        }));
    }

    let content = tokio::fs::read_to_string(&path)
        .await
        .map_err(|e| ApiError::InternalError(format!("cannot read server log: {e}")))?;

    let lines: Vec<&str> = content.lines().collect();
    let start = lines.len().saturating_sub(LOG_TAIL_LINES);
    Ok(Json(ServerLogsResponse {
        logs: lines[start..].join("\n"),
    }))
}

/// POST /v1/server/ssh-keys
pub async fn add_ssh_key(
    State(_state): State<AppState>,
    Json(request): Json<SshKeyRequest>,
) -> ApiResult<Json<SshKeyResponse>> {
    let added = auth::authorize_ssh_key(&request.public_key)
        .map_err(|e| ApiError::BadRequest(format!("{e:#}")))?;
    Ok(Json(SshKeyResponse { added }))
}
