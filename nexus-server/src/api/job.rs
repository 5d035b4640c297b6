//! Job API Handlers
//!
//! HTTP endpoints for job lifecycle management. Handlers stay thin: parse,
//! call the service, map errors.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use nexus_core::domain::job::Job;
use nexus_core::dto::job::{JobListQuery, JobLogsQuery, JobLogsResponse, JobPatch, JobRequest};

use crate::api::error::ApiResult;
use crate::api::AppState;
use crate::service::job_service;

/// GET /v1/jobs
pub async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<JobListQuery>,
) -> ApiResult<Json<Vec<Job>>> {
    let jobs = job_service::list_jobs(&state.pool, &query).await?;
    tracing::debug!("Found {} jobs matching filter", jobs.len());
    Ok(Json(jobs))
}

/// POST /v1/jobs
pub async fn create_job(
    State(state): State<AppState>,
    Json(request): Json<JobRequest>,
) -> ApiResult<(StatusCode, Json<Job>)> {
    let job = job_service::create_job(&state.pool, &request, &state.config.node_name).await?;
    Ok((StatusCode::CREATED, Json(job)))
}

/// GET /v1/jobs/{id}
pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Job>> {
    let job = job_service::get_job(&state.pool, &id).await?;
    Ok(Json(job))
}

/// PATCH /v1/jobs/{id} (queued jobs only)
pub async fn patch_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(patch): Json<JobPatch>,
) -> ApiResult<Json<Job>> {
    let job = job_service::patch_job(&state.pool, &id, &patch).await?;
    Ok(Json(job))
}

/// DELETE /v1/jobs/{id} (queued jobs only)
pub async fn delete_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    job_service::delete_queued_job(&state.pool, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /v1/jobs/{id}/kill (running jobs only)
///
/// Non-blocking: flips the kill flag and returns; the scheduler finalizes
/// the job on its next tick.
pub async fn kill_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    job_service::mark_for_kill(&state.pool, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /v1/jobs/{id}/logs
pub async fn job_logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<JobLogsQuery>,
) -> ApiResult<Json<JobLogsResponse>> {
    let logs = job_service::job_logs(&state.pool, &id, query.last_n_lines).await?;
    Ok(Json(JobLogsResponse { logs }))
}
