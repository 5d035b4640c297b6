//! GPU API Handlers

use axum::{
    extract::{Path, State},
    Json,
};
use nexus_core::domain::gpu::GpuInfo;
use nexus_core::dto::server::GpuStatusResponse;

use crate::api::error::ApiResult;
use crate::api::AppState;
use crate::service::gpu_service;

/// GET /v1/gpus
pub async fn list_gpus(State(state): State<AppState>) -> ApiResult<Json<Vec<GpuInfo>>> {
    let gpus = gpu_service::list_gpus(&state.pool, &state.probe, false).await?;
    tracing::debug!("Found {} GPUs", gpus.len());
    Ok(Json(gpus))
}

/// PUT /v1/gpus/{idx}/blacklist
pub async fn blacklist_gpu(
    State(state): State<AppState>,
    Path(idx): Path<u32>,
) -> ApiResult<Json<GpuStatusResponse>> {
    let status = gpu_service::set_blacklist(&state.pool, idx, true).await?;
    Ok(Json(status))
}

/// DELETE /v1/gpus/{idx}/blacklist
pub async fn unblacklist_gpu(
    State(state): State<AppState>,
    Path(idx): Path<u32>,
) -> ApiResult<Json<GpuStatusResponse>> {
    let status = gpu_service::set_blacklist(&state.pool, idx, false).await?;
    Ok(Json(status))
}
