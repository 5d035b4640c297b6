//! Artifact API Handlers

use axum::{body::Bytes, extract::State, http::StatusCode, Json};
use nexus_core::dto::job::ArtifactUploadResponse;

use crate::api::error::ApiResult;
use crate::api::AppState;
use crate::service::artifact_service;

/// POST /v1/artifacts
///
/// Body is the raw tar of the submitter's source tree. Returns the opaque
/// id that job requests reference.
pub async fn upload_artifact(
    State(state): State<AppState>,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<ArtifactUploadResponse>)> {
    let artifact = artifact_service::store_artifact(&state.pool, &body).await?;
    Ok((
        StatusCode::CREATED,
        Json(ArtifactUploadResponse {
            artifact_id: artifact.id,
            size: artifact.size,
        }),
    ))
}
