//! Artifact Service

use nexus_core::domain::artifact::Artifact;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::repository::artifact_repository;
use crate::service::job::JobError;

/// Upper bound on uploaded artifact size (tar of a source tree, not data).
pub const MAX_ARTIFACT_BYTES: usize = 512 * 1024 * 1024;

/// Store an uploaded tar blob under a fresh opaque id.
pub async fn store_artifact(pool: &SqlitePool, data: &[u8]) -> Result<Artifact, JobError> {
    if data.is_empty() {
        return Err(JobError::Validation("artifact body is empty".to_string()));
    }
    if data.len() > MAX_ARTIFACT_BYTES {
        return Err(JobError::Validation(format!(
            "artifact exceeds the {MAX_ARTIFACT_BYTES} byte limit"
        )));
    }

    let id = Uuid::new_v4().to_string();
    let artifact = artifact_repository::insert(pool, &id, data).await?;
    tracing::info!("Stored artifact {} ({} bytes)", artifact.id, artifact.size);

    Ok(artifact)
}

pub async fn get_artifact_data(pool: &SqlitePool, id: &str) -> Result<Vec<u8>, JobError> {
    artifact_repository::find_data(pool, id)
        .await?
        .ok_or_else(|| JobError::NotFound(format!("artifact {id}")))
}
