//! Artifact Repository
//!
//! Artifacts are reference-counted by live jobs: an artifact may only be
//! deleted while no queued or running job references it, and that check runs
//! in the same transaction as the delete so a concurrently submitted job
//! cannot race the collection.

use nexus_core::domain::artifact::Artifact;
use nexus_core::domain::now_ts;
use sqlx::SqlitePool;

pub async fn insert(pool: &SqlitePool, id: &str, data: &[u8]) -> Result<Artifact, sqlx::Error> {
    let created_at = now_ts();
    sqlx::query("INSERT INTO artifacts (id, size, created_at, data) VALUES (?, ?, ?, ?)")
        .bind(id)
        .bind(data.len() as i64)
        .bind(created_at)
        .bind(data)
        .execute(pool)
        .await?;

    Ok(Artifact {
        id: id.to_string(),
        size: data.len() as u64,
        created_at,
    })
}

pub async fn find_data(pool: &SqlitePool, id: &str) -> Result<Option<Vec<u8>>, sqlx::Error> {
    let row: Option<(Vec<u8>,)> = sqlx::query_as("SELECT data FROM artifacts WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;

    Ok(row.map(|(data,)| data))
}

/// Whether any live (queued or running) job still references the artifact.
pub async fn in_use(pool: &SqlitePool, id: &str) -> Result<bool, sqlx::Error> {
    let (count,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM jobs WHERE artifact_id = ? AND status IN ('queued', 'running')",
    )
    .bind(id)
    .fetch_one(pool)
    .await?;

    Ok(count > 0)
}

/// Delete the artifact unless a live job references it. The in-use check and
/// the delete share one transaction. Returns true when a row was removed.
pub async fn delete_if_unused(pool: &SqlitePool, id: &str) -> Result<bool, sqlx::Error> {
    let mut tx = pool.begin().await?;

    let (count,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM jobs WHERE artifact_id = ? AND status IN ('queued', 'running')",
    )
    .bind(id)
    .fetch_one(&mut *tx)
    .await?;

    if count > 0 {
        tx.rollback().await?;
        return Ok(false);
    }

    let result = sqlx::query("DELETE FROM artifacts WHERE id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(result.rows_affected() > 0)
}
