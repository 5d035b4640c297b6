//! GPU Blacklist Repository

use std::collections::HashSet;

use nexus_core::domain::now_ts;
use sqlx::SqlitePool;

/// Add a GPU to the blacklist. Returns false when it was already present.
pub async fn add(pool: &SqlitePool, gpu_idx: u32) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "INSERT OR IGNORE INTO gpu_blacklist (gpu_idx, blacklisted_at) VALUES (?, ?)",
    )
    .bind(gpu_idx as i64)
    .bind(now_ts())
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Remove a GPU from the blacklist. Returns false when it was not present.
pub async fn remove(pool: &SqlitePool, gpu_idx: u32) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("DELETE FROM gpu_blacklist WHERE gpu_idx = ?")
        .bind(gpu_idx as i64)
        .execute(pool)
        .await?;

    Ok(result.rows_affected() > 0)
}

pub async fn list(pool: &SqlitePool) -> Result<HashSet<u32>, sqlx::Error> {
    let rows: Vec<(i64,)> = sqlx::query_as("SELECT gpu_idx FROM gpu_blacklist")
        .fetch_all(pool)
        .await?;

    Ok(rows.into_iter().map(|(idx,)| idx as u32).collect())
}
