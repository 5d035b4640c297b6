//! Database pool and migrations
//!
//! The store is a single sqlite file under the server home. Migrations are
//! additive: tables are created if absent, and any canonical job column
//! missing from an existing database is added with `ALTER TABLE`, so
//! databases written by older servers keep working.

use std::path::Path;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;

pub async fn create_pool(path: &Path) -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .busy_timeout(Duration::from_secs(5));

    SqlitePoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(5))
        .connect_with(options)
        .await
}

/// In-memory pool for tests. Capped at one connection so every query sees
/// the same database.
pub async fn create_memory_pool() -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::new().in_memory(true);
    SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
}

/// Canonical job columns, in insert order. New attributes are appended here
/// and picked up by the additive column pass below.
pub const JOB_COLUMNS: &[(&str, &str)] = &[
    ("id", "TEXT PRIMARY KEY"),
    ("command", "TEXT NOT NULL DEFAULT ''"),
    ("user", "TEXT NOT NULL DEFAULT ''"),
    ("node_name", "TEXT NOT NULL DEFAULT ''"),
    ("priority", "INTEGER NOT NULL DEFAULT 0"),
    ("num_gpus", "INTEGER NOT NULL DEFAULT 1"),
    ("gpu_idxs", "TEXT NOT NULL DEFAULT ''"),
    ("git_repo_url", "TEXT NOT NULL DEFAULT ''"),
    ("git_branch", "TEXT NOT NULL DEFAULT ''"),
    ("git_tag", "TEXT NOT NULL DEFAULT ''"),
    ("artifact_id", "TEXT NOT NULL DEFAULT ''"),
    ("env", "TEXT NOT NULL DEFAULT '{}'"),
    ("jobrc", "TEXT"),
    ("notifications", "TEXT NOT NULL DEFAULT ''"),
    ("search_wandb", "INTEGER NOT NULL DEFAULT 0"),
    ("ignore_blacklist", "INTEGER NOT NULL DEFAULT 0"),
    ("status", "TEXT NOT NULL DEFAULT 'queued'"),
    ("created_at", "REAL NOT NULL DEFAULT 0"),
    ("started_at", "REAL"),
    ("completed_at", "REAL"),
    ("pid", "INTEGER"),
    ("dir", "TEXT"),
    ("screen_session_name", "TEXT"),
    ("exit_code", "INTEGER"),
    ("error_message", "TEXT"),
    ("wandb_url", "TEXT"),
    ("marked_for_kill", "INTEGER NOT NULL DEFAULT 0"),
    ("notification_messages", "TEXT NOT NULL DEFAULT '{}'"),
    ("output_file", "TEXT"),
];

pub async fn run_migrations(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    let job_columns = JOB_COLUMNS
        .iter()
        .map(|(name, decl)| format!("{name} {decl}"))
        .collect::<Vec<_>>()
        .join(",\n            ");

    sqlx::query(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
            {job_columns}
        )
        "#
    ))
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS gpu_blacklist (
            gpu_idx INTEGER PRIMARY KEY,
            blacklisted_at REAL NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS artifacts (
            id TEXT PRIMARY KEY,
            size INTEGER NOT NULL,
            created_at REAL NOT NULL,
            data BLOB NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    ensure_columns(pool, "jobs", JOB_COLUMNS).await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_artifact_id ON jobs(artifact_id)")
        .execute(pool)
        .await?;

    tracing::info!("Database migrations completed");
    Ok(())
}

/// Add-column pass: compare the live schema against the canonical column
/// list and issue `ALTER TABLE ... ADD COLUMN` for anything missing.
async fn ensure_columns(
    pool: &SqlitePool,
    table: &str,
    columns: &[(&str, &str)],
) -> Result<(), sqlx::Error> {
    let rows = sqlx::query(&format!("PRAGMA table_info({table})"))
        .fetch_all(pool)
        .await?;

    let existing: Vec<String> = rows
        .iter()
        .map(|row| row.get::<String, _>("name"))
        .collect();

    for (name, decl) in columns {
        if existing.iter().any(|c| c == name) {
            continue;
        }
        // PRIMARY KEY cannot be added after the fact; it only appears in the
        // CREATE TABLE path above.
        let decl = decl.replace(" PRIMARY KEY", "");
        tracing::info!("Adding missing column {table}.{name}");
        sqlx::query(&format!("ALTER TABLE {table} ADD COLUMN {name} {decl}"))
            .execute(pool)
            .await?;
    }

    Ok(())
}
