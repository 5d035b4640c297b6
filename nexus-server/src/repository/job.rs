//! Job Repository
//!
//! Handles all database operations related to jobs. List- and map-valued
//! fields are serialized as text: GPU indices and notification channels as
//! comma-separated lists, env and notification-message maps as JSON.

use std::collections::HashMap;
use std::path::PathBuf;

use nexus_core::domain::job::{Job, JobStatus, NotificationType};
use regex::Regex;
use sqlx::SqlitePool;

const SELECT_COLUMNS: &str = r#"
    id, command, user, node_name, priority, num_gpus, gpu_idxs,
    git_repo_url, git_branch, git_tag, artifact_id, env, jobrc,
    notifications, search_wandb, ignore_blacklist, status, created_at,
    started_at, completed_at, pid, dir, screen_session_name, exit_code,
    error_message, wandb_url, marked_for_kill, notification_messages,
    output_file
"#;

/// Insert a new job. Fails with a unique violation when the id is taken.
pub async fn insert(pool: &SqlitePool, job: &Job) -> Result<(), sqlx::Error> {
    bind_job(sqlx::query(
        r#"
        INSERT INTO jobs (
            id, command, user, node_name, priority, num_gpus, gpu_idxs,
            git_repo_url, git_branch, git_tag, artifact_id, env, jobrc,
            notifications, search_wandb, ignore_blacklist, status, created_at,
            started_at, completed_at, pid, dir, screen_session_name, exit_code,
            error_message, wandb_url, marked_for_kill, notification_messages,
            output_file
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    ), job)
    .execute(pool)
    .await?;

    Ok(())
}

/// Upsert by id: update the existing row, insert when none exists.
pub async fn update(pool: &SqlitePool, job: &Job) -> Result<(), sqlx::Error> {
    let result = bind_job(sqlx::query(
        r#"
        UPDATE jobs SET
            command = ?2, user = ?3, node_name = ?4, priority = ?5,
            num_gpus = ?6, gpu_idxs = ?7, git_repo_url = ?8, git_branch = ?9,
            git_tag = ?10, artifact_id = ?11, env = ?12, jobrc = ?13,
            notifications = ?14, search_wandb = ?15, ignore_blacklist = ?16,
            status = ?17, created_at = ?18, started_at = ?19,
            completed_at = ?20, pid = ?21, dir = ?22,
            screen_session_name = ?23, exit_code = ?24, error_message = ?25,
            wandb_url = ?26, marked_for_kill = ?27,
            notification_messages = ?28, output_file = ?29
        WHERE id = ?1
        "#,
    ), job)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        insert(pool, job).await?;
    }
    Ok(())
}

pub async fn find_by_id(pool: &SqlitePool, id: &str) -> Result<Option<Job>, sqlx::Error> {
    let row = sqlx::query_as::<_, JobRow>(&format!(
        "SELECT {SELECT_COLUMNS} FROM jobs WHERE id = ?"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(Job::from))
}

pub async fn exists(pool: &SqlitePool, id: &str) -> Result<bool, sqlx::Error> {
    let row: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM jobs WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row.is_some())
}

/// List jobs filtered by status, with the per-status ordering contract:
/// queued by `(priority DESC, created_at ASC)` (the dequeue order), running
/// by `started_at ASC`, terminal by `completed_at DESC`.
pub async fn find_by_status(
    pool: &SqlitePool,
    status: JobStatus,
) -> Result<Vec<Job>, sqlx::Error> {
    let order = match status {
        JobStatus::Queued => "priority DESC, created_at ASC",
        JobStatus::Running => "started_at ASC",
        JobStatus::Completed | JobStatus::Failed | JobStatus::Killed => "completed_at DESC",
    };

    let rows = sqlx::query_as::<_, JobRow>(&format!(
        "SELECT {SELECT_COLUMNS} FROM jobs WHERE status = ? ORDER BY {order}"
    ))
    .bind(status.as_str())
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(Job::from).collect())
}

pub async fn list_all(pool: &SqlitePool) -> Result<Vec<Job>, sqlx::Error> {
    let rows = sqlx::query_as::<_, JobRow>(&format!(
        "SELECT {SELECT_COLUMNS} FROM jobs ORDER BY created_at DESC"
    ))
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(Job::from).collect())
}

/// Filtered listing. The regex and GPU-membership filters are applied after
/// the query (sqlite has no regex support without an extension), then the
/// limit/offset window is cut from the filtered sequence.
pub async fn list_filtered(
    pool: &SqlitePool,
    status: Option<JobStatus>,
    gpu_index: Option<u32>,
    command_regex: Option<&Regex>,
    limit: Option<u32>,
    offset: Option<u32>,
) -> Result<Vec<Job>, sqlx::Error> {
    let jobs = match status {
        Some(status) => find_by_status(pool, status).await?,
        None => list_all(pool).await?,
    };

    let filtered = jobs.into_iter().filter(|job| {
        if let Some(idx) = gpu_index {
            if !job.gpu_idxs.contains(&idx) {
                return false;
            }
        }
        if let Some(regex) = command_regex {
            if !regex.is_match(&job.command) {
                return false;
            }
        }
        true
    });

    let offset = offset.unwrap_or(0) as usize;
    let limited: Vec<Job> = match limit {
        Some(limit) => filtered.skip(offset).take(limit as usize).collect(),
        None => filtered.skip(offset).collect(),
    };

    Ok(limited)
}

pub async fn count_by_status(pool: &SqlitePool, status: JobStatus) -> Result<u64, sqlx::Error> {
    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM jobs WHERE status = ?")
        .bind(status.as_str())
        .fetch_one(pool)
        .await?;
    Ok(count as u64)
}

/// Delete a job row. Status preconditions are enforced by the service layer.
pub async fn delete(pool: &SqlitePool, id: &str) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("DELETE FROM jobs WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

// =============================================================================
// Row Mapping
// =============================================================================

type SqliteQuery<'q> =
    sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>;

fn bind_job<'q>(query: SqliteQuery<'q>, job: &'q Job) -> SqliteQuery<'q> {
    query
        .bind(&job.id)
        .bind(&job.command)
        .bind(&job.user)
        .bind(&job.node_name)
        .bind(job.priority)
        .bind(job.num_gpus as i64)
        .bind(join_idxs(&job.gpu_idxs))
        .bind(&job.git_repo_url)
        .bind(&job.git_branch)
        .bind(&job.git_tag)
        .bind(&job.artifact_id)
        .bind(persisted_env(job))
        .bind(&job.jobrc)
        .bind(join_notifications(&job.notifications))
        .bind(job.search_wandb)
        .bind(job.ignore_blacklist)
        .bind(job.status.as_str())
        .bind(job.created_at)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(job.pid)
        .bind(job.dir.as_ref().map(|d| d.display().to_string()))
        .bind(&job.screen_session_name)
        .bind(job.exit_code)
        .bind(&job.error_message)
        .bind(&job.wandb_url)
        .bind(job.marked_for_kill)
        .bind(serde_json::to_string(&job.notification_messages).unwrap_or_else(|_| "{}".into()))
        .bind(&job.output_file)
}

/// Terminal rows keep an empty env so user secrets are not retained at rest
/// once the job can no longer use them.
fn persisted_env(job: &Job) -> String {
    if job.status.is_terminal() {
        "{}".to_string()
    } else {
        serde_json::to_string(&job.env).unwrap_or_else(|_| "{}".into())
    }
}

fn join_idxs(idxs: &[u32]) -> String {
    idxs.iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

fn split_idxs(raw: &str) -> Vec<u32> {
    raw.split(',')
        .filter(|s| !s.is_empty())
        .filter_map(|s| s.parse().ok())
        .collect()
}

fn join_notifications(channels: &[NotificationType]) -> String {
    channels
        .iter()
        .map(|c| c.as_str())
        .collect::<Vec<_>>()
        .join(",")
}

fn parse_json_map(raw: &str) -> HashMap<String, String> {
    if raw.is_empty() {
        return HashMap::new();
    }
    serde_json::from_str(raw).unwrap_or_default()
}

#[derive(sqlx::FromRow)]
struct JobRow {
    id: String,
    command: String,
    user: String,
    node_name: String,
    priority: i64,
    num_gpus: i64,
    gpu_idxs: String,
    git_repo_url: String,
    git_branch: String,
    git_tag: String,
    artifact_id: String,
    env: String,
    jobrc: Option<String>,
    notifications: String,
    search_wandb: bool,
    ignore_blacklist: bool,
    status: String,
    created_at: f64,
    started_at: Option<f64>,
    completed_at: Option<f64>,
    pid: Option<i64>,
    dir: Option<String>,
    screen_session_name: Option<String>,
    exit_code: Option<i64>,
    error_message: Option<String>,
    wandb_url: Option<String>,
    marked_for_kill: bool,
    notification_messages: String,
    output_file: Option<String>,
}

impl From<JobRow> for Job {
    fn from(row: JobRow) -> Self {
        Job {
            id: row.id,
            command: row.command,
            user: row.user,
            node_name: row.node_name,
            priority: row.priority as i32,
            num_gpus: row.num_gpus as u32,
            gpu_idxs: split_idxs(&row.gpu_idxs),
            git_repo_url: row.git_repo_url,
            git_branch: row.git_branch,
            git_tag: row.git_tag,
            artifact_id: row.artifact_id,
            env: parse_json_map(&row.env),
            jobrc: row.jobrc,
            notifications: row
                .notifications
                .split(',')
                .filter_map(NotificationType::parse)
                .collect(),
            search_wandb: row.search_wandb,
            ignore_blacklist: row.ignore_blacklist,
            status: JobStatus::parse(&row.status).unwrap_or(JobStatus::Failed),
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            pid: row.pid,
            dir: row.dir.map(PathBuf::from),
            screen_session_name: row.screen_session_name,
            exit_code: row.exit_code.map(|c| c as i32),
            error_message: row.error_message,
            wandb_url: row.wandb_url,
            marked_for_kill: row.marked_for_kill,
            notification_messages: parse_json_map(&row.notification_messages),
            output_file: row.output_file,
        }
    }
}
