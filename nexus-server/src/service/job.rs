//! Job Service
//!
//! Validation, lookup, and the queued-only / running-only state rules for
//! the job endpoints. Scheduling itself lives in the scheduler; everything
//! here is synchronous with respect to the store.

use nexus_core::domain::job::{Job, JobStatus, NotificationType};
use nexus_core::dto::job::{JobListQuery, JobPatch, JobRequest};
use regex::Regex;
use sqlx::SqlitePool;

use crate::engine;
use crate::repository::{artifact_repository, job_repository};

/// Service error type. `NotFound` carries the missing subject, e.g.
/// `job abc123` or `artifact 7f3c...`.
#[derive(Debug)]
pub enum JobError {
    NotFound(String),
    InvalidState(String),
    Validation(String),
    Database(sqlx::Error),
}

impl From<sqlx::Error> for JobError {
    fn from(err: sqlx::Error) -> Self {
        JobError::Database(err)
    }
}

impl std::fmt::Display for JobError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobError::NotFound(subject) => write!(f, "{subject} not found"),
            JobError::InvalidState(msg) => write!(f, "{msg}"),
            JobError::Validation(msg) => write!(f, "{msg}"),
            JobError::Database(err) => write!(f, "database error: {err}"),
        }
    }
}

impl std::error::Error for JobError {}

/// Environment variables each notification channel needs on the job.
const DISCORD_REQUIRED_ENV: &[&str] = &["DISCORD_WEBHOOK_URL", "DISCORD_USER_ID"];
const PHONE_REQUIRED_ENV: &[&str] = &["PHONE_TO_NUMBER"];
const WANDB_REQUIRED_ENV: &[&str] = &["WANDB_API_KEY", "WANDB_ENTITY"];

/// Validate a submission and insert it as queued.
pub async fn create_job(
    pool: &SqlitePool,
    request: &JobRequest,
    node_name: &str,
) -> Result<Job, JobError> {
    validate_request(request)?;

    let id = unique_job_id(pool).await?;
    let job = engine::create_job(request, id, node_name);
    job_repository::insert(pool, &job).await?;

    tracing::info!("Added job {} for user {}", job.id, job.user);
    Ok(job)
}

/// Generate an id not currently present in the store.
pub async fn unique_job_id(pool: &SqlitePool) -> Result<String, JobError> {
    loop {
        let id = engine::generate_job_id();
        if !job_repository::exists(pool, &id).await? {
            return Ok(id);
        }
        tracing::debug!("Job id collision on {id}, regenerating");
    }
}

pub fn validate_request(request: &JobRequest) -> Result<(), JobError> {
    if request.command.trim().is_empty() {
        return Err(JobError::Validation("command cannot be empty".to_string()));
    }
    if request.user.trim().is_empty() {
        return Err(JobError::Validation("user cannot be empty".to_string()));
    }
    if request.artifact_id.trim().is_empty() {
        return Err(JobError::Validation("artifact_id cannot be empty".to_string()));
    }
    if request.num_gpus == 0 {
        return Err(JobError::Validation("num_gpus must be at least 1".to_string()));
    }

    if let Some(idxs) = &request.gpu_idxs {
        if idxs.len() != request.num_gpus as usize {
            return Err(JobError::Validation(format!(
                "pinned gpu_idxs must name exactly num_gpus={} indices, got {}",
                request.num_gpus,
                idxs.len()
            )));
        }
    }

    for channel in &request.notifications {
        let required = match channel {
            NotificationType::Discord => DISCORD_REQUIRED_ENV,
            NotificationType::Phone => PHONE_REQUIRED_ENV,
        };
        for key in required {
            if !request.env.contains_key(*key) {
                return Err(JobError::Validation(format!(
                    "missing environment variable {key} required for {} notifications",
                    channel.as_str()
                )));
            }
        }
    }

    if request.search_wandb {
        for key in WANDB_REQUIRED_ENV {
            if !request.env.contains_key(*key) {
                return Err(JobError::Validation(format!(
                    "missing environment variable {key} required for W&B search"
                )));
            }
        }
    }

    Ok(())
}

pub async fn get_job(pool: &SqlitePool, id: &str) -> Result<Job, JobError> {
    job_repository::find_by_id(pool, id)
        .await?
        .ok_or_else(|| JobError::NotFound(format!("job {id}")))
}

pub async fn list_jobs(pool: &SqlitePool, query: &JobListQuery) -> Result<Vec<Job>, JobError> {
    let status = match query.status.as_deref() {
        None => None,
        Some(raw) => Some(
            JobStatus::parse(raw)
                .ok_or_else(|| JobError::Validation(format!("invalid job status: {raw}")))?,
        ),
    };

    let regex = match query.command_regex.as_deref() {
        None => None,
        Some(raw) => Some(
            Regex::new(raw)
                .map_err(|e| JobError::Validation(format!("invalid command regex: {e}")))?,
        ),
    };

    let jobs = job_repository::list_filtered(
        pool,
        status,
        query.gpu_index,
        regex.as_ref(),
        query.limit,
        query.offset,
    )
    .await?;

    Ok(jobs)
}

/// Edit a queued job's command or priority.
pub async fn patch_job(pool: &SqlitePool, id: &str, patch: &JobPatch) -> Result<Job, JobError> {
    let job = get_job(pool, id).await?;
    if job.status != JobStatus::Queued {
        return Err(JobError::InvalidState(format!(
            "cannot edit job {id} with status {}; only queued jobs can be edited",
            job.status
        )));
    }

    if let Some(command) = &patch.command {
        if command.trim().is_empty() {
            return Err(JobError::Validation("command cannot be empty".to_string()));
        }
    }

    let updated = Job {
        command: patch
            .command
            .clone()
            .map(|c| c.trim().to_string())
            .unwrap_or(job.command.clone()),
        priority: patch.priority.unwrap_or(job.priority),
        ..job
    };
    job_repository::update(pool, &updated).await?;

    Ok(updated)
}

/// Remove a queued job and collect its artifact when nothing else uses it.
pub async fn delete_queued_job(pool: &SqlitePool, id: &str) -> Result<(), JobError> {
    let job = get_job(pool, id).await?;
    if job.status != JobStatus::Queued {
        return Err(JobError::InvalidState(format!(
            "cannot delete job {id} with status {}; only queued jobs can be deleted",
            job.status
        )));
    }

    job_repository::delete(pool, id).await?;

    if artifact_repository::delete_if_unused(pool, &job.artifact_id).await? {
        tracing::info!(
            "Deleted artifact {} no longer referenced after job {id} was removed",
            job.artifact_id
        );
    }

    Ok(())
}

/// Flip the kill flag on a running job. Finalization happens on the next
/// scheduler tick, so this never blocks on the session.
pub async fn mark_for_kill(pool: &SqlitePool, id: &str) -> Result<(), JobError> {
    let job = get_job(pool, id).await?;
    if job.status != JobStatus::Running {
        return Err(JobError::InvalidState(format!(
            "cannot kill job {id} with status {}; only running jobs can be killed",
            job.status
        )));
    }

    let updated = Job {
        marked_for_kill: true,
        ..job
    };
    job_repository::update(pool, &updated).await?;
    tracing::info!("Marked job {id} for termination");

    Ok(())
}

pub async fn job_logs(
    pool: &SqlitePool,
    id: &str,
    last_n_lines: Option<usize>,
) -> Result<String, JobError> {
    let job = get_job(pool, id).await?;

    let Some(dir) = job.dir.as_deref() else {
        return Ok(String::new());
    };

    let logs = engine::read_logs(dir, last_n_lines)
        .map_err(|e| JobError::InvalidState(format!("cannot read logs for job {id}: {e}")))?;

    Ok(logs.unwrap_or_default())
}
