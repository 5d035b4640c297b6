//! Job lifecycle engine
//!
//! State transitions over [`Job`] records: creation, launch inside a
//! detached session, exit-code extraction, classification, and cleanup.
//! Records are never mutated in place; every transition builds a new record
//! with struct-update syntax and the caller persists it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use nexus_core::domain::job::{Job, JobStatus};
use nexus_core::domain::now_ts;
use nexus_core::dto::job::JobRequest;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::session::SessionBackend;

/// Exit status sentinel appended by the wrapper script. The last occurrence
/// in the log wins; anything after it is ignored.
const EXIT_SENTINEL: &str = "COMMAND_EXIT_CODE=";

const ID_LENGTH: usize = 6;

/// Base58 alphabet, lowercased. Lowercase ids are easier to tell apart from
/// GPU indices in terminal output.
const ID_ALPHABET: &[u8] = b"123456789abcdefghjkmnpqrstuvwxyz";

// =============================================================================
// Creation
// =============================================================================

/// Random 6-character job identifier.
///
/// Hashes the current time plus four random bytes and encodes the prefix
/// with the restricted alphabet. Uniqueness against the store is the
/// caller's job (see [`crate::service::job_service::unique_job_id`]).
pub fn generate_job_id() -> String {
    let mut random = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut random);

    let mut hasher = Sha256::new();
    hasher.update(now_ts().to_string().as_bytes());
    hasher.update(random);
    let digest = hasher.finalize();

    digest
        .iter()
        .take(ID_LENGTH)
        .map(|b| ID_ALPHABET[*b as usize % ID_ALPHABET.len()] as char)
        .collect()
}

/// Build a fresh queued record from a validated request.
///
/// `run_immediately` is a front-of-queue request: it maps to the maximum
/// priority so the job is the next dequeue candidate, without bypassing GPU
/// availability checks.
pub fn create_job(request: &JobRequest, id: String, node_name: &str) -> Job {
    Job {
        id,
        command: request.command.trim().to_string(),
        user: request.user.clone(),
        node_name: node_name.to_string(),
        priority: if request.run_immediately {
            i32::MAX
        } else {
            request.priority
        },
        num_gpus: request.num_gpus,
        gpu_idxs: request.gpu_idxs.clone().unwrap_or_default(),
        git_repo_url: request.git_repo_url.clone(),
        git_branch: request.git_branch.clone(),
        git_tag: request.git_tag.clone(),
        artifact_id: request.artifact_id.clone(),
        env: request.env.clone(),
        jobrc: request.jobrc.clone(),
        notifications: request.notifications.clone(),
        search_wandb: request.search_wandb,
        ignore_blacklist: request.ignore_blacklist,
        status: JobStatus::Queued,
        created_at: now_ts(),
        started_at: None,
        completed_at: None,
        pid: None,
        dir: None,
        screen_session_name: None,
        exit_code: None,
        error_message: None,
        wandb_url: None,
        marked_for_kill: false,
        notification_messages: HashMap::new(),
        output_file: request.output_file.clone(),
    }
}

// =============================================================================
// Launch
// =============================================================================

/// Environment for the session: the server's own environment, the job's
/// user-supplied variables, then the system injections on top.
pub fn build_env(job: &Job, gpu_idxs: &[u32]) -> HashMap<String, String> {
    let mut env: HashMap<String, String> = std::env::vars().collect();
    env.extend(job.env.clone());

    let idx_list = gpu_idxs
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join(",");

    env.insert("CUDA_VISIBLE_DEVICES".to_string(), idx_list.clone());
    env.insert("NEXUS_JOB_ID".to_string(), job.id.clone());
    env.insert("NEXUS_GPU_IDS".to_string(), idx_list);
    if !job.git_tag.is_empty() {
        env.insert("NEXUS_GIT_TAG".to_string(), job.git_tag.clone());
    }

    env
}

/// Outer wrapper: enter the repo, source the jobrc preamble, run the inner
/// script under a login shell with stdout/stderr captured, then append the
/// exit sentinel.
pub fn build_outer_script(job: &Job, dir: &Path) -> String {
    let repo = dir.join("repo");
    let inner = dir.join("job.sh");
    let out = dir.join("output.log");
    let err = dir.join("error.log");

    let mut lines = vec![
        "#!/usr/bin/env bash".to_string(),
        format!("cd \"{}\"", repo.display()),
    ];
    if let Some(jobrc) = job.jobrc.as_deref() {
        if !jobrc.trim().is_empty() {
            lines.push(jobrc.trim().to_string());
        }
    }
    lines.push(format!(
        "bash -l \"{inner}\" >> \"{out}\" 2> >(tee -a \"{err}\" >> \"{out}\")",
        inner = inner.display(),
        out = out.display(),
        err = err.display(),
    ));
    lines.push(format!(
        "echo \"{EXIT_SENTINEL}$?\" >> \"{out}\"",
        out = out.display()
    ));
    lines.push(String::new());
    lines.join("\n")
}

/// Inner script: the user command, verbatim.
pub fn build_inner_script(job: &Job) -> String {
    format!("#!/usr/bin/env bash\n{}\n", job.command)
}

/// Materialize the working directory and launch the job in a detached
/// session. Returns the running record. On any failure the working
/// directory is removed and the error is surfaced for the caller to record
/// as a launch failure.
pub async fn start_job(
    backend: &dyn SessionBackend,
    job: &Job,
    gpu_idxs: &[u32],
    job_dir: PathBuf,
    artifact: Vec<u8>,
) -> Result<Job> {
    match try_start(backend, job, gpu_idxs, &job_dir, artifact).await {
        Ok(started) => Ok(started),
        Err(e) => {
            let _ = std::fs::remove_dir_all(&job_dir);
            Err(e)
        }
    }
}

async fn try_start(
    backend: &dyn SessionBackend,
    job: &Job,
    gpu_idxs: &[u32],
    job_dir: &Path,
    artifact: Vec<u8>,
) -> Result<Job> {
    let repo_dir = job_dir.join("repo");
    std::fs::create_dir_all(&repo_dir)
        .with_context(|| format!("Failed to create {}", repo_dir.display()))?;

    unpack_artifact(artifact, repo_dir.clone()).await?;

    // Set up the log files before anything can run so redirection never
    // races the user command.
    std::fs::write(job_dir.join("output.log"), "").context("Failed to create output log")?;
    std::fs::write(job_dir.join("error.log"), "").context("Failed to create error log")?;

    write_script(&job_dir.join("run.sh"), &build_outer_script(job, job_dir))?;
    write_script(&job_dir.join("job.sh"), &build_inner_script(job))?;

    let env = build_env(job, gpu_idxs);
    let session_name = job.session_name();

    let pid = backend
        .start(&session_name, job_dir, &job_dir.join("run.sh"), &env)
        .await
        .with_context(|| format!("Failed to launch session for job {}", job.id))?;

    Ok(Job {
        status: JobStatus::Running,
        started_at: Some(now_ts()),
        gpu_idxs: gpu_idxs.to_vec(),
        pid: Some(pid),
        dir: Some(job_dir.to_path_buf()),
        screen_session_name: Some(session_name),
        ..job.clone()
    })
}

async fn unpack_artifact(data: Vec<u8>, repo_dir: PathBuf) -> Result<()> {
    tokio::task::spawn_blocking(move || {
        let mut archive = tar::Archive::new(std::io::Cursor::new(data));
        archive
            .unpack(&repo_dir)
            .with_context(|| format!("Failed to unpack artifact into {}", repo_dir.display()))
    })
    .await
    .context("Artifact unpack task panicked")?
}

fn write_script(path: &Path, content: &str) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    std::fs::write(path, content)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
        .with_context(|| format!("Failed to chmod {}", path.display()))?;
    Ok(())
}

/// Pre-start failure: the job never ran, so there is no exit code, only an
/// error message.
pub fn fail_job(job: &Job, error_message: impl Into<String>) -> Job {
    Job {
        status: JobStatus::Failed,
        completed_at: Some(now_ts()),
        error_message: Some(error_message.into()),
        ..job.clone()
    }
}

// =============================================================================
// Completion
// =============================================================================

/// Classify a finished job from its log.
///
/// `killed` reflects whether the session died because we killed it; it wins
/// over whatever the log says.
pub fn end_job(job: &Job, killed: bool) -> Job {
    let log = job
        .dir
        .as_deref()
        .and_then(|dir| read_logs(dir, None).ok().flatten());
    let exit_code = log.as_deref().and_then(parse_exit_code);
    let completed_at = Some(now_ts());

    if killed {
        return Job {
            status: JobStatus::Killed,
            completed_at,
            exit_code,
            ..job.clone()
        };
    }

    match exit_code {
        None => Job {
            status: JobStatus::Failed,
            completed_at,
            error_message: Some("no exit code recorded".to_string()),
            ..job.clone()
        },
        Some(0) => Job {
            status: JobStatus::Completed,
            completed_at,
            exit_code: Some(0),
            error_message: None,
            ..job.clone()
        },
        Some(code) => Job {
            status: JobStatus::Failed,
            completed_at,
            exit_code: Some(code),
            error_message: Some(format!("job exited with code {code}")),
            ..job.clone()
        },
    }
}

/// Last sentinel in the log wins: scan from the end and stop at the first
/// line that carries one, so user output that merely mentions the sentinel
/// string earlier cannot spoof the result.
pub fn parse_exit_code(log: &str) -> Option<i32> {
    for line in log.lines().rev() {
        let Some(pos) = line.rfind(EXIT_SENTINEL) else {
            continue;
        };
        let raw = line[pos + EXIT_SENTINEL.len()..]
            .trim()
            .trim_matches(|c| c == '"' || c == '\'');
        if let Ok(code) = raw.parse::<i32>() {
            return Some(code);
        }
    }
    None
}

/// Read the job's combined log, optionally only the last `n` lines.
pub fn read_logs(dir: &Path, last_n_lines: Option<usize>) -> Result<Option<String>> {
    let path = dir.join("output.log");
    if !path.exists() {
        return Ok(None);
    }

    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    match last_n_lines {
        None => Ok(Some(content)),
        Some(n) => {
            let lines: Vec<&str> = content.lines().collect();
            let start = lines.len().saturating_sub(n);
            let mut tail = lines[start..].join("\n");
            if content.ends_with('\n') && !tail.is_empty() {
                tail.push('\n');
            }
            Ok(Some(tail))
        }
    }
}

// =============================================================================
// Cleanup
// =============================================================================

/// Remove the extracted source tree; logs stay behind under the job dir.
pub fn cleanup_job(job: &Job) {
    let Some(dir) = job.dir.as_deref() else {
        return;
    };
    let repo = dir.join("repo");
    if repo.exists() {
        if let Err(e) = std::fs::remove_dir_all(&repo) {
            tracing::warn!("Failed to remove {}: {e}", repo.display());
        } else {
            tracing::info!("Cleaned up {}", repo.display());
        }
    }
}

/// Synchronous kill of the job's session. The record transition happens on
/// the next scheduler tick when the session is observed dead.
pub async fn kill_job(backend: &dyn SessionBackend, job: &Job) -> Result<()> {
    backend.kill(&job.session_name()).await
}

/// Copy the declared output file out of the repo tree before it is cleaned
/// up, to `/tmp/nexus-{id}-<flattened path>`.
pub fn copy_output_file(job: &Job) -> Result<Option<PathBuf>> {
    let (Some(dir), Some(rel)) = (job.dir.as_deref(), job.output_file.as_deref()) else {
        return Ok(None);
    };

    let source = dir.join("repo").join(rel);
    if !source.exists() {
        anyhow::bail!("output file {} does not exist", source.display());
    }

    let flattened = rel.replace('/', "-");
    let dest = PathBuf::from(format!("/tmp/nexus-{}-{flattened}", job.id));
    std::fs::copy(&source, &dest)
        .with_context(|| format!("Failed to copy {} to {}", source.display(), dest.display()))?;

    Ok(Some(dest))
}
