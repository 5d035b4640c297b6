//! Weights & Biases run discovery
//!
//! A job started with `search_wandb` gets its run URL filled in lazily: the
//! scheduler scans the job's working tree for `wandb-metadata.json` files
//! that mention the job id and derives the run URL from the surrounding run
//! directory. Probing stops once the job is older than [`SEARCH_WINDOW`] so
//! a job that never logs to W&B does not get polled forever.

use std::path::{Path, PathBuf};

use anyhow::Result;
use nexus_core::domain::job::Job;
use nexus_core::domain::now_ts;

/// How long after start the scheduler keeps looking, in seconds.
pub const SEARCH_WINDOW: f64 = 720.0;

const METADATA_FILE: &str = "wandb-metadata.json";
const MAX_SCAN_DEPTH: usize = 8;

/// Whether this job should still be probed on this tick.
pub fn should_search(job: &Job) -> bool {
    if !job.search_wandb || job.wandb_url.is_some() {
        return false;
    }
    match job.started_at {
        Some(started_at) => now_ts() - started_at <= SEARCH_WINDOW,
        None => false,
    }
}

/// Scan the job tree for a metadata file naming this job and build the run
/// URL from it. Blocking filesystem walk; call from `spawn_blocking`.
pub fn find_run_url(job: &Job) -> Result<Option<String>> {
    let Some(dir) = job.dir.as_deref() else {
        return Ok(None);
    };
    let Some(entity) = job.env.get("WANDB_ENTITY") else {
        return Ok(None);
    };

    let mut metadata_files = Vec::new();
    collect_metadata_files(dir, 0, &mut metadata_files);

    for path in metadata_files {
        let Ok(content) = std::fs::read_to_string(&path) else {
            continue;
        };
        if !content.contains(&job.id) {
            continue;
        }
        let Some(run_id) = run_id_from_path(&path) else {
            continue;
        };
        let Some(project) = project_from_metadata(&content) else {
            continue;
        };
        return Ok(Some(format!(
            "https://wandb.ai/{entity}/{project}/runs/{run_id}"
        )));
    }

    Ok(None)
}

fn collect_metadata_files(dir: &Path, depth: usize, found: &mut Vec<PathBuf>) {
    if depth > MAX_SCAN_DEPTH {
        return;
    }
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_metadata_files(&path, depth + 1, found);
        } else if path.file_name().and_then(|n| n.to_str()) == Some(METADATA_FILE) {
            found.push(path);
        }
    }
}

/// Run directories are named `run-<timestamp>-<run_id>`; the metadata file
/// sits in `<run dir>/files/`.
fn run_id_from_path(metadata_path: &Path) -> Option<String> {
    let run_dir = metadata_path.parent()?.parent()?;
    let name = run_dir.file_name()?.to_str()?;
    let run_id = name.rsplit('-').next()?;
    if run_id.is_empty() {
        None
    } else {
        Some(run_id.to_string())
    }
}

fn project_from_metadata(content: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(content).ok()?;
    value
        .get("project")
        .and_then(|p| p.as_str())
        .map(String::from)
}
