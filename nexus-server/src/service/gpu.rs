//! GPU Service
//!
//! Overlays raw probe readings with scheduler state: blacklist membership
//! and which running job owns each index.

use std::collections::HashMap;

use nexus_core::domain::gpu::GpuInfo;
use nexus_core::domain::job::JobStatus;
use nexus_core::dto::server::GpuStatusResponse;
use sqlx::SqlitePool;

use crate::gpu::GpuProbe;
use crate::repository::{gpu_repository, job_repository};

/// Service error type
#[derive(Debug)]
pub enum GpuError {
    Probe(String),
    Database(sqlx::Error),
}

impl From<sqlx::Error> for GpuError {
    fn from(err: sqlx::Error) -> Self {
        GpuError::Database(err)
    }
}

impl std::fmt::Display for GpuError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GpuError::Probe(msg) => write!(f, "GPU probe failed: {msg}"),
            GpuError::Database(err) => write!(f, "database error: {err}"),
        }
    }
}

impl std::error::Error for GpuError {}

/// Full GPU view: probe readings plus blacklist and ownership overlay.
pub async fn list_gpus(
    pool: &SqlitePool,
    probe: &GpuProbe,
    force_refresh: bool,
) -> Result<Vec<GpuInfo>, GpuError> {
    let readings = probe
        .snapshot(force_refresh)
        .await
        .map_err(|e| GpuError::Probe(format!("{e:#}")))?;

    let blacklist = gpu_repository::list(pool).await?;

    let running = job_repository::find_by_status(pool, JobStatus::Running).await?;
    let mut owners: HashMap<u32, String> = HashMap::new();
    for job in &running {
        for idx in &job.gpu_idxs {
            owners.insert(*idx, job.id.clone());
        }
    }

    Ok(readings
        .into_iter()
        .map(|r| GpuInfo {
            is_blacklisted: blacklist.contains(&r.index),
            running_job_id: owners.get(&r.index).cloned(),
            index: r.index,
            name: r.name,
            memory_total: r.memory_total,
            memory_used: r.memory_used,
            process_count: r.process_count,
        })
        .collect())
}

/// Idempotent blacklist toggle.
pub async fn set_blacklist(
    pool: &SqlitePool,
    gpu_idx: u32,
    blacklisted: bool,
) -> Result<GpuStatusResponse, GpuError> {
    let changed = if blacklisted {
        gpu_repository::add(pool, gpu_idx).await?
    } else {
        gpu_repository::remove(pool, gpu_idx).await?
    };

    if changed {
        tracing::info!(
            "GPU {gpu_idx} {} the blacklist",
            if blacklisted { "added to" } else { "removed from" }
        );
    }

    Ok(GpuStatusResponse {
        gpu_idx,
        blacklisted,
        changed,
    })
}
