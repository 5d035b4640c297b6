//! Scheduler
//!
//! The control loop that advances job state. Every `refresh_rate` seconds a
//! tick runs four tasks concurrently:
//!
//! 1. advance running jobs (observe session exits, finalize, clean up)
//! 2. start queued jobs (allocate GPUs, launch; at most one start per tick)
//! 3. discover W&B run URLs for running jobs that asked for it
//! 4. sample system health
//!
//! Tasks only read disjoint status sets from the store (running vs queued),
//! so a job is never both finalized and launched within one tick. Errors are
//! isolated per job: one bad job logs and moves on, it never wedges the
//! loop.

use std::sync::Arc;

use anyhow::{Context, Result};
use nexus_core::domain::gpu::GpuInfo;
use nexus_core::domain::job::{Job, JobStatus};
use nexus_core::dto::health::HealthStatus;
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::NexusConfig;
use crate::engine;
use crate::gpu::GpuProbe;
use crate::notifications::{JobAction, Notifier, DISCORD_START_MESSAGE};
use crate::repository::job_repository;
use crate::service::{artifact_service, gpu_service};
use crate::session::SessionBackend;
use crate::{system, wandb};

pub struct Scheduler {
    pool: SqlitePool,
    config: Arc<NexusConfig>,
    session: Arc<dyn SessionBackend>,
    probe: Arc<GpuProbe>,
    notifier: Arc<Notifier>,
}

impl Scheduler {
    pub fn new(
        pool: SqlitePool,
        config: Arc<NexusConfig>,
        session: Arc<dyn SessionBackend>,
        probe: Arc<GpuProbe>,
        notifier: Arc<Notifier>,
    ) -> Self {
        Self {
            pool,
            config,
            session,
            probe,
            notifier,
        }
    }

    /// Run until the shutdown token fires. The token is only observed
    /// between ticks; in-flight external calls finish on their own
    /// timeouts.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            "Scheduler started (tick interval: {:?})",
            self.config.refresh_interval()
        );

        if let Err(e) = self.reconcile_orphans().await {
            error!("Orphan reconciliation failed: {e:#}");
        }

        let mut interval = tokio::time::interval(self.config.refresh_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Scheduler stopping");
                    return;
                }
                _ = interval.tick() => {
                    self.tick().await;
                }
            }
        }
    }

    /// One scheduling pass. Public so tests can drive the loop manually.
    pub async fn tick(&self) {
        let (advance, start, tracker, health) = tokio::join!(
            self.advance_running_jobs(),
            self.start_queued_jobs(),
            self.discover_wandb_urls(),
            self.probe_system_health(),
        );

        for (task, result) in [
            ("advance", advance),
            ("start", start),
            ("wandb", tracker),
            ("health", health),
        ] {
            if let Err(e) = result {
                error!("Scheduler {task} task failed: {e:#}");
            }
        }
    }

    // =========================================================================
    // Task 1: advance running jobs
    // =========================================================================

    async fn advance_running_jobs(&self) -> Result<()> {
        let running = job_repository::find_by_status(&self.pool, JobStatus::Running)
            .await
            .context("Failed to list running jobs")?;

        for job in running {
            if let Err(e) = self.advance_one(&job).await {
                warn!("Failed to advance job {}: {e:#}", job.id);
            }
        }

        Ok(())
    }

    async fn advance_one(&self, job: &Job) -> Result<()> {
        let alive = self.session.is_alive(&job.session_name()).await?;

        if alive && !job.marked_for_kill {
            return Ok(());
        }

        let killed = job.marked_for_kill;
        if killed && alive {
            engine::kill_job(self.session.as_ref(), job)
                .await
                .with_context(|| format!("Failed to kill session for job {}", job.id))?;
        }

        let ended = engine::end_job(job, killed);

        // The declared output file has to leave the repo tree before
        // cleanup removes it. Copy problems are logged, never fatal.
        if ended.status == JobStatus::Completed && ended.output_file.is_some() {
            match engine::copy_output_file(&ended) {
                Ok(Some(dest)) => info!("Copied output of job {} to {}", ended.id, dest.display()),
                Ok(None) => {}
                Err(e) => warn!("Failed to copy output file for job {}: {e:#}", ended.id),
            }
        }

        engine::cleanup_job(&ended);

        let action = match ended.status {
            JobStatus::Completed => JobAction::Completed,
            JobStatus::Killed => JobAction::Killed,
            _ => JobAction::Failed,
        };

        match ended.status {
            JobStatus::Completed => info!(
                "Job {} completed (exit code {:?}, GPUs {:?})",
                ended.id, ended.exit_code, ended.gpu_idxs
            ),
            JobStatus::Killed => info!("Job {} killed (GPUs {:?})", ended.id, ended.gpu_idxs),
            _ => error!(
                "Job {} failed: {} (GPUs {:?})",
                ended.id,
                ended.error_message.as_deref().unwrap_or("unknown error"),
                ended.gpu_idxs
            ),
        }

        let finalized = if ended.notifications.is_empty() {
            ended
        } else {
            self.notifier.notify_job_action(&ended, action).await
        };

        job_repository::update(&self.pool, &finalized)
            .await
            .context("Failed to persist finalized job")?;

        Ok(())
    }

    // =========================================================================
    // Task 2: start queued jobs
    // =========================================================================

    async fn start_queued_jobs(&self) -> Result<()> {
        let queued = job_repository::find_by_status(&self.pool, JobStatus::Queued)
            .await
            .context("Failed to list queued jobs")?;

        if queued.is_empty() {
            debug!("No jobs in queue");
            return Ok(());
        }

        let gpus = gpu_service::list_gpus(&self.pool, &self.probe, false)
            .await
            .context("Failed to snapshot GPUs")?;

        // Queue is already in dequeue order; take the first job whose
        // requirements the free set can satisfy. One start per tick keeps
        // launches bounded; a long queue drains over successive ticks.
        let Some((job, gpu_idxs)) = queued
            .iter()
            .find_map(|job| choose_gpus(job, &gpus).map(|idxs| (job, idxs)))
        else {
            debug!("No queued job can be placed on the available GPUs");
            return Ok(());
        };

        let artifact = match artifact_service::get_artifact_data(&self.pool, &job.artifact_id).await
        {
            Ok(data) => data,
            Err(e) => {
                let failed = engine::fail_job(job, format!("artifact unavailable: {e}"));
                error!("Job {} failed before start: {e}", job.id);
                job_repository::update(&self.pool, &failed).await?;
                return Ok(());
            }
        };

        let job_dir = self.config.job_dir(&job.id);
        match engine::start_job(self.session.as_ref(), job, &gpu_idxs, job_dir, artifact).await {
            Ok(started) => {
                job_repository::update(&self.pool, &started).await?;
                info!(
                    "Job {} started on GPUs {:?} (session {})",
                    started.id,
                    started.gpu_idxs,
                    started.screen_session_name.as_deref().unwrap_or("?")
                );

                if !started.notifications.is_empty() {
                    let with_messages = self
                        .notifier
                        .notify_job_action(&started, JobAction::Started)
                        .await;
                    job_repository::update(&self.pool, &with_messages).await?;
                }

                let remaining =
                    job_repository::count_by_status(&self.pool, JobStatus::Queued).await?;
                info!("Remaining queued jobs: {remaining}");
            }
            Err(e) => {
                let failed = engine::fail_job(job, format!("launch failed: {e:#}"));
                error!("Failed to launch job {}: {e:#}", job.id);
                job_repository::update(&self.pool, &failed).await?;
            }
        }

        Ok(())
    }

    // =========================================================================
    // Task 3: W&B run discovery
    // =========================================================================

    async fn discover_wandb_urls(&self) -> Result<()> {
        let running = job_repository::find_by_status(&self.pool, JobStatus::Running)
            .await
            .context("Failed to list running jobs")?;

        for job in running {
            if !wandb::should_search(&job) {
                continue;
            }

            let search_job = job.clone();
            let found = tokio::task::spawn_blocking(move || wandb::find_run_url(&search_job))
                .await
                .context("W&B scan task panicked")?;

            let url = match found {
                Ok(Some(url)) => url,
                Ok(None) => continue,
                Err(e) => {
                    warn!("W&B scan failed for job {}: {e:#}", job.id);
                    continue;
                }
            };

            info!("Associated job {} with W&B run {url}", job.id);
            let updated = Job {
                wandb_url: Some(url),
                ..job
            };
            job_repository::update(&self.pool, &updated).await?;

            if updated.notification_messages.contains_key(DISCORD_START_MESSAGE) {
                if let Err(e) = self.notifier.update_notification_with_wandb(&updated).await {
                    warn!(
                        "Failed to edit started notification for job {}: {e:#}",
                        updated.id
                    );
                }
            }
        }

        Ok(())
    }

    // =========================================================================
    // Task 4: system health
    // =========================================================================

    async fn probe_system_health(&self) -> Result<()> {
        let health = tokio::task::spawn_blocking(system::check_health)
            .await
            .context("Health probe task panicked")??;

        match health.status {
            HealthStatus::Healthy => debug!("System health: {:.1}", health.score),
            HealthStatus::Degraded => {
                warn!("System health degraded (score {:.1})", health.score)
            }
            HealthStatus::Unhealthy => {
                warn!("System unhealthy (score {:.1})", health.score)
            }
        }

        Ok(())
    }

    // =========================================================================
    // Startup reconciliation
    // =========================================================================

    /// Finalize jobs left `running` by a previous server instance. Dead
    /// sessions are recorded as failed; live ones are killed first rather
    /// than re-adopted, so their GPUs come back to the pool.
    pub async fn reconcile_orphans(&self) -> Result<()> {
        let running = job_repository::find_by_status(&self.pool, JobStatus::Running)
            .await
            .context("Failed to list running jobs")?;

        for job in running {
            let alive = self
                .session
                .is_alive(&job.session_name())
                .await
                .unwrap_or(false);
            if alive {
                warn!("Killing orphaned live session for job {}", job.id);
                if let Err(e) = engine::kill_job(self.session.as_ref(), &job).await {
                    warn!("Failed to kill orphaned session for job {}: {e:#}", job.id);
                }
            }

            let failed = engine::fail_job(&job, "orphaned by restart");
            engine::cleanup_job(&failed);
            job_repository::update(&self.pool, &failed).await?;
            warn!("Job {} orphaned by restart, recorded as failed", job.id);
        }

        Ok(())
    }
}

/// Pick GPUs for a job from an overlaid snapshot, or `None` when the job
/// cannot be placed this tick. Pinned requests are exact-match: every pinned
/// index must be available. Unpinned requests take the lowest free indices.
fn choose_gpus(job: &Job, gpus: &[GpuInfo]) -> Option<Vec<u32>> {
    let mut available: Vec<u32> = gpus
        .iter()
        .filter(|g| g.is_available(job.ignore_blacklist))
        .map(|g| g.index)
        .collect();
    available.sort_unstable();

    if !job.gpu_idxs.is_empty() {
        let all_available = job.gpu_idxs.iter().all(|idx| available.contains(idx));
        return all_available.then(|| job.gpu_idxs.clone());
    }

    if job.num_gpus as usize <= available.len() {
        Some(available[..job.num_gpus as usize].to_vec())
    } else {
        None
    }
}
