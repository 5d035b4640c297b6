//! Shared helpers for integration tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use nexus_core::dto::job::JobRequest;
use nexus_server::config::NexusConfig;
use nexus_server::db;
use nexus_server::gpu::GpuProbe;
use nexus_server::notifications::Notifier;
use nexus_server::scheduler::Scheduler;
use nexus_server::session::SessionBackend;
use sqlx::SqlitePool;

/// File-backed pool in a temp home, with migrations applied.
pub async fn test_pool(home: &Path) -> SqlitePool {
    let pool = db::create_pool(&home.join("jobs.db")).await.unwrap();
    db::run_migrations(&pool).await.unwrap();
    pool
}

pub fn test_config(home: &Path, mock_gpus: u32) -> NexusConfig {
    let mut config = NexusConfig::new(home.to_path_buf());
    config.node_name = "test-node".to_string();
    config.refresh_rate = 1;
    config.mock_gpus = Some(mock_gpus);
    config
}

pub fn test_scheduler(
    pool: SqlitePool,
    config: NexusConfig,
    session: Arc<dyn SessionBackend>,
) -> Scheduler {
    let mock_gpus = config.mock_gpus;
    Scheduler::new(
        pool,
        Arc::new(config),
        session,
        Arc::new(GpuProbe::new(mock_gpus)),
        Arc::new(Notifier::new()),
    )
}

pub fn job_request(command: &str, artifact_id: &str) -> JobRequest {
    JobRequest {
        command: command.to_string(),
        user: "testuser".to_string(),
        artifact_id: artifact_id.to_string(),
        git_repo_url: "https://example.com/repo.git".to_string(),
        git_tag: "v1".to_string(),
        git_branch: "main".to_string(),
        num_gpus: 1,
        gpu_idxs: None,
        priority: 0,
        search_wandb: false,
        notifications: vec![],
        env: HashMap::new(),
        jobrc: None,
        run_immediately: false,
        ignore_blacklist: false,
        output_file: None,
    }
}

/// Minimal tar archive holding one source file.
pub fn source_tarball() -> Vec<u8> {
    let mut data = Vec::new();
    {
        let mut builder = tar::Builder::new(&mut data);
        let content = b"print('hello from nexus')\n";
        let mut header = tar::Header::new_gnu();
        header.set_path("train.py").unwrap();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append(&header, content.as_slice()).unwrap();
        builder.finish().unwrap();
    }
    data
}
