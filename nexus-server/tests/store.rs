//! Store integration tests: round trips, ordering contracts, state rules,
//! and artifact garbage collection against a real sqlite file.

mod common;

use nexus_core::domain::job::{Job, JobStatus, NotificationType};
use nexus_core::dto::job::{JobListQuery, JobPatch};
use nexus_server::engine;
use nexus_server::repository::{artifact_repository, gpu_repository, job_repository};
use nexus_server::service::{artifact_service, job_service};

use common::{job_request, source_tarball, test_pool};

fn queued_job(id: &str, priority: i32, created_at: f64) -> Job {
    let mut job = engine::create_job(&job_request("echo hi", "art-1"), id.to_string(), "node");
    job.priority = priority;
    job.created_at = created_at;
    job
}

#[tokio::test]
async fn test_insert_and_get_round_trip() {
    let home = tempfile::tempdir().unwrap();
    let pool = test_pool(home.path()).await;

    let mut request = job_request("python train.py --epochs 10", "art-9");
    request.env.insert("WANDB_API_KEY".to_string(), "k".to_string());
    request.env.insert("WANDB_ENTITY".to_string(), "team".to_string());
    request
        .env
        .insert("DISCORD_WEBHOOK_URL".to_string(), "https://w".to_string());
    request
        .env
        .insert("DISCORD_USER_ID".to_string(), "7".to_string());
    request.notifications = vec![NotificationType::Discord];
    request.search_wandb = true;
    request.jobrc = Some("module load cuda".to_string());
    request.output_file = Some("out/metrics.json".to_string());
    request.priority = 3;

    let job = job_service::create_job(&pool, &request, "node-a").await.unwrap();

    let loaded = job_repository::find_by_id(&pool, &job.id).await.unwrap().unwrap();
    assert_eq!(loaded.command, "python train.py --epochs 10");
    assert_eq!(loaded.user, "testuser");
    assert_eq!(loaded.node_name, "node-a");
    assert_eq!(loaded.priority, 3);
    assert_eq!(loaded.status, JobStatus::Queued);
    assert_eq!(loaded.artifact_id, "art-9");
    assert_eq!(loaded.notifications, vec![NotificationType::Discord]);
    assert!(loaded.search_wandb);
    assert_eq!(loaded.jobrc.as_deref(), Some("module load cuda"));
    assert_eq!(loaded.output_file.as_deref(), Some("out/metrics.json"));
    assert_eq!(loaded.env.get("WANDB_ENTITY").map(String::as_str), Some("team"));
    assert!(loaded.gpu_idxs.is_empty());
    assert!(loaded.pid.is_none());
}

#[tokio::test]
async fn test_duplicate_insert_fails() {
    let home = tempfile::tempdir().unwrap();
    let pool = test_pool(home.path()).await;

    let job = queued_job("dupe01", 0, 1000.0);
    job_repository::insert(&pool, &job).await.unwrap();
    assert!(job_repository::insert(&pool, &job).await.is_err());
}

#[tokio::test]
async fn test_queued_ordering_is_dequeue_order() {
    let home = tempfile::tempdir().unwrap();
    let pool = test_pool(home.path()).await;

    // Same priority resolves by age, higher priority always wins.
    job_repository::insert(&pool, &queued_job("old000", 0, 1000.0)).await.unwrap();
    job_repository::insert(&pool, &queued_job("new000", 0, 2000.0)).await.unwrap();
    job_repository::insert(&pool, &queued_job("urgent", 5, 3000.0)).await.unwrap();

    let queued = job_repository::find_by_status(&pool, JobStatus::Queued).await.unwrap();
    let ids: Vec<&str> = queued.iter().map(|j| j.id.as_str()).collect();
    assert_eq!(ids, vec!["urgent", "old000", "new000"]);
}

#[tokio::test]
async fn test_running_and_terminal_ordering() {
    let home = tempfile::tempdir().unwrap();
    let pool = test_pool(home.path()).await;

    for (id, started_at) in [("run001", 200.0), ("run002", 100.0)] {
        let mut job = queued_job(id, 0, 50.0);
        job.status = JobStatus::Running;
        job.started_at = Some(started_at);
        job.gpu_idxs = vec![0];
        job.pid = Some(1);
        job_repository::insert(&pool, &job).await.unwrap();
    }
    for (id, completed_at) in [("done01", 500.0), ("done02", 900.0)] {
        let mut job = queued_job(id, 0, 50.0);
        job.status = JobStatus::Completed;
        job.completed_at = Some(completed_at);
        job.exit_code = Some(0);
        job_repository::insert(&pool, &job).await.unwrap();
    }

    let running = job_repository::find_by_status(&pool, JobStatus::Running).await.unwrap();
    let ids: Vec<&str> = running.iter().map(|j| j.id.as_str()).collect();
    assert_eq!(ids, vec!["run002", "run001"]);

    let completed = job_repository::find_by_status(&pool, JobStatus::Completed).await.unwrap();
    let ids: Vec<&str> = completed.iter().map(|j| j.id.as_str()).collect();
    assert_eq!(ids, vec!["done02", "done01"]);
}

#[tokio::test]
async fn test_list_filters() {
    let home = tempfile::tempdir().unwrap();
    let pool = test_pool(home.path()).await;

    let mut a = queued_job("aaa111", 0, 1.0);
    a.command = "python train.py --model=gpt".to_string();
    job_repository::insert(&pool, &a).await.unwrap();

    let mut b = queued_job("bbb222", 0, 2.0);
    b.command = "bash eval.sh".to_string();
    job_repository::insert(&pool, &b).await.unwrap();

    let mut c = queued_job("ccc333", 0, 3.0);
    c.command = "python eval.py".to_string();
    c.status = JobStatus::Running;
    c.started_at = Some(4.0);
    c.gpu_idxs = vec![1];
    c.pid = Some(9);
    job_repository::insert(&pool, &c).await.unwrap();

    let by_regex = job_service::list_jobs(
        &pool,
        &JobListQuery {
            command_regex: Some("^python".to_string()),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    assert_eq!(by_regex.len(), 2);

    let by_gpu = job_service::list_jobs(
        &pool,
        &JobListQuery {
            gpu_index: Some(1),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    assert_eq!(by_gpu.len(), 1);
    assert_eq!(by_gpu[0].id, "ccc333");

    let queued_page = job_service::list_jobs(
        &pool,
        &JobListQuery {
            status: Some("queued".to_string()),
            limit: Some(1),
            offset: Some(1),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    assert_eq!(queued_page.len(), 1);
    assert_eq!(queued_page[0].id, "bbb222");

    let bad_status = job_service::list_jobs(
        &pool,
        &JobListQuery {
            status: Some("paused".to_string()),
            ..Default::default()
        },
    )
    .await;
    assert!(bad_status.is_err());

    let bad_regex = job_service::list_jobs(
        &pool,
        &JobListQuery {
            command_regex: Some("(".to_string()),
            ..Default::default()
        },
    )
    .await;
    assert!(bad_regex.is_err());
}

#[tokio::test]
async fn test_update_upserts_and_counts() {
    let home = tempfile::tempdir().unwrap();
    let pool = test_pool(home.path()).await;

    let mut job = queued_job("upsert", 0, 1.0);
    // update() on a missing id falls back to insert
    job_repository::update(&pool, &job).await.unwrap();
    assert_eq!(job_repository::count_by_status(&pool, JobStatus::Queued).await.unwrap(), 1);

    job.status = JobStatus::Running;
    job.started_at = Some(2.0);
    job.gpu_idxs = vec![0];
    job.pid = Some(4);
    job_repository::update(&pool, &job).await.unwrap();

    assert_eq!(job_repository::count_by_status(&pool, JobStatus::Queued).await.unwrap(), 0);
    assert_eq!(job_repository::count_by_status(&pool, JobStatus::Running).await.unwrap(), 1);
}

#[tokio::test]
async fn test_terminal_rows_drop_env() {
    let home = tempfile::tempdir().unwrap();
    let pool = test_pool(home.path()).await;

    let mut job = queued_job("secret", 0, 1.0);
    job.env.insert("API_SECRET".to_string(), "hunter2".to_string());
    job_repository::insert(&pool, &job).await.unwrap();

    let stored = job_repository::find_by_id(&pool, "secret").await.unwrap().unwrap();
    assert_eq!(stored.env.get("API_SECRET").map(String::as_str), Some("hunter2"));

    job.status = JobStatus::Completed;
    job.completed_at = Some(2.0);
    job.exit_code = Some(0);
    job_repository::update(&pool, &job).await.unwrap();

    let finished = job_repository::find_by_id(&pool, "secret").await.unwrap().unwrap();
    assert!(finished.env.is_empty());
}

#[tokio::test]
async fn test_patch_and_delete_are_queued_only() {
    let home = tempfile::tempdir().unwrap();
    let pool = test_pool(home.path()).await;

    let mut running = queued_job("run123", 0, 1.0);
    running.status = JobStatus::Running;
    running.started_at = Some(2.0);
    running.gpu_idxs = vec![0];
    running.pid = Some(7);
    job_repository::insert(&pool, &running).await.unwrap();

    let patch = JobPatch {
        command: Some("echo patched".to_string()),
        priority: None,
    };
    assert!(matches!(
        job_service::patch_job(&pool, "run123", &patch).await,
        Err(job_service::JobError::InvalidState(_))
    ));
    assert!(matches!(
        job_service::delete_queued_job(&pool, "run123").await,
        Err(job_service::JobError::InvalidState(_))
    ));

    let queued = queued_job("que123", 2, 1.0);
    job_repository::insert(&pool, &queued).await.unwrap();

    let patched = job_service::patch_job(
        &pool,
        "que123",
        &JobPatch {
            command: Some("echo patched".to_string()),
            priority: Some(9),
        },
    )
    .await
    .unwrap();
    assert_eq!(patched.command, "echo patched");
    assert_eq!(patched.priority, 9);

    job_service::delete_queued_job(&pool, "que123").await.unwrap();
    assert!(job_repository::find_by_id(&pool, "que123").await.unwrap().is_none());

    assert!(matches!(
        job_service::delete_queued_job(&pool, "que123").await,
        Err(job_service::JobError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_artifact_gc_requires_no_live_referents() {
    let home = tempfile::tempdir().unwrap();
    let pool = test_pool(home.path()).await;

    let tarball = source_tarball();
    let artifact = artifact_service::store_artifact(&pool, &tarball).await.unwrap();

    let mut first = queued_job("first1", 0, 1.0);
    first.artifact_id = artifact.id.clone();
    job_repository::insert(&pool, &first).await.unwrap();

    let mut second = queued_job("second", 0, 2.0);
    second.artifact_id = artifact.id.clone();
    job_repository::insert(&pool, &second).await.unwrap();

    assert!(artifact_repository::in_use(&pool, &artifact.id).await.unwrap());

    // Shared artifact survives the first delete.
    job_service::delete_queued_job(&pool, "first1").await.unwrap();
    assert!(artifact_repository::find_data(&pool, &artifact.id).await.unwrap().is_some());

    // Last referent gone: collected.
    job_service::delete_queued_job(&pool, "second").await.unwrap();
    assert!(artifact_repository::find_data(&pool, &artifact.id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_artifact_round_trip() {
    let home = tempfile::tempdir().unwrap();
    let pool = test_pool(home.path()).await;

    let tarball = source_tarball();
    let artifact = artifact_service::store_artifact(&pool, &tarball).await.unwrap();
    assert_eq!(artifact.size as usize, tarball.len());

    let data = artifact_service::get_artifact_data(&pool, &artifact.id).await.unwrap();
    assert_eq!(data, tarball);

    assert!(matches!(
        artifact_service::get_artifact_data(&pool, "missing").await,
        Err(job_service::JobError::NotFound(_))
    ));
    assert!(matches!(
        artifact_service::store_artifact(&pool, &[]).await,
        Err(job_service::JobError::Validation(_))
    ));
}

#[tokio::test]
async fn test_blacklist_is_idempotent() {
    let home = tempfile::tempdir().unwrap();
    let pool = test_pool(home.path()).await;

    assert!(gpu_repository::add(&pool, 0).await.unwrap());
    assert!(!gpu_repository::add(&pool, 0).await.unwrap());
    assert_eq!(gpu_repository::list(&pool).await.unwrap().len(), 1);

    assert!(gpu_repository::remove(&pool, 0).await.unwrap());
    assert!(!gpu_repository::remove(&pool, 0).await.unwrap());
    assert!(gpu_repository::list(&pool).await.unwrap().is_empty());
}
