//! API Module
//!
//! HTTP API layer for the server, versioned under `/v1/`.
//! Each submodule handles endpoints for a specific domain.

pub mod artifact;
pub mod error;
pub mod gpu;
pub mod health;
pub mod job;
pub mod server;

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::{
    middleware,
    routing::{get, post, put},
    Router,
};
use sqlx::SqlitePool;
use tower_http::trace::TraceLayer;

use crate::auth;
use crate::config::NexusConfig;
use crate::gpu::GpuProbe;
use crate::service::artifact::MAX_ARTIFACT_BYTES;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub pool: SqlitePool,
    pub config: Arc<NexusConfig>,
    pub probe: Arc<GpuProbe>,
    pub token: Arc<String>,
    pub health_cache: Arc<health::HealthCache>,
}

/// Create the main API router with all endpoints
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Server endpoints
        .route("/v1/server/status", get(server::status))
        .route("/v1/server/logs", get(server::logs))
        .route("/v1/server/ssh-keys", post(server::add_ssh_key))
        // Job endpoints
        .route("/v1/jobs", get(job::list_jobs).post(job::create_job))
        .route(
            "/v1/jobs/{id}",
            get(job::get_job)
                .patch(job::patch_job)
                .delete(job::delete_job),
        )
        .route("/v1/jobs/{id}/kill", post(job::kill_job))
        .route("/v1/jobs/{id}/logs", get(job::job_logs))
        // Artifact endpoints
        .route("/v1/artifacts", post(artifact::upload_artifact))
        // GPU endpoints
        .route("/v1/gpus", get(gpu::list_gpus))
        .route(
            "/v1/gpus/{idx}/blacklist",
            put(gpu::blacklist_gpu).delete(gpu::unblacklist_gpu),
        )
        // Health
        .route("/v1/health", get(health::health))
        // State and middleware
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_bearer,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(MAX_ARTIFACT_BYTES))
        .with_state(state)
}
