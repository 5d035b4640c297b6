//! Nexus Server
//!
//! Single-node GPU job scheduler: accepts shell jobs over HTTP, queues
//! them, allocates GPUs, launches each job in a detached terminal session,
//! watches it to completion, and preserves logs and metadata.
//!
//! Architecture:
//! - Repositories: sqlite persistence for jobs, the GPU blacklist, artifacts
//! - Services: validation and state rules between HTTP and the store
//! - Engine: job lifecycle transitions (launch, classify, clean up)
//! - Scheduler: the periodic control loop advancing all jobs
//! - API: thin axum handlers under `/v1/`

pub mod api;
pub mod auth;
pub mod config;
pub mod db;
pub mod engine;
pub mod gpu;
pub mod notifications;
pub mod repository;
pub mod scheduler;
pub mod service;
pub mod session;
pub mod system;
pub mod wandb;
