//! Job endpoint DTOs

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::domain::job::NotificationType;

/// Request body for `POST /v1/jobs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRequest {
    pub command: String,
    pub user: String,
    pub artifact_id: String,
    pub git_repo_url: String,
    pub git_tag: String,
    pub git_branch: String,
    #[serde(default = "default_num_gpus")]
    pub num_gpus: u32,
    /// Pinned GPU indices. When set, the length must equal `num_gpus` and
    /// the job only starts once every pinned index is available.
    #[serde(default)]
    pub gpu_idxs: Option<Vec<u32>>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub search_wandb: bool,
    #[serde(default)]
    pub notifications: Vec<NotificationType>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub jobrc: Option<String>,
    #[serde(default)]
    pub run_immediately: bool,
    #[serde(default)]
    pub ignore_blacklist: bool,
    #[serde(default)]
    pub output_file: Option<String>,
}

fn default_num_gpus() -> u32 {
    1
}

/// Body for `PATCH /v1/jobs/{id}`. Only queued jobs can be edited.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobPatch {
    pub command: Option<String>,
    pub priority: Option<i32>,
}

/// Query parameters for `GET /v1/jobs`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobListQuery {
    pub status: Option<String>,
    pub gpu_index: Option<u32>,
    pub command_regex: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

/// Query parameters for `GET /v1/jobs/{id}/logs`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobLogsQuery {
    pub last_n_lines: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobLogsResponse {
    pub logs: String,
}

/// Response for `POST /v1/artifacts`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactUploadResponse {
    pub artifact_id: String,
    pub size: u64,
}
