//! Server and GPU endpoint DTOs

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerStatusResponse {
    pub gpu_count: usize,
    pub queued_jobs: u64,
    pub running_jobs: u64,
    pub completed_jobs: u64,
    pub node_name: String,
    pub server_user: String,
    pub server_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerLogsResponse {
    pub logs: String,
}

/// Result of a blacklist PUT/DELETE.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpuStatusResponse {
    pub gpu_idx: u32,
    pub blacklisted: bool,
    /// False when the call was a no-op (already in the requested state).
    pub changed: bool,
}

/// Body for `POST /v1/server/ssh-keys`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshKeyRequest {
    pub public_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshKeyResponse {
    pub added: bool,
}
