//! Job domain types
//!
//! A [`Job`] is an immutable record; every lifecycle transition produces a
//! new record via struct-update syntax, and the store is the only source of
//! truth between transitions.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Job lifecycle status.
///
/// Transitions are monotone: `Queued -> Running -> {Completed, Failed,
/// Killed}`. A queued job may also move directly to `Failed` when launching
/// it fails before a session exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Killed,
}

impl JobStatus {
    /// Statuses from which no further transition is possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Killed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Killed => "killed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "killed" => Some(Self::Killed),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Destination for job lifecycle notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationType {
    Discord,
    Phone,
}

impl NotificationType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Discord => "discord",
            Self::Phone => "phone",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "discord" => Some(Self::Discord),
            "phone" => Some(Self::Phone),
            _ => None,
        }
    }
}

/// Job execution record.
///
/// Persisted by the store and shared verbatim over the API. Fields that only
/// exist in a given lifecycle phase are `Option`s; see the status invariants
/// on [`JobStatus`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub command: String,
    pub user: String,
    pub node_name: String,
    pub priority: i32,
    pub num_gpus: u32,
    /// GPU indices assigned at start. Empty while queued; set exactly once.
    pub gpu_idxs: Vec<u32>,
    pub git_repo_url: String,
    pub git_branch: String,
    pub git_tag: String,
    /// Foreign key into the artifact table; may be shared across jobs.
    pub artifact_id: String,
    pub env: HashMap<String, String>,
    /// Optional preamble sourced before the command runs.
    pub jobrc: Option<String>,
    pub notifications: Vec<NotificationType>,
    pub search_wandb: bool,
    pub ignore_blacklist: bool,
    pub status: JobStatus,
    pub created_at: f64,
    pub started_at: Option<f64>,
    pub completed_at: Option<f64>,
    /// Session-leader PID while running.
    pub pid: Option<i64>,
    /// Per-job working directory once started.
    pub dir: Option<PathBuf>,
    pub screen_session_name: Option<String>,
    pub exit_code: Option<i32>,
    pub error_message: Option<String>,
    pub wandb_url: Option<String>,
    /// Set out-of-band by the kill endpoint, consumed by the scheduler.
    pub marked_for_kill: bool,
    /// Channel identifier -> message identifier, kept so notifications can
    /// be edited after the fact (e.g. to append a tracker URL).
    pub notification_messages: HashMap<String, String>,
    /// Relative path inside the repo tree; copied out on successful
    /// completion.
    pub output_file: Option<String>,
}

impl Job {
    /// Name of the detached terminal session that hosts this job.
    pub fn session_name(&self) -> String {
        format!("nexus_job_{}", self.id)
    }
}
