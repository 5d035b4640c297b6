//! GPU snapshot types

use serde::{Deserialize, Serialize};

/// Point-in-time view of one GPU, as reported by the probe and overlaid with
/// scheduler state (blacklist membership, owning job).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpuInfo {
    pub index: u32,
    pub name: String,
    /// Total memory in MiB.
    pub memory_total: u64,
    /// Used memory in MiB.
    pub memory_used: u64,
    /// Number of processes currently holding the GPU, including ones Nexus
    /// did not start.
    pub process_count: u32,
    pub is_blacklisted: bool,
    pub running_job_id: Option<String>,
}

impl GpuInfo {
    /// Whether this GPU can be handed to a new job.
    ///
    /// A GPU is available iff it is not blacklisted (or the candidate job
    /// opts out of the blacklist), no running job owns it, and no stray
    /// process holds it.
    pub fn is_available(&self, ignore_blacklist: bool) -> bool {
        (!self.is_blacklisted || ignore_blacklist)
            && self.running_job_id.is_none()
            && self.process_count == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gpu(blacklisted: bool, job: Option<&str>, processes: u32) -> GpuInfo {
        GpuInfo {
            index: 0,
            name: "Test GPU".to_string(),
            memory_total: 8192,
            memory_used: 1,
            process_count: processes,
            is_blacklisted: blacklisted,
            running_job_id: job.map(String::from),
        }
    }

    #[test]
    fn test_free_gpu_is_available() {
        assert!(gpu(false, None, 0).is_available(false));
    }

    #[test]
    fn test_blacklist_blocks_unless_ignored() {
        assert!(!gpu(true, None, 0).is_available(false));
        assert!(gpu(true, None, 0).is_available(true));
    }

    #[test]
    fn test_owned_gpu_is_never_available() {
        assert!(!gpu(false, Some("abc123"), 0).is_available(false));
        assert!(!gpu(false, Some("abc123"), 0).is_available(true));
    }

    #[test]
    fn test_stray_process_blocks() {
        assert!(!gpu(false, None, 2).is_available(false));
    }
}
