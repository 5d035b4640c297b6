//! Health endpoint DTOs

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskStats {
    pub total: u64,
    pub used: u64,
    pub free: u64,
    pub percent_used: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkStats {
    /// Round-trip time to the reference host in milliseconds; `None` when
    /// unreachable.
    pub ping_ms: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemStats {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub uptime: f64,
    pub load_avg: [f64; 3],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    /// Composite 0-100 score.
    pub score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk: Option<DiskStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<NetworkStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<SystemStats>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthQuery {
    #[serde(default)]
    pub detailed: bool,
    #[serde(default)]
    pub refresh: bool,
}
