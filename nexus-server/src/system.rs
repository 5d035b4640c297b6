//! System health probe
//!
//! Samples CPU, memory, disk, and network reachability and folds them into a
//! composite 0-100 score. Purely observational: the scheduler logs warnings
//! when thresholds are breached but never changes job state based on this.

use std::net::{SocketAddr, TcpStream};
use std::time::{Duration, Instant};

use anyhow::Result;
use nexus_core::dto::health::{DiskStats, HealthResponse, HealthStatus, NetworkStats, SystemStats};
use sysinfo::{Disks, System};

const PING_TARGET: &str = "8.8.8.8:53";

/// Take a full health sample. Blocking (CPU sampling sleeps briefly);
/// callers on the async runtime should wrap this in `spawn_blocking`.
pub fn check_health() -> Result<HealthResponse> {
    let disk = check_disk();
    let network = check_network();
    let system = check_system();

    let score = health_score(&disk, &network, &system);
    Ok(HealthResponse {
        status: status_for(score),
        score,
        disk: Some(disk),
        network: Some(network),
        system: Some(system),
    })
}

fn check_disk() -> DiskStats {
    let disks = Disks::new_with_refreshed_list();

    // Largest mounted filesystem stands in for "the disk jobs write to".
    let (total, free) = disks
        .iter()
        .map(|d| (d.total_space(), d.available_space()))
        .max_by_key(|(total, _)| *total)
        .unwrap_or((0, 0));

    let used = total.saturating_sub(free);
    let percent_used = if total > 0 {
        used as f64 / total as f64 * 100.0
    } else {
        0.0
    };

    DiskStats {
        total,
        used,
        free,
        percent_used,
    }
}

fn check_network() -> NetworkStats {
    let ping_ms = PING_TARGET.parse::<SocketAddr>().ok().and_then(|addr| {
        let start = Instant::now();
        TcpStream::connect_timeout(&addr, Duration::from_secs(2))
            .ok()
            .map(|_| start.elapsed().as_secs_f64() * 1000.0)
    });

    NetworkStats { ping_ms }
}

fn check_system() -> SystemStats {
    let mut sys = System::new();
    sys.refresh_memory();

    // CPU usage needs two samples with a gap between them.
    sys.refresh_cpu_usage();
    std::thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
    sys.refresh_cpu_usage();

    let memory_percent = if sys.total_memory() > 0 {
        sys.used_memory() as f64 / sys.total_memory() as f64 * 100.0
    } else {
        0.0
    };

    let load = System::load_average();

    SystemStats {
        cpu_percent: sys.global_cpu_usage() as f64,
        memory_percent,
        uptime: System::uptime() as f64,
        load_avg: [load.one, load.five, load.fifteen],
    }
}

/// Composite score: disk is weighted 40, network 30, system 30. Disk usage
/// past 80% and 90% takes escalating penalties, and a critically full disk
/// caps the whole score regardless of everything else.
pub fn health_score(disk: &DiskStats, network: &NetworkStats, system: &SystemStats) -> f64 {
    let disk_penalty = if disk.percent_used > 90.0 {
        0.2
    } else if disk.percent_used > 80.0 {
        0.5
    } else {
        1.0
    };
    let disk_score = 40.0 * (1.0 - disk.percent_used / 100.0) * disk_penalty;

    if disk.percent_used > 95.0 {
        return (disk_score.min(30.0) * 10.0).round() / 10.0;
    }

    let network_score = match network.ping_ms {
        Some(ping) => 30.0 * ((200.0 - ping) / 200.0).clamp(0.0, 1.0),
        None => 0.0,
    };

    let cpu_score = 15.0 * (1.0 - system.cpu_percent / 100.0).clamp(0.0, 1.0);
    let memory_score = 15.0 * (1.0 - system.memory_percent / 100.0).clamp(0.0, 1.0);

    let total = disk_score + network_score + cpu_score + memory_score;
    (total * 10.0).round() / 10.0
}

pub fn status_for(score: f64) -> HealthStatus {
    if score >= 75.0 {
        HealthStatus::Healthy
    } else if score >= 40.0 {
        HealthStatus::Degraded
    } else {
        HealthStatus::Unhealthy
    }
}
