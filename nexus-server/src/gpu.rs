//! GPU probe
//!
//! Shells out to nvidia-smi for device stats and per-GPU process counts.
//! Results are cached in-process with a short TTL so concurrent scheduler
//! tasks and HTTP handlers do not stampede the vendor tool; a single writer
//! refreshes under the cache mutex while readers reuse the last snapshot.
//!
//! When the server is configured with `mock_gpus` (the `MOCK_GPUS=N`
//! environment variable), the probe deterministically produces N synthetic
//! idle GPUs instead of touching hardware.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::process::Command;
use tokio::sync::Mutex;

/// Raw device reading, before blacklist/ownership overlay.
#[derive(Debug, Clone)]
pub struct GpuReading {
    pub index: u32,
    pub name: String,
    pub memory_total: u64,
    pub memory_used: u64,
    pub process_count: u32,
}

struct CachedSnapshot {
    taken_at: Instant,
    readings: Vec<GpuReading>,
}

pub struct GpuProbe {
    cache: Mutex<Option<CachedSnapshot>>,
    ttl: Duration,
    mock_gpus: Option<u32>,
}

impl GpuProbe {
    pub fn new(mock_gpus: Option<u32>) -> Self {
        Self {
            cache: Mutex::new(None),
            ttl: Duration::from_secs(1),
            mock_gpus,
        }
    }

    #[cfg(test)]
    pub fn with_ttl(mock_gpus: Option<u32>, ttl: Duration) -> Self {
        Self {
            cache: Mutex::new(None),
            ttl,
            mock_gpus,
        }
    }

    /// Current readings, served from cache while it is fresh.
    pub async fn snapshot(&self, force_refresh: bool) -> Result<Vec<GpuReading>> {
        let mut cache = self.cache.lock().await;

        if !force_refresh {
            if let Some(cached) = cache.as_ref() {
                if cached.taken_at.elapsed() < self.ttl {
                    return Ok(cached.readings.clone());
                }
            }
        }

        let readings = match self.mock_gpus {
            Some(n) => mock_readings(n),
            None => probe_hardware().await?,
        };

        *cache = Some(CachedSnapshot {
            taken_at: Instant::now(),
            readings: readings.clone(),
        });

        Ok(readings)
    }
}

fn mock_readings(count: u32) -> Vec<GpuReading> {
    (0..count)
        .map(|index| GpuReading {
            index,
            name: format!("Mock GPU {index}"),
            memory_total: 8192,
            memory_used: 1,
            process_count: 0,
        })
        .collect()
}

async fn probe_hardware() -> Result<Vec<GpuReading>> {
    let stats = run_command(
        "nvidia-smi",
        &[
            "--query-gpu=index,name,memory.total,memory.used",
            "--format=csv,noheader,nounits",
        ],
    )
    .await?;

    if stats.trim().is_empty() {
        anyhow::bail!("nvidia-smi returned no output; are GPUs present?");
    }

    let processes = fetch_gpu_processes().await.unwrap_or_else(|e| {
        tracing::warn!("Failed to count GPU processes: {e:#}");
        HashMap::new()
    });

    let mut readings = Vec::new();
    for line in stats.lines().filter(|l| !l.trim().is_empty()) {
        match parse_stats_line(line, &processes) {
            Ok(reading) => readings.push(reading),
            Err(e) => tracing::warn!("Skipping unparseable nvidia-smi line {line:?}: {e:#}"),
        }
    }

    if readings.is_empty() {
        tracing::warn!("No GPUs detected on this system");
    }

    Ok(readings)
}

fn parse_stats_line(line: &str, processes: &HashMap<u32, u32>) -> Result<GpuReading> {
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    if fields.len() != 4 {
        anyhow::bail!("expected 4 fields, got {}", fields.len());
    }

    let index: u32 = fields[0].parse().context("bad index")?;
    Ok(GpuReading {
        index,
        name: fields[1].to_string(),
        memory_total: fields[2].parse::<f64>().context("bad memory.total")? as u64,
        memory_used: fields[3].parse::<f64>().context("bad memory.used")? as u64,
        process_count: processes.get(&index).copied().unwrap_or(0),
    })
}

/// One `pmon` sample: count processes per GPU index. Lines whose second
/// column is `-` are idle placeholders.
async fn fetch_gpu_processes() -> Result<HashMap<u32, u32>> {
    let output = run_command("nvidia-smi", &["pmon", "-c", "1"]).await?;

    let mut counts: HashMap<u32, u32> = HashMap::new();
    for line in output.lines().skip(2) {
        let mut parts = line.split_whitespace();
        let (Some(idx), Some(pid)) = (parts.next(), parts.next()) else {
            continue;
        };
        if pid == "-" {
            continue;
        }
        if let Ok(idx) = idx.parse::<u32>() {
            *counts.entry(idx).or_insert(0) += 1;
        }
    }

    Ok(counts)
}

async fn run_command(program: &str, args: &[&str]) -> Result<String> {
    let output = tokio::time::timeout(
        Duration::from_secs(5),
        Command::new(program).args(args).output(),
    )
    .await
    .with_context(|| format!("{program} timed out"))?
    .with_context(|| format!("Failed to execute {program}"))?;

    if !output.status.success() {
        anyhow::bail!(
            "{program} exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
