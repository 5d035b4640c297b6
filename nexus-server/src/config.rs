//! Server configuration
//!
//! Configuration is layered: built-in defaults, then `config.toml` under the
//! server home, then environment variables (`NEXUS_HOME`, `MOCK_GPUS`), then
//! command-line flags. The home directory holds everything the server
//! persists: the job database, per-job directories, logs, and the API token.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Server configuration.
///
/// All intervals are configurable to allow tuning for different deployments
/// (a shared lab box vs. a personal workstation).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NexusConfig {
    /// Server home directory; everything persistent lives under it.
    pub home: PathBuf,

    /// Bind host for the HTTP API.
    pub host: String,

    /// Bind port for the HTTP API.
    pub port: u16,

    /// Identity string stamped onto every job this server runs.
    pub node_name: String,

    /// Scheduler tick interval in seconds.
    pub refresh_rate: u64,

    /// Default tracing filter when RUST_LOG is not set.
    pub log_level: String,

    /// When set, replaces the hardware probe with N synthetic GPUs.
    pub mock_gpus: Option<u32>,
}

/// Subset of [`NexusConfig`] that is persisted to `config.toml`. The home
/// path itself is never written there (the file lives inside it).
#[derive(Debug, Default, Serialize, Deserialize)]
struct ConfigFile {
    host: Option<String>,
    port: Option<u16>,
    node_name: Option<String>,
    refresh_rate: Option<u64>,
    log_level: Option<String>,
}

impl NexusConfig {
    pub fn new(home: PathBuf) -> Self {
        let node_name = hostname().unwrap_or_else(|| "nexus".to_string());
        Self {
            home,
            host: "0.0.0.0".to_string(),
            port: 54323,
            node_name,
            refresh_rate: 3,
            log_level: "nexus_server=info,tower_http=warn".to_string(),
            mock_gpus: None,
        }
    }

    /// Resolve the home directory: `NEXUS_HOME`, else `~/.nexus_server`.
    pub fn default_home() -> Result<PathBuf> {
        if let Ok(home) = std::env::var("NEXUS_HOME") {
            return Ok(PathBuf::from(home));
        }
        let user_home = std::env::var("HOME").context("HOME environment variable not set")?;
        Ok(PathBuf::from(user_home).join(".nexus_server"))
    }

    /// Load configuration for `home`, merging `config.toml` (if present) and
    /// the `MOCK_GPUS` environment variable over the defaults.
    pub fn load(home: PathBuf) -> Result<Self> {
        let mut config = Self::new(home);

        let path = config.config_file();
        if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let file: ConfigFile = toml::from_str(&raw)
                .with_context(|| format!("Failed to parse {}", path.display()))?;
            if let Some(host) = file.host {
                config.host = host;
            }
            if let Some(port) = file.port {
                config.port = port;
            }
            if let Some(node_name) = file.node_name {
                config.node_name = node_name;
            }
            if let Some(refresh_rate) = file.refresh_rate {
                config.refresh_rate = refresh_rate;
            }
            if let Some(log_level) = file.log_level {
                config.log_level = log_level;
            }
        }

        if let Ok(mock) = std::env::var("MOCK_GPUS") {
            let n = mock
                .parse::<u32>()
                .with_context(|| format!("Invalid MOCK_GPUS value: {mock}"))?;
            config.mock_gpus = Some(n);
        }

        Ok(config)
    }

    /// Create the home layout (`jobs/`, `logs/`, `config.toml`) if missing.
    pub fn materialize_home(&self) -> Result<()> {
        std::fs::create_dir_all(self.jobs_dir())
            .with_context(|| format!("Failed to create {}", self.jobs_dir().display()))?;
        std::fs::create_dir_all(self.logs_dir())
            .with_context(|| format!("Failed to create {}", self.logs_dir().display()))?;

        let path = self.config_file();
        if !path.exists() {
            let file = ConfigFile {
                host: Some(self.host.clone()),
                port: Some(self.port),
                node_name: Some(self.node_name.clone()),
                refresh_rate: Some(self.refresh_rate),
                log_level: Some(self.log_level.clone()),
            };
            let raw = toml::to_string_pretty(&file).context("Failed to serialize config")?;
            std::fs::write(&path, raw)
                .with_context(|| format!("Failed to write {}", path.display()))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_name.is_empty() {
            anyhow::bail!("node_name cannot be empty");
        }
        if self.refresh_rate == 0 {
            anyhow::bail!("refresh_rate must be greater than 0");
        }
        if self.host.is_empty() {
            anyhow::bail!("host cannot be empty");
        }
        Ok(())
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_rate)
    }

    pub fn config_file(&self) -> PathBuf {
        self.home.join("config.toml")
    }

    pub fn db_file(&self) -> PathBuf {
        self.home.join("jobs.db")
    }

    pub fn token_file(&self) -> PathBuf {
        self.home.join("api_token")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.home.join("logs")
    }

    pub fn server_log_file(&self) -> PathBuf {
        self.logs_dir().join("server.log")
    }

    /// Root for per-job working directories (`jobs/<id>/`).
    pub fn jobs_dir(&self) -> PathBuf {
        self.home.join("jobs")
    }

    pub fn job_dir(&self, job_id: &str) -> PathBuf {
        self.jobs_dir().join(job_id)
    }
}

fn hostname() -> Option<String> {
    std::fs::read_to_string("/etc/hostname")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}
