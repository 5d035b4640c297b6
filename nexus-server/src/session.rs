//! Detached terminal sessions
//!
//! Jobs run inside named, detachable terminal sessions (GNU screen) so they
//! survive the server's own restarts and stay attachable for debugging. The
//! [`SessionBackend`] trait is the seam between the scheduler and the OS;
//! [`MockSession`] replaces it in tests.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;

/// Backend for named, detachable terminal sessions.
#[async_trait]
pub trait SessionBackend: Send + Sync {
    /// Create a detached session named `name` executing `script` from
    /// `working_dir` with exactly `env` as its environment. Returns the PID
    /// of the session leader.
    async fn start(
        &self,
        name: &str,
        working_dir: &Path,
        script: &Path,
        env: &HashMap<String, String>,
    ) -> Result<i64>;

    /// Terminate the session and everything in it. Idempotent.
    async fn kill(&self, name: &str) -> Result<()>;

    /// Whether the session is still registered with the multiplexer.
    async fn is_alive(&self, name: &str) -> Result<bool>;
}

// =============================================================================
// GNU screen backend
// =============================================================================

/// Production backend driving `screen`.
pub struct ScreenSession;

impl ScreenSession {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ScreenSession {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionBackend for ScreenSession {
    async fn start(
        &self,
        name: &str,
        working_dir: &Path,
        script: &Path,
        env: &HashMap<String, String>,
    ) -> Result<i64> {
        let status = Command::new("screen")
            .arg("-dmS")
            .arg(name)
            .arg("bash")
            .arg(script)
            .current_dir(working_dir)
            .env_clear()
            .envs(env)
            .status()
            .await
            .context("Failed to execute screen")?;

        if !status.success() {
            anyhow::bail!("screen exited with {status} while creating session {name}");
        }

        // screen daemonizes immediately; give the session a moment to
        // register before asking for its PID.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let output = Command::new("pgrep")
            .arg("-f")
            .arg(name)
            .output()
            .await
            .context("Failed to execute pgrep")?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let pid = stdout
            .lines()
            .next()
            .and_then(|line| line.trim().parse::<i64>().ok())
            .with_context(|| format!("No PID found for session {name}"))?;

        Ok(pid)
    }

    async fn kill(&self, name: &str) -> Result<()> {
        // Ask screen to tear the session down, then sweep up anything that
        // ignored the quit after a short grace period.
        let _ = Command::new("screen")
            .args(["-S", name, "-X", "quit"])
            .status()
            .await;

        tokio::time::sleep(Duration::from_millis(500)).await;

        let _ = Command::new("pkill")
            .args(["-9", "-f", name])
            .status()
            .await;

        Ok(())
    }

    async fn is_alive(&self, name: &str) -> Result<bool> {
        let output = Command::new("screen")
            .arg("-ls")
            .output()
            .await
            .context("Failed to execute screen -ls")?;

        // screen -ls exits non-zero when no sessions exist; the listing text
        // is still authoritative.
        let listing = String::from_utf8_lossy(&output.stdout);
        Ok(listing.contains(name))
    }
}

// =============================================================================
// In-memory backend
// =============================================================================

#[derive(Debug, Clone)]
struct MockState {
    alive: bool,
    killed: bool,
}

/// Deterministic in-memory backend.
///
/// `start` writes an `output.log` for the session the way a real job would:
/// an instant job emits its sentinel line immediately and the session reads
/// as dead; a long-running one stays alive until killed.
pub struct MockSession {
    sessions: Mutex<HashMap<String, MockState>>,
    exit_code: Option<i32>,
    long_running: bool,
    fail_start: bool,
    next_pid: AtomicI64,
}

impl MockSession {
    /// Sessions finish instantly with the given exit code.
    pub fn instant(exit_code: i32) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            exit_code: Some(exit_code),
            long_running: false,
            fail_start: false,
            next_pid: AtomicI64::new(40_000),
        }
    }

    /// Sessions finish instantly without ever writing a sentinel.
    pub fn instant_without_sentinel() -> Self {
        Self {
            exit_code: None,
            ..Self::instant(0)
        }
    }

    /// Sessions stay alive until killed.
    pub fn long_running() -> Self {
        Self {
            long_running: true,
            ..Self::instant(0)
        }
    }

    /// Session creation itself fails.
    pub fn failing() -> Self {
        Self {
            fail_start: true,
            ..Self::instant(0)
        }
    }

    pub fn was_killed(&self, name: &str) -> bool {
        self.sessions
            .lock()
            .unwrap()
            .get(name)
            .map(|s| s.killed)
            .unwrap_or(false)
    }
}

#[async_trait]
impl SessionBackend for MockSession {
    async fn start(
        &self,
        name: &str,
        working_dir: &Path,
        _script: &Path,
        _env: &HashMap<String, String>,
    ) -> Result<i64> {
        if self.fail_start {
            anyhow::bail!("mock session refused to start");
        }

        let mut log = String::from("mock job output\n");
        if !self.long_running {
            if let Some(code) = self.exit_code {
                log.push_str(&format!("COMMAND_EXIT_CODE={code}\n"));
            }
        }
        std::fs::write(working_dir.join("output.log"), log)
            .context("Failed to write mock output log")?;

        self.sessions.lock().unwrap().insert(
            name.to_string(),
            MockState {
                alive: self.long_running,
                killed: false,
            },
        );

        Ok(self.next_pid.fetch_add(1, Ordering::SeqCst))
    }

    async fn kill(&self, name: &str) -> Result<()> {
        if let Some(state) = self.sessions.lock().unwrap().get_mut(name) {
            state.alive = false;
            state.killed = true;
        }
        Ok(())
    }

    async fn is_alive(&self, name: &str) -> Result<bool> {
        Ok(self
            .sessions
            .lock()
            .unwrap()
            .get(name)
            .map(|s| s.alive)
            .unwrap_or(false))
    }
}
