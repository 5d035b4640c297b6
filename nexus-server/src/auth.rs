//! Auth gate
//!
//! Single bearer token, generated at first boot and persisted with 0600
//! permissions under the server home. Requests from loopback peers bypass
//! the check so local tooling works without configuration; everything else
//! must present `Authorization: Bearer <token>`.

use std::net::SocketAddr;
use std::path::Path;

use anyhow::{Context, Result};
use axum::extract::{ConnectInfo, Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use rand::Rng;

use crate::api::AppState;

const TOKEN_LENGTH: usize = 48;

/// Load the API token, generating and persisting one on first boot.
pub fn ensure_token(path: &Path) -> Result<String> {
    if path.exists() {
        let token = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let token = token.trim().to_string();
        if !token.is_empty() {
            return Ok(token);
        }
    }

    let token: String = rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(TOKEN_LENGTH)
        .map(char::from)
        .collect();

    std::fs::write(path, &token).with_context(|| format!("Failed to write {}", path.display()))?;
    set_owner_only(path)?;

    tracing::info!("Generated new API token at {}", path.display());
    Ok(token)
}

fn set_owner_only(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .with_context(|| format!("Failed to chmod {}", path.display()))
}

/// Axum middleware enforcing the bearer token on non-loopback peers.
pub async fn require_bearer(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    if addr.ip().is_loopback() {
        return next.run(request).await;
    }

    let presented = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));

    match presented {
        Some(token) if token == state.token.as_str() => next.run(request).await,
        _ => (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({ "error": "missing or invalid bearer token" })),
        )
            .into_response(),
    }
}

/// Append a public key to the server user's `authorized_keys`, enabling
/// later SSH session attach from remote clients. Returns false when the key
/// is already present.
pub fn authorize_ssh_key(public_key: &str) -> Result<bool> {
    let key = public_key.trim();
    if key.is_empty() || key.contains('\n') {
        anyhow::bail!("public key must be a single non-empty line");
    }
    if !key.starts_with("ssh-") && !key.starts_with("ecdsa-") {
        anyhow::bail!("unrecognized public key format");
    }

    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    let ssh_dir = Path::new(&home).join(".ssh");
    std::fs::create_dir_all(&ssh_dir)
        .with_context(|| format!("Failed to create {}", ssh_dir.display()))?;
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&ssh_dir, std::fs::Permissions::from_mode(0o700))?;
    }

    let keys_file = ssh_dir.join("authorized_keys");
    let existing = if keys_file.exists() {
        std::fs::read_to_string(&keys_file)
            .with_context(|| format!("Failed to read {}", keys_file.display()))?
    } else {
        String::new()
    };

    if existing.lines().any(|line| line.trim() == key) {
        return Ok(false);
    }

    let mut updated = existing;
    if !updated.is_empty() && !updated.ends_with('\n') {
        updated.push('\n');
    }
    updated.push_str(key);
    updated.push('\n');

    std::fs::write(&keys_file, updated)
        .with_context(|| format!("Failed to write {}", keys_file.display()))?;
    set_owner_only(&keys_file)?;

    Ok(true)
}
