//! Health API Handler

use std::time::{Duration, Instant};

use axum::extract::{Query, State};
use axum::Json;
use nexus_core::dto::health::{HealthQuery, HealthResponse};

use crate::api::error::{ApiError, ApiResult};
use crate::api::AppState;
use crate::system;

/// How long a health sample stays fresh for the endpoint.
pub const HEALTH_CACHE_TTL: Duration = Duration::from_secs(30);

#[derive(Default)]
pub struct HealthCache {
    inner: tokio::sync::Mutex<Option<(Instant, HealthResponse)>>,
}

impl HealthCache {
    pub async fn get(&self, refresh: bool) -> ApiResult<HealthResponse> {
        let mut cached = self.inner.lock().await;

        if !refresh {
            if let Some((taken_at, health)) = cached.as_ref() {
                if taken_at.elapsed() < HEALTH_CACHE_TTL {
                    return Ok(health.clone());
                }
            }
        }

        let health = tokio::task::spawn_blocking(system::check_health)
            .await
            .map_err(|e| ApiError::InternalError(format!("health probe panicked: {e}")))?
            .map_err(|e| ApiError::InternalError(format!("health probe failed: {e:#}")))?;

        *cached = Some((Instant::now(), health.clone()));
        Ok(health)
    }
}

/// GET /v1/health
pub async fn health(
    State(state): State<AppState>,
    Query(query): Query<HealthQuery>,
) -> ApiResult<Json<HealthResponse>> {
    let mut health = state.health_cache.get(query.refresh).await?;

    if !query.detailed {
        health.disk = None;
        health.network = None;
        health.system = None;
    }

    Ok(Json(health))
}
