//! Handlers for engine-wide status: degradation level, providers, cache.

use std::time::Duration;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use reelgen_core::breaker::BreakerSnapshot;
use reelgen_core::degradation::{DegradationLevel, LevelTransition};
use reelgen_core::media::MediaType;
use reelgen_pipeline::degradation::DegradationSnapshot;
use serde::{Deserialize, Serialize};

use crate::error::AppResult;
use crate::response::DataResponse;
use crate::state::AppState;

/// Upper bound for one provider health probe.
const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Degradation
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct DegradationStatus {
    pub current: DegradationSnapshot,
    pub history: Vec<LevelTransition>,
}

/// Body of `PUT /system/degradation`.
#[derive(Debug, Deserialize)]
pub struct ForceLevel {
    pub level: DegradationLevel,
    #[serde(default)]
    pub reason: Option<String>,
}

/// GET /api/v1/system/degradation
pub async fn get_degradation(State(state): State<AppState>) -> AppResult<impl IntoResponse> {
    let handle = state.service.orchestrator().degradation();
    let data = DegradationStatus {
        current: handle.current(),
        history: handle.history().await,
    };
    Ok(Json(DataResponse { data }))
}

/// PUT /api/v1/system/degradation
///
/// Operator override. The sampler may move the level again on its next
/// evaluation.
pub async fn force_degradation(
    State(state): State<AppState>,
    Json(input): Json<ForceLevel>,
) -> AppResult<impl IntoResponse> {
    let reason = input
        .reason
        .filter(|r| !r.trim().is_empty())
        .unwrap_or_else(|| "operator override".to_string());
    let handle = state.service.orchestrator().degradation();
    let transition = handle.force(input.level, reason).await;
    tracing::info!(
        level = input.level.as_str(),
        changed = transition.is_some(),
        "Degradation level forced"
    );

    let data = DegradationStatus {
        current: handle.current(),
        history: handle.history().await,
    };
    Ok(Json(DataResponse { data }))
}

// ---------------------------------------------------------------------------
// Providers
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct ProviderStatus {
    pub id: String,
    pub media_types: Vec<MediaType>,
    pub healthy: bool,
    pub breaker: BreakerSnapshot,
}

/// GET /api/v1/providers
///
/// Probes every provider concurrently. A probe that does not answer in
/// time counts as unhealthy.
pub async fn list_providers(State(state): State<AppState>) -> AppResult<impl IntoResponse> {
    let orchestrator = state.service.orchestrator();
    let providers = orchestrator.registry().all().to_vec();

    let probes = providers.iter().map(|provider| async move {
        tokio::time::timeout(HEALTH_PROBE_TIMEOUT, provider.health_check())
            .await
            .unwrap_or(false)
    });
    let health = futures::future::join_all(probes).await;

    let data: Vec<ProviderStatus> = providers
        .iter()
        .zip(health)
        .map(|(provider, healthy)| ProviderStatus {
            id: provider.id().to_string(),
            media_types: provider.media_types().to_vec(),
            healthy,
            breaker: orchestrator.breakers().snapshot(provider.id()),
        })
        .collect();
    Ok(Json(DataResponse { data }))
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

/// GET /api/v1/cache/stats
pub async fn cache_stats(State(state): State<AppState>) -> AppResult<impl IntoResponse> {
    let stats = state.service.orchestrator().cache().stats();
    Ok(Json(DataResponse { data: stats }))
}
