use axum::extract::State;
use axum::{routing::get, Json, Router};
use reelgen_core::degradation::DegradationLevel;
use serde::Serialize;

use crate::state::AppState;

/// Health check response payload.
#[derive(Serialize)]
pub struct HealthResponse {
    /// `ok` at full service, `offline` when generation is suspended,
    /// `degraded` in between.
    pub status: &'static str,
    /// Crate version from Cargo.toml.
    pub version: &'static str,
    pub degradation_level: DegradationLevel,
}

/// GET /health -- returns service health and the current degradation level.
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let level = state.service.orchestrator().degradation().level();
    let status = match level {
        DegradationLevel::Full => "ok",
        DegradationLevel::Offline => "offline",
        _ => "degraded",
    };

    Json(HealthResponse {
        status,
        version: env!("CARGO_PKG_VERSION"),
        degradation_level: level,
    })
}

/// Mount health check routes (intended for root-level, NOT under `/api/v1`).
pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}
