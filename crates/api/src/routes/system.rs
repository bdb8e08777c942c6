//! Route definitions for engine-wide status.

use axum::routing::get;
use axum::Router;

use crate::handlers::system;
use crate::state::AppState;

/// Routes mounted at the `/api/v1` root.
///
/// ```text
/// GET    /system/degradation   -> get_degradation
/// PUT    /system/degradation   -> force_degradation
/// GET    /providers            -> list_providers
/// GET    /cache/stats          -> cache_stats
/// ```
pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/system/degradation",
            get(system::get_degradation).put(system::force_degradation),
        )
        .route("/providers", get(system::list_providers))
        .route("/cache/stats", get(system::cache_stats))
}
