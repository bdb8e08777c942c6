pub mod batches;
pub mod health;
pub mod system;

use axum::Router;

use crate::state::AppState;

/// Build the `/api/v1` route tree.
///
/// ```text
/// /batches                         list, submit
/// /batches/{id}                    status with per-request outcomes
/// /batches/{id}/cancel             cancel (POST)
/// /batches/{id}/errors             error records
/// /batches/{id}/events             progress WebSocket
///
/// /system/degradation              current level + history, force (PUT)
/// /providers                       health + breaker state per provider
/// /cache/stats                     cache counters
/// ```
pub fn api_routes() -> Router<AppState> {
    Router::new()
        .nest("/batches", batches::router())
        .merge(system::router())
}
