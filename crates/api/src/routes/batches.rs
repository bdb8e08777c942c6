//! Route definitions for the `/batches` resource.

use axum::routing::{get, post};
use axum::Router;

use crate::handlers::batches;
use crate::state::AppState;
use crate::ws;

/// Routes mounted at `/batches`.
///
/// ```text
/// GET    /                -> list_batches
/// POST   /                -> submit_batch
/// GET    /{id}            -> get_batch
/// POST   /{id}/cancel     -> cancel_batch
/// GET    /{id}/errors     -> list_batch_errors
/// GET    /{id}/events     -> progress WebSocket
/// ```
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(batches::list_batches).post(batches::submit_batch))
        .route("/{id}", get(batches::get_batch))
        .route("/{id}/cancel", post(batches::cancel_batch))
        .route("/{id}/errors", get(batches::list_batch_errors))
        .route("/{id}/events", get(ws::batch_events_handler))
}
