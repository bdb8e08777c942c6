use std::sync::Arc;

use reelgen_pipeline::BatchService;

use crate::config::ServerConfig;

/// Shared application state available to all Axum handlers via `State<AppState>`.
///
/// Cheaply cloneable: everything sits behind an `Arc`.
#[derive(Clone)]
pub struct AppState {
    /// Server configuration.
    pub config: Arc<ServerConfig>,
    /// The generation engine: batches, cache, breakers, degradation.
    pub service: Arc<BatchService>,
}
