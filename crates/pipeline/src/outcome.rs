//! Per-request outcomes and the aggregate batch summary.

use std::collections::HashMap;
use std::path::PathBuf;

use reelgen_core::types::{BatchId, ProviderId, RequestId, Timestamp, Usd};
use serde::Serialize;

use crate::error::PipelineError;

/// Where a delivered asset came from.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AssetSource {
    /// Fresh provider call.
    Generated,
    /// Exact cache key match.
    CacheExact,
    /// Near-duplicate prompt match.
    CacheSimilar { similarity: f64 },
    /// Result of an identical request that was already generating.
    InFlight,
}

impl AssetSource {
    pub fn is_cache_hit(&self) -> bool {
        !matches!(self, AssetSource::Generated)
    }
}

/// A successfully delivered asset.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeliveredAsset {
    pub path: PathBuf,
    pub provider_id: ProviderId,
    /// Cost of this delivery; zero for cache hits.
    pub cost: Usd,
    /// Estimated spend avoided by reusing an earlier asset.
    pub cost_saved: Usd,
    pub source: AssetSource,
    pub checksum: String,
}

/// Terminal state of one request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RequestOutcome {
    Delivered {
        asset: DeliveredAsset,
        attempts: u32,
    },
    Failed {
        error: PipelineError,
        attempts: u32,
    },
}

impl RequestOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, RequestOutcome::Delivered { .. })
    }

    pub fn attempts(&self) -> u32 {
        match self {
            RequestOutcome::Delivered { attempts, .. }
            | RequestOutcome::Failed { attempts, .. } => *attempts,
        }
    }

    pub fn error(&self) -> Option<&PipelineError> {
        match self {
            RequestOutcome::Failed { error, .. } => Some(error),
            RequestOutcome::Delivered { .. } => None,
        }
    }

    pub fn delivered(&self) -> Option<&DeliveredAsset> {
        match self {
            RequestOutcome::Delivered { asset, .. } => Some(asset),
            RequestOutcome::Failed { .. } => None,
        }
    }
}

/// Aggregate counts for a finished (or running) batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchSummary {
    pub total: usize,
    pub completed: usize,
    pub delivered: usize,
    pub generated: usize,
    pub cache_hits: usize,
    pub failed: usize,
    pub quarantined: usize,
    pub cancelled: usize,
    pub total_cost: Usd,
    pub cost_saved: Usd,
    /// Cache hits over delivered requests; zero when nothing was delivered.
    pub cache_hit_ratio: f64,
    pub failures_by_kind: HashMap<String, usize>,
}

impl BatchSummary {
    /// Summarize `outcomes` for a batch of `total` requests.
    pub fn from_outcomes<'a>(
        total: usize,
        outcomes: impl IntoIterator<Item = &'a RequestOutcome>,
    ) -> Self {
        let mut summary = BatchSummary {
            total,
            ..Default::default()
        };
        for outcome in outcomes {
            summary.completed += 1;
            match outcome {
                RequestOutcome::Delivered { asset, .. } => {
                    summary.delivered += 1;
                    summary.total_cost += asset.cost;
                    summary.cost_saved += asset.cost_saved;
                    if asset.source.is_cache_hit() {
                        summary.cache_hits += 1;
                    } else {
                        summary.generated += 1;
                    }
                }
                RequestOutcome::Failed { error, .. } => {
                    match error {
                        PipelineError::Cancelled => summary.cancelled += 1,
                        PipelineError::CorruptionUnrecoverable { .. } => {
                            summary.quarantined += 1;
                            summary.failed += 1;
                        }
                        _ => summary.failed += 1,
                    }
                    *summary
                        .failures_by_kind
                        .entry(error.category().as_str().to_string())
                        .or_default() += 1;
                }
            }
        }
        if summary.delivered > 0 {
            summary.cache_hit_ratio = summary.cache_hits as f64 / summary.delivered as f64;
        }
        summary
    }
}

/// Lifecycle of a submitted batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    Running,
    Completed,
    Cancelled,
}

/// Snapshot answer to "how is batch X doing".
#[derive(Debug, Clone, Serialize)]
pub struct BatchStatus {
    pub batch_id: BatchId,
    pub project_id: String,
    pub state: BatchState,
    pub submitted_at: Timestamp,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<Timestamp>,
    pub outcomes: HashMap<RequestId, RequestOutcome>,
    pub summary: BatchSummary,
}
