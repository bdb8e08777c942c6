//! Handlers for the `/batches` resource.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use reelgen_core::request::GenerationRequest;
use reelgen_core::types::{BatchId, RequestId, Timestamp};
use reelgen_pipeline::{BatchState, BatchSummary};
use serde::{Deserialize, Serialize};

use crate::error::AppResult;
use crate::response::DataResponse;
use crate::state::AppState;

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// Body of `POST /batches`.
#[derive(Debug, Deserialize)]
pub struct SubmitBatch {
    pub project_id: String,
    pub requests: Vec<GenerationRequest>,
}

/// Returned when a batch has been scheduled.
#[derive(Debug, Serialize)]
pub struct BatchAccepted {
    pub batch_id: BatchId,
    pub request_ids: Vec<RequestId>,
}

/// Batch row for the list endpoint; per-request outcomes are left out.
#[derive(Debug, Serialize)]
pub struct BatchOverview {
    pub batch_id: BatchId,
    pub project_id: String,
    pub state: BatchState,
    pub submitted_at: Timestamp,
    pub finished_at: Option<Timestamp>,
    pub summary: BatchSummary,
}

// ---------------------------------------------------------------------------
// Submit
// ---------------------------------------------------------------------------

/// POST /api/v1/batches
///
/// Validate and schedule a batch. Returns 201 with the batch id and the
/// ids assigned to each request, in submission order.
pub async fn submit_batch(
    State(state): State<AppState>,
    Json(input): Json<SubmitBatch>,
) -> AppResult<impl IntoResponse> {
    let request_ids = input.requests.iter().map(|r| r.id).collect();
    let batch_id = state.service.submit_batch(input.project_id, input.requests)?;

    Ok((
        StatusCode::CREATED,
        Json(DataResponse {
            data: BatchAccepted { batch_id, request_ids },
        }),
    ))
}

// ---------------------------------------------------------------------------
// Read
// ---------------------------------------------------------------------------

/// GET /api/v1/batches
pub async fn list_batches(State(state): State<AppState>) -> AppResult<impl IntoResponse> {
    let batches: Vec<BatchOverview> = state
        .service
        .list()
        .into_iter()
        .map(|status| BatchOverview {
            batch_id: status.batch_id,
            project_id: status.project_id,
            state: status.state,
            submitted_at: status.submitted_at,
            finished_at: status.finished_at,
            summary: status.summary,
        })
        .collect();
    Ok(Json(DataResponse { data: batches }))
}

/// GET /api/v1/batches/{id}
///
/// Per-request outcomes plus the aggregate summary. Works while the batch
/// is still running.
pub async fn get_batch(
    State(state): State<AppState>,
    Path(batch_id): Path<BatchId>,
) -> AppResult<impl IntoResponse> {
    let status = state.service.get_batch_status(batch_id)?;
    Ok(Json(DataResponse { data: status }))
}

/// GET /api/v1/batches/{id}/errors
///
/// Error records correlated with the batch, oldest first.
pub async fn list_batch_errors(
    State(state): State<AppState>,
    Path(batch_id): Path<BatchId>,
) -> AppResult<impl IntoResponse> {
    // 404 for unknown batches rather than an empty list.
    state.service.get_batch_status(batch_id)?;
    let records = state.service.errors().records_for_batch(batch_id);
    Ok(Json(DataResponse { data: records }))
}

// ---------------------------------------------------------------------------
// Cancel
// ---------------------------------------------------------------------------

/// POST /api/v1/batches/{id}/cancel
///
/// Returns 202: queued requests end as cancelled once the current wave
/// settles. 409 if the batch already finished.
pub async fn cancel_batch(
    State(state): State<AppState>,
    Path(batch_id): Path<BatchId>,
) -> AppResult<impl IntoResponse> {
    state.service.cancel_batch(batch_id)?;
    let status = state.service.get_batch_status(batch_id)?;
    Ok((StatusCode::ACCEPTED, Json(DataResponse { data: status })))
}
