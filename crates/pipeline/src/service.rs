//! Batch service: the entry point used by the API and the worker.
//!
//! Owns the [`Orchestrator`] and a table of submitted batches. Each batch
//! runs on its own task; status can be polled while it runs and a summary
//! document is written to the project directory when it finishes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use chrono::Utc;
use reelgen_core::error::CoreError;
use reelgen_core::request::{validate_batch, GenerationRequest};
use reelgen_core::types::{BatchId, RequestId, Timestamp};
use reelgen_events::{ErrorLog, EventBus, EventJournal};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::orchestrator::{BatchContext, Orchestrator};
use crate::outcome::{BatchState, BatchStatus, BatchSummary, RequestOutcome};
use crate::sampler::MetricsSampler;

struct BatchProgress {
    state: BatchState,
    finished_at: Option<Timestamp>,
    outcomes: HashMap<RequestId, RequestOutcome>,
}

struct BatchEntry {
    project_id: String,
    submitted_at: Timestamp,
    total: usize,
    cancel: CancellationToken,
    progress: Mutex<BatchProgress>,
    done: watch::Sender<bool>,
}

impl BatchEntry {
    fn lock(&self) -> MutexGuard<'_, BatchProgress> {
        self.progress.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn status(&self, batch_id: BatchId) -> BatchStatus {
        let progress = self.lock();
        BatchStatus {
            batch_id,
            project_id: self.project_id.clone(),
            state: progress.state,
            submitted_at: self.submitted_at,
            finished_at: progress.finished_at,
            outcomes: progress.outcomes.clone(),
            summary: BatchSummary::from_outcomes(self.total, progress.outcomes.values()),
        }
    }
}

type Batches = Arc<RwLock<HashMap<BatchId, Arc<BatchEntry>>>>;

/// Drop the oldest finished batches beyond `keep`. Running batches are
/// never dropped.
fn prune_finished(batches: &Batches, keep: usize) {
    let mut batches = batches.write().unwrap_or_else(|p| p.into_inner());
    let mut finished: Vec<(Timestamp, BatchId)> = batches
        .iter()
        .filter_map(|(id, entry)| entry.lock().finished_at.map(|at| (at, *id)))
        .collect();
    if finished.len() <= keep {
        return;
    }
    finished.sort();
    let excess = finished.len() - keep;
    for (_, batch_id) in finished.into_iter().take(excess) {
        batches.remove(&batch_id);
        tracing::debug!(%batch_id, "Finished batch dropped from memory");
    }
}

/// Submits, tracks and cancels batches.
///
/// Finished batches stay queryable until `storage.retained_batches` newer
/// ones have finished; after that only their summary file remains.
pub struct BatchService {
    orchestrator: Arc<Orchestrator>,
    batches: Batches,
}

impl BatchService {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self {
            orchestrator: Arc::new(orchestrator),
            batches: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    pub fn events(&self) -> &Arc<EventBus> {
        self.orchestrator.events()
    }

    pub fn errors(&self) -> &Arc<ErrorLog> {
        self.orchestrator.errors()
    }

    fn entry(&self, batch_id: BatchId) -> Result<Arc<BatchEntry>, CoreError> {
        self.batches
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(&batch_id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound {
                entity: "batch",
                id: batch_id.to_string(),
            })
    }

    /// Validate and start a batch. Returns as soon as it is scheduled.
    pub fn submit_batch(
        &self,
        project_id: impl Into<String>,
        requests: Vec<GenerationRequest>,
    ) -> Result<BatchId, CoreError> {
        let project_id = project_id.into();
        if project_id.trim().is_empty() {
            return Err(CoreError::Validation("project_id must not be empty".to_string()));
        }
        validate_batch(&requests)?;

        let batch_id = uuid::Uuid::now_v7();
        let (done, _) = watch::channel(false);
        let entry = Arc::new(BatchEntry {
            project_id: project_id.clone(),
            submitted_at: Utc::now(),
            total: requests.len(),
            cancel: CancellationToken::new(),
            progress: Mutex::new(BatchProgress {
                state: BatchState::Running,
                finished_at: None,
                outcomes: HashMap::with_capacity(requests.len()),
            }),
            done,
        });
        self.batches
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(batch_id, entry.clone());

        tracing::info!(
            %batch_id,
            project_id = %project_id,
            requests = requests.len(),
            "Batch submitted"
        );

        let orchestrator = self.orchestrator.clone();
        let batches = self.batches.clone();
        tokio::spawn(async move {
            let ctx = BatchContext {
                batch_id,
                project_id,
                cancel: entry.cancel.clone(),
            };
            let run = {
                let orchestrator = orchestrator.clone();
                let ctx = ctx.clone();
                let recorder = entry.clone();
                tokio::spawn(async move {
                    orchestrator
                        .run_batch(&ctx, requests, move |request_id, outcome| {
                            recorder.lock().outcomes.insert(request_id, outcome.clone());
                        })
                        .await;
                })
            };
            // A panic inside the run must still finish the batch, or
            // waiters would hang.
            if let Err(e) = run.await {
                tracing::error!(%batch_id, error = %e, "Batch run aborted");
            }

            {
                let mut progress = entry.lock();
                progress.state = if ctx.cancel.is_cancelled() {
                    BatchState::Cancelled
                } else {
                    BatchState::Completed
                };
                progress.finished_at = Some(Utc::now());
            }

            let status = entry.status(batch_id);
            match orchestrator
                .store()
                .write_summary(&ctx.project_id, batch_id, &status)
                .await
            {
                Ok(path) => tracing::info!(
                    %batch_id,
                    path = %path.display(),
                    delivered = status.summary.delivered,
                    failed = status.summary.failed,
                    cache_hits = status.summary.cache_hits,
                    total_cost = status.summary.total_cost,
                    "Batch finished"
                ),
                Err(e) => tracing::error!(%batch_id, error = %e, "Failed to write batch summary"),
            }
            prune_finished(&batches, orchestrator.config().storage.retained_batches);
            entry.done.send_replace(true);
        });

        Ok(batch_id)
    }

    /// Current status of a batch, running or finished.
    pub fn get_batch_status(&self, batch_id: BatchId) -> Result<BatchStatus, CoreError> {
        Ok(self.entry(batch_id)?.status(batch_id))
    }

    /// Request cancellation. Requests already generating finish their
    /// current attempt; queued ones end as cancelled.
    pub fn cancel_batch(&self, batch_id: BatchId) -> Result<(), CoreError> {
        let entry = self.entry(batch_id)?;
        if entry.lock().state != BatchState::Running {
            return Err(CoreError::Conflict(format!("Batch {batch_id} has already finished")));
        }
        entry.cancel.cancel();
        tracing::info!(%batch_id, "Batch cancellation requested");
        Ok(())
    }

    /// Wait until a batch reaches a terminal state, then return its status.
    pub async fn wait(&self, batch_id: BatchId) -> Result<BatchStatus, CoreError> {
        let entry = self.entry(batch_id)?;
        let mut done = entry.done.subscribe();
        // The sender lives in the entry we hold, so this cannot fail.
        let _ = done.wait_for(|finished| *finished).await;
        Ok(entry.status(batch_id))
    }

    /// Every known batch, newest first.
    pub fn list(&self) -> Vec<BatchStatus> {
        let mut statuses: Vec<BatchStatus> = self
            .batches
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .map(|(id, entry)| entry.status(*id))
            .collect();
        statuses.sort_by(|a, b| b.submitted_at.cmp(&a.submitted_at));
        statuses
    }

    /// Start the metrics sampler and, when configured, the event journal.
    /// Both stop when `cancel` fires.
    pub fn start_background(&self, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        let orchestrator = &self.orchestrator;
        let config = orchestrator.config();
        let sampler = MetricsSampler::new(
            orchestrator.outcome_window().clone(),
            orchestrator.breakers().clone(),
            orchestrator.degradation().clone(),
            config.storage.output_root.clone(),
            config.degradation.sample_interval(),
        );
        let mut handles = vec![tokio::spawn(sampler.run(cancel.clone()))];

        if let Some(path) = config.storage.event_journal.clone() {
            let receiver = orchestrator.events().subscribe();
            tracing::info!(path = %path.display(), "Event journal enabled");
            handles.push(tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = EventJournal::run(path, receiver) => {}
                }
            }));
        }
        handles
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use reelgen_core::config::EngineConfig;
    use reelgen_core::media::MediaType;
    use reelgen_providers::ProviderRegistry;

    fn service(dir: &std::path::Path) -> BatchService {
        service_with(dir, |_| {})
    }

    fn service_with(dir: &std::path::Path, tweak: impl FnOnce(&mut EngineConfig)) -> BatchService {
        let mut config = EngineConfig::default();
        config.storage.output_root = dir.join("out");
        config.storage.quarantine_root = dir.join("quarantine");
        tweak(&mut config);
        let orchestrator = Orchestrator::new(
            config,
            ProviderRegistry::new(),
            Arc::new(EventBus::default()),
            Arc::new(ErrorLog::new()),
        );
        BatchService::new(orchestrator)
    }

    #[tokio::test]
    async fn unknown_batch_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path());
        let id = uuid::Uuid::now_v7();
        assert_matches!(
            service.get_batch_status(id),
            Err(CoreError::NotFound { entity: "batch", .. })
        );
        assert_matches!(service.cancel_batch(id), Err(CoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn invalid_batches_are_rejected_before_scheduling() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path());
        assert_matches!(service.submit_batch("p", vec![]), Err(CoreError::Validation(_)));
        assert_matches!(
            service.submit_batch(" ", vec![GenerationRequest::new("s", MediaType::Image, "x")]),
            Err(CoreError::Validation(_))
        );
        assert!(service.list().is_empty());
    }

    #[tokio::test]
    async fn batch_without_providers_fails_every_request() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path());
        let batch_id = service
            .submit_batch("p", vec![GenerationRequest::new("s", MediaType::Image, "a cat")])
            .unwrap();

        let status = service.wait(batch_id).await.unwrap();
        assert_eq!(status.state, BatchState::Completed);
        assert_eq!(status.summary.failed, 1);
        assert!(status.finished_at.is_some());
        assert!(dir
            .path()
            .join(format!("out/p/batch-{batch_id}.summary.json"))
            .exists());

        assert_matches!(service.cancel_batch(batch_id), Err(CoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn oldest_finished_batches_are_dropped_past_retention() {
        let dir = tempfile::tempdir().unwrap();
        let service = service_with(dir.path(), |c| c.storage.retained_batches = 2);

        let mut ids = Vec::new();
        for prompt in ["a cat", "a dog", "a bird"] {
            let id = service
                .submit_batch("p", vec![GenerationRequest::new("s", MediaType::Image, prompt)])
                .unwrap();
            service.wait(id).await.unwrap();
            ids.push(id);
        }

        assert_matches!(service.get_batch_status(ids[0]), Err(CoreError::NotFound { .. }));
        assert!(service.get_batch_status(ids[1]).is_ok());
        assert!(service.get_batch_status(ids[2]).is_ok());
        assert_eq!(service.list().len(), 2);
        assert!(dir
            .path()
            .join(format!("out/p/batch-{}.summary.json", ids[0]))
            .exists());
    }
}
