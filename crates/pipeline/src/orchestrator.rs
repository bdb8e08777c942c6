//! Batch orchestrator.
//!
//! Runs the requests of one batch in waves. The wave size comes from the
//! current degradation level; provider calls are further capped per media
//! type across every batch. Each request goes through the same sequence:
//!
//! 1. apply the level's quality ceiling and derive the cache key
//! 2. cache lookup (exact, then similar when enabled)
//! 3. single-flight claim: follow an identical in-flight generation or lead
//! 4. degradation gate, provider selection, retry/breaker-wrapped call
//! 5. corruption detection (quarantine on failure)
//! 6. persistence, cache insert, optional backup
//!
//! A failing request never aborts the batch; it ends with a typed
//! [`RequestOutcome::Failed`].

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use reelgen_core::cache_key::CacheKey;
use reelgen_core::config::EngineConfig;
use reelgen_core::degradation::{
    LevelEffects, FEATURE_ASSET_BACKUP, FEATURE_DETAILED_PROGRESS, FEATURE_SIMILARITY_LOOKUP,
};
use reelgen_core::media::MediaType;
use reelgen_core::progress::Stage;
use reelgen_core::request::GenerationRequest;
use reelgen_core::types::{BatchId, RequestId, Usd};
use reelgen_events::{ErrorLog, EventBus, ProgressEvent};
use reelgen_providers::{ProviderHandle, ProviderRegistry};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::breakers::BreakerRegistry;
use crate::cache::{CacheEntry, ContentCache, Lookup};
use crate::degradation::{DegradationController, DegradationHandle};
use crate::detector::{CorruptionDetector, Subject, ValidatedAsset};
use crate::error::PipelineError;
use crate::flight::{Claim, FlightOutcome, FlightResult, SingleFlight};
use crate::outcome::{AssetSource, DeliveredAsset, RequestOutcome};
use crate::retry::ResilientCaller;
use crate::sampler::OutcomeWindow;
use crate::storage::{OutputStore, SidecarRecord};

/// Name of the cache directory under the output root. Project directories
/// are sanitized and can never start with a dot.
pub const CACHE_DIR: &str = ".cache";

/// One batch as seen by the orchestrator.
#[derive(Debug, Clone)]
pub struct BatchContext {
    pub batch_id: BatchId,
    pub project_id: String,
    pub cancel: CancellationToken,
}

/// Where a reused asset comes from.
struct Reuse<'a> {
    path: &'a Path,
    provider_id: &'a str,
    cost_saved: Usd,
    source: AssetSource,
}

/// Shared engine state plus the per-request pipeline.
pub struct Orchestrator {
    config: EngineConfig,
    registry: ProviderRegistry,
    caller: ResilientCaller,
    breakers: Arc<BreakerRegistry>,
    cache: Arc<ContentCache>,
    flights: SingleFlight,
    detector: CorruptionDetector,
    store: OutputStore,
    degradation: DegradationHandle,
    window: Arc<OutcomeWindow>,
    events: Arc<EventBus>,
    errors: Arc<ErrorLog>,
    /// Network-wide in-flight caps, indexed like [`MediaType::ALL`].
    slots: [Arc<Semaphore>; 3],
}

impl Orchestrator {
    /// Build the engine. Spawns the degradation controller, so it must be
    /// called inside a tokio runtime.
    pub fn new(
        config: EngineConfig,
        registry: ProviderRegistry,
        events: Arc<EventBus>,
        errors: Arc<ErrorLog>,
    ) -> Self {
        let breakers = Arc::new(BreakerRegistry::new(
            config.breaker.clone(),
            registry.all().iter().map(|p| p.id()),
        ));
        let caller = ResilientCaller::new(breakers.clone(), errors.clone());
        let cache = Arc::new(ContentCache::new(
            config.storage.output_root.join(CACHE_DIR),
            config.cache.clone(),
        ));
        let detector = CorruptionDetector::new(
            config.integrity.clone(),
            config.storage.quarantine_root.clone(),
            config.storage.backup_root.clone(),
            errors.clone(),
        );
        let store = OutputStore::new(config.storage.output_root.clone());
        let degradation = DegradationController::spawn(&config.degradation);
        let window = Arc::new(OutcomeWindow::from_settings(&config.degradation));
        let slots = MediaType::ALL
            .map(|m| Arc::new(Semaphore::new(config.media.get(m).max_in_flight.max(1))));

        Self {
            config,
            registry,
            caller,
            breakers,
            cache,
            flights: SingleFlight::new(),
            detector,
            store,
            degradation,
            window,
            events,
            errors,
            slots,
        }
    }

    /// Pin the retry jitter factor. Tests use this for exact delays.
    pub fn with_jitter(mut self, jitter: fn() -> f64) -> Self {
        self.caller =
            ResilientCaller::new(self.breakers.clone(), self.errors.clone()).with_jitter(jitter);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn caller(&self) -> &ResilientCaller {
        &self.caller
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    pub fn cache(&self) -> &Arc<ContentCache> {
        &self.cache
    }

    pub fn degradation(&self) -> &DegradationHandle {
        &self.degradation
    }

    pub fn outcome_window(&self) -> &Arc<OutcomeWindow> {
        &self.window
    }

    pub fn store(&self) -> &OutputStore {
        &self.store
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn errors(&self) -> &Arc<ErrorLog> {
        &self.errors
    }

    fn slot(&self, media: MediaType) -> &Arc<Semaphore> {
        match media {
            MediaType::Image => &self.slots[0],
            MediaType::Audio => &self.slots[1],
            MediaType::Video => &self.slots[2],
        }
    }

    // -----------------------------------------------------------------------
    // Batch
    // -----------------------------------------------------------------------

    /// Run every request of a batch to a terminal outcome.
    ///
    /// `on_outcome` is called as soon as each request finishes.
    pub async fn run_batch<F>(
        &self,
        ctx: &BatchContext,
        requests: Vec<GenerationRequest>,
        on_outcome: F,
    ) -> Vec<(RequestId, RequestOutcome)>
    where
        F: Fn(RequestId, &RequestOutcome) + Send + Sync,
    {
        let mut queue: VecDeque<GenerationRequest> = schedule_order(requests).into();
        for request in &queue {
            self.emit(ctx, request, Stage::Queued, "");
        }

        let mut outcomes = Vec::with_capacity(queue.len());
        let mut wave_number = 0u32;
        while !queue.is_empty() {
            if ctx.cancel.is_cancelled() {
                tracing::info!(
                    batch_id = %ctx.batch_id,
                    remaining = queue.len(),
                    "Batch cancelled, skipping remaining requests"
                );
                for request in queue.drain(..) {
                    let outcome =
                        self.fail(ctx, &request, PipelineError::Cancelled, 0, "orchestrator");
                    on_outcome(request.id, &outcome);
                    outcomes.push((request.id, outcome));
                }
                break;
            }

            let snapshot = self.degradation.current();
            let size = snapshot.effects.max_concurrent_jobs.max(1).min(queue.len());
            let wave: Vec<GenerationRequest> = queue.drain(..size).collect();
            wave_number += 1;
            tracing::info!(
                batch_id = %ctx.batch_id,
                wave = wave_number,
                size,
                level = snapshot.level.as_str(),
                remaining = queue.len(),
                "Starting wave"
            );

            let finished = futures::future::join_all(wave.iter().map(|request| async {
                let outcome = self.process(ctx, request).await;
                on_outcome(request.id, &outcome);
                (request.id, outcome)
            }))
            .await;
            outcomes.extend(finished);
        }
        outcomes
    }

    // -----------------------------------------------------------------------
    // Request
    // -----------------------------------------------------------------------

    /// Take one request to a terminal outcome.
    pub async fn process(
        &self,
        ctx: &BatchContext,
        original: &GenerationRequest,
    ) -> RequestOutcome {
        let effects = self.degradation.effects();
        let request = original.with_quality_ceiling(effects.max_dimension);
        let key = CacheKey::for_request(&request);
        let similarity = effects
            .feature_enabled(FEATURE_SIMILARITY_LOOKUP)
            .then(|| self.config.media.get(request.media_type).similarity_threshold);

        loop {
            self.emit(ctx, &request, Stage::CacheLookup, "");
            if let Some(outcome) = self.serve_from_cache(ctx, &request, &key, similarity).await {
                return outcome;
            }

            let level = self.degradation.level();
            if let Err(error) = gate(&effects, request.media_type, level.as_str()) {
                return self.fail(ctx, &request, error, 0, "orchestrator");
            }

            match self.flights.claim(&key.digest) {
                Claim::Follower(waiter) => {
                    self.emit(
                        ctx,
                        &request,
                        Stage::AwaitingDuplicate,
                        "Identical request already generating",
                    );
                    let waited = tokio::select! {
                        _ = ctx.cancel.cancelled() => {
                            let error = PipelineError::Cancelled;
                            return self.fail(ctx, &request, error, 0, "orchestrator");
                        }
                        waited = waiter.wait() => waited,
                    };
                    match waited {
                        // Leader vanished: look again, maybe lead.
                        None => continue,
                        Some(Err(error)) => {
                            return self.finish_failed(ctx, &request, error, 0);
                        }
                        Some(Ok(flight)) => {
                            let reuse = Reuse {
                                path: &flight.source,
                                provider_id: &flight.provider_id,
                                cost_saved: flight.cost,
                                source: AssetSource::InFlight,
                            };
                            if let Some(outcome) = self.deliver_reused(ctx, &request, reuse).await {
                                return outcome;
                            }
                            continue;
                        }
                    }
                }
                Claim::Leader(guard) => {
                    // Another leader may have finished between lookup and claim.
                    if self.cache.contains(&key) {
                        drop(guard);
                        continue;
                    }
                    let (outcome, flight) = self.generate(ctx, &request, &key, &effects).await;
                    match flight {
                        // Our batch was cancelled, not theirs: let followers retry.
                        Err(PipelineError::Cancelled) => drop(guard),
                        flight => guard.complete(flight),
                    }
                    return outcome;
                }
            }
        }
    }

    async fn serve_from_cache(
        &self,
        ctx: &BatchContext,
        request: &GenerationRequest,
        key: &CacheKey,
        similarity: Option<f64>,
    ) -> Option<RequestOutcome> {
        let (entry, source) = match self.cache.lookup(key, similarity) {
            Lookup::Miss => return None,
            Lookup::Exact(entry) => (entry, AssetSource::CacheExact),
            Lookup::Similar { entry, similarity } => {
                if !request.accept_similar {
                    tracing::info!(
                        request_id = %request.id,
                        similarity,
                        "Similar cache hit declined by request, regenerating"
                    );
                    return None;
                }
                (entry, AssetSource::CacheSimilar { similarity })
            }
        };

        let reuse = Reuse {
            path: &entry.asset_ref,
            provider_id: &entry.provider_id,
            cost_saved: entry.cost_saved,
            source,
        };
        match self.deliver_reused(ctx, request, reuse).await {
            Some(outcome) => Some(outcome),
            None => {
                self.drop_cache_entry(&entry).await;
                None
            }
        }
    }

    async fn drop_cache_entry(&self, entry: &CacheEntry) {
        tracing::warn!(digest = %entry.key.digest, "Dropping unusable cache entry");
        self.cache.remove(&entry.key).await;
    }

    /// Validate and deliver an existing asset. `None` means it could not be
    /// reused and the caller should fall back to generating.
    async fn deliver_reused(
        &self,
        ctx: &BatchContext,
        request: &GenerationRequest,
        reuse: Reuse<'_>,
    ) -> Option<RequestOutcome> {
        let bytes = match tokio::fs::read(reuse.path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                self.record_error(ctx, request, &PipelineError::from(e), "cache");
                return None;
            }
        };
        let asset_ref = reuse.path.display().to_string();
        let validated = self
            .detector
            .validate(self.subject(ctx, request, &asset_ref), bytes, None)
            .await
            .ok()?;

        let message = format!("Reused via {}", stage_label(&reuse.source));
        self.emit(ctx, request, Stage::CacheHit, &message);
        let sidecar = SidecarRecord {
            request_id: request.id,
            provider_id: reuse.provider_id.to_string(),
            cost: 0.0,
            cache_hit: true,
            checksum: validated.checksum().to_string(),
            created_at: Utc::now(),
            scene_id: request.scene_id.clone(),
            media_type: request.media_type,
            source: reuse.source.clone(),
            size_bytes: validated.bytes.len(),
            inspection: Some(validated.inspection.clone()),
            metadata: serde_json::Value::Null,
        };
        let path = match self
            .store
            .write_asset(&ctx.project_id, validated.extension(), &validated.bytes, &sidecar)
            .await
        {
            Ok(path) => path,
            Err(error) => {
                self.record_error(ctx, request, &error, "storage");
                return Some(self.fail(ctx, request, error, 0, "storage"));
            }
        };

        let delivered = DeliveredAsset {
            path,
            provider_id: sidecar.provider_id,
            cost: 0.0,
            cost_saved: reuse.cost_saved,
            source: reuse.source,
            checksum: sidecar.checksum,
        };
        Some(self.succeed(ctx, request, delivered, 0))
    }

    /// Generate as the single-flight leader. Returns the request's outcome
    /// and what to publish to followers.
    async fn generate(
        &self,
        ctx: &BatchContext,
        request: &GenerationRequest,
        key: &CacheKey,
        effects: &LevelEffects,
    ) -> (RequestOutcome, FlightResult) {
        let provider = match self.select_provider(request.media_type) {
            Ok(provider) => provider,
            Err(error) => {
                self.record_error(ctx, request, &error, "orchestrator");
                return (self.finish_failed(ctx, request, error.clone(), 0), Err(error));
            }
        };
        let provider_id = provider.id().to_string();
        let cost = provider.estimate_cost(request);
        let settings = self.config.media.get(request.media_type);

        let slot = tokio::select! {
            _ = ctx.cancel.cancelled() => None,
            permit = self.slot(request.media_type).acquire() => permit.ok(),
        };
        let Some(slot) = slot else {
            let error = PipelineError::Cancelled;
            return (self.fail(ctx, request, error.clone(), 0, "orchestrator"), Err(error));
        };

        self.emit(ctx, request, Stage::Generating, &format!("Calling {provider_id}"));
        let report = self
            .caller
            .call(&provider, request, settings, Some(ctx.batch_id), &ctx.cancel, |attempt, delay| {
                self.emit(
                    ctx,
                    request,
                    Stage::Retrying,
                    &format!("Attempt {attempt} in {}ms", delay.as_millis()),
                );
            })
            .await;
        drop(slot);

        let asset = match report.result {
            Ok(asset) => asset,
            Err(error) => {
                return (
                    self.finish_failed(ctx, request, error.clone(), report.attempts),
                    Err(error),
                );
            }
        };

        self.emit(ctx, request, Stage::Validating, "");
        let asset_ref = format!("provider:{provider_id}");
        let declared = asset.declared_crc32.clone();
        let metadata = asset.metadata.clone();
        let validated = match self
            .detector
            .validate(self.subject(ctx, request, &asset_ref), asset.bytes, declared.as_deref())
            .await
        {
            Ok(validated) => validated,
            Err(error) => {
                if !matches!(error, PipelineError::CorruptionUnrecoverable { .. }) {
                    self.record_error(ctx, request, &error, "detector");
                }
                return (
                    self.finish_failed(ctx, request, error.clone(), report.attempts),
                    Err(error),
                );
            }
        };

        self.emit(ctx, request, Stage::Persisting, "");
        let sidecar = SidecarRecord {
            request_id: request.id,
            provider_id: provider_id.clone(),
            cost,
            cache_hit: false,
            checksum: validated.checksum().to_string(),
            created_at: Utc::now(),
            scene_id: request.scene_id.clone(),
            media_type: request.media_type,
            source: AssetSource::Generated,
            size_bytes: validated.bytes.len(),
            inspection: Some(validated.inspection.clone()),
            metadata,
        };
        let path = match self
            .store
            .write_asset(&ctx.project_id, validated.extension(), &validated.bytes, &sidecar)
            .await
        {
            Ok(path) => path,
            Err(error) => {
                self.record_error(ctx, request, &error, "storage");
                return (
                    self.fail(ctx, request, error.clone(), report.attempts, "storage"),
                    Err(error),
                );
            }
        };

        let shared = self.share(ctx, request, key, &validated, &provider_id, cost, &path).await;
        if effects.feature_enabled(FEATURE_ASSET_BACKUP) {
            if let Err(e) = self
                .detector
                .backup(&ctx.project_id, &request.scene_id, request.id, &validated)
                .await
            {
                tracing::warn!(request_id = %request.id, error = %e, "Asset backup failed");
            }
        }

        let delivered = DeliveredAsset {
            path,
            provider_id: provider_id.clone(),
            cost,
            cost_saved: 0.0,
            source: AssetSource::Generated,
            checksum: sidecar.checksum,
        };
        let outcome = self.succeed(ctx, request, delivered, report.attempts);
        (outcome, Ok(shared))
    }

    /// Insert a freshly generated asset into the cache and describe it for
    /// followers. Cache failures only cost future reuse.
    #[allow(clippy::too_many_arguments)]
    async fn share(
        &self,
        ctx: &BatchContext,
        request: &GenerationRequest,
        key: &CacheKey,
        validated: &ValidatedAsset,
        provider_id: &str,
        cost: Usd,
        delivered_path: &Path,
    ) -> FlightOutcome {
        let source = match self
            .cache
            .insert(
                key.clone(),
                &validated.bytes,
                validated.extension(),
                cost,
                validated.checksum(),
                provider_id,
            )
            .await
        {
            Ok(entry) => entry.asset_ref,
            Err(error) => {
                self.record_error(ctx, request, &error, "cache");
                delivered_path.to_path_buf()
            }
        };
        FlightOutcome {
            source,
            provider_id: provider_id.to_string(),
            checksum: validated.checksum().to_string(),
            cost,
        }
    }

    /// First candidate whose breaker currently accepts calls, else the first
    /// candidate (which then fails fast with `CircuitOpen`).
    fn select_provider(&self, media: MediaType) -> Result<ProviderHandle, PipelineError> {
        let candidates = self.registry.candidates(media);
        let first = candidates
            .first()
            .cloned()
            .ok_or_else(|| {
                PipelineError::ServiceUnavailable(format!("No provider serves {media}"))
            })?;
        Ok(candidates
            .into_iter()
            .find(|p| self.breakers.accepts(p.id()))
            .unwrap_or(first))
    }

    fn subject<'a>(
        &self,
        ctx: &'a BatchContext,
        request: &GenerationRequest,
        asset_ref: &'a str,
    ) -> Subject<'a> {
        Subject {
            project_id: &ctx.project_id,
            request_id: request.id,
            batch_id: Some(ctx.batch_id),
            media_type: request.media_type,
            asset_ref,
        }
    }

    // -----------------------------------------------------------------------
    // Terminal states
    // -----------------------------------------------------------------------

    fn succeed(
        &self,
        ctx: &BatchContext,
        request: &GenerationRequest,
        asset: DeliveredAsset,
        attempts: u32,
    ) -> RequestOutcome {
        self.errors.mark_recovered(request.id);
        self.window.record(true);
        self.emit(
            ctx,
            request,
            Stage::Completed,
            &format!("Delivered via {}", stage_label(&asset.source)),
        );
        tracing::debug!(
            request_id = %request.id,
            batch_id = %ctx.batch_id,
            provider_id = %asset.provider_id,
            source = stage_label(&asset.source),
            attempts,
            "Request delivered"
        );
        RequestOutcome::Delivered { asset, attempts }
    }

    /// Fail with an error that was already recorded by the component that
    /// produced it.
    fn finish_failed(
        &self,
        ctx: &BatchContext,
        request: &GenerationRequest,
        error: PipelineError,
        attempts: u32,
    ) -> RequestOutcome {
        if error.counts_against_health() {
            self.window.record(false);
        }
        let stage = match &error {
            PipelineError::CorruptionUnrecoverable { .. } => Stage::Quarantined,
            PipelineError::Cancelled => Stage::Cancelled,
            _ => Stage::Failed,
        };
        self.emit(ctx, request, stage, &error.to_string());
        tracing::info!(
            request_id = %request.id,
            batch_id = %ctx.batch_id,
            kind = error.category().as_str(),
            attempts,
            "Request failed"
        );
        RequestOutcome::Failed { error, attempts }
    }

    /// Record an orchestrator-side error and fail.
    fn fail(
        &self,
        ctx: &BatchContext,
        request: &GenerationRequest,
        error: PipelineError,
        attempts: u32,
        component: &'static str,
    ) -> RequestOutcome {
        if component == "orchestrator" {
            self.record_error(ctx, request, &error, component);
        }
        self.finish_failed(ctx, request, error, attempts)
    }

    fn record_error(
        &self,
        ctx: &BatchContext,
        request: &GenerationRequest,
        error: &PipelineError,
        component: &'static str,
    ) {
        self.errors.record(
            request.id,
            Some(ctx.batch_id),
            error.category(),
            component,
            &error.to_string(),
        );
    }

    /// Publish a progress event. Non-terminal stages are suppressed while
    /// detailed progress is disabled.
    fn emit(&self, ctx: &BatchContext, request: &GenerationRequest, stage: Stage, message: &str) {
        if !stage.is_terminal()
            && !self.degradation.effects().feature_enabled(FEATURE_DETAILED_PROGRESS)
        {
            return;
        }
        self.events.publish(
            ProgressEvent::new(request.id, ctx.batch_id, request.scene_id.clone(), stage)
                .with_message(message),
        );
    }
}

/// Order a batch for scheduling: higher priority first, then images and
/// audio ahead of video, then submission order.
pub fn schedule_order(mut requests: Vec<GenerationRequest>) -> Vec<GenerationRequest> {
    requests.sort_by_key(|r| (std::cmp::Reverse(r.priority), r.media_type.schedule_rank()));
    requests
}

/// Refuse new generation that the current level does not allow.
fn gate(effects: &LevelEffects, media: MediaType, level: &str) -> Result<(), PipelineError> {
    if effects.rejects_generation() {
        return Err(PipelineError::ServiceUnavailable(format!(
            "Generation is suspended at degradation level {level}"
        )));
    }
    if !effects.allows(media) {
        return Err(PipelineError::ServiceUnavailable(format!(
            "{media} generation is disabled at degradation level {level}"
        )));
    }
    Ok(())
}

fn stage_label(source: &AssetSource) -> &'static str {
    match source {
        AssetSource::Generated => "generation",
        AssetSource::CacheExact => "exact cache hit",
        AssetSource::CacheSimilar { .. } => "similar cache hit",
        AssetSource::InFlight => "in-flight duplicate",
    }
}
