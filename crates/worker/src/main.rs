//! Headless batch runner.
//!
//! Reads the manifest named by `BATCH_FILE` (or the first argument), runs
//! it through the pipeline with the engine configuration from the
//! environment, logs progress as it happens and exits once the batch
//! summary has been written. Ctrl-C cancels the batch; requests already
//! generating finish their current attempt.

mod manifest;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reelgen_core::config::EngineConfig;
use reelgen_core::types::BatchId;
use reelgen_events::{ErrorLog, EventBus, ProgressEvent};
use reelgen_pipeline::{BatchService, BatchState, Orchestrator};
use reelgen_providers::ProviderRegistry;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::manifest::{BatchManifest, ENV_BATCH_FILE};

/// How long background tasks get to stop after the batch finishes.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let manifest_path = std::env::var(ENV_BATCH_FILE)
        .ok()
        .or_else(|| std::env::args().nth(1))
        .map(PathBuf::from)
        .with_context(|| format!("Set {ENV_BATCH_FILE} or pass the manifest path as an argument"))?;
    let manifest = BatchManifest::load(&manifest_path).await?;
    tracing::info!(
        path = %manifest_path.display(),
        project_id = %manifest.project_id,
        requests = manifest.requests.len(),
        "Loaded batch manifest"
    );

    // --- Engine ---
    let engine_config = EngineConfig::load().context("Failed to load engine configuration")?;
    let registry = ProviderRegistry::from_config(&engine_config.providers)?;
    if registry.is_empty() {
        tracing::warn!("No providers configured, only cached assets can be delivered");
    }
    let orchestrator = Orchestrator::new(
        engine_config,
        registry,
        Arc::new(EventBus::default()),
        Arc::new(ErrorLog::new()),
    );
    let service = Arc::new(BatchService::new(orchestrator));

    let background_cancel = CancellationToken::new();
    let mut handles = service.start_background(background_cancel.clone());

    // Subscribe before submitting so the first events are not missed.
    let receiver = service.events().subscribe();
    let batch_id = service.submit_batch(manifest.project_id, manifest.requests)?;
    handles.push(tokio::spawn(log_progress(
        receiver,
        batch_id,
        background_cancel.clone(),
    )));

    // --- Run ---
    let status = tokio::select! {
        status = service.wait(batch_id) => status?,
        () = ctrl_c() => {
            tracing::warn!(%batch_id, "Interrupted, cancelling batch");
            if let Err(e) = service.cancel_batch(batch_id) {
                tracing::debug!(%batch_id, error = %e, "Batch finished before cancellation");
            }
            service.wait(batch_id).await?
        }
    };

    let summary = &status.summary;
    tracing::info!(
        %batch_id,
        state = ?status.state,
        total = summary.total,
        delivered = summary.delivered,
        generated = summary.generated,
        cache_hits = summary.cache_hits,
        failed = summary.failed,
        quarantined = summary.quarantined,
        cancelled = summary.cancelled,
        total_cost = summary.total_cost,
        cost_saved = summary.cost_saved,
        "Batch complete"
    );
    for (kind, count) in &summary.failures_by_kind {
        tracing::warn!(%batch_id, kind = %kind, count, "Failures");
    }

    background_cancel.cancel();
    for handle in handles {
        let _ = tokio::time::timeout(SHUTDOWN_TIMEOUT, handle).await;
    }

    if status.state == BatchState::Cancelled {
        anyhow::bail!("Batch {batch_id} was cancelled");
    }
    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "reelgen_worker=debug,reelgen_pipeline=info".into());
    let json = std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Log every progress event of `batch_id` until cancelled.
async fn log_progress(
    mut receiver: broadcast::Receiver<ProgressEvent>,
    batch_id: BatchId,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = receiver.recv() => event,
        };
        match event {
            Ok(event) if event.batch_id == batch_id => {
                tracing::info!(
                    request_id = %event.job_id,
                    scene_id = %event.scene_id,
                    stage = event.stage.as_str(),
                    percent = event.percent,
                    message = %event.message,
                    "Progress"
                );
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Progress logger lagged, events skipped");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}
