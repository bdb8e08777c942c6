//! Shared helpers for pipeline integration tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use reelgen_core::config::{CostModel, EngineConfig};
use reelgen_core::media::MediaType;
use reelgen_core::request::GenerationRequest;
use reelgen_events::{ErrorLog, EventBus};
use reelgen_pipeline::{BatchService, DeliveredAsset, Orchestrator, RequestOutcome};
use reelgen_providers::{ProviderRegistry, ScriptedProvider};
use tempfile::TempDir;

/// A batch service rooted in a temp directory.
pub struct TestEngine {
    pub dir: TempDir,
    pub service: BatchService,
}

impl TestEngine {
    pub fn output_root(&self) -> PathBuf {
        self.dir.path().join("out")
    }

    pub fn quarantine_root(&self) -> PathBuf {
        self.dir.path().join("quarantine")
    }
}

/// Engine config with millisecond backoff and temp storage roots.
pub fn test_config(root: &Path) -> EngineConfig {
    let mut config = EngineConfig::default();
    for settings in [&mut config.media.image, &mut config.media.audio, &mut config.media.video] {
        settings.retry.max_attempts = 3;
        settings.retry.base_delay_ms = 5;
        settings.retry.max_delay_ms = 20;
        settings.call_timeout_ms = 2_000;
    }
    config.storage.output_root = root.join("out");
    config.storage.quarantine_root = root.join("quarantine");
    config
}

/// Build an engine over `providers`. `tweak` adjusts the config first.
pub fn build_engine(
    providers: Vec<Arc<ScriptedProvider>>,
    tweak: impl FnOnce(&mut EngineConfig),
) -> TestEngine {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    tweak(&mut config);

    let mut registry = ProviderRegistry::new();
    for provider in providers {
        registry.register(provider).unwrap();
    }
    let orchestrator = Orchestrator::new(
        config,
        registry,
        Arc::new(EventBus::default()),
        Arc::new(ErrorLog::new()),
    )
    .with_jitter(|| 1.0);

    TestEngine {
        dir,
        service: BatchService::new(orchestrator),
    }
}

/// Scripted provider serving every media type at four cents a call.
pub fn scripted(id: &str) -> ScriptedProvider {
    ScriptedProvider::new(id, MediaType::ALL.to_vec()).with_cost(CostModel {
        per_request_usd: 0.04,
        per_second_usd: 0.0,
    })
}

pub fn image(prompt: &str) -> GenerationRequest {
    GenerationRequest::new("scene-1", MediaType::Image, prompt)
}

pub fn delivered(outcome: &RequestOutcome) -> &DeliveredAsset {
    match outcome {
        RequestOutcome::Delivered { asset, .. } => asset,
        other => panic!("expected delivery, got {other:?}"),
    }
}
