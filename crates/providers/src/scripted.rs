//! Programmable provider for tests and demos.
//!
//! Each call pops the next [`ScriptStep`]; once the script is exhausted the
//! fallback step repeats. Every call is counted so tests can assert exactly
//! how many network attempts were made, and how many overlapped.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use reelgen_core::asset::Asset;
use reelgen_core::config::CostModel;
use reelgen_core::media::MediaType;
use reelgen_core::request::GenerationRequest;
use reelgen_core::types::{RequestId, Usd};

use crate::adapter::ProviderAdapter;
use crate::error::ProviderError;
use crate::fixture::fixture_asset;

/// What one call does.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    /// Return a valid fixture asset for the request.
    Succeed,
    /// Fail with the given error.
    Fail(ProviderError),
    /// Return these bytes as the asset, valid or not.
    Bytes(Vec<u8>),
}

/// Provider whose behaviour is scripted call by call.
pub struct ScriptedProvider {
    id: String,
    media_types: Vec<MediaType>,
    script: Mutex<VecDeque<ScriptStep>>,
    fallback: ScriptStep,
    latency: Duration,
    cost: CostModel,
    healthy: AtomicBool,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    seen: Mutex<Vec<RequestId>>,
}

impl ScriptedProvider {
    /// A provider that always succeeds.
    pub fn new(id: impl Into<String>, media_types: Vec<MediaType>) -> Self {
        Self {
            id: id.into(),
            media_types,
            script: Mutex::new(VecDeque::new()),
            fallback: ScriptStep::Succeed,
            latency: Duration::ZERO,
            cost: CostModel::default(),
            healthy: AtomicBool::new(true),
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    /// Steps played before the fallback.
    pub fn with_script(self, steps: impl IntoIterator<Item = ScriptStep>) -> Self {
        *self.script_lock() = steps.into_iter().collect();
        self
    }

    /// Step repeated once the script is exhausted.
    pub fn with_fallback(mut self, step: ScriptStep) -> Self {
        self.fallback = step;
        self
    }

    /// Simulated network latency per call (uses tokio time, so paused
    /// clocks apply).
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_cost(mut self, cost: CostModel) -> Self {
        self.cost = cost;
        self
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Total `generate` calls so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Most `generate` calls that were running at the same time.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Request ids in call order.
    pub fn seen_requests(&self) -> Vec<RequestId> {
        self.seen.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn script_lock(&self) -> std::sync::MutexGuard<'_, VecDeque<ScriptStep>> {
        self.script.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Counts one running call; released on drop so timed-out calls are
/// counted out too.
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(provider: &'a ScriptedProvider) -> Self {
        let now = provider.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        provider.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(&provider.in_flight)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ProviderAdapter for ScriptedProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn media_types(&self) -> &[MediaType] {
        &self.media_types
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<Asset, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let _in_flight = InFlight::enter(self);
        self.seen
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(request.id);
        let step = self
            .script_lock()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        match step {
            ScriptStep::Succeed => fixture_asset(&self.id, request),
            ScriptStep::Fail(error) => Err(error),
            ScriptStep::Bytes(bytes) => Ok(Asset::new(
                self.id.clone(),
                request.media_type,
                "application/octet-stream",
                bytes,
            )),
        }
    }

    fn estimate_cost(&self, request: &GenerationRequest) -> Usd {
        self.cost.estimate(&request.parameters)
    }

    async fn health_check(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn plays_script_then_fallback() {
        let provider = ScriptedProvider::new("p", vec![MediaType::Image]).with_script([
            ScriptStep::Fail(ProviderError::Transient("503".into())),
            ScriptStep::Fail(ProviderError::Timeout),
        ]);
        let request = GenerationRequest::new("s", MediaType::Image, "p");

        assert_matches!(provider.generate(&request).await, Err(ProviderError::Transient(_)));
        assert_matches!(provider.generate(&request).await, Err(ProviderError::Timeout));
        assert!(provider.generate(&request).await.is_ok());
        assert!(provider.generate(&request).await.is_ok());
        assert_eq!(provider.calls(), 4);
        assert_eq!(provider.seen_requests(), vec![request.id; 4]);
    }

    #[tokio::test]
    async fn bytes_step_returns_raw_payload() {
        let provider = ScriptedProvider::new("p", vec![MediaType::Video])
            .with_fallback(ScriptStep::Bytes(b"not a video".to_vec()));
        let request = GenerationRequest::new("s", MediaType::Video, "p");
        let asset = provider.generate(&request).await.unwrap();
        assert_eq!(asset.bytes, b"not a video");
    }

    #[tokio::test(start_paused = true)]
    async fn latency_uses_tokio_clock() {
        let provider = ScriptedProvider::new("p", vec![MediaType::Audio])
            .with_latency(Duration::from_secs(30));
        let request = GenerationRequest::new("s", MediaType::Audio, "hello");
        let start = tokio::time::Instant::now();
        provider.generate(&request).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_calls_raise_the_peak() {
        let provider = ScriptedProvider::new("p", vec![MediaType::Image])
            .with_latency(Duration::from_millis(50));
        let requests: Vec<_> = (0..3)
            .map(|i| GenerationRequest::new("s", MediaType::Image, format!("frame {i}")))
            .collect();

        let (a, b, c) = tokio::join!(
            provider.generate(&requests[0]),
            provider.generate(&requests[1]),
            provider.generate(&requests[2]),
        );
        assert!(a.is_ok() && b.is_ok() && c.is_ok());
        assert_eq!(provider.peak_in_flight(), 3);

        provider.generate(&requests[0]).await.unwrap();
        assert_eq!(provider.peak_in_flight(), 3);
        assert_eq!(provider.in_flight.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn health_is_switchable() {
        let provider = ScriptedProvider::new("p", vec![MediaType::Audio]);
        assert!(provider.health_check().await);
        provider.set_healthy(false);
        assert!(!provider.health_check().await);
    }
}
