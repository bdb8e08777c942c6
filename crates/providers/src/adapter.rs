//! The provider contract.

use std::sync::Arc;

use async_trait::async_trait;
use reelgen_core::asset::Asset;
use reelgen_core::media::MediaType;
use reelgen_core::request::GenerationRequest;
use reelgen_core::types::Usd;

use crate::error::ProviderError;

/// Uniform interface to one generation capability.
///
/// Implementations hold no state beyond connection configuration and must
/// be idempotent for identical requests so retries are safe.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Stable identifier used for breakers, logs and sidecars.
    fn id(&self) -> &str;

    /// Media types this provider can generate.
    fn media_types(&self) -> &[MediaType];

    /// Generate one asset. Never retries.
    async fn generate(&self, request: &GenerationRequest) -> Result<Asset, ProviderError>;

    /// Best-effort cost of serving `request`.
    fn estimate_cost(&self, request: &GenerationRequest) -> Usd;

    /// Cheap liveness probe.
    async fn health_check(&self) -> bool;

    fn serves(&self, media: MediaType) -> bool {
        self.media_types().contains(&media)
    }
}

/// Shared handle to a provider.
pub type ProviderHandle = Arc<dyn ProviderAdapter>;
