//! Provider registry.
//!
//! Maps configured provider entries onto concrete implementations and
//! answers "who can generate this media type", in configuration order.

use std::sync::Arc;

use reelgen_core::config::{ProviderConfig, ProviderKind};
use reelgen_core::error::CoreError;
use reelgen_core::media::MediaType;

use crate::adapter::{ProviderAdapter, ProviderHandle};
use crate::fixture::FixtureProvider;
use crate::http::HttpProvider;

/// Ordered set of providers.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: Vec<ProviderHandle>,
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.providers.iter().map(|p| p.id()))
            .finish()
    }
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build every configured provider. API keys are read from the env var
    /// named by `api_key_env`; a named but unset variable is a config error.
    pub fn from_config(configs: &[ProviderConfig]) -> Result<Self, CoreError> {
        Self::from_config_with(configs, |name| std::env::var(name).ok())
    }

    /// [`from_config`](Self::from_config) with an explicit env lookup.
    pub fn from_config_with(
        configs: &[ProviderConfig],
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, CoreError> {
        let client = reqwest::Client::new();
        let mut registry = Self::new();
        for config in configs {
            let provider: ProviderHandle = match &config.kind {
                ProviderKind::Http { base_url, api_key_env } => {
                    let api_key = match api_key_env {
                        Some(var) => Some(lookup(var).ok_or_else(|| {
                            CoreError::Validation(format!(
                                "Provider '{}' expects its API key in {var}, which is not set",
                                config.id
                            ))
                        })?),
                        None => None,
                    };
                    Arc::new(HttpProvider::with_client(
                        client.clone(),
                        config.id.clone(),
                        config.media_types.clone(),
                        base_url.clone(),
                        api_key,
                        config.cost.clone(),
                    ))
                }
                ProviderKind::Fixture => Arc::new(FixtureProvider::new(
                    config.id.clone(),
                    config.media_types.clone(),
                    config.cost.clone(),
                )),
            };
            registry.register(provider)?;
        }
        Ok(registry)
    }

    /// Add a provider. Ids must be unique.
    pub fn register(&mut self, provider: ProviderHandle) -> Result<(), CoreError> {
        if self.get(provider.id()).is_some() {
            return Err(CoreError::Conflict(format!(
                "Provider '{}' is already registered",
                provider.id()
            )));
        }
        tracing::debug!(
            provider_id = provider.id(),
            media_types = ?provider.media_types(),
            "Provider registered"
        );
        self.providers.push(provider);
        Ok(())
    }

    /// Builder form of [`register`](Self::register) for code that owns a
    /// concrete provider.
    pub fn with<P: ProviderAdapter + 'static>(
        mut self,
        provider: Arc<P>,
    ) -> Result<Self, CoreError> {
        self.register(provider)?;
        Ok(self)
    }

    pub fn get(&self, id: &str) -> Option<&ProviderHandle> {
        self.providers.iter().find(|p| p.id() == id)
    }

    /// Providers serving `media`, in registration order.
    pub fn candidates(&self, media: MediaType) -> Vec<ProviderHandle> {
        self.providers
            .iter()
            .filter(|p| p.serves(media))
            .cloned()
            .collect()
    }

    pub fn all(&self) -> &[ProviderHandle] {
        &self.providers
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}
