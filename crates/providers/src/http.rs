//! JSON-over-HTTP reference provider.
//!
//! Wire contract:
//!
//! | Method | Path        | Description                                   |
//! |--------|-------------|-----------------------------------------------|
//! | POST   | `/generate` | JSON request body, raw asset bytes on success |
//! | GET    | `/health`   | Any 2xx means healthy                         |
//!
//! Success responses carry the asset's `content-type` and optionally an
//! `x-content-crc32` header. Status codes map onto [`ProviderError`]:
//! 429 is `RateLimited` (honouring `retry-after` seconds), 401/403 are
//! `AuthFailure`, 400/422/451 are `ContentRejected`, 408/504 are `Timeout`
//! and any other failure is `Transient`.

use std::time::Duration;

use async_trait::async_trait;
use reelgen_core::asset::Asset;
use reelgen_core::config::CostModel;
use reelgen_core::media::MediaType;
use reelgen_core::request::GenerationRequest;
use reelgen_core::types::Usd;
use serde::Serialize;

use crate::adapter::ProviderAdapter;
use crate::error::ProviderError;

/// Header carrying the producer's CRC32 of the body.
pub const CRC32_HEADER: &str = "x-content-crc32";

/// Longest error body kept in an error message.
const MAX_ERROR_BODY_CHARS: usize = 512;

/// Request body sent to `POST /generate`.
#[derive(Debug, Serialize)]
struct GenerateBody<'a> {
    request_id: uuid::Uuid,
    media_type: MediaType,
    prompt: &'a str,
    parameters: &'a serde_json::Value,
}

/// HTTP provider for one generation service.
pub struct HttpProvider {
    id: String,
    media_types: Vec<MediaType>,
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    cost: CostModel,
}

impl HttpProvider {
    /// Create a provider. `base_url` has any trailing slash removed.
    pub fn new(
        id: impl Into<String>,
        media_types: Vec<MediaType>,
        base_url: impl Into<String>,
        api_key: Option<String>,
        cost: CostModel,
    ) -> Self {
        Self::with_client(reqwest::Client::new(), id, media_types, base_url, api_key, cost)
    }

    /// Create a provider reusing an existing [`reqwest::Client`].
    pub fn with_client(
        client: reqwest::Client,
        id: impl Into<String>,
        media_types: Vec<MediaType>,
        base_url: impl Into<String>,
        api_key: Option<String>,
        cost: CostModel,
    ) -> Self {
        let base_url: String = base_url.into();
        Self {
            id: id.into(),
            media_types,
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            cost,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    /// Map a non-success response onto the error taxonomy.
    async fn classify_failure(response: reqwest::Response) -> ProviderError {
        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let body: String = response
            .text()
            .await
            .unwrap_or_else(|_| "<unreadable body>".to_string())
            .chars()
            .take(MAX_ERROR_BODY_CHARS)
            .collect();

        match status {
            429 => ProviderError::RateLimited { retry_after },
            401 | 403 => ProviderError::AuthFailure(format!("HTTP {status}: {body}")),
            400 | 422 | 451 => ProviderError::ContentRejected(format!("HTTP {status}: {body}")),
            408 | 504 => ProviderError::Timeout,
            _ => ProviderError::Transient(format!("HTTP {status}: {body}")),
        }
    }

    fn classify_transport(error: reqwest::Error) -> ProviderError {
        if error.is_timeout() {
            ProviderError::Timeout
        } else {
            // Strip the URL: it may carry credentials in its query string.
            ProviderError::Transient(error.without_url().to_string())
        }
    }
}

#[async_trait]
impl ProviderAdapter for HttpProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn media_types(&self) -> &[MediaType] {
        &self.media_types
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<Asset, ProviderError> {
        let body = GenerateBody {
            request_id: request.id,
            media_type: request.media_type,
            prompt: &request.prompt,
            parameters: &request.parameters,
        };
        let response = self
            .authorize(self.client.post(format!("{}/generate", self.base_url)))
            .json(&body)
            .send()
            .await
            .map_err(Self::classify_transport)?;

        if !response.status().is_success() {
            return Err(Self::classify_failure(response).await);
        }

        let headers = response.headers();
        let content_type = headers
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();
        let declared_crc32 = headers
            .get(CRC32_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim().to_ascii_lowercase());

        let bytes = response
            .bytes()
            .await
            .map_err(Self::classify_transport)?
            .to_vec();

        let mut asset = Asset::new(self.id.clone(), request.media_type, content_type, bytes);
        if let Some(crc) = declared_crc32 {
            asset = asset.with_declared_crc32(crc);
        }
        Ok(asset)
    }

    fn estimate_cost(&self, request: &GenerationRequest) -> Usd {
        self.cost.estimate(&request.parameters)
    }

    async fn health_check(&self) -> bool {
        match self
            .authorize(self.client.get(format!("{}/health", self.base_url)))
            .timeout(Duration::from_secs(5))
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                tracing::debug!(
                    provider_id = %self.id,
                    error = %e.without_url(),
                    "Provider health check failed"
                );
                false
            }
        }
    }
}
