use reelgen_core::types::ProviderId;
use reelgen_events::ErrorCategory;
use reelgen_providers::ProviderError;
use serde::Serialize;

/// Terminal failure of one request. Never aborts the batch.
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum PipelineError {
    #[error("Transient provider failure: {0}")]
    Transient(String),

    #[error("Provider call timed out")]
    Timeout,

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Provider authentication failed: {0}")]
    AuthFailure(String),

    #[error("Content rejected: {0}")]
    ContentRejected(String),

    #[error("Circuit open for provider '{provider_id}'")]
    CircuitOpen { provider_id: ProviderId },

    #[error("Asset corrupt and unrecoverable: {detail}")]
    CorruptionUnrecoverable { detail: String, quarantine_path: String },

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            PipelineError::Transient(_) => ErrorCategory::Transient,
            PipelineError::Timeout => ErrorCategory::Timeout,
            PipelineError::RateLimited(_) => ErrorCategory::RateLimited,
            PipelineError::AuthFailure(_) => ErrorCategory::AuthFailure,
            PipelineError::ContentRejected(_) => ErrorCategory::ContentRejected,
            PipelineError::CircuitOpen { .. } => ErrorCategory::CircuitOpen,
            PipelineError::CorruptionUnrecoverable { .. } => ErrorCategory::CorruptionUnrecoverable,
            PipelineError::ServiceUnavailable(_) => ErrorCategory::ServiceUnavailable,
            PipelineError::Cancelled => ErrorCategory::Cancelled,
            PipelineError::Storage(_) => ErrorCategory::Storage,
            PipelineError::Internal(_) => ErrorCategory::Internal,
        }
    }

    /// Whether the failure says something about system health. Caller-side
    /// refusals (rejected content, cancellation, degradation itself) do not
    /// feed the error-rate window.
    pub fn counts_against_health(&self) -> bool {
        !matches!(
            self,
            PipelineError::ContentRejected(_)
                | PipelineError::Cancelled
                | PipelineError::ServiceUnavailable(_)
        )
    }
}

impl From<ProviderError> for PipelineError {
    fn from(error: ProviderError) -> Self {
        match error {
            ProviderError::Transient(msg) => PipelineError::Transient(msg),
            ProviderError::Timeout => PipelineError::Timeout,
            e @ ProviderError::RateLimited { .. } => PipelineError::RateLimited(e.to_string()),
            ProviderError::AuthFailure(msg) => PipelineError::AuthFailure(msg),
            ProviderError::ContentRejected(msg) => PipelineError::ContentRejected(msg),
        }
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(error: std::io::Error) -> Self {
        PipelineError::Storage(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_kind_tag() {
        let json = serde_json::to_value(PipelineError::CircuitOpen {
            provider_id: "img".to_string(),
        })
        .unwrap();
        assert_eq!(json["kind"], "circuit_open");
        assert_eq!(json["detail"]["provider_id"], "img");
        assert_eq!(serde_json::to_value(PipelineError::Timeout).unwrap()["kind"], "timeout");
    }

    #[test]
    fn provider_errors_keep_their_category() {
        let e: PipelineError = ProviderError::RateLimited { retry_after: None }.into();
        assert_eq!(e.category(), ErrorCategory::RateLimited);
        let e: PipelineError = ProviderError::ContentRejected("nope".into()).into();
        assert!(!e.counts_against_health());
    }
}
