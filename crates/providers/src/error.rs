use std::time::Duration;

use reelgen_core::breaker::AttemptOutcome;

/// Typed failure of a single provider call.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProviderError {
    /// Provider asked us to slow down, optionally saying for how long.
    #[error("Rate limited by provider{}", retry_hint(.retry_after))]
    RateLimited { retry_after: Option<Duration> },

    /// Network failure or server-side error worth retrying.
    #[error("Transient provider failure: {0}")]
    Transient(String),

    /// Credentials missing or refused. Surfaced to the operator.
    #[error("Provider authentication failed: {0}")]
    AuthFailure(String),

    /// The provider refused the content. Surfaced to the end user.
    #[error("Content rejected by provider: {0}")]
    ContentRejected(String),

    #[error("Provider call timed out")]
    Timeout,
}

fn retry_hint(retry_after: &Option<Duration>) -> String {
    retry_after
        .map(|d| format!(", retry after {}ms", d.as_millis()))
        .unwrap_or_default()
}

impl ProviderError {
    /// `Transient`, `Timeout` and `RateLimited` are retried; the rest are
    /// terminal for the request.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::Transient(_) | ProviderError::Timeout | ProviderError::RateLimited { .. }
        )
    }

    /// Provider-specified wait before the next attempt.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ProviderError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// How the breaker sees this failure.
    pub fn attempt_outcome(&self) -> AttemptOutcome {
        match self {
            ProviderError::RateLimited { .. } => AttemptOutcome::RateLimited,
            ProviderError::Transient(_) => AttemptOutcome::Transient,
            ProviderError::AuthFailure(_) => AttemptOutcome::AuthFailure,
            ProviderError::ContentRejected(_) => AttemptOutcome::ContentRejected,
            ProviderError::Timeout => AttemptOutcome::Timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(ProviderError::Transient("503".into()).is_retryable());
        assert!(ProviderError::Timeout.is_retryable());
        assert!(ProviderError::RateLimited { retry_after: None }.is_retryable());
        assert!(!ProviderError::AuthFailure("bad key".into()).is_retryable());
        assert!(!ProviderError::ContentRejected("nsfw".into()).is_retryable());
    }

    #[test]
    fn content_rejection_is_healthy_for_breaker() {
        assert!(!ProviderError::ContentRejected("x".into()).attempt_outcome().is_failure());
        assert!(ProviderError::AuthFailure("x".into()).attempt_outcome().is_failure());
    }

    #[test]
    fn rate_limit_message_includes_hint() {
        let err = ProviderError::RateLimited {
            retry_after: Some(Duration::from_secs(2)),
        };
        assert_eq!(err.to_string(), "Rate limited by provider, retry after 2000ms");
        assert_eq!(err.retry_after(), Some(Duration::from_secs(2)));
    }
}
