//! Retry and circuit-breaker wrapper around provider calls.
//!
//! [`ResilientCaller::call`] drives one request through its retry budget:
//! each attempt is admitted by the provider's breaker, bounded by the media
//! type's call timeout, recorded as a [`ProviderCallAttempt`], and followed
//! by a jittered backoff sleep that the batch's cancellation token can cut
//! short. Attempts for one request are strictly sequential.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use reelgen_core::asset::Asset;
use reelgen_core::backoff::{random_jitter, BackoffPolicy, RetryState};
use reelgen_core::breaker::{AttemptOutcome, ProviderCallAttempt};
use reelgen_core::config::MediaSettings;
use reelgen_core::request::GenerationRequest;
use reelgen_core::types::BatchId;
use reelgen_events::ErrorLog;
use reelgen_providers::{ProviderError, ProviderHandle};
use tokio_util::sync::CancellationToken;

use crate::breakers::{now, BreakerRegistry};
use crate::error::PipelineError;

/// Result of driving one request through its retry budget.
#[derive(Debug)]
pub struct CallReport {
    pub result: Result<Asset, PipelineError>,
    /// Network attempts made. Breaker rejections are not attempts.
    pub attempts: u32,
    /// Backoff delays slept (or cut short) between attempts.
    pub delays: Vec<Duration>,
}

/// Retry/breaker wrapper shared by every worker.
#[derive(Clone)]
pub struct ResilientCaller {
    breakers: Arc<BreakerRegistry>,
    errors: Arc<ErrorLog>,
    jitter: fn() -> f64,
}

impl ResilientCaller {
    pub fn new(breakers: Arc<BreakerRegistry>, errors: Arc<ErrorLog>) -> Self {
        Self {
            breakers,
            errors,
            jitter: random_jitter,
        }
    }

    /// Replace the jitter source, e.g. with a constant for reproducible
    /// delays.
    pub fn with_jitter(mut self, jitter: fn() -> f64) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    /// Call `provider` for `request` with retries.
    ///
    /// `on_retry(next_attempt, delay)` runs before every backoff sleep.
    pub async fn call(
        &self,
        provider: &ProviderHandle,
        request: &GenerationRequest,
        settings: &MediaSettings,
        batch_id: Option<BatchId>,
        cancel: &CancellationToken,
        mut on_retry: impl FnMut(u32, Duration),
    ) -> CallReport {
        let provider_id = provider.id().to_string();
        let mut state = RetryState::new(BackoffPolicy::from_settings(&settings.retry));

        let result = loop {
            if cancel.is_cancelled() {
                break Err(PipelineError::Cancelled);
            }

            let permit = match self.breakers.admit(&provider_id) {
                Ok(permit) => permit,
                Err(retry_in) => {
                    let error = PipelineError::CircuitOpen {
                        provider_id: provider_id.clone(),
                    };
                    self.errors.record(
                        request.id,
                        batch_id,
                        error.category(),
                        "breaker",
                        &format!("{error}; next probe in {}ms", retry_in.as_millis()),
                    );
                    break Err(error);
                }
            };

            let attempt_number = state.begin_attempt();
            let started_at = Utc::now();
            let started = now();
            tracing::debug!(
                request_id = %request.id,
                provider_id = %provider_id,
                attempt = attempt_number,
                probe = permit.is_probe(),
                "Calling provider"
            );

            let call = tokio::time::timeout(settings.call_timeout(), provider.generate(request));
            let outcome = match call.await {
                Ok(result) => result,
                Err(_) => Err(ProviderError::Timeout),
            };

            permit.record(ProviderCallAttempt {
                request_id: request.id,
                provider_id: provider_id.clone(),
                attempt_number,
                started_at,
                outcome: match &outcome {
                    Ok(_) => AttemptOutcome::Success,
                    Err(e) => e.attempt_outcome(),
                },
                latency: now().saturating_duration_since(started),
                started: Some(started),
            });

            let error = match outcome {
                Ok(asset) => break Ok(asset),
                Err(error) => error,
            };

            let pipeline_error = PipelineError::from(error.clone());
            self.errors.record(
                request.id,
                batch_id,
                pipeline_error.category(),
                "adapter",
                &format!("attempt {attempt_number} via {provider_id}: {error}"),
            );
            if !error.is_retryable() {
                break Err(pipeline_error);
            }
            let Some(delay) = state.next_delay((self.jitter)(), error.retry_after()) else {
                break Err(pipeline_error);
            };

            tracing::warn!(
                request_id = %request.id,
                provider_id = %provider_id,
                attempt = attempt_number,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Provider call failed, retrying"
            );
            on_retry(attempt_number + 1, delay);

            tokio::select! {
                _ = cancel.cancelled() => break Err(PipelineError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        };

        CallReport {
            result,
            attempts: state.attempts(),
            delays: state.delays().to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use reelgen_core::breaker::BreakerState;
    use reelgen_core::config::{BreakerSettings, RetrySettings};
    use reelgen_core::media::MediaType;
    use reelgen_providers::{ScriptStep, ScriptedProvider};

    fn media_settings() -> MediaSettings {
        MediaSettings {
            retry: RetrySettings {
                max_attempts: 3,
                base_delay_ms: 100,
                max_delay_ms: 1_000,
            },
            call_timeout_ms: 5_000,
            max_in_flight: 4,
            similarity_threshold: 0.9,
        }
    }

    fn caller(threshold: u32) -> ResilientCaller {
        let settings = BreakerSettings {
            failure_threshold: threshold,
            ..BreakerSettings::default()
        };
        ResilientCaller::new(
            Arc::new(BreakerRegistry::new(settings, ["p"])),
            Arc::new(ErrorLog::new()),
        )
        .with_jitter(|| 1.0)
    }

    fn transient() -> ScriptStep {
        ScriptStep::Fail(ProviderError::Transient("503".into()))
    }

    fn request() -> GenerationRequest {
        GenerationRequest::new("scene", MediaType::Image, "a quiet harbor")
    }

    fn image_provider() -> ScriptedProvider {
        ScriptedProvider::new("p", vec![MediaType::Image])
    }

    /// One uncancelled call that ignores retry notifications.
    async fn call(caller: &ResilientCaller, handle: &ProviderHandle) -> CallReport {
        caller
            .call(handle, &request(), &media_settings(), None, &CancellationToken::new(), |_, _| {})
            .await
    }

    // -- retries --

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_two_transient_failures() {
        let provider = Arc::new(image_provider().with_script([transient(), transient()]));
        let handle: ProviderHandle = provider.clone();
        let caller = caller(5);
        let mut retries = Vec::new();

        let report = caller
            .call(&handle, &request(), &media_settings(), None, &CancellationToken::new(), |n, d| {
                retries.push((n, d))
            })
            .await;

        assert!(report.result.is_ok());
        assert_eq!(report.attempts, 3);
        assert_eq!(provider.calls(), 3);
        assert_eq!(report.delays, vec![Duration::from_millis(100), Duration::from_millis(200)]);
        assert_eq!(retries.len(), 2);
        assert_eq!(retries[0].0, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let provider = Arc::new(image_provider().with_fallback(transient()));
        let handle: ProviderHandle = provider.clone();
        let report = call(&caller(10), &handle).await;
        assert_matches!(report.result, Err(PipelineError::Transient(_)));
        assert_eq!(report.attempts, 3);
        assert_eq!(provider.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_errors_are_not_retried() {
        for step in [
            ScriptStep::Fail(ProviderError::AuthFailure("bad key".into())),
            ScriptStep::Fail(ProviderError::ContentRejected("policy".into())),
        ] {
            let provider = Arc::new(image_provider().with_fallback(step));
            let handle: ProviderHandle = provider.clone();
            let report = call(&caller(5), &handle).await;
            assert!(report.result.is_err());
            assert_eq!(provider.calls(), 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_hint_raises_delay_up_to_max() {
        let provider = Arc::new(image_provider().with_script([
            ScriptStep::Fail(ProviderError::RateLimited {
                retry_after: Some(Duration::from_millis(400)),
            }),
            ScriptStep::Fail(ProviderError::RateLimited {
                retry_after: Some(Duration::from_secs(60)),
            }),
        ]));
        let handle: ProviderHandle = provider.clone();
        let report = call(&caller(10), &handle).await;
        assert!(report.result.is_ok());
        assert_eq!(report.delays, vec![Duration::from_millis(400), Duration::from_millis(1_000)]);
    }

    // -- timeouts --

    #[tokio::test(start_paused = true)]
    async fn slow_calls_time_out_and_retry() {
        let provider = Arc::new(image_provider().with_latency(Duration::from_secs(60)));
        let handle: ProviderHandle = provider.clone();
        let report = call(&caller(10), &handle).await;
        assert_matches!(report.result, Err(PipelineError::Timeout));
        assert_eq!(report.attempts, 3);
    }

    // -- breaker --

    #[tokio::test(start_paused = true)]
    async fn open_breaker_fails_fast_without_a_call() {
        let provider = Arc::new(image_provider().with_fallback(transient()));
        let handle: ProviderHandle = provider.clone();
        let caller = caller(2);

        let report = call(&caller, &handle).await;
        // The breaker opened after the second attempt, abandoning the third.
        assert_matches!(report.result, Err(PipelineError::CircuitOpen { .. }));
        assert_eq!(report.attempts, 2);
        assert_eq!(caller.breakers().state("p"), BreakerState::Open);

        let report = call(&caller, &handle).await;
        assert_matches!(report.result, Err(PipelineError::CircuitOpen { .. }));
        assert_eq!(report.attempts, 0);
        assert_eq!(provider.calls(), 2);
    }

    // -- cancellation --

    #[tokio::test(start_paused = true)]
    async fn cancellation_cuts_backoff_short() {
        let provider = Arc::new(image_provider().with_fallback(transient()));
        let handle: ProviderHandle = provider.clone();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();

        let report = caller(10)
            .call(&handle, &request(), &media_settings(), None, &cancel, move |_, _| {
                trigger.cancel()
            })
            .await;
        assert_matches!(report.result, Err(PipelineError::Cancelled));
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn cancelled_before_start_makes_no_call() {
        let provider = Arc::new(image_provider());
        let handle: ProviderHandle = provider.clone();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = caller(5)
            .call(&handle, &request(), &media_settings(), None, &cancel, |_, _| {})
            .await;
        assert_matches!(report.result, Err(PipelineError::Cancelled));
        assert_eq!(provider.calls(), 0);
    }

    // -- error log --

    #[tokio::test(start_paused = true)]
    async fn every_failed_attempt_is_logged() {
        let provider = Arc::new(image_provider().with_script([transient(), transient()]));
        let handle: ProviderHandle = provider.clone();
        let errors = Arc::new(ErrorLog::new());
        let caller = ResilientCaller::new(
            Arc::new(BreakerRegistry::new(BreakerSettings::default(), ["p"])),
            errors.clone(),
        );
        let req = request();
        caller
            .call(&handle, &req, &media_settings(), None, &CancellationToken::new(), |_, _| {})
            .await;
        let records = errors.records_for(req.id);
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.component == "adapter"));
    }
}
