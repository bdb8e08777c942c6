//! Exponential backoff with jitter, as an explicit state object.
//!
//! `delay = min(max_delay, base * 2^retry) * jitter`, with `jitter` drawn
//! from `[0.5, 1.5)` and the result clamped to `max_delay` again so the bound
//! holds after jitter. [`RetryState`] tracks the attempt count so a caller
//! can drive retries from a plain loop, check cancellation between steps and
//! test the sequence deterministically by supplying the jitter.

use std::time::Duration;

use rand::Rng;

use crate::config::RetrySettings;

/// Lower bound of the jitter factor.
pub const JITTER_MIN: f64 = 0.5;
/// Upper bound (exclusive) of the jitter factor.
pub const JITTER_MAX: f64 = 1.5;

/// Draw a jitter factor from `[JITTER_MIN, JITTER_MAX)`.
pub fn random_jitter() -> f64 {
    rand::rng().random_range(JITTER_MIN..JITTER_MAX)
}

/// Immutable backoff curve for one media type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    pub max_attempts: u32,
}

impl BackoffPolicy {
    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self {
            base: settings.base_delay(),
            max: settings.max_delay(),
            max_attempts: settings.max_attempts,
        }
    }

    /// Delay before retry number `retry` (0 = first retry) without jitter.
    pub fn nominal_delay(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry);
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Jittered delay, clamped to `max`. `jitter` is clamped to the valid
    /// range first.
    pub fn jittered_delay(&self, retry: u32, jitter: f64) -> Duration {
        let jitter = jitter.clamp(JITTER_MIN, JITTER_MAX);
        self.nominal_delay(retry).mul_f64(jitter).min(self.max)
    }
}

/// Progress of one request through its retry budget.
#[derive(Debug, Clone)]
pub struct RetryState {
    policy: BackoffPolicy,
    attempts: u32,
    delays: Vec<Duration>,
}

impl RetryState {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
            delays: Vec::new(),
        }
    }

    /// Record the start of an attempt and return its 1-based number.
    pub fn begin_attempt(&mut self) -> u32 {
        self.attempts += 1;
        self.attempts
    }

    /// Attempts started so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Whether another attempt fits in the budget.
    pub fn can_retry(&self) -> bool {
        self.attempts < self.policy.max_attempts
    }

    /// Delays handed out so far, in order.
    pub fn delays(&self) -> &[Duration] {
        &self.delays
    }

    /// Compute the wait before the next attempt, or `None` if the budget is
    /// exhausted. A provider-specified `retry_after` raises the delay but the
    /// result never exceeds the policy maximum.
    pub fn next_delay(&mut self, jitter: f64, retry_after: Option<Duration>) -> Option<Duration> {
        if !self.can_retry() || self.attempts == 0 {
            return None;
        }
        let retry = self.attempts - 1;
        let mut delay = self.policy.jittered_delay(retry, jitter);
        if let Some(hint) = retry_after {
            delay = delay.max(hint).min(self.policy.max);
        }
        self.delays.push(delay);
        Some(delay)
    }
}
