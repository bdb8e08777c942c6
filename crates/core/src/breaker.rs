//! Circuit breaker state machine for one provider.
//!
//! Pure logic: the caller supplies `now` and serializes access (one mutex per
//! provider). The consecutive-failure count is recomputed from the retained
//! attempt history on every record, so transitions always follow the
//! recorded attempts.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::config::BreakerSettings;
use crate::types::{ProviderId, RequestId, Timestamp};

// ---------------------------------------------------------------------------
// Attempts
// ---------------------------------------------------------------------------

/// Outcome of a single provider call as seen by the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    Transient,
    RateLimited,
    Timeout,
    AuthFailure,
    /// The provider answered and refused the content; it is healthy.
    ContentRejected,
}

impl AttemptOutcome {
    /// Whether the outcome counts against provider health.
    pub fn is_failure(self) -> bool {
        matches!(
            self,
            AttemptOutcome::Transient
                | AttemptOutcome::RateLimited
                | AttemptOutcome::Timeout
                | AttemptOutcome::AuthFailure
        )
    }
}

/// One provider call made on behalf of a request. Append-only.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderCallAttempt {
    pub request_id: RequestId,
    pub provider_id: ProviderId,
    /// 1-based attempt number within the request's retry sequence.
    pub attempt_number: u32,
    pub started_at: Timestamp,
    pub outcome: AttemptOutcome,
    #[serde(with = "duration_ms")]
    pub latency: Duration,
    #[serde(skip)]
    pub started: Option<Instant>,
}

mod duration_ms {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

/// Decision for a call about to be made.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Breaker closed: call normally.
    Allowed,
    /// This call is the single half-open probe.
    Probe,
    /// Fail fast without a network call.
    Rejected { retry_in: Duration },
}

/// A state change, for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerTransition {
    pub from: BreakerState,
    pub to: BreakerState,
}

/// Serializable view of a breaker.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub provider_id: ProviderId,
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub open_for_ms: Option<u64>,
    pub next_probe_in_ms: Option<u64>,
    pub cooldown_ms: u64,
    pub times_opened: u64,
    pub recorded_attempts: usize,
}

/// Circuit breaker for one provider.
#[derive(Debug)]
pub struct CircuitBreaker {
    provider_id: ProviderId,
    settings: BreakerSettings,
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    next_probe_at: Option<Instant>,
    cooldown: Duration,
    probe_in_flight: bool,
    times_opened: u64,
    history: VecDeque<ProviderCallAttempt>,
}

impl CircuitBreaker {
    pub fn new(provider_id: impl Into<ProviderId>, settings: BreakerSettings) -> Self {
        let cooldown = settings.base_cooldown();
        Self {
            provider_id: provider_id.into(),
            settings,
            state: BreakerState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            next_probe_at: None,
            cooldown,
            probe_in_flight: false,
            times_opened: 0,
            history: VecDeque::new(),
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn history(&self) -> impl Iterator<Item = &ProviderCallAttempt> {
        self.history.iter()
    }

    /// Whether [`admit`](Self::admit) at `now` would let a call through,
    /// without changing state.
    pub fn accepts(&self, now: Instant) -> bool {
        match self.state {
            BreakerState::Closed => true,
            BreakerState::Open => self.next_probe_at.map_or(true, |at| now >= at),
            BreakerState::HalfOpen => !self.probe_in_flight,
        }
    }

    /// Decide whether a call may proceed at `now`.
    ///
    /// An open breaker whose cooldown has elapsed moves to half-open and
    /// admits exactly one probe; every other caller is rejected until the
    /// probe's outcome is recorded.
    pub fn admit(&mut self, now: Instant) -> Admission {
        match self.state {
            BreakerState::Closed => Admission::Allowed,
            BreakerState::Open => {
                let probe_at = self.next_probe_at.unwrap_or(now);
                if now >= probe_at {
                    self.state = BreakerState::HalfOpen;
                    self.probe_in_flight = true;
                    Admission::Probe
                } else {
                    Admission::Rejected {
                        retry_in: probe_at - now,
                    }
                }
            }
            BreakerState::HalfOpen => {
                if self.probe_in_flight {
                    Admission::Rejected {
                        retry_in: Duration::ZERO,
                    }
                } else {
                    self.probe_in_flight = true;
                    Admission::Probe
                }
            }
        }
    }

    /// Give back an admitted probe that ended without an outcome (e.g. the
    /// batch was cancelled), so the next caller may probe instead.
    pub fn release_probe(&mut self) {
        if self.state == BreakerState::HalfOpen {
            self.probe_in_flight = false;
        }
    }

    /// Record a finished attempt and apply any resulting transition.
    pub fn record(
        &mut self,
        attempt: ProviderCallAttempt,
        now: Instant,
    ) -> Option<BreakerTransition> {
        let failed = attempt.outcome.is_failure();
        self.history.push_back(attempt);
        while self.history.len() > self.settings.history_len.max(1) {
            self.history.pop_front();
        }
        self.consecutive_failures = self.trailing_failures(now);

        let from = self.state;
        match self.state {
            BreakerState::HalfOpen => {
                self.probe_in_flight = false;
                if failed {
                    let doubled = self.cooldown.saturating_mul(2);
                    self.cooldown = doubled.min(self.settings.max_cooldown());
                    self.open(now);
                } else {
                    self.state = BreakerState::Closed;
                    self.consecutive_failures = 0;
                    self.cooldown = self.settings.base_cooldown();
                    self.opened_at = None;
                    self.next_probe_at = None;
                }
            }
            BreakerState::Closed => {
                if failed && self.consecutive_failures >= self.settings.failure_threshold {
                    self.cooldown = self.settings.base_cooldown();
                    self.open(now);
                }
            }
            // Late results from calls admitted before the breaker opened.
            BreakerState::Open => {}
        }

        (from != self.state).then_some(BreakerTransition {
            from,
            to: self.state,
        })
    }

    /// Snapshot relative to `now`.
    pub fn snapshot(&self, now: Instant) -> BreakerSnapshot {
        BreakerSnapshot {
            provider_id: self.provider_id.clone(),
            state: self.state,
            consecutive_failures: self.consecutive_failures,
            open_for_ms: self
                .opened_at
                .map(|at| now.saturating_duration_since(at).as_millis() as u64),
            next_probe_in_ms: self
                .next_probe_at
                .map(|at| at.saturating_duration_since(now).as_millis() as u64),
            cooldown_ms: self.cooldown.as_millis() as u64,
            times_opened: self.times_opened,
            recorded_attempts: self.history.len(),
        }
    }

    fn open(&mut self, now: Instant) {
        self.state = BreakerState::Open;
        self.opened_at = Some(now);
        self.next_probe_at = Some(now + self.cooldown);
        self.times_opened += 1;
    }

    /// Count failures at the end of the history, stopping at the first
    /// success or at an attempt older than the sliding window.
    fn trailing_failures(&self, now: Instant) -> u32 {
        let window = self.settings.window();
        let mut count = 0;
        for attempt in self.history.iter().rev() {
            if !attempt.outcome.is_failure() {
                break;
            }
            if let Some(started) = attempt.started {
                if now.saturating_duration_since(started) > window {
                    break;
                }
            }
            count += 1;
        }
        count
    }
}
