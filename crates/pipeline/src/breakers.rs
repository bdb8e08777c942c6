//! Per-provider circuit breakers behind their own locks.
//!
//! Each provider gets one [`CircuitBreaker`] behind its own mutex, so two
//! attempts against the same provider never apply a transition
//! concurrently while attempts against different providers never contend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Instant;

use reelgen_core::breaker::{
    Admission, BreakerSnapshot, BreakerState, BreakerTransition, CircuitBreaker,
    ProviderCallAttempt,
};
use reelgen_core::config::BreakerSettings;

/// Current instant on the tokio clock, as a std instant for the pure state
/// machines. Paused test clocks apply.
pub fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

type SharedBreaker = Arc<Mutex<CircuitBreaker>>;

fn lock(breaker: &SharedBreaker) -> MutexGuard<'_, CircuitBreaker> {
    breaker.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Breakers for every known provider.
pub struct BreakerRegistry {
    settings: BreakerSettings,
    breakers: RwLock<HashMap<String, SharedBreaker>>,
}

impl BreakerRegistry {
    /// Create breakers for `provider_ids` up front so ratios count every
    /// provider, including ones never called.
    pub fn new<'a>(
        settings: BreakerSettings,
        provider_ids: impl IntoIterator<Item = &'a str>,
    ) -> Self {
        let breakers = provider_ids
            .into_iter()
            .map(|id| {
                let breaker = CircuitBreaker::new(id, settings.clone());
                (id.to_string(), Arc::new(Mutex::new(breaker)))
            })
            .collect();
        Self {
            settings,
            breakers: RwLock::new(breakers),
        }
    }

    fn breaker(&self, provider_id: &str) -> SharedBreaker {
        if let Some(existing) = self
            .breakers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(provider_id)
        {
            return existing.clone();
        }
        self.breakers
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .entry(provider_id.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(CircuitBreaker::new(provider_id, self.settings.clone())))
            })
            .clone()
    }

    /// Ask the provider's breaker for permission to call.
    pub fn admit(&self, provider_id: &str) -> Result<Permit, std::time::Duration> {
        let breaker = self.breaker(provider_id);
        let admission = lock(&breaker).admit(now());
        match admission {
            Admission::Allowed => Ok(Permit::new(provider_id, breaker, false)),
            Admission::Probe => {
                tracing::info!(provider_id, "Circuit half-open, sending probe call");
                Ok(Permit::new(provider_id, breaker, true))
            }
            Admission::Rejected { retry_in } => Err(retry_in),
        }
    }

    /// Whether a call to `provider_id` would currently be admitted.
    pub fn accepts(&self, provider_id: &str) -> bool {
        lock(&self.breaker(provider_id)).accepts(now())
    }

    pub fn state(&self, provider_id: &str) -> BreakerState {
        lock(&self.breaker(provider_id)).state()
    }

    pub fn snapshot(&self, provider_id: &str) -> BreakerSnapshot {
        lock(&self.breaker(provider_id)).snapshot(now())
    }

    /// Snapshots of every breaker, sorted by provider id.
    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let at = now();
        let breakers: Vec<SharedBreaker> = self
            .breakers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .cloned()
            .collect();
        let mut snapshots: Vec<BreakerSnapshot> =
            breakers.iter().map(|b| lock(b).snapshot(at)).collect();
        snapshots.sort_by(|a, b| a.provider_id.cmp(&b.provider_id));
        snapshots
    }

    /// Fraction of providers that would currently reject a call. A breaker
    /// whose cooldown has elapsed counts as available.
    pub fn open_ratio(&self) -> f64 {
        let at = now();
        let breakers = self.breakers.read().unwrap_or_else(|p| p.into_inner());
        if breakers.is_empty() {
            return 0.0;
        }
        let rejecting = breakers.values().filter(|b| !lock(b).accepts(at)).count();
        rejecting as f64 / breakers.len() as f64
    }

    /// Attempt history of one provider, oldest first.
    pub fn attempts(&self, provider_id: &str) -> Vec<ProviderCallAttempt> {
        lock(&self.breaker(provider_id)).history().cloned().collect()
    }
}

/// Permission for one call. Must be settled with [`Permit::record`]; a
/// probe permit dropped unsettled (the call future was dropped) is handed
/// back so the breaker does not wait on it forever.
pub struct Permit {
    provider_id: String,
    breaker: SharedBreaker,
    probe: bool,
    settled: bool,
}

impl Permit {
    fn new(provider_id: &str, breaker: SharedBreaker, probe: bool) -> Self {
        Self {
            provider_id: provider_id.to_string(),
            breaker,
            probe,
            settled: false,
        }
    }

    pub fn is_probe(&self) -> bool {
        self.probe
    }

    /// Record the attempt's outcome and apply any transition.
    pub fn record(mut self, attempt: ProviderCallAttempt) -> Option<BreakerTransition> {
        self.settled = true;
        let transition = lock(&self.breaker).record(attempt, now());
        if let Some(t) = transition {
            let (from, to) = (t.from.as_str(), t.to.as_str());
            if t.to == BreakerState::Closed {
                tracing::info!(provider_id = %self.provider_id, from, to, "Circuit breaker closed");
            } else {
                tracing::warn!(provider_id = %self.provider_id, from, to, "Circuit breaker opened");
            }
        }
        transition
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        if self.probe && !self.settled {
            lock(&self.breaker).release_probe();
        }
    }
}
