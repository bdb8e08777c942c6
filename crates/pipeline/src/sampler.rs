//! Metrics sampling for the degradation controller.
//!
//! Every `sample_interval` the sampler combines three signals into a
//! [`MetricsSample`]: the failed fraction of recent request outcomes, the
//! share of providers whose breaker rejects calls, and disk usage of the
//! output volume.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use reelgen_core::config::DegradationSettings;
use reelgen_core::degradation::MetricsSample;
use tokio_util::sync::CancellationToken;

use crate::breakers::{now, BreakerRegistry};
use crate::degradation::DegradationHandle;

// ---------------------------------------------------------------------------
// Outcome window
// ---------------------------------------------------------------------------

/// Rolling window of request outcomes, bounded by count and by age.
pub struct OutcomeWindow {
    capacity: usize,
    max_age: Duration,
    outcomes: Mutex<VecDeque<(Instant, bool)>>,
}

impl OutcomeWindow {
    pub fn new(capacity: usize, max_age: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            max_age,
            outcomes: Mutex::new(VecDeque::new()),
        }
    }

    pub fn from_settings(settings: &DegradationSettings) -> Self {
        Self::new(settings.error_window, settings.error_window_max_age())
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<(Instant, bool)>> {
        self.outcomes.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Record one terminal request outcome.
    pub fn record(&self, success: bool) {
        let mut outcomes = self.lock();
        outcomes.push_back((now(), success));
        while outcomes.len() > self.capacity {
            outcomes.pop_front();
        }
    }

    /// Failed fraction of the outcomes still inside the window; zero when
    /// the window is empty.
    pub fn error_rate(&self) -> f64 {
        let at = now();
        let mut outcomes = self.lock();
        while let Some((recorded, _)) = outcomes.front() {
            if at.saturating_duration_since(*recorded) > self.max_age {
                outcomes.pop_front();
            } else {
                break;
            }
        }
        if outcomes.is_empty() {
            return 0.0;
        }
        let failures = outcomes.iter().filter(|(_, ok)| !ok).count();
        failures as f64 / outcomes.len() as f64
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// Disk pressure
// ---------------------------------------------------------------------------

/// Used fraction of the filesystem holding `path` (or its nearest existing
/// ancestor). Zero when the stats cannot be read.
pub async fn disk_pressure(path: &Path) -> f64 {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || disk_usage(&path))
        .await
        .unwrap_or_else(|e| {
            tracing::error!(error = %e, "Disk stats task failed");
            0.0
        })
}

fn disk_usage(path: &Path) -> f64 {
    let Some(existing) = path.ancestors().find(|p| p.exists()) else {
        return 0.0;
    };

    #[cfg(unix)]
    {
        use std::ffi::CString;
        use std::mem::MaybeUninit;
        use std::os::unix::ffi::OsStrExt;

        let Ok(c_path) = CString::new(existing.as_os_str().as_bytes()) else {
            return 0.0;
        };
        let mut stat = MaybeUninit::<libc::statvfs>::uninit();
        // SAFETY: c_path is NUL-terminated and stat is a valid out pointer.
        let ret = unsafe { libc::statvfs(c_path.as_ptr(), stat.as_mut_ptr()) };
        if ret == 0 {
            // SAFETY: statvfs returned 0, so the struct is initialised.
            let stat = unsafe { stat.assume_init() };
            let block_size = stat.f_frsize as u64;
            let total = stat.f_blocks as u64 * block_size;
            let free = stat.f_bavail as u64 * block_size;
            if total == 0 {
                return 0.0;
            }
            return total.saturating_sub(free) as f64 / total as f64;
        }
    }

    #[cfg(not(unix))]
    let _ = existing;

    0.0
}

// ---------------------------------------------------------------------------
// Sampler loop
// ---------------------------------------------------------------------------

/// Background task feeding the degradation controller.
pub struct MetricsSampler {
    window: Arc<OutcomeWindow>,
    breakers: Arc<BreakerRegistry>,
    degradation: DegradationHandle,
    output_root: PathBuf,
    interval: Duration,
}

impl MetricsSampler {
    pub fn new(
        window: Arc<OutcomeWindow>,
        breakers: Arc<BreakerRegistry>,
        degradation: DegradationHandle,
        output_root: impl Into<PathBuf>,
        interval: Duration,
    ) -> Self {
        Self {
            window,
            breakers,
            degradation,
            output_root: output_root.into(),
            interval,
        }
    }

    /// Take one sample now.
    pub async fn sample(&self) -> MetricsSample {
        MetricsSample {
            error_rate: self.window.error_rate(),
            resource_pressure: disk_pressure(&self.output_root).await,
            breaker_open_ratio: self.breakers.open_ratio(),
        }
    }

    /// Sample and report until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        tracing::info!(interval_ms = self.interval.as_millis() as u64, "Metrics sampler started");
        let mut ticker = tokio::time::interval(self.interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Metrics sampler stopping");
                    break;
                }
                _ = ticker.tick() => {
                    let sample = self.sample().await;
                    tracing::trace!(
                        error_rate = sample.error_rate,
                        resource_pressure = sample.resource_pressure,
                        breaker_open_ratio = sample.breaker_open_ratio,
                        "Metrics sample"
                    );
                    self.degradation.report(sample).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reelgen_core::config::BreakerSettings;
    use reelgen_core::degradation::DegradationLevel;

    use crate::degradation::DegradationController;

    // -- OutcomeWindow --

    #[tokio::test]
    async fn error_rate_over_recent_outcomes() {
        let window = OutcomeWindow::new(4, Duration::from_secs(60));
        assert_eq!(window.error_rate(), 0.0);
        for ok in [false, false, true, true, true, false] {
            window.record(ok);
        }
        // Only the last four count: true, true, true, false.
        assert_eq!(window.len(), 4);
        assert_eq!(window.error_rate(), 0.25);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_outcomes_age_out() {
        let window = OutcomeWindow::new(10, Duration::from_secs(60));
        window.record(false);
        window.record(false);
        assert_eq!(window.error_rate(), 1.0);
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(window.error_rate(), 0.0);
        assert!(window.is_empty());
    }

    // -- disk pressure --

    #[tokio::test]
    async fn disk_pressure_is_a_fraction() {
        let dir = tempfile::tempdir().unwrap();
        let pressure = disk_pressure(&dir.path().join("not/created/yet")).await;
        assert!((0.0..=1.0).contains(&pressure));
    }

    // -- sampler --

    #[tokio::test]
    async fn sample_combines_signals() {
        let dir = tempfile::tempdir().unwrap();
        let window = Arc::new(OutcomeWindow::new(10, Duration::from_secs(60)));
        window.record(false);
        window.record(true);
        let breakers = Arc::new(BreakerRegistry::new(BreakerSettings::default(), ["a", "b"]));
        let handle = DegradationController::spawn(&DegradationSettings::default());

        let sampler =
            MetricsSampler::new(window, breakers, handle, dir.path(), Duration::from_secs(5));
        let sample = sampler.sample().await;
        assert_eq!(sample.error_rate, 0.5);
        assert_eq!(sample.breaker_open_ratio, 0.0);
    }

    #[tokio::test]
    async fn run_feeds_controller_until_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let window = Arc::new(OutcomeWindow::new(10, Duration::from_secs(60)));
        for _ in 0..5 {
            window.record(false);
        }
        let breakers = Arc::new(BreakerRegistry::new(BreakerSettings::default(), ["a"]));
        let handle = DegradationController::spawn(&DegradationSettings::default());
        let mut levels = handle.subscribe();

        let cancel = CancellationToken::new();
        let sampler = MetricsSampler::new(
            window,
            breakers,
            handle.clone(),
            dir.path(),
            Duration::from_millis(10),
        );
        let task = tokio::spawn(sampler.run(cancel.clone()));

        levels
            .wait_for(|s| s.level > DegradationLevel::Full)
            .await
            .unwrap();
        cancel.cancel();
        task.await.unwrap();
        assert!(handle.level() > DegradationLevel::Full);
    }
}
