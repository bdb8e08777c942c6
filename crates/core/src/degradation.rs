//! Degradation levels, thresholds, effect table and the level state machine.
//!
//! The machine is single-writer: the pipeline owns exactly one instance
//! behind an actor and readers only ever see snapshots.

use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::media::MediaType;
use crate::types::Timestamp;

/// Non-essential feature: copy validated assets to the backup root.
pub const FEATURE_ASSET_BACKUP: &str = "asset_backup";
/// Non-essential feature: approximate (similarity) cache lookups.
pub const FEATURE_SIMILARITY_LOOKUP: &str = "similarity_lookup";
/// Non-essential feature: intermediate progress events (only terminal stages
/// are emitted when disabled).
pub const FEATURE_DETAILED_PROGRESS: &str = "detailed_progress";

/// Maximum retained transitions in the history.
pub const MAX_TRANSITION_HISTORY: usize = 1_000;

// ---------------------------------------------------------------------------
// Level
// ---------------------------------------------------------------------------

/// Process-wide operating mode, ordered from healthiest to most degraded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradationLevel {
    Full,
    Reduced,
    Minimal,
    Emergency,
    Offline,
}

impl DegradationLevel {
    pub const ALL: [DegradationLevel; 5] = [
        DegradationLevel::Full,
        DegradationLevel::Reduced,
        DegradationLevel::Minimal,
        DegradationLevel::Emergency,
        DegradationLevel::Offline,
    ];

    /// 0 for `Full` through 4 for `Offline`.
    pub fn severity(self) -> usize {
        self as usize
    }

    pub fn from_severity(severity: usize) -> Self {
        Self::ALL[severity.min(Self::ALL.len() - 1)]
    }

    /// One step more degraded (saturating at `Offline`).
    pub fn worse(self) -> Self {
        Self::from_severity(self.severity() + 1)
    }

    /// One step healthier (saturating at `Full`).
    pub fn better(self) -> Self {
        Self::from_severity(self.severity().saturating_sub(1))
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DegradationLevel::Full => "full",
            DegradationLevel::Reduced => "reduced",
            DegradationLevel::Minimal => "minimal",
            DegradationLevel::Emergency => "emergency",
            DegradationLevel::Offline => "offline",
        }
    }
}

impl fmt::Display for DegradationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Metrics and thresholds
// ---------------------------------------------------------------------------

/// One sample of the signals driving degradation. All values are in `[0, 1]`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSample {
    /// Failed fraction of recent request outcomes.
    pub error_rate: f64,
    /// Resource pressure (disk usage of the output volume).
    pub resource_pressure: f64,
    /// Fraction of providers whose breaker is not closed.
    pub breaker_open_ratio: f64,
}

/// Entry thresholds per metric. Index `i` is the value at or above which the
/// level with severity `i + 1` (Reduced .. Offline) is warranted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DegradationThresholds {
    pub error_rate: [f64; 4],
    pub resource_pressure: [f64; 4],
    pub breaker_open_ratio: [f64; 4],
}

impl Default for DegradationThresholds {
    fn default() -> Self {
        Self {
            error_rate: [0.10, 0.25, 0.50, 0.80],
            resource_pressure: [0.80, 0.90, 0.95, 0.98],
            breaker_open_ratio: [0.25, 0.50, 0.75, 1.00],
        }
    }
}

impl DegradationThresholds {
    /// Thresholds must be non-decreasing and lie in `[0, 1]`.
    pub fn validate(&self) -> Result<(), CoreError> {
        for (name, values) in [
            ("error_rate", &self.error_rate),
            ("resource_pressure", &self.resource_pressure),
            ("breaker_open_ratio", &self.breaker_open_ratio),
        ] {
            if values.iter().any(|v| !(0.0..=1.0).contains(v)) {
                return Err(CoreError::Validation(format!(
                    "degradation.thresholds.{name} values must lie in [0, 1]"
                )));
            }
            if values.windows(2).any(|w| w[1] < w[0]) {
                return Err(CoreError::Validation(format!(
                    "degradation.thresholds.{name} must be non-decreasing"
                )));
            }
        }
        Ok(())
    }

    /// The level the sample warrants on its own, ignoring hysteresis.
    pub fn target_level(&self, sample: &MetricsSample) -> DegradationLevel {
        let severity = [
            severity_for(sample.error_rate, &self.error_rate),
            severity_for(sample.resource_pressure, &self.resource_pressure),
            severity_for(sample.breaker_open_ratio, &self.breaker_open_ratio),
        ]
        .into_iter()
        .max()
        .unwrap_or(0);
        DegradationLevel::from_severity(severity)
    }
}

fn severity_for(value: f64, thresholds: &[f64; 4]) -> usize {
    thresholds.iter().take_while(|t| value >= **t).count()
}

// ---------------------------------------------------------------------------
// Effect table
// ---------------------------------------------------------------------------

/// What the orchestrator may do at one level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LevelEffects {
    /// Global ceiling on concurrently processed requests (wave size).
    pub max_concurrent_jobs: usize,
    pub allowed_media_types: Vec<MediaType>,
    /// Longest edge allowed for width/height parameters.
    pub max_dimension: u32,
    pub disabled_features: Vec<String>,
}

impl LevelEffects {
    pub fn allows(&self, media: MediaType) -> bool {
        self.allowed_media_types.contains(&media)
    }

    pub fn feature_enabled(&self, feature: &str) -> bool {
        !self.disabled_features.iter().any(|f| f == feature)
    }

    /// Whether no new generation may start at all.
    pub fn rejects_generation(&self) -> bool {
        self.max_concurrent_jobs == 0 || self.allowed_media_types.is_empty()
    }
}

/// Effects for every level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EffectTable {
    pub full: LevelEffects,
    pub reduced: LevelEffects,
    pub minimal: LevelEffects,
    pub emergency: LevelEffects,
    pub offline: LevelEffects,
}

impl EffectTable {
    pub fn get(&self, level: DegradationLevel) -> &LevelEffects {
        match level {
            DegradationLevel::Full => &self.full,
            DegradationLevel::Reduced => &self.reduced,
            DegradationLevel::Minimal => &self.minimal,
            DegradationLevel::Emergency => &self.emergency,
            DegradationLevel::Offline => &self.offline,
        }
    }
}

impl Default for EffectTable {
    fn default() -> Self {
        let features = |names: &[&str]| names.iter().map(|s| s.to_string()).collect();
        Self {
            full: LevelEffects {
                max_concurrent_jobs: 16,
                allowed_media_types: MediaType::ALL.to_vec(),
                max_dimension: 4096,
                disabled_features: Vec::new(),
            },
            reduced: LevelEffects {
                max_concurrent_jobs: 8,
                allowed_media_types: MediaType::ALL.to_vec(),
                max_dimension: 1920,
                disabled_features: features(&[FEATURE_DETAILED_PROGRESS]),
            },
            minimal: LevelEffects {
                max_concurrent_jobs: 4,
                allowed_media_types: vec![MediaType::Image, MediaType::Audio],
                max_dimension: 1280,
                disabled_features: features(&[FEATURE_ASSET_BACKUP, FEATURE_DETAILED_PROGRESS]),
            },
            emergency: LevelEffects {
                max_concurrent_jobs: 1,
                allowed_media_types: vec![MediaType::Image],
                max_dimension: 768,
                disabled_features: features(&[
                    FEATURE_ASSET_BACKUP,
                    FEATURE_SIMILARITY_LOOKUP,
                    FEATURE_DETAILED_PROGRESS,
                ]),
            },
            offline: LevelEffects {
                max_concurrent_jobs: 0,
                allowed_media_types: Vec::new(),
                max_dimension: 0,
                disabled_features: features(&[
                    FEATURE_ASSET_BACKUP,
                    FEATURE_SIMILARITY_LOOKUP,
                    FEATURE_DETAILED_PROGRESS,
                ]),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

/// A recorded level change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LevelTransition {
    pub from: DegradationLevel,
    pub to: DegradationLevel,
    pub at: Timestamp,
    pub reason: String,
    pub sample: MetricsSample,
}

/// Level state machine with downward-immediate, upward-hysteresis moves.
#[derive(Debug, Clone)]
pub struct DegradationMachine {
    level: DegradationLevel,
    thresholds: DegradationThresholds,
    hysteresis: u32,
    healthy_streak: u32,
    history: Vec<LevelTransition>,
}

impl DegradationMachine {
    pub fn new(thresholds: DegradationThresholds, hysteresis: u32) -> Self {
        Self {
            level: DegradationLevel::Full,
            thresholds,
            hysteresis: hysteresis.max(1),
            healthy_streak: 0,
            history: Vec::new(),
        }
    }

    pub fn level(&self) -> DegradationLevel {
        self.level
    }

    pub fn healthy_streak(&self) -> u32 {
        self.healthy_streak
    }

    pub fn history(&self) -> &[LevelTransition] {
        &self.history
    }

    /// Evaluate one sample. Moves at most one level per call: down
    /// immediately when the sample warrants a worse level, up only after
    /// `hysteresis` consecutive samples warranting a better one.
    pub fn evaluate(&mut self, sample: MetricsSample) -> Option<LevelTransition> {
        let target = self.thresholds.target_level(&sample);
        let next = if target > self.level {
            self.healthy_streak = 0;
            self.level.worse()
        } else if target < self.level {
            self.healthy_streak += 1;
            if self.healthy_streak < self.hysteresis {
                return None;
            }
            self.healthy_streak = 0;
            self.level.better()
        } else {
            self.healthy_streak = 0;
            return None;
        };

        let reason = format!(
            "target {target} (error_rate={:.2}, resource_pressure={:.2}, breaker_open_ratio={:.2})",
            sample.error_rate, sample.resource_pressure, sample.breaker_open_ratio
        );
        Some(self.transition(next, reason, sample))
    }

    /// Operator override. Resets the healthy streak.
    pub fn force(
        &mut self,
        level: DegradationLevel,
        reason: impl Into<String>,
    ) -> Option<LevelTransition> {
        self.healthy_streak = 0;
        if level == self.level {
            return None;
        }
        Some(self.transition(level, reason.into(), MetricsSample::default()))
    }

    fn transition(
        &mut self,
        to: DegradationLevel,
        reason: String,
        sample: MetricsSample,
    ) -> LevelTransition {
        let transition = LevelTransition {
            from: self.level,
            to,
            at: Utc::now(),
            reason,
            sample,
        };
        self.level = to;
        self.history.push(transition.clone());
        if self.history.len() > MAX_TRANSITION_HISTORY {
            self.history.remove(0);
        }
        transition
    }
}
