//! Engine configuration surface.
//!
//! Every tunable of the generation core lives here: retry curves, call
//! timeouts, breaker thresholds, cache budget and similarity thresholds,
//! integrity limits, the degradation effect table, output locations and the
//! provider list. All fields have defaults so a partial JSON document (or
//! none at all) yields a working configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::degradation::{DegradationThresholds, EffectTable};
use crate::error::CoreError;
use crate::media::MediaType;

/// Environment variable naming an optional JSON config file.
pub const ENV_CONFIG_PATH: &str = "REELGEN_CONFIG";

/// Lowest accepted similarity threshold.
pub const MIN_SIMILARITY_THRESHOLD: f64 = 0.50;
/// Highest accepted similarity threshold.
pub const MAX_SIMILARITY_THRESHOLD: f64 = 1.00;

// ---------------------------------------------------------------------------
// Root
// ---------------------------------------------------------------------------

/// Complete configuration of the generation engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub media: MediaTable,
    pub breaker: BreakerSettings,
    pub cache: CacheSettings,
    pub integrity: IntegritySettings,
    pub degradation: DegradationSettings,
    pub storage: StorageSettings,
    pub providers: Vec<ProviderConfig>,
}

impl EngineConfig {
    /// Parse a JSON document. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, CoreError> {
        serde_json::from_str(json)
            .map_err(|e| CoreError::Validation(format!("Invalid engine config: {e}")))
    }

    /// Load from the file named by `REELGEN_CONFIG` (if set), then apply
    /// environment overrides and validate.
    pub fn load() -> Result<Self, CoreError> {
        let mut config = match std::env::var(ENV_CONFIG_PATH) {
            Ok(path) => {
                let raw = std::fs::read_to_string(&path).map_err(|e| {
                    CoreError::Validation(format!("Cannot read config file '{path}': {e}"))
                })?;
                Self::from_json_str(&raw)?
            }
            Err(_) => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply the supported environment overrides using `lookup`.
    ///
    /// | Env Var                     | Field                          |
    /// |-----------------------------|--------------------------------|
    /// | `OUTPUT_DIR`                | `storage.output_root`          |
    /// | `QUARANTINE_DIR`            | `storage.quarantine_root`      |
    /// | `BACKUP_DIR`                | `storage.backup_root`          |
    /// | `CACHE_MAX_INDEX_BYTES`     | `cache.max_index_bytes`        |
    /// | `BREAKER_FAILURE_THRESHOLD` | `breaker.failure_threshold`    |
    /// | `RETAINED_BATCHES`          | `storage.retained_batches`     |
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), CoreError> {
        if let Some(dir) = lookup("OUTPUT_DIR") {
            self.storage.output_root = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("QUARANTINE_DIR") {
            self.storage.quarantine_root = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("BACKUP_DIR") {
            self.storage.backup_root = Some(PathBuf::from(dir));
        }
        if let Some(raw) = lookup("CACHE_MAX_INDEX_BYTES") {
            self.cache.max_index_bytes = parse_number(&raw, "CACHE_MAX_INDEX_BYTES")?;
        }
        if let Some(raw) = lookup("BREAKER_FAILURE_THRESHOLD") {
            self.breaker.failure_threshold = parse_number(&raw, "BREAKER_FAILURE_THRESHOLD")?;
        }
        if let Some(raw) = lookup("RETAINED_BATCHES") {
            self.storage.retained_batches = parse_number(&raw, "RETAINED_BATCHES")?;
        }
        Ok(())
    }

    /// Reject incoherent settings.
    pub fn validate(&self) -> Result<(), CoreError> {
        for media in MediaType::ALL {
            let settings = self.media.get(media);
            settings.retry.validate(media)?;
            if settings.call_timeout_ms == 0 {
                return Err(CoreError::Validation(format!(
                    "{media}: call_timeout_ms must be positive"
                )));
            }
            if settings.max_in_flight == 0 {
                return Err(CoreError::Validation(format!(
                    "{media}: max_in_flight must be at least 1"
                )));
            }
            if !(MIN_SIMILARITY_THRESHOLD..=MAX_SIMILARITY_THRESHOLD)
                .contains(&settings.similarity_threshold)
            {
                return Err(CoreError::Validation(format!(
                    "{media}: similarity threshold must be between \
                     {MIN_SIMILARITY_THRESHOLD} and {MAX_SIMILARITY_THRESHOLD}, got {}",
                    settings.similarity_threshold
                )));
            }
        }
        self.breaker.validate()?;
        if self.cache.max_index_bytes == 0 {
            return Err(CoreError::Validation(
                "cache.max_index_bytes must be positive".to_string(),
            ));
        }
        if self.storage.retained_batches == 0 {
            return Err(CoreError::Validation(
                "storage.retained_batches must be at least 1".to_string(),
            ));
        }
        self.degradation.thresholds.validate()?;
        if self.degradation.hysteresis_samples == 0 {
            return Err(CoreError::Validation(
                "degradation.hysteresis_samples must be at least 1".to_string(),
            ));
        }
        let mut ids = std::collections::HashSet::new();
        for provider in &self.providers {
            if provider.id.trim().is_empty() {
                return Err(CoreError::Validation("Provider id must not be empty".to_string()));
            }
            if !ids.insert(provider.id.as_str()) {
                return Err(CoreError::Validation(format!(
                    "Duplicate provider id '{}'",
                    provider.id
                )));
            }
            if provider.media_types.is_empty() {
                return Err(CoreError::Validation(format!(
                    "Provider '{}' must serve at least one media type",
                    provider.id
                )));
            }
        }
        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(raw: &str, name: &str) -> Result<T, CoreError> {
    raw.trim()
        .parse()
        .map_err(|_| CoreError::Validation(format!("{name} must be a valid number, got '{raw}'")))
}

// ---------------------------------------------------------------------------
// Per media type
// ---------------------------------------------------------------------------

/// Settings keyed by media type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaTable {
    pub image: MediaSettings,
    pub audio: MediaSettings,
    pub video: MediaSettings,
}

impl MediaTable {
    pub fn get(&self, media: MediaType) -> &MediaSettings {
        match media {
            MediaType::Image => &self.image,
            MediaType::Audio => &self.audio,
            MediaType::Video => &self.video,
        }
    }
}

impl Default for MediaTable {
    fn default() -> Self {
        Self {
            image: MediaSettings {
                retry: RetrySettings {
                    max_attempts: 3,
                    base_delay_ms: 500,
                    max_delay_ms: 8_000,
                },
                call_timeout_ms: 60_000,
                max_in_flight: 8,
                similarity_threshold: 0.88,
            },
            // Narration must match near-verbatim: small text differences
            // change what is spoken.
            audio: MediaSettings {
                retry: RetrySettings {
                    max_attempts: 3,
                    base_delay_ms: 500,
                    max_delay_ms: 8_000,
                },
                call_timeout_ms: 90_000,
                max_in_flight: 8,
                similarity_threshold: 0.95,
            },
            video: MediaSettings {
                retry: RetrySettings {
                    max_attempts: 3,
                    base_delay_ms: 2_000,
                    max_delay_ms: 30_000,
                },
                call_timeout_ms: 300_000,
                max_in_flight: 3,
                similarity_threshold: 0.88,
            },
        }
    }
}

/// Settings for one media type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaSettings {
    pub retry: RetrySettings,
    /// Per-call timeout; an expired call is a retryable `Timeout`.
    pub call_timeout_ms: u64,
    /// Network-wide cap on in-flight provider calls for this media type.
    pub max_in_flight: usize,
    /// Minimum fingerprint similarity for an approximate cache hit.
    pub similarity_threshold: f64,
}

impl MediaSettings {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

/// Exponential backoff parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Total attempts including the first call.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl RetrySettings {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    fn validate(&self, media: MediaType) -> Result<(), CoreError> {
        if self.max_attempts == 0 {
            return Err(CoreError::Validation(format!(
                "{media}: retry.max_attempts must be at least 1"
            )));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(CoreError::Validation(format!(
                "{media}: retry.max_delay_ms ({}) must not be below base_delay_ms ({})",
                self.max_delay_ms, self.base_delay_ms
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Breaker
// ---------------------------------------------------------------------------

/// Circuit breaker tuning shared by every provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    /// Consecutive failures that open the breaker.
    pub failure_threshold: u32,
    /// Failures older than this no longer extend a consecutive run.
    pub window_ms: u64,
    /// First cooldown after opening.
    pub base_cooldown_ms: u64,
    /// Cap for the doubling cooldown after failed probes.
    pub max_cooldown_ms: u64,
    /// Attempts retained per provider for statistics.
    pub history_len: usize,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window_ms: 60_000,
            base_cooldown_ms: 30_000,
            max_cooldown_ms: 600_000,
            history_len: 256,
        }
    }
}

impl BreakerSettings {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn base_cooldown(&self) -> Duration {
        Duration::from_millis(self.base_cooldown_ms)
    }

    pub fn max_cooldown(&self) -> Duration {
        Duration::from_millis(self.max_cooldown_ms)
    }

    fn validate(&self) -> Result<(), CoreError> {
        if self.failure_threshold == 0 {
            return Err(CoreError::Validation(
                "breaker.failure_threshold must be at least 1".to_string(),
            ));
        }
        if self.max_cooldown_ms < self.base_cooldown_ms {
            return Err(CoreError::Validation(
                "breaker.max_cooldown_ms must not be below base_cooldown_ms".to_string(),
            ));
        }
        if (self.history_len as u64) < u64::from(self.failure_threshold) {
            return Err(CoreError::Validation(
                "breaker.history_len must hold at least failure_threshold attempts".to_string(),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

/// Content cache budget and eviction tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Byte budget for index metadata. Asset bytes are not counted.
    pub max_index_bytes: usize,
    /// Access times are bucketed to this granularity for eviction ordering;
    /// inside one bucket cheaper entries are evicted first.
    pub eviction_granularity_secs: u64,
    /// Fixed per-entry overhead added to the key size.
    pub entry_overhead_bytes: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            max_index_bytes: 10 * 1024 * 1024,
            eviction_granularity_secs: 60,
            entry_overhead_bytes: 128,
        }
    }
}

// ---------------------------------------------------------------------------
// Integrity
// ---------------------------------------------------------------------------

/// Corruption detector limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegritySettings {
    /// Assets at or above this size also get a SHA-256 checksum.
    pub strong_hash_min_bytes: usize,
    pub min_image_width: u32,
    pub min_image_height: u32,
    /// How far into the payload recovery searches for a container signature.
    pub recovery_scan_bytes: usize,
}

impl Default for IntegritySettings {
    fn default() -> Self {
        Self {
            strong_hash_min_bytes: 1024 * 1024,
            min_image_width: 64,
            min_image_height: 64,
            recovery_scan_bytes: 4096,
        }
    }
}

// ---------------------------------------------------------------------------
// Degradation
// ---------------------------------------------------------------------------

/// Degradation controller tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DegradationSettings {
    /// How often the sampler feeds the controller.
    pub sample_interval_ms: u64,
    /// Number of most recent request outcomes in the error-rate window.
    pub error_window: usize,
    /// Outcomes older than this leave the window, so the error rate decays
    /// while no traffic flows.
    pub error_window_max_age_ms: u64,
    /// Consecutive healthy samples required before recovering one level.
    pub hysteresis_samples: u32,
    pub thresholds: DegradationThresholds,
    pub effects: EffectTable,
}

impl Default for DegradationSettings {
    fn default() -> Self {
        Self {
            sample_interval_ms: 5_000,
            error_window: 50,
            error_window_max_age_ms: 300_000,
            hysteresis_samples: 3,
            thresholds: DegradationThresholds::default(),
            effects: EffectTable::default(),
        }
    }
}

impl DegradationSettings {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    pub fn error_window_max_age(&self) -> Duration {
        Duration::from_millis(self.error_window_max_age_ms)
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

/// Default number of finished batches kept in memory.
pub const DEFAULT_RETAINED_BATCHES: usize = 256;

/// Output, quarantine and backup locations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub output_root: PathBuf,
    pub quarantine_root: PathBuf,
    /// When unset, backups are skipped.
    pub backup_root: Option<PathBuf>,
    /// Optional JSON-lines journal of progress events.
    pub event_journal: Option<PathBuf>,
    /// Finished batches kept in memory for status queries. Older ones are
    /// dropped; their summary file stays on disk.
    pub retained_batches: usize,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            output_root: PathBuf::from("./output"),
            quarantine_root: PathBuf::from("./quarantine"),
            backup_root: None,
            event_journal: None,
            retained_batches: DEFAULT_RETAINED_BATCHES,
        }
    }
}

// ---------------------------------------------------------------------------
// Providers
// ---------------------------------------------------------------------------

/// One configured provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub id: String,
    pub media_types: Vec<MediaType>,
    #[serde(default)]
    pub cost: CostModel,
    #[serde(flatten)]
    pub kind: ProviderKind,
}

/// The closed set of provider implementations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProviderKind {
    /// JSON-over-HTTP generation service.
    Http {
        base_url: String,
        /// Name of the env var holding the API key, never the key itself.
        #[serde(default)]
        api_key_env: Option<String>,
    },
    /// Local deterministic provider emitting valid placeholder assets.
    Fixture,
}

/// Best-effort cost estimate: a flat fee plus a per-second rate applied to a
/// `duration_secs` parameter when present.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CostModel {
    pub per_request_usd: f64,
    pub per_second_usd: f64,
}

impl CostModel {
    pub fn estimate(&self, parameters: &serde_json::Value) -> f64 {
        let seconds = parameters
            .get("duration_secs")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0)
            .max(0.0);
        self.per_request_usd + self.per_second_usd * seconds
    }
}
