//! Generation requests: the immutable unit of work submitted in a batch.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::media::MediaType;
use crate::types::{RequestId, Timestamp};

// ---------------------------------------------------------------------------
// Limits
// ---------------------------------------------------------------------------

/// Maximum prompt / narration text length in characters.
pub const MAX_PROMPT_CHARS: usize = 8_000;

/// Maximum number of requests accepted in one batch.
pub const MAX_BATCH_REQUESTS: usize = 1_000;

/// Parameter keys clamped by the degradation quality ceiling.
pub const PARAM_WIDTH: &str = "width";
pub const PARAM_HEIGHT: &str = "height";

// ---------------------------------------------------------------------------
// GenerationRequest
// ---------------------------------------------------------------------------

/// A request to generate one asset for one scene.
///
/// Requests are immutable once submitted; degraded variants are derived via
/// [`GenerationRequest::with_quality_ceiling`], which returns a new value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    #[serde(default = "uuid::Uuid::now_v7")]
    pub id: RequestId,
    pub scene_id: String,
    pub media_type: MediaType,
    /// Image/video prompt or narration text for audio.
    pub prompt: String,
    /// Provider parameters, always a JSON object.
    #[serde(default = "empty_object")]
    pub parameters: serde_json::Value,
    /// Higher runs earlier.
    #[serde(default)]
    pub priority: i32,
    /// Whether an approximate (similarity) cache hit may be delivered.
    #[serde(default = "default_accept_similar")]
    pub accept_similar: bool,
    #[serde(default = "Utc::now")]
    pub created_at: Timestamp,
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(Default::default())
}

fn default_accept_similar() -> bool {
    true
}

impl GenerationRequest {
    /// Create a request with default parameters and priority.
    pub fn new(
        scene_id: impl Into<String>,
        media_type: MediaType,
        prompt: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::now_v7(),
            scene_id: scene_id.into(),
            media_type,
            prompt: prompt.into(),
            parameters: empty_object(),
            priority: 0,
            accept_similar: true,
            created_at: Utc::now(),
        }
    }

    /// Set the provider parameters.
    pub fn with_parameters(mut self, parameters: serde_json::Value) -> Self {
        self.parameters = parameters;
        self
    }

    /// Set the scheduling priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Refuse approximate cache hits for this request.
    pub fn reject_similar(mut self) -> Self {
        self.accept_similar = false;
        self
    }

    /// Validate the request before it is scheduled.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.scene_id.trim().is_empty() {
            return Err(CoreError::Validation(format!(
                "Request {} has an empty scene_id",
                self.id
            )));
        }
        if self.prompt.trim().is_empty() {
            return Err(CoreError::Validation(format!(
                "Request {} has an empty prompt",
                self.id
            )));
        }
        let chars = self.prompt.chars().count();
        if chars > MAX_PROMPT_CHARS {
            return Err(CoreError::Validation(format!(
                "Request {} prompt has {chars} characters, maximum is {MAX_PROMPT_CHARS}",
                self.id
            )));
        }
        if !self.parameters.is_object() {
            return Err(CoreError::Validation(format!(
                "Request {} parameters must be a JSON object",
                self.id
            )));
        }
        Ok(())
    }

    /// Return a copy whose `width`/`height` fit within `max_dimension`,
    /// preserving the aspect ratio. Requests without numeric dimensions, or
    /// already within the ceiling, are returned unchanged.
    pub fn with_quality_ceiling(&self, max_dimension: u32) -> Self {
        let mut degraded = self.clone();
        let Some(obj) = degraded.parameters.as_object_mut() else {
            return degraded;
        };
        let width = obj.get(PARAM_WIDTH).and_then(|v| v.as_u64());
        let height = obj.get(PARAM_HEIGHT).and_then(|v| v.as_u64());
        let longest = width.unwrap_or(0).max(height.unwrap_or(0));
        if max_dimension == 0 || longest <= u64::from(max_dimension) {
            return degraded;
        }

        let scale = f64::from(max_dimension) / longest as f64;
        for (key, value) in [(PARAM_WIDTH, width), (PARAM_HEIGHT, height)] {
            if let Some(v) = value {
                let scaled = ((v as f64 * scale).floor() as u64).max(1);
                obj.insert(key.to_string(), serde_json::Value::from(scaled));
            }
        }
        degraded
    }
}

/// Validate a whole submission. Empty and oversized batches are rejected,
/// as are duplicate request ids.
pub fn validate_batch(requests: &[GenerationRequest]) -> Result<(), CoreError> {
    if requests.is_empty() {
        return Err(CoreError::Validation(
            "A batch must contain at least one request".to_string(),
        ));
    }
    if requests.len() > MAX_BATCH_REQUESTS {
        return Err(CoreError::Validation(format!(
            "A batch may contain at most {MAX_BATCH_REQUESTS} requests, got {}",
            requests.len()
        )));
    }
    let mut seen = std::collections::HashSet::with_capacity(requests.len());
    for request in requests {
        request.validate()?;
        if !seen.insert(request.id) {
            return Err(CoreError::Validation(format!(
                "Duplicate request id {} in batch",
                request.id
            )));
        }
    }
    Ok(())
}
