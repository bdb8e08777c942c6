//! Batch manifest: the JSON document the worker runs.
//!
//! ```json
//! {
//!   "project_id": "pilot",
//!   "requests": [{ "scene_id": "s1", "media_type": "image", "prompt": "..." }]
//! }
//! ```
//!
//! Requests use the same shape as `POST /api/v1/batches`.

use std::path::Path;

use reelgen_core::error::CoreError;
use reelgen_core::request::{validate_batch, GenerationRequest};
use serde::Deserialize;

/// Environment variable naming the manifest file.
pub const ENV_BATCH_FILE: &str = "BATCH_FILE";

#[derive(Debug, Deserialize)]
pub struct BatchManifest {
    pub project_id: String,
    pub requests: Vec<GenerationRequest>,
}

impl BatchManifest {
    /// Parse and validate a manifest document.
    pub fn from_json_str(json: &str) -> Result<Self, CoreError> {
        let manifest: Self = serde_json::from_str(json)
            .map_err(|e| CoreError::Validation(format!("Invalid batch manifest: {e}")))?;
        if manifest.project_id.trim().is_empty() {
            return Err(CoreError::Validation(
                "Batch manifest has an empty project_id".to_string(),
            ));
        }
        validate_batch(&manifest.requests)?;
        Ok(manifest)
    }

    pub async fn load(path: &Path) -> Result<Self, CoreError> {
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            CoreError::Validation(format!("Cannot read batch manifest '{}': {e}", path.display()))
        })?;
        Self::from_json_str(&raw)
    }
}
