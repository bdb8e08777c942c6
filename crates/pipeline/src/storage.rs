//! Durable output layout.
//!
//! ```text
//! <output_root>/<project>/<scene>/<request_id>.<ext>
//! <output_root>/<project>/<scene>/<request_id>.meta.json
//! <output_root>/<project>/batch-<batch_id>.summary.json
//! ```
//!
//! Files are written to a hidden temp name and renamed into place so
//! readers never observe a partial asset.

use std::path::{Path, PathBuf};

use reelgen_core::integrity::Inspection;
use reelgen_core::media::MediaType;
use reelgen_core::types::{BatchId, ProviderId, RequestId, Timestamp, Usd};
use serde::Serialize;

use crate::error::PipelineError;
use crate::outcome::AssetSource;

/// Sidecar record written next to every delivered asset.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SidecarRecord {
    pub request_id: RequestId,
    pub provider_id: ProviderId,
    pub cost: Usd,
    pub cache_hit: bool,
    pub checksum: String,
    pub created_at: Timestamp,
    pub scene_id: String,
    pub media_type: MediaType,
    pub source: AssetSource,
    pub size_bytes: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inspection: Option<Inspection>,
    /// Provider-specific details (model, seed, ...).
    #[serde(skip_serializing_if = "serde_json::Value::is_null")]
    pub metadata: serde_json::Value,
}

/// Replace anything that is not safe in a single path segment.
pub fn sanitize_segment(raw: &str) -> String {
    let cleaned: String = raw
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') { c } else { '_' })
        .collect();
    let cleaned = cleaned.trim_matches('.');
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned.to_string()
    }
}

/// Write `bytes` to `path` via a sibling temp file.
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), PipelineError> {
    let parent = path
        .parent()
        .ok_or_else(|| {
            PipelineError::Storage(format!("{} has no parent directory", path.display()))
        })?;
    tokio::fs::create_dir_all(parent).await?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let staging = parent.join(format!(".{name}.tmp"));
    tokio::fs::write(&staging, bytes).await?;
    tokio::fs::rename(&staging, path).await?;
    Ok(())
}

/// Project/scene-keyed output tree.
#[derive(Debug, Clone)]
pub struct OutputStore {
    root: PathBuf,
}

impl OutputStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn project_dir(&self, project_id: &str) -> PathBuf {
        self.root.join(sanitize_segment(project_id))
    }

    pub fn asset_path(
        &self,
        project_id: &str,
        scene_id: &str,
        request_id: RequestId,
        extension: &str,
    ) -> PathBuf {
        self.project_dir(project_id)
            .join(sanitize_segment(scene_id))
            .join(format!("{request_id}.{extension}"))
    }

    /// Persist a validated asset and its sidecar. Returns the asset path.
    pub async fn write_asset(
        &self,
        project_id: &str,
        extension: &str,
        bytes: &[u8],
        sidecar: &SidecarRecord,
    ) -> Result<PathBuf, PipelineError> {
        let path = self.asset_path(project_id, &sidecar.scene_id, sidecar.request_id, extension);
        write_atomic(&path, bytes).await?;

        let meta = serde_json::to_vec_pretty(sidecar)
            .map_err(|e| PipelineError::Internal(format!("Failed to encode sidecar: {e}")))?;
        write_atomic(&path.with_extension("meta.json"), &meta).await?;

        tracing::debug!(
            request_id = %sidecar.request_id,
            path = %path.display(),
            size_bytes = bytes.len(),
            "Asset written"
        );
        Ok(path)
    }

    /// Write the batch summary document. Returns its path.
    pub async fn write_summary<T: Serialize>(
        &self,
        project_id: &str,
        batch_id: BatchId,
        summary: &T,
    ) -> Result<PathBuf, PipelineError> {
        let path = self
            .project_dir(project_id)
            .join(format!("batch-{batch_id}.summary.json"));
        let body = serde_json::to_vec_pretty(summary)
            .map_err(|e| PipelineError::Internal(format!("Failed to encode batch summary: {e}")))?;
        write_atomic(&path, &body).await?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sidecar(scene: &str) -> SidecarRecord {
        SidecarRecord {
            request_id: uuid::Uuid::now_v7(),
            provider_id: "p".to_string(),
            cost: 0.04,
            cache_hit: false,
            checksum: "0badf00d".to_string(),
            created_at: Utc::now(),
            scene_id: scene.to_string(),
            media_type: MediaType::Image,
            source: AssetSource::Generated,
            size_bytes: 3,
            inspection: None,
            metadata: serde_json::Value::Null,
        }
    }

    #[test]
    fn sanitize_strips_traversal() {
        assert_eq!(sanitize_segment("../../etc"), "_.._etc");
        assert_eq!(sanitize_segment("scene 1/a"), "scene_1_a");
        assert_eq!(sanitize_segment("  "), "_");
        assert_eq!(sanitize_segment("..."), "_");
        assert_eq!(sanitize_segment("ok-name_2"), "ok-name_2");
    }

    #[tokio::test]
    async fn asset_and_sidecar_land_under_project_and_scene() {
        let dir = tempfile::tempdir().unwrap();
        let store = OutputStore::new(dir.path());
        let record = sidecar("scene-7");

        let path = store.write_asset("proj", "png", b"png", &record).await.unwrap();
        assert_eq!(
            path,
            dir.path()
                .join("proj/scene-7")
                .join(format!("{}.png", record.request_id))
        );
        assert_eq!(std::fs::read(&path).unwrap(), b"png");

        let meta: serde_json::Value =
            serde_json::from_slice(&std::fs::read(path.with_extension("meta.json")).unwrap())
                .unwrap();
        assert_eq!(meta["requestId"], record.request_id.to_string());
        assert_eq!(meta["providerId"], "p");
        assert_eq!(meta["cacheHit"], false);
        assert_eq!(meta["checksum"], "0badf00d");
        assert!(meta.get("createdAt").is_some());
        assert!(meta.get("metadata").is_none());

        let leftovers: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn summary_is_written_per_batch() {
        let dir = tempfile::tempdir().unwrap();
        let store = OutputStore::new(dir.path());
        let batch = uuid::Uuid::now_v7();
        let path = store
            .write_summary("proj", batch, &serde_json::json!({"total": 1}))
            .await
            .unwrap();
        assert_eq!(path, dir.path().join("proj").join(format!("batch-{batch}.summary.json")));
    }
}
