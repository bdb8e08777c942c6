//! Corruption detector with quarantine and backup.
//!
//! Every asset, generated or served from the cache, passes through
//! [`CorruptionDetector::validate`] before it is delivered. Assets that fail
//! and cannot be recovered are moved to quarantine together with their
//! integrity report; nothing is deleted.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use reelgen_core::config::IntegritySettings;
use reelgen_core::integrity::{verify, Inspection, IntegrityReport};
use reelgen_core::media::MediaType;
use reelgen_core::types::{BatchId, RequestId};
use reelgen_events::ErrorLog;

use crate::error::PipelineError;
use crate::storage::{sanitize_segment, write_atomic};

/// A deliverable asset.
#[derive(Debug, Clone)]
pub struct ValidatedAsset {
    /// Payload to deliver; trimmed when recovery dropped leading bytes.
    pub bytes: Vec<u8>,
    pub report: IntegrityReport,
    pub inspection: Inspection,
}

impl ValidatedAsset {
    pub fn extension(&self) -> &'static str {
        self.inspection.format.extension()
    }

    pub fn checksum(&self) -> &str {
        &self.report.crc32
    }
}

/// Identifies the asset under validation.
#[derive(Debug, Clone, Copy)]
pub struct Subject<'a> {
    pub project_id: &'a str,
    pub request_id: RequestId,
    pub batch_id: Option<BatchId>,
    pub media_type: MediaType,
    /// Where the bytes came from, for the report (`provider:<id>` or a
    /// cache path).
    pub asset_ref: &'a str,
}

pub struct CorruptionDetector {
    settings: IntegritySettings,
    quarantine_root: PathBuf,
    backup_root: Option<PathBuf>,
    errors: Arc<ErrorLog>,
}

impl CorruptionDetector {
    pub fn new(
        settings: IntegritySettings,
        quarantine_root: impl Into<PathBuf>,
        backup_root: Option<PathBuf>,
        errors: Arc<ErrorLog>,
    ) -> Self {
        Self {
            settings,
            quarantine_root: quarantine_root.into(),
            backup_root,
            errors,
        }
    }

    pub fn quarantine_root(&self) -> &Path {
        &self.quarantine_root
    }

    /// Validate `bytes`, recovering once if possible. Unrecoverable assets
    /// are quarantined and reported as
    /// [`PipelineError::CorruptionUnrecoverable`].
    pub async fn validate(
        &self,
        subject: Subject<'_>,
        bytes: Vec<u8>,
        declared_crc32: Option<&str>,
    ) -> Result<ValidatedAsset, PipelineError> {
        let verification = verify(
            subject.asset_ref,
            &bytes,
            subject.media_type,
            declared_crc32,
            &self.settings,
        );

        if let Some(inspection) = verification.inspection {
            let offset = verification.recovered_offset.unwrap_or(0);
            if verification.report.recovered {
                tracing::warn!(
                    request_id = %subject.request_id,
                    asset_ref = subject.asset_ref,
                    dropped_bytes = offset,
                    "Corrupt asset recovered"
                );
            }
            let bytes = if offset > 0 { bytes[offset..].to_vec() } else { bytes };
            return Ok(ValidatedAsset {
                bytes,
                report: verification.report,
                inspection,
            });
        }

        let mut report = verification.report;
        report.quarantined = true;
        let detail = report
            .detail
            .clone()
            .unwrap_or_else(|| "integrity check failed".to_string());
        let path = self.quarantine(&subject, &bytes, &report).await?;

        let error = PipelineError::CorruptionUnrecoverable {
            detail,
            quarantine_path: path.display().to_string(),
        };
        self.errors.record(
            subject.request_id,
            subject.batch_id,
            error.category(),
            "detector",
            &error.to_string(),
        );
        Err(error)
    }

    async fn quarantine(
        &self,
        subject: &Subject<'_>,
        bytes: &[u8],
        report: &IntegrityReport,
    ) -> Result<PathBuf, PipelineError> {
        // One request can be quarantined more than once (a corrupt cache
        // entry, then a corrupt regeneration); each copy keeps its own name.
        let stem = format!("{}-{}", subject.request_id, uuid::Uuid::now_v7());
        let dir = self.quarantine_root.join(sanitize_segment(subject.project_id));
        let path = dir.join(format!("{stem}.bin"));
        write_atomic(&path, bytes).await?;

        let body = serde_json::to_vec_pretty(report).map_err(|e| {
            PipelineError::Internal(format!("Failed to encode integrity report: {e}"))
        })?;
        write_atomic(&dir.join(format!("{stem}.integrity.json")), &body).await?;

        tracing::warn!(
            request_id = %subject.request_id,
            path = %path.display(),
            size_bytes = bytes.len(),
            "Asset quarantined"
        );
        Ok(path)
    }

    /// Copy a validated asset to the backup location, if one is configured.
    pub async fn backup(
        &self,
        project_id: &str,
        scene_id: &str,
        request_id: RequestId,
        asset: &ValidatedAsset,
    ) -> Result<Option<PathBuf>, PipelineError> {
        let Some(root) = &self.backup_root else {
            return Ok(None);
        };
        let path = root
            .join(sanitize_segment(project_id))
            .join(sanitize_segment(scene_id))
            .join(format!("{request_id}.{}", asset.extension()));
        write_atomic(&path, &asset.bytes).await?;
        Ok(Some(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use reelgen_core::hashing::crc32_hex;
    use reelgen_providers::fixture::png_bytes;

    fn detector(dir: &Path, backup: bool) -> (CorruptionDetector, Arc<ErrorLog>) {
        let errors = Arc::new(ErrorLog::new());
        let detector = CorruptionDetector::new(
            IntegritySettings::default(),
            dir.join("quarantine"),
            backup.then(|| dir.join("backup")),
            errors.clone(),
        );
        (detector, errors)
    }

    fn subject(request_id: RequestId) -> Subject<'static> {
        Subject {
            project_id: "proj",
            request_id,
            batch_id: None,
            media_type: MediaType::Image,
            asset_ref: "provider:p",
        }
    }

    fn quarantined_path(result: Result<ValidatedAsset, PipelineError>) -> PathBuf {
        match result {
            Err(PipelineError::CorruptionUnrecoverable { quarantine_path, .. }) => {
                PathBuf::from(quarantine_path)
            }
            other => panic!("expected quarantine, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn valid_asset_passes_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let (detector, errors) = detector(dir.path(), false);
        let png = png_bytes(64, 64, [9, 9, 9]).unwrap();
        let crc = crc32_hex(&png);

        let asset = detector
            .validate(subject(uuid::Uuid::now_v7()), png.clone(), Some(&crc))
            .await
            .unwrap();
        assert_eq!(asset.bytes, png);
        assert_eq!(asset.extension(), "png");
        assert_eq!(asset.checksum(), crc);
        assert!(!asset.report.corruption_suspected);
        assert!(errors.is_empty());
    }

    #[tokio::test]
    async fn leading_garbage_is_recovered() {
        let dir = tempfile::tempdir().unwrap();
        let (detector, _) = detector(dir.path(), false);
        let png = png_bytes(64, 64, [1, 2, 3]).unwrap();
        let mut noisy = b"HTTP/1.1 200 OK\r\n\r\n".to_vec();
        noisy.extend_from_slice(&png);

        let asset = detector
            .validate(subject(uuid::Uuid::now_v7()), noisy, None)
            .await
            .unwrap();
        assert_eq!(asset.bytes, png);
        assert!(asset.report.corruption_suspected);
        assert!(asset.report.recovered);
    }

    #[tokio::test]
    async fn unrecoverable_asset_is_quarantined_with_report() {
        let dir = tempfile::tempdir().unwrap();
        let (detector, errors) = detector(dir.path(), false);
        let request_id = uuid::Uuid::now_v7();

        let result = detector
            .validate(subject(request_id), b"definitely not an image".to_vec(), None)
            .await;
        let quarantine_path = quarantined_path(result);
        assert!(quarantine_path.starts_with(dir.path().join("quarantine/proj")));
        assert_eq!(std::fs::read(&quarantine_path).unwrap(), b"definitely not an image");

        let report: serde_json::Value = serde_json::from_slice(
            &std::fs::read(quarantine_path.with_extension("integrity.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(report["corruption_suspected"], true);
        assert_eq!(report["recovery_attempted"], true);
        assert_eq!(report["quarantined"], true);

        let records = errors.records_for(request_id);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].component, "detector");
    }

    #[tokio::test]
    async fn repeated_quarantine_of_one_request_keeps_every_copy() {
        let dir = tempfile::tempdir().unwrap();
        let (detector, errors) = detector(dir.path(), false);
        let request_id = uuid::Uuid::now_v7();

        let first = quarantined_path(
            detector
                .validate(subject(request_id), b"stale cached bytes".to_vec(), None)
                .await,
        );
        let second = quarantined_path(
            detector
                .validate(subject(request_id), b"fresh but broken".to_vec(), None)
                .await,
        );

        assert_ne!(first, second);
        assert_eq!(std::fs::read(&first).unwrap(), b"stale cached bytes");
        assert_eq!(std::fs::read(&second).unwrap(), b"fresh but broken");
        assert!(first.with_extension("integrity.json").exists());
        assert!(second.with_extension("integrity.json").exists());
        assert_eq!(
            std::fs::read_dir(dir.path().join("quarantine/proj")).unwrap().count(),
            4
        );
        assert_eq!(errors.records_for(request_id).len(), 2);
    }

    #[tokio::test]
    async fn checksum_mismatch_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let (detector, _) = detector(dir.path(), false);
        let png = png_bytes(64, 64, [0, 0, 0]).unwrap();
        assert_matches!(
            detector
                .validate(subject(uuid::Uuid::now_v7()), png, Some("00000000"))
                .await,
            Err(PipelineError::CorruptionUnrecoverable { .. })
        );
    }

    #[tokio::test]
    async fn backup_writes_only_when_configured() {
        let dir = tempfile::tempdir().unwrap();
        let png = png_bytes(64, 64, [5, 5, 5]).unwrap();
        let id = uuid::Uuid::now_v7();

        let (without, _) = detector(dir.path(), false);
        let asset = without.validate(subject(id), png.clone(), None).await.unwrap();
        assert_eq!(without.backup("proj", "scene", id, &asset).await.unwrap(), None);

        let (with, _) = detector(dir.path(), true);
        let path = with.backup("proj", "scene", id, &asset).await.unwrap().unwrap();
        assert_eq!(path, dir.path().join(format!("backup/proj/scene/{id}.png")));
        assert_eq!(std::fs::read(path).unwrap(), png);
    }
}
