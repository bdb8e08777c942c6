//! Asset payloads returned by providers.

use serde::Serialize;

use crate::media::MediaType;
use crate::types::ProviderId;

/// Raw output of one successful provider call.
#[derive(Debug, Clone, Serialize)]
pub struct Asset {
    pub media_type: MediaType,
    #[serde(skip)]
    pub bytes: Vec<u8>,
    pub content_type: String,
    pub provider_id: ProviderId,
    /// CRC32 (lowercase hex) announced by the producer, when it sends one.
    pub declared_crc32: Option<String>,
    /// Provider-specific details (model, seed, ...), copied to the sidecar.
    pub metadata: serde_json::Value,
}

impl Asset {
    pub fn new(
        provider_id: impl Into<ProviderId>,
        media_type: MediaType,
        content_type: impl Into<String>,
        bytes: Vec<u8>,
    ) -> Self {
        Self {
            media_type,
            bytes,
            content_type: content_type.into(),
            provider_id: provider_id.into(),
            declared_crc32: None,
            metadata: serde_json::Value::Object(Default::default()),
        }
    }

    pub fn with_declared_crc32(mut self, crc32: impl Into<String>) -> Self {
        self.declared_crc32 = Some(crc32.into());
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn size_bytes(&self) -> usize {
        self.bytes.len()
    }
}
