//! Content-addressed cache keys.
//!
//! The exact key is a SHA-256 over `(media type, normalized prompt,
//! canonical parameters)`. The key also carries the prompt fingerprint used
//! for near-duplicate lookups.

use std::hash::{Hash, Hasher};

use serde::Serialize;

use crate::fingerprint::{normalize_prompt, Fingerprint};
use crate::hashing::sha256_hex;
use crate::media::MediaType;
use crate::request::GenerationRequest;

/// Key identifying a cacheable generation result.
///
/// Equality and hashing use the exact `digest` only.
#[derive(Debug, Clone, Serialize)]
pub struct CacheKey {
    pub digest: String,
    pub media_type: MediaType,
    /// Digest of the canonical parameters alone. Similarity matches are only
    /// considered between entries generated with identical parameters.
    pub params_digest: String,
    pub normalized_prompt: String,
    #[serde(skip)]
    pub fingerprint: Fingerprint,
}

impl CacheKey {
    /// Derive the key for a request.
    pub fn for_request(request: &GenerationRequest) -> Self {
        let normalized_prompt = normalize_prompt(&request.prompt);
        let params = canonical_json(&request.parameters);
        let params_digest = sha256_hex(params.as_bytes());
        let digest = sha256_hex(
            format!(
                "{}\n{}\n{}",
                request.media_type.as_str(),
                normalized_prompt,
                params
            )
            .as_bytes(),
        );
        let fingerprint = Fingerprint::of_normalized(&normalized_prompt);
        Self {
            digest,
            media_type: request.media_type,
            params_digest,
            normalized_prompt,
            fingerprint,
        }
    }

    /// Approximate bytes this key occupies in the cache index.
    pub fn index_size(&self) -> usize {
        self.digest.len()
            + self.params_digest.len()
            + self.normalized_prompt.len()
            + self.fingerprint.size_bytes()
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.digest == other.digest
    }
}

impl Eq for CacheKey {}

impl Hash for CacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.digest.hash(state);
    }
}

/// Serialize JSON with object keys sorted at every level, independent of the
/// map ordering `serde_json` was compiled with.
pub fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let body: Vec<String> = keys
                .into_iter()
                .map(|k| {
                    format!(
                        "{}:{}",
                        serde_json::Value::String(k.clone()),
                        canonical_json(&map[k])
                    )
                })
                .collect();
            format!("{{{}}}", body.join(","))
        }
        serde_json::Value::Array(items) => {
            let body: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", body.join(","))
        }
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn same_content_same_key_regardless_of_request_id() {
        let a = GenerationRequest::new("s1", MediaType::Image, "A castle at night")
            .with_parameters(json!({"width": 512, "height": 512}));
        let b = GenerationRequest::new("s2", MediaType::Image, "a castle at night!")
            .with_parameters(json!({"height": 512, "width": 512}));
        assert_eq!(CacheKey::for_request(&a), CacheKey::for_request(&b));
    }

    #[test]
    fn media_type_changes_key() {
        let a = GenerationRequest::new("s", MediaType::Image, "harbor");
        let b = GenerationRequest::new("s", MediaType::Video, "harbor");
        assert_ne!(CacheKey::for_request(&a), CacheKey::for_request(&b));
    }

    #[test]
    fn parameters_change_key() {
        let a = GenerationRequest::new("s", MediaType::Image, "harbor")
            .with_parameters(json!({"seed": 1}));
        let b = GenerationRequest::new("s", MediaType::Image, "harbor")
            .with_parameters(json!({"seed": 2}));
        let (ka, kb) = (CacheKey::for_request(&a), CacheKey::for_request(&b));
        assert_ne!(ka, kb);
        assert_ne!(ka.params_digest, kb.params_digest);
    }

    #[test]
    fn canonical_json_sorts_nested_keys() {
        let v = json!({"b": {"y": 1, "x": [2, {"d": 3, "c": 4}]}, "a": "z"});
        assert_eq!(
            canonical_json(&v),
            r#"{"a":"z","b":{"x":[2,{"c":4,"d":3}],"y":1}}"#
        );
    }
}
