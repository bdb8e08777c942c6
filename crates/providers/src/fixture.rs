//! Local deterministic provider and the asset builders it uses.
//!
//! [`FixtureProvider`] emits small but structurally valid assets (PNG, WAV,
//! MP4) derived from the request, so the whole pipeline can run without a
//! network. The builders are public for tests that need valid or corrupt
//! payloads.

use std::io::Cursor;

use async_trait::async_trait;
use reelgen_core::asset::Asset;
use reelgen_core::config::CostModel;
use reelgen_core::hashing::sha256_hex;
use reelgen_core::integrity::ContainerFormat;
use reelgen_core::media::MediaType;
use reelgen_core::request::{GenerationRequest, PARAM_HEIGHT, PARAM_WIDTH};
use reelgen_core::types::Usd;

use crate::adapter::ProviderAdapter;
use crate::error::ProviderError;

/// Default edge length of fixture images.
pub const DEFAULT_IMAGE_EDGE: u32 = 64;
/// Fixture images are never larger than this on either edge.
pub const MAX_FIXTURE_EDGE: u32 = 512;
/// Sample rate of fixture audio.
pub const FIXTURE_SAMPLE_RATE: u32 = 8_000;
/// Default duration of fixture audio and video.
pub const DEFAULT_DURATION_SECS: f64 = 1.0;

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

/// Encode a solid-colour PNG.
pub fn png_bytes(width: u32, height: u32, rgb: [u8; 3]) -> Result<Vec<u8>, ProviderError> {
    let img = image::RgbImage::from_pixel(width, height, image::Rgb(rgb));
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, image::ImageFormat::Png)
        .map_err(|e| ProviderError::Transient(format!("fixture image encoding failed: {e}")))?;
    Ok(out.into_inner())
}

/// Build a silent 16-bit mono PCM WAV file.
pub fn wav_bytes(duration_secs: f64, sample_rate: u32) -> Vec<u8> {
    let byte_rate = sample_rate * 2;
    let data_len = ((duration_secs.max(0.0) * f64::from(byte_rate)) as u32) & !1;
    let mut out = Vec::with_capacity(44 + data_len as usize);
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&(36 + data_len).to_le_bytes());
    out.extend_from_slice(b"WAVE");
    out.extend_from_slice(b"fmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes()); // PCM
    out.extend_from_slice(&1u16.to_le_bytes()); // mono
    out.extend_from_slice(&sample_rate.to_le_bytes());
    out.extend_from_slice(&byte_rate.to_le_bytes());
    out.extend_from_slice(&2u16.to_le_bytes()); // block align
    out.extend_from_slice(&16u16.to_le_bytes()); // bits per sample
    out.extend_from_slice(b"data");
    out.extend_from_slice(&data_len.to_le_bytes());
    out.resize(out.len() + data_len as usize, 0);
    out
}

fn iso_box(kind: &[u8; 4], body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 8);
    out.extend_from_slice(&((body.len() + 8) as u32).to_be_bytes());
    out.extend_from_slice(kind);
    out.extend_from_slice(body);
    out
}

/// Build a minimal MP4 (`ftyp` + `moov/mvhd` + empty `mdat`) declaring the
/// given duration.
pub fn mp4_bytes(duration_secs: f64) -> Vec<u8> {
    const TIMESCALE: u32 = 1_000;
    let duration = (duration_secs.max(0.0) * f64::from(TIMESCALE)) as u32;

    let mut mvhd = vec![0u8; 4]; // version 0, flags
    mvhd.extend_from_slice(&0u32.to_be_bytes()); // creation time
    mvhd.extend_from_slice(&0u32.to_be_bytes()); // modification time
    mvhd.extend_from_slice(&TIMESCALE.to_be_bytes());
    mvhd.extend_from_slice(&duration.to_be_bytes());
    mvhd.extend_from_slice(&0x0001_0000u32.to_be_bytes()); // rate 1.0
    mvhd.extend_from_slice(&0x0100u16.to_be_bytes()); // volume 1.0
    mvhd.resize(100, 0);

    let mut out = iso_box(b"ftyp", b"isom\0\0\x02\0isomiso2mp41");
    out.extend(iso_box(b"moov", &iso_box(b"mvhd", &mvhd)));
    out.extend(iso_box(b"mdat", &[0u8; 16]));
    out
}

/// Deterministic colour for a prompt.
fn prompt_colour(prompt: &str) -> [u8; 3] {
    let digest = sha256_hex(prompt.as_bytes());
    let byte = |i: usize| u8::from_str_radix(&digest[i * 2..i * 2 + 2], 16).unwrap_or(0);
    [byte(0), byte(1), byte(2)]
}

fn dimension(request: &GenerationRequest, key: &str) -> u32 {
    request
        .parameters
        .get(key)
        .and_then(|v| v.as_u64())
        .map(|v| v.clamp(1, u64::from(MAX_FIXTURE_EDGE)) as u32)
        .unwrap_or(DEFAULT_IMAGE_EDGE)
}

fn duration(request: &GenerationRequest) -> f64 {
    request
        .parameters
        .get("duration_secs")
        .and_then(|v| v.as_f64())
        .filter(|d| *d > 0.0)
        .unwrap_or(DEFAULT_DURATION_SECS)
        .min(10.0)
}

/// Build a valid asset for `request`.
pub fn fixture_asset(
    provider_id: &str,
    request: &GenerationRequest,
) -> Result<Asset, ProviderError> {
    let (content_type, bytes) = match request.media_type {
        MediaType::Image => {
            let width = dimension(request, PARAM_WIDTH);
            let height = dimension(request, PARAM_HEIGHT);
            let bytes = png_bytes(width, height, prompt_colour(&request.prompt))?;
            (ContainerFormat::Png.content_type(), bytes)
        }
        MediaType::Audio => (
            ContainerFormat::Wav.content_type(),
            wav_bytes(duration(request), FIXTURE_SAMPLE_RATE),
        ),
        MediaType::Video => (ContainerFormat::Mp4.content_type(), mp4_bytes(duration(request))),
    };
    Ok(Asset::new(provider_id, request.media_type, content_type, bytes)
        .with_metadata(serde_json::json!({ "fixture": true })))
}

// ---------------------------------------------------------------------------
// FixtureProvider
// ---------------------------------------------------------------------------

/// Provider producing deterministic local assets.
pub struct FixtureProvider {
    id: String,
    media_types: Vec<MediaType>,
    cost: CostModel,
}

impl FixtureProvider {
    pub fn new(id: impl Into<String>, media_types: Vec<MediaType>, cost: CostModel) -> Self {
        Self {
            id: id.into(),
            media_types,
            cost,
        }
    }
}

#[async_trait]
impl ProviderAdapter for FixtureProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn media_types(&self) -> &[MediaType] {
        &self.media_types
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<Asset, ProviderError> {
        if !self.serves(request.media_type) {
            return Err(ProviderError::ContentRejected(format!(
                "provider '{}' does not generate {}",
                self.id, request.media_type
            )));
        }
        fixture_asset(&self.id, request)
    }

    fn estimate_cost(&self, request: &GenerationRequest) -> Usd {
        self.cost.estimate(&request.parameters)
    }

    async fn health_check(&self) -> bool {
        true
    }
}
