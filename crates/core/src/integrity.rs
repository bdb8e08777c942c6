//! Asset integrity checks: checksums, container sniffing and structural
//! validation, plus one bounded recovery attempt.
//!
//! Quarantine and backup are filesystem concerns handled by the pipeline;
//! this module only decides whether bytes are deliverable.

use std::io::Cursor;

use serde::Serialize;

use crate::config::IntegritySettings;
use crate::hashing::{crc32_hex, sha256_hex};
use crate::media::MediaType;

/// Smallest payload accepted for containers validated by signature only.
pub const MIN_OPAQUE_PAYLOAD_BYTES: usize = 64;

// ---------------------------------------------------------------------------
// Container formats
// ---------------------------------------------------------------------------

/// Container formats recognised by their leading signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerFormat {
    Png,
    Jpeg,
    Webp,
    Wav,
    Mp3,
    Ogg,
    Flac,
    Mp4,
    Webm,
}

impl ContainerFormat {
    /// Identify the container from the first bytes of `bytes`.
    pub fn sniff(bytes: &[u8]) -> Option<Self> {
        if bytes.starts_with(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]) {
            return Some(ContainerFormat::Png);
        }
        if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
            return Some(ContainerFormat::Jpeg);
        }
        if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" {
            return match &bytes[8..12] {
                b"WEBP" => Some(ContainerFormat::Webp),
                b"WAVE" => Some(ContainerFormat::Wav),
                _ => None,
            };
        }
        if bytes.starts_with(b"ID3")
            || (bytes.len() >= 2 && bytes[0] == 0xFF && bytes[1] & 0xE0 == 0xE0)
        {
            return Some(ContainerFormat::Mp3);
        }
        if bytes.starts_with(b"OggS") {
            return Some(ContainerFormat::Ogg);
        }
        if bytes.starts_with(b"fLaC") {
            return Some(ContainerFormat::Flac);
        }
        if bytes.len() >= 8 && &bytes[4..8] == b"ftyp" {
            return Some(ContainerFormat::Mp4);
        }
        if bytes.starts_with(&[0x1A, 0x45, 0xDF, 0xA3]) {
            return Some(ContainerFormat::Webm);
        }
        None
    }

    pub fn media_type(self) -> MediaType {
        match self {
            ContainerFormat::Png | ContainerFormat::Jpeg | ContainerFormat::Webp => {
                MediaType::Image
            }
            ContainerFormat::Wav
            | ContainerFormat::Mp3
            | ContainerFormat::Ogg
            | ContainerFormat::Flac => MediaType::Audio,
            ContainerFormat::Mp4 | ContainerFormat::Webm => MediaType::Video,
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            ContainerFormat::Png => "png",
            ContainerFormat::Jpeg => "jpg",
            ContainerFormat::Webp => "webp",
            ContainerFormat::Wav => "wav",
            ContainerFormat::Mp3 => "mp3",
            ContainerFormat::Ogg => "ogg",
            ContainerFormat::Flac => "flac",
            ContainerFormat::Mp4 => "mp4",
            ContainerFormat::Webm => "webm",
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            ContainerFormat::Png => "image/png",
            ContainerFormat::Jpeg => "image/jpeg",
            ContainerFormat::Webp => "image/webp",
            ContainerFormat::Wav => "audio/wav",
            ContainerFormat::Mp3 => "audio/mpeg",
            ContainerFormat::Ogg => "audio/ogg",
            ContainerFormat::Flac => "audio/flac",
            ContainerFormat::Mp4 => "video/mp4",
            ContainerFormat::Webm => "video/webm",
        }
    }
}

// ---------------------------------------------------------------------------
// Inspection
// ---------------------------------------------------------------------------

/// Structural facts extracted from a valid asset.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Inspection {
    pub format: ContainerFormat,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<f64>,
}

impl Inspection {
    fn of(format: ContainerFormat) -> Self {
        Self {
            format,
            width: None,
            height: None,
            duration_secs: None,
        }
    }
}

/// Validate the structure of `bytes` as an asset of `media`. Returns the
/// reason on failure.
pub fn inspect(
    bytes: &[u8],
    media: MediaType,
    settings: &IntegritySettings,
) -> Result<Inspection, String> {
    if bytes.is_empty() {
        return Err("empty payload".to_string());
    }
    let format = ContainerFormat::sniff(bytes).ok_or("unrecognised container signature")?;
    if format.media_type() != media {
        return Err(format!(
            "{} container delivered for a {media} request",
            format.extension()
        ));
    }

    match format {
        ContainerFormat::Png | ContainerFormat::Jpeg | ContainerFormat::Webp => {
            let (width, height) = image_dimensions(bytes)?;
            if width < settings.min_image_width || height < settings.min_image_height {
                return Err(format!(
                    "image is {width}x{height}, minimum is {}x{}",
                    settings.min_image_width, settings.min_image_height
                ));
            }
            Ok(Inspection {
                width: Some(width),
                height: Some(height),
                ..Inspection::of(format)
            })
        }
        ContainerFormat::Wav => {
            let duration = wav_duration(bytes)?;
            Ok(Inspection {
                duration_secs: Some(duration),
                ..Inspection::of(format)
            })
        }
        ContainerFormat::Mp4 => {
            let duration = mp4_duration(bytes)?;
            Ok(Inspection {
                duration_secs: Some(duration),
                ..Inspection::of(format)
            })
        }
        ContainerFormat::Mp3
        | ContainerFormat::Ogg
        | ContainerFormat::Flac
        | ContainerFormat::Webm => {
            if bytes.len() < MIN_OPAQUE_PAYLOAD_BYTES {
                return Err(format!(
                    "{} payload of {} bytes has no media data",
                    format.extension(),
                    bytes.len()
                ));
            }
            Ok(Inspection::of(format))
        }
    }
}

/// Header-only dimension read; does not decode pixel data.
fn image_dimensions(bytes: &[u8]) -> Result<(u32, u32), String> {
    image::ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| format!("unreadable image header: {e}"))?
        .into_dimensions()
        .map_err(|e| format!("undecodable image header: {e}"))
}

fn read_u16_le(bytes: &[u8], at: usize) -> Option<u16> {
    bytes.get(at..at + 2).map(|b| u16::from_le_bytes([b[0], b[1]]))
}

fn read_u32_le(bytes: &[u8], at: usize) -> Option<u32> {
    bytes
        .get(at..at + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

fn read_u32_be(bytes: &[u8], at: usize) -> Option<u32> {
    bytes
        .get(at..at + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
}

fn read_u64_be(bytes: &[u8], at: usize) -> Option<u64> {
    bytes.get(at..at + 8).map(|b| {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(b);
        u64::from_be_bytes(buf)
    })
}

/// Walk RIFF chunks for `fmt ` and `data`; duration is data bytes over the
/// byte rate.
fn wav_duration(bytes: &[u8]) -> Result<f64, String> {
    let mut offset = 12;
    let mut byte_rate = None;
    while offset + 8 <= bytes.len() {
        let id = &bytes[offset..offset + 4];
        let size = read_u32_le(bytes, offset + 4).ok_or("truncated chunk header")? as usize;
        let body = offset + 8;
        match id {
            b"fmt " => {
                let channels = read_u16_le(bytes, body + 2).ok_or("truncated fmt chunk")?;
                let rate = read_u32_le(bytes, body + 8).ok_or("truncated fmt chunk")?;
                if channels == 0 {
                    return Err("wav declares zero channels".to_string());
                }
                byte_rate = Some(rate);
            }
            b"data" => {
                let rate = byte_rate.ok_or("wav data chunk precedes fmt chunk")?;
                if rate == 0 {
                    return Err("wav declares a zero byte rate".to_string());
                }
                let available = bytes.len() - body;
                if size > available {
                    return Err(format!(
                        "wav data chunk declares {size} bytes but only {available} are present"
                    ));
                }
                if size == 0 {
                    return Err("wav has zero duration".to_string());
                }
                return Ok(size as f64 / f64::from(rate));
            }
            _ => {}
        }
        // Chunks are padded to even sizes.
        offset = body + size + (size & 1);
    }
    Err("wav has no data chunk".to_string())
}

/// Iterate `(type, body_start, body_end)` over ISO-BMFF boxes in `range`.
fn mp4_boxes(
    bytes: &[u8],
    start: usize,
    end: usize,
) -> Result<Vec<([u8; 4], usize, usize)>, String> {
    let mut boxes = Vec::new();
    let mut offset = start;
    while offset + 8 <= end {
        let size32 = read_u32_be(bytes, offset).ok_or("truncated box header")?;
        let mut kind = [0u8; 4];
        kind.copy_from_slice(&bytes[offset + 4..offset + 8]);
        let (header, size) = match size32 {
            0 => (8, (end - offset) as u64),
            1 => (16, read_u64_be(bytes, offset + 8).ok_or("truncated large box header")?),
            n => (8, u64::from(n)),
        };
        let box_end = (offset as u64)
            .checked_add(size)
            .filter(|box_end| size >= header as u64 && *box_end <= end as u64)
            .and_then(|box_end| usize::try_from(box_end).ok())
            .ok_or_else(|| {
                format!(
                    "box '{}' overruns its container",
                    String::from_utf8_lossy(&kind)
                )
            })?;
        boxes.push((kind, offset + header, box_end));
        offset = box_end;
    }
    Ok(boxes)
}

/// Duration from `moov/mvhd`.
fn mp4_duration(bytes: &[u8]) -> Result<f64, String> {
    let top = mp4_boxes(bytes, 0, bytes.len())?;
    let (_, moov_start, moov_end) = top
        .iter()
        .find(|(kind, _, _)| kind == b"moov")
        .ok_or("mp4 has no moov box")?;
    let children = mp4_boxes(bytes, *moov_start, *moov_end)?;
    let (_, mvhd, _) = children
        .iter()
        .find(|(kind, _, _)| kind == b"mvhd")
        .ok_or("mp4 has no mvhd box")?;

    let version = *bytes.get(*mvhd).ok_or("truncated mvhd")?;
    let (timescale, duration) = if version == 1 {
        (
            read_u32_be(bytes, mvhd + 20).ok_or("truncated mvhd")?,
            read_u64_be(bytes, mvhd + 24).ok_or("truncated mvhd")?,
        )
    } else {
        (
            read_u32_be(bytes, mvhd + 12).ok_or("truncated mvhd")?,
            u64::from(read_u32_be(bytes, mvhd + 16).ok_or("truncated mvhd")?),
        )
    };
    if timescale == 0 {
        return Err("mp4 declares a zero timescale".to_string());
    }
    if duration == 0 {
        return Err("mp4 has zero duration".to_string());
    }
    Ok(duration as f64 / f64::from(timescale))
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

/// Outcome of validating one asset. Produced once per delivered or
/// generated asset.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IntegrityReport {
    pub asset_ref: String,
    pub crc32: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    pub size_bytes: usize,
    pub format_valid: bool,
    pub corruption_suspected: bool,
    pub recovery_attempted: bool,
    pub recovered: bool,
    pub quarantined: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Result of [`verify`].
#[derive(Debug, Clone)]
pub struct Verification {
    pub report: IntegrityReport,
    /// Present when the asset (possibly recovered) is deliverable.
    pub inspection: Option<Inspection>,
    /// Byte offset at which the recovered payload starts.
    pub recovered_offset: Option<usize>,
}

/// Fast checksum plus, at or above the configured size, a strong hash.
pub fn checksums(bytes: &[u8], settings: &IntegritySettings) -> (String, Option<String>) {
    let strong = (bytes.len() >= settings.strong_hash_min_bytes).then(|| sha256_hex(bytes));
    (crc32_hex(bytes), strong)
}

/// Validate `bytes` and, when they fail, attempt a single recovery.
///
/// `declared_crc32` is the checksum announced by the producer, if any; a
/// mismatch counts as corruption. Recovery looks for a valid container
/// signature within `recovery_scan_bytes` after leading garbage and accepts
/// the trailing slice only if it passes every check again.
pub fn verify(
    asset_ref: &str,
    bytes: &[u8],
    media: MediaType,
    declared_crc32: Option<&str>,
    settings: &IntegritySettings,
) -> Verification {
    let first = check(bytes, media, declared_crc32, settings);
    let (crc32, sha256) = checksums(bytes, settings);
    let mut report = IntegrityReport {
        asset_ref: asset_ref.to_string(),
        crc32,
        sha256,
        size_bytes: bytes.len(),
        format_valid: first.is_ok(),
        corruption_suspected: first.is_err(),
        recovery_attempted: false,
        recovered: false,
        quarantined: false,
        detail: None,
    };

    let reason = match first {
        Ok(inspection) => {
            return Verification {
                report,
                inspection: Some(inspection),
                recovered_offset: None,
            }
        }
        Err(reason) => reason,
    };

    report.recovery_attempted = true;
    match recover_by_signature_scan(bytes, media, declared_crc32, settings) {
        Some((offset, inspection)) => {
            let (crc32, sha256) = checksums(&bytes[offset..], settings);
            report.crc32 = crc32;
            report.sha256 = sha256;
            report.size_bytes = bytes.len() - offset;
            report.recovered = true;
            report.detail = Some(format!("{reason}; recovered by dropping {offset} leading bytes"));
            Verification {
                report,
                inspection: Some(inspection),
                recovered_offset: Some(offset),
            }
        }
        None => {
            report.detail = Some(reason);
            Verification {
                report,
                inspection: None,
                recovered_offset: None,
            }
        }
    }
}

fn check(
    bytes: &[u8],
    media: MediaType,
    declared_crc32: Option<&str>,
    settings: &IntegritySettings,
) -> Result<Inspection, String> {
    if let Some(expected) = declared_crc32 {
        let actual = crc32_hex(bytes);
        if !actual.eq_ignore_ascii_case(expected) {
            return Err(format!("checksum mismatch: expected crc32 {expected}, got {actual}"));
        }
    }
    inspect(bytes, media, settings)
}

/// Search for a container signature after offset 0 and re-validate from
/// there. Bounded by `recovery_scan_bytes`.
pub fn recover_by_signature_scan(
    bytes: &[u8],
    media: MediaType,
    declared_crc32: Option<&str>,
    settings: &IntegritySettings,
) -> Option<(usize, Inspection)> {
    let limit = settings.recovery_scan_bytes.min(bytes.len());
    (1..limit).find_map(|offset| {
        let candidate = &bytes[offset..];
        let format = ContainerFormat::sniff(candidate)?;
        // MP3 frame sync is too weak a signal to recover from.
        if format == ContainerFormat::Mp3 || format.media_type() != media {
            return None;
        }
        check(candidate, media, declared_crc32, settings)
            .ok()
            .map(|inspection| (offset, inspection))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> IntegritySettings {
        IntegritySettings {
            strong_hash_min_bytes: 1024,
            min_image_width: 8,
            min_image_height: 8,
            recovery_scan_bytes: 256,
        }
    }

    fn png(width: u32, height: u32) -> Vec<u8> {
        let img = image::RgbImage::from_pixel(width, height, image::Rgb([10, 20, 30]));
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, image::ImageFormat::Png).unwrap();
        out.into_inner()
    }

    fn wav(data_bytes: u32) -> Vec<u8> {
        let byte_rate = 16_000u32 * 2;
        let mut out = Vec::new();
        out.extend_from_slice(b"RIFF");
        out.extend_from_slice(&(36 + data_bytes).to_le_bytes());
        out.extend_from_slice(b"WAVE");
        out.extend_from_slice(b"fmt ");
        out.extend_from_slice(&16u32.to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes()); // PCM
        out.extend_from_slice(&1u16.to_le_bytes()); // mono
        out.extend_from_slice(&16_000u32.to_le_bytes());
        out.extend_from_slice(&byte_rate.to_le_bytes());
        out.extend_from_slice(&2u16.to_le_bytes());
        out.extend_from_slice(&16u16.to_le_bytes());
        out.extend_from_slice(b"data");
        out.extend_from_slice(&data_bytes.to_le_bytes());
        out.extend(vec![0u8; data_bytes as usize]);
        out
    }

    fn mp4(timescale: u32, duration: u32) -> Vec<u8> {
        let mut mvhd_body = vec![0u8; 4]; // version 0 + flags
        mvhd_body.extend_from_slice(&0u32.to_be_bytes()); // creation
        mvhd_body.extend_from_slice(&0u32.to_be_bytes()); // modification
        mvhd_body.extend_from_slice(&timescale.to_be_bytes());
        mvhd_body.extend_from_slice(&duration.to_be_bytes());
        mvhd_body.extend([0u8; 80]);

        let boxed = |kind: &[u8; 4], body: &[u8]| {
            let mut b = ((body.len() + 8) as u32).to_be_bytes().to_vec();
            b.extend_from_slice(kind);
            b.extend_from_slice(body);
            b
        };
        let mut out = boxed(b"ftyp", b"isom\0\0\x02\0isomiso2");
        out.extend(boxed(b"moov", &boxed(b"mvhd", &mvhd_body)));
        out
    }

    // -- sniffing --

    #[test]
    fn sniff_known_signatures() {
        assert_eq!(ContainerFormat::sniff(&png(8, 8)), Some(ContainerFormat::Png));
        assert_eq!(ContainerFormat::sniff(&wav(2)), Some(ContainerFormat::Wav));
        assert_eq!(ContainerFormat::sniff(&mp4(1000, 1)), Some(ContainerFormat::Mp4));
        assert_eq!(ContainerFormat::sniff(b"OggS\0\0"), Some(ContainerFormat::Ogg));
        assert_eq!(ContainerFormat::sniff(b"hello world"), None);
    }

    // -- inspection --

    #[test]
    fn image_dimensions_are_checked() {
        let s = settings();
        let ok = inspect(&png(16, 12), MediaType::Image, &s).unwrap();
        assert_eq!((ok.width, ok.height), (Some(16), Some(12)));
        assert!(inspect(&png(4, 4), MediaType::Image, &s).is_err());
    }

    #[test]
    fn truncated_png_is_invalid() {
        let bytes = png(16, 16);
        assert!(inspect(&bytes[..20], MediaType::Image, &settings()).is_err());
    }

    #[test]
    fn wav_duration_is_computed() {
        let inspection = inspect(&wav(32_000), MediaType::Audio, &settings()).unwrap();
        assert_eq!(inspection.duration_secs, Some(1.0));
    }

    #[test]
    fn wav_without_samples_is_invalid() {
        assert!(inspect(&wav(0), MediaType::Audio, &settings()).is_err());
    }

    #[test]
    fn truncated_wav_is_invalid() {
        let bytes = wav(1_000);
        assert!(inspect(&bytes[..200], MediaType::Audio, &settings()).is_err());
    }

    #[test]
    fn mp4_duration_is_computed() {
        let inspection = inspect(&mp4(1_000, 2_500), MediaType::Video, &settings()).unwrap();
        assert_eq!(inspection.duration_secs, Some(2.5));
        assert!(inspect(&mp4(1_000, 0), MediaType::Video, &settings()).is_err());
    }

    #[test]
    fn oversized_large_box_is_rejected() {
        let mut bytes = 16u32.to_be_bytes().to_vec();
        bytes.extend_from_slice(b"ftypisom\0\0\x02\0");
        bytes.extend_from_slice(&1u32.to_be_bytes());
        bytes.extend_from_slice(b"mdat");
        bytes.extend_from_slice(&u64::MAX.to_be_bytes());
        bytes.extend_from_slice(&[0u8; 32]);

        let err = inspect(&bytes, MediaType::Video, &settings()).unwrap_err();
        assert!(err.contains("overruns"), "{err}");

        let v = verify("a", &bytes, MediaType::Video, None, &settings());
        assert!(v.inspection.is_none());
        assert!(v.report.corruption_suspected);
    }

    #[test]
    fn wrapping_box_size_is_rejected() {
        let mut bytes = mp4(1_000, 2_500);
        bytes.extend_from_slice(&1u32.to_be_bytes());
        bytes.extend_from_slice(b"free");
        bytes.extend_from_slice(&(u64::MAX - 8).to_be_bytes());
        assert!(inspect(&bytes, MediaType::Video, &settings()).is_err());
    }

    #[test]
    fn wrong_media_type_is_invalid() {
        assert!(inspect(&png(16, 16), MediaType::Video, &settings()).is_err());
    }

    // -- verify --

    #[test]
    fn valid_asset_passes_without_recovery() {
        let bytes = png(16, 16);
        let v = verify("a", &bytes, MediaType::Image, None, &settings());
        assert!(v.inspection.is_some());
        assert!(!v.report.corruption_suspected);
        assert!(!v.report.recovery_attempted);
        assert_eq!(v.report.crc32, crc32_hex(&bytes));
        assert!(v.report.sha256.is_none());
    }

    #[test]
    fn large_asset_gets_strong_hash() {
        let bytes = wav(4_000);
        let v = verify("a", &bytes, MediaType::Audio, None, &settings());
        assert_eq!(v.report.sha256.as_deref(), Some(sha256_hex(&bytes).as_str()));
    }

    #[test]
    fn leading_garbage_is_recovered() {
        let clean = png(16, 16);
        let mut bytes = b"HTTP/1.1 200 OK\r\n\r\n".to_vec();
        let offset = bytes.len();
        bytes.extend_from_slice(&clean);

        let v = verify("a", &bytes, MediaType::Image, None, &settings());
        assert!(v.report.corruption_suspected);
        assert!(v.report.recovery_attempted);
        assert!(v.report.recovered);
        assert_eq!(v.recovered_offset, Some(offset));
        assert_eq!(&bytes[offset..], clean.as_slice());
    }

    #[test]
    fn garbage_is_not_deliverable() {
        let bytes = vec![0x42u8; 512];
        let v = verify("a", &bytes, MediaType::Image, None, &settings());
        assert!(!v.inspection.is_some());
        assert!(v.report.corruption_suspected);
        assert!(v.report.recovery_attempted);
        assert!(!v.report.recovered);
        assert_eq!(v.recovered_offset, None);
    }

    #[test]
    fn declared_checksum_mismatch_is_corruption() {
        let bytes = png(16, 16);
        let v = verify("a", &bytes, MediaType::Image, Some("00000000"), &settings());
        assert!(!v.inspection.is_some());
        assert!(v.report.detail.unwrap().contains("checksum mismatch"));

        let good = crc32_hex(&bytes);
        assert!(verify("a", &bytes, MediaType::Image, Some(&good), &settings())
            .inspection
            .is_some());
    }
}
