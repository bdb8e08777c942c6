//! Media types produced by generation providers.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// The kind of asset a request asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Image,
    Audio,
    Video,
}

impl MediaType {
    /// Every media type, in scheduling order.
    pub const ALL: [MediaType; 3] = [MediaType::Image, MediaType::Audio, MediaType::Video];

    /// String representation used in config keys, paths and events.
    pub fn as_str(self) -> &'static str {
        match self {
            MediaType::Image => "image",
            MediaType::Audio => "audio",
            MediaType::Video => "video",
        }
    }

    /// Parse from the lowercase name.
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "image" => Ok(MediaType::Image),
            "audio" => Ok(MediaType::Audio),
            "video" => Ok(MediaType::Video),
            other => Err(CoreError::Validation(format!(
                "Unknown media type '{other}'. Must be one of: image, audio, video"
            ))),
        }
    }

    /// Ordering rank inside a wave. Images and audio are cheaper and faster
    /// than video, so they go first to surface partial results sooner.
    pub fn schedule_rank(self) -> u8 {
        match self {
            MediaType::Image | MediaType::Audio => 0,
            MediaType::Video => 1,
        }
    }

    /// Default file extension when the container cannot be sniffed.
    pub fn default_extension(self) -> &'static str {
        match self {
            MediaType::Image => "png",
            MediaType::Audio => "wav",
            MediaType::Video => "mp4",
        }
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_round_trips_names() {
        for media in MediaType::ALL {
            assert_eq!(MediaType::parse(media.as_str()).unwrap(), media);
        }
    }

    #[test]
    fn parse_rejects_unknown() {
        assert!(MediaType::parse("hologram").is_err());
        assert!(MediaType::parse("").is_err());
    }

    #[test]
    fn video_ranks_after_image_and_audio() {
        assert!(MediaType::Image.schedule_rank() < MediaType::Video.schedule_rank());
        assert_eq!(
            MediaType::Image.schedule_rank(),
            MediaType::Audio.schedule_rank()
        );
    }

    #[test]
    fn serializes_lowercase() {
        let json = serde_json::to_string(&MediaType::Video).unwrap();
        assert_eq!(json, "\"video\"");
    }
}
