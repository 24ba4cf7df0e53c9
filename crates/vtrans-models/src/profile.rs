//! Encoding profiles and the rendition ladder.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Default audio bitrate for every rung of the ladder (kbps).
pub const DEFAULT_AUDIO_BITRATE_KBPS: u32 = 128;

/// Video codec of a rendition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum VideoCodec {
    #[default]
    H264,
    Hevc,
    Vp9,
    Av1,
}

impl VideoCodec {
    pub fn as_str(&self) -> &'static str {
        match self {
            VideoCodec::H264 => "h264",
            VideoCodec::Hevc => "hevc",
            VideoCodec::Vp9 => "vp9",
            VideoCodec::Av1 => "av1",
        }
    }

    /// FFmpeg encoder name for this codec.
    pub fn ffmpeg_encoder(&self) -> &'static str {
        match self {
            VideoCodec::H264 => "libx264",
            VideoCodec::Hevc => "libx265",
            VideoCodec::Vp9 => "libvpx-vp9",
            VideoCodec::Av1 => "libsvtav1",
        }
    }

    /// RFC 6381 codec string advertised in manifests (video + AAC-LC audio).
    pub fn manifest_codecs(&self) -> &'static str {
        match self {
            VideoCodec::H264 => "avc1.640028,mp4a.40.2",
            VideoCodec::Hevc => "hvc1.1.6.L120.90,mp4a.40.2",
            VideoCodec::Vp9 => "vp09.00.40.08,mp4a.40.2",
            VideoCodec::Av1 => "av01.0.08M.08,mp4a.40.2",
        }
    }
}

impl std::fmt::Display for VideoCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One rung of the resolution/bitrate ladder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct RenditionProfile {
    /// Resolution label used in output paths (e.g. "1080p")
    pub name: String,
    /// Output width in pixels
    pub width: u32,
    /// Output height in pixels
    pub height: u32,
    /// Target video bitrate in kbps
    pub video_bitrate_kbps: u32,
    /// Target audio bitrate in kbps
    #[serde(default = "default_audio_bitrate")]
    pub audio_bitrate_kbps: u32,
    /// Video codec
    #[serde(default)]
    pub codec: VideoCodec,
}

fn default_audio_bitrate() -> u32 {
    DEFAULT_AUDIO_BITRATE_KBPS
}

impl RenditionProfile {
    /// Create an H.264 profile with the default audio bitrate.
    pub fn new(name: impl Into<String>, width: u32, height: u32, video_bitrate_kbps: u32) -> Self {
        Self {
            name: name.into(),
            width,
            height,
            video_bitrate_kbps,
            audio_bitrate_kbps: DEFAULT_AUDIO_BITRATE_KBPS,
            codec: VideoCodec::H264,
        }
    }

    /// Returns a profile with a different codec.
    pub fn with_codec(mut self, codec: VideoCodec) -> Self {
        self.codec = codec;
        self
    }

    /// Resolution label used for the `{resolution}` placeholder.
    pub fn resolution(&self) -> &str {
        &self.name
    }

    /// Peak bandwidth in bits per second (video + audio).
    pub fn bandwidth(&self) -> u64 {
        (self.video_bitrate_kbps as u64 + self.audio_bitrate_kbps as u64) * 1000
    }

    /// `WIDTHxHEIGHT` as used by HLS `RESOLUTION` attributes.
    pub fn dimensions(&self) -> String {
        format!("{}x{}", self.width, self.height)
    }
}

/// The ladder used when no ladder is configured.
pub fn default_ladder() -> Vec<RenditionProfile> {
    vec![
        RenditionProfile::new("360p", 640, 360, 800),
        RenditionProfile::new("480p", 854, 480, 1400),
        RenditionProfile::new("720p", 1280, 720, 2800),
        RenditionProfile::new("1080p", 1920, 1080, 5000),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bandwidth_includes_audio() {
        let profile = RenditionProfile::new("480p", 854, 480, 1400);
        assert_eq!(profile.bandwidth(), 1_528_000);
        assert_eq!(profile.dimensions(), "854x480");
    }

    #[test]
    fn test_profile_deserializes_with_defaults() {
        let profile: RenditionProfile = serde_json::from_str(
            r#"{"name":"720p","width":1280,"height":720,"video_bitrate_kbps":2800}"#,
        )
        .unwrap();
        assert_eq!(profile.codec, VideoCodec::H264);
        assert_eq!(profile.audio_bitrate_kbps, DEFAULT_AUDIO_BITRATE_KBPS);
    }

    #[test]
    fn test_default_ladder_is_ordered_by_height() {
        let ladder = default_ladder();
        assert!(ladder.windows(2).all(|w| w[0].height < w[1].height));
    }
}
