//! The encoder seam and its FFmpeg HLS implementation.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use vtrans_models::{RenditionProfile, VideoCodec};

use crate::command::{FfmpegCommand, FfmpegRunner};
use crate::error::{MediaError, MediaResult};
use crate::probe::probe_source;
use crate::progress::{EncodeProgress, ProgressCallback};

/// Playlist file name inside every rendition directory.
pub const VARIANT_PLAYLIST: &str = "index.m3u8";

/// One rendition encode.
#[derive(Debug, Clone)]
pub struct EncodeRequest {
    /// Local path or URL of the source media
    pub input_location: String,
    pub profile: RenditionProfile,
    /// Target HLS segment length in seconds
    pub segment_duration_secs: u32,
    /// Directory the playlist and segments are written to
    pub output_dir: PathBuf,
}

/// Files produced by an encode, relative to `dir`.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedArtifact {
    pub dir: PathBuf,
    /// Variant playlist file name
    pub playlist: String,
    /// Every produced file name, playlist included, sorted
    pub files: Vec<String>,
    pub duration_secs: Option<f64>,
}

/// Transcodes one rendition of a source video.
#[async_trait]
pub trait Encoder: Send + Sync {
    async fn encode(
        &self,
        request: &EncodeRequest,
        progress: ProgressCallback,
    ) -> MediaResult<EncodedArtifact>;
}

/// FFmpeg settings.
#[derive(Debug, Clone)]
pub struct FfmpegConfig {
    /// Binary name or path
    pub binary: String,
    /// x264/x265 preset
    pub preset: String,
    /// Per-encode timeout
    pub timeout: Duration,
}

impl Default for FfmpegConfig {
    fn default() -> Self {
        Self {
            binary: "ffmpeg".to_string(),
            preset: "veryfast".to_string(),
            timeout: Duration::from_secs(3600),
        }
    }
}

impl FfmpegConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            binary: std::env::var("FFMPEG_PATH").unwrap_or(defaults.binary),
            preset: std::env::var("FFMPEG_PRESET").unwrap_or(defaults.preset),
            timeout: std::env::var("FFMPEG_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
        }
    }
}

/// Encoder backed by the FFmpeg CLI.
pub struct FfmpegEncoder {
    config: FfmpegConfig,
}

impl FfmpegEncoder {
    pub fn new(config: FfmpegConfig) -> Self {
        Self { config }
    }

    fn build_command(&self, request: &EncodeRequest, has_audio: bool) -> FfmpegCommand {
        let profile = &request.profile;
        let fmp4 = profile.codec != VideoCodec::H264;
        let segment_ext = if fmp4 { "m4s" } else { "ts" };
        let segment_pattern = request
            .output_dir
            .join(format!("seg_%05d.{}", segment_ext));

        let mut cmd = FfmpegCommand::new(
            request.input_location.clone(),
            request.output_dir.join(VARIANT_PLAYLIST),
        )
        .scale_to_height(profile.height)
        .video_codec(profile.codec.ffmpeg_encoder())
        .video_bitrate(profile.video_bitrate_kbps);

        if matches!(profile.codec, VideoCodec::H264 | VideoCodec::Hevc) {
            cmd = cmd.preset(self.config.preset.clone());
        }
        if profile.codec == VideoCodec::Hevc {
            cmd = cmd.output_args(["-tag:v", "hvc1"]);
        }

        cmd = if has_audio {
            cmd.audio_codec("aac")
                .audio_bitrate(profile.audio_bitrate_kbps)
                .output_args(["-ac", "2"])
        } else {
            cmd.output_arg("-an")
        };

        cmd.keyframe_interval(request.segment_duration_secs).hls(
            request.segment_duration_secs,
            &segment_pattern.to_string_lossy(),
            fmp4,
        )
    }
}

#[async_trait]
impl Encoder for FfmpegEncoder {
    async fn encode(
        &self,
        request: &EncodeRequest,
        progress: ProgressCallback,
    ) -> MediaResult<EncodedArtifact> {
        tokio::fs::create_dir_all(&request.output_dir).await?;

        // Probing only improves progress reporting, unless it proves the input unusable
        let source = match probe_source(&request.input_location).await {
            Ok(info) => Some(info),
            Err(MediaError::FfprobeNotFound) => None,
            Err(e) if e.is_transient() => {
                warn!(error = %e, "Probe failed, encoding without duration");
                None
            }
            Err(e) => return Err(e),
        };
        if let Some(info) = source.as_ref().filter(|s| s.upscales_to(request.profile.height)) {
            warn!(
                resolution = %request.profile.resolution(),
                source_height = info.height,
                "Rendition upscales the source"
            );
        }
        let total_ms = source.as_ref().and_then(|s| s.duration_ms);
        let has_audio = source.as_ref().map_or(true, |s| s.has_audio);

        let cmd = self.build_command(request, has_audio);
        let runner = FfmpegRunner::new(self.config.binary.clone()).with_timeout(self.config.timeout);

        let sink = Arc::clone(&progress);
        runner
            .run_with_progress(&cmd, move |mut p: EncodeProgress| {
                p.total_ms = total_ms;
                sink(p);
            })
            .await?;

        let artifact = collect_artifact(request.output_dir.clone()).await?;
        info!(
            resolution = %request.profile.resolution(),
            files = artifact.files.len(),
            duration_secs = ?artifact.duration_secs,
            "Encoded rendition"
        );
        Ok(artifact)
    }
}

/// Gather the playlist and segments written to `dir`.
pub async fn collect_artifact(dir: PathBuf) -> MediaResult<EncodedArtifact> {
    let mut files = Vec::new();
    let mut entries = tokio::fs::read_dir(&dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            files.push(entry.file_name().to_string_lossy().to_string());
        }
    }
    files.sort();

    if !files.iter().any(|f| f == VARIANT_PLAYLIST) {
        return Err(MediaError::ffmpeg_failed(
            format!("no {} produced in {}", VARIANT_PLAYLIST, dir.display()),
            None,
            Some(0),
        ));
    }

    let playlist = tokio::fs::read(dir.join(VARIANT_PLAYLIST)).await?;
    let duration_secs = playlist_duration(&playlist);
    debug!(dir = %dir.display(), files = files.len(), "Collected encode output");

    Ok(EncodedArtifact {
        dir,
        playlist: VARIANT_PLAYLIST.to_string(),
        files,
        duration_secs,
    })
}

/// Total segment duration of a media playlist, `None` when it lists no
/// segments or does not parse.
pub fn playlist_duration(playlist: &[u8]) -> Option<f64> {
    let parsed = m3u8_rs::parse_media_playlist_res(playlist).ok()?;
    if parsed.segments.is_empty() {
        return None;
    }
    Some(parsed.segments.iter().map(|s| f64::from(s.duration)).sum())
}
