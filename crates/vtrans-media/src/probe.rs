//! Source inspection with ffprobe.
//!
//! The encoder only needs a few facts about the source: how long it is (for
//! progress), whether it has audio (to choose the audio mapping), and its
//! frame size (to flag upscaling renditions). Anything without a video
//! stream is rejected as unusable.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use serde::Deserialize;
use tokio::process::Command;

use crate::error::{MediaError, MediaResult};

/// Remote sources can stall on the first byte.
const PROBE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq)]
pub struct SourceInfo {
    pub duration_ms: Option<i64>,
    pub width: u32,
    pub height: u32,
    pub video_codec: String,
    pub has_audio: bool,
}

impl SourceInfo {
    /// Whether a rendition of `height` lines would upscale this source.
    pub fn upscales_to(&self, height: u32) -> bool {
        self.height > 0 && height > self.height
    }
}

#[derive(Debug, Deserialize)]
struct ProbeReport {
    #[serde(default)]
    format: ProbeFormat,
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Debug, Default, Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    codec_type: String,
    codec_name: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
}

/// Whether an input location is a URL rather than a local path.
pub fn is_remote(input: &str) -> bool {
    input.contains("://")
}

/// Inspect a local file or URL.
pub async fn probe_source(input: &str) -> MediaResult<SourceInfo> {
    if !is_remote(input) && !Path::new(input).exists() {
        return Err(MediaError::FileNotFound(input.into()));
    }
    which::which("ffprobe").map_err(|_| MediaError::FfprobeNotFound)?;

    let probe = Command::new("ffprobe")
        .args(["-v", "error", "-print_format", "json", "-show_format", "-show_streams"])
        .arg(input)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output();
    let output = tokio::time::timeout(PROBE_TIMEOUT, probe)
        .await
        .map_err(|_| MediaError::Timeout(PROBE_TIMEOUT.as_secs()))??;

    if !output.status.success() {
        return Err(MediaError::FfprobeFailed {
            message: format!("ffprobe exited with {}", output.status),
            stderr: Some(String::from_utf8_lossy(&output.stderr).trim().to_string()),
        });
    }
    parse_probe_output(&output.stdout)
}

fn parse_probe_output(stdout: &[u8]) -> MediaResult<SourceInfo> {
    let report: ProbeReport = serde_json::from_slice(stdout)?;

    let video = report
        .streams
        .iter()
        .find(|s| s.codec_type == "video")
        .ok_or_else(|| MediaError::invalid_video("source has no video stream"))?;

    let duration_ms = report
        .format
        .duration
        .as_deref()
        .and_then(|d| d.parse::<f64>().ok())
        .map(|secs| (secs * 1000.0).round() as i64)
        .filter(|ms| *ms > 0);

    Ok(SourceInfo {
        duration_ms,
        width: video.width.unwrap_or(0),
        height: video.height.unwrap_or(0),
        video_codec: video.codec_name.clone().unwrap_or_default(),
        has_audio: report.streams.iter().any(|s| s.codec_type == "audio"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_probe_output() {
        let json = br#"{
            "format": {"duration": "12.5"},
            "streams": [
                {"codec_type": "video", "codec_name": "h264", "width": 1280, "height": 720},
                {"codec_type": "audio", "codec_name": "aac"}
            ]
        }"#;
        let info = parse_probe_output(json).unwrap();
        assert_eq!(info.duration_ms, Some(12_500));
        assert_eq!(info.video_codec, "h264");
        assert!(info.has_audio);
        assert!(info.upscales_to(1080));
        assert!(!info.upscales_to(480));
    }

    #[test]
    fn test_missing_duration_is_unknown() {
        let json = br#"{"streams": [{"codec_type": "video"}]}"#;
        let info = parse_probe_output(json).unwrap();
        assert_eq!(info.duration_ms, None);
        assert!(!info.has_audio);
        // Unknown frame size never counts as upscaling
        assert!(!info.upscales_to(2160));
    }

    #[test]
    fn test_audio_only_input_is_invalid() {
        let json = br#"{"format": {}, "streams": [{"codec_type": "audio"}]}"#;
        let err = parse_probe_output(json).unwrap_err();
        assert!(!err.is_transient());
    }
}
