//! Error types for media operations.

use std::path::PathBuf;
use thiserror::Error;

/// Result type for media operations.
pub type MediaResult<T> = Result<T, MediaError>;

/// Errors that can occur during encoding.
#[derive(Debug, Error)]
pub enum MediaError {
    #[error("FFmpeg not found: {0}")]
    FfmpegNotFound(String),

    #[error("FFprobe not found in PATH")]
    FfprobeNotFound,

    #[error("FFmpeg command failed: {message}")]
    FfmpegFailed {
        message: String,
        stderr: Option<String>,
        exit_code: Option<i32>,
    },

    #[error("FFprobe command failed: {message}")]
    FfprobeFailed {
        message: String,
        stderr: Option<String>,
    },

    #[error("File not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Operation timed out after {0} seconds")]
    Timeout(u64),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("Invalid video file: {0}")]
    InvalidVideo(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Resource limit exceeded: {0}")]
    ResourceLimit(String),
}

/// Stderr fragments that mean the input or the requested output can never
/// be produced, whatever the retry.
const PERMANENT_STDERR_PATTERNS: &[&str] = &[
    "invalid data found when processing input",
    "no such file or directory",
    "does not contain any stream",
    "moov atom not found",
    "unknown encoder",
    "encoder not found",
    "not supported",
    "unsupported codec",
    "could not find codec parameters",
    "invalid argument",
];

impl MediaError {
    /// Create an FFmpeg failure error.
    pub fn ffmpeg_failed(
        message: impl Into<String>,
        stderr: Option<String>,
        exit_code: Option<i32>,
    ) -> Self {
        Self::FfmpegFailed {
            message: message.into(),
            stderr,
            exit_code,
        }
    }

    pub fn invalid_video(message: impl Into<String>) -> Self {
        Self::InvalidVideo(message.into())
    }

    /// Whether a retry of the same encode may succeed.
    ///
    /// Timeouts, I/O errors, resource exhaustion and killed processes are
    /// transient. Malformed input, unsupported codecs and missing tools are
    /// permanent.
    pub fn is_transient(&self) -> bool {
        match self {
            MediaError::Timeout(_) | MediaError::Io(_) | MediaError::ResourceLimit(_) => true,
            MediaError::FfmpegFailed {
                stderr, exit_code, ..
            } => {
                let permanent = stderr
                    .as_deref()
                    .is_some_and(stderr_indicates_permanent);
                // No exit code means the process was killed by a signal
                !permanent || exit_code.is_none()
            }
            MediaError::FfprobeFailed { stderr, .. } => {
                !stderr.as_deref().is_some_and(stderr_indicates_permanent)
            }
            MediaError::FfmpegNotFound(_)
            | MediaError::FfprobeNotFound
            | MediaError::FileNotFound(_)
            | MediaError::JsonParse(_)
            | MediaError::InvalidVideo(_)
            | MediaError::UnsupportedFormat(_) => false,
        }
    }

    /// Message with the most relevant stderr line appended.
    pub fn detail(&self) -> String {
        match self {
            MediaError::FfmpegFailed {
                message,
                stderr: Some(stderr),
                ..
            } => match stderr.lines().rev().find(|l| !l.trim().is_empty()) {
                Some(last) => format!("{}: {}", message, last.trim()),
                None => message.clone(),
            },
            other => other.to_string(),
        }
    }
}

fn stderr_indicates_permanent(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    PERMANENT_STDERR_PATTERNS.iter().any(|p| lower.contains(p))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(MediaError::Timeout(30).is_transient());
        assert!(MediaError::ResourceLimit("out of memory".into()).is_transient());
        assert!(!MediaError::invalid_video("no video stream").is_transient());
        assert!(!MediaError::FfmpegNotFound("ffmpeg".into()).is_transient());

        let malformed = MediaError::ffmpeg_failed(
            "FFmpeg exited with non-zero status",
            Some("in.mp4: Invalid data found when processing input".into()),
            Some(1),
        );
        assert!(!malformed.is_transient());

        let crashed = MediaError::ffmpeg_failed(
            "FFmpeg exited with non-zero status",
            Some("Conversion failed!".into()),
            Some(1),
        );
        assert!(crashed.is_transient());

        let killed = MediaError::ffmpeg_failed(
            "FFmpeg exited with non-zero status",
            Some("Invalid argument".into()),
            None,
        );
        assert!(killed.is_transient());
    }

    #[test]
    fn test_detail_uses_last_stderr_line() {
        let err = MediaError::ffmpeg_failed(
            "FFmpeg exited with non-zero status",
            Some("frame=1\nUnknown encoder 'libfoo'\n\n".into()),
            Some(1),
        );
        assert_eq!(
            err.detail(),
            "FFmpeg exited with non-zero status: Unknown encoder 'libfoo'"
        );
    }
}
