//! FFmpeg CLI wrapper for rendition encoding.
//!
//! This crate provides:
//! - The [`Encoder`] seam used by the rendition executor
//! - An FFmpeg implementation producing an HLS variant playlist plus segments
//! - `-progress` parsing and failure classification

pub mod command;
pub mod encoder;
pub mod error;
pub mod probe;
pub mod progress;

pub use command::{check_ffmpeg, FfmpegCommand, FfmpegRunner};
pub use encoder::{
    collect_artifact, playlist_duration, EncodeRequest, EncodedArtifact, Encoder, FfmpegConfig,
    FfmpegEncoder, VARIANT_PLAYLIST,
};
pub use error::{MediaError, MediaResult};
pub use probe::{is_remote, probe_source, SourceInfo};
pub use progress::{EncodeProgress, ProgressCallback};
