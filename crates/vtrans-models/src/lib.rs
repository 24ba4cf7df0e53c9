//! Shared data models for the transcoding orchestrator.
//!
//! This crate provides Serde-serializable types for:
//! - Jobs and their owned renditions, with their state machines
//! - Encoding profiles (the resolution/bitrate ladder)
//! - Consumed and published events
//! - Output path templates

pub mod error;
pub mod event;
pub mod job;
pub mod paths;
pub mod profile;
pub mod rendition;

// Re-export common types
pub use error::{ModelError, ModelResult};
pub use event::{
    OutcomeEvent, OutputDetail, VideoProcessingFailed, VideoTranscoded, VideoUploaded,
};
pub use job::{Job, JobId, JobStatus, Settlement};
pub use paths::{dash_manifest_path, render_manifest_path, render_output_path, validate_template};
pub use profile::{default_ladder, RenditionProfile, VideoCodec};
pub use rendition::{FailureKind, Rendition, RenditionError, RenditionId, RenditionStatus};
