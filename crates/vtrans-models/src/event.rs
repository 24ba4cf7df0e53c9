//! Consumed and published events.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{ModelError, ModelResult};
use crate::job::{Job, JobId};
use crate::rendition::RenditionStatus;

/// Upload notification consumed by job intake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VideoUploaded {
    pub video_id: String,
    pub tenant_id: String,
    pub input_location: String,
}

impl VideoUploaded {
    pub fn new(
        video_id: impl Into<String>,
        tenant_id: impl Into<String>,
        input_location: impl Into<String>,
    ) -> Self {
        Self {
            video_id: video_id.into(),
            tenant_id: tenant_id.into(),
            input_location: input_location.into(),
        }
    }

    /// Ids end up in object keys, so they must be single path segments.
    pub fn validate(&self) -> ModelResult<()> {
        for (field, value) in [("videoId", &self.video_id), ("tenantId", &self.tenant_id)] {
            if value.trim().is_empty() {
                return Err(ModelError::invalid_upload(format!("{} is empty", field)));
            }
            if value.contains('/') || value.contains("..") || value.contains('{') {
                return Err(ModelError::invalid_upload(format!(
                    "{} '{}' is not a valid path segment",
                    field, value
                )));
            }
        }
        if self.input_location.trim().is_empty() {
            return Err(ModelError::invalid_upload("inputLocation is empty"));
        }
        Ok(())
    }
}

/// Per-rendition output details carried by a success event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OutputDetail {
    pub resolution: String,
    pub width: u32,
    pub height: u32,
    pub bitrate_kbps: u32,
    pub codec: String,
    pub output_location: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub playback_url: Option<String>,
}

/// Terminal outcome of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VideoTranscoded {
    pub job_id: JobId,
    pub video_id: String,
    pub tenant_id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manifest_location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dash_manifest_location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_messages: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_details: Option<Vec<OutputDetail>>,
}

impl VideoTranscoded {
    /// Success outcome for a completed job. Playback URLs are filled in later.
    pub fn succeeded(job: &Job) -> Self {
        let details = job
            .renditions
            .iter()
            .filter(|r| r.status == RenditionStatus::Completed)
            .map(|r| OutputDetail {
                resolution: r.resolution().to_string(),
                width: r.profile.width,
                height: r.profile.height,
                bitrate_kbps: r.profile.video_bitrate_kbps,
                codec: r.profile.codec.to_string(),
                output_location: r.output_location.clone().unwrap_or_default(),
                duration_secs: r.duration_secs,
                playback_url: None,
            })
            .collect();

        Self {
            job_id: job.id.clone(),
            video_id: job.video_id.clone(),
            tenant_id: job.tenant_id.clone(),
            success: true,
            manifest_location: job.output_manifest_path.clone(),
            dash_manifest_location: job.dash_manifest_path.clone(),
            error_messages: None,
            started_at: job.started_at,
            completed_at: job.completed_at.unwrap_or_else(Utc::now),
            output_details: Some(details),
        }
    }

    /// Failure outcome for a job whose retry budget is exhausted.
    pub fn failed(job: &Job) -> Self {
        Self {
            job_id: job.id.clone(),
            video_id: job.video_id.clone(),
            tenant_id: job.tenant_id.clone(),
            success: false,
            manifest_location: None,
            dash_manifest_location: None,
            error_messages: Some(job.error_history.clone()),
            started_at: job.started_at,
            completed_at: job.completed_at.unwrap_or_else(Utc::now),
            output_details: None,
        }
    }
}

/// Failure alert for a job whose retry budget is exhausted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VideoProcessingFailed {
    pub job_id: JobId,
    pub video_id: String,
    pub tenant_id: String,
    pub error_message: String,
    pub exception_kind: String,
    pub timestamp: DateTime<Utc>,
    pub diagnostic_info: BTreeMap<String, String>,
}

impl VideoProcessingFailed {
    pub fn from_job(job: &Job) -> Self {
        let mut diagnostic_info = BTreeMap::new();
        diagnostic_info.insert("attempts".to_string(), job.attempts.to_string());
        diagnostic_info.insert("inputLocation".to_string(), job.input_location.clone());
        for r in &job.renditions {
            diagnostic_info.insert(format!("rendition.{}", r.resolution()), r.status.to_string());
        }

        Self {
            job_id: job.id.clone(),
            video_id: job.video_id.clone(),
            tenant_id: job.tenant_id.clone(),
            error_message: job
                .error_message
                .clone()
                .unwrap_or_else(|| job.aggregated_errors().join("; ")),
            exception_kind: job
                .primary_failure_kind()
                .map(|k| k.as_str().to_string())
                .unwrap_or_else(|| "unknown".to_string()),
            timestamp: job.completed_at.unwrap_or_else(Utc::now),
            diagnostic_info,
        }
    }
}

/// Event published to the event bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type")]
pub enum OutcomeEvent {
    VideoTranscoded(VideoTranscoded),
    VideoProcessingFailed(VideoProcessingFailed),
}

impl OutcomeEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            OutcomeEvent::VideoTranscoded(_) => "VideoTranscoded",
            OutcomeEvent::VideoProcessingFailed(_) => "VideoProcessingFailed",
        }
    }

    pub fn job_id(&self) -> &JobId {
        match self {
            OutcomeEvent::VideoTranscoded(e) => &e.job_id,
            OutcomeEvent::VideoProcessingFailed(e) => &e.job_id,
        }
    }
}
