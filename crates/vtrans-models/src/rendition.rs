//! Renditions: one encoded output variant of a job's source video.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::{ModelError, ModelResult};
use crate::job::JobId;
use crate::profile::RenditionProfile;

/// Unique identifier for a rendition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct RenditionId(pub String);

impl RenditionId {
    /// Generate a new random rendition ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RenditionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RenditionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Rendition processing status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum RenditionStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
}

impl RenditionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RenditionStatus::Pending => "pending",
            RenditionStatus::Processing => "processing",
            RenditionStatus::Completed => "completed",
            RenditionStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RenditionStatus::Completed | RenditionStatus::Failed)
    }
}

impl fmt::Display for RenditionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Classification of a rendition failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Encoder failed for a reason that may clear up (resource exhaustion, timeout)
    TransientEncode,
    /// Encoder rejected the input (malformed media, unsupported codec)
    PermanentEncode,
    /// Blob store or job store I/O failed
    Storage,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::TransientEncode => "transient_encode_error",
            FailureKind::PermanentEncode => "permanent_encode_error",
            FailureKind::Storage => "storage_error",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A recorded rendition failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct RenditionError {
    pub kind: FailureKind,
    pub message: String,
}

impl RenditionError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// One encoded output variant owned by a [`crate::Job`].
///
/// `job_id` is a lookup key back to the owning job, never an owning edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Rendition {
    pub id: RenditionId,
    pub job_id: JobId,
    pub profile: RenditionProfile,
    #[serde(default)]
    pub status: RenditionStatus,
    /// Job attempt this rendition state belongs to
    #[serde(default)]
    pub attempt: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<RenditionError>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Rendition {
    /// Plan a new pending rendition for a job.
    pub fn planned(job_id: &JobId, profile: RenditionProfile, now: DateTime<Utc>) -> Self {
        Self {
            id: RenditionId::new(),
            job_id: job_id.clone(),
            profile,
            status: RenditionStatus::Pending,
            attempt: 0,
            output_location: None,
            duration_secs: None,
            last_error: None,
            created_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn resolution(&self) -> &str {
        self.profile.resolution()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Pending -> Processing.
    pub fn start(&mut self, now: DateTime<Utc>) -> ModelResult<()> {
        self.ensure_status(RenditionStatus::Pending, RenditionStatus::Processing)?;
        self.status = RenditionStatus::Processing;
        self.started_at = Some(now);
        Ok(())
    }

    /// Processing -> Completed.
    pub fn complete(
        &mut self,
        output_location: impl Into<String>,
        duration_secs: Option<f64>,
        now: DateTime<Utc>,
    ) -> ModelResult<()> {
        self.ensure_status(RenditionStatus::Processing, RenditionStatus::Completed)?;
        self.status = RenditionStatus::Completed;
        self.output_location = Some(output_location.into());
        self.duration_secs = duration_secs;
        self.last_error = None;
        self.completed_at = Some(now);
        Ok(())
    }

    /// Processing -> Failed.
    pub fn fail(&mut self, error: RenditionError, now: DateTime<Utc>) -> ModelResult<()> {
        self.ensure_status(RenditionStatus::Processing, RenditionStatus::Failed)?;
        self.status = RenditionStatus::Failed;
        self.last_error = Some(error);
        self.completed_at = Some(now);
        Ok(())
    }

    /// Processing -> Pending, for a rendition left in flight by a lost owner.
    ///
    /// Returns whether the rendition was reset.
    pub fn reset_indeterminate(&mut self) -> bool {
        if self.status != RenditionStatus::Processing {
            return false;
        }
        self.status = RenditionStatus::Pending;
        self.started_at = None;
        true
    }

    /// Start a new job attempt for a non-completed rendition.
    ///
    /// Completed renditions are kept as-is. The previous failure stays in
    /// `last_error` until the rendition completes.
    pub fn reopen(&mut self, attempt: u32) -> bool {
        if self.status == RenditionStatus::Completed {
            return false;
        }
        self.status = RenditionStatus::Pending;
        self.attempt = attempt;
        self.started_at = None;
        self.completed_at = None;
        true
    }

    fn ensure_status(&self, from: RenditionStatus, to: RenditionStatus) -> ModelResult<()> {
        if self.status == from {
            Ok(())
        } else {
            Err(ModelError::invalid_transition("rendition", self.status, to))
        }
    }
}
