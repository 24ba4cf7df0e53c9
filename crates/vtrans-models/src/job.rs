//! Transcoding jobs and the job state machine.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::{ModelError, ModelResult};
use crate::profile::RenditionProfile;
use crate::rendition::{FailureKind, Rendition, RenditionId, RenditionStatus};

/// Unique identifier for a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    /// Generate a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Job processing status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for a worker to claim it
    #[default]
    Pending,
    /// A worker holds the lease but has not started renditions yet
    Claimed,
    /// Renditions are being produced
    Processing,
    /// Every rendition completed and the manifest is published
    Completed,
    /// Retry budget exhausted
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Claimed => "claimed",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    /// Check if this is a terminal state (no more transitions).
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Whether `self -> next` is a legal transition.
    ///
    /// `Claimed`/`Processing -> Claimed` is a re-claim after lease expiry.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Claimed)
                | (Claimed, Claimed)
                | (Claimed, Processing)
                | (Processing, Claimed)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Pending)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How a job's rendition set settled once every rendition is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    /// Every rendition completed
    Succeeded,
    /// At least one rendition failed
    Failed {
        failed: usize,
        /// Failures classified as permanent encode errors
        permanent: usize,
    },
}

/// A transcoding job. Owns its renditions exclusively.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Job {
    /// Unique job ID
    pub id: JobId,

    /// Video ID from the upload notification
    pub video_id: String,

    /// Tenant that owns the video
    pub tenant_id: String,

    /// Source media location
    pub input_location: String,

    /// Job status
    #[serde(default)]
    pub status: JobStatus,

    /// Number of requeues after a failed attempt
    #[serde(default)]
    pub attempts: u32,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last update timestamp
    pub updated_at: DateTime<Utc>,

    /// First time any worker started processing
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    /// Terminal timestamp
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    /// Terminal error message (if failed)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    /// HLS master manifest location (if completed)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_manifest_path: Option<String>,

    /// DASH manifest location (if generated)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dash_manifest_path: Option<String>,

    /// Planned renditions, in ladder order
    pub renditions: Vec<Rendition>,

    /// Optimistic concurrency token, bumped by the store on every write
    #[serde(default)]
    pub version: u64,

    /// Worker currently holding the job lease
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,

    /// Earliest time a requeued job may be claimed again
    #[serde(skip_serializing_if = "Option::is_none")]
    pub not_before: Option<DateTime<Utc>>,

    /// Aggregated rendition errors from every failed attempt
    #[serde(default)]
    pub error_history: Vec<String>,

    /// Terminal outcome event not yet delivered to the event bus
    #[serde(default)]
    pub event_pending: bool,

    /// When the terminal outcome event was delivered
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_published_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Create a pending job with one pending rendition per ladder profile.
    pub fn new(
        video_id: impl Into<String>,
        tenant_id: impl Into<String>,
        input_location: impl Into<String>,
        ladder: &[RenditionProfile],
    ) -> Self {
        let id = JobId::new();
        let now = Utc::now();
        let renditions = ladder
            .iter()
            .map(|profile| Rendition::planned(&id, profile.clone(), now))
            .collect();

        Self {
            id,
            video_id: video_id.into(),
            tenant_id: tenant_id.into(),
            input_location: input_location.into(),
            status: JobStatus::Pending,
            attempts: 0,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            error_message: None,
            output_manifest_path: None,
            dash_manifest_path: None,
            renditions,
            version: 0,
            owner: None,
            not_before: None,
            error_history: Vec::new(),
            event_pending: false,
            event_published_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether a scheduler may try to claim this job now.
    ///
    /// Claimed/Processing jobs are candidates too: the lease decides whether
    /// their owner is still alive.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            JobStatus::Pending => self.not_before.map_or(true, |at| at <= now),
            JobStatus::Claimed | JobStatus::Processing => true,
            JobStatus::Completed | JobStatus::Failed => false,
        }
    }

    /// Take ownership after acquiring the lease.
    ///
    /// Any rendition left in Processing by a previous owner is indeterminate
    /// and is reset to Pending. Returns the number of renditions reset.
    pub fn claim(&mut self, owner: impl Into<String>, now: DateTime<Utc>) -> ModelResult<usize> {
        self.transition(JobStatus::Claimed, now)?;
        self.owner = Some(owner.into());
        self.not_before = None;
        let reset = self
            .renditions
            .iter_mut()
            .map(Rendition::reset_indeterminate)
            .filter(|reset| *reset)
            .count();
        Ok(reset)
    }

    /// Claimed -> Processing.
    pub fn start_processing(&mut self, now: DateTime<Utc>) -> ModelResult<()> {
        self.transition(JobStatus::Processing, now)?;
        if self.started_at.is_none() {
            self.started_at = Some(now);
        }
        Ok(())
    }

    /// Processing -> Completed. Requires every rendition to be completed.
    pub fn complete(
        &mut self,
        manifest_path: impl Into<String>,
        dash_manifest_path: Option<String>,
        now: DateTime<Utc>,
    ) -> ModelResult<()> {
        let incomplete = self
            .renditions
            .iter()
            .filter(|r| r.status != RenditionStatus::Completed)
            .count();
        if incomplete > 0 {
            return Err(ModelError::IncompleteRenditions(incomplete));
        }
        self.transition(JobStatus::Completed, now)?;
        self.output_manifest_path = Some(manifest_path.into());
        self.dash_manifest_path = dash_manifest_path;
        self.finish(now);
        Ok(())
    }

    /// Processing -> Failed, once the retry budget is exhausted.
    pub fn fail(&mut self, error_message: impl Into<String>, now: DateTime<Utc>) -> ModelResult<()> {
        self.transition(JobStatus::Failed, now)?;
        let message = error_message.into();
        self.error_history.push(message.clone());
        self.error_message = Some(message);
        self.finish(now);
        Ok(())
    }

    /// Processing -> Pending for another attempt.
    ///
    /// Increments `attempts`, reopens every non-completed rendition and
    /// records the failed attempt's errors. The job is not claimable before
    /// `not_before`.
    pub fn requeue(&mut self, not_before: DateTime<Utc>, now: DateTime<Utc>) -> ModelResult<()> {
        self.transition(JobStatus::Pending, now)?;
        let summary = self.aggregated_errors().join("; ");
        if !summary.is_empty() {
            self.error_history.push(summary);
        }
        self.attempts += 1;
        let attempt = self.attempts;
        for rendition in &mut self.renditions {
            rendition.reopen(attempt);
        }
        self.owner = None;
        self.not_before = Some(not_before);
        Ok(())
    }

    /// Record that the terminal outcome event reached the event bus.
    pub fn mark_event_published(&mut self, now: DateTime<Utc>) {
        self.event_pending = false;
        self.event_published_at = Some(now);
    }

    /// `None` while any rendition is still pending or processing.
    pub fn settlement(&self) -> Option<Settlement> {
        if !self.renditions.iter().all(Rendition::is_terminal) {
            return None;
        }
        let failed: Vec<_> = self
            .renditions
            .iter()
            .filter(|r| r.status == RenditionStatus::Failed)
            .collect();
        if failed.is_empty() {
            return Some(Settlement::Succeeded);
        }
        let permanent = failed
            .iter()
            .filter(|r| {
                r.last_error
                    .as_ref()
                    .is_some_and(|e| e.kind == FailureKind::PermanentEncode)
            })
            .count();
        Some(Settlement::Failed {
            failed: failed.len(),
            permanent,
        })
    }

    /// `"<resolution>: <message>"` for every failed rendition.
    pub fn aggregated_errors(&self) -> Vec<String> {
        self.renditions
            .iter()
            .filter(|r| r.status == RenditionStatus::Failed)
            .map(|r| {
                let message = r
                    .last_error
                    .as_ref()
                    .map(|e| e.message.as_str())
                    .unwrap_or("unknown error");
                format!("{}: {}", r.resolution(), message)
            })
            .collect()
    }

    /// Most severe failure kind among failed renditions.
    pub fn primary_failure_kind(&self) -> Option<FailureKind> {
        let kinds: Vec<FailureKind> = self
            .renditions
            .iter()
            .filter(|r| r.status == RenditionStatus::Failed)
            .filter_map(|r| r.last_error.as_ref().map(|e| e.kind))
            .collect();
        [
            FailureKind::PermanentEncode,
            FailureKind::Storage,
            FailureKind::TransientEncode,
        ]
        .into_iter()
        .find(|k| kinds.contains(k))
    }

    pub fn rendition(&self, id: &RenditionId) -> Option<&Rendition> {
        self.renditions.iter().find(|r| &r.id == id)
    }

    pub fn rendition_mut(&mut self, id: &RenditionId) -> ModelResult<&mut Rendition> {
        self.renditions
            .iter_mut()
            .find(|r| &r.id == id)
            .ok_or_else(|| ModelError::RenditionNotFound(id.to_string()))
    }

    /// Renditions the current attempt still has to run.
    pub fn pending_renditions(&self) -> Vec<RenditionId> {
        self.renditions
            .iter()
            .filter(|r| r.status == RenditionStatus::Pending)
            .map(|r| r.id.clone())
            .collect()
    }

    /// Structural invariants that must hold for every stored job.
    pub fn check_invariants(&self) -> Result<(), String> {
        if self
            .renditions
            .iter()
            .any(|r| r.job_id != self.id)
        {
            return Err(format!("job {} owns a rendition of another job", self.id));
        }
        if self.status == JobStatus::Completed {
            if let Some(r) = self
                .renditions
                .iter()
                .find(|r| r.status != RenditionStatus::Completed)
            {
                return Err(format!(
                    "job {} completed with rendition {} in {}",
                    self.id,
                    r.resolution(),
                    r.status
                ));
            }
            if self.output_manifest_path.is_none() {
                return Err(format!("job {} completed without a manifest", self.id));
            }
        }
        if self.is_terminal() && (self.owner.is_some() || self.completed_at.is_none()) {
            return Err(format!("job {} is terminal but still owned", self.id));
        }
        if let Some(r) = self.renditions.iter().find(|r| r.attempt > self.attempts) {
            return Err(format!(
                "rendition {} attempt {} ahead of job attempt {}",
                r.resolution(),
                r.attempt,
                self.attempts
            ));
        }
        Ok(())
    }

    fn transition(&mut self, next: JobStatus, now: DateTime<Utc>) -> ModelResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(ModelError::invalid_transition("job", self.status, next));
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    fn finish(&mut self, now: DateTime<Utc>) {
        self.completed_at = Some(now);
        self.owner = None;
        self.not_before = None;
        self.event_pending = true;
    }
}
