//! Job lifecycle logging.
//!
//! Lines are emitted inside the job's span (see [`job_span`]), so the logger
//! adds the identity fields a log search needs without repeating the span.

use tracing::{error, info, warn, Span};
use vtrans_models::{Job, JobId};

use crate::scheduler::JobOutcome;

#[derive(Debug, Clone)]
pub struct JobLogger {
    job_id: String,
    video_id: String,
    tenant_id: String,
    owner: String,
}

impl JobLogger {
    pub fn new(job: &Job, owner: &str) -> Self {
        Self {
            job_id: job.id.to_string(),
            video_id: job.video_id.clone(),
            tenant_id: job.tenant_id.clone(),
            owner: owner.to_string(),
        }
    }

    pub fn log_start(&self, attempts: u32, pending: usize) {
        info!(
            job_id = %self.job_id,
            video_id = %self.video_id,
            tenant_id = %self.tenant_id,
            owner = %self.owner,
            attempts,
            pending,
            "Processing job"
        );
    }

    pub fn log_progress(&self, message: &str) {
        info!(job_id = %self.job_id, "{}", message);
    }

    pub fn log_warning(&self, message: &str) {
        warn!(job_id = %self.job_id, owner = %self.owner, "{}", message);
    }

    pub fn log_error(&self, message: &str) {
        error!(
            job_id = %self.job_id,
            video_id = %self.video_id,
            owner = %self.owner,
            "{}", message
        );
    }

    /// How processing ended on this instance.
    pub fn log_settled(&self, outcome: &JobOutcome) {
        match outcome {
            JobOutcome::Requeued { attempts, delay } => info!(
                job_id = %self.job_id,
                video_id = %self.video_id,
                attempts,
                retry_in = ?delay,
                "Job requeued"
            ),
            JobOutcome::Abandoned => warn!(
                job_id = %self.job_id,
                owner = %self.owner,
                "Job abandoned after lease loss"
            ),
            other => info!(
                job_id = %self.job_id,
                video_id = %self.video_id,
                tenant_id = %self.tenant_id,
                outcome = other.as_str(),
                "Job settled"
            ),
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }
}

/// Span wrapping all work on one job by this instance.
pub fn job_span(job_id: &JobId) -> Span {
    tracing::info_span!("job", job_id = %job_id)
}
