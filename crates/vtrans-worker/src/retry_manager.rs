//! Job-level retry decisions.
//!
//! Invoked once a job's rendition set settles with at least one failure (or
//! when manifest assembly fails). Either requeues the job behind a persisted
//! backoff or fails it for good.

use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use vtrans_models::{Job, Settlement};

use crate::config::{PermanentErrorPolicy, TranscodeConfig};
use crate::error::WorkerResult;
use crate::ownership::OwnedJob;
use crate::retry::exponential_delay;

/// What happens to a job whose attempt failed.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Back to Pending, claimable after `delay`
    Requeue { delay: Duration },
    /// Terminal failure
    Fail { reason: String },
}

/// Retry budget and backoff settings.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub permanent_error_policy: PermanentErrorPolicy,
}

impl RetryPolicy {
    pub fn from_config(config: &TranscodeConfig) -> Self {
        Self {
            max_attempts: config.max_job_attempts,
            backoff_base: config.backoff_base,
            backoff_cap: config.backoff_cap,
            permanent_error_policy: config.permanent_error_policy,
        }
    }

    /// `base * 2^attempts`, capped.
    pub fn backoff_for(&self, attempts: u32) -> Duration {
        exponential_delay(self.backoff_base, attempts, self.backoff_cap)
    }

    /// Decide the fate of a job whose current attempt failed.
    ///
    /// `extra` describes a failure outside the renditions (manifest upload).
    pub fn decide(&self, job: &Job, extra: Option<&str>) -> RetryDecision {
        let permanent = match job.settlement() {
            Some(Settlement::Failed { permanent, .. }) => permanent,
            _ => 0,
        };

        let fail_fast = self.permanent_error_policy == PermanentErrorPolicy::FailFast && permanent > 0;
        if !fail_fast && job.attempts < self.max_attempts {
            return RetryDecision::Requeue {
                delay: self.backoff_for(job.attempts),
            };
        }

        let mut errors = job.aggregated_errors();
        if let Some(extra) = extra {
            errors.push(extra.to_string());
        }
        let reason = if errors.is_empty() {
            "job failed".to_string()
        } else {
            errors.join("; ")
        };
        RetryDecision::Fail { reason }
    }
}

pub struct RetryManager {
    policy: RetryPolicy,
}

impl RetryManager {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Apply the retry decision to a failed attempt.
    ///
    /// Returns the stored job together with the decision taken.
    pub async fn settle_failure(
        &self,
        owned: &OwnedJob,
        extra: Option<String>,
    ) -> WorkerResult<(Job, RetryDecision)> {
        let decision = owned
            .mutate(|job| {
                let now = Utc::now();
                let decision = self.policy.decide(job, extra.as_deref());
                match &decision {
                    RetryDecision::Requeue { delay } => {
                        if let Some(extra) = &extra {
                            job.error_history.push(extra.clone());
                        }
                        let delay = chrono::Duration::from_std(*delay).unwrap_or(chrono::Duration::zero());
                        job.requeue(now + delay, now)?;
                    }
                    RetryDecision::Fail { reason } => job.fail(reason.clone(), now)?,
                }
                Ok(decision)
            })
            .await?;

        let job = owned.snapshot().await;
        match &decision {
            RetryDecision::Requeue { delay } => info!(
                job_id = %job.id,
                attempts = job.attempts,
                max_attempts = self.policy.max_attempts,
                delay_secs = delay.as_secs_f64(),
                "Job requeued"
            ),
            RetryDecision::Fail { reason } => warn!(
                job_id = %job.id,
                attempts = job.attempts,
                "Job failed: {}",
                reason
            ),
        }
        Ok((job, decision))
    }
}
