//! Outcome event publishing with an outbox.
//!
//! A terminal job carries `event_pending` until its outcome reached the event
//! bus. Publishing is retried in-process and, failing that, by the periodic
//! outbox sweep; it never touches the job's processing state.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use vtrans_models::{
    Job, JobId, JobStatus, OutcomeEvent, VideoProcessingFailed, VideoTranscoded,
};
use vtrans_queue::{EventBus, JobStore, QueueError};
use vtrans_storage::BlobStore;

use crate::context::TranscodeContext;
use crate::error::{WorkerError, WorkerResult};
use crate::metrics;
use crate::retry::{retry_if, RetryConfig, RetryResult};

/// Conflicting outbox writes tolerated before giving up until the next sweep.
const MAX_MARK_ATTEMPTS: u32 = 5;

pub struct EventPublisher {
    store: Arc<dyn JobStore>,
    bus: Arc<dyn EventBus>,
    blobs: Arc<dyn BlobStore>,
    retry: RetryConfig,
    playback_url_ttl: Duration,
}

impl EventPublisher {
    pub fn new(ctx: &TranscodeContext) -> Self {
        Self {
            store: ctx.store.clone(),
            bus: ctx.bus.clone(),
            blobs: ctx.blobs.clone(),
            retry: RetryConfig::new("publish_outcome"),
            playback_url_ttl: ctx.config.playback_url_ttl,
        }
    }

    /// Override the in-process retry settings.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Events announcing a terminal job. Empty for a non-terminal job.
    pub async fn outcome_events(&self, job: &Job) -> Vec<OutcomeEvent> {
        match job.status {
            JobStatus::Completed => {
                let mut event = VideoTranscoded::succeeded(job);
                if let Some(details) = event.output_details.as_mut() {
                    for detail in details.iter_mut() {
                        detail.playback_url = self.playback_url(&detail.output_location).await;
                    }
                }
                vec![OutcomeEvent::VideoTranscoded(event)]
            }
            JobStatus::Failed => vec![
                OutcomeEvent::VideoTranscoded(VideoTranscoded::failed(job)),
                OutcomeEvent::VideoProcessingFailed(VideoProcessingFailed::from_job(job)),
            ],
            _ => Vec::new(),
        }
    }

    async fn playback_url(&self, location: &str) -> Option<String> {
        match self.blobs.presigned_url(location, self.playback_url_ttl).await {
            Ok(url) => Some(url),
            Err(e) => {
                debug!(location, "No playback URL: {}", e);
                None
            }
        }
    }

    /// Publish the outcome of a terminal job and clear its outbox flag.
    ///
    /// Returns whether every event was delivered. A `false` leaves the job in
    /// the outbox for the next sweep.
    pub async fn publish_outcome(&self, job: &Job) -> bool {
        let events = self.outcome_events(job).await;
        if events.is_empty() {
            return false;
        }

        for event in &events {
            let result =
                retry_if(&self.retry, QueueError::is_retryable, || self.bus.publish(event)).await;
            match result {
                RetryResult::Success(()) => {
                    metrics::record_event_published(event.event_type());
                    info!(
                        job_id = %job.id,
                        event_type = event.event_type(),
                        "Published outcome event"
                    );
                }
                RetryResult::Failed { error, attempts } => {
                    metrics::record_event_publish_failure();
                    warn!(
                        job_id = %job.id,
                        event_type = event.event_type(),
                        attempts,
                        "Failed to publish outcome event, left in outbox: {}",
                        error
                    );
                    return false;
                }
            }
        }

        match self.mark_published(&job.id).await {
            Ok(()) => true,
            Err(e) => {
                warn!(job_id = %job.id, "Failed to clear outbox flag: {}", e);
                false
            }
        }
    }

    /// Re-publish terminal jobs still in the outbox. Returns the number
    /// delivered.
    pub async fn publish_pending(&self, limit: usize) -> WorkerResult<usize> {
        let pending = self.store.unpublished(limit).await?;
        let mut delivered = 0;
        for job in &pending {
            if self.publish_outcome(job).await {
                delivered += 1;
            }
        }
        if !pending.is_empty() {
            debug!(pending = pending.len(), delivered, "Outbox sweep");
        }
        Ok(delivered)
    }

    /// Clear `event_pending` on the latest record.
    ///
    /// Not owner-fenced: the lease is usually gone by the time a sweep runs,
    /// and the write never changes the job status.
    async fn mark_published(&self, id: &JobId) -> WorkerResult<()> {
        for _ in 0..MAX_MARK_ATTEMPTS {
            let Some(mut job) = self.store.get(id).await? else {
                return Ok(());
            };
            if !job.event_pending {
                return Ok(());
            }
            job.mark_event_published(Utc::now());
            match self.store.compare_and_swap(&job).await {
                Ok(_) => return Ok(()),
                Err(e) if e.is_conflict() => metrics::record_cas_conflict("outbox"),
                Err(e) => return Err(e.into()),
            }
        }
        Err(WorkerError::ConflictRetriesExhausted(id.to_string()))
    }
}
