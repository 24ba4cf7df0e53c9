//! Job intake: upload notifications become jobs with planned renditions.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use vtrans_models::{Job, JobId, RenditionProfile, VideoUploaded};
use vtrans_queue::{CreateOutcome, JobStore, UploadStream};

use crate::error::{WorkerError, WorkerResult};
use crate::metrics;
use crate::retry::FailureTracker;

/// Turns upload notifications into pending jobs.
pub struct JobIntake {
    store: Arc<dyn JobStore>,
    ladder: Vec<RenditionProfile>,
}

impl JobIntake {
    pub fn new(store: Arc<dyn JobStore>, ladder: Vec<RenditionProfile>) -> Self {
        Self { store, ladder }
    }

    /// Create the job for an upload, or return the id of the job that already
    /// covers it.
    ///
    /// Idempotent under redelivery: a pending, running or completed job for
    /// the same (tenant, video) is reused. Only a failed job allows a fresh one.
    pub async fn submit(&self, upload: &VideoUploaded) -> WorkerResult<JobId> {
        upload
            .validate()
            .map_err(|e| WorkerError::InvalidUpload(e.to_string()))?;

        let job = Job::new(
            upload.video_id.as_str(),
            upload.tenant_id.as_str(),
            upload.input_location.as_str(),
            &self.ladder,
        );

        let outcome = self.store.create_or_get(&job).await?;
        metrics::record_submission(matches!(outcome, CreateOutcome::Created(_)));

        match &outcome {
            CreateOutcome::Created(id) => info!(
                job_id = %id,
                video_id = %upload.video_id,
                tenant_id = %upload.tenant_id,
                renditions = self.ladder.len(),
                "Created transcoding job"
            ),
            CreateOutcome::Existing(id) => debug!(
                job_id = %id,
                video_id = %upload.video_id,
                "Upload already has a job"
            ),
        }

        Ok(outcome.job_id().clone())
    }
}

/// Consume upload notifications until shutdown.
///
/// Notifications left unacknowledged by a previous run of this consumer are
/// handled first. A notification is acknowledged once its job exists; invalid
/// notifications are acknowledged and dropped.
pub async fn run_upload_consumer(
    stream: Arc<UploadStream>,
    intake: Arc<JobIntake>,
    consumer_name: String,
    mut shutdown: watch::Receiver<bool>,
) {
    if let Err(e) = stream.init().await {
        error!("Failed to initialize upload stream: {}", e);
        return;
    }

    match stream.consume_unacked(&consumer_name, 100).await {
        Ok(backlog) if !backlog.is_empty() => {
            info!("Replaying {} unacknowledged upload notifications", backlog.len());
            for (message_id, upload) in backlog {
                handle_upload(&stream, &intake, &message_id, &upload).await;
            }
        }
        Ok(_) => {}
        Err(e) => warn!("Failed to read unacknowledged uploads: {}", e),
    }

    let mut failures = FailureTracker::new(5);
    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            _ = shutdown.changed() => {}
            result = stream.consume(&consumer_name, 1000, 10) => match result {
                Ok(uploads) => {
                    failures.record_success();
                    for (message_id, upload) in uploads {
                        handle_upload(&stream, &intake, &message_id, &upload).await;
                    }
                }
                Err(e) => {
                    if failures.record_failure() {
                        warn!("Failed to consume upload notifications: {}", e);
                    }
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    }

    info!("Upload consumer stopped");
}

async fn handle_upload(stream: &UploadStream, intake: &JobIntake, message_id: &str, upload: &VideoUploaded) {
    match intake.submit(upload).await {
        Ok(_) => {}
        Err(WorkerError::InvalidUpload(reason)) => {
            warn!(message_id, video_id = %upload.video_id, "Dropping invalid upload: {}", reason);
        }
        Err(e) => {
            // Left unacknowledged; replayed on the next start
            error!(message_id, video_id = %upload.video_id, "Failed to submit upload: {}", e);
            return;
        }
    }
    if let Err(e) = stream.ack(message_id).await {
        warn!(message_id, "Failed to ack upload notification: {}", e);
    }
}
