//! Rendition executor.
//!
//! Runs one rendition of a claimed job: encode, upload to the deterministic
//! output prefix, record the outcome. Failures are classified and recorded on
//! the rendition; retrying is a job-level decision.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tracing::{debug, info, warn};

use vtrans_media::{is_remote, EncodeProgress, EncodeRequest, EncodedArtifact, ProgressCallback};
use vtrans_models::{render_output_path, FailureKind, Rendition, RenditionError, RenditionId};
use vtrans_storage::content_type_for;

use crate::context::TranscodeContext;
use crate::error::WorkerResult;
use crate::metrics;
use crate::ownership::OwnedJob;

/// How long a presigned source URL handed to the encoder stays valid.
const SOURCE_URL_TTL: std::time::Duration = std::time::Duration::from_secs(3600);

/// Result of running one rendition.
#[derive(Debug, Clone, PartialEq)]
pub enum RenditionOutcome {
    Completed { output_location: String },
    Failed(RenditionError),
}

impl RenditionOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, RenditionOutcome::Completed { .. })
    }
}

/// What the encode-and-upload step needs from the job record.
struct RenditionWork {
    rendition: Rendition,
    tenant_id: String,
    video_id: String,
    input_location: String,
}

pub struct RenditionExecutor {
    ctx: Arc<TranscodeContext>,
}

impl RenditionExecutor {
    pub fn new(ctx: Arc<TranscodeContext>) -> Self {
        Self { ctx }
    }

    /// Run a pending rendition to a terminal state.
    ///
    /// Returns `Err` only when the job could not be written, most notably
    /// [`crate::WorkerError::LeaseLost`]; encode and upload failures come back
    /// as [`RenditionOutcome::Failed`] after being recorded.
    pub async fn run(&self, job: &OwnedJob, rendition_id: &RenditionId) -> WorkerResult<RenditionOutcome> {
        let work = job
            .mutate(|j| {
                let rendition = j.rendition_mut(rendition_id)?;
                rendition.start(Utc::now())?;
                let rendition = rendition.clone();
                Ok(RenditionWork {
                    rendition,
                    tenant_id: j.tenant_id.clone(),
                    video_id: j.video_id.clone(),
                    input_location: j.input_location.clone(),
                })
            })
            .await?;

        let resolution = work.rendition.resolution().to_string();
        let prefix = render_output_path(
            &self.ctx.config.output_path_format,
            &work.tenant_id,
            &work.video_id,
            &resolution,
        );
        info!(
            job_id = %job.id(),
            rendition = %resolution,
            attempt = work.rendition.attempt,
            output = %prefix,
            "Rendition started"
        );

        let outcome = match self.produce(job, &work, &prefix).await {
            Ok((output_location, duration_secs)) => {
                job.mutate(|j| {
                    Ok(j.rendition_mut(rendition_id)?.complete(
                        output_location.clone(),
                        duration_secs,
                        Utc::now(),
                    )?)
                })
                .await?;
                metrics::record_rendition("completed", "none", &resolution);
                info!(
                    job_id = %job.id(),
                    rendition = %resolution,
                    output = %output_location,
                    "Rendition completed"
                );
                RenditionOutcome::Completed { output_location }
            }
            Err(error) => {
                job.mutate(|j| Ok(j.rendition_mut(rendition_id)?.fail(error.clone(), Utc::now())?))
                    .await?;
                metrics::record_rendition("failed", error.kind.as_str(), &resolution);
                warn!(
                    job_id = %job.id(),
                    rendition = %resolution,
                    kind = error.kind.as_str(),
                    "Rendition failed: {}",
                    error.message
                );
                RenditionOutcome::Failed(error)
            }
        };

        Ok(outcome)
    }

    /// Encode and upload. Returns the variant playlist location and duration.
    async fn produce(
        &self,
        job: &OwnedJob,
        work: &RenditionWork,
        prefix: &str,
    ) -> Result<(String, Option<f64>), RenditionError> {
        let config = &self.ctx.config;
        let resolution = work.rendition.resolution();

        let input = self.resolve_input(&work.input_location).await?;

        tokio::fs::create_dir_all(&config.work_dir).await.map_err(|e| {
            RenditionError::new(FailureKind::TransientEncode, format!("work dir: {}", e))
        })?;
        let scratch = tempfile::Builder::new()
            .prefix(&format!("{}-{}-", job.id(), resolution))
            .tempdir_in(&config.work_dir)
            .map_err(|e| RenditionError::new(FailureKind::TransientEncode, format!("work dir: {}", e)))?;

        let request = EncodeRequest {
            input_location: input,
            profile: work.rendition.profile.clone(),
            segment_duration_secs: config.hls_segment_duration.as_secs().max(1) as u32,
            output_dir: scratch.path().to_path_buf(),
        };

        let started = Instant::now();
        let artifact = self
            .ctx
            .encoder
            .encode(&request, self.progress_logger(job, resolution))
            .await
            .map_err(|e| {
                let kind = if e.is_transient() {
                    FailureKind::TransientEncode
                } else {
                    FailureKind::PermanentEncode
                };
                RenditionError::new(kind, e.detail())
            })?;
        metrics::record_encode_latency(resolution, started.elapsed().as_secs_f64());

        let output_location = self.upload(&artifact, prefix).await?;
        Ok((output_location, artifact.duration_secs))
    }

    /// Location the encoder can read the source from.
    ///
    /// Remote URLs and absolute local paths are used as they are; anything
    /// else is a blob store key and gets a presigned URL.
    async fn resolve_input(&self, input: &str) -> Result<String, RenditionError> {
        if is_remote(input) || Path::new(input).is_absolute() {
            return Ok(input.to_string());
        }
        self.ctx
            .blobs
            .presigned_url(input, SOURCE_URL_TTL)
            .await
            .map_err(|e| RenditionError::new(FailureKind::Storage, format!("source {}: {}", input, e)))
    }

    /// Upload segments first and the variant playlist last, so a readable
    /// playlist never references a missing segment.
    async fn upload(&self, artifact: &EncodedArtifact, prefix: &str) -> Result<String, RenditionError> {
        let segments = artifact.files.iter().filter(|f| **f != artifact.playlist);
        for file in segments.chain(std::iter::once(&artifact.playlist)) {
            let key = format!("{}/{}", prefix, file);
            self.ctx
                .blobs
                .put_file(&artifact.dir.join(file), &key, content_type_for(file))
                .await
                .map_err(|e| RenditionError::new(FailureKind::Storage, format!("upload {}: {}", key, e)))?;
        }
        debug!(prefix, files = artifact.files.len(), "Uploaded rendition output");
        Ok(format!("{}/{}", prefix, artifact.playlist))
    }

    /// Progress sink that logs at most once per configured interval.
    fn progress_logger(&self, job: &OwnedJob, resolution: &str) -> ProgressCallback {
        let interval_ms = self.ctx.config.progress_update_interval_ms;
        let job_id = job.id().to_string();
        let resolution = resolution.to_string();
        let started = Instant::now();
        let last_logged_ms = AtomicU64::new(0);

        Arc::new(move |progress: EncodeProgress| {
            let elapsed_ms = started.elapsed().as_millis() as u64;
            let last = last_logged_ms.load(Ordering::Relaxed);
            if !progress.is_complete && elapsed_ms.saturating_sub(last) < interval_ms {
                return;
            }
            last_logged_ms.store(elapsed_ms, Ordering::Relaxed);
            info!(
                job_id = %job_id,
                rendition = %resolution,
                frame = progress.frame,
                speed = progress.speed,
                percent = progress.percentage().unwrap_or(0.0),
                eta_secs = progress.eta_seconds().unwrap_or(0.0),
                "Encode progress"
            );
        })
    }
}
