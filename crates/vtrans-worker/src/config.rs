//! Orchestrator configuration.

use std::str::FromStr;
use std::time::Duration;

use uuid::Uuid;
use vtrans_models::paths::{RESOLUTION, TENANT_ID, VIDEO_ID};
use vtrans_models::{default_ladder, validate_template, RenditionProfile};

use crate::error::{WorkerError, WorkerResult};

/// How a permanent encode error affects the job-level retry decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PermanentErrorPolicy {
    /// Every rendition failure consumes the retry budget the same way
    #[default]
    Uniform,
    /// Fail the job at once when any rendition failed permanently
    FailFast,
}

impl FromStr for PermanentErrorPolicy {
    type Err = WorkerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "uniform" => Ok(Self::Uniform),
            "fail_fast" | "fail-fast" => Ok(Self::FailFast),
            other => Err(WorkerError::config_error(format!(
                "unknown permanent error policy '{}'",
                other
            ))),
        }
    }
}

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct TranscodeConfig {
    /// Jobs processed concurrently by this instance
    pub max_concurrent_jobs: usize,
    /// Renditions encoded concurrently within one job
    pub max_concurrent_renditions: usize,
    /// Rendition output prefix template (`{tenantId}`, `{videoId}`, `{resolution}`)
    pub output_path_format: String,
    /// Master manifest template (`{tenantId}`, `{videoId}`)
    pub manifest_format: String,
    /// Also write a DASH manifest next to the HLS master
    pub generate_dash_manifest: bool,
    /// Target HLS segment length
    pub hls_segment_duration: Duration,
    /// Minimum interval between progress log lines per rendition
    pub progress_update_interval_ms: u64,
    pub lease_ttl: Duration,
    /// Heartbeat interval, strictly below `lease_ttl`
    pub lease_renew_interval: Duration,
    /// Requeue cycles before a job fails
    pub max_job_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    /// Scheduler loop interval
    pub poll_interval: Duration,
    /// Lease owner token of this instance
    pub owner_id: String,
    /// Scratch directory for encoder output
    pub work_dir: String,
    pub ladder: Vec<RenditionProfile>,
    pub permanent_error_policy: PermanentErrorPolicy,
    /// How long presigned playback URLs stay valid
    pub playback_url_ttl: Duration,
    /// Graceful shutdown timeout
    pub shutdown_timeout: Duration,
}

impl Default for TranscodeConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 2,
            max_concurrent_renditions: 3,
            output_path_format: "videos/{tenantId}/{videoId}/{resolution}".to_string(),
            manifest_format: "videos/{tenantId}/{videoId}/master.m3u8".to_string(),
            generate_dash_manifest: false,
            hls_segment_duration: Duration::from_secs(6),
            progress_update_interval_ms: 5000,
            lease_ttl: Duration::from_secs(60),
            lease_renew_interval: Duration::from_secs(20),
            max_job_attempts: 3,
            backoff_base: Duration::from_secs(30),
            backoff_cap: Duration::from_secs(15 * 60),
            poll_interval: Duration::from_secs(2),
            owner_id: format!("worker-{}", Uuid::new_v4()),
            work_dir: "/tmp/vtrans".to_string(),
            ladder: default_ladder(),
            permanent_error_policy: PermanentErrorPolicy::Uniform,
            playback_url_ttl: Duration::from_secs(3600),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl TranscodeConfig {
    /// Create config from environment variables.
    pub fn from_env() -> WorkerResult<Self> {
        let defaults = Self::default();

        let ladder = match std::env::var("TRANSCODE_LADDER") {
            Ok(json) if !json.trim().is_empty() => serde_json::from_str(&json)
                .map_err(|e| WorkerError::config_error(format!("TRANSCODE_LADDER: {}", e)))?,
            _ => defaults.ladder,
        };
        let permanent_error_policy = match std::env::var("TRANSCODE_PERMANENT_ERROR_POLICY") {
            Ok(policy) => policy.parse()?,
            Err(_) => defaults.permanent_error_policy,
        };

        let config = Self {
            max_concurrent_jobs: env_or("TRANSCODE_MAX_CONCURRENT_JOBS", defaults.max_concurrent_jobs)?,
            max_concurrent_renditions: env_or(
                "TRANSCODE_MAX_CONCURRENT_RENDITIONS",
                defaults.max_concurrent_renditions,
            )?,
            output_path_format: std::env::var("TRANSCODE_OUTPUT_PATH_FORMAT")
                .unwrap_or(defaults.output_path_format),
            manifest_format: std::env::var("TRANSCODE_MANIFEST_FORMAT")
                .unwrap_or(defaults.manifest_format),
            generate_dash_manifest: env_or("TRANSCODE_GENERATE_DASH", defaults.generate_dash_manifest)?,
            hls_segment_duration: env_secs("TRANSCODE_HLS_SEGMENT_SECS", defaults.hls_segment_duration)?,
            progress_update_interval_ms: env_or(
                "TRANSCODE_PROGRESS_INTERVAL_MS",
                defaults.progress_update_interval_ms,
            )?,
            lease_ttl: env_secs("TRANSCODE_LEASE_TTL_SECS", defaults.lease_ttl)?,
            lease_renew_interval: env_secs("TRANSCODE_LEASE_RENEW_SECS", defaults.lease_renew_interval)?,
            max_job_attempts: env_or("TRANSCODE_MAX_JOB_ATTEMPTS", defaults.max_job_attempts)?,
            backoff_base: env_secs("TRANSCODE_BACKOFF_BASE_SECS", defaults.backoff_base)?,
            backoff_cap: env_secs("TRANSCODE_BACKOFF_CAP_SECS", defaults.backoff_cap)?,
            poll_interval: Duration::from_millis(env_or(
                "TRANSCODE_POLL_INTERVAL_MS",
                defaults.poll_interval.as_millis() as u64,
            )?),
            owner_id: std::env::var("TRANSCODE_OWNER_ID").unwrap_or(defaults.owner_id),
            work_dir: std::env::var("TRANSCODE_WORK_DIR").unwrap_or(defaults.work_dir),
            ladder,
            permanent_error_policy,
            playback_url_ttl: env_secs("TRANSCODE_PLAYBACK_URL_TTL_SECS", defaults.playback_url_ttl)?,
            shutdown_timeout: env_secs("TRANSCODE_SHUTDOWN_TIMEOUT_SECS", defaults.shutdown_timeout)?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the scheduler cannot run safely with.
    pub fn validate(&self) -> WorkerResult<()> {
        if self.max_concurrent_jobs == 0 {
            return Err(WorkerError::config_error("max_concurrent_jobs must be at least 1"));
        }
        if self.max_concurrent_renditions == 0 {
            return Err(WorkerError::config_error(
                "max_concurrent_renditions must be at least 1",
            ));
        }
        if self.ladder.is_empty() {
            return Err(WorkerError::config_error("rendition ladder is empty"));
        }
        let mut names: Vec<&str> = self.ladder.iter().map(|p| p.resolution()).collect();
        names.sort_unstable();
        names.dedup();
        if names.len() != self.ladder.len() {
            return Err(WorkerError::config_error("rendition ladder has duplicate names"));
        }
        if self.lease_renew_interval.is_zero() || self.lease_renew_interval >= self.lease_ttl {
            return Err(WorkerError::config_error(format!(
                "lease_renew_interval ({:?}) must be non-zero and below lease_ttl ({:?})",
                self.lease_renew_interval, self.lease_ttl
            )));
        }
        if self.backoff_cap < self.backoff_base {
            return Err(WorkerError::config_error("backoff_cap is below backoff_base"));
        }
        if self.hls_segment_duration.as_secs() == 0 {
            return Err(WorkerError::config_error("hls_segment_duration must be at least 1s"));
        }
        if self.owner_id.trim().is_empty() {
            return Err(WorkerError::config_error("owner_id is empty"));
        }
        validate_template(&self.output_path_format, &[TENANT_ID, VIDEO_ID, RESOLUTION])?;
        validate_template(&self.manifest_format, &[TENANT_ID, VIDEO_ID])?;
        Ok(())
    }
}

fn env_or<T>(name: &str, default: T) -> WorkerResult<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|e| WorkerError::config_error(format!("{}={:?}: {}", name, raw, e))),
        _ => Ok(default),
    }
}

fn env_secs(name: &str, default: Duration) -> WorkerResult<Duration> {
    env_or(name, default.as_secs()).map(Duration::from_secs)
}
