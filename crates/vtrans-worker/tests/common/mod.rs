//! Test cluster: in-memory collaborators shared by any number of worker
//! instances, and a scriptable encoder.
//!
//! Jobs are only ever created and advanced through public operations.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;

use vtrans_media::{
    collect_artifact, EncodeProgress, EncodeRequest, EncodedArtifact, Encoder, MediaError,
    MediaResult, ProgressCallback, VARIANT_PLAYLIST,
};
use vtrans_models::{Job, JobId, RenditionProfile, VideoUploaded};
use vtrans_queue::{JobStore, MemoryEventBus, MemoryJobStore, MemoryLockProvider};
use vtrans_storage::MemoryBlobStore;
use vtrans_worker::{JobIntake, Scheduler, TranscodeConfig, TranscodeContext};

/// Encoder producing a two-segment HLS variant, with scripted failures.
#[derive(Default)]
pub struct FakeEncoder {
    /// Resolution -> fails permanently
    always_fail: HashMap<String, bool>,
    random_failures: Option<(Mutex<StdRng>, f64)>,
    delay: Duration,
    calls: Mutex<HashMap<String, u32>>,
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl FakeEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(mut self, resolution: &str, permanent: bool) -> Self {
        self.always_fail.insert(resolution.to_string(), permanent);
        self
    }

    /// Fail each encode with probability `p`, seeded.
    pub fn with_random_failures(mut self, seed: u64, p: f64) -> Self {
        self.random_failures = Some((Mutex::new(StdRng::seed_from_u64(seed)), p));
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls_for(&self, resolution: &str) -> u32 {
        self.calls
            .lock()
            .unwrap()
            .get(resolution)
            .copied()
            .unwrap_or(0)
    }

    /// Most encodes ever running at the same time.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn roll_failure(&self) -> bool {
        match &self.random_failures {
            Some((rng, p)) => rng.lock().unwrap().random_bool(*p),
            None => false,
        }
    }
}

#[async_trait]
impl Encoder for FakeEncoder {
    async fn encode(&self, request: &EncodeRequest, progress: ProgressCallback) -> MediaResult<EncodedArtifact> {
        let resolution = request.profile.resolution().to_string();
        *self.calls.lock().unwrap().entry(resolution.clone()).or_default() += 1;

        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.running.fetch_sub(1, Ordering::SeqCst);

        match self.always_fail.get(&resolution) {
            Some(true) => {
                return Err(MediaError::ffmpeg_failed(
                    "ffmpeg exited with status 1",
                    Some("Invalid data found when processing input".to_string()),
                    Some(1),
                ))
            }
            Some(false) => return Err(MediaError::ResourceLimit("out of memory".to_string())),
            None => {}
        }
        if self.roll_failure() {
            return Err(MediaError::Timeout(30));
        }

        let dir = &request.output_dir;
        tokio::fs::write(dir.join("seg_000.ts"), b"segment-0").await?;
        tokio::fs::write(dir.join("seg_001.ts"), b"segment-1").await?;
        tokio::fs::write(
            dir.join(VARIANT_PLAYLIST),
            "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:6\n#EXTINF:6.000,\nseg_000.ts\n#EXTINF:4.000,\nseg_001.ts\n#EXT-X-ENDLIST\n",
        )
        .await?;

        progress(EncodeProgress {
            frame: 250,
            out_time_ms: 10_000,
            total_ms: Some(10_000),
            is_complete: true,
            ..Default::default()
        });
        collect_artifact(dir.clone()).await
    }
}

/// Collaborators shared by every worker instance of a test.
pub struct Cluster {
    pub store: Arc<MemoryJobStore>,
    pub locks: Arc<MemoryLockProvider>,
    pub blobs: Arc<MemoryBlobStore>,
    pub bus: Arc<MemoryEventBus>,
    pub encoder: Arc<FakeEncoder>,
    work_dir: TempDir,
}

/// 480p + 1080p ladder.
pub fn two_rung_ladder() -> Vec<RenditionProfile> {
    vec![
        RenditionProfile::new("480p", 854, 480, 1400),
        RenditionProfile::new("1080p", 1920, 1080, 5000),
    ]
}

impl Cluster {
    pub fn new(encoder: FakeEncoder) -> Self {
        Self {
            store: Arc::new(MemoryJobStore::new()),
            locks: Arc::new(MemoryLockProvider::new()),
            blobs: Arc::new(MemoryBlobStore::new()),
            bus: Arc::new(MemoryEventBus::new()),
            encoder: Arc::new(encoder),
            work_dir: tempfile::tempdir().unwrap(),
        }
    }

    /// Configuration of one instance: two-rung ladder, no backoff.
    pub fn config(&self, owner: &str) -> TranscodeConfig {
        TranscodeConfig {
            ladder: two_rung_ladder(),
            owner_id: owner.to_string(),
            work_dir: self.work_dir.path().join(owner).to_string_lossy().to_string(),
            backoff_base: Duration::ZERO,
            backoff_cap: Duration::ZERO,
            poll_interval: Duration::from_millis(10),
            ..TranscodeConfig::default()
        }
    }

    pub fn context(&self, config: TranscodeConfig) -> Arc<TranscodeContext> {
        config.validate().unwrap();
        Arc::new(TranscodeContext::new(
            config,
            self.store.clone(),
            self.locks.clone(),
            self.blobs.clone(),
            self.encoder.clone(),
            self.bus.clone(),
        ))
    }

    pub fn instance(&self, owner: &str) -> Arc<Scheduler> {
        self.instance_with(self.config(owner))
    }

    pub fn instance_with(&self, config: TranscodeConfig) -> Arc<Scheduler> {
        Arc::new(Scheduler::new(self.context(config)))
    }

    pub async fn submit(&self, video_id: &str, tenant_id: &str) -> JobId {
        self.submit_with_ladder(video_id, tenant_id, two_rung_ladder()).await
    }

    pub async fn submit_with_ladder(
        &self,
        video_id: &str,
        tenant_id: &str,
        ladder: Vec<RenditionProfile>,
    ) -> JobId {
        JobIntake::new(self.store.clone(), ladder)
            .submit(&VideoUploaded::new(
                video_id,
                tenant_id,
                format!("/media/uploads/{}/{}.mp4", tenant_id, video_id),
            ))
            .await
            .unwrap()
    }

    pub async fn job(&self, id: &JobId) -> Job {
        self.store.get_required(id).await.unwrap()
    }

    /// Schedule and drain on `scheduler` until the job is terminal.
    pub async fn run_to_settlement(&self, scheduler: &Arc<Scheduler>, id: &JobId) -> Job {
        for _ in 0..200 {
            scheduler.schedule_once().await.unwrap();
            assert!(scheduler.drain(Duration::from_secs(10)).await);
            let job = self.job(id).await;
            if job.is_terminal() {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("job {} did not settle", id);
    }
}
