//! Builders shared by the unit tests. Jobs are created and advanced through
//! public operations only.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use vtrans_media::{
    collect_artifact, EncodeProgress, EncodeRequest, EncodedArtifact, Encoder, MediaError,
    MediaResult, ProgressCallback, VARIANT_PLAYLIST,
};
use vtrans_models::{JobId, RenditionProfile, VideoUploaded};
use vtrans_queue::{JobStore, MemoryEventBus, MemoryJobStore, MemoryLockProvider};
use vtrans_storage::MemoryBlobStore;

use crate::config::TranscodeConfig;
use crate::context::TranscodeContext;
use crate::intake::JobIntake;
use crate::ownership::OwnedJob;
use crate::scheduler::{ClaimOutcome, Scheduler};

/// Encoder writing a two-segment HLS variant, failing configured resolutions.
#[derive(Default)]
pub struct ScriptedEncoder {
    /// Resolution -> permanent failure
    failing: HashMap<String, bool>,
    calls: AtomicU32,
}

impl ScriptedEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_always(mut self, resolution: &str, permanent: bool) -> Self {
        self.failing.insert(resolution.to_string(), permanent);
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Encoder for ScriptedEncoder {
    async fn encode(&self, request: &EncodeRequest, progress: ProgressCallback) -> MediaResult<EncodedArtifact> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        match self.failing.get(request.profile.resolution()) {
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

        let dir = &request.output_dir;
        tokio::fs::write(dir.join("seg_000.ts"), b"segment-0").await?;
        tokio::fs::write(dir.join("seg_001.ts"), b"segment-1").await?;
        tokio::fs::write(
            dir.join(VARIANT_PLAYLIST),
            "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:6\n#EXTINF:6.000,\nseg_000.ts\n#EXTINF:4.000,\nseg_001.ts\n#EXT-X-ENDLIST\n",
        )
        .await?;

        progress(EncodeProgress {
            is_complete: true,
            ..Default::default()
        });
        collect_artifact(dir.clone()).await
    }
}

pub struct Harness {
    pub ctx: Arc<TranscodeContext>,
    pub store: Arc<MemoryJobStore>,
    pub locks: Arc<MemoryLockProvider>,
    pub blobs: Arc<MemoryBlobStore>,
    pub bus: Arc<MemoryEventBus>,
    pub encoder: Arc<ScriptedEncoder>,
    _work_dir: TempDir,
}

/// Two-rung ladder, two job slots, no backoff.
pub fn test_config(work_dir: &TempDir) -> TranscodeConfig {
    TranscodeConfig {
        ladder: vec![
            RenditionProfile::new("480p", 854, 480, 1400),
            RenditionProfile::new("1080p", 1920, 1080, 5000),
        ],
        owner_id: "worker-a".to_string(),
        work_dir: work_dir.path().to_string_lossy().to_string(),
        backoff_base: Duration::ZERO,
        backoff_cap: Duration::ZERO,
        poll_interval: Duration::from_millis(10),
        ..TranscodeConfig::default()
    }
}

pub fn harness(encoder: ScriptedEncoder) -> Harness {
    let work_dir = tempfile::tempdir().unwrap();
    let config = test_config(&work_dir);

    let store = Arc::new(MemoryJobStore::new());
    let locks = Arc::new(MemoryLockProvider::new());
    let blobs = Arc::new(MemoryBlobStore::new());
    let bus = Arc::new(MemoryEventBus::new());
    let encoder = Arc::new(encoder);
    let ctx = Arc::new(TranscodeContext::new(
        config,
        store.clone(),
        locks.clone(),
        blobs.clone(),
        encoder.clone(),
        bus.clone(),
    ));

    Harness {
        ctx,
        store,
        locks,
        blobs,
        bus,
        encoder,
        _work_dir: work_dir,
    }
}

pub async fn submit(h: &Harness, video_id: &str, tenant_id: &str) -> JobId {
    let input = format!("/media/uploads/{}.mp4", video_id);
    submit_with_input(h, video_id, tenant_id, &input).await
}

async fn submit_with_input(h: &Harness, video_id: &str, tenant_id: &str, input: &str) -> JobId {
    JobIntake::new(h.ctx.store.clone(), h.ctx.config.ladder.clone())
        .submit(&VideoUploaded::new(video_id, tenant_id, input))
        .await
        .unwrap()
}

/// Submit, claim as `worker-a` and start processing.
pub async fn claim_job(h: &Harness, video_id: &str, tenant_id: &str) -> Arc<OwnedJob> {
    let input = format!("/media/uploads/{}.mp4", video_id);
    claim_job_with_input(h, video_id, tenant_id, &input).await
}

pub async fn claim_job_with_input(h: &Harness, video_id: &str, tenant_id: &str, input: &str) -> Arc<OwnedJob> {
    let id = submit_with_input(h, video_id, tenant_id, input).await;
    let job = h.store.get_required(&id).await.unwrap();
    let owned = match Scheduler::new(h.ctx.clone()).try_claim(&job).await.unwrap() {
        ClaimOutcome::Claimed(owned) => owned,
        other => panic!("expected claim, got {:?}", other),
    };
    owned
        .mutate(|j| Ok(j.start_processing(chrono::Utc::now())?))
        .await
        .unwrap();
    owned
}
