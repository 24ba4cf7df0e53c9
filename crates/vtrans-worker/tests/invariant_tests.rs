//! Seeded random interleavings of several worker instances over shared
//! collaborators, checking job invariants after every step.

mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use common::{Cluster, FakeEncoder};
use vtrans_models::{JobId, JobStatus, OutcomeEvent};
use vtrans_storage::BlobStore;
use vtrans_worker::{Scheduler, TranscodeConfig};

const SEEDS: u64 = 8;
const STEPS: usize = 60;
const JOBS: usize = 4;
const MAX_ATTEMPTS: u32 = 2;

/// Statuses of jobs once observed terminal.
#[derive(Default)]
struct Observer {
    terminal: HashMap<JobId, JobStatus>,
}

impl Observer {
    async fn check(&mut self, cluster: &Cluster, seed: u64, step: &str) {
        for job in cluster.store.all().await {
            if let Err(violation) = job.check_invariants() {
                panic!("seed {} after {}: {}", seed, step, violation);
            }
            assert!(
                job.attempts <= MAX_ATTEMPTS,
                "seed {} after {}: job {} has {} attempts",
                seed,
                step,
                job.id,
                job.attempts
            );
            if let Some(settled) = self.terminal.get(&job.id) {
                assert_eq!(
                    *settled, job.status,
                    "seed {} after {}: terminal job {} changed status",
                    seed, step, job.id
                );
            } else if job.is_terminal() {
                self.terminal.insert(job.id.clone(), job.status);
            }
        }
    }
}

async fn run_seed(seed: u64) {
    let cluster = Cluster::new(FakeEncoder::new().with_random_failures(seed, 0.3));
    let config = |owner: &str| TranscodeConfig {
        max_job_attempts: MAX_ATTEMPTS,
        max_concurrent_jobs: 2,
        ..cluster.config(owner)
    };
    let instances: Vec<Arc<Scheduler>> = ["worker-a", "worker-b", "worker-c"]
        .iter()
        .map(|owner| cluster.instance_with(config(owner)))
        .collect();

    let mut ids = Vec::new();
    for n in 0..JOBS {
        ids.push(cluster.submit(&format!("v{}", n), "t1").await);
    }

    let mut rng = StdRng::seed_from_u64(seed.wrapping_add(1_000));
    let mut observer = Observer::default();

    for _ in 0..STEPS {
        let step = match rng.random_range(0..4) {
            0 | 1 => {
                let instance = &instances[rng.random_range(0..instances.len())];
                instance.schedule_once().await.unwrap();
                "schedule"
            }
            2 => {
                let instance = &instances[rng.random_range(0..instances.len())];
                instance.publisher().publish_pending(16).await.unwrap();
                "publish sweep"
            }
            _ => {
                tokio::time::sleep(Duration::from_millis(rng.random_range(0..3))).await;
                "sleep"
            }
        };
        observer.check(&cluster, seed, step).await;
    }

    // Settle everything that is still open
    for _ in 0..200 {
        for instance in &instances {
            instance.schedule_once().await.unwrap();
        }
        for instance in &instances {
            assert!(instance.drain(Duration::from_secs(10)).await);
        }
        instances[0].publisher().publish_pending(16).await.unwrap();
        observer.check(&cluster, seed, "settlement round").await;

        let jobs = cluster.store.all().await;
        if jobs.iter().all(|j| j.is_terminal() && !j.event_pending) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    for id in &ids {
        let job = cluster.job(id).await;
        assert!(job.is_terminal(), "seed {}: job {} stuck in {}", seed, id, job.status);
        assert!(!job.event_pending, "seed {}: job {} never published", seed, id);

        let events = cluster.bus.events_for(id).await;
        let success = events.iter().find_map(|e| match e {
            OutcomeEvent::VideoTranscoded(t) => Some(t.success),
            _ => None,
        });
        assert_eq!(success, Some(job.status == JobStatus::Completed), "seed {}: job {}", seed, id);

        if job.status == JobStatus::Completed {
            for rendition in &job.renditions {
                let location = rendition.output_location.as_deref().unwrap();
                assert!(cluster.blobs.exists(location).await.unwrap());
            }
            let manifest = job.output_manifest_path.as_deref().unwrap();
            assert!(cluster.blobs.exists(manifest).await.unwrap());
        } else {
            assert!(events
                .iter()
                .any(|e| matches!(e, OutcomeEvent::VideoProcessingFailed(_))));
        }
    }
}

#[tokio::test]
async fn test_random_interleavings_preserve_invariants() {
    for seed in 0..SEEDS {
        run_seed(seed).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_instances_settle_every_job() {
    run_seed(42).await;
}
