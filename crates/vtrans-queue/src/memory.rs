//! In-process implementations of the coordination collaborators.
//!
//! Used by tests and single-node deployments. They honour the same contracts
//! as the Redis implementations: versioned writes, terminal finality,
//! owner-token leases with expiry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use vtrans_models::{Job, JobId, JobStatus, OutcomeEvent};

use crate::error::{QueueError, QueueResult};
use crate::events::EventBus;
use crate::lock::LockProvider;
use crate::store::{violates_finality, CreateOutcome, JobStore};

#[derive(Default)]
struct StoreState {
    jobs: HashMap<JobId, Job>,
    by_video: HashMap<(String, String), JobId>,
}

/// In-memory job store.
#[derive(Default)]
pub struct MemoryJobStore {
    state: Mutex<StoreState>,
    cas_conflicts: AtomicU32,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every stored job, oldest first.
    pub async fn all(&self) -> Vec<Job> {
        let state = self.state.lock().await;
        let mut jobs: Vec<Job> = state.jobs.values().cloned().collect();
        jobs.sort_by_key(|j| j.created_at);
        jobs
    }

    /// Number of compare-and-swap writes rejected for a stale version.
    pub fn conflict_count(&self) -> u32 {
        self.cas_conflicts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create_or_get(&self, job: &Job) -> QueueResult<CreateOutcome> {
        let mut state = self.state.lock().await;
        let index = (job.tenant_id.clone(), job.video_id.clone());

        if let Some(existing) = state.by_video.get(&index) {
            let live = state
                .jobs
                .get(existing)
                .is_some_and(|j| j.status != JobStatus::Failed);
            if live {
                return Ok(CreateOutcome::Existing(existing.clone()));
            }
        }

        state.jobs.insert(job.id.clone(), job.clone());
        state.by_video.insert(index, job.id.clone());
        Ok(CreateOutcome::Created(job.id.clone()))
    }

    async fn get(&self, id: &JobId) -> QueueResult<Option<Job>> {
        Ok(self.state.lock().await.jobs.get(id).cloned())
    }

    async fn compare_and_swap(&self, job: &Job) -> QueueResult<Job> {
        let mut state = self.state.lock().await;
        let stored = state
            .jobs
            .get_mut(&job.id)
            .ok_or_else(|| QueueError::JobNotFound(job.id.to_string()))?;

        if stored.version != job.version {
            self.cas_conflicts.fetch_add(1, Ordering::SeqCst);
            debug!(
                job_id = %job.id,
                expected = job.version,
                actual = stored.version,
                "Rejected stale write"
            );
            return Err(QueueError::conflict(&job.id));
        }
        if violates_finality(stored.status, job.status) {
            return Err(QueueError::TerminalState(job.id.to_string()));
        }

        let mut next = job.clone();
        next.version = job.version + 1;
        *stored = next.clone();
        Ok(next)
    }

    async fn candidates(&self, offset: usize, limit: usize) -> QueueResult<Vec<Job>> {
        let mut jobs: Vec<Job> = self
            .state
            .lock()
            .await
            .jobs
            .values()
            .filter(|j| !j.is_terminal())
            .cloned()
            .collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(jobs.into_iter().skip(offset).take(limit).collect())
    }

    async fn unpublished(&self, limit: usize) -> QueueResult<Vec<Job>> {
        let mut jobs: Vec<Job> = self
            .state
            .lock()
            .await
            .jobs
            .values()
            .filter(|j| j.is_terminal() && j.event_pending)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.completed_at);
        jobs.truncate(limit);
        Ok(jobs)
    }
}

#[derive(Debug, Clone)]
struct Lease {
    owner: String,
    expires_at: Instant,
}

/// In-memory lease provider. Expiry uses the tokio clock.
#[derive(Default)]
pub struct MemoryLockProvider {
    leases: Mutex<HashMap<JobId, Lease>>,
}

impl MemoryLockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current unexpired holder of a job's lease.
    pub async fn holder(&self, job_id: &JobId) -> Option<String> {
        self.leases
            .lock()
            .await
            .get(job_id)
            .filter(|l| l.expires_at > Instant::now())
            .map(|l| l.owner.clone())
    }
}

#[async_trait]
impl LockProvider for MemoryLockProvider {
    async fn acquire(&self, job_id: &JobId, owner: &str, ttl: Duration) -> QueueResult<bool> {
        let mut leases = self.leases.lock().await;
        let now = Instant::now();
        if leases.get(job_id).is_some_and(|l| l.expires_at > now) {
            return Ok(false);
        }
        leases.insert(
            job_id.clone(),
            Lease {
                owner: owner.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn renew(&self, job_id: &JobId, owner: &str, ttl: Duration) -> QueueResult<bool> {
        let mut leases = self.leases.lock().await;
        let now = Instant::now();
        match leases.get_mut(job_id) {
            Some(lease) if lease.owner == owner && lease.expires_at > now => {
                lease.expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, job_id: &JobId, owner: &str) -> QueueResult<bool> {
        let mut leases = self.leases.lock().await;
        let held = leases
            .get(job_id)
            .is_some_and(|l| l.owner == owner && l.expires_at > Instant::now());
        if held {
            leases.remove(job_id);
        }
        Ok(held)
    }
}

/// In-memory event bus with failure injection.
#[derive(Default)]
pub struct MemoryEventBus {
    events: Mutex<Vec<OutcomeEvent>>,
    failures_remaining: AtomicU32,
}

impl MemoryEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` publishes fail.
    pub fn fail_next(&self, count: u32) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    pub async fn events(&self) -> Vec<OutcomeEvent> {
        self.events.lock().await.clone()
    }

    pub async fn events_for(&self, job_id: &JobId) -> Vec<OutcomeEvent> {
        self.events
            .lock()
            .await
            .iter()
            .filter(|e| e.job_id() == job_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl EventBus for MemoryEventBus {
    async fn publish(&self, event: &OutcomeEvent) -> QueueResult<()> {
        let injected = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(QueueError::publish_failed("injected failure"));
        }
        self.events.lock().await.push(event.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use vtrans_models::{RenditionProfile, VideoProcessingFailed};

    fn job(video_id: &str) -> Job {
        Job::new(
            video_id,
            "t1",
            "in.mp4",
            &[RenditionProfile::new("480p", 854, 480, 1400)],
        )
    }

    #[tokio::test]
    async fn test_create_is_idempotent_per_video() {
        let store = MemoryJobStore::new();
        let first = job("v1");
        let second = job("v1");

        assert_eq!(
            store.create_or_get(&first).await.unwrap(),
            CreateOutcome::Created(first.id.clone())
        );
        assert_eq!(
            store.create_or_get(&second).await.unwrap(),
            CreateOutcome::Existing(first.id.clone())
        );
        assert_eq!(store.all().await.len(), 1);
    }

    #[tokio::test]
    async fn test_cas_rejects_stale_version() {
        let store = MemoryJobStore::new();
        let original = job("v1");
        store.create_or_get(&original).await.unwrap();

        let mut a = original.clone();
        a.claim("worker-a", Utc::now()).unwrap();
        let stored = store.compare_and_swap(&a).await.unwrap();
        assert_eq!(stored.version, 1);

        let mut b = original.clone();
        b.claim("worker-b", Utc::now()).unwrap();
        let err = store.compare_and_swap(&b).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(store.conflict_count(), 1);

        let current = store.get_required(&original.id).await.unwrap();
        assert_eq!(current.owner.as_deref(), Some("worker-a"));
    }

    #[tokio::test]
    async fn test_failed_job_allows_resubmission() {
        let store = MemoryJobStore::new();
        let mut first = job("v1");
        store.create_or_get(&first).await.unwrap();

        first.claim("w", Utc::now()).unwrap();
        first = store.compare_and_swap(&first).await.unwrap();
        first.start_processing(Utc::now()).unwrap();
        first = store.compare_and_swap(&first).await.unwrap();
        first.fail("boom", Utc::now()).unwrap();
        let failed = store.compare_and_swap(&first).await.unwrap();

        let retry = job("v1");
        assert_eq!(
            store.create_or_get(&retry).await.unwrap(),
            CreateOutcome::Created(retry.id.clone())
        );
        assert_eq!(store.unpublished(10).await.unwrap().len(), 1);

        // Terminal finality is enforced by the store as well
        let mut reopened = failed.clone();
        reopened.status = JobStatus::Pending;
        assert!(matches!(
            store.compare_and_swap(&reopened).await,
            Err(QueueError::TerminalState(_))
        ));
    }

    #[tokio::test]
    async fn test_candidates_are_fifo() {
        let store = MemoryJobStore::new();
        let first = job("v1");
        let mut second = job("v2");
        second.created_at = first.created_at + chrono::Duration::milliseconds(5);
        store.create_or_get(&second).await.unwrap();
        store.create_or_get(&first).await.unwrap();

        let ids: Vec<JobId> = store
            .candidates(0, 10)
            .await
            .unwrap()
            .into_iter()
            .map(|j| j.id)
            .collect();
        assert_eq!(ids, vec![first.id.clone(), second.id.clone()]);

        let next_page = store.candidates(1, 10).await.unwrap();
        assert_eq!(next_page.len(), 1);
        assert_eq!(next_page[0].id, second.id);
        assert!(store.candidates(2, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_lease_owner_semantics_and_expiry() {
        let locks = MemoryLockProvider::new();
        let id = JobId::new();
        let ttl = Duration::from_millis(40);

        assert!(locks.acquire(&id, "a", ttl).await.unwrap());
        assert!(!locks.acquire(&id, "b", ttl).await.unwrap());
        assert!(!locks.renew(&id, "b", ttl).await.unwrap());
        assert!(!locks.release(&id, "b").await.unwrap());
        assert!(locks.renew(&id, "a", ttl).await.unwrap());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!locks.renew(&id, "a", ttl).await.unwrap());
        assert!(locks.acquire(&id, "b", ttl).await.unwrap());
        assert_eq!(locks.holder(&id).await.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_event_bus_failure_injection() {
        let bus = MemoryEventBus::new();
        let event = OutcomeEvent::VideoProcessingFailed(VideoProcessingFailed::from_job(&job("v1")));

        bus.fail_next(1);
        assert!(bus.publish(&event).await.is_err());
        assert!(bus.publish(&event).await.is_ok());
        assert_eq!(bus.events().await.len(), 1);
    }
}
