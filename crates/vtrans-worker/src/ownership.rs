//! Owner-fenced job mutations.
//!
//! Every write a worker makes to a job it processes goes through
//! [`OwnedJob::mutate`]: the change is applied to the latest known record and
//! stored with compare-and-swap. On a version conflict the record is re-read;
//! if its owner is no longer this worker the lease has passed on and the
//! write is abandoned with [`WorkerError::LeaseLost`].

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use vtrans_models::{Job, JobId};
use vtrans_queue::{JobStore, QueueError};

use crate::error::{WorkerError, WorkerResult};
use crate::metrics;

/// Conflicting writes tolerated for one mutation.
const MAX_CAS_ATTEMPTS: u32 = 8;

/// A claimed job and the owner token that claimed it.
///
/// Local writers (rendition tasks of the same job) are serialised through an
/// in-process lock, so version conflicts only come from other instances.
pub struct OwnedJob {
    store: Arc<dyn JobStore>,
    owner: String,
    id: JobId,
    current: Mutex<Job>,
}

impl OwnedJob {
    /// Wrap a record this worker just claimed.
    pub fn new(store: Arc<dyn JobStore>, owner: impl Into<String>, job: Job) -> Self {
        Self {
            store,
            owner: owner.into(),
            id: job.id.clone(),
            current: Mutex::new(job),
        }
    }

    pub fn id(&self) -> &JobId {
        &self.id
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Latest record known to this worker.
    pub async fn snapshot(&self) -> Job {
        self.current.lock().await.clone()
    }

    /// Apply `change` and store the result.
    ///
    /// `change` may run more than once when a concurrent writer forces a
    /// re-read; it must only derive the new state from the job it is given.
    pub async fn mutate<T, F>(&self, mut change: F) -> WorkerResult<T>
    where
        F: FnMut(&mut Job) -> WorkerResult<T>,
    {
        let mut current = self.current.lock().await;

        for _ in 0..MAX_CAS_ATTEMPTS {
            if current.owner.as_deref() != Some(self.owner.as_str()) {
                return Err(WorkerError::lease_lost(&self.id));
            }

            let mut next = current.clone();
            let output = change(&mut next)?;

            match self.store.compare_and_swap(&next).await {
                Ok(stored) => {
                    *current = stored;
                    return Ok(output);
                }
                Err(e) if e.is_conflict() => {
                    metrics::record_cas_conflict("owned_job");
                    debug!(job_id = %self.id, owner = %self.owner, "Write conflict, re-reading job");
                    *current = self.store.get_required(&self.id).await?;
                }
                Err(QueueError::TerminalState(_)) => {
                    // Another owner already settled the job
                    return Err(WorkerError::lease_lost(&self.id));
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(WorkerError::ConflictRetriesExhausted(self.id.to_string()))
    }
}

impl std::fmt::Debug for OwnedJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OwnedJob")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use vtrans_models::{JobStatus, RenditionProfile};
    use vtrans_queue::MemoryJobStore;

    async fn claimed(store: &Arc<MemoryJobStore>, owner: &str) -> Job {
        let mut job = Job::new(
            "v1",
            "t1",
            "in.mp4",
            &[RenditionProfile::new("480p", 854, 480, 1400)],
        );
        store.create_or_get(&job).await.unwrap();
        job.claim(owner, Utc::now()).unwrap();
        store.compare_and_swap(&job).await.unwrap()
    }

    #[tokio::test]
    async fn test_mutate_stores_new_version() {
        let store = Arc::new(MemoryJobStore::new());
        let job = claimed(&store, "a").await;
        let owned = OwnedJob::new(store.clone(), "a", job);

        owned.mutate(|j| Ok(j.start_processing(Utc::now())?)).await.unwrap();

        let stored = store.get_required(owned.id()).await.unwrap();
        assert_eq!(stored.status, JobStatus::Processing);
        assert_eq!(owned.snapshot().await.version, stored.version);
    }

    #[tokio::test]
    async fn test_mutate_detects_lease_handover() {
        let store = Arc::new(MemoryJobStore::new());
        let job = claimed(&store, "a").await;
        let stale = OwnedJob::new(store.clone(), "a", job);

        // Another owner re-claims the job behind our back
        let mut current = store.get_required(stale.id()).await.unwrap();
        current.claim("b", Utc::now()).unwrap();
        store.compare_and_swap(&current).await.unwrap();

        let err = stale
            .mutate(|j| Ok(j.start_processing(Utc::now())?))
            .await
            .unwrap_err();
        assert!(err.is_lease_lost());
        assert_eq!(
            store.get_required(stale.id()).await.unwrap().owner.as_deref(),
            Some("b")
        );
    }

    #[tokio::test]
    async fn test_mutate_retries_conflict_from_same_owner() {
        let store = Arc::new(MemoryJobStore::new());
        let job = claimed(&store, "a").await;
        let owned = OwnedJob::new(store.clone(), "a", job);

        // A write by the same owner through a different handle bumps the version
        let mut current = store.get_required(owned.id()).await.unwrap();
        current.start_processing(Utc::now()).unwrap();
        store.compare_and_swap(&current).await.unwrap();

        let id = owned.snapshot().await.renditions[0].id.clone();
        owned
            .mutate(|j| Ok(j.rendition_mut(&id)?.start(Utc::now())?))
            .await
            .unwrap();
        assert_eq!(store.conflict_count(), 1);
        assert_eq!(owned.snapshot().await.status, JobStatus::Processing);
    }
}
