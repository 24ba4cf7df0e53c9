//! Job store: the single source of truth for job and rendition state.

use async_trait::async_trait;
use redis::{AsyncCommands, Script};
use tracing::{debug, info};

use vtrans_models::{Job, JobId, JobStatus};

use crate::config::RedisConfig;
use crate::error::{QueueError, QueueResult};
use crate::keys;

/// Result of an idempotent job creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome {
    /// A new job was stored
    Created(JobId),
    /// A live or successful job already exists for the same video
    Existing(JobId),
}

impl CreateOutcome {
    pub fn job_id(&self) -> &JobId {
        match self {
            CreateOutcome::Created(id) | CreateOutcome::Existing(id) => id,
        }
    }
}

/// Durable store of jobs with optimistic-concurrency writes.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Atomically store `job` unless a non-failed job exists for its
    /// (tenant, video) pair.
    async fn create_or_get(&self, job: &Job) -> QueueResult<CreateOutcome>;

    async fn get(&self, id: &JobId) -> QueueResult<Option<Job>>;

    /// Store `job` if the stored version equals `job.version`.
    ///
    /// Returns the stored record with its bumped version. Fails with
    /// [`QueueError::VersionConflict`] on a version mismatch and with
    /// [`QueueError::TerminalState`] when the write would move a terminal job.
    async fn compare_and_swap(&self, job: &Job) -> QueueResult<Job>;

    /// Up to `limit` non-terminal jobs, oldest first, after skipping the
    /// `offset` oldest. A page shorter than `limit` ends the scan.
    async fn candidates(&self, offset: usize, limit: usize) -> QueueResult<Vec<Job>>;

    /// Terminal jobs whose outcome event is still pending.
    async fn unpublished(&self, limit: usize) -> QueueResult<Vec<Job>>;

    async fn get_required(&self, id: &JobId) -> QueueResult<Job> {
        self.get(id)
            .await?
            .ok_or_else(|| QueueError::JobNotFound(id.to_string()))
    }
}

// ARGV[4] is the job key prefix; the existing document key is built here
const CREATE_SCRIPT: &str = r#"
local existing = redis.call('GET', KEYS[1])
if existing then
    local doc = redis.call('GET', ARGV[4] .. existing)
    if doc then
        local status = cjson.decode(doc)['status']
        if status ~= 'failed' then
            return {0, existing}
        end
    end
end
redis.call('SET', KEYS[2], ARGV[2])
redis.call('SET', KEYS[1], ARGV[1])
redis.call('ZADD', KEYS[3], ARGV[3], ARGV[1])
return {1, ARGV[1]}
"#;

const CAS_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if not current then
    return -1
end
local stored = cjson.decode(current)
if tonumber(stored['version']) ~= tonumber(ARGV[1]) then
    return 0
end
if (stored['status'] == 'completed' or stored['status'] == 'failed') and stored['status'] ~= ARGV[3] then
    return -2
end
redis.call('SET', KEYS[1], ARGV[2])
if ARGV[4] == '1' then
    redis.call('ZREM', KEYS[2], ARGV[5])
end
if ARGV[6] == '1' then
    redis.call('SADD', KEYS[3], ARGV[5])
else
    redis.call('SREM', KEYS[3], ARGV[5])
end
return 1
"#;

/// Redis job store.
///
/// Each job is one JSON document; an active sorted set (scored by creation
/// time) gives FIFO candidate selection, and Lua scripts make creation and
/// compare-and-swap atomic.
///
/// Assumes a single Redis node (or a primary with replicas). The creation
/// script reads the existing job document through a key built inside the
/// script, which Redis Cluster cannot route.
pub struct RedisJobStore {
    client: redis::Client,
    prefix: String,
}

impl RedisJobStore {
    pub fn new(config: &RedisConfig) -> QueueResult<Self> {
        let client = redis::Client::open(config.redis_url.as_str())?;
        Ok(Self {
            client,
            prefix: config.key_prefix.clone(),
        })
    }

    async fn load_many(&self, ids: &[String]) -> QueueResult<Vec<Job>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let doc_keys: Vec<String> = ids
            .iter()
            .map(|id| keys::job_key(&self.prefix, &JobId::from_string(id.as_str())))
            .collect();

        let docs: Vec<Option<String>> = redis::cmd("MGET")
            .arg(&doc_keys)
            .query_async(&mut conn)
            .await?;

        docs.into_iter()
            .flatten()
            .map(|doc| serde_json::from_str::<Job>(&doc).map_err(QueueError::from))
            .collect()
    }
}

#[async_trait]
impl JobStore for RedisJobStore {
    async fn create_or_get(&self, job: &Job) -> QueueResult<CreateOutcome> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let payload = serde_json::to_string(job)?;

        let (created, id): (i64, String) = Script::new(CREATE_SCRIPT)
            .key(keys::video_index_key(&self.prefix, &job.tenant_id, &job.video_id))
            .key(keys::job_key(&self.prefix, &job.id))
            .key(keys::active_jobs_key(&self.prefix))
            .arg(job.id.as_str())
            .arg(&payload)
            .arg(job.created_at.timestamp_millis())
            .arg(keys::job_key_prefix(&self.prefix))
            .invoke_async(&mut conn)
            .await?;

        if created == 1 {
            info!(job_id = %job.id, video_id = %job.video_id, "Stored new job");
            Ok(CreateOutcome::Created(JobId::from_string(id)))
        } else {
            debug!(job_id = %id, video_id = %job.video_id, "Job already exists for video");
            Ok(CreateOutcome::Existing(JobId::from_string(id)))
        }
    }

    async fn get(&self, id: &JobId) -> QueueResult<Option<Job>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let doc: Option<String> = conn.get(keys::job_key(&self.prefix, id)).await?;
        doc.map(|d| serde_json::from_str(&d).map_err(QueueError::from))
            .transpose()
    }

    async fn compare_and_swap(&self, job: &Job) -> QueueResult<Job> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        let mut next = job.clone();
        next.version = job.version + 1;
        let payload = serde_json::to_string(&next)?;

        let result: i64 = Script::new(CAS_SCRIPT)
            .key(keys::job_key(&self.prefix, &job.id))
            .key(keys::active_jobs_key(&self.prefix))
            .key(keys::outbox_key(&self.prefix))
            .arg(job.version)
            .arg(&payload)
            .arg(next.status.as_str())
            .arg(if next.is_terminal() { "1" } else { "0" })
            .arg(job.id.as_str())
            .arg(if next.event_pending { "1" } else { "0" })
            .invoke_async(&mut conn)
            .await?;

        match result {
            1 => Ok(next),
            0 => Err(QueueError::conflict(&job.id)),
            -2 => Err(QueueError::TerminalState(job.id.to_string())),
            _ => Err(QueueError::JobNotFound(job.id.to_string())),
        }
    }

    async fn candidates(&self, offset: usize, limit: usize) -> QueueResult<Vec<Job>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let active = keys::active_jobs_key(&self.prefix);
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let ids: Vec<String> = conn
            .zrange(&active, offset as isize, (offset + limit) as isize - 1)
            .await?;

        let mut jobs = self.load_many(&ids).await?;
        jobs.retain(|j| !j.is_terminal());
        jobs.sort_by_key(|j| j.created_at);

        // Entries without a live document would cut every later page short
        if jobs.len() < ids.len() {
            let stale: Vec<&String> = ids
                .iter()
                .filter(|id| !jobs.iter().any(|j| j.id.as_str() == id.as_str()))
                .collect();
            debug!(count = stale.len(), "Dropping stale active entries");
            let _: () = conn.zrem(&active, stale).await?;
        }
        Ok(jobs)
    }

    async fn unpublished(&self, limit: usize) -> QueueResult<Vec<Job>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let mut ids: Vec<String> = conn.smembers(keys::outbox_key(&self.prefix)).await?;
        ids.truncate(limit);

        let mut jobs = self.load_many(&ids).await?;
        jobs.retain(|j| j.event_pending && j.is_terminal());
        Ok(jobs)
    }
}

/// Whether a write from `current` to `next` would move a terminal job.
pub(crate) fn violates_finality(current: JobStatus, next: JobStatus) -> bool {
    current.is_terminal() && current != next
}

#[cfg(test)]
mod tests {
    use super::*;
    use vtrans_models::RenditionProfile;

    #[test]
    fn test_violates_finality() {
        assert!(violates_finality(JobStatus::Completed, JobStatus::Pending));
        assert!(violates_finality(JobStatus::Failed, JobStatus::Processing));
        assert!(!violates_finality(JobStatus::Completed, JobStatus::Completed));
        assert!(!violates_finality(JobStatus::Processing, JobStatus::Failed));
    }

    // Note: requires a running Redis instance.
    #[tokio::test]
    #[ignore = "requires Redis"]
    async fn test_redis_create_and_cas() {
        let store = RedisJobStore::new(&RedisConfig::from_env()).unwrap();
        let ladder = vec![RenditionProfile::new("480p", 854, 480, 1400)];
        let video_id = format!("redis-test-{}", uuid::Uuid::new_v4());
        let job = Job::new(video_id.as_str(), "t1", "in.mp4", &ladder);

        let created = store.create_or_get(&job).await.unwrap();
        assert_eq!(created, CreateOutcome::Created(job.id.clone()));

        let duplicate = Job::new(video_id.as_str(), "t1", "in.mp4", &ladder);
        let existing = store.create_or_get(&duplicate).await.unwrap();
        assert_eq!(existing, CreateOutcome::Existing(job.id.clone()));

        let mut claimed = store.get_required(&job.id).await.unwrap();
        claimed.claim("worker-a", chrono::Utc::now()).unwrap();
        let stored = store.compare_and_swap(&claimed).await.unwrap();
        assert_eq!(stored.version, 1);

        // Stale version loses
        let err = store.compare_and_swap(&claimed).await.unwrap_err();
        assert!(err.is_conflict());
    }
}
