//! Lease-based job locks with owner tokens.
//!
//! A lease expires unless its owner renews it. Only the owner may renew or
//! release it, so a worker that stalled past its lease cannot disturb the
//! instance that re-claimed the job.

use std::time::Duration;

use async_trait::async_trait;
use redis::Script;
use tracing::debug;

use vtrans_models::JobId;

use crate::config::RedisConfig;
use crate::error::QueueResult;
use crate::keys;

/// Distributed mutual exclusion keyed by job id.
#[async_trait]
pub trait LockProvider: Send + Sync {
    /// Take the lease if nobody holds it. `false` means contention.
    async fn acquire(&self, job_id: &JobId, owner: &str, ttl: Duration) -> QueueResult<bool>;

    /// Extend the lease. `false` means the lease was lost.
    async fn renew(&self, job_id: &JobId, owner: &str, ttl: Duration) -> QueueResult<bool>;

    /// Drop the lease if still held by `owner`.
    async fn release(&self, job_id: &JobId, owner: &str) -> QueueResult<bool>;
}

const RENEW_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
else
    return 0
end
"#;

const RELEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
else
    return 0
end
"#;

/// Redis lock provider (`SET NX PX` plus owner-checked scripts).
pub struct RedisLockProvider {
    client: redis::Client,
    prefix: String,
}

impl RedisLockProvider {
    pub fn new(config: &RedisConfig) -> QueueResult<Self> {
        let client = redis::Client::open(config.redis_url.as_str())?;
        Ok(Self {
            client,
            prefix: config.key_prefix.clone(),
        })
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl LockProvider for RedisLockProvider {
    async fn acquire(&self, job_id: &JobId, owner: &str, ttl: Duration) -> QueueResult<bool> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let key = keys::lease_key(&self.prefix, job_id);

        // SET key value NX PX ttl
        let result: Option<String> = redis::cmd("SET")
            .arg(&key)
            .arg(owner)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;

        let acquired = result.is_some();
        debug!(job_id = %job_id, owner, acquired, "Lease acquire");
        Ok(acquired)
    }

    async fn renew(&self, job_id: &JobId, owner: &str, ttl: Duration) -> QueueResult<bool> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let renewed: i32 = Script::new(RENEW_SCRIPT)
            .key(keys::lease_key(&self.prefix, job_id))
            .arg(owner)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(renewed == 1)
    }

    async fn release(&self, job_id: &JobId, owner: &str) -> QueueResult<bool> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let deleted: i32 = Script::new(RELEASE_SCRIPT)
            .key(keys::lease_key(&self.prefix, job_id))
            .arg(owner)
            .invoke_async(&mut conn)
            .await?;

        debug!(job_id = %job_id, owner, released = deleted == 1, "Lease release");
        Ok(deleted == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ttl_millis_never_zero() {
        assert_eq!(ttl_millis(Duration::ZERO), 1);
        assert_eq!(ttl_millis(Duration::from_secs(2)), 2000);
    }

    // Note: requires a running Redis instance.
    #[tokio::test]
    #[ignore = "requires Redis"]
    async fn test_redis_lease_owner_semantics() {
        let locks = RedisLockProvider::new(&RedisConfig::from_env()).unwrap();
        let job_id = JobId::new();
        let ttl = Duration::from_secs(5);

        assert!(locks.acquire(&job_id, "a", ttl).await.unwrap());
        assert!(!locks.acquire(&job_id, "b", ttl).await.unwrap());
        assert!(!locks.renew(&job_id, "b", ttl).await.unwrap());
        assert!(!locks.release(&job_id, "b").await.unwrap());
        assert!(locks.renew(&job_id, "a", ttl).await.unwrap());
        assert!(locks.release(&job_id, "a").await.unwrap());
        assert!(locks.acquire(&job_id, "b", ttl).await.unwrap());
        locks.release(&job_id, "b").await.unwrap();
    }
}
