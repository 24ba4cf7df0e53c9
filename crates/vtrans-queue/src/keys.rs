//! Redis key builders.

use vtrans_models::JobId;

pub fn job_key(prefix: &str, job_id: &JobId) -> String {
    format!("{}:job:{}", prefix, job_id)
}

/// Prefix the Lua create script appends a job id to.
pub fn job_key_prefix(prefix: &str) -> String {
    format!("{}:job:", prefix)
}

/// Sorted set of non-terminal job ids scored by creation time.
pub fn active_jobs_key(prefix: &str) -> String {
    format!("{}:jobs:active", prefix)
}

/// Set of terminal job ids whose outcome event is not yet published.
pub fn outbox_key(prefix: &str) -> String {
    format!("{}:jobs:outbox", prefix)
}

/// Latest job id for a (tenant, video) pair.
pub fn video_index_key(prefix: &str, tenant_id: &str, video_id: &str) -> String {
    format!("{}:video:{}:{}", prefix, tenant_id, video_id)
}

pub fn lease_key(prefix: &str, job_id: &JobId) -> String {
    format!("{}:lease:{}", prefix, job_id)
}
