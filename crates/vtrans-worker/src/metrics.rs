//! Orchestrator metrics.
//!
//! Provides standardized metrics for monitoring the transcoding pipeline:
//! - Job intake, claim and settlement counters
//! - Rendition outcomes by failure kind and encode latency
//! - Lock contention and write conflicts
//! - Event publishing retries and failures

use metrics::{counter, histogram};

// =============================================================================
// Metric Names
// =============================================================================

/// Metric name constants for consistency.
pub mod names {
    /// Upload notifications by outcome (created, existing).
    pub const JOBS_SUBMITTED_TOTAL: &str = "vtrans_jobs_submitted_total";

    /// Jobs claimed by this instance.
    pub const JOBS_CLAIMED_TOTAL: &str = "vtrans_jobs_claimed_total";

    /// Job settlements by outcome (completed, requeued, failed, abandoned).
    pub const JOBS_SETTLED_TOTAL: &str = "vtrans_jobs_settled_total";

    /// Rendition outcomes by status and failure kind.
    pub const RENDITIONS_TOTAL: &str = "vtrans_renditions_total";

    /// Encode latency in seconds by resolution.
    pub const ENCODE_SECONDS: &str = "vtrans_encode_seconds";

    /// Lock acquisitions that found the job already leased.
    pub const LOCK_CONTENTION_TOTAL: &str = "vtrans_lock_contention_total";

    /// Compare-and-swap writes that lost against a concurrent writer.
    pub const CAS_CONFLICTS_TOTAL: &str = "vtrans_cas_conflicts_total";

    /// Outcome events delivered, by event type.
    pub const EVENTS_PUBLISHED_TOTAL: &str = "vtrans_events_published_total";

    /// Outcome event deliveries that exhausted their retries.
    pub const EVENT_PUBLISH_FAILURES_TOTAL: &str = "vtrans_event_publish_failures_total";
}

// =============================================================================
// Recording Functions
// =============================================================================

pub fn record_submission(created: bool) {
    let outcome = if created { "created" } else { "existing" };
    counter!(names::JOBS_SUBMITTED_TOTAL, "outcome" => outcome).increment(1);
}

pub fn record_claim() {
    counter!(names::JOBS_CLAIMED_TOTAL).increment(1);
}

pub fn record_settlement(outcome: &'static str) {
    counter!(names::JOBS_SETTLED_TOTAL, "outcome" => outcome).increment(1);
}

/// Record a rendition outcome. `kind` is `"none"` for completed renditions.
pub fn record_rendition(status: &'static str, kind: &'static str, resolution: &str) {
    counter!(
        names::RENDITIONS_TOTAL,
        "status" => status,
        "kind" => kind,
        "resolution" => resolution.to_string()
    )
    .increment(1);
}

pub fn record_encode_latency(resolution: &str, seconds: f64) {
    histogram!(names::ENCODE_SECONDS, "resolution" => resolution.to_string()).record(seconds);
}

pub fn record_lock_contention() {
    counter!(names::LOCK_CONTENTION_TOTAL).increment(1);
}

pub fn record_cas_conflict(operation: &'static str) {
    counter!(names::CAS_CONFLICTS_TOTAL, "operation" => operation).increment(1);
}

pub fn record_event_published(event_type: &'static str) {
    counter!(names::EVENTS_PUBLISHED_TOTAL, "type" => event_type).increment(1);
}

pub fn record_event_publish_failure() {
    counter!(names::EVENT_PUBLISH_FAILURES_TOTAL).increment(1);
}

// =============================================================================
// Tests
// =============================================================================
