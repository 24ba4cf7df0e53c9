//! Transcoding job orchestrator.
//!
//! This crate provides:
//! - Job intake from upload notifications
//! - Lease-guarded scheduling with bounded job and rendition concurrency
//! - Rendition execution (encode, upload, classified failures)
//! - Job-level retries with persisted exponential backoff
//! - HLS/DASH manifest assembly
//! - Outcome event publishing through an outbox

pub mod config;
pub mod context;
pub mod error;
pub mod executor;
pub mod intake;
pub mod logging;
pub mod manifest;
pub mod metrics;
pub mod ownership;
pub mod publisher;
pub mod retry;
pub mod retry_manager;
pub mod scheduler;

#[cfg(test)]
mod testing;

pub use config::{PermanentErrorPolicy, TranscodeConfig};
pub use context::TranscodeContext;
pub use error::{WorkerError, WorkerResult};
pub use executor::{RenditionExecutor, RenditionOutcome};
pub use intake::{run_upload_consumer, JobIntake};
pub use logging::JobLogger;
pub use manifest::ManifestAssembler;
pub use ownership::OwnedJob;
pub use publisher::EventPublisher;
pub use retry_manager::{RetryDecision, RetryManager, RetryPolicy};
pub use scheduler::{ClaimOutcome, JobOutcome, Scheduler};
