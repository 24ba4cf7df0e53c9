//! Coordination collaborators for the transcoding orchestrator.
//!
//! This crate provides:
//! - Job store with compare-and-swap writes (Redis + in-memory)
//! - Lease-based job locks with owner tokens (Redis + in-memory)
//! - Outcome event bus via Redis Streams (Redis + in-memory)
//! - Upload notification stream consumption

pub mod config;
pub mod error;
pub mod events;
pub mod keys;
pub mod lock;
pub mod memory;
pub mod store;
pub mod uploads;

pub use config::RedisConfig;
pub use error::{QueueError, QueueResult};
pub use events::{EventBus, RedisEventBus};
pub use lock::{LockProvider, RedisLockProvider};
pub use memory::{MemoryEventBus, MemoryJobStore, MemoryLockProvider};
pub use store::{CreateOutcome, JobStore, RedisJobStore};
pub use uploads::UploadStream;
