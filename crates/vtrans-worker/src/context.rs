//! Shared collaborators handed to every orchestrator component.

use std::sync::Arc;

use vtrans_media::Encoder;
use vtrans_queue::{EventBus, JobStore, LockProvider};
use vtrans_storage::BlobStore;

use crate::config::TranscodeConfig;

/// Configuration plus the external collaborators, built once at startup.
pub struct TranscodeContext {
    pub config: TranscodeConfig,
    pub store: Arc<dyn JobStore>,
    pub locks: Arc<dyn LockProvider>,
    pub blobs: Arc<dyn BlobStore>,
    pub encoder: Arc<dyn Encoder>,
    pub bus: Arc<dyn EventBus>,
}

impl TranscodeContext {
    pub fn new(
        config: TranscodeConfig,
        store: Arc<dyn JobStore>,
        locks: Arc<dyn LockProvider>,
        blobs: Arc<dyn BlobStore>,
        encoder: Arc<dyn Encoder>,
        bus: Arc<dyn EventBus>,
    ) -> Self {
        Self {
            config,
            store,
            locks,
            blobs,
            encoder,
            bus,
        }
    }

    pub fn owner_id(&self) -> &str {
        &self.config.owner_id
    }
}
