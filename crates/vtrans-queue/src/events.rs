//! Outcome event bus via Redis Streams.

use async_trait::async_trait;
use tracing::info;

use vtrans_models::OutcomeEvent;

use crate::config::RedisConfig;
use crate::error::QueueResult;

/// At-least-once delivery of outcome events.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, event: &OutcomeEvent) -> QueueResult<()>;
}

/// Appends events to a Redis stream.
pub struct RedisEventBus {
    client: redis::Client,
    stream_name: String,
}

impl RedisEventBus {
    pub fn new(config: &RedisConfig) -> QueueResult<Self> {
        let client = redis::Client::open(config.redis_url.as_str())?;
        Ok(Self {
            client,
            stream_name: config.events_stream.clone(),
        })
    }
}

#[async_trait]
impl EventBus for RedisEventBus {
    async fn publish(&self, event: &OutcomeEvent) -> QueueResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let payload = serde_json::to_string(event)?;

        let message_id: String = redis::cmd("XADD")
            .arg(&self.stream_name)
            .arg("*")
            .arg("type")
            .arg(event.event_type())
            .arg("job_id")
            .arg(event.job_id().as_str())
            .arg("event")
            .arg(&payload)
            .query_async(&mut conn)
            .await?;

        info!(
            job_id = %event.job_id(),
            event_type = event.event_type(),
            message_id = message_id.as_str(),
            "Published outcome event"
        );
        Ok(())
    }
}
