//! Upload notification stream using a Redis Streams consumer group.

use redis::AsyncCommands;
use tracing::{debug, info, warn};

use vtrans_models::VideoUploaded;

use crate::config::RedisConfig;
use crate::error::{QueueError, QueueResult};

/// Consumer for `VideoUploaded` notifications.
pub struct UploadStream {
    client: redis::Client,
    stream_name: String,
    consumer_group: String,
}

impl UploadStream {
    pub fn new(config: &RedisConfig) -> QueueResult<Self> {
        let client = redis::Client::open(config.redis_url.as_str())?;
        Ok(Self {
            client,
            stream_name: config.uploads_stream.clone(),
            consumer_group: config.uploads_group.clone(),
        })
    }

    /// Initialize the stream (create consumer group if not exists).
    pub async fn init(&self) -> QueueResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        // Create consumer group (ignore error if already exists)
        let result: Result<(), redis::RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.stream_name)
            .arg(&self.consumer_group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(_) => info!("Created consumer group: {}", self.consumer_group),
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                debug!("Consumer group already exists: {}", self.consumer_group);
            }
            Err(e) => return Err(QueueError::Redis(e)),
        }

        Ok(())
    }

    /// Append an upload notification.
    pub async fn publish(&self, event: &VideoUploaded) -> QueueResult<String> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let payload = serde_json::to_string(event)?;

        let message_id: String = redis::cmd("XADD")
            .arg(&self.stream_name)
            .arg("*")
            .arg("event")
            .arg(&payload)
            .query_async(&mut conn)
            .await?;

        Ok(message_id)
    }

    /// Read new notifications for this consumer.
    pub async fn consume(
        &self,
        consumer_name: &str,
        block_ms: u64,
        count: usize,
    ) -> QueueResult<Vec<(String, VideoUploaded)>> {
        self.read_group(consumer_name, Some(block_ms), count, ">").await
    }

    /// Re-read notifications delivered to this consumer but never acknowledged,
    /// e.g. after a crash between consume and ack.
    pub async fn consume_unacked(
        &self,
        consumer_name: &str,
        count: usize,
    ) -> QueueResult<Vec<(String, VideoUploaded)>> {
        self.read_group(consumer_name, None, count, "0").await
    }

    /// Acknowledge a notification.
    pub async fn ack(&self, message_id: &str) -> QueueResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        redis::cmd("XACK")
            .arg(&self.stream_name)
            .arg(&self.consumer_group)
            .arg(message_id)
            .query_async::<()>(&mut conn)
            .await?;

        debug!("Acknowledged upload notification: {}", message_id);
        Ok(())
    }

    /// Get stream length.
    pub async fn len(&self) -> QueueResult<u64> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let len: u64 = conn.xlen(&self.stream_name).await?;
        Ok(len)
    }

    async fn read_group(
        &self,
        consumer_name: &str,
        block_ms: Option<u64>,
        count: usize,
        start_id: &str,
    ) -> QueueResult<Vec<(String, VideoUploaded)>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(&self.consumer_group)
            .arg(consumer_name)
            .arg("COUNT")
            .arg(count);
        if let Some(block_ms) = block_ms {
            cmd.arg("BLOCK").arg(block_ms);
        }
        cmd.arg("STREAMS").arg(&self.stream_name).arg(start_id);

        let result: Option<redis::streams::StreamReadReply> = cmd.query_async(&mut conn).await?;

        let mut events = Vec::new();

        for stream_key in result.map(|r| r.keys).unwrap_or_default() {
            for entry in stream_key.ids {
                let message_id = entry.id.clone();

                if let Some(redis::Value::BulkString(payload)) = entry.map.get("event") {
                    let payload_str = String::from_utf8_lossy(payload);
                    match serde_json::from_str::<VideoUploaded>(&payload_str) {
                        Ok(event) => events.push((message_id, event)),
                        Err(e) => {
                            warn!("Failed to parse upload notification: {}", e);
                            // Ack the malformed message to prevent reprocessing
                            self.ack(&message_id).await.ok();
                        }
                    }
                }
            }
        }

        Ok(events)
    }
}
