//! Redis connection configuration.

/// Redis configuration shared by the store, locks, event bus and upload stream.
#[derive(Debug, Clone)]
pub struct RedisConfig {
    /// Redis URL
    pub redis_url: String,
    /// Prefix for every key this crate writes
    pub key_prefix: String,
    /// Stream receiving outcome events
    pub events_stream: String,
    /// Stream carrying upload notifications
    pub uploads_stream: String,
    /// Consumer group reading the upload stream
    pub uploads_group: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            key_prefix: "vtrans".to_string(),
            events_stream: "vtrans:events".to_string(),
            uploads_stream: "vtrans:uploads".to_string(),
            uploads_group: "vtrans:intake".to_string(),
        }
    }
}

impl RedisConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            redis_url: std::env::var("REDIS_URL").unwrap_or(defaults.redis_url),
            key_prefix: std::env::var("REDIS_KEY_PREFIX").unwrap_or(defaults.key_prefix),
            events_stream: std::env::var("EVENTS_STREAM").unwrap_or(defaults.events_stream),
            uploads_stream: std::env::var("UPLOADS_STREAM").unwrap_or(defaults.uploads_stream),
            uploads_group: std::env::var("UPLOADS_CONSUMER_GROUP")
                .unwrap_or(defaults.uploads_group),
        }
    }
}
