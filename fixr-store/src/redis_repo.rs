use redis::RedisResult;
use tracing::debug;

use crate::error::StoreError;

#[derive(Clone)]
pub struct RedisClient {
    client: redis::Client,
}

impl RedisClient {
    pub fn new(connection_string: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(connection_string)?;
        Ok(Self { client })
    }

    /// Fixed-window counter. Returns false once `limit` is exceeded within
    /// the window.
    pub async fn check_rate_limit(&self, key: &str, limit: i64, window_seconds: i64) -> RedisResult<bool> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        let (count,): (i64,) = redis::pipe()
            .atomic()
            .incr(key, 1)
            .expire(key, window_seconds)
            .ignore()
            .query_async(&mut conn)
            .await?;

        debug!("Rate limit {} at {}/{}", key, count, limit);
        Ok(count <= limit)
    }
}

pub fn rate_limit_key(client: &str, window_start: i64) -> String {
    format!("ratelimit:{}:{}", client, window_start)
}
