//! Disposable Redis for queue tests
//!
//! Queue tests connect their own gateway to [`TestRedis::url`] and use the
//! raw connection only to look at keys the engine wrote.

use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::redis::{REDIS_PORT, Redis};

/// BLMOVE and Lua scripting are required, so pin a modern image
const IMAGE_TAG: &str = "8-alpine";

/// Redis container, removed when dropped
pub struct TestRedis {
    _container: ContainerAsync<Redis>,
    conn: MultiplexedConnection,
    url: String,
}

impl TestRedis {
    pub async fn new() -> Self {
        let container = Redis::default()
            .with_tag(IMAGE_TAG)
            .start()
            .await
            .expect("Failed to start Redis container");
        let port = container
            .get_host_port_ipv4(REDIS_PORT)
            .await
            .expect("Failed to resolve Redis port");
        let url = format!("redis://127.0.0.1:{}", port);

        let conn = redis::Client::open(url.as_str())
            .expect("Invalid Redis URL")
            .get_multiplexed_async_connection()
            .await
            .expect("Failed to connect to Redis");

        tracing::info!(%url, image_tag = IMAGE_TAG, "Test Redis ready");
        Self {
            _container: container,
            conn,
            url,
        }
    }

    /// URL to hand to a gateway
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Raw connection for inspecting keys
    pub fn connection(&self) -> MultiplexedConnection {
        self.conn.clone()
    }

    /// Keys matching a glob pattern, sorted
    pub async fn keys(&self, pattern: &str) -> Vec<String> {
        let mut conn = self.connection();
        let mut keys: Vec<String> = conn.keys(pattern).await.expect("KEYS failed");
        keys.sort();
        keys
    }

    /// Drop every key, for tests that share one container
    pub async fn flush(&self) {
        let mut conn = self.connection();
        redis::cmd("FLUSHALL")
            .query_async::<()>(&mut conn)
            .await
            .expect("FLUSHALL failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[ignore = "requires Docker"]
    async fn test_blmove_takes_oldest_first() {
        let redis = TestRedis::new().await;
        let mut conn = redis.connection();

        conn.lpush::<_, _, ()>("ready", "first").await.unwrap();
        conn.lpush::<_, _, ()>("ready", "second").await.unwrap();

        let moved: Option<String> = redis::cmd("BLMOVE")
            .arg("ready")
            .arg("processing")
            .arg("RIGHT")
            .arg("LEFT")
            .arg(0.1)
            .query_async(&mut conn)
            .await
            .unwrap();
        assert_eq!(moved.as_deref(), Some("first"));
        assert_eq!(redis.keys("*").await, vec!["processing", "ready"]);
    }

    #[tokio::test]
    #[ignore = "requires Docker"]
    async fn test_zrangebyscore_orders_by_due_time() {
        let redis = TestRedis::new().await;
        let mut conn = redis.connection();

        conn.zadd::<_, _, _, ()>("scheduled", "late", 2_000).await.unwrap();
        conn.zadd::<_, _, _, ()>("scheduled", "early", 1_000).await.unwrap();

        let due: Vec<String> = conn.zrangebyscore("scheduled", 0, 1_500).await.unwrap();
        assert_eq!(due, vec!["early"]);
    }

    #[tokio::test]
    #[ignore = "requires Docker"]
    async fn test_flush_clears_keys() {
        let redis = TestRedis::new().await;
        let mut conn = redis.connection();

        conn.set::<_, _, ()>("mq:default:orders:stats", "x").await.unwrap();
        assert_eq!(redis.keys("mq:*").await.len(), 1);

        redis.flush().await;
        assert!(redis.keys("*").await.is_empty());
    }
}
