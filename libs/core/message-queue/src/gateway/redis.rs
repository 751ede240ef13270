use super::{Command, Gateway, GatewayResult, Reply, ScriptArg, ScriptCall};
use crate::error::GatewayError;
use crate::scripts::QueueScript;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::{Client, Script, Value};
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use strum::IntoEnumIterator;
use tracing::{debug, info, warn};

static SCRIPTS: Lazy<HashMap<QueueScript, Script>> = Lazy::new(|| {
    QueueScript::iter()
        .map(|script| (script, Script::new(script.source())))
        .collect()
});

/// Gateway over a Redis server.
///
/// Blocking pops run on their own connection so they never stall the
/// multiplexed connection used by every other command. That connection has
/// no client-side response timeout: `BLMOVE` is bounded by its own server-side
/// timeout, and a client that gives up first would drop a reply whose element
/// the server has already moved.
#[derive(Clone)]
pub struct RedisGateway {
    conn: ConnectionManager,
    blocking: ConnectionManager,
}

impl RedisGateway {
    /// Connect and verify with PING
    pub async fn connect(url: &str) -> redis::RedisResult<Self> {
        info!("Attempting to connect to Redis at {}", url);

        let client = Client::open(url)?;
        let conn = ConnectionManager::new(client.clone()).await?;
        let blocking =
            ConnectionManager::new_with_config(client, ConnectionManagerConfig::new().set_response_timeout(None))
                .await?;

        let mut check = conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut check).await?;

        info!("Successfully connected to Redis");
        Ok(Self { conn, blocking })
    }

    /// Build from existing connection managers
    pub fn new(conn: ConnectionManager, blocking: ConnectionManager) -> Self {
        Self { conn, blocking }
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

fn to_reply(value: Value) -> GatewayResult<Reply> {
    Ok(match value {
        Value::Nil => Reply::Nil,
        Value::Okay => Reply::Okay,
        Value::Int(n) => Reply::Integer(n),
        Value::SimpleString(s) => Reply::Data(s),
        Value::BulkString(bytes) => Reply::Data(
            String::from_utf8(bytes).map_err(|e| GatewayError::protocol(e.to_string()))?,
        ),
        Value::Array(items) => Reply::Bulk(items.into_iter().map(to_reply).collect::<GatewayResult<_>>()?),
        Value::ServerError(e) => return Err(GatewayError::protocol(format!("{:?}", e))),
        other => return Err(GatewayError::protocol(format!("unsupported reply {:?}", other))),
    })
}

fn to_score(score: f64) -> i64 {
    score.round() as i64
}

#[async_trait]
impl Gateway for RedisGateway {
    async fn lpush(&self, key: &str, value: &str) -> GatewayResult<i64> {
        let len: i64 = redis::cmd("LPUSH").arg(key).arg(value).query_async(&mut self.conn()).await?;
        Ok(len)
    }

    async fn rpop(&self, key: &str) -> GatewayResult<Option<String>> {
        let value: Option<String> = redis::cmd("RPOP").arg(key).query_async(&mut self.conn()).await?;
        Ok(value)
    }

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> GatewayResult<Vec<String>> {
        let items: Vec<String> = redis::cmd("LRANGE")
            .arg(key)
            .arg(start)
            .arg(stop)
            .query_async(&mut self.conn())
            .await?;
        Ok(items)
    }

    async fn llen(&self, key: &str) -> GatewayResult<usize> {
        let len: usize = redis::cmd("LLEN").arg(key).query_async(&mut self.conn()).await?;
        Ok(len)
    }

    async fn lrem(&self, key: &str, count: isize, value: &str) -> GatewayResult<usize> {
        let removed: usize = redis::cmd("LREM")
            .arg(key)
            .arg(count)
            .arg(value)
            .query_async(&mut self.conn())
            .await?;
        Ok(removed)
    }

    async fn blocking_move(
        &self,
        source: &str,
        destination: &str,
        timeout: Duration,
    ) -> GatewayResult<Option<String>> {
        let mut conn = self.blocking.clone();
        let value: Option<String> = redis::cmd("BLMOVE")
            .arg(source)
            .arg(destination)
            .arg("RIGHT")
            .arg("LEFT")
            .arg(timeout.as_secs_f64())
            .query_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn zadd(&self, key: &str, member: &str, score: i64) -> GatewayResult<bool> {
        let added: i64 = redis::cmd("ZADD")
            .arg(key)
            .arg(score)
            .arg(member)
            .query_async(&mut self.conn())
            .await?;
        Ok(added == 1)
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: i64,
        max: i64,
        offset: usize,
        count: usize,
    ) -> GatewayResult<Vec<(String, i64)>> {
        let items: Vec<(String, f64)> = redis::cmd("ZRANGEBYSCORE")
            .arg(key)
            .arg(min)
            .arg(max)
            .arg("WITHSCORES")
            .arg("LIMIT")
            .arg(offset)
            .arg(count)
            .query_async(&mut self.conn())
            .await?;
        Ok(items.into_iter().map(|(m, s)| (m, to_score(s))).collect())
    }

    async fn zrange(&self, key: &str, start: isize, stop: isize) -> GatewayResult<Vec<(String, i64)>> {
        let items: Vec<(String, f64)> = redis::cmd("ZRANGE")
            .arg(key)
            .arg(start)
            .arg(stop)
            .arg("WITHSCORES")
            .query_async(&mut self.conn())
            .await?;
        Ok(items.into_iter().map(|(m, s)| (m, to_score(s))).collect())
    }

    async fn zcard(&self, key: &str) -> GatewayResult<usize> {
        let count: usize = redis::cmd("ZCARD").arg(key).query_async(&mut self.conn()).await?;
        Ok(count)
    }

    async fn zrem(&self, key: &str, member: &str) -> GatewayResult<bool> {
        let removed: i64 = redis::cmd("ZREM").arg(key).arg(member).query_async(&mut self.conn()).await?;
        Ok(removed == 1)
    }

    async fn hget(&self, key: &str, field: &str) -> GatewayResult<Option<String>> {
        let value: Option<String> = redis::cmd("HGET").arg(key).arg(field).query_async(&mut self.conn()).await?;
        Ok(value)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> GatewayResult<()> {
        let _: i64 = redis::cmd("HSET")
            .arg(key)
            .arg(field)
            .arg(value)
            .query_async(&mut self.conn())
            .await?;
        Ok(())
    }

    async fn hdel(&self, key: &str, field: &str) -> GatewayResult<bool> {
        let removed: i64 = redis::cmd("HDEL").arg(key).arg(field).query_async(&mut self.conn()).await?;
        Ok(removed == 1)
    }

    async fn hgetall(&self, key: &str) -> GatewayResult<HashMap<String, String>> {
        let map: HashMap<String, String> = redis::cmd("HGETALL").arg(key).query_async(&mut self.conn()).await?;
        Ok(map)
    }

    async fn hincrby(&self, key: &str, field: &str, delta: i64) -> GatewayResult<i64> {
        let value: i64 = redis::cmd("HINCRBY")
            .arg(key)
            .arg(field)
            .arg(delta)
            .query_async(&mut self.conn())
            .await?;
        Ok(value)
    }

    async fn del(&self, key: &str) -> GatewayResult<bool> {
        let removed: i64 = redis::cmd("DEL").arg(key).query_async(&mut self.conn()).await?;
        Ok(removed == 1)
    }

    async fn ping(&self) -> GatewayResult<()> {
        let response: String = redis::cmd("PING").query_async(&mut self.conn()).await?;
        if response == "PONG" {
            Ok(())
        } else {
            Err(GatewayError::protocol(format!("unexpected PING response: {}", response)))
        }
    }

    async fn eval(&self, call: ScriptCall) -> GatewayResult<Reply> {
        let script = SCRIPTS
            .get(&call.script)
            .ok_or_else(|| GatewayError::protocol(format!("unknown script {}", call.script)))?;

        let mut invocation = script.prepare_invoke();
        for key in &call.keys {
            invocation.key(key);
        }
        for arg in &call.args {
            match arg {
                ScriptArg::Str(s) => invocation.arg(s),
                ScriptArg::Int(n) => invocation.arg(*n),
            };
        }

        debug!(script = %call.script, keys = ?call.keys, "Evaluating script");
        let value: Value = invocation.invoke_async(&mut self.conn()).await?;
        to_reply(value)
    }

    async fn exec_multi(&self, commands: Vec<Command>) -> GatewayResult<Vec<Reply>> {
        let mut pipe = redis::pipe();
        pipe.atomic();
        for command in &commands {
            match command {
                Command::LPush { key, value } => pipe.cmd("LPUSH").arg(key).arg(value),
                Command::LRem { key, count, value } => pipe.cmd("LREM").arg(key).arg(*count).arg(value),
                Command::ZAdd { key, score, member } => pipe.cmd("ZADD").arg(key).arg(*score).arg(member),
                Command::ZRem { key, member } => pipe.cmd("ZREM").arg(key).arg(member),
                Command::HSet { key, field, value } => pipe.cmd("HSET").arg(key).arg(field).arg(value),
                Command::HDel { key, field } => pipe.cmd("HDEL").arg(key).arg(field),
                Command::HIncrBy { key, field, delta } => pipe.cmd("HINCRBY").arg(key).arg(field).arg(*delta),
                Command::Del { key } => pipe.cmd("DEL").arg(key),
            };
        }

        let values: Vec<Value> = pipe.query_async(&mut self.conn()).await?;
        if values.len() != commands.len() {
            return Err(GatewayError::protocol(format!(
                "expected {} replies, got {}",
                commands.len(),
                values.len()
            )));
        }
        values.into_iter().map(to_reply).collect()
    }
}

/// Retry configuration for the initial connection
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts
    pub max_retries: u32,

    /// Initial delay between retries in milliseconds
    pub initial_delay_ms: u64,

    /// Maximum delay between retries in milliseconds
    pub max_delay_ms: u64,

    /// Whether to add jitter to prevent thundering herd
    pub use_jitter: bool,
}

impl RetryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_initial_delay(mut self, delay_ms: u64) -> Self {
        self.initial_delay_ms = delay_ms;
        self
    }

    pub fn without_jitter(mut self) -> Self {
        self.use_jitter = false;
        self
    }

    /// Delay before retry number `attempt` (1-based), doubling up to the cap
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = self
            .initial_delay_ms
            .saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)))
            .min(self.max_delay_ms);
        let delay = if self.use_jitter { apply_jitter(delay) } else { delay };
        Duration::from_millis(delay)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 100,
            max_delay_ms: 5000,
            use_jitter: true,
        }
    }
}

async fn retry_with_backoff<F, Fut, T, E>(mut operation: F, config: &RetryConfig) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                attempt += 1;
                if attempt > config.max_retries {
                    warn!("Operation failed after {} attempts: {}", config.max_retries, e);
                    return Err(e);
                }
                let delay = config.delay_for(attempt);
                debug!(
                    "Operation failed (attempt {}/{}): {}. Retrying in {:?}...",
                    attempt, config.max_retries, e, delay
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Random value between 50% and 100% of the delay
fn apply_jitter(delay: u64) -> u64 {
    use std::collections::hash_map::RandomState;
    use std::hash::BuildHasher;

    let random_factor =
        (RandomState::new().hash_one(std::time::SystemTime::now()) % 50) as f64 / 100.0 + 0.5;
    (delay as f64 * random_factor) as u64
}

/// Connect to Redis, retrying with exponential backoff and jitter
pub async fn connect_with_retry(url: &str, config: RetryConfig) -> redis::RedisResult<RedisGateway> {
    retry_with_backoff(|| RedisGateway::connect(url), &config).await
}
