//! Backend command interface.
//!
//! All queue logic talks to a [`Gateway`] trait object. Two backends exist:
//! - [`RedisGateway`]: production driver over `redis::aio::ConnectionManager`
//! - [`MemoryGateway`]: in-process emulation for embedding and deterministic tests
//!
//! No retries happen at this layer; errors surface as [`GatewayError`].

mod memory;
mod redis;

pub use self::memory::MemoryGateway;
pub use self::redis::{RedisGateway, RetryConfig, connect_with_retry};

use crate::error::GatewayError;
use crate::scripts::QueueScript;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub type GatewayResult<T> = Result<T, GatewayError>;

pub type SharedGateway = Arc<dyn Gateway>;

/// Reply of a script or transactional command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Nil,
    Okay,
    Integer(i64),
    Data(String),
    Bulk(Vec<Reply>),
}

impl Reply {
    pub fn as_integer(&self) -> GatewayResult<i64> {
        match self {
            Reply::Integer(n) => Ok(*n),
            Reply::Data(s) => s
                .parse()
                .map_err(|_| GatewayError::protocol(format!("expected integer reply, got '{}'", s))),
            other => Err(GatewayError::protocol(format!(
                "expected integer reply, got {:?}",
                other
            ))),
        }
    }

    /// Scripts return 1 when they applied and 0 when the source was already gone
    pub fn applied(&self) -> GatewayResult<bool> {
        Ok(self.as_integer()? == 1)
    }
}

/// Argument of a script call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptArg {
    Str(String),
    Int(i64),
}

impl From<&str> for ScriptArg {
    fn from(value: &str) -> Self {
        ScriptArg::Str(value.to_string())
    }
}

impl From<String> for ScriptArg {
    fn from(value: String) -> Self {
        ScriptArg::Str(value)
    }
}

impl From<&String> for ScriptArg {
    fn from(value: &String) -> Self {
        ScriptArg::Str(value.clone())
    }
}

impl From<i64> for ScriptArg {
    fn from(value: i64) -> Self {
        ScriptArg::Int(value)
    }
}

impl ScriptArg {
    pub fn as_str(&self) -> String {
        match self {
            ScriptArg::Str(s) => s.clone(),
            ScriptArg::Int(n) => n.to_string(),
        }
    }
}

/// A named script with its keys and arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptCall {
    pub script: QueueScript,
    pub keys: Vec<String>,
    pub args: Vec<ScriptArg>,
}

impl ScriptCall {
    pub fn new(script: QueueScript) -> Self {
        Self {
            script,
            keys: Vec::new(),
            args: Vec::new(),
        }
    }

    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.keys.push(key.into());
        self
    }

    pub fn arg(mut self, arg: impl Into<ScriptArg>) -> Self {
        self.args.push(arg.into());
        self
    }
}

/// Command inside a transactional batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    LPush { key: String, value: String },
    LRem { key: String, count: i64, value: String },
    ZAdd { key: String, score: i64, member: String },
    ZRem { key: String, member: String },
    HSet { key: String, field: String, value: String },
    HDel { key: String, field: String },
    HIncrBy { key: String, field: String, delta: i64 },
    Del { key: String },
}

#[async_trait]
pub trait Gateway: Send + Sync + 'static {
    async fn lpush(&self, key: &str, value: &str) -> GatewayResult<i64>;

    async fn rpop(&self, key: &str) -> GatewayResult<Option<String>>;

    /// Inclusive range, negative indexes count from the tail
    async fn lrange(&self, key: &str, start: isize, stop: isize) -> GatewayResult<Vec<String>>;

    async fn llen(&self, key: &str) -> GatewayResult<usize>;

    async fn lrem(&self, key: &str, count: isize, value: &str) -> GatewayResult<usize>;

    /// Atomically pop from the tail of `source` and push onto the head of
    /// `destination`, waiting up to `timeout` for an element.
    async fn blocking_move(
        &self,
        source: &str,
        destination: &str,
        timeout: Duration,
    ) -> GatewayResult<Option<String>>;

    async fn zadd(&self, key: &str, member: &str, score: i64) -> GatewayResult<bool>;

    /// Members with `min <= score <= max`, ascending, paged by `offset`/`count`
    async fn zrange_by_score(
        &self,
        key: &str,
        min: i64,
        max: i64,
        offset: usize,
        count: usize,
    ) -> GatewayResult<Vec<(String, i64)>>;

    /// Members by rank with their scores, ascending
    async fn zrange(&self, key: &str, start: isize, stop: isize) -> GatewayResult<Vec<(String, i64)>>;

    async fn zcard(&self, key: &str) -> GatewayResult<usize>;

    async fn zrem(&self, key: &str, member: &str) -> GatewayResult<bool>;

    async fn hget(&self, key: &str, field: &str) -> GatewayResult<Option<String>>;

    async fn hset(&self, key: &str, field: &str, value: &str) -> GatewayResult<()>;

    async fn hdel(&self, key: &str, field: &str) -> GatewayResult<bool>;

    async fn hgetall(&self, key: &str) -> GatewayResult<HashMap<String, String>>;

    async fn hincrby(&self, key: &str, field: &str, delta: i64) -> GatewayResult<i64>;

    async fn del(&self, key: &str) -> GatewayResult<bool>;

    async fn ping(&self) -> GatewayResult<()>;

    /// Run a named script atomically
    async fn eval(&self, call: ScriptCall) -> GatewayResult<Reply>;

    /// Run commands as one transaction. Replies keep command order; the first
    /// failing command fails the whole call.
    async fn exec_multi(&self, commands: Vec<Command>) -> GatewayResult<Vec<Reply>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_script_call_builder() {
        let call = ScriptCall::new(QueueScript::Enqueue)
            .key("ready")
            .key("stats")
            .arg("payload")
            .arg(42i64);

        assert_eq!(call.keys, vec!["ready", "stats"]);
        assert_eq!(call.args[1], ScriptArg::Int(42));
        assert_eq!(call.args[1].as_str(), "42");
    }

    #[test]
    fn test_reply_as_integer() {
        assert_eq!(Reply::Integer(1).as_integer().unwrap(), 1);
        assert_eq!(Reply::Data("7".into()).as_integer().unwrap(), 7);
        assert!(Reply::Nil.as_integer().is_err());
        assert!(Reply::Integer(1).applied().unwrap());
        assert!(!Reply::Integer(0).applied().unwrap());
    }
}
