//! Queue identity and Redis key layout.
//!
//! Every key of a queue shares the `{namespace:queue}` hash tag so multi-key
//! scripts stay on one cluster slot.

use crate::error::{QueueError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use strum::{AsRefStr, Display, EnumIter, EnumString};
use uuid::Uuid;

pub const KEY_PREFIX: &str = "mq";
pub const DEFAULT_NAMESPACE: &str = "default";

/// Validated `(namespace, queue)` pair
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueName {
    namespace: String,
    name: String,
}

impl QueueName {
    /// Validate and case-fold both parts. Allowed: `[a-z0-9_-]+`.
    pub fn new(namespace: &str, name: &str) -> Result<Self> {
        Ok(Self {
            namespace: validate_part("namespace", namespace)?,
            name: validate_part("queue name", name)?,
        })
    }

    /// Queue in the default namespace
    pub fn in_default(name: &str) -> Result<Self> {
        Self::new(DEFAULT_NAMESPACE, name)
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.name)
    }
}

fn validate_part(kind: &str, value: &str) -> Result<String> {
    let lowered = value.trim().to_lowercase();
    if lowered.is_empty() {
        return Err(QueueError::Config(format!("{} must not be empty", kind)));
    }
    let valid = lowered
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-');
    if !valid {
        return Err(QueueError::Config(format!(
            "Invalid {} '{}': only letters, digits, '_' and '-' are allowed",
            kind, value
        )));
    }
    Ok(lowered)
}

/// Cumulative counters kept in the queue's stats hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[derive(Display, AsRefStr, EnumString, EnumIter)]
#[strum(serialize_all = "snake_case")]
pub enum StatField {
    Produced,
    Scheduled,
    Promoted,
    Acknowledged,
    Requeued,
    DeadLettered,
    Expired,
}

/// Key names for one queue
#[derive(Debug, Clone)]
pub struct QueueKeys {
    base: String,
}

impl QueueKeys {
    pub fn new(queue: &QueueName) -> Self {
        Self {
            base: format!("{}:{{{}}}", KEY_PREFIX, queue),
        }
    }

    /// List of deliverable messages (LPUSH in, pop from the right)
    pub fn ready(&self) -> String {
        format!("{}:ready", self.base)
    }

    /// Sorted set of delayed/recurring messages scored by due time (ms)
    pub fn scheduled(&self) -> String {
        format!("{}:scheduled", self.base)
    }

    /// Terminal list for messages that exhausted their retries
    pub fn dead_letter(&self) -> String {
        format!("{}:dead-letter", self.base)
    }

    /// Per-consumer list of checked-out messages
    pub fn processing(&self, consumer_id: &Uuid) -> String {
        format!("{}:processing:{}", self.base, consumer_id)
    }

    /// Sorted set of consumer ids scored by last heartbeat (ms)
    pub fn heartbeats(&self) -> String {
        format!("{}:heartbeats", self.base)
    }

    /// Hash of cumulative counters
    pub fn stats(&self) -> String {
        format!("{}:stats", self.base)
    }

    /// Hash of per-instance rate snapshots
    pub fn rates(&self) -> String {
        format!("{}:rates", self.base)
    }
}
