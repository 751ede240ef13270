use crate::clock::{SharedClock, SystemClock};
use crate::gateway::SharedGateway;
use crate::keys::{QueueKeys, QueueName, StatField};
use std::sync::Arc;

/// Everything needed to address one queue: its name, keys, backend and clock
#[derive(Clone)]
pub struct QueueContext {
    queue: QueueName,
    keys: QueueKeys,
    gateway: SharedGateway,
    clock: SharedClock,
}

impl QueueContext {
    pub fn new(queue: QueueName, gateway: SharedGateway) -> Self {
        Self {
            keys: QueueKeys::new(&queue),
            queue,
            gateway,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn queue(&self) -> &QueueName {
        &self.queue
    }

    pub fn keys(&self) -> &QueueKeys {
        &self.keys
    }

    pub fn gateway(&self) -> &SharedGateway {
        &self.gateway
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    /// Cumulative counters of the queue
    pub async fn counters(&self) -> crate::error::Result<QueueCounters> {
        let raw = self.gateway.hgetall(&self.keys.stats()).await?;
        let get = |field: StatField| raw.get(field.as_ref()).and_then(|v| v.parse().ok()).unwrap_or(0);
        Ok(QueueCounters {
            produced: get(StatField::Produced),
            scheduled: get(StatField::Scheduled),
            promoted: get(StatField::Promoted),
            acknowledged: get(StatField::Acknowledged),
            requeued: get(StatField::Requeued),
            dead_lettered: get(StatField::DeadLettered),
            expired: get(StatField::Expired),
        })
    }
}

/// Snapshot of the queue's stats hash
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueCounters {
    pub produced: u64,
    pub scheduled: u64,
    pub promoted: u64,
    pub acknowledged: u64,
    pub requeued: u64,
    pub dead_lettered: u64,
    pub expired: u64,
}
