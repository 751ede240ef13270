//! Throughput rates of producers and consumers.
//!
//! Lifecycle points record into the current window; `tick` turns the window
//! into per-second rates and starts a new one, `publish` stores the snapshot
//! in the queue's rates hash under the instance id.

use crate::clock::SharedClock;
use crate::error::Result;
use crate::gateway::Gateway;
use crate::keys::QueueKeys;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use uuid::Uuid;

#[async_trait]
pub trait StatsProvider: Send + Sync {
    type Snapshot: Serialize + Send + Sync;

    fn instance_id(&self) -> Uuid;

    /// Snapshot the current window and reset it
    fn tick(&self) -> Self::Snapshot;

    async fn publish(&self, gateway: &dyn Gateway, keys: &QueueKeys, snapshot: &Self::Snapshot) -> Result<()> {
        let payload = serde_json::to_string(snapshot)?;
        gateway
            .hset(&keys.rates(), &self.instance_id().to_string(), &payload)
            .await?;
        Ok(())
    }
}

/// Counter window shared by both providers
#[derive(Debug)]
struct Window {
    clock: SharedClock,
    started_at: AtomicI64,
}

impl Window {
    fn new(clock: SharedClock) -> Self {
        let now = clock.now_ms();
        Self {
            clock,
            started_at: AtomicI64::new(now),
        }
    }

    /// Seconds since the window started, then restart it
    fn roll(&self) -> (i64, f64) {
        let now = self.clock.now_ms();
        let started = self.started_at.swap(now, Ordering::SeqCst);
        let elapsed = (now - started).max(1) as f64 / 1000.0;
        (now, elapsed)
    }
}

fn rate(counter: &AtomicU64, elapsed_secs: f64) -> f64 {
    counter.swap(0, Ordering::SeqCst) as f64 / elapsed_secs
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerRates {
    pub consumer_id: Uuid,
    pub processing_rate: f64,
    pub acknowledged_rate: f64,
    pub unacknowledged_rate: f64,
    pub idle: bool,
    pub timestamp: i64,
}

#[derive(Debug)]
pub struct ConsumerStats {
    consumer_id: Uuid,
    window: Window,
    processing: AtomicU64,
    acknowledged: AtomicU64,
    unacknowledged: AtomicU64,
    idle: AtomicBool,
}

impl ConsumerStats {
    pub fn new(consumer_id: Uuid, clock: SharedClock) -> Self {
        Self {
            consumer_id,
            window: Window::new(clock),
            processing: AtomicU64::new(0),
            acknowledged: AtomicU64::new(0),
            unacknowledged: AtomicU64::new(0),
            idle: AtomicBool::new(false),
        }
    }

    pub fn record_received(&self) {
        self.idle.store(false, Ordering::SeqCst);
        self.processing.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_acknowledged(&self) {
        self.acknowledged.fetch_add(1, Ordering::SeqCst);
    }

    /// Requeued, dead-lettered or expired
    pub fn record_unacknowledged(&self) {
        self.unacknowledged.fetch_add(1, Ordering::SeqCst);
    }

    pub fn set_idle(&self, idle: bool) {
        self.idle.store(idle, Ordering::SeqCst);
    }

    pub fn is_idle(&self) -> bool {
        self.idle.load(Ordering::SeqCst)
    }
}

impl StatsProvider for ConsumerStats {
    type Snapshot = ConsumerRates;

    fn instance_id(&self) -> Uuid {
        self.consumer_id
    }

    fn tick(&self) -> ConsumerRates {
        let (now, elapsed) = self.window.roll();
        ConsumerRates {
            consumer_id: self.consumer_id,
            processing_rate: rate(&self.processing, elapsed),
            acknowledged_rate: rate(&self.acknowledged, elapsed),
            unacknowledged_rate: rate(&self.unacknowledged, elapsed),
            idle: self.is_idle(),
            timestamp: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerRates {
    pub producer_id: Uuid,
    pub input_rate: f64,
    pub timestamp: i64,
}

#[derive(Debug)]
pub struct ProducerStats {
    producer_id: Uuid,
    window: Window,
    produced: AtomicU64,
}

impl ProducerStats {
    pub fn new(producer_id: Uuid, clock: SharedClock) -> Self {
        Self {
            producer_id,
            window: Window::new(clock),
            produced: AtomicU64::new(0),
        }
    }

    pub fn record_produced(&self) {
        self.produced.fetch_add(1, Ordering::SeqCst);
    }

    /// Whether at least `interval_ms` passed since the window started
    pub fn window_elapsed(&self, interval_ms: i64) -> bool {
        self.window.clock.now_ms() - self.window.started_at.load(Ordering::SeqCst) >= interval_ms
    }
}

impl StatsProvider for ProducerStats {
    type Snapshot = ProducerRates;

    fn instance_id(&self) -> Uuid {
        self.producer_id
    }

    fn tick(&self) -> ProducerRates {
        let (now, elapsed) = self.window.roll();
        ProducerRates {
            producer_id: self.producer_id,
            input_rate: rate(&self.produced, elapsed),
            timestamp: now,
        }
    }
}
