//! Message Queue
//!
//! A Redis-backed message queue with delayed and recurring delivery, retries,
//! dead-lettering and crash recovery.
//!
//! ## Features
//!
//! - **Producer / Consumer**: FIFO delivery through a ready list, one
//!   processing list per consumer for at-least-once semantics
//! - **Scheduler**: delay, cron, repeat and cron-repeat messages in a sorted set
//! - **Retries**: per-message or per-consumer threshold and delay, then the
//!   dead-letter list
//! - **Garbage collector**: reclaims processing lists of crashed consumers
//! - **Monitor API**: health, metrics, scheduler and dead-letter admin routes
//! - **Backends**: Redis, or an in-process gateway for embedding and tests
//!
//! ## Example
//!
//! ```ignore
//! use message_queue::{Consumer, ConsumerConfig, Message, Producer, QueueContext, QueueName, RedisGateway, handler_fn};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let gateway = Arc::new(RedisGateway::connect("redis://127.0.0.1:6379").await?);
//! let ctx = QueueContext::new(QueueName::in_default("emails")?, gateway);
//!
//! let producer = Producer::new(ctx.clone());
//! producer.run().await?;
//! producer
//!     .produce(&Message::new(serde_json::json!({"to": "a@b.c"})).with_delay(Duration::from_secs(60)))
//!     .await?;
//!
//! let consumer = Consumer::new(ctx, handler_fn(|message| async move { Ok(()) }), ConsumerConfig::default());
//! consumer.run().await?;
//! ```

mod clock;
mod config;
mod consumer;
mod context;
mod dlq;
mod error;
mod events;
mod failure;
mod gateway;
mod gc;
mod keys;
mod message;
pub mod metrics;
pub mod monitor;
mod power;
mod producer;
mod registry;
mod scheduler;
mod scripts;
mod stats;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::{ConsumerConfig, GcConfig, QueueSettings, RetryBackoff, RetryPolicy, SchedulerConfig};
pub use consumer::{Consumer, FnHandler, MessageHandler, handler_fn};
pub use context::{QueueContext, QueueCounters};
pub use dlq::DeadLetterQueue;
pub use error::{ConsumeError, GatewayError, QueueError, Result};
pub use events::{EventBus, InstanceEvent, QueueEvent};
pub use failure::{FailureOutcome, handle_failure};
pub use gateway::{
    Command, Gateway, GatewayResult, MemoryGateway, RedisGateway, Reply, RetryConfig, ScriptArg, ScriptCall,
    SharedGateway, connect_with_retry,
};
pub use gc::{GarbageCollector, GcReport};
pub use keys::{DEFAULT_NAMESPACE, KEY_PREFIX, QueueKeys, QueueName, StatField};
pub use message::{Message, Promotion, ScheduleProgress, Scheduling};
pub use metrics::{QueueMetrics, init_metrics};
pub use monitor::{MonitorState, monitor_router};
pub use power::{PowerManager, PowerState};
pub use producer::{Produced, Producer};
pub use registry::{InstanceRegistry, Lifecycle};
pub use scheduler::{Page, PromotionReport, ScheduledMessage, Scheduler};
pub use scripts::QueueScript;
pub use stats::{ConsumerRates, ConsumerStats, ProducerRates, ProducerStats, StatsProvider};
