//! Consumer engine.
//!
//! A consumer moves messages one at a time from the ready queue into its own
//! processing list (blocking pop-with-move), hands each to the injected
//! [`MessageHandler`] on a bounded worker pool, and then acknowledges or routes
//! the message through the retry/dead-letter decision.
//!
//! # Example
//!
//! ```rust,ignore
//! use message_queue::{Consumer, ConsumerConfig, QueueContext, handler_fn};
//!
//! let consumer = Consumer::new(
//!     ctx,
//!     handler_fn(|message| async move {
//!         tracing::info!(id = %message.id(), "Got message");
//!         Ok(())
//!     }),
//!     ConsumerConfig::default().with_concurrency(4),
//! );
//! consumer.run().await?;
//! ```

use crate::config::ConsumerConfig;
use crate::context::QueueContext;
use crate::error::{ConsumeError, Result};
use crate::events::{EventBus, InstanceEvent, QueueEvent};
use crate::failure::{FailureOutcome, handle_failure};
use crate::gateway::{Command, ScriptCall};
use crate::gc::GarbageCollector;
use crate::keys::StatField;
use crate::message::Message;
use crate::metrics::QueueMetrics;
use crate::power::{PowerManager, PowerState};
use crate::scheduler::Scheduler;
use crate::scripts::QueueScript;
use crate::stats::{ConsumerStats, StatsProvider};
use async_trait::async_trait;
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Semaphore, broadcast, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Processes delivered messages.
///
/// Return `Ok(())` to acknowledge. An error, a panic or exceeding the consume
/// timeout counts as a failed attempt.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn consume(&self, message: &Message) -> Result<(), ConsumeError>;

    /// Called for a message whose TTL ran out before it could be handled
    async fn expired(&self, _message: &Message) {}

    fn name(&self) -> &'static str {
        "handler"
    }
}

/// Closure adapter, see [`handler_fn`]
pub struct FnHandler<F> {
    f: F,
}

/// Wrap an async closure as a [`MessageHandler`]
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), ConsumeError>> + Send,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), ConsumeError>> + Send,
{
    async fn consume(&self, message: &Message) -> Result<(), ConsumeError> {
        (self.f)(message.clone()).await
    }
}

struct Inner {
    id: Uuid,
    ctx: QueueContext,
    config: ConsumerConfig,
    handler: Arc<dyn MessageHandler>,
    power: PowerManager,
    events: EventBus,
    stats: ConsumerStats,
    metrics: QueueMetrics,
    processing_key: String,
}

/// Tasks owned by a running consumer
struct Runtime {
    shutdown: watch::Sender<bool>,
    dequeue: JoinHandle<()>,
    background: Vec<JoinHandle<()>>,
}

pub struct Consumer {
    inner: Arc<Inner>,
    runtime: Mutex<Option<Runtime>>,
}

impl Consumer {
    pub fn new(ctx: QueueContext, handler: impl MessageHandler + 'static, config: ConsumerConfig) -> Self {
        Self::with_handler(ctx, Arc::new(handler), config)
    }

    pub fn with_handler(ctx: QueueContext, handler: Arc<dyn MessageHandler>, config: ConsumerConfig) -> Self {
        let id = Uuid::new_v4();
        let events = EventBus::new(id);
        let inner = Inner {
            id,
            processing_key: ctx.keys().processing(&id),
            stats: ConsumerStats::new(id, ctx.clock().clone()),
            metrics: QueueMetrics::new(ctx.queue().to_string()),
            power: PowerManager::new(events.clone()),
            events,
            handler,
            config,
            ctx,
        };
        Self {
            inner: Arc::new(inner),
            runtime: Mutex::new(None),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn context(&self) -> &QueueContext {
        &self.inner.ctx
    }

    pub fn state(&self) -> PowerState {
        self.inner.power.state()
    }

    pub fn is_running(&self) -> bool {
        self.inner.power.is_up()
    }

    pub fn events(&self) -> broadcast::Receiver<InstanceEvent> {
        self.inner.events.subscribe()
    }

    pub fn power_state(&self) -> watch::Receiver<PowerState> {
        self.inner.power.subscribe()
    }

    /// Register, start the background loops and begin dequeuing.
    /// Fails with `InvalidTransition` unless the consumer is down.
    pub async fn run(&self) -> Result<()> {
        let mut runtime = self.runtime.lock().await;
        self.inner.power.going_up()?;

        info!(
            consumer_id = %self.inner.id,
            queue = %self.inner.ctx.queue(),
            handler = self.inner.handler.name(),
            concurrency = self.inner.config.concurrency,
            "Starting consumer"
        );

        if let Err(e) = self.inner.heartbeat().await {
            error!(consumer_id = %self.inner.id, error = %e, "Consumer registration failed");
            self.inner.power.rollback()?;
            return Err(e);
        }

        let (shutdown, rx) = watch::channel(false);
        let background = self.spawn_background(&rx);
        self.inner.power.commit()?;

        let inner = Arc::clone(&self.inner);
        let dequeue = tokio::spawn(async move { inner.dequeue_loop(rx).await });

        *runtime = Some(Runtime {
            shutdown,
            dequeue,
            background,
        });
        Ok(())
    }

    fn spawn_background(&self, rx: &watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let inner = &self.inner;
        let mut handles = Vec::new();

        let heartbeat = Arc::clone(inner);
        let heartbeat_rx = rx.clone();
        handles.push(tokio::spawn(async move { heartbeat.heartbeat_loop(heartbeat_rx).await }));

        if let Some(config) = inner.config.scheduler {
            let scheduler = Scheduler::new(inner.ctx.clone())
                .with_events(inner.events.clone())
                .with_batch_size(config.batch_size);
            let rx = rx.clone();
            handles.push(tokio::spawn(async move {
                scheduler.run(config.promotion_interval, rx).await
            }));
        }

        if let Some(config) = inner.config.gc {
            let gc = GarbageCollector::new(inner.ctx.clone(), inner.config.retry, config)
                .excluding(inner.id)
                .with_events(inner.events.clone());
            let rx = rx.clone();
            handles.push(tokio::spawn(async move { gc.run(rx).await }));
        }

        handles
    }

    /// Stop dequeuing, wait for in-flight messages and deregister.
    /// Fails with `InvalidTransition` unless the consumer is up.
    pub async fn shutdown(&self) -> Result<()> {
        let mut runtime = self.runtime.lock().await;
        self.inner.power.going_down()?;
        info!(consumer_id = %self.inner.id, "Shutting down consumer");

        if let Some(runtime) = runtime.take() {
            // Receivers may already be gone if a task panicked
            let _ = runtime.shutdown.send(true);
            if let Err(e) = runtime.dequeue.await {
                error!(consumer_id = %self.inner.id, error = %e, "Dequeue loop panicked");
            }
            for handle in runtime.background {
                if let Err(e) = handle.await {
                    error!(consumer_id = %self.inner.id, error = %e, "Background loop panicked");
                }
            }
        }

        if let Err(e) = self.inner.deregister().await {
            warn!(consumer_id = %self.inner.id, error = %e, "Failed to deregister consumer");
        }

        self.inner.power.commit()?;
        info!(consumer_id = %self.inner.id, "Consumer stopped");
        Ok(())
    }
}

impl Inner {
    async fn heartbeat(&self) -> Result<()> {
        self.ctx
            .gateway()
            .zadd(&self.ctx.keys().heartbeats(), &self.id.to_string(), self.ctx.now_ms())
            .await?;
        Ok(())
    }

    /// Remove the registration together with the empty processing list.
    /// Anything still in the list keeps the registration so the garbage
    /// collector picks it up.
    async fn deregister(&self) -> Result<()> {
        let keys = self.ctx.keys();
        let id = self.id.to_string();
        let left = self.ctx.gateway().llen(&self.processing_key).await?;

        let mut commands = vec![Command::HDel {
            key: keys.rates(),
            field: id.clone(),
        }];
        if left == 0 {
            commands.push(Command::ZRem {
                key: keys.heartbeats(),
                member: id,
            });
            commands.push(Command::Del {
                key: self.processing_key.clone(),
            });
        } else {
            warn!(
                consumer_id = %self.id,
                messages = left,
                "Processing list not empty, leaving it to the garbage collector"
            );
        }

        self.ctx.gateway().exec_multi(commands).await?;
        Ok(())
    }

    async fn heartbeat_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.heartbeat().await {
                        warn!(consumer_id = %self.id, error = %e, "Heartbeat failed");
                    }
                    let snapshot = self.stats.tick();
                    if let Err(e) = self
                        .stats
                        .publish(self.ctx.gateway().as_ref(), self.ctx.keys(), &snapshot)
                        .await
                    {
                        debug!(consumer_id = %self.id, error = %e, "Failed to publish rates");
                    }
                }
            }
        }
    }

    async fn dequeue_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency));
        let mut tasks: JoinSet<()> = JoinSet::new();
        let mut consecutive_errors: u32 = 0;
        let ready = self.ctx.keys().ready();

        loop {
            if *shutdown.borrow() {
                break;
            }

            while let Some(joined) = tasks.try_join_next() {
                if let Err(e) = joined {
                    error!(consumer_id = %self.id, error = %e, "Message task panicked");
                }
            }
            self.metrics.in_flight(tasks.len());

            // One pop at a time, and only with a free worker slot
            let permit = tokio::select! {
                permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            };

            // Not raced against shutdown: a pop dropped mid-flight could strand
            // a message in the processing list. The block timeout bounds the wait.
            match self
                .ctx
                .gateway()
                .blocking_move(&ready, &self.processing_key, self.config.block_timeout)
                .await
            {
                Ok(Some(payload)) => {
                    if consecutive_errors > 0 {
                        info!(consumer_id = %self.id, "Connection recovered after {} errors", consecutive_errors);
                        consecutive_errors = 0;
                    }
                    let inner = Arc::clone(&self);
                    tasks.spawn(async move {
                        let _permit = permit;
                        inner.process(payload).await;
                    });
                }
                Ok(None) => {
                    drop(permit);
                    consecutive_errors = 0;
                    if tasks.is_empty() && !self.stats.is_idle() {
                        self.check_idle().await;
                    }
                }
                Err(e) => {
                    drop(permit);
                    consecutive_errors += 1;
                    let backoff = (Duration::from_millis(100) * 2u32.pow(consecutive_errors.min(9))).min(MAX_BACKOFF);
                    warn!(
                        consumer_id = %self.id,
                        error = %e,
                        consecutive_errors,
                        backoff_ms = backoff.as_millis() as u64,
                        "Dequeue failed, backing off"
                    );
                    tokio::select! {
                        _ = shutdown.changed() => {}
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
            }
        }

        debug!(consumer_id = %self.id, in_flight = tasks.len(), "Draining in-flight messages");
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(consumer_id = %self.id, error = %e, "Message task panicked");
            }
        }
        self.metrics.in_flight(0);
    }

    async fn check_idle(&self) {
        match self.ctx.gateway().llen(&self.processing_key).await {
            Ok(0) => {
                debug!(consumer_id = %self.id, "Consumer idle");
                self.stats.set_idle(true);
                self.events.emit(QueueEvent::Idle);
            }
            Ok(_) => {}
            Err(e) => debug!(consumer_id = %self.id, error = %e, "Idle check failed"),
        }
    }

    async fn process(&self, payload: String) {
        let message = match Message::from_json(&payload) {
            Ok(message) => message,
            Err(e) => {
                error!(consumer_id = %self.id, error = %e, "Dropping malformed message");
                self.metrics.message_malformed();
                if let Err(e) = self.ctx.gateway().lrem(&self.processing_key, 1, &payload).await {
                    error!(consumer_id = %self.id, error = %e, "Failed to drop malformed message");
                }
                return;
            }
        };

        let message_id = message.id();
        self.stats.record_received();
        self.metrics.message_received();
        self.events.emit(QueueEvent::MessageReceived { message_id });

        if message.is_expired_with(self.ctx.now_ms(), self.config.message_ttl) {
            self.expire(&payload, &message).await;
            return;
        }

        let timeout = message.consume_timeout().unwrap_or(self.config.consume_timeout);
        let started = Instant::now();
        debug!(consumer_id = %self.id, %message_id, attempts = message.attempts(), "Consuming message");

        let consumed = AssertUnwindSafe(self.handler.consume(&message)).catch_unwind();
        let outcome = match tokio::time::timeout(timeout, consumed).await {
            Ok(Ok(result)) => result,
            Ok(Err(panic)) => Err(ConsumeError::Panicked(panic_message(panic))),
            Err(_) => Err(ConsumeError::Timeout(timeout)),
        };

        match outcome {
            Ok(()) => self.acknowledge(&payload, message_id, started.elapsed()).await,
            Err(err) => self.fail(&payload, &message, err).await,
        }
    }

    async fn release(&self, payload: &str, field: StatField) -> Result<bool> {
        let call = ScriptCall::new(QueueScript::Release)
            .key(self.processing_key.as_str())
            .key(self.ctx.keys().stats())
            .arg(payload)
            .arg(field.as_ref());
        Ok(self.ctx.gateway().eval(call).await?.applied()?)
    }

    async fn acknowledge(&self, payload: &str, message_id: Uuid, elapsed: Duration) {
        match self.release(payload, StatField::Acknowledged).await {
            Ok(true) => {
                debug!(consumer_id = %self.id, %message_id, elapsed_ms = elapsed.as_millis() as u64, "Message acknowledged");
                self.stats.record_acknowledged();
                self.metrics.message_acknowledged(elapsed);
                self.events.emit(QueueEvent::MessageAcknowledged { message_id });
            }
            Ok(false) => warn!(consumer_id = %self.id, %message_id, "Acknowledged message was no longer in the processing list"),
            Err(e) => error!(
                consumer_id = %self.id,
                %message_id,
                error = %e,
                "Failed to acknowledge message, it stays in the processing list"
            ),
        }
    }

    async fn expire(&self, payload: &str, message: &Message) {
        let message_id = message.id();
        match self.release(payload, StatField::Expired).await {
            Ok(true) => {
                info!(consumer_id = %self.id, %message_id, "Message TTL exceeded");
                self.stats.record_unacknowledged();
                self.metrics.message_expired();
                self.handler.expired(message).await;
                self.events.emit(QueueEvent::MessageExpired { message_id });
            }
            Ok(false) => {}
            Err(e) => error!(consumer_id = %self.id, %message_id, error = %e, "Failed to drop expired message"),
        }
    }

    async fn fail(&self, payload: &str, message: &Message, err: ConsumeError) {
        let message_id = message.id();
        warn!(
            consumer_id = %self.id,
            %message_id,
            attempts = message.attempts() + 1,
            kind = err.kind(),
            error = %err,
            "Consume failed"
        );
        self.stats.record_unacknowledged();
        self.metrics.consume_failed(err.kind());

        match handle_failure(&self.ctx, &self.processing_key, payload, message, &self.config.retry).await {
            Ok(FailureOutcome::Requeued { delay }) => {
                self.metrics.message_requeued();
                self.events.emit(QueueEvent::MessageRequeued { message_id, delay });
            }
            Ok(FailureOutcome::DeadLettered) => {
                warn!(consumer_id = %self.id, %message_id, "Retries exhausted, message dead-lettered");
                self.metrics.message_dead_lettered();
                self.events.emit(QueueEvent::MessageDeadLettered { message_id });
            }
            Ok(FailureOutcome::Skipped) => {}
            Err(e) => error!(
                consumer_id = %self.id,
                %message_id,
                error = %e,
                "Failed to record consume failure, it stays in the processing list"
            ),
        }
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::QueueError;
    use crate::gateway::{Gateway, MemoryGateway};
    use crate::keys::QueueName;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config() -> ConsumerConfig {
        ConsumerConfig::default()
            .with_block_timeout(Duration::from_millis(20))
            .with_heartbeat_interval(Duration::from_millis(50))
            .with_retry_delay(Duration::ZERO)
            .with_scheduler(None)
            .with_gc(None)
    }

    fn context(queue: &str) -> (QueueContext, Arc<MemoryGateway>) {
        let gateway = Arc::new(MemoryGateway::new());
        let ctx = QueueContext::new(QueueName::in_default(queue).unwrap(), gateway.clone());
        (ctx, gateway)
    }

    async fn push(ctx: &QueueContext, message: &Message) {
        ctx.gateway()
            .lpush(&ctx.keys().ready(), &message.to_json().unwrap())
            .await
            .unwrap();
    }

    async fn wait_for(rx: &mut broadcast::Receiver<InstanceEvent>, wanted: impl Fn(&QueueEvent) -> bool) -> QueueEvent {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = rx.recv().await.unwrap().event;
                if wanted(&event) {
                    return event;
                }
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_acknowledges_successful_message() {
        let (ctx, _) = context("ack");
        let consumer = Consumer::new(ctx.clone(), handler_fn(|_| async { Ok(()) }), config());
        let mut events = consumer.events();
        let message = Message::new(json!({"n": 1}));
        push(&ctx, &message).await;

        consumer.run().await.unwrap();
        let event = wait_for(&mut events, |e| matches!(e, QueueEvent::MessageAcknowledged { .. })).await;
        assert_eq!(event, QueueEvent::MessageAcknowledged { message_id: message.id() });

        consumer.shutdown().await.unwrap();
        assert_eq!(ctx.counters().await.unwrap().acknowledged, 1);
        assert_eq!(ctx.gateway().llen(&ctx.keys().processing(&consumer.id())).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_error_timeout_and_panic_all_dead_letter() {
        for (name, handler) in [
            (
                "error",
                Arc::new(handler_fn(|_| async { Err(ConsumeError::failed("boom")) })) as Arc<dyn MessageHandler>,
            ),
            (
                "timeout",
                Arc::new(handler_fn(|_| async {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    Ok(())
                })) as Arc<dyn MessageHandler>,
            ),
            (
                "panic",
                Arc::new(handler_fn(|message: Message| async move {
                    if message.attempts() == 0 {
                        panic!("handler bug");
                    }
                    Ok(())
                })) as Arc<dyn MessageHandler>,
            ),
        ] {
            let (ctx, _) = context(name);
            let consumer = Consumer::with_handler(
                ctx.clone(),
                handler,
                config()
                    .with_retry_threshold(1)
                    .with_consume_timeout(Duration::from_millis(50)),
            );
            let mut events = consumer.events();
            push(&ctx, &Message::new(json!(name))).await;

            consumer.run().await.unwrap();
            wait_for(&mut events, |e| matches!(e, QueueEvent::MessageDeadLettered { .. })).await;
            consumer.shutdown().await.unwrap();

            assert_eq!(ctx.gateway().llen(&ctx.keys().dead_letter()).await.unwrap(), 1, "{}", name);
        }
    }

    #[tokio::test]
    async fn test_expired_message_skips_handler() {
        struct Recorder {
            consumed: AtomicUsize,
            expired: AtomicUsize,
        }

        #[async_trait]
        impl MessageHandler for Recorder {
            async fn consume(&self, _message: &Message) -> Result<(), ConsumeError> {
                self.consumed.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }

            async fn expired(&self, _message: &Message) {
                self.expired.fetch_add(1, Ordering::SeqCst);
            }
        }

        let (ctx, _) = context("ttl");
        let recorder = Arc::new(Recorder {
            consumed: AtomicUsize::new(0),
            expired: AtomicUsize::new(0),
        });
        let consumer = Consumer::with_handler(ctx.clone(), recorder.clone(), config());
        let mut events = consumer.events();

        let message = Message::new(json!(1)).with_ttl(Duration::from_millis(1));
        push(&ctx, &message).await;
        tokio::time::sleep(Duration::from_millis(5)).await;

        consumer.run().await.unwrap();
        wait_for(&mut events, |e| matches!(e, QueueEvent::MessageExpired { .. })).await;
        consumer.shutdown().await.unwrap();

        assert_eq!(recorder.consumed.load(Ordering::SeqCst), 0);
        assert_eq!(recorder.expired.load(Ordering::SeqCst), 1);
        assert_eq!(ctx.counters().await.unwrap().expired, 1);
    }

    #[tokio::test]
    async fn test_malformed_payload_is_dropped() {
        let (ctx, _) = context("malformed");
        let consumer = Consumer::new(ctx.clone(), handler_fn(|_| async { Ok(()) }), config());
        let mut events = consumer.events();
        ctx.gateway().lpush(&ctx.keys().ready(), "{broken").await.unwrap();

        consumer.run().await.unwrap();
        wait_for(&mut events, |e| matches!(e, QueueEvent::Idle)).await;
        consumer.shutdown().await.unwrap();

        assert_eq!(ctx.gateway().llen(&ctx.keys().ready()).await.unwrap(), 0);
        assert_eq!(ctx.gateway().llen(&ctx.keys().dead_letter()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_lifecycle_transitions() {
        let (ctx, _) = context("lifecycle");
        let consumer = Consumer::new(ctx.clone(), handler_fn(|_| async { Ok(()) }), config());
        assert!(matches!(
            consumer.shutdown().await.unwrap_err(),
            QueueError::InvalidTransition { .. }
        ));

        consumer.run().await.unwrap();
        assert!(consumer.is_running());
        assert_eq!(ctx.gateway().zcard(&ctx.keys().heartbeats()).await.unwrap(), 1);
        assert!(consumer.run().await.is_err());

        consumer.shutdown().await.unwrap();
        assert_eq!(consumer.state(), PowerState::Down);
        assert_eq!(ctx.gateway().zcard(&ctx.keys().heartbeats()).await.unwrap(), 0);

        // Restartable
        consumer.run().await.unwrap();
        consumer.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_registration_failure_rolls_back() {
        let (ctx, gateway) = context("rollback");
        let consumer = Consumer::new(ctx, handler_fn(|_| async { Ok(()) }), config());
        gateway.set_offline(true);

        assert!(consumer.run().await.is_err());
        assert_eq!(consumer.state(), PowerState::Down);
    }

    #[tokio::test]
    async fn test_recovers_from_transport_errors() {
        let (ctx, gateway) = context("flaky");
        let consumer = Consumer::new(ctx.clone(), handler_fn(|_| async { Ok(()) }), config());
        let mut events = consumer.events();

        consumer.run().await.unwrap();
        gateway.set_offline(true);
        tokio::time::sleep(Duration::from_millis(100)).await;
        gateway.set_offline(false);
        push(&ctx, &Message::new(json!(1))).await;

        wait_for(&mut events, |e| matches!(e, QueueEvent::MessageAcknowledged { .. })).await;
        consumer.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_workers_process_all() {
        let (ctx, _) = context("pool");
        let processed = Arc::new(AtomicUsize::new(0));
        let counter = processed.clone();
        let consumer = Consumer::new(
            ctx.clone(),
            handler_fn(move |_| {
                let counter = counter.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
            config().with_concurrency(4),
        );
        for n in 0..12 {
            push(&ctx, &Message::new(json!(n))).await;
        }

        consumer.run().await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while ctx.counters().await.unwrap().acknowledged < 12 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        consumer.shutdown().await.unwrap();

        assert_eq!(processed.load(Ordering::SeqCst), 12);
    }
}
