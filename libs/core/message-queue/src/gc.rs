//! Crashed consumer recovery.
//!
//! A consumer whose heartbeat is older than the liveness threshold is treated
//! as crashed. Every message left in its processing list goes through the same
//! retry/dead-letter decision as a failed delivery, then the registration and
//! the empty list are removed together.

use crate::config::{GcConfig, RetryPolicy};
use crate::context::QueueContext;
use crate::error::Result;
use crate::events::{EventBus, QueueEvent};
use crate::failure::{FailureOutcome, handle_failure};
use crate::gateway::ScriptCall;
use crate::message::Message;
use crate::metrics::QueueMetrics;
use crate::scripts::QueueScript;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const STALE_BATCH: usize = 100;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcReport {
    pub consumers_reclaimed: usize,
    pub requeued: usize,
    pub dead_lettered: usize,
    pub malformed: usize,
}

#[derive(Clone)]
pub struct GarbageCollector {
    ctx: QueueContext,
    policy: RetryPolicy,
    config: GcConfig,
    own_id: Option<Uuid>,
    events: Option<EventBus>,
    metrics: QueueMetrics,
}

impl GarbageCollector {
    pub fn new(ctx: QueueContext, policy: RetryPolicy, config: GcConfig) -> Self {
        let metrics = QueueMetrics::new(ctx.queue().to_string());
        Self {
            ctx,
            policy,
            config,
            own_id: None,
            events: None,
            metrics,
        }
    }

    /// Never reclaim this consumer
    pub fn excluding(mut self, consumer_id: Uuid) -> Self {
        self.own_id = Some(consumer_id);
        self
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    fn emit(&self, event: QueueEvent) {
        if let Some(events) = &self.events {
            events.emit(event);
        }
    }

    /// Consumers whose last heartbeat is older than the threshold
    pub async fn stale_consumers(&self) -> Result<Vec<Uuid>> {
        let cutoff = self.ctx.now_ms() - self.config.heartbeat_threshold.as_millis() as i64;
        let heartbeats = self.ctx.keys().heartbeats();
        let entries = self
            .ctx
            .gateway()
            .zrange_by_score(&heartbeats, 0, cutoff, 0, STALE_BATCH)
            .await?;

        let mut stale = Vec::with_capacity(entries.len());
        for (member, _) in entries {
            match Uuid::parse_str(&member) {
                Ok(id) if Some(id) == self.own_id => {}
                Ok(id) => stale.push(id),
                Err(_) => {
                    warn!(member = %member, "Removing invalid heartbeat entry");
                    self.ctx.gateway().zrem(&heartbeats, &member).await?;
                }
            }
        }
        Ok(stale)
    }

    /// One collection cycle
    pub async fn collect(&self) -> Result<GcReport> {
        let mut report = GcReport::default();
        for consumer_id in self.stale_consumers().await? {
            self.reclaim(consumer_id, &mut report).await?;
        }
        Ok(report)
    }

    async fn reclaim(&self, consumer_id: Uuid, report: &mut GcReport) -> Result<()> {
        let keys = self.ctx.keys();
        let processing = keys.processing(&consumer_id);
        let payloads = self.ctx.gateway().lrange(&processing, 0, -1).await?;
        let orphaned = payloads.len();

        for payload in payloads {
            let message = match Message::from_json(&payload) {
                Ok(message) => message,
                Err(e) => {
                    error!(%consumer_id, error = %e, "Dropping malformed orphaned payload");
                    self.ctx.gateway().lrem(&processing, 1, &payload).await?;
                    self.metrics.message_malformed();
                    report.malformed += 1;
                    continue;
                }
            };

            match handle_failure(&self.ctx, &processing, &payload, &message, &self.policy).await? {
                FailureOutcome::Requeued { delay } => {
                    self.metrics.message_requeued();
                    self.emit(QueueEvent::MessageRequeued {
                        message_id: message.id(),
                        delay,
                    });
                    report.requeued += 1;
                }
                FailureOutcome::DeadLettered => {
                    self.metrics.message_dead_lettered();
                    self.emit(QueueEvent::MessageDeadLettered {
                        message_id: message.id(),
                    });
                    report.dead_lettered += 1;
                }
                FailureOutcome::Skipped => {}
            }
        }

        let call = ScriptCall::new(QueueScript::ReleaseConsumer)
            .key(keys.heartbeats())
            .key(processing)
            .arg(consumer_id.to_string());
        if !self.ctx.gateway().eval(call).await?.applied()? {
            debug!(%consumer_id, "Processing list refilled, retrying next cycle");
            return Ok(());
        }
        self.ctx.gateway().hdel(&keys.rates(), &consumer_id.to_string()).await?;

        info!(
            queue = %self.ctx.queue(),
            %consumer_id,
            messages = orphaned,
            "Reclaimed crashed consumer"
        );
        self.metrics.consumer_reclaimed(orphaned);
        self.emit(QueueEvent::ConsumerReclaimed {
            consumer_id,
            messages: orphaned,
        });
        report.consumers_reclaimed += 1;
        Ok(())
    }

    /// Collection loop. Errors are logged and retried on the next interval.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            queue = %self.ctx.queue(),
            interval_ms = self.config.interval.as_millis() as u64,
            threshold_ms = self.config.heartbeat_threshold.as_millis() as u64,
            "Starting garbage collector"
        );

        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    match self.collect().await {
                        Ok(report) if report.consumers_reclaimed > 0 => debug!(?report, "GC cycle"),
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "GC cycle failed, retrying next interval"),
                    }
                }
            }
        }

        info!(queue = %self.ctx.queue(), "Garbage collector stopped");
    }
}
