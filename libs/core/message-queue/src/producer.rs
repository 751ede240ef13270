use crate::context::QueueContext;
use crate::error::Result;
use crate::events::{EventBus, InstanceEvent, QueueEvent};
use crate::gateway::ScriptCall;
use crate::keys::StatField;
use crate::message::Message;
use crate::metrics::QueueMetrics;
use crate::power::{PowerManager, PowerState};
use crate::scheduler::Scheduler;
use crate::scripts::QueueScript;
use crate::stats::{ProducerStats, StatsProvider};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Input rates are published at most this often
const PUBLISH_INTERVAL_MS: i64 = 1_000;

/// Result of a successful [`Producer::produce`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Produced {
    pub message_id: Uuid,
    /// Due time when the message went to the scheduler index
    pub scheduled_at: Option<i64>,
}

/// Publishes messages to one queue
pub struct Producer {
    id: Uuid,
    ctx: QueueContext,
    power: PowerManager,
    events: EventBus,
    stats: ProducerStats,
    metrics: QueueMetrics,
    scheduler: Scheduler,
}

impl Producer {
    pub fn new(ctx: QueueContext) -> Self {
        let id = Uuid::new_v4();
        let events = EventBus::new(id);
        Self {
            id,
            power: PowerManager::new(events.clone()),
            stats: ProducerStats::new(id, ctx.clock().clone()),
            metrics: QueueMetrics::new(ctx.queue().to_string()),
            scheduler: Scheduler::new(ctx.clone()).with_events(events.clone()),
            events,
            ctx,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn context(&self) -> &QueueContext {
        &self.ctx
    }

    pub fn state(&self) -> PowerState {
        self.power.state()
    }

    pub fn events(&self) -> broadcast::Receiver<InstanceEvent> {
        self.events.subscribe()
    }

    /// Check the backend and go up. A failed check rolls back to down.
    pub async fn run(&self) -> Result<()> {
        self.power.going_up()?;
        if let Err(e) = self.ctx.gateway().ping().await {
            warn!(producer_id = %self.id, error = %e, "Producer startup failed");
            self.power.rollback()?;
            return Err(e.into());
        }
        self.power.commit()?;
        info!(producer_id = %self.id, queue = %self.ctx.queue(), "Producer up");
        Ok(())
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.power.going_down()?;
        if let Err(e) = self
            .ctx
            .gateway()
            .hdel(&self.ctx.keys().rates(), &self.id.to_string())
            .await
        {
            debug!(producer_id = %self.id, error = %e, "Failed to remove published rates");
        }
        self.power.commit()?;
        info!(producer_id = %self.id, "Producer down");
        Ok(())
    }

    /// Publish a message. Scheduled messages go to the scheduler index, all
    /// others straight to the ready queue. While the producer is starting the
    /// call waits for it to come up; while down it fails with `NotRunning`.
    pub async fn produce(&self, message: &Message) -> Result<Produced> {
        match self.power.state() {
            PowerState::Up => {}
            PowerState::GoingUp => self.power.wait_until_up().await?,
            PowerState::Down | PowerState::GoingDown => return Err(self.power.not_running()),
        }

        let scheduled_at = if message.is_scheduled() {
            Some(self.scheduler.schedule(message).await?)
        } else {
            let keys = self.ctx.keys();
            let accepted = message.clone().with_created_at(self.ctx.now_ms());
            let call = ScriptCall::new(QueueScript::Enqueue)
                .key(keys.ready())
                .key(keys.stats())
                .arg(accepted.to_json()?)
                .arg(StatField::Produced.as_ref());
            self.ctx.gateway().eval(call).await?;
            None
        };

        debug!(
            producer_id = %self.id,
            message_id = %message.id(),
            ?scheduled_at,
            "Message produced"
        );
        self.metrics.message_produced(scheduled_at.is_some());
        self.events.emit(QueueEvent::MessageProduced {
            message_id: message.id(),
        });
        self.stats.record_produced();
        self.publish_rates().await;

        Ok(Produced {
            message_id: message.id(),
            scheduled_at,
        })
    }

    async fn publish_rates(&self) {
        if !self.stats.window_elapsed(PUBLISH_INTERVAL_MS) {
            return;
        }
        let snapshot = self.stats.tick();
        if let Err(e) = self
            .stats
            .publish(self.ctx.gateway().as_ref(), self.ctx.keys(), &snapshot)
            .await
        {
            debug!(producer_id = %self.id, error = %e, "Failed to publish rates");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::QueueError;
    use crate::gateway::{Gateway, MemoryGateway};
    use crate::keys::QueueName;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    const START: i64 = 1_704_067_200_000;

    fn producer() -> (Producer, Arc<MemoryGateway>, Arc<ManualClock>) {
        let gateway = Arc::new(MemoryGateway::new());
        let clock = Arc::new(ManualClock::new(START));
        let ctx = QueueContext::new(QueueName::in_default("produce").unwrap(), gateway.clone())
            .with_clock(clock.clone());
        (Producer::new(ctx), gateway, clock)
    }

    #[tokio::test]
    async fn test_produce_when_down_fails() {
        let (producer, _, _) = producer();
        let err = producer.produce(&Message::new(json!(1))).await.unwrap_err();
        assert!(matches!(err, QueueError::NotRunning { instance_id } if instance_id == producer.id()));
    }

    #[tokio::test]
    async fn test_produce_enqueues_and_counts() {
        let (producer, _, _) = producer();
        producer.run().await.unwrap();
        let mut events = producer.events();

        let message = Message::new(json!({"task": "email"}));
        let produced = producer.produce(&message).await.unwrap();
        assert_eq!(produced.scheduled_at, None);

        let ctx = producer.context();
        let ready = ctx.gateway().lrange(&ctx.keys().ready(), 0, -1).await.unwrap();
        let enqueued = Message::from_json(&ready[0]).unwrap();
        assert_eq!(enqueued.body(), &json!({"task": "email"}));
        assert_eq!(enqueued.created_at(), START);
        assert_eq!(ctx.counters().await.unwrap().produced, 1);
        assert_eq!(
            events.try_recv().unwrap().event,
            QueueEvent::MessageProduced { message_id: message.id() }
        );
    }

    #[tokio::test]
    async fn test_scheduled_message_goes_to_index() {
        let (producer, _, _) = producer();
        producer.run().await.unwrap();

        let message = Message::new(json!(1)).with_delay(Duration::from_secs(60));
        let produced = producer.produce(&message).await.unwrap();
        assert_eq!(produced.scheduled_at, Some(START + 60_000));

        let ctx = producer.context();
        assert_eq!(ctx.gateway().llen(&ctx.keys().ready()).await.unwrap(), 0);
        assert_eq!(ctx.counters().await.unwrap().scheduled, 1);
    }

    #[tokio::test]
    async fn test_startup_failure_rolls_back() {
        let (producer, gateway, _) = producer();
        gateway.set_offline(true);
        assert!(producer.run().await.is_err());
        assert_eq!(producer.state(), PowerState::Down);
    }

    #[tokio::test]
    async fn test_rates_published_at_most_once_per_second() {
        let (producer, _, clock) = producer();
        producer.run().await.unwrap();
        let ctx = producer.context().clone();
        let field = producer.id().to_string();

        producer.produce(&Message::new(json!(1))).await.unwrap();
        assert!(ctx.gateway().hget(&ctx.keys().rates(), &field).await.unwrap().is_none());

        clock.advance(Duration::from_secs(1));
        producer.produce(&Message::new(json!(2))).await.unwrap();
        assert!(ctx.gateway().hget(&ctx.keys().rates(), &field).await.unwrap().is_some());

        producer.shutdown().await.unwrap();
        assert!(ctx.gateway().hget(&ctx.keys().rates(), &field).await.unwrap().is_none());
    }
}
