//! Instance events.
//!
//! Every producer and consumer owns an [`EventBus`]. Events are sent on a
//! broadcast channel at the moment the transition happens; slow subscribers
//! lag and miss events rather than slowing the instance down.

use std::time::Duration;
use strum::AsRefStr;
use tokio::sync::broadcast;
use tracing::trace;
use uuid::Uuid;

const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum QueueEvent {
    GoingUp,
    Up,
    GoingDown,
    Down,
    /// Consumer found nothing to do for a whole block timeout
    Idle,
    MessageProduced { message_id: Uuid },
    MessagePromoted { message_id: Uuid },
    MessageReceived { message_id: Uuid },
    MessageAcknowledged { message_id: Uuid },
    MessageRequeued { message_id: Uuid, delay: Duration },
    MessageDeadLettered { message_id: Uuid },
    /// TTL exceeded before delivery
    MessageExpired { message_id: Uuid },
    /// A crashed consumer's processing list was drained
    ConsumerReclaimed { consumer_id: Uuid, messages: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceEvent {
    pub instance_id: Uuid,
    pub event: QueueEvent,
}

#[derive(Debug, Clone)]
pub struct EventBus {
    instance_id: Uuid,
    tx: broadcast::Sender<InstanceEvent>,
}

impl EventBus {
    pub fn new(instance_id: Uuid) -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { instance_id, tx }
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<InstanceEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: QueueEvent) {
        trace!(instance_id = %self.instance_id, event = event.as_ref(), "Event");
        // No subscribers is fine
        let _ = self.tx.send(InstanceEvent {
            instance_id: self.instance_id,
            event,
        });
    }
}
