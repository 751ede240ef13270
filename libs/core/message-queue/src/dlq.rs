//! Dead-letter list administration

use crate::context::QueueContext;
use crate::error::Result;
use crate::gateway::ScriptCall;
use crate::keys::StatField;
use crate::message::Message;
use crate::scheduler::{Page, page_range};
use crate::scripts::QueueScript;
use tracing::{info, warn};
use uuid::Uuid;

const SCAN_CHUNK: isize = 100;

#[derive(Clone)]
pub struct DeadLetterQueue {
    ctx: QueueContext,
}

impl DeadLetterQueue {
    pub fn new(ctx: QueueContext) -> Self {
        Self { ctx }
    }

    pub async fn count(&self) -> Result<usize> {
        Ok(self.ctx.gateway().llen(&self.ctx.keys().dead_letter()).await?)
    }

    /// Page of dead-lettered messages, most recent first
    pub async fn list(&self, skip: usize, take: usize) -> Result<Page<Message>> {
        let key = self.ctx.keys().dead_letter();
        let total = self.ctx.gateway().llen(&key).await?;
        let Some((start, stop)) = page_range(skip, take, total) else {
            return Ok(Page { items: Vec::new(), total });
        };

        let payloads = self.ctx.gateway().lrange(&key, start, stop).await?;
        let items = payloads
            .iter()
            .filter_map(|payload| match Message::from_json(payload) {
                Ok(message) => Some(message),
                Err(e) => {
                    warn!(error = %e, "Skipping malformed dead-lettered payload");
                    None
                }
            })
            .collect();
        Ok(Page { items, total })
    }

    async fn find(&self, id: Uuid) -> Result<Option<(String, Message)>> {
        let key = self.ctx.keys().dead_letter();
        let mut start = 0;
        loop {
            let chunk = self.ctx.gateway().lrange(&key, start, start + SCAN_CHUNK - 1).await?;
            if chunk.is_empty() {
                return Ok(None);
            }
            for payload in chunk {
                if let Ok(message) = Message::from_json(&payload) {
                    if message.id() == id {
                        return Ok(Some((payload, message)));
                    }
                }
            }
            start += SCAN_CHUNK;
        }
    }

    /// Move a message back to the ready queue with its attempts reset.
    /// Returns false when no such message is dead-lettered.
    pub async fn requeue(&self, id: Uuid) -> Result<bool> {
        let Some((payload, message)) = self.find(id).await? else {
            return Ok(false);
        };

        let keys = self.ctx.keys();
        let call = ScriptCall::new(QueueScript::TransferList)
            .key(keys.dead_letter())
            .key(keys.ready())
            .key(keys.stats())
            .arg(payload)
            .arg(message.with_attempts_reset().to_json()?)
            .arg(StatField::Requeued.as_ref());
        let moved = self.ctx.gateway().eval(call).await?.applied()?;
        if moved {
            info!(queue = %self.ctx.queue(), message_id = %id, "Dead-lettered message requeued");
        }
        Ok(moved)
    }

    pub async fn delete(&self, id: Uuid) -> Result<bool> {
        let Some((payload, _)) = self.find(id).await? else {
            return Ok(false);
        };
        let removed = self
            .ctx
            .gateway()
            .lrem(&self.ctx.keys().dead_letter(), 1, &payload)
            .await?;
        if removed > 0 {
            info!(queue = %self.ctx.queue(), message_id = %id, "Dead-lettered message deleted");
        }
        Ok(removed > 0)
    }

    /// Drop every dead-lettered message. Returns how many there were.
    pub async fn purge(&self) -> Result<usize> {
        let key = self.ctx.keys().dead_letter();
        let count = self.ctx.gateway().llen(&key).await?;
        self.ctx.gateway().del(&key).await?;
        info!(queue = %self.ctx.queue(), count, "Dead-letter list purged");
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{Gateway, MemoryGateway};
    use crate::keys::QueueName;
    use serde_json::json;
    use std::sync::Arc;

    async fn dlq_with(messages: &[Message]) -> DeadLetterQueue {
        let ctx = QueueContext::new(QueueName::in_default("dlq").unwrap(), Arc::new(MemoryGateway::new()));
        for message in messages {
            ctx.gateway()
                .lpush(&ctx.keys().dead_letter(), &message.to_json().unwrap())
                .await
                .unwrap();
        }
        DeadLetterQueue::new(ctx)
    }

    #[tokio::test]
    async fn test_list_pages_with_total() {
        let messages: Vec<_> = (0..3).map(|n| Message::new(json!(n))).collect();
        let dlq = dlq_with(&messages).await;

        let page = dlq.list(0, 2).await.unwrap();
        assert_eq!(page.total, 3);
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.items[0].id(), messages[2].id());
        assert!(dlq.list(3, 2).await.unwrap().items.is_empty());
    }

    #[tokio::test]
    async fn test_list_with_huge_take_is_clamped() {
        let messages: Vec<_> = (0..3).map(|n| Message::new(json!(n))).collect();
        let dlq = dlq_with(&messages).await;

        let page = dlq.list(usize::MAX - 1, usize::MAX).await.unwrap();
        assert!(page.items.is_empty());
        assert_eq!(dlq.list(1, usize::MAX).await.unwrap().items.len(), 2);
    }

    #[tokio::test]
    async fn test_requeue_resets_attempts() {
        let message = Message::new(json!("dead")).with_failed_attempt().with_failed_attempt();
        let dlq = dlq_with(&[message.clone()]).await;

        assert!(dlq.requeue(message.id()).await.unwrap());
        assert!(!dlq.requeue(message.id()).await.unwrap());
        assert_eq!(dlq.count().await.unwrap(), 0);

        let ready = dlq.ctx.gateway().lrange(&dlq.ctx.keys().ready(), 0, -1).await.unwrap();
        let requeued = Message::from_json(&ready[0]).unwrap();
        assert_eq!(requeued.id(), message.id());
        assert_eq!(requeued.attempts(), 0);
    }

    #[tokio::test]
    async fn test_delete_and_purge() {
        let messages: Vec<_> = (0..3).map(|n| Message::new(json!(n))).collect();
        let dlq = dlq_with(&messages).await;

        assert!(dlq.delete(messages[1].id()).await.unwrap());
        assert!(!dlq.delete(Uuid::new_v4()).await.unwrap());
        assert_eq!(dlq.purge().await.unwrap(), 2);
        assert_eq!(dlq.count().await.unwrap(), 0);
    }
}
