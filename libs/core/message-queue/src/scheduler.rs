//! Time-ordered index of delayed and recurring messages.
//!
//! Entries live in a sorted set scored by due time (epoch ms). Promotion
//! removes a due entry and pushes its delivery to the ready queue in one
//! script; recurring definitions are re-added with their next due time in the
//! same script. A member another promoter already took is skipped, so any
//! number of promoters can run against one queue.

use crate::context::QueueContext;
use crate::error::{QueueError, Result};
use crate::events::{EventBus, QueueEvent};
use crate::gateway::ScriptCall;
use crate::keys::StatField;
use crate::message::Message;
use crate::metrics::QueueMetrics;
use crate::scripts::QueueScript;
use serde::Serialize;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const SCAN_CHUNK: isize = 100;

/// Outcome of one promotion cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PromotionReport {
    pub promoted: usize,
    pub expired: usize,
    /// Already taken by a concurrent promoter
    pub skipped: usize,
    /// Undecodable entries removed from the index
    pub malformed: usize,
}

impl PromotionReport {
    pub fn total(&self) -> usize {
        self.promoted + self.expired + self.skipped + self.malformed
    }
}

/// An index entry with its due time
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledMessage {
    #[serde(flatten)]
    pub message: Message,
    pub scheduled_at: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
}

/// Inclusive index range for a page, clamped to the collection. `None` when
/// the page is empty.
pub(crate) fn page_range(skip: usize, take: usize, total: usize) -> Option<(isize, isize)> {
    if take == 0 || skip >= total {
        return None;
    }
    let stop = skip.saturating_add(take - 1).min(total - 1);
    Some((skip as isize, stop as isize))
}

#[derive(Clone)]
pub struct Scheduler {
    ctx: QueueContext,
    events: Option<EventBus>,
    metrics: QueueMetrics,
    batch_size: usize,
}

impl Scheduler {
    pub fn new(ctx: QueueContext) -> Self {
        let metrics = QueueMetrics::new(ctx.queue().to_string());
        Self {
            ctx,
            events: None,
            metrics,
            batch_size: 100,
        }
    }

    /// Emit promotion events on this bus
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    fn emit(&self, event: QueueEvent) {
        if let Some(events) = &self.events {
            events.emit(event);
        }
    }

    /// Add a scheduled message to the index. Returns its due time.
    pub async fn schedule(&self, message: &Message) -> Result<i64> {
        let (entry, due) = message
            .first_due(self.ctx.now_ms())?
            .ok_or_else(|| QueueError::InvalidSchedule(format!("message {} has no scheduling", message.id())))?;

        let keys = self.ctx.keys();
        let call = ScriptCall::new(QueueScript::Schedule)
            .key(keys.scheduled())
            .key(keys.stats())
            .arg(entry.to_json()?)
            .arg(due)
            .arg(StatField::Scheduled.as_ref());
        self.ctx.gateway().eval(call).await?;

        debug!(queue = %self.ctx.queue(), message_id = %message.id(), due, "Message scheduled");
        Ok(due)
    }

    /// Promote every entry due now, up to the batch size
    pub async fn promote_due(&self) -> Result<PromotionReport> {
        let now = self.ctx.now_ms();
        let keys = self.ctx.keys();
        let due = self
            .ctx
            .gateway()
            .zrange_by_score(&keys.scheduled(), 0, now, 0, self.batch_size)
            .await?;

        let mut report = PromotionReport::default();
        for (member, score) in due {
            let message = match Message::from_json(&member) {
                Ok(message) => message,
                Err(e) => {
                    error!(queue = %self.ctx.queue(), error = %e, "Dropping malformed scheduled entry");
                    self.ctx.gateway().zrem(&keys.scheduled(), &member).await?;
                    self.metrics.message_malformed();
                    report.malformed += 1;
                    continue;
                }
            };

            if !message.is_recurring() && message.is_expired(now) {
                let call = promote_call(self.ctx.keys(), &member, score, "", None, StatField::Expired);
                if self.ctx.gateway().eval(call).await?.applied()? {
                    debug!(message_id = %message.id(), "Scheduled message expired before promotion");
                    self.metrics.message_expired();
                    self.emit(QueueEvent::MessageExpired { message_id: message.id() });
                    report.expired += 1;
                } else {
                    report.skipped += 1;
                }
                continue;
            }

            let promotion = match message.promotion(score, now) {
                Ok(promotion) => promotion,
                Err(e) => {
                    error!(message_id = %message.id(), error = %e, "Dropping unschedulable entry");
                    self.ctx.gateway().zrem(&keys.scheduled(), &member).await?;
                    self.metrics.message_malformed();
                    report.malformed += 1;
                    continue;
                }
            };

            let delivery = promotion.delivery.to_json()?;
            let next = match &promotion.next {
                Some((entry, at)) => Some((entry.to_json()?, *at)),
                None => None,
            };
            let call = promote_call(self.ctx.keys(), &member, score, &delivery, next, StatField::Promoted);

            if self.ctx.gateway().eval(call).await?.applied()? {
                self.emit(QueueEvent::MessagePromoted {
                    message_id: promotion.delivery.id(),
                });
                report.promoted += 1;
            } else {
                report.skipped += 1;
            }
        }

        if report.promoted > 0 {
            self.metrics.messages_promoted(report.promoted as u64);
        }
        Ok(report)
    }

    /// Remove a scheduled message by id. Scans the whole index.
    pub async fn delete_scheduled(&self, id: Uuid) -> Result<bool> {
        let key = self.ctx.keys().scheduled();
        let mut start = 0;
        loop {
            let chunk = self.ctx.gateway().zrange(&key, start, start + SCAN_CHUNK - 1).await?;
            if chunk.is_empty() {
                return Ok(false);
            }
            for (member, _) in &chunk {
                if Message::from_json(member).is_ok_and(|m| m.id() == id) {
                    let removed = self.ctx.gateway().zrem(&key, member).await?;
                    if removed {
                        info!(queue = %self.ctx.queue(), message_id = %id, "Scheduled message deleted");
                    }
                    return Ok(removed);
                }
            }
            start += SCAN_CHUNK;
        }
    }

    /// Page of the index ordered by due time, oldest first
    pub async fn list_scheduled(&self, skip: usize, take: usize) -> Result<Page<ScheduledMessage>> {
        let key = self.ctx.keys().scheduled();
        let total = self.ctx.gateway().zcard(&key).await?;
        let Some((start, stop)) = page_range(skip, take, total) else {
            return Ok(Page { items: Vec::new(), total });
        };

        let entries = self.ctx.gateway().zrange(&key, start, stop).await?;
        let items = entries
            .into_iter()
            .filter_map(|(member, scheduled_at)| match Message::from_json(&member) {
                Ok(message) => Some(ScheduledMessage { message, scheduled_at }),
                Err(e) => {
                    warn!(error = %e, "Skipping malformed scheduled entry in listing");
                    None
                }
            })
            .collect();
        Ok(Page { items, total })
    }

    pub async fn count_scheduled(&self) -> Result<usize> {
        Ok(self.ctx.gateway().zcard(&self.ctx.keys().scheduled()).await?)
    }

    /// Promotion loop. Errors are logged and the cycle retried on the next
    /// tick; only shutdown ends the loop.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(
            queue = %self.ctx.queue(),
            interval_ms = interval.as_millis() as u64,
            "Starting scheduler"
        );

        let mut ticker = tokio::time::interval(interval);
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
                    // A full batch means more may be due right now
                    loop {
                        match self.promote_due().await {
                            Ok(report) => {
                                if report.total() > 0 {
                                    debug!(
                                        promoted = report.promoted,
                                        expired = report.expired,
                                        skipped = report.skipped,
                                        malformed = report.malformed,
                                        "Promotion cycle"
                                    );
                                }
                                if report.total() < self.batch_size {
                                    break;
                                }
                            }
                            Err(e) => {
                                warn!(error = %e, "Promotion cycle failed, retrying next interval");
                                break;
                            }
                        }
                    }
                }
            }
        }

        info!(queue = %self.ctx.queue(), "Scheduler stopped");
    }
}

fn promote_call(
    keys: &crate::keys::QueueKeys,
    member: &str,
    score: i64,
    delivery: &str,
    next: Option<(String, i64)>,
    field: StatField,
) -> ScriptCall {
    let (next_member, next_score) = next.unwrap_or_default();
    ScriptCall::new(QueueScript::Promote)
        .key(keys.scheduled())
        .key(keys.ready())
        .key(keys.stats())
        .arg(member)
        .arg(score)
        .arg(delivery)
        .arg(next_member)
        .arg(next_score)
        .arg(field.as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::gateway::{Gateway, MemoryGateway};
    use crate::keys::QueueName;
    use serde_json::json;
    use std::sync::Arc;

    const START: i64 = 1_704_067_200_000;

    fn scheduler() -> (Scheduler, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(START));
        let ctx = QueueContext::new(QueueName::in_default("scheduled").unwrap(), Arc::new(MemoryGateway::new()))
            .with_clock(clock.clone());
        (Scheduler::new(ctx), clock)
    }

    #[tokio::test]
    async fn test_schedule_requires_scheduling() {
        let (scheduler, _) = scheduler();
        let err = scheduler.schedule(&Message::new(json!(1))).await.unwrap_err();
        assert!(matches!(err, QueueError::InvalidSchedule(_)));
    }

    #[tokio::test]
    async fn test_not_promoted_before_due() {
        let (scheduler, clock) = scheduler();
        scheduler
            .schedule(&Message::new(json!(1)).with_delay(Duration::from_secs(10)))
            .await
            .unwrap();

        clock.advance(Duration::from_millis(9_999));
        assert_eq!(scheduler.promote_due().await.unwrap().promoted, 0);

        clock.advance(Duration::from_millis(1));
        assert_eq!(scheduler.promote_due().await.unwrap().promoted, 1);
        assert_eq!(scheduler.count_scheduled().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_expired_entry_is_dropped() {
        let (scheduler, clock) = scheduler();
        let message = Message::new(json!(1))
            .with_delay(Duration::from_secs(10))
            .with_ttl(Duration::from_millis(1));
        scheduler.schedule(&message).await.unwrap();

        clock.advance(Duration::from_secs(3600));
        let report = scheduler.promote_due().await.unwrap();
        assert_eq!(report.expired, 1);
        assert_eq!(report.promoted, 0);
        assert_eq!(scheduler.ctx.gateway().llen(&scheduler.ctx.keys().ready()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_stale_read_of_cron_entry_is_not_promoted_again() {
        let (scheduler, clock) = scheduler();
        let message = Message::new(json!("tick")).with_cron("0 * * * * *").unwrap();
        let due = scheduler.schedule(&message).await.unwrap();
        clock.set(due);

        // A second promoter read the batch before this one re-indexed the entry
        let key = scheduler.ctx.keys().scheduled();
        let stale = scheduler.ctx.gateway().zrange_by_score(&key, 0, due, 0, 10).await.unwrap();
        assert_eq!(scheduler.promote_due().await.unwrap().promoted, 1);

        let (member, score) = &stale[0];
        let promotion = Message::from_json(member).unwrap().promotion(*score, due).unwrap();
        let next = promotion.next.map(|(entry, at)| (entry.to_json().unwrap(), at));
        let call = promote_call(
            scheduler.ctx.keys(),
            member,
            *score,
            &promotion.delivery.to_json().unwrap(),
            next,
            StatField::Promoted,
        );
        assert!(!scheduler.ctx.gateway().eval(call).await.unwrap().applied().unwrap());

        assert_eq!(scheduler.ctx.gateway().llen(&scheduler.ctx.keys().ready()).await.unwrap(), 1);
        let index = scheduler.ctx.gateway().zrange(&key, 0, -1).await.unwrap();
        assert_eq!(index.len(), 1);
        assert_eq!(index[0].1, due + 60_000);
    }

    #[tokio::test]
    async fn test_repeat_keeps_definition_until_exhausted() {
        let (scheduler, clock) = scheduler();
        let message = Message::new(json!("tick"))
            .with_repeat(2, Duration::from_secs(1))
            .unwrap();
        scheduler.schedule(&message).await.unwrap();

        clock.advance(Duration::from_secs(1));
        assert_eq!(scheduler.promote_due().await.unwrap().promoted, 1);
        assert_eq!(scheduler.count_scheduled().await.unwrap(), 1);

        clock.advance(Duration::from_secs(1));
        assert_eq!(scheduler.promote_due().await.unwrap().promoted, 1);
        assert_eq!(scheduler.count_scheduled().await.unwrap(), 0);
        assert_eq!(scheduler.ctx.gateway().llen(&scheduler.ctx.keys().ready()).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_malformed_entry_is_removed() {
        let (scheduler, _) = scheduler();
        let key = scheduler.ctx.keys().scheduled();
        scheduler.ctx.gateway().zadd(&key, "{not json", START - 1).await.unwrap();

        let report = scheduler.promote_due().await.unwrap();
        assert_eq!(report.malformed, 1);
        assert_eq!(scheduler.count_scheduled().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_list_pages_by_due_time() {
        let (scheduler, _) = scheduler();
        let late = Message::new(json!("late")).with_delay(Duration::from_secs(30));
        let early = Message::new(json!("early")).with_delay(Duration::from_secs(10));
        scheduler.schedule(&late).await.unwrap();
        scheduler.schedule(&early).await.unwrap();

        let page = scheduler.list_scheduled(0, 1).await.unwrap();
        assert_eq!(page.total, 2);
        assert_eq!(page.items[0].message.id(), early.id());
        assert_eq!(page.items[0].scheduled_at, START + 10_000);

        let page = scheduler.list_scheduled(1, 10).await.unwrap();
        assert_eq!(page.items[0].message.id(), late.id());
        assert!(scheduler.list_scheduled(5, 10).await.unwrap().items.is_empty());
    }

    #[test]
    fn test_page_range_is_clamped() {
        assert_eq!(page_range(0, 10, 3), Some((0, 2)));
        assert_eq!(page_range(1, 1, 3), Some((1, 1)));
        assert_eq!(page_range(2, usize::MAX, 3), Some((2, 2)));
        assert_eq!(page_range(3, 1, 3), None);
        assert_eq!(page_range(0, 0, 3), None);
    }

    #[tokio::test]
    async fn test_list_with_huge_take_returns_everything() {
        let (scheduler, _) = scheduler();
        for n in 0..3 {
            scheduler
                .schedule(&Message::new(json!(n)).with_delay(Duration::from_secs(10)))
                .await
                .unwrap();
        }
        let page = scheduler.list_scheduled(1, usize::MAX).await.unwrap();
        assert_eq!(page.total, 3);
        assert_eq!(page.items.len(), 2);
    }

    #[tokio::test]
    async fn test_delete_scheduled() {
        let (scheduler, _) = scheduler();
        let message = Message::new(json!(1)).with_delay(Duration::from_secs(10));
        scheduler.schedule(&message).await.unwrap();

        assert!(!scheduler.delete_scheduled(Uuid::new_v4()).await.unwrap());
        assert!(scheduler.delete_scheduled(message.id()).await.unwrap());
        assert_eq!(scheduler.count_scheduled().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (scheduler, _) = scheduler();
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { scheduler.run(Duration::from_millis(5), rx).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
