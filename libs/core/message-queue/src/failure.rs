//! Retry/dead-letter decision shared by the consumer and the garbage collector.

use crate::config::RetryPolicy;
use crate::context::QueueContext;
use crate::error::Result;
use crate::gateway::ScriptCall;
use crate::keys::StatField;
use crate::message::Message;
use crate::scripts::QueueScript;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Back on the ready queue, or in the scheduler index when `delay > 0`
    Requeued { delay: Duration },
    /// Retries exhausted
    DeadLettered,
    /// The payload was no longer in the source list
    Skipped,
}

/// Record one failed delivery of `message` (stored as `payload` in `source`)
/// and atomically move it to its next place.
pub async fn handle_failure(
    ctx: &QueueContext,
    source: &str,
    payload: &str,
    message: &Message,
    policy: &RetryPolicy,
) -> Result<FailureOutcome> {
    let failed = message.with_failed_attempt();
    let threshold = message.retry_threshold().unwrap_or(policy.threshold).max(1);
    let keys = ctx.keys();
    let updated = failed.to_json()?;

    if failed.attempts() >= threshold {
        let call = ScriptCall::new(QueueScript::TransferList)
            .key(source)
            .key(keys.dead_letter())
            .key(keys.stats())
            .arg(payload)
            .arg(updated)
            .arg(StatField::DeadLettered.as_ref());
        return Ok(if ctx.gateway().eval(call).await?.applied()? {
            FailureOutcome::DeadLettered
        } else {
            FailureOutcome::Skipped
        });
    }

    let delay = message
        .retry_delay()
        .unwrap_or_else(|| policy.delay_for(failed.attempts()));

    let call = if delay.is_zero() {
        ScriptCall::new(QueueScript::TransferList)
            .key(source)
            .key(keys.ready())
            .key(keys.stats())
            .arg(payload)
            .arg(updated)
            .arg(StatField::Requeued.as_ref())
    } else {
        ScriptCall::new(QueueScript::TransferScheduled)
            .key(source)
            .key(keys.scheduled())
            .key(keys.stats())
            .arg(payload)
            .arg(updated)
            .arg(ctx.now_ms() + delay.as_millis() as i64)
            .arg(StatField::Requeued.as_ref())
    };

    Ok(if ctx.gateway().eval(call).await?.applied()? {
        FailureOutcome::Requeued { delay }
    } else {
        FailureOutcome::Skipped
    })
}
