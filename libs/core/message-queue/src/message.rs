//! Message value object and scheduling rules.
//!
//! A message is serialized as camelCase JSON; its id is stored under `uuid`.
//! Durations are kept in milliseconds on the wire.

use crate::error::{QueueError, Result};
use chrono::{DateTime, TimeZone, Utc};
use cron::Schedule;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// How a message is delivered over time. Exactly one mode applies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Scheduling {
    /// Deliver once after `delay` ms
    Delay { delay: u64 },
    /// Deliver at every occurrence of a cron expression (seconds field first)
    Cron { expression: String },
    /// Deliver `repeat` times, `period` ms apart
    Repeat { repeat: u32, period: u64 },
    /// At every cron occurrence deliver a burst of `repeat` messages, `period` ms apart
    CronRepeat {
        expression: String,
        repeat: u32,
        period: u64,
    },
}

impl Scheduling {
    /// Whether the definition stays in the index after a delivery
    pub fn is_recurring(&self) -> bool {
        !matches!(self, Scheduling::Delay { .. })
    }
}

/// Bookkeeping for repeat and cron-repeat cycles
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleProgress {
    /// Deliveries made in the current cycle
    pub delivered: u32,
    /// Start of the current cycle (epoch ms)
    pub anchor: Option<i64>,
}

impl ScheduleProgress {
    fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(rename = "uuid")]
    id: Uuid,
    #[serde(default)]
    body: Value,
    created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ttl: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    retry_threshold: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    retry_delay: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    consume_timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    scheduling: Option<Scheduling>,
    #[serde(default, skip_serializing_if = "ScheduleProgress::is_empty")]
    schedule_progress: ScheduleProgress,
    #[serde(default)]
    attempts: u32,
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Message {}

impl Message {
    /// New message with a fresh id, created now
    pub fn new(body: impl Into<Value>) -> Self {
        Self {
            id: Uuid::new_v4(),
            body: body.into(),
            created_at: Utc::now().timestamp_millis(),
            ttl: None,
            retry_threshold: None,
            retry_delay: None,
            consume_timeout: None,
            scheduling: None,
            schedule_progress: ScheduleProgress::default(),
            attempts: 0,
        }
    }

    /// New message from any serializable body
    pub fn from_body<T: Serialize>(body: &T) -> Result<Self> {
        Ok(Self::new(serde_json::to_value(body)?))
    }

    /// Creation time in epoch ms. The queue restamps it from its own clock
    /// when it accepts the message, so TTLs and due times share one time base.
    pub fn with_created_at(mut self, created_at_ms: i64) -> Self {
        self.created_at = created_at_ms;
        self
    }

    pub fn with_body(mut self, body: impl Into<Value>) -> Self {
        self.body = body.into();
        self
    }

    /// Discard the message if it is still undelivered `ttl` after creation
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl.as_millis() as u64);
        self
    }

    pub fn with_retry_threshold(mut self, threshold: u32) -> Self {
        self.retry_threshold = Some(threshold);
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = Some(delay.as_millis() as u64);
        self
    }

    pub fn with_consume_timeout(mut self, timeout: Duration) -> Self {
        self.consume_timeout = Some(timeout.as_millis() as u64);
        self
    }

    /// Deliver once after `delay`. Replaces any other scheduling.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.set_scheduling(Scheduling::Delay {
            delay: delay.as_millis() as u64,
        });
        self
    }

    /// Deliver at every occurrence of `expression`. Replaces any other scheduling.
    pub fn with_cron(mut self, expression: &str) -> Result<Self> {
        parse_cron(expression)?;
        self.set_scheduling(Scheduling::Cron {
            expression: expression.to_string(),
        });
        Ok(self)
    }

    /// Deliver `repeat` times, `period` apart. Replaces any other scheduling.
    pub fn with_repeat(mut self, repeat: u32, period: Duration) -> Result<Self> {
        validate_repeat(repeat, period)?;
        self.set_scheduling(Scheduling::Repeat {
            repeat,
            period: period.as_millis() as u64,
        });
        Ok(self)
    }

    /// At every occurrence of `expression`, deliver `repeat` times `period` apart.
    /// Replaces any other scheduling.
    pub fn with_cron_repeat(mut self, expression: &str, repeat: u32, period: Duration) -> Result<Self> {
        parse_cron(expression)?;
        validate_repeat(repeat, period)?;
        self.set_scheduling(Scheduling::CronRepeat {
            expression: expression.to_string(),
            repeat,
            period: period.as_millis() as u64,
        });
        Ok(self)
    }

    fn set_scheduling(&mut self, scheduling: Scheduling) {
        self.scheduling = Some(scheduling);
        self.schedule_progress = ScheduleProgress::default();
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn body(&self) -> &Value {
        &self.body
    }

    /// Decode the body into a concrete type
    pub fn body_as<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.body.clone())?)
    }

    pub fn created_at(&self) -> i64 {
        self.created_at
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.ttl.map(Duration::from_millis)
    }

    pub fn retry_threshold(&self) -> Option<u32> {
        self.retry_threshold
    }

    pub fn retry_delay(&self) -> Option<Duration> {
        self.retry_delay.map(Duration::from_millis)
    }

    pub fn consume_timeout(&self) -> Option<Duration> {
        self.consume_timeout.map(Duration::from_millis)
    }

    pub fn scheduling(&self) -> Option<&Scheduling> {
        self.scheduling.as_ref()
    }

    pub fn schedule_progress(&self) -> ScheduleProgress {
        self.schedule_progress
    }

    pub fn is_scheduled(&self) -> bool {
        self.scheduling.is_some()
    }

    pub fn is_recurring(&self) -> bool {
        self.scheduling.as_ref().is_some_and(Scheduling::is_recurring)
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Copy with one more failed delivery recorded
    pub fn with_failed_attempt(&self) -> Self {
        Self {
            attempts: self.attempts + 1,
            ..self.clone()
        }
    }

    /// Copy with a clean retry history
    pub fn with_attempts_reset(&self) -> Self {
        Self {
            attempts: 0,
            ..self.clone()
        }
    }

    /// Expired when `ttl` has elapsed since creation
    pub fn is_expired(&self, now_ms: i64) -> bool {
        match self.ttl {
            Some(ttl) if ttl > 0 => now_ms - self.created_at >= ttl as i64,
            _ => false,
        }
    }

    /// Like [`Message::is_expired`], falling back to `default_ttl` when the
    /// message carries none
    pub fn is_expired_with(&self, now_ms: i64, default_ttl: Option<Duration>) -> bool {
        match (self.ttl, default_ttl) {
            (Some(ttl), _) if ttl > 0 => now_ms - self.created_at >= ttl as i64,
            (None, Some(ttl)) if !ttl.is_zero() => now_ms - self.created_at >= ttl.as_millis() as i64,
            _ => false,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode and validate a transport payload
    pub fn from_json(payload: &str) -> Result<Self> {
        let message: Message = serde_json::from_str(payload)?;
        match &message.scheduling {
            Some(Scheduling::Cron { expression }) => {
                parse_cron(expression).map_err(|e| QueueError::MalformedMessage(e.to_string()))?;
            }
            Some(Scheduling::CronRepeat {
                expression,
                repeat,
                period,
            }) => {
                parse_cron(expression).map_err(|e| QueueError::MalformedMessage(e.to_string()))?;
                validate_repeat(*repeat, Duration::from_millis(*period))
                    .map_err(|e| QueueError::MalformedMessage(e.to_string()))?;
            }
            Some(Scheduling::Repeat { repeat, period }) => {
                validate_repeat(*repeat, Duration::from_millis(*period))
                    .map_err(|e| QueueError::MalformedMessage(e.to_string()))?;
            }
            _ => {}
        }
        Ok(message)
    }

    /// First due time when the message enters the scheduler, with progress
    /// initialized for repeat cycles. `None` for unscheduled messages.
    pub fn first_due(&self, now_ms: i64) -> Result<Option<(Message, i64)>> {
        let Some(scheduling) = &self.scheduling else {
            return Ok(None);
        };
        let mut entry = self.clone().with_created_at(now_ms);
        let due = match scheduling {
            Scheduling::Delay { delay } => now_ms + *delay as i64,
            Scheduling::Cron { expression } => next_occurrence(expression, now_ms)?,
            Scheduling::Repeat { period, .. } => {
                entry.schedule_progress = ScheduleProgress {
                    delivered: 0,
                    anchor: Some(now_ms),
                };
                now_ms + *period as i64
            }
            Scheduling::CronRepeat { expression, .. } => {
                let start = next_occurrence(expression, now_ms)?;
                entry.schedule_progress = ScheduleProgress {
                    delivered: 0,
                    anchor: Some(start),
                };
                start
            }
        };
        Ok(Some((entry, due)))
    }

    /// What promotion at `due` produces: the message to push to the ready
    /// queue, plus the definition to re-index with its next due time when the
    /// schedule recurs.
    pub fn promotion(&self, due: i64, now_ms: i64) -> Result<Promotion> {
        let Some(scheduling) = &self.scheduling else {
            // Retry entries carry no scheduling and are delivered as they are
            return Ok(Promotion {
                delivery: self.clone(),
                next: None,
            });
        };

        let next = match scheduling {
            Scheduling::Delay { .. } => {
                let mut delivery = self.clone();
                delivery.scheduling = None;
                delivery.schedule_progress = ScheduleProgress::default();
                return Ok(Promotion { delivery, next: None });
            }
            Scheduling::Cron { expression } => {
                let at = next_occurrence(expression, now_ms.max(due))?;
                Some((self.clone(), at))
            }
            Scheduling::Repeat { repeat, period } => {
                let delivered = self.schedule_progress.delivered + 1;
                let anchor = self.schedule_progress.anchor.unwrap_or(due - *period as i64);
                (delivered < *repeat).then(|| {
                    let mut next = self.clone();
                    next.schedule_progress = ScheduleProgress {
                        delivered,
                        anchor: Some(anchor),
                    };
                    (next, anchor + *period as i64 * (delivered as i64 + 1))
                })
            }
            Scheduling::CronRepeat {
                expression,
                repeat,
                period,
            } => {
                let delivered = self.schedule_progress.delivered + 1;
                let anchor = self.schedule_progress.anchor.unwrap_or(due);
                let mut next = self.clone();
                if delivered < *repeat {
                    next.schedule_progress = ScheduleProgress {
                        delivered,
                        anchor: Some(anchor),
                    };
                    Some((next, anchor + *period as i64 * delivered as i64))
                } else {
                    let start = next_occurrence(expression, now_ms.max(due))?;
                    next.schedule_progress = ScheduleProgress {
                        delivered: 0,
                        anchor: Some(start),
                    };
                    Some((next, start))
                }
            }
        };

        Ok(Promotion {
            delivery: self.delivery_instance(now_ms),
            next,
        })
    }

    /// Fresh, unscheduled copy of a recurring definition
    fn delivery_instance(&self, now_ms: i64) -> Message {
        Message {
            id: Uuid::new_v4(),
            body: self.body.clone(),
            created_at: now_ms,
            ttl: self.ttl,
            retry_threshold: self.retry_threshold,
            retry_delay: self.retry_delay,
            consume_timeout: self.consume_timeout,
            scheduling: None,
            schedule_progress: ScheduleProgress::default(),
            attempts: 0,
        }
    }
}

/// Result of promoting one scheduler entry
#[derive(Debug, Clone)]
pub struct Promotion {
    pub delivery: Message,
    pub next: Option<(Message, i64)>,
}

fn validate_repeat(repeat: u32, period: Duration) -> Result<()> {
    if repeat == 0 {
        return Err(QueueError::InvalidSchedule("repeat must be at least 1".into()));
    }
    if period.is_zero() {
        return Err(QueueError::InvalidSchedule("repeat period must be positive".into()));
    }
    Ok(())
}

fn parse_cron(expression: &str) -> Result<Schedule> {
    Schedule::from_str(expression)
        .map_err(|e| QueueError::InvalidSchedule(format!("'{}': {}", expression, e)))
}

/// Next occurrence strictly after `after_ms`
fn next_occurrence(expression: &str, after_ms: i64) -> Result<i64> {
    let schedule = parse_cron(expression)?;
    let after: DateTime<Utc> = Utc
        .timestamp_millis_opt(after_ms)
        .single()
        .ok_or_else(|| QueueError::InvalidSchedule(format!("timestamp {} out of range", after_ms)))?;
    schedule
        .after(&after)
        .next()
        .map(|at| at.timestamp_millis())
        .ok_or_else(|| QueueError::InvalidSchedule(format!("'{}' has no future occurrence", expression)))
}
