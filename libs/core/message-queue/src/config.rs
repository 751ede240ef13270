//! Consumer, scheduler and garbage collector configuration
//!
//! Every setting has a default and can be overridden through `with_*`
//! builders or `MQ_*` environment variables via [`FromEnv`].

use crate::keys::{DEFAULT_NAMESPACE, QueueName};
use core_config::{ConfigError, FromEnv, env_duration_ms, env_optional, env_or_default, env_parse, env_required};
use std::time::Duration;

/// How the retry delay grows with the number of failed attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryBackoff {
    /// Same delay before every retry
    Fixed,
    /// Delay doubles with each attempt, capped at `max`
    Exponential { max: Duration },
}

/// Retry/dead-letter decision parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// A message is dead-lettered once `attempts >= threshold`
    pub threshold: u32,
    /// Base delay before redelivery; zero requeues immediately
    pub delay: Duration,
    pub backoff: RetryBackoff,
}

impl RetryPolicy {
    /// Delay before redelivery after `attempts` failed deliveries (1-based)
    pub fn delay_for(&self, attempts: u32) -> Duration {
        match self.backoff {
            RetryBackoff::Fixed => self.delay,
            RetryBackoff::Exponential { max } => {
                let factor = 2u32.saturating_pow(attempts.saturating_sub(1));
                self.delay.saturating_mul(factor).min(max)
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            threshold: 3,
            delay: Duration::from_secs(60),
            backoff: RetryBackoff::Fixed,
        }
    }
}

/// Scheduler promotion loop settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Time between promotion cycles
    pub promotion_interval: Duration,
    /// Maximum due entries promoted per cycle
    pub batch_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            promotion_interval: Duration::from_millis(1000),
            batch_size: 100,
        }
    }
}

impl FromEnv for SchedulerConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            promotion_interval: env_duration_ms("MQ_PROMOTION_INTERVAL_MS", defaults.promotion_interval)?,
            batch_size: env_parse("MQ_PROMOTION_BATCH_SIZE", defaults.batch_size)?,
        })
    }
}

/// Garbage collector settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcConfig {
    /// Time between collection cycles
    pub interval: Duration,
    /// A consumer silent for longer than this is considered crashed.
    /// Must sit well above the heartbeat interval.
    pub heartbeat_threshold: Duration,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            heartbeat_threshold: Duration::from_secs(15),
        }
    }
}

impl FromEnv for GcConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            interval: env_duration_ms("MQ_GC_INTERVAL_MS", defaults.interval)?,
            heartbeat_threshold: env_duration_ms("MQ_HEARTBEAT_THRESHOLD_MS", defaults.heartbeat_threshold)?,
        })
    }
}

/// Configuration for a consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerConfig {
    /// Default handler timeout when the message carries none
    pub consume_timeout: Duration,

    /// Default TTL when the message carries none
    pub message_ttl: Option<Duration>,

    /// Default retry policy; per-message threshold and delay take precedence
    pub retry: RetryPolicy,

    /// Maximum messages processed at once
    pub concurrency: usize,

    /// How long one blocking pop waits for a message
    pub block_timeout: Duration,

    /// Time between heartbeats and stats publications
    pub heartbeat_interval: Duration,

    /// Run a promotion loop inside the consumer
    pub scheduler: Option<SchedulerConfig>,

    /// Run a garbage collector inside the consumer
    pub gc: Option<GcConfig>,
}

impl ConsumerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_consume_timeout(mut self, timeout: Duration) -> Self {
        self.consume_timeout = timeout;
        self
    }

    pub fn with_message_ttl(mut self, ttl: Duration) -> Self {
        self.message_ttl = Some(ttl);
        self
    }

    pub fn with_retry_threshold(mut self, threshold: u32) -> Self {
        self.retry.threshold = threshold.max(1);
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry.delay = delay;
        self
    }

    pub fn with_retry_backoff(mut self, backoff: RetryBackoff) -> Self {
        self.retry.backoff = backoff;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_block_timeout(mut self, timeout: Duration) -> Self {
        self.block_timeout = timeout;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// `None` disables the embedded promotion loop
    pub fn with_scheduler(mut self, scheduler: Option<SchedulerConfig>) -> Self {
        self.scheduler = scheduler;
        self
    }

    /// `None` disables the embedded garbage collector
    pub fn with_gc(mut self, gc: Option<GcConfig>) -> Self {
        self.gc = gc;
        self
    }
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            consume_timeout: Duration::from_secs(60),
            message_ttl: None,
            retry: RetryPolicy::default(),
            concurrency: 1,
            block_timeout: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(1),
            scheduler: Some(SchedulerConfig::default()),
            gc: Some(GcConfig::default()),
        }
    }
}

impl FromEnv for ConsumerConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let retry_delay = env_duration_ms("MQ_RETRY_DELAY_MS", defaults.retry.delay)?;
        let backoff = match env_or_default("MQ_RETRY_BACKOFF", "fixed").to_lowercase().as_str() {
            "fixed" => RetryBackoff::Fixed,
            "exponential" => RetryBackoff::Exponential {
                max: env_duration_ms("MQ_RETRY_MAX_DELAY_MS", Duration::from_secs(3600))?,
            },
            other => {
                return Err(ConfigError::ParseError {
                    key: "MQ_RETRY_BACKOFF".to_string(),
                    details: format!("expected 'fixed' or 'exponential', got '{}'", other),
                });
            }
        };

        let config = Self {
            consume_timeout: env_duration_ms("MQ_CONSUME_TIMEOUT_MS", defaults.consume_timeout)?,
            message_ttl: env_optional::<u64>("MQ_MESSAGE_TTL_MS")?.map(Duration::from_millis),
            retry: RetryPolicy {
                threshold: env_parse("MQ_RETRY_THRESHOLD", defaults.retry.threshold)?.max(1),
                delay: retry_delay,
                backoff,
            },
            concurrency: env_parse("MQ_CONCURRENCY", defaults.concurrency)?.max(1),
            block_timeout: env_duration_ms("MQ_BLOCK_TIMEOUT_MS", defaults.block_timeout)?,
            heartbeat_interval: env_duration_ms("MQ_HEARTBEAT_INTERVAL_MS", defaults.heartbeat_interval)?,
            scheduler: env_parse("MQ_RUN_SCHEDULER", true)?
                .then(SchedulerConfig::from_env)
                .transpose()?,
            gc: env_parse("MQ_RUN_GC", true)?.then(GcConfig::from_env).transpose()?,
        };
        Ok(config)
    }
}

/// Which queue an application works on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSettings {
    pub namespace: String,
    pub queue: String,
}

impl QueueSettings {
    pub fn queue_name(&self) -> crate::error::Result<QueueName> {
        QueueName::new(&self.namespace, &self.queue)
    }
}

impl FromEnv for QueueSettings {
    /// Requires MQ_QUEUE; MQ_NAMESPACE defaults to `default`
    fn from_env() -> Result<Self, ConfigError> {
        let settings = Self {
            namespace: env_or_default("MQ_NAMESPACE", DEFAULT_NAMESPACE),
            queue: env_required("MQ_QUEUE")?,
        };
        settings.queue_name().map_err(|e| ConfigError::ParseError {
            key: "MQ_QUEUE".to_string(),
            details: e.to_string(),
        })?;
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ConsumerConfig::default();
        assert_eq!(config.consume_timeout, Duration::from_secs(60));
        assert_eq!(config.retry.threshold, 3);
        assert_eq!(config.retry.delay, Duration::from_secs(60));
        assert_eq!(config.concurrency, 1);
        assert_eq!(config.scheduler.unwrap().promotion_interval, Duration::from_millis(1000));
        assert_eq!(config.gc.unwrap().interval, Duration::from_secs(5));
        assert_eq!(config.gc.unwrap().heartbeat_threshold, Duration::from_secs(15));
    }

    #[test]
    fn test_builder_pattern() {
        let config = ConsumerConfig::new()
            .with_concurrency(0)
            .with_retry_threshold(5)
            .with_retry_delay(Duration::ZERO)
            .with_gc(None);

        assert_eq!(config.concurrency, 1);
        assert_eq!(config.retry.threshold, 5);
        assert_eq!(config.retry.delay, Duration::ZERO);
        assert!(config.gc.is_none());
    }

    #[test]
    fn test_fixed_backoff() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_secs(60));
        assert_eq!(policy.delay_for(5), Duration::from_secs(60));
    }

    #[test]
    fn test_exponential_backoff_caps() {
        let policy = RetryPolicy {
            threshold: 10,
            delay: Duration::from_secs(1),
            backoff: RetryBackoff::Exponential {
                max: Duration::from_secs(30),
            },
        };
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for(9), Duration::from_secs(30));
    }

    #[test]
    fn test_consumer_config_from_env() {
        temp_env::with_vars(
            [
                ("MQ_CONCURRENCY", Some("8")),
                ("MQ_RETRY_THRESHOLD", Some("5")),
                ("MQ_RETRY_DELAY_MS", Some("0")),
                ("MQ_MESSAGE_TTL_MS", Some("30000")),
                ("MQ_RUN_GC", Some("false")),
                ("MQ_RETRY_BACKOFF", None),
            ],
            || {
                let config = ConsumerConfig::from_env().unwrap();
                assert_eq!(config.concurrency, 8);
                assert_eq!(config.retry.threshold, 5);
                assert_eq!(config.retry.delay, Duration::ZERO);
                assert_eq!(config.message_ttl, Some(Duration::from_secs(30)));
                assert!(config.gc.is_none());
                assert!(config.scheduler.is_some());
            },
        );
    }

    #[test]
    fn test_consumer_config_rejects_unknown_backoff() {
        temp_env::with_var("MQ_RETRY_BACKOFF", Some("linear"), || {
            let err = ConsumerConfig::from_env().unwrap_err();
            assert!(err.to_string().contains("MQ_RETRY_BACKOFF"));
        });
    }

    #[test]
    fn test_queue_settings_from_env() {
        temp_env::with_vars([("MQ_QUEUE", Some("Orders")), ("MQ_NAMESPACE", None)], || {
            let settings = QueueSettings::from_env().unwrap();
            let queue = settings.queue_name().unwrap();
            assert_eq!(queue.namespace(), "default");
            assert_eq!(queue.name(), "orders");
        });
    }

    #[test]
    fn test_queue_settings_rejects_invalid_name() {
        temp_env::with_var("MQ_QUEUE", Some("orders:eu"), || {
            assert!(QueueSettings::from_env().is_err());
        });
    }
}
