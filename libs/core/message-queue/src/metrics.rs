//! Prometheus metrics for queue instances

use crate::error::{QueueError, Result};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use std::time::Duration;
use tracing::info;

static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Install the Prometheus recorder. Subsequent calls are no-ops.
pub fn init_metrics() -> Result<()> {
    PROMETHEUS_HANDLE.get_or_try_init(|| {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .map_err(|e| QueueError::Config(format!("failed to install Prometheus recorder: {}", e)))?;
        info!("Prometheus metrics initialized");
        Ok::<_, QueueError>(handle)
    })?;
    Ok(())
}

pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

/// Render metrics in Prometheus text format
pub fn render_metrics() -> Option<String> {
    prometheus_handle().map(|h| h.render())
}

/// Metrics labeled with one queue
#[derive(Debug, Clone)]
pub struct QueueMetrics {
    queue: String,
}

impl QueueMetrics {
    pub fn new(queue: impl Into<String>) -> Self {
        Self { queue: queue.into() }
    }

    pub fn message_produced(&self, scheduled: bool) {
        counter!(
            "mq_messages_produced_total",
            "queue" => self.queue.clone(),
            "scheduled" => scheduled.to_string()
        )
        .increment(1);
    }

    pub fn messages_promoted(&self, count: u64) {
        counter!("mq_messages_promoted_total", "queue" => self.queue.clone()).increment(count);
    }

    pub fn message_received(&self) {
        counter!("mq_messages_received_total", "queue" => self.queue.clone()).increment(1);
    }

    pub fn message_acknowledged(&self, duration: Duration) {
        counter!("mq_messages_acknowledged_total", "queue" => self.queue.clone()).increment(1);
        histogram!("mq_consume_duration_seconds", "queue" => self.queue.clone())
            .record(duration.as_secs_f64());
    }

    pub fn consume_failed(&self, kind: &'static str) {
        counter!(
            "mq_consume_failures_total",
            "queue" => self.queue.clone(),
            "kind" => kind
        )
        .increment(1);
    }

    pub fn message_requeued(&self) {
        counter!("mq_messages_requeued_total", "queue" => self.queue.clone()).increment(1);
    }

    pub fn message_dead_lettered(&self) {
        counter!("mq_messages_dead_lettered_total", "queue" => self.queue.clone()).increment(1);
    }

    pub fn message_expired(&self) {
        counter!("mq_messages_expired_total", "queue" => self.queue.clone()).increment(1);
    }

    pub fn message_malformed(&self) {
        counter!("mq_messages_malformed_total", "queue" => self.queue.clone()).increment(1);
    }

    pub fn consumer_reclaimed(&self, messages: usize) {
        counter!("mq_consumers_reclaimed_total", "queue" => self.queue.clone()).increment(1);
        counter!("mq_messages_reclaimed_total", "queue" => self.queue.clone()).increment(messages as u64);
    }

    pub fn in_flight(&self, count: usize) {
        gauge!("mq_messages_in_flight", "queue" => self.queue.clone()).set(count as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics_is_idempotent() {
        init_metrics().unwrap();
        init_metrics().unwrap();
        assert!(prometheus_handle().is_some());
    }

    #[test]
    fn test_recorded_metrics_are_rendered() {
        init_metrics().unwrap();
        let metrics = QueueMetrics::new("default:render-test");
        metrics.message_produced(false);
        metrics.message_dead_lettered();

        let output = render_metrics().unwrap();
        assert!(output.contains("mq_messages_produced_total"));
        assert!(output.contains("default:render-test"));
    }
}
