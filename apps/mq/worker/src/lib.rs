//! Queue Worker Service
//!
//! A background worker that consumes one queue and serves the monitor API.
//!
//! ## Architecture
//!
//! ```text
//! Redis (mq:{ns}:{queue}:ready)
//!   ↓ (blocking move into the consumer's processing list)
//! Consumer<LoggingHandler>
//!   ↓ ack / requeue / dead-letter
//! Redis (ready, scheduled, dead-letter)
//!
//! Monitor API (MONITOR_HOST:MONITOR_PORT)
//!   /health /ready /metrics /api/scheduler/* /api/dead-letter/*
//! ```
//!
//! ## Configuration
//!
//! - `REDIS_URL`, `REDIS_CONNECT_RETRIES`
//! - `MQ_QUEUE`, `MQ_NAMESPACE`
//! - `MQ_CONCURRENCY`, `MQ_RETRY_*`, `MQ_CONSUME_TIMEOUT_MS`, `MQ_MESSAGE_TTL_MS`, ...
//! - `MONITOR_HOST`, `MONITOR_PORT`
//! - `APP_ENV` (production: JSON logs), `RUST_LOG`

use async_trait::async_trait;
use core_config::{
    Environment, FromEnv, redis::RedisConfig, server::ServerConfig, tracing::init_tracing,
    tracing::install_color_eyre,
};
use eyre::{Result, WrapErr};
use message_queue::{
    ConsumeError, Consumer, ConsumerConfig, Message, MessageHandler, MonitorState, QueueContext, QueueSettings,
    RetryConfig, connect_with_retry, init_metrics, monitor_router,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

/// Logs every delivered message and acknowledges it
pub struct LoggingHandler;

#[async_trait]
impl MessageHandler for LoggingHandler {
    async fn consume(&self, message: &Message) -> Result<(), ConsumeError> {
        info!(
            message_id = %message.id(),
            attempts = message.attempts(),
            body = %message.body(),
            "Message consumed"
        );
        Ok(())
    }

    async fn expired(&self, message: &Message) {
        warn!(message_id = %message.id(), "Message expired before delivery");
    }

    fn name(&self) -> &'static str {
        "logging"
    }
}

/// Start the monitor HTTP server
async fn start_monitor_server(state: MonitorState, config: ServerConfig) -> Result<()> {
    let app = monitor_router(state);

    let addr = config.address();
    let listener = TcpListener::bind(&addr)
        .await
        .wrap_err_with(|| format!("Failed to bind monitor server to {}", addr))?;

    info!(address = %addr, "Monitor server listening");

    axum::serve(listener, app)
        .await
        .wrap_err("Monitor server failed")?;

    Ok(())
}

/// Run the queue worker
///
/// 1. Sets up error reports, structured logging and Prometheus metrics
/// 2. Connects to Redis with retry
/// 3. Starts the consumer (with its embedded scheduler and garbage collector)
/// 4. Serves the monitor API until a shutdown signal arrives
///
/// # Errors
///
/// Returns an error if configuration is invalid, Redis cannot be reached or
/// the consumer fails to start or stop.
pub async fn run() -> Result<()> {
    install_color_eyre();
    let environment = Environment::from_env();
    init_tracing(&environment);
    init_metrics().wrap_err("Failed to initialize metrics")?;

    let name = env!("CARGO_PKG_NAME");
    let version = env!("CARGO_PKG_VERSION");
    info!(name, version, "Starting queue worker");

    let redis_config = RedisConfig::from_env().wrap_err("Failed to load Redis configuration")?;
    let queue_settings = QueueSettings::from_env().wrap_err("Failed to load queue settings")?;
    let consumer_config = ConsumerConfig::from_env().wrap_err("Failed to load consumer configuration")?;
    let server_config = ServerConfig::from_env().wrap_err("Failed to load monitor server configuration")?;

    info!("Connecting to Redis...");
    let retry = RetryConfig::new().with_max_retries(redis_config.connect_retries);
    let gateway = connect_with_retry(&redis_config.url, retry)
        .await
        .wrap_err("Failed to connect to Redis")?;
    let gateway = Arc::new(gateway);
    info!("Connected to Redis successfully");

    let queue = queue_settings.queue_name()?;
    info!(
        queue = %queue,
        concurrency = consumer_config.concurrency,
        retry_threshold = consumer_config.retry.threshold,
        retry_delay_ms = consumer_config.retry.delay.as_millis() as u64,
        scheduler = consumer_config.scheduler.is_some(),
        gc = consumer_config.gc.is_some(),
        "Worker configuration loaded"
    );

    let ctx = QueueContext::new(queue, gateway.clone());
    let consumer = Consumer::new(ctx, LoggingHandler, consumer_config);
    log_events(&consumer);

    let monitor_state = MonitorState::new(gateway, name, version);
    tokio::spawn(async move {
        if let Err(e) = start_monitor_server(monitor_state, server_config).await {
            error!(error = %e, "Monitor server failed");
        }
    });

    consumer.run().await.wrap_err("Failed to start consumer")?;
    info!(consumer_id = %consumer.id(), "Consumer running");

    shutdown_signal().await;

    consumer.shutdown().await.wrap_err("Failed to stop consumer")?;
    info!("Queue worker stopped");
    Ok(())
}

/// Forward consumer events to the debug log
fn log_events(consumer: &Consumer) {
    let mut events = consumer.events();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => debug!(instance_id = %event.instance_id, event = ?event.event, "Consumer event"),
                Err(RecvError::Lagged(missed)) => debug!(missed, "Event log lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });
}

/// Wait for a shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown...");
        },
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown...");
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use message_queue::{Gateway, MemoryGateway, QueueName};
    use serde_json::json;

    #[tokio::test]
    async fn test_logging_handler_acknowledges() {
        let handler = LoggingHandler;
        let message = Message::new(json!({"hello": "world"}));
        assert!(handler.consume(&message).await.is_ok());
        assert_eq!(handler.name(), "logging");
    }

    #[tokio::test]
    async fn test_worker_consumes_with_logging_handler() {
        let gateway = Arc::new(MemoryGateway::new());
        let ctx = QueueContext::new(QueueName::in_default("worker").unwrap(), gateway);
        let consumer = Consumer::new(
            ctx.clone(),
            LoggingHandler,
            ConsumerConfig::default()
                .with_block_timeout(std::time::Duration::from_millis(20))
                .with_scheduler(None)
                .with_gc(None),
        );
        ctx.gateway()
            .lpush(&ctx.keys().ready(), &Message::new(json!(1)).to_json().unwrap())
            .await
            .unwrap();

        consumer.run().await.unwrap();
        for _ in 0..200 {
            if ctx.counters().await.unwrap().acknowledged == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        consumer.shutdown().await.unwrap();
        assert_eq!(ctx.counters().await.unwrap().acknowledged, 1);
    }
}
