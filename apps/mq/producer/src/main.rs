//! Queue Producer CLI
//!
//! Publishes messages to a queue, immediately or through the scheduler, and
//! inspects queue counters.

use clap::{Args, Parser, Subcommand};
use core_config::tracing::{init_tracing, install_color_eyre};
use core_config::Environment;
use eyre::{Result, WrapErr};
use message_queue::{
    DeadLetterQueue, Gateway, Message, Producer, QueueContext, QueueName, RedisGateway, RetryConfig, Scheduler,
    connect_with_retry,
};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Parser)]
#[command(name = "mq-produce")]
#[command(about = "Publish messages to a Redis-backed queue")]
struct Cli {
    /// Redis connection URL
    #[arg(long, env = "REDIS_URL", default_value = "redis://127.0.0.1:6379")]
    redis_url: String,

    /// Queue namespace
    #[arg(short, long, env = "MQ_NAMESPACE", default_value = "default")]
    namespace: String,

    /// Queue name
    #[arg(short, long, env = "MQ_QUEUE")]
    queue: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Publish a message
    Send(SendArgs),

    /// Show queue counters and sizes
    Stats,
}

#[derive(Args, Debug)]
struct SendArgs {
    /// Message body as JSON; plain text is sent as a JSON string
    #[arg(short, long, default_value = "{}")]
    body: String,

    /// Publish this many copies
    #[arg(long, default_value_t = 1)]
    count: u32,

    /// Deliver once after this delay
    #[arg(long, conflicts_with = "cron")]
    delay_ms: Option<u64>,

    /// Deliver at every occurrence of this cron expression (seconds first)
    #[arg(long)]
    cron: Option<String>,

    /// Deliver this many times, `period-ms` apart
    #[arg(long, requires = "period_ms", conflicts_with = "delay_ms")]
    repeat: Option<u32>,

    #[arg(long)]
    period_ms: Option<u64>,

    /// Discard the message if not delivered within this time
    #[arg(long)]
    ttl_ms: Option<u64>,

    /// Failed deliveries before the message is dead-lettered
    #[arg(long)]
    retry_threshold: Option<u32>,

    /// Delay before each redelivery
    #[arg(long)]
    retry_delay_ms: Option<u64>,
}

impl SendArgs {
    fn body(&self) -> Value {
        serde_json::from_str(&self.body).unwrap_or_else(|_| Value::String(self.body.clone()))
    }

    fn build_message(&self) -> Result<Message> {
        let mut message = Message::new(self.body());

        if let Some(ttl) = self.ttl_ms {
            message = message.with_ttl(Duration::from_millis(ttl));
        }
        if let Some(threshold) = self.retry_threshold {
            message = message.with_retry_threshold(threshold);
        }
        if let Some(delay) = self.retry_delay_ms {
            message = message.with_retry_delay(Duration::from_millis(delay));
        }

        let period = self.period_ms.map(Duration::from_millis);
        message = match (&self.cron, self.repeat, period, self.delay_ms) {
            (Some(cron), Some(repeat), Some(period), _) => message.with_cron_repeat(cron, repeat, period)?,
            (Some(cron), None, _, _) => message.with_cron(cron)?,
            (None, Some(repeat), Some(period), _) => message.with_repeat(repeat, period)?,
            (None, None, _, Some(delay)) => message.with_delay(Duration::from_millis(delay)),
            _ => message,
        };
        Ok(message)
    }
}

async fn send(ctx: QueueContext, args: &SendArgs) -> Result<()> {
    let producer = Producer::new(ctx);
    producer.run().await.wrap_err("Failed to start producer")?;

    for _ in 0..args.count.max(1) {
        let message = args.build_message()?;
        let produced = producer.produce(&message).await?;
        println!("{}", serde_json::to_string(&produced)?);
    }

    producer.shutdown().await?;
    Ok(())
}

async fn stats(ctx: QueueContext) -> Result<()> {
    let counters = ctx.counters().await?;
    let ready = ctx.gateway().llen(&ctx.keys().ready()).await?;
    let scheduled = Scheduler::new(ctx.clone()).count_scheduled().await?;
    let dead_lettered = DeadLetterQueue::new(ctx.clone()).count().await?;

    let report = json!({
        "queue": ctx.queue().to_string(),
        "counters": counters,
        "sizes": {
            "ready": ready,
            "scheduled": scheduled,
            "deadLettered": dead_lettered,
        }
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    install_color_eyre();
    let environment = Environment::from_env();
    init_tracing(&environment);

    let cli = Cli::parse();
    let queue = QueueName::new(&cli.namespace, &cli.queue)?;

    info!("Connecting to Redis...");
    let gateway: RedisGateway = connect_with_retry(&cli.redis_url, RetryConfig::new())
        .await
        .wrap_err("Failed to connect to Redis")?;
    let ctx = QueueContext::new(queue, Arc::new(gateway));

    match cli.command {
        Commands::Send(args) => send(ctx, &args).await?,
        Commands::Stats => stats(ctx).await?,
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn send_args(args: &[&str]) -> SendArgs {
        let mut argv = vec!["mq-produce", "--queue", "emails", "send"];
        argv.extend_from_slice(args);
        match Cli::try_parse_from(argv).unwrap().command {
            Commands::Send(args) => args,
            Commands::Stats => panic!("expected send"),
        }
    }

    #[test]
    fn test_plain_message() {
        let message = send_args(&["--body", r#"{"to":"a@example.com"}"#])
            .build_message()
            .unwrap();
        assert_eq!(message.body(), &json!({"to": "a@example.com"}));
        assert!(!message.is_scheduled());
    }

    #[test]
    fn test_non_json_body_is_sent_as_string() {
        let message = send_args(&["--body", "hello"]).build_message().unwrap();
        assert_eq!(message.body(), &json!("hello"));
    }

    #[test]
    fn test_delay_and_options() {
        let message = send_args(&["--delay-ms", "60000", "--ttl-ms", "5000", "--retry-threshold", "5"])
            .build_message()
            .unwrap();
        assert!(message.is_scheduled());
        assert!(!message.is_recurring());
        assert_eq!(message.ttl(), Some(Duration::from_secs(5)));
        assert_eq!(message.retry_threshold(), Some(5));
    }

    #[test]
    fn test_cron_repeat() {
        let message = send_args(&["--cron", "0 0 * * * *", "--repeat", "3", "--period-ms", "1000"])
            .build_message()
            .unwrap();
        assert!(message.is_recurring());
    }

    #[test]
    fn test_invalid_cron_is_rejected() {
        assert!(send_args(&["--cron", "not a cron"]).build_message().is_err());
    }

    #[test]
    fn test_repeat_requires_period() {
        assert!(Cli::try_parse_from(["mq-produce", "--queue", "emails", "send", "--repeat", "3"]).is_err());
    }

    #[test]
    fn test_queue_is_required() {
        temp_env::with_var_unset("MQ_QUEUE", || {
            assert!(Cli::try_parse_from(["mq-produce", "stats"]).is_err());
        });
        temp_env::with_vars([("MQ_QUEUE", Some("emails")), ("MQ_NAMESPACE", None)], || {
            let cli = Cli::try_parse_from(["mq-produce", "stats"]).unwrap();
            assert_eq!(cli.queue, "emails");
            assert_eq!(cli.namespace, "default");
        });
    }
}
