//! Queue Worker Service - Entry Point
//!
//! Consumes one queue and serves the monitor API next to it.

#[tokio::main]
async fn main() -> eyre::Result<()> {
    mq_worker::run().await
}
