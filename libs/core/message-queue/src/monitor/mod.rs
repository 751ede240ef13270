//! Monitoring HTTP API.
//!
//! - `GET /health`, `GET /ready`, `GET /metrics`
//! - `GET|DELETE /api/scheduler/messages`
//! - `GET|DELETE /api/dead-letter/messages`, `POST /api/dead-letter/messages/requeue`
//!
//! Queue endpoints address a queue with `ns` and `queueName` query parameters.
//! Invalid parameters are rejected with 422.

mod error;
mod handlers;

pub use self::error::{ApiError, ValidatedQuery, Violation};
pub use self::handlers::{DataResponse, HealthResponse, MessageQuery, PageQuery};

use crate::clock::{SharedClock, SystemClock};
use crate::context::QueueContext;
use crate::gateway::SharedGateway;
use crate::keys::QueueName;
use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct MonitorState {
    pub gateway: SharedGateway,
    pub clock: SharedClock,
    pub app_name: String,
    pub version: String,
}

impl MonitorState {
    pub fn new(gateway: SharedGateway, app_name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            gateway,
            clock: Arc::new(SystemClock),
            app_name: app_name.into(),
            version: version.into(),
        }
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Context for the queue named in a request
    pub fn context(&self, namespace: &str, queue: &str) -> Result<QueueContext, ApiError> {
        let name = QueueName::new(namespace, queue)?;
        Ok(QueueContext::new(name, self.gateway.clone()).with_clock(self.clock.clone()))
    }
}

pub fn monitor_router(state: MonitorState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/ready", get(handlers::ready))
        .route("/metrics", get(handlers::metrics))
        .route(
            "/api/scheduler/messages",
            get(handlers::list_scheduled).delete(handlers::delete_scheduled),
        )
        .route(
            "/api/dead-letter/messages",
            get(handlers::list_dead_lettered).delete(handlers::delete_dead_lettered),
        )
        .route(
            "/api/dead-letter/messages/requeue",
            post(handlers::requeue_dead_lettered),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
