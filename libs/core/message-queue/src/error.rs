//! Error types for the queue engine
//!
//! Errors are layered:
//! - **GatewayError**: transport or protocol failures talking to the backend
//! - **QueueError**: everything a public operation can return
//! - **ConsumeError**: failures of a user handler, funneled into retry/dead-letter

use crate::power::PowerState;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Backend command failures
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Redis connection or command error
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Backend could not be reached (used by non-Redis backends)
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    /// Reply did not have the expected shape
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl GatewayError {
    /// Whether this is a transport failure (connection lost, refused, timed out)
    pub fn is_transport(&self) -> bool {
        match self {
            GatewayError::Redis(e) => {
                e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout()
            }
            GatewayError::Unavailable(_) => true,
            GatewayError::Protocol(_) => false,
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        GatewayError::Protocol(message.into())
    }
}

/// Errors returned by queue operations
#[derive(Error, Debug)]
pub enum QueueError {
    /// Backend error, never retried by the engine itself
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    /// Payload could not be decoded or failed validation
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// Operation attempted while the instance is down or going down
    #[error("Instance {instance_id} is not running")]
    NotRunning { instance_id: Uuid },

    /// Power state machine misuse
    #[error("Invalid power transition from {from} to {to}")]
    InvalidTransition { from: PowerState, to: PowerState },

    /// Cron expression or scheduling parameters rejected
    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<redis::RedisError> for QueueError {
    fn from(err: redis::RedisError) -> Self {
        QueueError::Gateway(GatewayError::Redis(err))
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        QueueError::MalformedMessage(err.to_string())
    }
}

impl From<core_config::ConfigError> for QueueError {
    fn from(err: core_config::ConfigError) -> Self {
        QueueError::Config(err.to_string())
    }
}

impl QueueError {
    /// Whether the error came from a lost or unreachable backend
    pub fn is_transport(&self) -> bool {
        matches!(self, QueueError::Gateway(e) if e.is_transport())
    }
}

pub type Result<T, E = QueueError> = std::result::Result<T, E>;

/// Why a handler invocation did not succeed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConsumeError {
    /// Handler returned an error
    #[error("Handler failed: {0}")]
    Failed(String),

    /// Handler did not finish within the consume timeout
    #[error("Handler timed out after {0:?}")]
    Timeout(Duration),

    /// Handler panicked
    #[error("Handler panicked: {0}")]
    Panicked(String),
}

impl ConsumeError {
    pub fn failed(message: impl Into<String>) -> Self {
        ConsumeError::Failed(message.into())
    }

    /// Short label used for metrics and logs
    pub fn kind(&self) -> &'static str {
        match self {
            ConsumeError::Failed(_) => "failed",
            ConsumeError::Timeout(_) => "timeout",
            ConsumeError::Panicked(_) => "panicked",
        }
    }
}

impl From<serde_json::Error> for ConsumeError {
    fn from(err: serde_json::Error) -> Self {
        ConsumeError::Failed(err.to_string())
    }
}
