use super::MonitorState;
use super::error::{ApiError, ValidatedQuery};
use crate::dlq::DeadLetterQueue;
use crate::keys::DEFAULT_NAMESPACE;
use crate::metrics::render_metrics;
use crate::scheduler::Scheduler;
use axum::{
    Json,
    extract::State,
    http::{StatusCode, header},
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;
use validator::{Validate, ValidationError};

const DEFAULT_TAKE: usize = 20;
const MAX_TAKE: usize = 1000;

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

fn default_take() -> usize {
    DEFAULT_TAKE
}

fn validate_name(name: &str) -> Result<(), ValidationError> {
    let valid = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if !valid {
        let mut err = ValidationError::new("matches");
        err.message = Some("may only contain letters, digits, '_' and '-'".into());
        return Err(err);
    }
    Ok(())
}

/// `ns`, `queueName`, `skip`, `take`
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct PageQuery {
    #[serde(default = "default_namespace")]
    #[validate(length(min = 1, max = 64), custom(function = "validate_name"))]
    pub ns: String,
    #[validate(length(min = 1, max = 64), custom(function = "validate_name"))]
    pub queue_name: String,
    #[serde(default)]
    pub skip: usize,
    #[serde(default = "default_take")]
    #[validate(range(min = 1, max = 1000))]
    pub take: usize,
}

/// `ns`, `queueName`, `id`
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct MessageQuery {
    #[serde(default = "default_namespace")]
    #[validate(length(min = 1, max = 64), custom(function = "validate_name"))]
    pub ns: String,
    #[validate(length(min = 1, max = 64), custom(function = "validate_name"))]
    pub queue_name: String,
    pub id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct DataResponse<T> {
    pub data: T,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub name: String,
    pub version: String,
}

/// `GET /health`
pub async fn health(State(state): State<MonitorState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        name: state.app_name,
        version: state.version,
    })
}

/// `GET /ready`
pub async fn ready(State(state): State<MonitorState>) -> (StatusCode, Json<Value>) {
    match state.gateway.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({ "status": "ready", "checks": { "redis": "ok" } })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "not_ready",
                "checks": { "redis": format!("error: {}", e) }
            })),
        ),
    }
}

/// `GET /metrics`
pub async fn metrics() -> impl IntoResponse {
    match render_metrics() {
        Some(output) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            output,
        ),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            "Metrics not initialized".to_string(),
        ),
    }
}

/// `GET /api/scheduler/messages`
pub async fn list_scheduled(
    State(state): State<MonitorState>,
    ValidatedQuery(query): ValidatedQuery<PageQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let scheduler = Scheduler::new(state.context(&query.ns, &query.queue_name)?);
    let page = scheduler.list_scheduled(query.skip, query.take.min(MAX_TAKE)).await?;
    Ok(Json(DataResponse { data: page }))
}

/// `DELETE /api/scheduler/messages`
pub async fn delete_scheduled(
    State(state): State<MonitorState>,
    ValidatedQuery(query): ValidatedQuery<MessageQuery>,
) -> Result<StatusCode, ApiError> {
    let scheduler = Scheduler::new(state.context(&query.ns, &query.queue_name)?);
    if scheduler.delete_scheduled(query.id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("Scheduled message {} not found", query.id)))
    }
}

/// `GET /api/dead-letter/messages`
pub async fn list_dead_lettered(
    State(state): State<MonitorState>,
    ValidatedQuery(query): ValidatedQuery<PageQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let dlq = DeadLetterQueue::new(state.context(&query.ns, &query.queue_name)?);
    let page = dlq.list(query.skip, query.take.min(MAX_TAKE)).await?;
    Ok(Json(DataResponse { data: page }))
}

/// `POST /api/dead-letter/messages/requeue`
pub async fn requeue_dead_lettered(
    State(state): State<MonitorState>,
    ValidatedQuery(query): ValidatedQuery<MessageQuery>,
) -> Result<StatusCode, ApiError> {
    let dlq = DeadLetterQueue::new(state.context(&query.ns, &query.queue_name)?);
    if dlq.requeue(query.id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("Dead-lettered message {} not found", query.id)))
    }
}

/// `DELETE /api/dead-letter/messages`
pub async fn delete_dead_lettered(
    State(state): State<MonitorState>,
    ValidatedQuery(query): ValidatedQuery<MessageQuery>,
) -> Result<StatusCode, ApiError> {
    let dlq = DeadLetterQueue::new(state.context(&query.ns, &query.queue_name)?);
    if dlq.delete(query.id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("Dead-lettered message {} not found", query.id)))
    }
}
