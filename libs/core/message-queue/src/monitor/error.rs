//! API errors and the validated query extractor.

use crate::error::QueueError;
use axum::{
    Json,
    extract::{FromRequestParts, Query},
    http::{StatusCode, request::Parts},
    response::{IntoResponse, Response},
};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use tracing::error;
use validator::{Validate, ValidationErrors};

pub const VALIDATION_FAILED: &str = "Request validation failed";

/// Which property failed and why
#[derive(Debug, Clone, PartialEq)]
pub struct Violation {
    pub property: Option<String>,
    pub constraints: Map<String, Value>,
}

impl Violation {
    pub fn new(property: Option<&str>, code: &str, message: impl Into<String>) -> Self {
        let mut constraints = Map::new();
        constraints.insert(code.to_string(), Value::String(message.into()));
        Self {
            property: property.map(str::to_string),
            constraints,
        }
    }
}

#[derive(Debug)]
pub enum ApiError {
    /// 422 with the failing property
    Unprocessable(Violation),
    NotFound(String),
    Unavailable(String),
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Unprocessable(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let (message, details) = match self {
            ApiError::Unprocessable(violation) => (
                VALIDATION_FAILED.to_string(),
                json!({
                    "target": "query",
                    "property": violation.property,
                    "children": [],
                    "constraints": violation.constraints,
                }),
            ),
            ApiError::NotFound(message) | ApiError::Unavailable(message) | ApiError::Internal(message) => {
                (message, Value::Null)
            }
        };

        let body = json!({
            "error": {
                "code": status.as_u16(),
                "message": message,
                "details": details,
            }
        });
        (status, Json(body)).into_response()
    }
}

impl From<QueueError> for ApiError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::Config(message) => {
                ApiError::Unprocessable(Violation::new(Some("queueName"), "queue_name", message))
            }
            err if err.is_transport() => ApiError::Unavailable(err.to_string()),
            err => {
                error!(error = %err, "Monitor request failed");
                ApiError::Internal(err.to_string())
            }
        }
    }
}

impl From<ValidationErrors> for ApiError {
    fn from(errors: ValidationErrors) -> Self {
        // Report the first failing field, ordered by name for stable output
        let mut fields: Vec<_> = errors.field_errors().into_iter().collect();
        fields.sort_by(|a, b| a.0.cmp(&b.0));

        let Some((field, field_errors)) = fields.into_iter().next() else {
            return ApiError::Unprocessable(Violation::new(None, "invalid", VALIDATION_FAILED));
        };

        let constraints = field_errors
            .iter()
            .map(|e| {
                let message = e
                    .message
                    .as_ref()
                    .map(|m| m.to_string())
                    .unwrap_or_else(|| format!("{} is invalid", field));
                (e.code.to_string(), Value::String(message))
            })
            .collect();

        ApiError::Unprocessable(Violation {
            property: Some(camel_case(&field)),
            constraints,
        })
    }
}

/// Query string extractor that deserializes and validates, rejecting with 422.
pub struct ValidatedQuery<T>(pub T);

impl<T, S> FromRequestParts<S> for ValidatedQuery<T>
where
    T: DeserializeOwned + Validate,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Query(value) = Query::<T>::from_request_parts(parts, state)
            .await
            .map_err(|rejection| deserialize_violation(rejection.body_text()))?;

        value.validate()?;
        Ok(Self(value))
    }
}

fn deserialize_violation(detail: String) -> ApiError {
    let property = missing_field(&detail);
    ApiError::Unprocessable(Violation::new(property.as_deref(), "deserialize", detail))
}

/// Property name from serde's "missing field `x`" message
fn missing_field(detail: &str) -> Option<String> {
    let start = detail.find("missing field `")? + "missing field `".len();
    let len = detail[start..].find('`')?;
    Some(detail[start..start + len].to_string())
}

fn camel_case(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    let mut upper = false;
    for c in field.chars() {
        if c == '_' {
            upper = true;
        } else if upper {
            out.extend(c.to_uppercase());
            upper = false;
        } else {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_field_is_extracted() {
        assert_eq!(
            missing_field("Failed to deserialize query string: missing field `queueName`"),
            Some("queueName".to_string())
        );
        assert_eq!(missing_field("invalid digit found in string"), None);
    }

    #[test]
    fn test_deserialize_violation_names_missing_property() {
        let detail = "Failed to deserialize query string: missing field `queueName`".to_string();
        let ApiError::Unprocessable(violation) = deserialize_violation(detail.clone()) else {
            panic!("expected 422");
        };
        assert_eq!(violation.property.as_deref(), Some("queueName"));
        assert_eq!(violation.constraints.get("deserialize"), Some(&Value::String(detail)));
    }

    #[test]
    fn test_camel_case() {
        assert_eq!(camel_case("queue_name"), "queueName");
        assert_eq!(camel_case("take"), "take");
    }

    #[test]
    fn test_config_error_maps_to_422() {
        let err = ApiError::from(QueueError::Config("bad queue".into()));
        assert_eq!(err.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }
}
