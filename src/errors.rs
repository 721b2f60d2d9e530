use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use sea_orm::error::DbErr;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

fn current_request_id() -> Option<String> {
    crate::tracing::current_request_id().map(|rid| rid.as_str().to_string())
}

/// A single field-level validation problem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({"field": "phone", "message": "phone must be 10-20 digits, spaces or +-()"}))]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Structured result of a rejected validation: a summary plus every field error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ValidationFailure {
    pub message: String,
    pub errors: Vec<FieldError>,
}

impl ValidationFailure {
    pub fn new(message: impl Into<String>, errors: Vec<FieldError>) -> Self {
        Self {
            message: message.into(),
            errors,
        }
    }

    pub fn single(field: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            message: message.clone(),
            errors: vec![FieldError::new(field, message)],
        }
    }

    pub fn has_field(&self, field: &str) -> bool {
        self.errors.iter().any(|e| e.field == field)
    }
}

/// Converts derive-based `validator` output into field errors sorted by field name.
impl From<validator::ValidationErrors> for ValidationFailure {
    fn from(errs: validator::ValidationErrors) -> Self {
        let mut errors: Vec<FieldError> = errs
            .field_errors()
            .into_iter()
            .flat_map(|(field, list)| {
                list.iter().map(move |e| {
                    let message = e
                        .message
                        .as_ref()
                        .map(|m| m.to_string())
                        .unwrap_or_else(|| format!("{} is invalid", field));
                    FieldError::new(field, message)
                })
            })
            .collect();
        errors.sort_by(|a, b| a.field.cmp(&b.field));
        ValidationFailure::new("Validation failed", errors)
    }
}

/// Error body returned by every endpoint on failure.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
#[schema(example = json!({
    "success": false,
    "error": "Bad Request",
    "message": "required fields missing",
    "errors": [{"field": "email", "message": "email is required"}],
    "requestId": "req-abc123xyz",
    "timestamp": "2024-12-09T10:30:00.000Z"
}))]
pub struct ErrorResponse {
    pub success: bool,
    /// HTTP status category
    pub error: String,
    /// Human-readable error description, safe to show to visitors
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<FieldError>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub timestamp: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationFailure),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Upstream timeout: {0}")]
    UpstreamTimeout(String),

    #[error("Upstream rejected request: {0}")]
    UpstreamRejection(String),

    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("Checkout could not be started: {0}")]
    CheckoutFailed(Box<ServiceError>),

    #[error("Persistence failure: {0}")]
    PersistenceFailure(#[from] DbErr),

    #[error("Relay failure: {0}")]
    RelayFailure(String),

    #[error("Promotion code drift detected: {0}")]
    DriftDetected(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::Validation(err.into())
    }
}

impl ServiceError {
    pub fn persistence(message: impl Into<String>) -> Self {
        ServiceError::PersistenceFailure(DbErr::Custom(message.into()))
    }

    /// Whether the failed call may be attempted again.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::UpstreamTimeout(_) | Self::UpstreamUnavailable(_) => true,
            Self::CheckoutFailed(inner) => inner.is_retryable(),
            _ => false,
        }
    }

    pub fn is_upstream(&self) -> bool {
        matches!(
            self,
            Self::UpstreamTimeout(_)
                | Self::UpstreamRejection(_)
                | Self::UpstreamUnavailable(_)
                | Self::CheckoutFailed(_)
        )
    }

    /// Wraps a provider failure raised while starting checkout.
    pub fn into_checkout_failure(self) -> Self {
        if self.is_upstream() && !matches!(self, Self::CheckoutFailed(_)) {
            Self::CheckoutFailed(Box::new(self))
        } else {
            self
        }
    }

    /// Returns the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) | Self::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Self::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::UpstreamRejection(_) => StatusCode::BAD_GATEWAY,
            Self::UpstreamUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::CheckoutFailed(inner) => inner.status_code(),
            Self::DriftDetected(_) => StatusCode::CONFLICT,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::PersistenceFailure(_)
            | Self::RelayFailure(_)
            | Self::Configuration(_)
            | Self::Internal(_)
            | Self::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message shown to visitors. Provider and database details stay in the logs.
    pub fn response_message(&self) -> String {
        match self {
            Self::Validation(failure) => failure.message.clone(),
            Self::InvalidInput(msg) => msg.clone(),
            Self::PersistenceFailure(_) => "Signup failed, please try again".to_string(),
            Self::CheckoutFailed(_) => "Payment could not be started, please try again".to_string(),
            Self::UpstreamTimeout(_) | Self::UpstreamUnavailable(_) => {
                "Payment service is temporarily unavailable, please try again".to_string()
            }
            Self::UpstreamRejection(_) => "Payment request was not accepted".to_string(),
            Self::NotFound(msg) => format!("Not found: {}", msg),
            Self::DriftDetected(msg) => format!("Promotion code drift detected: {}", msg),
            Self::RelayFailure(_)
            | Self::Configuration(_)
            | Self::Internal(_)
            | Self::Other(_) => "Internal server error".to_string(),
        }
    }

    fn field_errors(&self) -> Option<Vec<FieldError>> {
        match self {
            Self::Validation(failure) if !failure.errors.is_empty() => {
                Some(failure.errors.clone())
            }
            _ => None,
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        if status.is_server_error() {
            tracing::error!(error = %self, status = status.as_u16(), "request failed");
        } else {
            tracing::debug!(error = %self, status = status.as_u16(), "request rejected");
        }

        let body = ErrorResponse {
            success: false,
            error: status.canonical_reason().unwrap_or("Error").to_string(),
            message: self.response_message(),
            errors: self.field_errors(),
            request_id: current_request_id(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        };

        (status, Json(body)).into_response()
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::to_bytes, http::StatusCode};

    #[tokio::test]
    async fn service_error_response_includes_request_id() {
        let response =
            crate::tracing::scope_request_id(crate::tracing::RequestId::new("req-123"), async {
                ServiceError::NotFound("missing".into()).into_response()
            })
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let payload: ErrorResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(payload.request_id.as_deref(), Some("req-123"));
        assert!(!payload.success);
    }

    #[tokio::test]
    async fn validation_error_body_lists_fields() {
        let failure = ValidationFailure::new(
            "required fields missing",
            vec![FieldError::new("email", "email is required")],
        );
        let response = ServiceError::Validation(failure).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let payload: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(payload["success"], false);
        assert_eq!(payload["message"], "required fields missing");
        assert_eq!(payload["errors"][0]["field"], "email");
    }

    #[test]
    fn service_error_status_code_mapping() {
        assert_eq!(
            ServiceError::InvalidInput("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ServiceError::UpstreamTimeout("x".into()).status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            ServiceError::UpstreamRejection("x".into()).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ServiceError::persistence("disk full").status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            ServiceError::DriftDetected("EARLY36".into()).status_code(),
            StatusCode::CONFLICT
        );
    }

    #[test]
    fn response_message_hides_upstream_and_database_details() {
        let err = ServiceError::UpstreamRejection("No such promotion code: promo_123".into())
            .into_checkout_failure();
        assert_eq!(
            err.response_message(),
            "Payment could not be started, please try again"
        );
        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);

        assert_eq!(
            ServiceError::persistence("connection refused").response_message(),
            "Signup failed, please try again"
        );
        assert_eq!(
            ServiceError::RelayFailure("sheet down".into()).response_message(),
            "Internal server error"
        );
    }

    #[test]
    fn retryable_errors_are_timeouts_and_unavailability() {
        assert!(ServiceError::UpstreamTimeout("t".into()).is_retryable());
        assert!(ServiceError::UpstreamUnavailable("u".into()).is_retryable());
        assert!(!ServiceError::UpstreamRejection("r".into()).is_retryable());
        assert!(ServiceError::UpstreamTimeout("t".into())
            .into_checkout_failure()
            .is_retryable());
        assert!(!ServiceError::InvalidInput("bad".into()).is_retryable());
    }
}
