//! Unified API error handling with structured responses.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, warn};

/// API error type with structured responses.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Gone: {0}")]
    Gone(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn gone(msg: impl Into<String>) -> Self {
        Self::Gone(msg.into())
    }

    pub fn service_unavailable(msg: impl Into<String>) -> Self {
        Self::ServiceUnavailable(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Gone(_) => StatusCode::GONE,
            Self::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NOT_FOUND",
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::Conflict(_) => "CONFLICT",
            Self::Gone(_) => "GONE",
            Self::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Categorize an anyhow error by message pattern.
    ///
    /// Patterns recognized:
    /// - "not found" -> NotFound
    /// - "already exists" / "already active" -> Conflict
    /// - "invalid" / "must be" / "required" / "cannot be" -> BadRequest
    /// - "unavailable" / "connection refused" / "timed out" -> ServiceUnavailable
    /// - Default -> Internal
    pub fn from_anyhow(err: anyhow::Error) -> Self {
        let msg = err.to_string();
        let msg_lower = msg.to_lowercase();

        if msg_lower.contains("not found") {
            ApiError::NotFound(msg)
        } else if msg_lower.contains("already exists") || msg_lower.contains("already active") {
            ApiError::Conflict(msg)
        } else if msg_lower.contains("invalid")
            || msg_lower.contains("must be")
            || msg_lower.contains("required")
            || msg_lower.contains("cannot be")
        {
            ApiError::BadRequest(msg)
        } else if msg_lower.contains("unavailable")
            || msg_lower.contains("connection refused")
            || msg_lower.contains("timed out")
        {
            ApiError::ServiceUnavailable(msg)
        } else {
            ApiError::Internal(msg)
        }
    }
}

/// Structured error response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.error_code();
        let message = self.to_string();

        match &self {
            ApiError::Internal(msg) => {
                error!(error_code = code, message = %msg, "API error");
            }
            ApiError::ServiceUnavailable(msg) => {
                warn!(error_code = code, message = %msg, "Service unavailable");
            }
            _ => {
                tracing::debug!(error_code = code, message = %message, "Client error");
            }
        }

        let body = ErrorResponse {
            error: message,
            code,
            details: None,
        };

        (status, Json(body)).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::from_anyhow(err)
    }
}

impl From<crate::container::ContainerError> for ApiError {
    fn from(err: crate::container::ContainerError) -> Self {
        use crate::container::ContainerError;
        match err {
            ContainerError::InvalidInput(msg) => ApiError::BadRequest(msg),
            ContainerError::NotFound(id) => ApiError::NotFound(format!("container {id}")),
            ContainerError::RuntimeUnavailable(msg) => ApiError::ServiceUnavailable(msg),
            err @ ContainerError::ReadyTimeout { .. } => {
                ApiError::ServiceUnavailable(err.to_string())
            }
            err @ ContainerError::ProvisionFailed { .. } => {
                ApiError::ServiceUnavailable(err.to_string())
            }
            other => ApiError::Internal(other.to_string()),
        }
    }
}

/// Result type for API handlers.
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categorization_not_found() {
        let err = anyhow::anyhow!("session not found: abc123");
        assert!(matches!(ApiError::from_anyhow(err), ApiError::NotFound(_)));
    }

    #[test]
    fn test_categorization_bad_request() {
        let err = anyhow::anyhow!("port must be between 1 and 65535");
        assert!(matches!(ApiError::from_anyhow(err), ApiError::BadRequest(_)));
    }

    #[test]
    fn test_categorization_unavailable() {
        let err = anyhow::anyhow!("container runtime unavailable: docker");
        assert!(matches!(
            ApiError::from_anyhow(err),
            ApiError::ServiceUnavailable(_)
        ));
    }

    #[test]
    fn test_categorization_internal_default() {
        let err = anyhow::anyhow!("something went wrong");
        assert!(matches!(ApiError::from_anyhow(err), ApiError::Internal(_)));
    }

    #[test]
    fn test_container_error_mapping() {
        use crate::container::ContainerError;
        let err = ContainerError::InvalidInput("bad image".into());
        assert!(matches!(ApiError::from(err), ApiError::BadRequest(_)));

        let err = ContainerError::NotFound("abc".into());
        assert!(matches!(ApiError::from(err), ApiError::NotFound(_)));
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(ApiError::not_found("").status_code(), StatusCode::NOT_FOUND);
        assert_eq!(ApiError::bad_request("").status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(ApiError::conflict("").status_code(), StatusCode::CONFLICT);
        assert_eq!(ApiError::gone("").status_code(), StatusCode::GONE);
        assert_eq!(
            ApiError::service_unavailable("").status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ApiError::internal("").status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
