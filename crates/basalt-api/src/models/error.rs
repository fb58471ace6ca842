//! Unified error handling for the API.

use std::fmt;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use basalt_core::extension::{RegistrationError, RegistryError};
use serde::{Deserialize, Serialize};

use super::common::ApiResponse;

/// Unified API error response with proper HTTP status codes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error code for programmatic handling.
    pub code: String,
    /// Human-readable error message.
    pub message: String,
    #[serde(skip)]
    pub status: StatusCode,
}

impl ErrorResponse {
    pub fn new(code: impl Into<String>, message: impl Into<String>, status: StatusCode) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            status,
        }
    }

    /// Bad request (400).
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new("BAD_REQUEST", message, StatusCode::BAD_REQUEST)
    }

    /// Unauthorized (401).
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new("UNAUTHORIZED", message, StatusCode::UNAUTHORIZED)
    }

    /// Forbidden (403).
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new("FORBIDDEN", message, StatusCode::FORBIDDEN)
    }

    /// Not found (404).
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::new(
            "NOT_FOUND",
            format!("{} not found", resource.into()),
            StatusCode::NOT_FOUND,
        )
    }

    /// Conflict (409).
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new("CONFLICT", message, StatusCode::CONFLICT)
    }

    /// Validation error (422).
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(
            "VALIDATION_ERROR",
            message,
            StatusCode::UNPROCESSABLE_ENTITY,
        )
    }

    /// Internal server error (500).
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new("INTERNAL_ERROR", message, StatusCode::INTERNAL_SERVER_ERROR)
    }
}

impl IntoResponse for ErrorResponse {
    fn into_response(self) -> Response {
        let status = self.status;
        (status, ApiResponse::<()>::from_error_response(self)).into_response()
    }
}

impl fmt::Display for ErrorResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for ErrorResponse {}

impl From<RegistryError> for ErrorResponse {
    fn from(e: RegistryError) -> Self {
        match &e {
            RegistryError::NotFound(name) => Self::not_found(format!("Module {}", name)),
            RegistryError::InvalidState { .. } | RegistryError::DependencyNotEnabled { .. } => {
                Self::conflict(e.to_string())
            }
            RegistryError::Config { .. } => Self::validation(e.to_string()),
            RegistryError::Registration(RegistrationError::Duplicate(_)) => {
                Self::conflict(e.to_string())
            }
            RegistryError::Registration(_) | RegistryError::Migration { .. } => {
                Self::bad_request(e.to_string())
            }
            RegistryError::Initialization { .. } => {
                Self::new("MODULE_FAILED", e.to_string(), StatusCode::INTERNAL_SERVER_ERROR)
            }
        }
    }
}

/// Result type alias for API handlers.
pub type ApiResult<T> = Result<T, ErrorResponse>;

#[cfg(test)]
mod tests {
    use super::*;
    use basalt_core::extension::ModuleStatus;

    #[test]
    fn test_error_response() {
        let err = ErrorResponse::not_found("Module analytics");
        assert_eq!(err.code, "NOT_FOUND");
        assert_eq!(err.status, StatusCode::NOT_FOUND);
        assert_eq!(err.message, "Module analytics not found");
    }

    #[test]
    fn test_registry_error_mapping() {
        let err = ErrorResponse::from(RegistryError::NotFound("ghost".into()));
        assert_eq!(err.status, StatusCode::NOT_FOUND);

        let err = ErrorResponse::from(RegistryError::InvalidState {
            module: "analytics".into(),
            action: "roll back migrations",
            status: ModuleStatus::Enabled,
        });
        assert_eq!(err.status, StatusCode::CONFLICT);

        let err = ErrorResponse::from(RegistryError::Migration {
            module: "analytics".into(),
            message: "target is ahead".into(),
        });
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_error_uses_response_envelope() {
        let response = ErrorResponse::conflict("module is enabled").into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["success"], false);
        assert_eq!(body["error"]["code"], "CONFLICT");
        assert_eq!(body["error"]["message"], "module is enabled");
        assert!(body["meta"]["request_id"].is_string());
        assert!(body.get("data").is_none());
    }
}
