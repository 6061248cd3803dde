//! Error handling module
//!
//! Unified error taxonomy for the governance core. Policy and filter
//! decisions (`deny`, `block`) are successful results, never errors.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use tracing::error;

/// Governance-wide error type
#[derive(Error, Debug)]
pub enum GovernanceError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Cycle detected: {0}")]
    Cycle(String),

    #[error("Dependency unavailable: {0}")]
    DependencyUnavailable(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<tokio_postgres::Error> for GovernanceError {
    fn from(err: tokio_postgres::Error) -> Self {
        GovernanceError::Storage(err.to_string())
    }
}

impl From<deadpool_postgres::PoolError> for GovernanceError {
    fn from(err: deadpool_postgres::PoolError) -> Self {
        GovernanceError::Storage(format!("Connection pool error: {}", err))
    }
}

impl From<serde_json::Error> for GovernanceError {
    fn from(err: serde_json::Error) -> Self {
        GovernanceError::Internal(format!("Serialization error: {}", err))
    }
}

impl From<validator::ValidationErrors> for GovernanceError {
    fn from(err: validator::ValidationErrors) -> Self {
        GovernanceError::Validation(err.to_string())
    }
}

/// Error response structure
#[derive(Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl IntoResponse for GovernanceError {
    fn into_response(self) -> Response {
        let (status, error_code, message, details) = match &self {
            GovernanceError::NotFound(msg) => {
                (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone(), None)
            }
            GovernanceError::Validation(msg) => (
                StatusCode::BAD_REQUEST,
                "VALIDATION_ERROR",
                msg.clone(),
                None,
            ),
            GovernanceError::Cycle(msg) => {
                (StatusCode::CONFLICT, "CYCLE_DETECTED", msg.clone(), None)
            }
            GovernanceError::Conflict(msg) => {
                (StatusCode::CONFLICT, "CONFLICT", msg.clone(), None)
            }
            GovernanceError::DependencyUnavailable(msg) => {
                error!("Dependency unavailable: {}", msg);
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "DEPENDENCY_UNAVAILABLE",
                    "A required dependency is unavailable".to_string(),
                    Some(msg.clone()),
                )
            }
            GovernanceError::Storage(msg) => {
                // Raw storage errors stay in the logs.
                error!("Storage error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "STORAGE_ERROR",
                    "A storage error occurred".to_string(),
                    None,
                )
            }
            GovernanceError::Config(msg) => {
                error!("Configuration error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "CONFIG_ERROR",
                    "A configuration error occurred".to_string(),
                    Some(msg.clone()),
                )
            }
            GovernanceError::Internal(msg) => {
                error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "An internal error occurred".to_string(),
                    Some(msg.clone()),
                )
            }
        };

        let body = Json(ErrorResponse {
            success: false,
            message,
            error: details,
            code: Some(error_code.to_string()),
        });

        (status, body).into_response()
    }
}

/// Result type alias used throughout the core
pub type Result<T> = std::result::Result<T, GovernanceError>;

/// Result type alias for API handlers
pub type ApiResult<T> = std::result::Result<T, GovernanceError>;

/// Helper function to create a validation error
pub fn validation_error(msg: impl Into<String>) -> GovernanceError {
    GovernanceError::Validation(msg.into())
}

/// Helper function to create a not found error
pub fn not_found_error(msg: impl Into<String>) -> GovernanceError {
    GovernanceError::NotFound(msg.into())
}
