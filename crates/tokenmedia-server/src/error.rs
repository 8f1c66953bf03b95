//! Server-specific error types

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::db::RepositoryError;
use crate::pipeline::PipelineError;
use crate::tasks::TaskError;

/// Errors answered by the task and read routes
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("Task dispatch error: {0}")]
    Task(#[from] TaskError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Ask the caller to redeliver
    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl AppError {
    /// Pipeline errors the queue should redeliver; `None` for terminal ones
    pub fn from_retryable(err: &PipelineError) -> Option<Self> {
        match err {
            PipelineError::Transient(_) | PipelineError::BusyDuplicate(_) => {
                Some(AppError::Unavailable(err.to_string()))
            }
            PipelineError::Fatal(_) => Some(AppError::Internal(err.to_string())),
            _ => None,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::Repository(RepositoryError::NotFound(ref message)) => {
                (StatusCode::NOT_FOUND, message.clone())
            }
            AppError::Repository(ref e) => {
                tracing::error!("Repository error: {:?}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "A database error occurred".to_string())
            }
            AppError::Task(ref e) => {
                tracing::error!("Task dispatch error: {}", e);
                (StatusCode::SERVICE_UNAVAILABLE, "Failed to dispatch task".to_string())
            }
            AppError::NotFound(ref message) => (StatusCode::NOT_FOUND, message.clone()),
            AppError::Validation(ref message) => (StatusCode::BAD_REQUEST, message.clone()),
            AppError::BadRequest(ref message) => (StatusCode::BAD_REQUEST, message.clone()),
            AppError::Unavailable(ref message) => {
                (StatusCode::SERVICE_UNAVAILABLE, message.clone())
            }
            AppError::Internal(ref message) => {
                tracing::error!("Internal error: {}", message);
                (StatusCode::INTERNAL_SERVER_ERROR, message.clone())
            }
        };

        let body = Json(json!({
            "error": {
                "message": error_message,
                "status": status.as_u16(),
            }
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        let cases = [
            (AppError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (AppError::BadRequest("x".into()), StatusCode::BAD_REQUEST),
            (AppError::Unavailable("x".into()), StatusCode::SERVICE_UNAVAILABLE),
            (AppError::Internal("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
            (
                AppError::Repository(RepositoryError::not_found("Token", "t")),
                StatusCode::NOT_FOUND,
            ),
        ];
        for (error, status) in cases {
            assert_eq!(error.into_response().status(), status);
        }
    }

    #[test]
    fn test_retryable_pipeline_errors() {
        assert!(matches!(
            AppError::from_retryable(&PipelineError::BusyDuplicate("t".into())),
            Some(AppError::Unavailable(_))
        ));
        assert!(matches!(
            AppError::from_retryable(&PipelineError::Fatal("db".into())),
            Some(AppError::Internal(_))
        ));
        assert!(AppError::from_retryable(&PipelineError::ImageResultRequired).is_none());
        assert!(AppError::from_retryable(&PipelineError::BadToken("x".into())).is_none());
    }
}
