use axum::{Json, http::StatusCode, response::IntoResponse};
use serde_json::json;
use thiserror::Error;

use super::models::ErrorResponse;
use crate::queue::QueueError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("payload invalid: {0}")]
    InvalidPayload(String),
    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),
    #[error("queue is full ({0} jobs waiting), try again later")]
    QueueFull(usize),
    #[error("resource not found: {0}")]
    NotFound(String),
    #[error("{0}")]
    AlreadyTerminal(String),
    #[error("service unavailable: {0}")]
    Unavailable(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::InvalidPayload(_) => StatusCode::BAD_REQUEST,
            ApiError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::QueueFull(_) => StatusCode::TOO_MANY_REQUESTS,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::AlreadyTerminal(_) => StatusCode::CONFLICT,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::InvalidPayload(_) => "INVALID_PAYLOAD",
            ApiError::PayloadTooLarge(_) => "PAYLOAD_TOO_LARGE",
            ApiError::QueueFull(_) => "QUEUE_FULL",
            ApiError::NotFound(_) => "NOT_FOUND",
            ApiError::AlreadyTerminal(_) => "ALREADY_TERMINAL",
            ApiError::Unavailable(_) => "UNAVAILABLE",
            ApiError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        let body = ErrorResponse {
            code: self.code(),
            message: self.to_string(),
        };

        (status, Json(json!(body))).into_response()
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(value: serde_json::Error) -> Self {
        ApiError::InvalidPayload(value.to_string())
    }
}

impl From<QueueError> for ApiError {
    fn from(value: QueueError) -> Self {
        match value {
            QueueError::QueueFull { capacity } => ApiError::QueueFull(capacity),
            QueueError::NotFound(job_id) => ApiError::NotFound(format!("job {job_id}")),
            e @ QueueError::AlreadyTerminal { .. } => ApiError::AlreadyTerminal(e.to_string()),
            QueueError::InvalidRequest(message) => ApiError::InvalidPayload(message),
            QueueError::Closed => ApiError::Unavailable("queue is shutting down".into()),
            e @ QueueError::Transition(_) => ApiError::Internal(e.to_string()),
        }
    }
}
