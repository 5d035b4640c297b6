//! API Error Handling
//!
//! Unified error type and conversions for API responses. The mapping
//! follows the server's error taxonomy: validation 400, unknown ids 404,
//! state conflicts 409, auth 401, everything unexpected 500.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use crate::service::gpu::GpuError;
use crate::service::job::JobError;

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    Unauthorized(String),
    DatabaseError(sqlx::Error),
    InternalError(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::DatabaseError(err) => {
                tracing::error!("Database error: {err:?}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_string(),
                )
            }
            ApiError::InternalError(msg) => {
                tracing::error!("Internal error: {msg}");
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };

        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        ApiError::DatabaseError(err)
    }
}

impl From<JobError> for ApiError {
    fn from(err: JobError) -> Self {
        match err {
            JobError::NotFound(subject) => ApiError::NotFound(format!("{subject} not found")),
            JobError::InvalidState(msg) => ApiError::Conflict(msg),
            JobError::Validation(msg) => ApiError::BadRequest(msg),
            JobError::Database(err) => ApiError::DatabaseError(err),
        }
    }
}

impl From<GpuError> for ApiError {
    fn from(err: GpuError) -> Self {
        match err {
            GpuError::Probe(msg) => ApiError::InternalError(msg),
            GpuError::Database(err) => ApiError::DatabaseError(err),
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
