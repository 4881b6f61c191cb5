//! API error types and conversions

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;

use crate::rollup::SetStateError;
use crate::storage::StoreError;

/// API result type
pub type ApiResult<T> = Result<T, ApiError>;

/// API error types
#[derive(Debug)]
pub enum ApiError {
    /// Storage operation failed
    StorageError(String),

    /// Invalid request parameters
    InvalidRequest(String),

    /// Resource not found
    NotFound(String),

    /// Internal server error
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            ApiError::StorageError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
            ApiError::InvalidRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(json!({
            "error": error_message,
        }));

        (status, body).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(msg) => ApiError::NotFound(msg),
            other => ApiError::StorageError(other.to_string()),
        }
    }
}

impl From<SetStateError> for ApiError {
    fn from(err: SetStateError) -> Self {
        let message = err.to_string();
        match err {
            SetStateError::UnknownKey => ApiError::NotFound(message),
            _ => ApiError::InvalidRequest(message),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<SetStateError>() {
            Ok(rejected) => rejected.into(),
            Err(err) => match err.downcast::<StoreError>() {
                Ok(store) => store.into(),
                Err(err) => ApiError::Internal(format!("{err:#}")),
            },
        }
    }
}
