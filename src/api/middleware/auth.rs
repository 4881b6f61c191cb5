//! Bearer token authentication middleware

use axum::{
    body::Body,
    extract::{Request, State},
    http::{HeaderMap, StatusCode, header::AUTHORIZATION},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::debug;

/// Rejects requests whose `Authorization: Bearer` token differs from the configured one
pub async fn auth_middleware(
    State(expected_token): State<String>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, AuthError> {
    let token = bearer_token(request.headers())?;
    if token != expected_token {
        debug!("rejected request to {} with a wrong token", request.uri().path());
        return Err(AuthError::InvalidToken);
    }

    Ok(next.run(request).await)
}

fn bearer_token(headers: &HeaderMap) -> Result<&str, AuthError> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(AuthError::MissingToken)?
        .strip_prefix("Bearer ")
        .ok_or(AuthError::InvalidFormat)
}

/// Authentication errors
#[derive(Debug, PartialEq, Eq)]
pub enum AuthError {
    MissingToken,
    InvalidFormat,
    InvalidToken,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AuthError::MissingToken => (StatusCode::UNAUTHORIZED, "Missing Authorization header"),
            AuthError::InvalidFormat => (
                StatusCode::UNAUTHORIZED,
                "Invalid Authorization format (expected: Bearer <token>)",
            ),
            AuthError::InvalidToken => (StatusCode::FORBIDDEN, "Invalid token"),
        };

        (status, message).into_response()
    }
}
