//! Error types for the HTTP server.
//!
//! Credential and token failures collapse into one uniform `401` body; the
//! detail goes to the log only.

use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use didentity_auth::AuthError;
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info};

/// Result type alias for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur in the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Failed to bind to the specified address.
    #[error("failed to bind to {0}: {1}")]
    BindFailed(std::net::SocketAddr, std::io::Error),

    /// The `Authorization` header is absent.
    #[error("missing authorization header")]
    MissingAuthorization,

    /// Invalid request parameters.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// An authentication or token lifecycle failure.
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// JSON error response body.
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: &'static str,
    message: String,
}

const AUTHENTICATION_FAILED: &str = "authentication failed";

impl ServerError {
    fn status_and_body(&self) -> (StatusCode, ErrorResponse) {
        let body = |error: &'static str, message: String| ErrorResponse { error, message };
        let auth_failed = || {
            (
                StatusCode::UNAUTHORIZED,
                body("authentication_failed", AUTHENTICATION_FAILED.to_string()),
            )
        };

        match self {
            Self::MissingAuthorization => auth_failed(),
            Self::Auth(e) if e.is_authentication_failure() => auth_failed(),
            Self::Auth(e @ AuthError::TooManyAttempts { .. }) => (
                StatusCode::TOO_MANY_REQUESTS,
                body("too_many_attempts", e.to_string()),
            ),
            Self::Auth(e) if e.is_unavailable() => (
                StatusCode::SERVICE_UNAVAILABLE,
                body("service_unavailable", "authentication temporarily unavailable".to_string()),
            ),
            Self::Auth(e @ AuthError::InvalidInput { .. }) => {
                (StatusCode::BAD_REQUEST, body("invalid_request", e.to_string()))
            }
            Self::Auth(AuthError::UserExists) => (
                StatusCode::BAD_REQUEST,
                body("user_exists", "username or email already registered".to_string()),
            ),
            Self::Auth(AuthError::TokenMismatch) => (
                StatusCode::BAD_REQUEST,
                body("token_mismatch", "token does not match authorization".to_string()),
            ),
            Self::InvalidRequest(msg) => {
                (StatusCode::BAD_REQUEST, body("invalid_request", msg.clone()))
            }
            Self::Auth(_) | Self::BindFailed(_, _) | Self::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                body("internal_error", "internal error".to_string()),
            ),
        }
    }

    fn log(&self, status: StatusCode) {
        match self {
            Self::Auth(e) => {
                if status.is_server_error() {
                    error!(code = e.code(), error = %e, "request failed");
                } else {
                    info!(code = e.code(), error = %e, "request rejected");
                }
            }
            other if status.is_server_error() => error!(error = %other, "request failed"),
            other => info!(error = %other, "request rejected"),
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, body) = self.status_and_body();
        self.log(status);

        let json = serde_json::to_string(&body).unwrap_or_else(|_| {
            r#"{"error":"internal_error","message":"failed to serialize error"}"#.to_string()
        });

        let mut response = (status, [(header::CONTENT_TYPE, "application/json")], json).into_response();
        if let Self::Auth(AuthError::TooManyAttempts { retry_after }) = &self {
            let secs = retry_after_secs(*retry_after);
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

/// Whole seconds for `Retry-After`, rounded up and never zero.
fn retry_after_secs(wait: std::time::Duration) -> u64 {
    let secs = wait.as_secs().saturating_add(u64::from(wait.subsec_nanos() > 0));
    secs.max(1)
}
