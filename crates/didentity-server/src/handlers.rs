//! HTTP request handlers.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Json;
use axum::body::Bytes;
use axum::extract::rejection::{FormRejection, JsonRejection};
use axum::extract::{ConnectInfo, Form, FromRequestParts, Query, State};
use axum::http::request::Parts;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use didentity_auth::{TokenPair, TokenType, extract_bearer};
use didentity_secrets::BrokerHealth;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ServerError, ServerResult};
use crate::state::AppState;

/// Client address used as the rate-limit identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIp(pub String);

impl FromRequestParts<Arc<AppState>> for ClientIp {
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        if state.config().trust_forwarded_for {
            let forwarded = parts
                .headers
                .get("x-forwarded-for")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.split(',').next())
                .map(str::trim)
                .filter(|v| !v.is_empty());
            if let Some(ip) = forwarded {
                return Ok(Self(ip.to_string()));
            }
        }
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map_or_else(|| "unknown".to_string(), |ConnectInfo(addr)| addr.ip().to_string());
        Ok(Self(peer))
    }
}

fn bearer(headers: &HeaderMap) -> ServerResult<&str> {
    let value = headers
        .get(header::AUTHORIZATION)
        .ok_or(ServerError::MissingAuthorization)?
        .to_str()
        .map_err(|_| ServerError::MissingAuthorization)?;
    Ok(extract_bearer(value)?)
}

/// Signup request body.
#[derive(Debug, Deserialize)]
pub struct SignupRequest {
    /// Desired username.
    pub username: String,
    /// Email address.
    pub email: String,
    /// Plaintext password.
    pub password: String,
}

/// Signup response body.
#[derive(Debug, Serialize)]
pub struct SignupResponse {
    /// The new user's ID.
    pub user_id: String,
    /// Issued tokens.
    #[serde(flatten)]
    pub tokens: TokenPair,
}

/// Login form, OAuth2 password-grant style.
#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    /// Username or email.
    pub username: String,
    /// Plaintext password.
    pub password: String,
}

/// Refresh request body.
#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    /// The refresh token to rotate.
    pub refresh_token: String,
}

/// Revocation target, accepted in the query string and in the body.
#[derive(Debug, Default, Deserialize)]
pub struct RevokeTarget {
    /// Token to revoke.
    pub token: Option<String>,
}

/// Revocation response body.
#[derive(Debug, Serialize)]
pub struct RevokeResponse {
    /// Always `revoked`.
    pub status: &'static str,
    /// Identifier of the revoked token.
    pub jti: String,
}

/// Verification response body.
#[derive(Debug, Serialize)]
pub struct VerifyResponse {
    /// Always true; failures are reported as errors.
    pub valid: bool,
    /// Subject of the token.
    pub user_id: String,
    /// Access or refresh.
    pub token_type: TokenType,
    /// Token family.
    pub family: String,
    /// Expiry.
    pub expires_at: DateTime<Utc>,
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// `healthy` or `degraded`.
    pub status: &'static str,
    /// Service name.
    pub service: &'static str,
    /// Server uptime in seconds.
    pub uptime_secs: u64,
    /// Secret store health.
    pub secrets: BrokerHealth,
}

/// Handle POST /signup.
pub async fn signup(
    State(state): State<Arc<AppState>>,
    ClientIp(client_ip): ClientIp,
    request: Result<Json<SignupRequest>, JsonRejection>,
) -> ServerResult<(StatusCode, Json<SignupResponse>)> {
    let Json(request) = request.map_err(|e| ServerError::InvalidRequest(e.body_text()))?;
    let signup = state
        .auth()
        .signup(&request.username, &request.email, &request.password, &client_ip)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(SignupResponse {
            user_id: signup.user_id.to_string(),
            tokens: signup.tokens,
        }),
    ))
}

/// Handle POST /login.
pub async fn login(
    State(state): State<Arc<AppState>>,
    ClientIp(client_ip): ClientIp,
    form: Result<Form<LoginRequest>, FormRejection>,
) -> ServerResult<Json<TokenPair>> {
    let Form(form) = form.map_err(|e| ServerError::InvalidRequest(e.body_text()))?;
    let tokens = state
        .auth()
        .login(&form.username, &form.password, &client_ip)
        .await?;
    Ok(Json(tokens))
}

/// Handle POST /token/refresh.
pub async fn refresh(
    State(state): State<Arc<AppState>>,
    request: Result<Json<RefreshRequest>, JsonRejection>,
) -> ServerResult<Json<TokenPair>> {
    let Json(request) = request.map_err(|e| ServerError::InvalidRequest(e.body_text()))?;
    Ok(Json(state.auth().refresh(&request.refresh_token).await?))
}

/// Handle POST /token/revoke.
///
/// The token to revoke is named in `?token=` and/or a JSON body
/// `{"token": ...}`; every value given must equal the bearer token.
pub async fn revoke(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<RevokeTarget>,
    body: Bytes,
) -> ServerResult<Json<RevokeResponse>> {
    let authorization = bearer(&headers)?;

    let from_body = if body.iter().all(u8::is_ascii_whitespace) {
        RevokeTarget::default()
    } else {
        serde_json::from_slice::<RevokeTarget>(&body)
            .map_err(|e| ServerError::InvalidRequest(format!("invalid body: {e}")))?
    };

    let targets: Vec<&str> = [query.token.as_deref(), from_body.token.as_deref()]
        .into_iter()
        .flatten()
        .collect();
    debug!(targets = targets.len(), "revocation requested");

    let claims = state.auth().revoke(authorization, &targets).await?;
    Ok(Json(RevokeResponse {
        status: "revoked",
        jti: claims.jti,
    }))
}

/// Handle GET /token/verify.
pub async fn verify(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ServerResult<Json<VerifyResponse>> {
    let token = bearer(&headers)?;
    let claims = state.auth().verify(token).await?;
    let expires_at = claims.expires_at();
    Ok(Json(VerifyResponse {
        valid: true,
        user_id: claims.sub,
        token_type: claims.token_type,
        family: claims.family,
        expires_at,
    }))
}

/// Handle GET /health.
pub async fn health_check(State(state): State<Arc<AppState>>) -> Response {
    let secrets = state.broker().health().await;
    let (status, label) = if secrets.is_healthy() {
        (StatusCode::OK, "healthy")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    };
    (
        status,
        Json(HealthResponse {
            status: label,
            service: "auth-service",
            uptime_secs: state.uptime_secs(),
            secrets,
        }),
    )
        .into_response()
}
