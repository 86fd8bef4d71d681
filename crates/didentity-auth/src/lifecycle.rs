//! The token lifecycle: signup, login, refresh, revoke and verify.
//!
//! [`TokenLifecycleManager`] composes the rate limiter, the credential
//! verifier, the token issuer and the event publisher. It holds no state of
//! its own.

use std::sync::Arc;

use subtle::ConstantTimeEq;
use tracing::{info, instrument, warn};

use crate::credentials::CredentialVerifier;
use crate::error::{AuthError, Result};
use crate::events::{DomainEvent, EventPublisher, EventType, TracingEventPublisher};
use crate::jwt::{Claims, TokenIssuer, TokenPair};
use crate::rate_limit::{self, InMemoryRateLimiter, RateLimiter};
use crate::types::{TokenState, TokenType, UserId};

/// Rate-limit identity for a client address.
#[must_use]
pub fn ip_identity(client_ip: &str) -> String {
    format!("ip:{client_ip}")
}

/// Rate-limit identity for an account identifier.
#[must_use]
pub fn account_identity(identifier: &str) -> String {
    format!("account:{}", identifier.to_lowercase())
}

/// Result of a successful signup.
#[derive(Debug, Clone)]
pub struct Signup {
    /// The new user's ID.
    pub user_id: UserId,
    /// Tokens for the new user.
    pub tokens: TokenPair,
}

/// Orchestrates the authentication flows.
pub struct TokenLifecycleManager {
    verifier: CredentialVerifier,
    issuer: TokenIssuer,
    limiter: Arc<dyn RateLimiter>,
    events: Arc<dyn EventPublisher>,
}

impl TokenLifecycleManager {
    /// Creates a manager with an in-memory rate limiter and tracing events.
    #[must_use]
    pub fn new(verifier: CredentialVerifier, issuer: TokenIssuer) -> Self {
        Self {
            verifier,
            issuer,
            limiter: Arc::new(InMemoryRateLimiter::default()),
            events: Arc::new(TracingEventPublisher),
        }
    }

    /// Replaces the rate limiter.
    #[must_use]
    pub fn with_rate_limiter(mut self, limiter: Arc<dyn RateLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    /// Replaces the event publisher.
    #[must_use]
    pub fn with_events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = events;
        self
    }

    /// Returns the token issuer.
    #[must_use]
    pub const fn issuer(&self) -> &TokenIssuer {
        &self.issuer
    }

    /// Returns the credential verifier.
    #[must_use]
    pub const fn verifier(&self) -> &CredentialVerifier {
        &self.verifier
    }

    /// Registers a user and issues their first token pair.
    ///
    /// # Errors
    ///
    /// [`AuthError::TooManyAttempts`], [`AuthError::InvalidInput`],
    /// [`AuthError::UserExists`], or any issuance error.
    #[instrument(skip(self, email, password))]
    pub async fn signup(
        &self,
        username: &str,
        email: &str,
        password: &str,
        client_ip: &str,
    ) -> Result<Signup> {
        rate_limit::check(self.limiter.as_ref(), &ip_identity(client_ip)).await?;

        let record = self.verifier.register(username, email, password).await?;
        let tokens = self.issuer.issue(&record.id).await?;

        self.events
            .publish(DomainEvent::new(EventType::UserCreated, record.id.clone()));
        Ok(Signup {
            user_id: record.id,
            tokens,
        })
    }

    /// Authenticates `identifier` (username or email) and issues a token pair.
    ///
    /// Both the client address and the account must be admitted by the rate
    /// limiter before the password is checked.
    ///
    /// # Errors
    ///
    /// [`AuthError::TooManyAttempts`], [`AuthError::InvalidCredentials`], or
    /// any issuance error.
    #[instrument(skip(self, password))]
    pub async fn login(&self, identifier: &str, password: &str, client_ip: &str) -> Result<TokenPair> {
        rate_limit::check(self.limiter.as_ref(), &ip_identity(client_ip)).await?;
        rate_limit::check(self.limiter.as_ref(), &account_identity(identifier)).await?;

        let user_id = self.verifier.verify(identifier, password).await?;
        let tokens = self.issuer.issue(&user_id).await?;

        info!(user_id = %user_id, "login succeeded");
        self.events
            .publish(DomainEvent::new(EventType::UserLogin, user_id));
        Ok(tokens)
    }

    /// Rotates a refresh token into a new pair.
    ///
    /// # Errors
    ///
    /// See [`TokenIssuer::refresh`].
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenPair> {
        self.issuer.refresh(refresh_token).await
    }

    /// Revokes the caller's own access token.
    ///
    /// `authorization` is the bearer token that authenticates the caller;
    /// every entry in `targets` (query and/or body) must equal it.
    ///
    /// # Errors
    ///
    /// Authentication errors for a bad `authorization` token,
    /// [`AuthError::InvalidInput`] if no target was given, and
    /// [`AuthError::TokenMismatch`] if any target differs.
    #[instrument(skip_all, fields(targets = targets.len()))]
    pub async fn revoke(&self, authorization: &str, targets: &[&str]) -> Result<Claims> {
        let caller = self
            .issuer
            .verify_type(authorization, TokenType::Access)
            .await?;

        if targets.is_empty() {
            return Err(AuthError::InvalidInput {
                field: "token",
                reason: "no token to revoke".to_string(),
            });
        }
        let all_match = targets
            .iter()
            .all(|target| bool::from(target.as_bytes().ct_eq(authorization.as_bytes())));
        if !all_match {
            warn!(user_id = %caller.sub, "revocation target does not match authorization token");
            return Err(AuthError::TokenMismatch);
        }

        self.issuer.revoke(authorization).await
    }

    /// Verifies a token of either type.
    ///
    /// # Errors
    ///
    /// See [`TokenIssuer::verify`].
    pub async fn verify(&self, token: &str) -> Result<Claims> {
        self.issuer.verify(token).await
    }

    /// Reports a token's lifecycle state.
    ///
    /// # Errors
    ///
    /// See [`TokenIssuer::state`].
    pub async fn state(&self, token: &str) -> Result<TokenState> {
        self.issuer.state(token).await
    }

    /// Time until `client_ip` or `identifier` may try again, whichever is later.
    pub async fn retry_after(&self, client_ip: &str, identifier: Option<&str>) -> std::time::Duration {
        let ip = self.limiter.retry_after(&ip_identity(client_ip)).await;
        match identifier {
            Some(id) => ip.max(self.limiter.retry_after(&account_identity(id)).await),
            None => ip,
        }
    }
}

impl std::fmt::Debug for TokenLifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenLifecycleManager")
            .field("verifier", &self.verifier)
            .field("issuer", &self.issuer)
            .finish_non_exhaustive()
    }
}
