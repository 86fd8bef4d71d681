//! Error types for authentication and the token lifecycle.

use std::time::Duration;

use thiserror::Error;

use crate::types::TokenType;

/// Errors that can occur while authenticating users or handling tokens.
#[derive(Debug, Error)]
pub enum AuthError {
    /// Unknown identifier or wrong password. Never says which.
    #[error("invalid credentials")]
    InvalidCredentials,

    /// The rate limiter rejected the attempt.
    #[error("too many attempts, retry after {}s", .retry_after.as_secs())]
    TooManyAttempts {
        /// Time until the next attempt will be admitted.
        retry_after: Duration,
    },

    /// The token's `exp` has passed.
    #[error("token expired")]
    TokenExpired,

    /// The token's `jti` is in the revocation store.
    #[error("token revoked")]
    TokenRevoked,

    /// Bad signature, encoding, or claims.
    #[error("malformed token: {reason}")]
    TokenMalformed {
        /// What was wrong with the token.
        reason: String,
    },

    /// A token of one type was presented where the other was required.
    #[error("expected {expected} token, got {actual}")]
    WrongTokenType {
        /// The type the operation requires.
        expected: TokenType,
        /// The type that was presented.
        actual: TokenType,
    },

    /// The signing key could not be obtained.
    #[error("authentication unavailable: {reason}")]
    AuthUnavailable {
        /// Why the key could not be obtained.
        reason: String,
    },

    /// The revocation store could not be consulted or updated in time.
    #[error("revocation store unavailable: {reason}")]
    RevocationUnavailable {
        /// The underlying failure.
        reason: String,
    },

    /// The identity store could not be consulted or updated.
    #[error("identity store unavailable: {reason}")]
    IdentityStoreUnavailable {
        /// The underlying failure.
        reason: String,
    },

    /// Signup or request input failed validation.
    #[error("invalid {field}: {reason}")]
    InvalidInput {
        /// The offending field.
        field: &'static str,
        /// Why it was rejected.
        reason: String,
    },

    /// The username or email is already registered.
    #[error("user already exists")]
    UserExists,

    /// The revocation target does not match the presented credential.
    #[error("token mismatch")]
    TokenMismatch,
}

impl AuthError {
    /// Returns true for failures reported to clients as a uniform
    /// "authentication failed".
    #[must_use]
    pub const fn is_authentication_failure(&self) -> bool {
        matches!(
            self,
            Self::InvalidCredentials
                | Self::TokenExpired
                | Self::TokenRevoked
                | Self::TokenMalformed { .. }
                | Self::WrongTokenType { .. }
        )
    }

    /// Returns true for operational failures of a backing service.
    #[must_use]
    pub const fn is_unavailable(&self) -> bool {
        matches!(
            self,
            Self::AuthUnavailable { .. }
                | Self::RevocationUnavailable { .. }
                | Self::IdentityStoreUnavailable { .. }
        )
    }

    /// Returns a stable, machine-readable code for logs.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidCredentials => "invalid_credentials",
            Self::TooManyAttempts { .. } => "too_many_attempts",
            Self::TokenExpired => "token_expired",
            Self::TokenRevoked => "token_revoked",
            Self::TokenMalformed { .. } => "token_malformed",
            Self::WrongTokenType { .. } => "wrong_token_type",
            Self::AuthUnavailable { .. } => "auth_unavailable",
            Self::RevocationUnavailable { .. } => "revocation_unavailable",
            Self::IdentityStoreUnavailable { .. } => "identity_store_unavailable",
            Self::InvalidInput { .. } => "invalid_input",
            Self::UserExists => "user_exists",
            Self::TokenMismatch => "token_mismatch",
        }
    }

    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        Self::TokenMalformed {
            reason: reason.into(),
        }
    }
}

impl From<didentity_secrets::Error> for AuthError {
    fn from(err: didentity_secrets::Error) -> Self {
        Self::AuthUnavailable {
            reason: err.to_string(),
        }
    }
}

/// Result type alias for authentication operations.
pub type Result<T> = std::result::Result<T, AuthError>;
