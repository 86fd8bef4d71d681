//! Core types for authentication.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AuthError, Result};

/// A unique user identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    /// Maximum length of a user identifier.
    pub const MAX_LENGTH: usize = 128;

    /// Creates a new random `UserId`.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Creates a `UserId` from an existing string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string is empty, too long, or contains
    /// whitespace or control characters.
    pub fn from_string(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.is_empty() || id.len() > Self::MAX_LENGTH {
            return Err(AuthError::malformed("subject has invalid length"));
        }
        if id.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(AuthError::malformed("subject contains invalid characters"));
        }
        Ok(Self(id))
    }

    /// Returns the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Whether a token grants access or renews access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    /// Short-lived token presented to services.
    Access,
    /// Long-lived token exchanged for a new pair.
    Refresh,
}

impl TokenType {
    /// Returns the wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Access => "access",
            Self::Refresh => "refresh",
        }
    }
}

impl fmt::Display for TokenType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TokenType {
    type Err = AuthError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "access" => Ok(Self::Access),
            "refresh" => Ok(Self::Refresh),
            other => Err(AuthError::malformed(format!("unknown token type '{other}'"))),
        }
    }
}

/// Why a token was revoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevocationReason {
    /// Revoked on request.
    Explicit,
    /// A refresh token consumed by rotation.
    Rotated,
}

/// A revocation entry as kept by a revocation store.
///
/// The entry lives until `expires_at`, the revoked token's own expiry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevocationEntry {
    /// Why the token was revoked.
    pub reason: RevocationReason,
    /// When it was revoked.
    pub revoked_at: DateTime<Utc>,
    /// When the token would have expired anyway.
    pub expires_at: DateTime<Utc>,
}

impl RevocationEntry {
    /// Creates an entry revoked now.
    #[must_use]
    pub fn new(reason: RevocationReason, expires_at: DateTime<Utc>) -> Self {
        Self {
            reason,
            revoked_at: Utc::now(),
            expires_at,
        }
    }

    /// Returns true once the entry can be forgotten.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Lifecycle state of a token.
///
/// `Expired` and `Revoked` are terminal: a `jti` is never reissued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum TokenState {
    /// Within its lifetime and not revoked.
    Active {
        /// Family shared with the sibling token minted alongside it.
        family: String,
    },
    /// Present in the revocation store.
    Revoked {
        /// Why it was revoked.
        reason: RevocationReason,
        /// When it was revoked.
        at: DateTime<Utc>,
    },
    /// Past its `exp`.
    Expired,
}

impl TokenState {
    /// Returns true if the token would be accepted.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(self, Self::Active { .. })
    }
}

/// A user credential record, owned by the identity store.
#[derive(Clone)]
pub struct UserRecord {
    /// Unique user id.
    pub id: UserId,
    /// Login name.
    pub username: String,
    /// Email address.
    pub email: String,
    /// Argon2 PHC string.
    pub password_hash: String,
    /// When the account was created.
    pub created_at: DateTime<Utc>,
}

impl fmt::Debug for UserRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserRecord")
            .field("id", &self.id)
            .field("username", &self.username)
            .field("email", &self.email)
            .field("password_hash", &"[REDACTED]")
            .field("created_at", &self.created_at)
            .finish()
    }
}
