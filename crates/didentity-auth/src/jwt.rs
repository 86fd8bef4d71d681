//! JWT issuance, verification, rotation and revocation.
//!
//! - [`Claims`]: the token payload `{sub, jti, type, iat, exp, family}`
//! - [`TokenPolicy`]: lifetimes and the revocation-store deadline
//! - [`SigningKeyProvider`]: where the HMAC key comes from (the secret broker)
//! - [`TokenIssuer`]: mints, verifies, rotates and revokes tokens
//!
//! Verification checks the signature and shape first, then expiry, then the
//! revocation store.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use didentity_secrets::{SecretBroker, SigningKeyMaterial};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::error::{AuthError, Result};
use crate::revocation::{RevocationStore, with_deadline};
use crate::types::{RevocationEntry, RevocationReason, TokenState, TokenType, UserId};

/// Default access token lifetime (30 minutes).
pub const DEFAULT_ACCESS_TTL: Duration = Duration::from_secs(30 * 60);

/// Default refresh token lifetime (7 days).
pub const DEFAULT_REFRESH_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Token payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user ID).
    pub sub: String,
    /// Unique token identifier.
    pub jti: String,
    /// Access or refresh.
    #[serde(rename = "type")]
    pub token_type: TokenType,
    /// Issued at (Unix timestamp).
    pub iat: i64,
    /// Expiration (Unix timestamp).
    pub exp: i64,
    /// Family shared by the access/refresh pair minted together.
    pub family: String,
}

impl Claims {
    /// Returns the user ID from the subject claim.
    ///
    /// # Errors
    ///
    /// Returns an error if the subject is not a valid user ID.
    pub fn user_id(&self) -> Result<UserId> {
        UserId::from_string(&self.sub)
    }

    /// Returns the expiration time.
    #[must_use]
    pub fn expires_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.exp, 0).unwrap_or_else(Utc::now)
    }

    /// Returns true if `exp` has passed.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now().timestamp() >= self.exp
    }
}

/// Issued access/refresh pair, in the shape returned to clients.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
    /// Short-lived access token.
    pub access_token: String,
    /// Long-lived refresh token.
    pub refresh_token: String,
    /// Always `bearer`.
    pub token_type: String,
    /// Access token lifetime in seconds.
    pub expires_in: u64,
}

impl fmt::Debug for TokenPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenPair")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &"[REDACTED]")
            .field("token_type", &self.token_type)
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

/// Token lifetimes and deadlines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenPolicy {
    /// Access token lifetime, unless `auth/jwt.token_expire_minutes` is set.
    pub access_ttl: Duration,
    /// Refresh token lifetime, unless `auth/jwt.refresh_token_expire_days` is set.
    pub refresh_ttl: Duration,
    /// Deadline for each revocation store call.
    pub revocation_timeout: Duration,
}

impl Default for TokenPolicy {
    fn default() -> Self {
        Self {
            access_ttl: DEFAULT_ACCESS_TTL,
            refresh_ttl: DEFAULT_REFRESH_TTL,
            revocation_timeout: Duration::from_millis(500),
        }
    }
}

impl TokenPolicy {
    /// Sets the access token lifetime.
    #[must_use]
    pub const fn with_access_ttl(mut self, ttl: Duration) -> Self {
        self.access_ttl = ttl;
        self
    }

    /// Sets the refresh token lifetime.
    #[must_use]
    pub const fn with_refresh_ttl(mut self, ttl: Duration) -> Self {
        self.refresh_ttl = ttl;
        self
    }

    /// Sets the revocation store deadline.
    #[must_use]
    pub const fn with_revocation_timeout(mut self, timeout: Duration) -> Self {
        self.revocation_timeout = timeout;
        self
    }
}

/// Source of the current signing key.
#[async_trait]
pub trait SigningKeyProvider: Send + Sync {
    /// Returns the current key material.
    async fn signing_key(&self) -> Result<SigningKeyMaterial>;
}

#[async_trait]
impl SigningKeyProvider for SecretBroker {
    async fn signing_key(&self) -> Result<SigningKeyMaterial> {
        Ok(Self::signing_key(self).await?)
    }
}

/// A fixed signing key, for tests and local development.
#[derive(Debug, Clone)]
pub struct StaticSigningKey(SigningKeyMaterial);

impl StaticSigningKey {
    /// Creates an HS256 key.
    #[must_use]
    pub fn hs256(secret: impl Into<String>) -> Self {
        Self(SigningKeyMaterial {
            secret_key: secret.into(),
            algorithm: "HS256".to_string(),
            access_ttl_minutes: None,
            refresh_ttl_days: None,
        })
    }

    /// Wraps arbitrary key material.
    #[must_use]
    pub const fn new(material: SigningKeyMaterial) -> Self {
        Self(material)
    }
}

#[async_trait]
impl SigningKeyProvider for StaticSigningKey {
    async fn signing_key(&self) -> Result<SigningKeyMaterial> {
        Ok(self.0.clone())
    }
}

/// Key material resolved into `jsonwebtoken` keys.
struct SigningKey {
    algorithm: Algorithm,
    encoding: EncodingKey,
    decoding: DecodingKey,
    access_ttl: Duration,
    refresh_ttl: Duration,
}

impl SigningKey {
    fn resolve(material: &SigningKeyMaterial, policy: &TokenPolicy) -> Result<Self> {
        if material.secret_key.is_empty() {
            return Err(AuthError::AuthUnavailable {
                reason: "signing key is empty".to_string(),
            });
        }
        let algorithm = match material.algorithm.to_ascii_uppercase().as_str() {
            "HS256" => Algorithm::HS256,
            "HS384" => Algorithm::HS384,
            "HS512" => Algorithm::HS512,
            other => {
                return Err(AuthError::AuthUnavailable {
                    reason: format!("unsupported signing algorithm '{other}'"),
                });
            }
        };
        let secret = material.secret_key.as_bytes();
        Ok(Self {
            algorithm,
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            access_ttl: material
                .access_ttl_minutes
                .map_or(policy.access_ttl, |m| Duration::from_secs(m.saturating_mul(60))),
            refresh_ttl: material
                .refresh_ttl_days
                .map_or(policy.refresh_ttl, |d| Duration::from_secs(d.saturating_mul(86_400))),
        })
    }

    fn validation(&self) -> Validation {
        let mut validation = Validation::new(self.algorithm);
        // Expiry is checked after the signature, by hand, so expired tokens
        // can be told apart from forged ones.
        validation.validate_exp = false;
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);
        validation
    }
}

fn ttl_secs(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX)
}

/// Mints, verifies, rotates and revokes tokens.
pub struct TokenIssuer {
    keys: Arc<dyn SigningKeyProvider>,
    revocations: Arc<dyn RevocationStore>,
    policy: TokenPolicy,
}

impl TokenIssuer {
    /// Creates an issuer with the default policy.
    #[must_use]
    pub fn new(keys: Arc<dyn SigningKeyProvider>, revocations: Arc<dyn RevocationStore>) -> Self {
        Self {
            keys,
            revocations,
            policy: TokenPolicy::default(),
        }
    }

    /// Replaces the policy.
    #[must_use]
    pub const fn with_policy(mut self, policy: TokenPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Returns the policy.
    #[must_use]
    pub const fn policy(&self) -> &TokenPolicy {
        &self.policy
    }

    async fn load_key(&self) -> Result<SigningKey> {
        let material = self.keys.signing_key().await.inspect_err(|e| {
            error!(error = %e, "signing key unavailable");
        })?;
        SigningKey::resolve(&material, &self.policy)
    }

    fn mint(key: &SigningKey, user: &UserId) -> Result<TokenPair> {
        let now = Utc::now().timestamp();
        let family = Uuid::new_v4().to_string();
        let header = Header::new(key.algorithm);

        let claims_for = |token_type: TokenType, ttl: Duration| Claims {
            sub: user.to_string(),
            jti: Uuid::new_v4().to_string(),
            token_type,
            iat: now,
            exp: now.saturating_add(ttl_secs(ttl)),
            family: family.clone(),
        };
        let access = claims_for(TokenType::Access, key.access_ttl);
        let refresh = claims_for(TokenType::Refresh, key.refresh_ttl);

        let sign = |claims: &Claims| {
            encode(&header, claims, &key.encoding).map_err(|e| AuthError::AuthUnavailable {
                reason: format!("token signing failed: {e}"),
            })
        };

        Ok(TokenPair {
            access_token: sign(&access)?,
            refresh_token: sign(&refresh)?,
            token_type: "bearer".to_string(),
            expires_in: key.access_ttl.as_secs(),
        })
    }

    /// Checks signature and shape. Does not check expiry or revocation.
    fn decode_with(key: &SigningKey, token: &str) -> Result<Claims> {
        decode::<Claims>(token, &key.decoding, &key.validation())
            .map(|data| data.claims)
            .map_err(|e| AuthError::malformed(e.to_string()))
    }

    /// Signature, then expiry.
    fn authenticate(key: &SigningKey, token: &str) -> Result<Claims> {
        let claims = Self::decode_with(key, token)?;
        if claims.is_expired() {
            return Err(AuthError::TokenExpired);
        }
        Ok(claims)
    }

    async fn lookup_revocation(&self, jti: &str) -> Result<Option<RevocationEntry>> {
        with_deadline(
            self.policy.revocation_timeout,
            "revocation lookup",
            self.revocations.lookup(jti),
        )
        .await
        .inspect_err(|e| error!(jti, error = %e, "revocation store unavailable"))
    }

    async fn insert_revocation(&self, jti: &str, entry: &RevocationEntry) -> Result<bool> {
        with_deadline(
            self.policy.revocation_timeout,
            "revocation insert",
            self.revocations.revoke_if_absent(jti, entry),
        )
        .await
        .inspect_err(|e| error!(jti, error = %e, "revocation store unavailable"))
    }

    /// Issues a new access/refresh pair under a fresh family.
    ///
    /// # Errors
    ///
    /// [`AuthError::AuthUnavailable`] if the signing key cannot be obtained.
    #[instrument(skip_all, fields(user_id = %user))]
    pub async fn issue(&self, user: &UserId) -> Result<TokenPair> {
        let key = self.load_key().await?;
        let pair = Self::mint(&key, user)?;
        debug!("token pair issued");
        Ok(pair)
    }

    /// Verifies a token of either type.
    ///
    /// # Errors
    ///
    /// [`AuthError::TokenMalformed`], [`AuthError::TokenExpired`] or
    /// [`AuthError::TokenRevoked`], checked in that order;
    /// [`AuthError::RevocationUnavailable`] if revocation cannot be ruled out.
    pub async fn verify(&self, token: &str) -> Result<Claims> {
        let key = self.load_key().await?;
        let claims = Self::authenticate(&key, token)?;
        if self.lookup_revocation(&claims.jti).await?.is_some() {
            return Err(AuthError::TokenRevoked);
        }
        Ok(claims)
    }

    /// Verifies a token and requires it to be of `expected` type.
    ///
    /// # Errors
    ///
    /// As [`TokenIssuer::verify`], plus [`AuthError::WrongTokenType`].
    pub async fn verify_type(&self, token: &str, expected: TokenType) -> Result<Claims> {
        let claims = self.verify(token).await?;
        if claims.token_type != expected {
            return Err(AuthError::WrongTokenType {
                expected,
                actual: claims.token_type,
            });
        }
        Ok(claims)
    }

    /// Exchanges a refresh token for a new pair under a new family.
    ///
    /// The presented token is revoked with insert-if-absent before the new
    /// pair is minted; of concurrent refreshes with the same token exactly
    /// one wins and the others get [`AuthError::TokenRevoked`].
    ///
    /// # Errors
    ///
    /// As [`TokenIssuer::verify_type`] for a refresh token.
    #[instrument(skip_all)]
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenPair> {
        let key = self.load_key().await?;
        let claims = Self::authenticate(&key, refresh_token)?;
        if claims.token_type != TokenType::Refresh {
            return Err(AuthError::WrongTokenType {
                expected: TokenType::Refresh,
                actual: claims.token_type,
            });
        }
        let user = claims.user_id()?;

        if self.lookup_revocation(&claims.jti).await?.is_some() {
            warn!(jti = %claims.jti, family = %claims.family, "revoked refresh token presented");
            return Err(AuthError::TokenRevoked);
        }

        let entry = RevocationEntry::new(RevocationReason::Rotated, claims.expires_at());
        if !self.insert_revocation(&claims.jti, &entry).await? {
            warn!(jti = %claims.jti, family = %claims.family, "refresh token already rotated");
            return Err(AuthError::TokenRevoked);
        }

        let pair = Self::mint(&key, &user)?;
        info!(user_id = %user, old_family = %claims.family, "refresh token rotated");
        Ok(pair)
    }

    /// Revokes exactly this token until its original expiry.
    ///
    /// Idempotent. The sibling token of the same family stays valid.
    ///
    /// # Errors
    ///
    /// [`AuthError::TokenMalformed`] or [`AuthError::TokenExpired`] if the
    /// token does not authenticate.
    #[instrument(skip_all)]
    pub async fn revoke(&self, token: &str) -> Result<Claims> {
        let key = self.load_key().await?;
        let claims = Self::authenticate(&key, token)?;
        let entry = RevocationEntry::new(RevocationReason::Explicit, claims.expires_at());
        let inserted = self.insert_revocation(&claims.jti, &entry).await?;
        info!(jti = %claims.jti, token_type = %claims.token_type, inserted, "token revoked");
        Ok(claims)
    }

    /// Reports where a token is in its lifecycle.
    ///
    /// # Errors
    ///
    /// [`AuthError::TokenMalformed`] if the token is forged or garbled.
    pub async fn state(&self, token: &str) -> Result<TokenState> {
        let key = self.load_key().await?;
        let claims = Self::decode_with(&key, token)?;
        if claims.is_expired() {
            return Ok(TokenState::Expired);
        }
        Ok(match self.lookup_revocation(&claims.jti).await? {
            Some(entry) => TokenState::Revoked {
                reason: entry.reason,
                at: entry.revoked_at,
            },
            None => TokenState::Active {
                family: claims.family,
            },
        })
    }
}

impl fmt::Debug for TokenIssuer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenIssuer")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

/// Extracts the token from an `Authorization: Bearer <token>` header value.
///
/// # Errors
///
/// Returns [`AuthError::TokenMalformed`] if the header is empty or uses
/// another scheme.
pub fn extract_bearer(header: &str) -> Result<&str> {
    let header = header.trim();
    if header.is_empty() {
        return Err(AuthError::malformed("authorization header is empty"));
    }
    let token = header
        .strip_prefix("Bearer ")
        .or_else(|| header.strip_prefix("bearer "))
        .map(str::trim)
        .ok_or_else(|| AuthError::malformed("expected 'Bearer <token>'"))?;
    if token.is_empty() {
        return Err(AuthError::malformed("bearer token is empty"));
    }
    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::revocation::InMemoryRevocationStore;

    const SECRET: &str = "test-signing-secret-with-32-bytes!!";

    fn issuer() -> TokenIssuer {
        TokenIssuer::new(
            Arc::new(StaticSigningKey::hs256(SECRET)),
            Arc::new(InMemoryRevocationStore::new()),
        )
    }

    fn user() -> UserId {
        UserId::from_string("user-1").unwrap()
    }

    fn forge(claims: &Claims, secret: &str) -> String {
        encode(
            &Header::new(Algorithm::HS256),
            claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn claims(token_type: TokenType, exp_offset: i64) -> Claims {
        let now = Utc::now().timestamp();
        Claims {
            sub: "user-1".to_string(),
            jti: Uuid::new_v4().to_string(),
            token_type,
            iat: now,
            exp: now + exp_offset,
            family: "fam".to_string(),
        }
    }

    #[tokio::test]
    async fn issued_pair_shares_family() {
        let issuer = issuer();
        let pair = issuer.issue(&user()).await.unwrap();
        assert_eq!(pair.token_type, "bearer");
        assert_eq!(pair.expires_in, 30 * 60);

        let access = issuer.verify(&pair.access_token).await.unwrap();
        let refresh = issuer.verify(&pair.refresh_token).await.unwrap();
        assert_eq!(access.token_type, TokenType::Access);
        assert_eq!(refresh.token_type, TokenType::Refresh);
        assert_eq!(access.family, refresh.family);
        assert_ne!(access.jti, refresh.jti);
        assert_eq!(access.sub, "user-1");
        assert_eq!(refresh.exp - refresh.iat, 7 * 24 * 60 * 60);
    }

    #[tokio::test]
    async fn key_material_overrides_lifetimes() {
        let material = SigningKeyMaterial {
            secret_key: SECRET.to_string(),
            algorithm: "HS512".to_string(),
            access_ttl_minutes: Some(5),
            refresh_ttl_days: Some(1),
        };
        let issuer = TokenIssuer::new(
            Arc::new(StaticSigningKey::new(material)),
            Arc::new(InMemoryRevocationStore::new()),
        );
        let pair = issuer.issue(&user()).await.unwrap();
        assert_eq!(pair.expires_in, 300);

        let refresh = issuer.verify(&pair.refresh_token).await.unwrap();
        assert_eq!(refresh.exp - refresh.iat, 86_400);
    }

    #[tokio::test]
    async fn unsupported_algorithm_fails_closed() {
        let material = SigningKeyMaterial {
            secret_key: SECRET.to_string(),
            algorithm: "none".to_string(),
            access_ttl_minutes: None,
            refresh_ttl_days: None,
        };
        let issuer = TokenIssuer::new(
            Arc::new(StaticSigningKey::new(material)),
            Arc::new(InMemoryRevocationStore::new()),
        );
        assert!(matches!(
            issuer.issue(&user()).await,
            Err(AuthError::AuthUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn forged_signature_is_malformed() {
        let issuer = issuer();
        let token = forge(&claims(TokenType::Access, 60), "some-other-secret");
        assert!(matches!(
            issuer.verify(&token).await,
            Err(AuthError::TokenMalformed { .. })
        ));
    }

    #[tokio::test]
    async fn garbage_is_malformed() {
        let issuer = issuer();
        assert!(matches!(
            issuer.verify("not.a.jwt").await,
            Err(AuthError::TokenMalformed { .. })
        ));
    }

    #[tokio::test]
    async fn expired_token_is_expired() {
        let issuer = issuer();
        let token = forge(&claims(TokenType::Access, -10), SECRET);
        assert!(matches!(issuer.verify(&token).await, Err(AuthError::TokenExpired)));
        assert_eq!(issuer.state(&token).await.unwrap(), TokenState::Expired);
    }

    #[tokio::test]
    async fn forged_expired_token_is_malformed_not_expired() {
        let issuer = issuer();
        let token = forge(&claims(TokenType::Access, -10), "wrong");
        assert!(matches!(
            issuer.verify(&token).await,
            Err(AuthError::TokenMalformed { .. })
        ));
    }

    #[tokio::test]
    async fn revoke_is_idempotent_and_single_token() {
        let issuer = issuer();
        let pair = issuer.issue(&user()).await.unwrap();

        issuer.revoke(&pair.access_token).await.unwrap();
        issuer.revoke(&pair.access_token).await.unwrap();

        assert!(matches!(
            issuer.verify(&pair.access_token).await,
            Err(AuthError::TokenRevoked)
        ));
        assert!(issuer.verify(&pair.refresh_token).await.is_ok());
        assert!(matches!(
            issuer.state(&pair.access_token).await.unwrap(),
            TokenState::Revoked {
                reason: RevocationReason::Explicit,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn refresh_rotates_into_new_family() {
        let issuer = issuer();
        let pair = issuer.issue(&user()).await.unwrap();
        let old = issuer.verify(&pair.refresh_token).await.unwrap();

        let rotated = issuer.refresh(&pair.refresh_token).await.unwrap();
        let new = issuer.verify(&rotated.refresh_token).await.unwrap();
        assert_ne!(new.family, old.family);
        assert_eq!(new.sub, old.sub);

        assert!(matches!(
            issuer.refresh(&pair.refresh_token).await,
            Err(AuthError::TokenRevoked)
        ));
        assert!(matches!(
            issuer.state(&pair.refresh_token).await.unwrap(),
            TokenState::Revoked {
                reason: RevocationReason::Rotated,
                ..
            }
        ));
        // Rotation does not touch the old access token.
        assert!(issuer.verify(&pair.access_token).await.is_ok());
    }

    #[tokio::test]
    async fn access_token_cannot_refresh() {
        let issuer = issuer();
        let pair = issuer.issue(&user()).await.unwrap();
        assert!(matches!(
            issuer.refresh(&pair.access_token).await,
            Err(AuthError::WrongTokenType {
                expected: TokenType::Refresh,
                actual: TokenType::Access
            })
        ));
    }

    #[tokio::test]
    async fn state_of_active_token_carries_family() {
        let issuer = issuer();
        let pair = issuer.issue(&user()).await.unwrap();
        let claims = issuer.verify(&pair.access_token).await.unwrap();
        assert_eq!(
            issuer.state(&pair.access_token).await.unwrap(),
            TokenState::Active {
                family: claims.family
            }
        );
    }

    #[test]
    fn extract_bearer_parses_header() {
        assert_eq!(extract_bearer("Bearer abc.def").ok(), Some("abc.def"));
        assert_eq!(extract_bearer("  bearer xyz ").ok(), Some("xyz"));
        assert!(extract_bearer("").is_err());
        assert!(extract_bearer("Basic dXNlcjpwYXNz").is_err());
        assert!(extract_bearer("Bearer ").is_err());
    }

    #[test]
    fn token_pair_debug_redacts() {
        let pair = TokenPair {
            access_token: "secret-access".to_string(),
            refresh_token: "secret-refresh".to_string(),
            token_type: "bearer".to_string(),
            expires_in: 1800,
        };
        let debug = format!("{pair:?}");
        assert!(!debug.contains("secret-access"));
        assert!(debug.contains("[REDACTED]"));
    }
}
