//! # DIDentity Auth
//!
//! Authentication and the token lifecycle for DIDentity services.
//!
//! - **Credentials**: Argon2id verification with uniform failures ([`CredentialVerifier`])
//! - **Tokens**: HMAC-signed access/refresh pairs, rotation and revocation ([`TokenIssuer`])
//! - **Revocation**: atomic insert-if-absent by `jti` ([`RedisRevocationStore`])
//! - **Rate limiting**: sliding window per client and per account ([`RedisRateLimiter`])
//! - **Lifecycle**: signup, login, refresh, revoke and verify ([`TokenLifecycleManager`])
//!
//! The signing key is read through the secret broker on every use, so a
//! rotated key takes effect once the broker's cache entry expires.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use didentity_auth::{
//!     CredentialVerifier, InMemoryCredentialStore, InMemoryRevocationStore,
//!     StaticSigningKey, TokenIssuer, TokenLifecycleManager,
//! };
//!
//! # async fn example() -> didentity_auth::Result<()> {
//! let verifier = CredentialVerifier::new(Arc::new(InMemoryCredentialStore::new()))?;
//! let issuer = TokenIssuer::new(
//!     Arc::new(StaticSigningKey::hs256("dev-secret")),
//!     Arc::new(InMemoryRevocationStore::new()),
//! );
//! let auth = TokenLifecycleManager::new(verifier, issuer);
//!
//! let signup = auth.signup("alice", "alice@x.com", "Secret1!", "127.0.0.1").await?;
//! let claims = auth.verify(&signup.tokens.access_token).await?;
//! assert_eq!(claims.sub, signup.user_id.as_str());
//! # Ok(())
//! # }
//! ```

pub mod credentials;
pub mod error;
pub mod events;
pub mod jwt;
pub mod lifecycle;
pub mod rate_limit;
pub mod revocation;
pub mod types;

pub use credentials::{
    CredentialStore, CredentialVerifier, InMemoryCredentialStore, hash_password, validate_signup,
};
pub use error::{AuthError, Result};
pub use events::{
    ChannelEventPublisher, DomainEvent, EventPublisher, EventType, NoopEventPublisher,
    TracingEventPublisher,
};
pub use jwt::{
    Claims, SigningKeyProvider, StaticSigningKey, TokenIssuer, TokenPair, TokenPolicy,
    extract_bearer,
};
pub use lifecycle::{Signup, TokenLifecycleManager, account_identity, ip_identity};
pub use rate_limit::{InMemoryRateLimiter, RateLimitConfig, RateLimiter, RedisRateLimiter};
pub use revocation::{InMemoryRevocationStore, RedisRevocationStore, RevocationStore};
pub use types::{
    RevocationEntry, RevocationReason, TokenState, TokenType, UserId, UserRecord,
};
