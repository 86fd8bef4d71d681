//! End-to-end tests of the token lifecycle over the secret broker.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use didentity_auth::{
    AuthError, CredentialVerifier, InMemoryCredentialStore, InMemoryRateLimiter,
    InMemoryRevocationStore, RateLimitConfig, RevocationEntry, RevocationStore, TokenIssuer,
    TokenLifecycleManager, TokenPolicy, TokenState, TokenType,
};
use didentity_secrets::{
    EnvFallback, MemorySecretStore, RetryPolicy, SecretBroker, SecretCache, SecretPath,
};

// =============================================================================
// Helpers
// =============================================================================

const CLIENT: &str = "127.0.0.1";

fn jwt_path() -> SecretPath {
    SecretPath::new("auth/jwt").unwrap()
}

fn broker_with_key(secret: &str) -> (Arc<MemorySecretStore>, Arc<SecretBroker>) {
    let store = Arc::new(MemorySecretStore::new());
    store.insert(&jwt_path(), [("secret_key", secret), ("algorithm", "HS256")]);
    let broker = SecretBroker::new(
        store.clone(),
        Arc::new(SecretCache::new(Duration::from_secs(300))),
    )
    .with_fallback(EnvFallback::disabled())
    .with_retry_policy(RetryPolicy::no_retry());
    (store, Arc::new(broker))
}

fn manager_over(
    broker: Arc<SecretBroker>,
    revocations: Arc<dyn RevocationStore>,
    policy: TokenPolicy,
) -> TokenLifecycleManager {
    let verifier = CredentialVerifier::new(Arc::new(InMemoryCredentialStore::new())).unwrap();
    let issuer = TokenIssuer::new(broker, revocations).with_policy(policy);
    TokenLifecycleManager::new(verifier, issuer)
}

fn manager() -> TokenLifecycleManager {
    let (_, broker) = broker_with_key("integration-signing-secret");
    manager_over(
        broker,
        Arc::new(InMemoryRevocationStore::new()),
        TokenPolicy::default(),
    )
}

/// A revocation store that never answers in time.
struct StalledRevocationStore;

#[async_trait]
impl RevocationStore for StalledRevocationStore {
    async fn revoke_if_absent(&self, _jti: &str, _entry: &RevocationEntry) -> didentity_auth::Result<bool> {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(true)
    }

    async fn lookup(&self, _jti: &str) -> didentity_auth::Result<Option<RevocationEntry>> {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(None)
    }
}

// =============================================================================
// Flows
// =============================================================================

#[tokio::test]
async fn alice_signs_up_and_revokes_the_access_token() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let auth = manager();

    let signup = auth
        .signup("alice", "alice@x.com", "Secret1!", CLIENT)
        .await
        .unwrap();
    let access = signup.tokens.access_token.clone();
    let refresh = signup.tokens.refresh_token.clone();

    let claims = auth.verify(&access).await.unwrap();
    assert_eq!(claims.sub, signup.user_id.as_str());
    assert_eq!(claims.token_type, TokenType::Access);

    auth.revoke(&access, &[access.as_str()]).await.unwrap();

    assert!(matches!(auth.verify(&access).await, Err(AuthError::TokenRevoked)));
    assert!(auth.verify(&refresh).await.is_ok());
}

#[tokio::test]
async fn login_by_username_and_email() {
    let auth = manager();
    let signup = auth
        .signup("alice", "alice@x.com", "Secret1!", CLIENT)
        .await
        .unwrap();

    for identifier in ["alice", "alice@x.com"] {
        let pair = auth.login(identifier, "Secret1!", CLIENT).await.unwrap();
        let claims = auth.verify(&pair.access_token).await.unwrap();
        assert_eq!(claims.sub, signup.user_id.as_str());
    }

    let wrong = auth.login("alice", "nope-nope", CLIENT).await.unwrap_err();
    let unknown = auth.login("mallory", "Secret1!", CLIENT).await.unwrap_err();
    assert!(matches!(wrong, AuthError::InvalidCredentials));
    assert!(matches!(unknown, AuthError::InvalidCredentials));
}

#[tokio::test]
async fn duplicate_signup_is_rejected() {
    let auth = manager();
    auth.signup("alice", "alice@x.com", "Secret1!", CLIENT)
        .await
        .unwrap();
    assert!(matches!(
        auth.signup("alice", "alice@x.com", "Secret1!", CLIENT).await,
        Err(AuthError::UserExists)
    ));
}

#[tokio::test]
async fn refresh_rotates_and_old_token_is_dead() {
    let auth = manager();
    let signup = auth
        .signup("alice", "alice@x.com", "Secret1!", CLIENT)
        .await
        .unwrap();
    let r0 = signup.tokens.refresh_token;

    let rotated = auth.refresh(&r0).await.unwrap();
    assert!(auth.verify(&rotated.access_token).await.is_ok());
    assert!(matches!(auth.refresh(&r0).await, Err(AuthError::TokenRevoked)));
    assert!(matches!(
        auth.state(&r0).await.unwrap(),
        TokenState::Revoked { .. }
    ));
    assert!(auth.refresh(&rotated.refresh_token).await.is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_refresh_has_exactly_one_winner() {
    let auth = Arc::new(manager());
    let signup = auth
        .signup("alice", "alice@x.com", "Secret1!", CLIENT)
        .await
        .unwrap();
    let r0 = Arc::new(signup.tokens.refresh_token);

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let auth = Arc::clone(&auth);
            let r0 = Arc::clone(&r0);
            tokio::spawn(async move { auth.refresh(&r0).await })
        })
        .collect();

    let mut winners = 0;
    let mut revoked = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => winners += 1,
            Err(err) => {
                assert!(matches!(err, AuthError::TokenRevoked), "{err:?}");
                revoked += 1;
            }
        }
    }
    assert_eq!(winners, 1);
    assert_eq!(revoked, 7);
}

// =============================================================================
// Rate limiting
// =============================================================================

#[tokio::test]
async fn login_attempts_are_limited_per_client_and_account() {
    let limiter = InMemoryRateLimiter::new(RateLimitConfig::new(3, Duration::from_secs(60)));
    let auth = manager().with_rate_limiter(Arc::new(limiter));
    auth.signup("alice", "alice@x.com", "Secret1!", "10.0.0.9")
        .await
        .unwrap();

    for _ in 0..3 {
        let err = auth.login("alice", "wrong-pass", CLIENT).await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidCredentials), "{err:?}");
    }
    let err = auth.login("alice", "Secret1!", CLIENT).await.unwrap_err();
    assert!(
        matches!(err, AuthError::TooManyAttempts { retry_after } if retry_after > Duration::ZERO),
        "{err:?}"
    );

    // A fresh client is still held back by the account window.
    let err = auth.login("alice", "Secret1!", "10.0.0.7").await.unwrap_err();
    assert!(matches!(err, AuthError::TooManyAttempts { .. }), "{err:?}");
}

// =============================================================================
// Failure modes
// =============================================================================

#[tokio::test]
async fn signing_key_unavailable_fails_closed() {
    let (store, broker) = broker_with_key("integration-signing-secret");
    let auth = manager_over(
        broker,
        Arc::new(InMemoryRevocationStore::new()),
        TokenPolicy::default(),
    );
    store.set_available(false);

    let err = auth
        .signup("alice", "alice@x.com", "Secret1!", CLIENT)
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::AuthUnavailable { .. }), "{err:?}");
    assert!(err.is_unavailable());
}

#[tokio::test]
async fn environment_signing_key_keeps_tokens_flowing_during_outage() {
    let store = Arc::new(MemorySecretStore::new());
    store.set_available(false);
    let broker = SecretBroker::new(
        store.clone(),
        Arc::new(SecretCache::new(Duration::from_secs(300))),
    )
    .with_fallback(EnvFallback::standard().with_vars([("JWT_SECRET_KEY", "env-signing-secret")]))
    .with_retry_policy(RetryPolicy::no_retry());
    let auth = manager_over(
        Arc::new(broker),
        Arc::new(InMemoryRevocationStore::new()),
        TokenPolicy::default(),
    );

    let signup = auth
        .signup("alice", "alice@x.com", "Secret1!", CLIENT)
        .await
        .unwrap();
    assert_eq!(signup.tokens.expires_in, 1800);

    let claims = auth.verify(&signup.tokens.access_token).await.unwrap();
    assert_eq!(claims.token_type, TokenType::Access);
    auth.refresh(&signup.tokens.refresh_token).await.unwrap();
}

#[tokio::test]
async fn stalled_revocation_store_fails_closed() {
    let (_, broker) = broker_with_key("integration-signing-secret");
    let auth = manager_over(
        broker,
        Arc::new(StalledRevocationStore),
        TokenPolicy::default().with_revocation_timeout(Duration::from_millis(50)),
    );

    let signup = auth
        .signup("alice", "alice@x.com", "Secret1!", CLIENT)
        .await
        .unwrap();

    let err = auth.verify(&signup.tokens.access_token).await.unwrap_err();
    assert!(matches!(err, AuthError::RevocationUnavailable { .. }), "{err:?}");

    let err = auth.refresh(&signup.tokens.refresh_token).await.unwrap_err();
    assert!(matches!(err, AuthError::RevocationUnavailable { .. }), "{err:?}");
}

#[tokio::test]
async fn rotated_signing_key_invalidates_old_tokens() {
    let (store, broker) = broker_with_key("first-signing-secret");
    let auth = manager_over(
        Arc::clone(&broker),
        Arc::new(InMemoryRevocationStore::new()),
        TokenPolicy::default(),
    );
    let signup = auth
        .signup("alice", "alice@x.com", "Secret1!", CLIENT)
        .await
        .unwrap();

    store.insert(&jwt_path(), [("secret_key", "second-signing-secret")]);
    // Cached key still verifies until the entry is dropped.
    assert!(auth.verify(&signup.tokens.access_token).await.is_ok());

    broker.invalidate("auth/jwt").unwrap();
    let err = auth.verify(&signup.tokens.access_token).await.unwrap_err();
    assert!(matches!(err, AuthError::TokenMalformed { .. }), "{err:?}");
}
