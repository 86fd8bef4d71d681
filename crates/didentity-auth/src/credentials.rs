//! Credential verification against salted Argon2id hashes.
//!
//! The verifier does the same amount of work whether or not the identifier
//! exists: unknown users are checked against a dummy hash, and every failure
//! is reported as [`AuthError::InvalidCredentials`].

use std::collections::HashMap;
use std::sync::Arc;

use argon2::password_hash::SaltString;
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use rand::rngs::OsRng;
use tracing::{debug, error, info};
use zeroize::Zeroizing;

use crate::error::{AuthError, Result};
use crate::types::{UserId, UserRecord};

/// Minimum username length, in characters.
pub const USERNAME_MIN_LENGTH: usize = 3;
/// Maximum username length, in characters.
pub const USERNAME_MAX_LENGTH: usize = 50;
/// Minimum password length, in characters.
pub const PASSWORD_MIN_LENGTH: usize = 8;

/// Read and create access to user credential records.
///
/// The identity database is external; implementations adapt it.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Finds a record by username or email.
    async fn find(&self, identifier: &str) -> Result<Option<UserRecord>>;

    /// Stores a new record.
    ///
    /// Fails with [`AuthError::UserExists`] if the username or email is taken.
    async fn create(&self, record: UserRecord) -> Result<()>;
}

/// A [`CredentialStore`] held in memory.
#[derive(Debug, Default)]
pub struct InMemoryCredentialStore {
    users: RwLock<HashMap<UserId, UserRecord>>,
}

impl InMemoryCredentialStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of registered users.
    #[must_use]
    pub fn len(&self) -> usize {
        self.users.read().len()
    }

    /// Returns true if no users are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.users.read().is_empty()
    }
}

#[async_trait]
impl CredentialStore for InMemoryCredentialStore {
    async fn find(&self, identifier: &str) -> Result<Option<UserRecord>> {
        Ok(self
            .users
            .read()
            .values()
            .find(|u| u.username == identifier || u.email == identifier)
            .cloned())
    }

    async fn create(&self, record: UserRecord) -> Result<()> {
        let mut users = self.users.write();
        if users
            .values()
            .any(|u| u.username == record.username || u.email == record.email)
        {
            return Err(AuthError::UserExists);
        }
        users.insert(record.id.clone(), record);
        Ok(())
    }
}

/// Validates signup input.
///
/// # Errors
///
/// Returns [`AuthError::InvalidInput`] naming the first offending field.
pub fn validate_signup(username: &str, email: &str, password: &str) -> Result<()> {
    let username_len = username.chars().count();
    if !(USERNAME_MIN_LENGTH..=USERNAME_MAX_LENGTH).contains(&username_len) {
        return Err(AuthError::InvalidInput {
            field: "username",
            reason: format!(
                "must be between {USERNAME_MIN_LENGTH} and {USERNAME_MAX_LENGTH} characters"
            ),
        });
    }
    if username.chars().any(|c| c.is_whitespace() || c.is_control() || c == '@') {
        return Err(AuthError::InvalidInput {
            field: "username",
            reason: "must not contain whitespace or '@'".to_string(),
        });
    }

    let valid_email = match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.is_empty()
                && !domain.contains('@')
                && !email.chars().any(char::is_whitespace)
        }
        None => false,
    };
    if !valid_email {
        return Err(AuthError::InvalidInput {
            field: "email",
            reason: "must be a valid email address".to_string(),
        });
    }

    if password.chars().count() < PASSWORD_MIN_LENGTH {
        return Err(AuthError::InvalidInput {
            field: "password",
            reason: format!("must be at least {PASSWORD_MIN_LENGTH} characters"),
        });
    }
    Ok(())
}

/// Hashes a password with Argon2id and a random salt, returning a PHC string.
///
/// # Errors
///
/// Returns an error if hashing fails.
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| AuthError::IdentityStoreUnavailable {
            reason: format!("password hashing failed: {e}"),
        })
}

/// Checks `password` against a PHC string. Malformed hashes never match.
fn password_matches(password: &str, phc: &str) -> bool {
    match PasswordHash::new(phc) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(e) => {
            error!(error = %e, "stored password hash is malformed");
            false
        }
    }
}

/// Runs CPU-bound hashing off the async executor.
async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| AuthError::IdentityStoreUnavailable {
            reason: format!("hashing task failed: {e}"),
        })
}

/// Verifies username/password pairs and registers new users.
pub struct CredentialVerifier {
    store: Arc<dyn CredentialStore>,
    dummy_hash: Arc<str>,
}

impl CredentialVerifier {
    /// Creates a verifier over `store`.
    ///
    /// # Errors
    ///
    /// Returns an error if the dummy hash cannot be computed.
    pub fn new(store: Arc<dyn CredentialStore>) -> Result<Self> {
        let dummy = Zeroizing::new(uuid::Uuid::new_v4().to_string());
        let dummy_hash = hash_password(&dummy)?;
        Ok(Self {
            store,
            dummy_hash: Arc::from(dummy_hash),
        })
    }

    /// Returns the underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn CredentialStore> {
        &self.store
    }

    /// Verifies `password` for the user known as `identifier` (username or email).
    ///
    /// # Errors
    ///
    /// [`AuthError::InvalidCredentials`] if the user does not exist or the
    /// password is wrong; the two cases are indistinguishable.
    pub async fn verify(&self, identifier: &str, password: &str) -> Result<UserId> {
        let record = self.store.find(identifier).await?;

        let (user_id, phc) = match record {
            Some(record) => (Some(record.id), Arc::from(record.password_hash)),
            None => (None, Arc::clone(&self.dummy_hash)),
        };

        let password = Zeroizing::new(password.to_string());
        let matched = blocking(move || password_matches(&password, &phc)).await?;

        match user_id {
            Some(id) if matched => {
                debug!(user_id = %id, "credentials verified");
                Ok(id)
            }
            Some(id) => {
                info!(user_id = %id, "password mismatch");
                Err(AuthError::InvalidCredentials)
            }
            None => {
                info!("unknown identifier");
                Err(AuthError::InvalidCredentials)
            }
        }
    }

    /// Validates input, hashes the password and creates the record.
    ///
    /// # Errors
    ///
    /// [`AuthError::InvalidInput`] for bad input, [`AuthError::UserExists`]
    /// for a taken username or email.
    pub async fn register(&self, username: &str, email: &str, password: &str) -> Result<UserRecord> {
        validate_signup(username, email, password)?;

        let password = Zeroizing::new(password.to_string());
        let password_hash = blocking(move || hash_password(&password)).await??;

        let record = UserRecord {
            id: UserId::new(),
            username: username.to_string(),
            email: email.to_string(),
            password_hash,
            created_at: Utc::now(),
        };
        self.store.create(record.clone()).await?;
        info!(user_id = %record.id, username = %record.username, "user registered");
        Ok(record)
    }
}

impl std::fmt::Debug for CredentialVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialVerifier").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn verifier() -> CredentialVerifier {
        CredentialVerifier::new(Arc::new(InMemoryCredentialStore::new())).unwrap()
    }

    #[test]
    fn hashes_are_salted() {
        let a = hash_password("Secret1!").unwrap();
        let b = hash_password("Secret1!").unwrap();
        assert_ne!(a, b);
        assert!(a.starts_with("$argon2id$"));
        assert!(password_matches("Secret1!", &a));
        assert!(!password_matches("secret1!", &a));
    }

    #[test]
    fn malformed_hash_never_matches() {
        assert!(!password_matches("anything", "not-a-phc-string"));
    }

    #[test_case("al", "alice@x.com", "Secret1!", "username" ; "short username")]
    #[test_case(&"a".repeat(51), "alice@x.com", "Secret1!", "username" ; "long username")]
    #[test_case("al ice", "alice@x.com", "Secret1!", "username" ; "space in username")]
    #[test_case("alice", "alice.x.com", "Secret1!", "email" ; "email without at")]
    #[test_case("alice", "@x.com", "Secret1!", "email" ; "email without local part")]
    #[test_case("alice", "alice@", "Secret1!", "email" ; "email without domain")]
    #[test_case("alice", "a@b@c", "Secret1!", "email" ; "email with two ats")]
    #[test_case("alice", "alice@x.com", "short", "password" ; "short password")]
    fn signup_validation_rejects(username: &str, email: &str, password: &str, expected: &str) {
        let err = validate_signup(username, email, password).unwrap_err();
        assert!(
            matches!(err, AuthError::InvalidInput { field, .. } if field == expected),
            "{err:?}"
        );
    }

    #[test]
    fn signup_validation_accepts() {
        assert!(validate_signup("alice", "alice@x.com", "Secret1!").is_ok());
        assert!(validate_signup("bob", "b@y.org", "12345678").is_ok());
    }

    #[tokio::test]
    async fn register_then_verify_by_username_or_email() {
        let verifier = verifier();
        let record = verifier.register("alice", "alice@x.com", "Secret1!").await.unwrap();

        assert_eq!(verifier.verify("alice", "Secret1!").await.unwrap(), record.id);
        assert_eq!(verifier.verify("alice@x.com", "Secret1!").await.unwrap(), record.id);
    }

    #[tokio::test]
    async fn unknown_user_and_wrong_password_fail_identically() {
        let verifier = verifier();
        verifier.register("alice", "alice@x.com", "Secret1!").await.unwrap();

        let wrong_password = verifier.verify("alice", "Wrong123!").await.unwrap_err();
        let unknown_user = verifier.verify("mallory", "Secret1!").await.unwrap_err();

        assert!(matches!(wrong_password, AuthError::InvalidCredentials));
        assert!(matches!(unknown_user, AuthError::InvalidCredentials));
        assert_eq!(wrong_password.to_string(), unknown_user.to_string());
    }

    #[tokio::test]
    async fn duplicate_username_or_email_is_rejected() {
        let verifier = verifier();
        verifier.register("alice", "alice@x.com", "Secret1!").await.unwrap();

        assert!(matches!(
            verifier.register("alice", "other@x.com", "Secret1!").await,
            Err(AuthError::UserExists)
        ));
        assert!(matches!(
            verifier.register("alice2", "alice@x.com", "Secret1!").await,
            Err(AuthError::UserExists)
        ));
    }
}
