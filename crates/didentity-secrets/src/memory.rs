//! In-process secret store, used for tests and local development.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::adapter::{SecretStoreAdapter, StoreHealth};
use crate::error::{StoreError, StoreResult};
use crate::types::{SecretBundle, SecretPath};

#[derive(Debug, Clone)]
struct StoredVersion {
    fields: BTreeMap<String, String>,
    version: u64,
}

/// A [`SecretStoreAdapter`] backed by a map.
///
/// Availability can be toggled to simulate an outage, and a number of
/// upcoming requests can be made to fail transiently.
#[derive(Debug, Default)]
pub struct MemorySecretStore {
    secrets: RwLock<HashMap<SecretPath, StoredVersion>>,
    unavailable: AtomicBool,
    failures_pending: AtomicU32,
    reads: AtomicU64,
}

impl MemorySecretStore {
    /// Creates an empty, available store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Provisions a bundle directly, bumping its version.
    pub fn insert<K, V>(&self, path: &SecretPath, pairs: impl IntoIterator<Item = (K, V)>) -> u64
    where
        K: Into<String>,
        V: Into<String>,
    {
        let fields = pairs
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        self.put(path, fields)
    }

    /// Marks the store reachable or unreachable.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Makes the next `n` requests fail with a transient error.
    pub fn fail_next(&self, n: u32) {
        self.failures_pending.store(n, Ordering::SeqCst);
    }

    /// Returns how many read requests reached the store.
    #[must_use]
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }

    fn put(&self, path: &SecretPath, fields: BTreeMap<String, String>) -> u64 {
        let mut secrets = self.secrets.write();
        let version = secrets.get(path).map_or(1, |s| s.version + 1);
        secrets.insert(path.clone(), StoredVersion { fields, version });
        version
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("connection refused".to_string()));
        }
        let consumed = self
            .failures_pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if consumed.is_ok() {
            return Err(StoreError::Unavailable("injected failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl SecretStoreAdapter for MemorySecretStore {
    async fn read(&self, path: &SecretPath) -> StoreResult<SecretBundle> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        self.secrets
            .read()
            .get(path)
            .map(|s| SecretBundle::new(s.fields.clone(), s.version))
            .ok_or(StoreError::NotFound)
    }

    async fn write(&self, path: &SecretPath, fields: &BTreeMap<String, String>) -> StoreResult<u64> {
        self.check_available()?;
        Ok(self.put(path, fields.clone()))
    }

    async fn delete(&self, path: &SecretPath) -> StoreResult<()> {
        self.check_available()?;
        self.secrets
            .write()
            .remove(path)
            .map(|_| ())
            .ok_or(StoreError::NotFound)
    }

    async fn health(&self) -> StoreResult<StoreHealth> {
        self.check_available()?;
        Ok(StoreHealth {
            healthy: true,
            initialized: true,
            sealed: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(p: &str) -> SecretPath {
        SecretPath::new(p).unwrap()
    }

    #[tokio::test]
    async fn insert_bumps_version() {
        let store = MemorySecretStore::new();
        assert_eq!(store.insert(&path("auth/jwt"), [("secret_key", "a")]), 1);
        assert_eq!(store.insert(&path("auth/jwt"), [("secret_key", "b")]), 2);

        let bundle = store.read(&path("auth/jwt")).await.unwrap();
        assert_eq!(bundle.version(), 2);
        assert_eq!(bundle.get("secret_key"), Some("b"));
    }

    #[tokio::test]
    async fn missing_path_is_not_found() {
        let store = MemorySecretStore::new();
        assert_eq!(store.read(&path("nope")).await.err(), Some(StoreError::NotFound));
        assert_eq!(store.read_count(), 1);
    }

    #[tokio::test]
    async fn unavailable_store_fails_transiently() {
        let store = MemorySecretStore::new();
        store.insert(&path("auth/jwt"), [("secret_key", "a")]);
        store.set_available(false);

        let err = store.read(&path("auth/jwt")).await.err();
        assert!(err.as_ref().is_some_and(StoreError::is_transient));

        store.set_available(true);
        assert!(store.read(&path("auth/jwt")).await.is_ok());
    }

    #[tokio::test]
    async fn fail_next_counts_down() {
        let store = MemorySecretStore::new();
        store.insert(&path("auth/jwt"), [("secret_key", "a")]);
        store.fail_next(2);

        assert!(store.read(&path("auth/jwt")).await.is_err());
        assert!(store.read(&path("auth/jwt")).await.is_err());
        assert!(store.read(&path("auth/jwt")).await.is_ok());
    }

    #[tokio::test]
    async fn write_and_delete() {
        let store = MemorySecretStore::new();
        let fields = BTreeMap::from([("k".to_string(), "v".to_string())]);
        assert_eq!(store.write(&path("a/b"), &fields).await, Ok(1));
        assert_eq!(store.delete(&path("a/b")).await, Ok(()));
        assert_eq!(store.delete(&path("a/b")).await, Err(StoreError::NotFound));
    }
}
