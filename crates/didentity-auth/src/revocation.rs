//! Token revocation stores.
//!
//! A revocation entry is keyed by `jti` and lives until the revoked token's
//! own expiry. Entries are never removed early. The only write primitive is
//! an atomic insert-if-absent, which decides the winner of concurrent
//! refreshes of the same token.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use tracing::debug;

use crate::error::{AuthError, Result};
use crate::types::RevocationEntry;

/// Default key prefix for revocation entries in Redis.
pub const DEFAULT_KEY_PREFIX: &str = "didentity:revoked:";

/// Shared store of revoked token identifiers.
#[async_trait]
pub trait RevocationStore: Send + Sync {
    /// Inserts `entry` for `jti` unless one already exists.
    ///
    /// Returns true if this call inserted the entry.
    async fn revoke_if_absent(&self, jti: &str, entry: &RevocationEntry) -> Result<bool>;

    /// Returns the live entry for `jti`, if any.
    async fn lookup(&self, jti: &str) -> Result<Option<RevocationEntry>>;
}

/// Process-local revocation store for tests and single-instance deployments.
#[derive(Debug, Default)]
pub struct InMemoryRevocationStore {
    entries: Mutex<HashMap<String, RevocationEntry>>,
}

impl InMemoryRevocationStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops entries whose tokens have expired, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, e| !e.is_expired(now));
        before - entries.len()
    }

    /// Returns the number of entries, expired ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns true if the store has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[async_trait]
impl RevocationStore for InMemoryRevocationStore {
    async fn revoke_if_absent(&self, jti: &str, entry: &RevocationEntry) -> Result<bool> {
        let now = Utc::now();
        let mut entries = self.entries.lock();
        if entries.get(jti).is_some_and(|existing| !existing.is_expired(now)) {
            return Ok(false);
        }
        entries.insert(jti.to_string(), entry.clone());
        Ok(true)
    }

    async fn lookup(&self, jti: &str) -> Result<Option<RevocationEntry>> {
        let now = Utc::now();
        let mut entries = self.entries.lock();
        if entries.get(jti).is_some_and(|entry| entry.is_expired(now)) {
            entries.remove(jti);
            return Ok(None);
        }
        Ok(entries.get(jti).cloned())
    }
}

/// Revocation store shared across instances through Redis.
///
/// Entries are written with `SET key value NX PXAT <exp-ms>` so insertion is
/// atomic and the entry expires with the token.
#[derive(Clone)]
pub struct RedisRevocationStore {
    conn: ConnectionManager,
    prefix: String,
}

impl RedisRevocationStore {
    /// Connects to Redis at `url`.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::RevocationUnavailable`] if the connection fails.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(unavailable)?;
        let conn = ConnectionManager::new(client).await.map_err(unavailable)?;
        Ok(Self::new(conn))
    }

    /// Wraps an existing connection.
    #[must_use]
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            prefix: DEFAULT_KEY_PREFIX.to_string(),
        }
    }

    /// Sets the key prefix.
    #[must_use]
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    fn key(&self, jti: &str) -> String {
        format!("{}{jti}", self.prefix)
    }
}

fn unavailable(err: impl std::fmt::Display) -> AuthError {
    AuthError::RevocationUnavailable {
        reason: err.to_string(),
    }
}

#[async_trait]
impl RevocationStore for RedisRevocationStore {
    async fn revoke_if_absent(&self, jti: &str, entry: &RevocationEntry) -> Result<bool> {
        let value = serde_json::to_string(entry).map_err(unavailable)?;
        // PXAT in the past would drop the key at once; keep it at least a second.
        let expires_at_ms = entry
            .expires_at
            .timestamp_millis()
            .max(Utc::now().timestamp_millis() + 1_000);

        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(self.key(jti))
            .arg(value)
            .arg("NX")
            .arg("PXAT")
            .arg(expires_at_ms)
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;

        let inserted = reply.is_some();
        debug!(jti, inserted, "revocation entry written");
        Ok(inserted)
    }

    async fn lookup(&self, jti: &str) -> Result<Option<RevocationEntry>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("GET")
            .arg(self.key(jti))
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;

        raw.map(|raw| serde_json::from_str(&raw).map_err(unavailable))
            .transpose()
    }
}

impl std::fmt::Debug for RedisRevocationStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisRevocationStore")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

/// Runs a revocation store call under `deadline`.
///
/// A missed deadline is [`AuthError::RevocationUnavailable`]: callers fail
/// closed rather than treat the token as valid.
pub(crate) async fn with_deadline<T>(
    deadline: Duration,
    operation: &'static str,
    fut: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    tokio::time::timeout(deadline, fut)
        .await
        .map_err(|_| AuthError::RevocationUnavailable {
            reason: format!("{operation} exceeded {}ms deadline", deadline.as_millis()),
        })?
}
