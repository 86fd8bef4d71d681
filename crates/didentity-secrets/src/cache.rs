//! Time-boxed in-memory cache of secret bundles.
//!
//! Readers get an immutable snapshot (`Arc<SecretBundle>`); writers replace
//! the whole entry. Expired entries are evicted lazily on the next access.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::debug;

use crate::config::DEFAULT_CACHE_TTL;
use crate::types::{SecretBundle, SecretPath};

#[derive(Debug)]
struct CacheEntry {
    bundle: Arc<SecretBundle>,
    expires_at: Instant,
}

impl CacheEntry {
    fn is_fresh(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// In-memory cache keyed by secret path.
#[derive(Debug)]
pub struct SecretCache {
    ttl: Duration,
    entries: RwLock<HashMap<SecretPath, CacheEntry>>,
}

impl Default for SecretCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_TTL)
    }
}

impl SecretCache {
    /// Creates an empty cache whose entries live for `ttl`.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the configured time-to-live.
    #[must_use]
    pub const fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Returns a snapshot of the bundle at `path` if present and unexpired.
    pub fn get(&self, path: &SecretPath) -> Option<Arc<SecretBundle>> {
        let now = Instant::now();
        {
            let entries = self.entries.read();
            match entries.get(path) {
                Some(entry) if entry.is_fresh(now) => return Some(Arc::clone(&entry.bundle)),
                Some(_) => {}
                None => return None,
            }
        }

        // Expired: evict unless a writer replaced it in the meantime.
        let mut entries = self.entries.write();
        if entries.get(path).is_some_and(|e| !e.is_fresh(now)) {
            entries.remove(path);
            debug!(path = %path, "evicted expired secret");
        }
        None
    }

    /// Stores `bundle` for `path`, replacing any previous entry.
    pub fn insert(&self, path: SecretPath, bundle: SecretBundle) -> Arc<SecretBundle> {
        let bundle = Arc::new(bundle);
        let entry = CacheEntry {
            bundle: Arc::clone(&bundle),
            expires_at: Instant::now() + self.ttl,
        };
        self.entries.write().insert(path, entry);
        bundle
    }

    /// Removes the entry for `path`. Returns true if one was present.
    pub fn invalidate(&self, path: &SecretPath) -> bool {
        let removed = self.entries.write().remove(path).is_some();
        if removed {
            debug!(path = %path, "invalidated cached secret");
        }
        removed
    }

    /// Removes every entry.
    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// Removes every expired entry, returning how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| entry.is_fresh(now));
        before - entries.len()
    }

    /// Returns the number of entries, expired ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Returns true if the cache holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
