//! Broker and store configuration.

use std::fmt;
use std::time::Duration;

use crate::retry::RetryPolicy;

/// Default address of the secret store.
pub const DEFAULT_STORE_ADDRESS: &str = "http://vault:8200";

/// Default KV v2 mount.
pub const DEFAULT_KV_MOUNT: &str = "kv";

/// Default cache time-to-live (5 minutes).
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);

/// Connection settings for the remote secret store.
#[derive(Clone)]
pub struct StoreConfig {
    /// Base address, e.g. `http://vault:8200`.
    pub address: String,
    /// Bearer credential presented on every request.
    pub token: String,
    /// KV v2 mount name.
    pub mount: String,
    /// Per-request timeout enforced by the HTTP client.
    pub request_timeout: Duration,
}

impl StoreConfig {
    /// Creates a store configuration with default mount and timeout.
    #[must_use]
    pub fn new(address: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            token: token.into(),
            mount: DEFAULT_KV_MOUNT.to_string(),
            request_timeout: Duration::from_secs(2),
        }
    }

    /// Sets the KV mount.
    #[must_use]
    pub fn with_mount(mut self, mount: impl Into<String>) -> Self {
        self.mount = mount.into();
        self
    }

    /// Sets the per-request timeout.
    #[must_use]
    pub const fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

impl fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreConfig")
            .field("address", &self.address)
            .field("mount", &self.mount)
            .field("request_timeout", &self.request_timeout)
            .field("token", &"[REDACTED]")
            .finish()
    }
}

/// Configuration for a [`SecretBroker`](crate::SecretBroker).
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Remote store settings.
    pub store: StoreConfig,
    /// How long a fetched bundle may be served from cache.
    pub cache_ttl: Duration,
    /// Retry policy for store reads.
    pub retry: RetryPolicy,
    /// Capacity of the audit channel; records beyond it are dropped.
    pub audit_capacity: usize,
}

impl BrokerConfig {
    /// Creates a broker configuration with defaults for everything but the store.
    #[must_use]
    pub fn new(store: StoreConfig) -> Self {
        Self {
            store,
            cache_ttl: DEFAULT_CACHE_TTL,
            retry: RetryPolicy::default(),
            audit_capacity: 1024,
        }
    }

    /// Sets the cache TTL.
    #[must_use]
    pub const fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub const fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the audit channel capacity.
    #[must_use]
    pub const fn with_audit_capacity(mut self, capacity: usize) -> Self {
        self.audit_capacity = capacity;
        self
    }
}
