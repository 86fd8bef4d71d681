//! The secret broker façade.
//!
//! Resolution order for every read:
//!
//! 1. the [`SecretCache`], when the entry is present and unexpired;
//! 2. the [`SecretStoreAdapter`], under the broker's [`RetryPolicy`]; a
//!    successful read populates the cache;
//! 3. the [`EnvFallback`] table; values found there are returned but never
//!    cached, so the next call goes back to the store;
//! 4. otherwise [`Error::SecretNotFound`] when the store answered that the
//!    secret does not exist, or [`Error::SecretStoreUnavailable`].
//!
//! Every successful read emits an [`AccessRecord`] through the [`AuditSink`].

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use crate::adapter::{SecretStoreAdapter, StoreHealth, VaultKvAdapter};
use crate::audit::AuditSink;
use crate::cache::SecretCache;
use crate::config::BrokerConfig;
use crate::error::{Error, Result, StoreError};
use crate::fallback::EnvFallback;
use crate::retry::RetryPolicy;
use crate::types::{AccessRecord, SecretBundle, SecretPath, SecretSource};

/// Path of the database connection bundle.
pub const DATABASE_CONFIG_PATH: &str = "database/config";
/// Path of the message queue bundle.
pub const QUEUE_CONFIG_PATH: &str = "rabbitmq/config";
/// Path of the token signing bundle.
pub const JWT_CONFIG_PATH: &str = "auth/jwt";
/// Path of the encryption bundle.
pub const ENCRYPTION_PATH: &str = "security/encryption";
/// Path of the per-service API keys.
pub const SERVICE_API_KEYS_PATH: &str = "services/api_keys";
/// Path of the monitoring bundle.
pub const MONITORING_CONFIG_PATH: &str = "monitoring/config";
/// Path of the Grafana bundle.
pub const GRAFANA_CONFIG_PATH: &str = "grafana/config";

/// Algorithm used when `auth/jwt.algorithm` is not provisioned.
pub const DEFAULT_SIGNING_ALGORITHM: &str = "HS256";

/// Key material for signing tokens, read from `auth/jwt`.
#[derive(Clone, PartialEq, Eq)]
pub struct SigningKeyMaterial {
    /// Shared signing secret.
    pub secret_key: String,
    /// Algorithm name, e.g. `HS256`.
    pub algorithm: String,
    /// Access token lifetime override, in minutes.
    pub access_ttl_minutes: Option<u64>,
    /// Refresh token lifetime override, in days.
    pub refresh_ttl_days: Option<u64>,
}

impl fmt::Debug for SigningKeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKeyMaterial")
            .field("secret_key", &"[REDACTED]")
            .field("algorithm", &self.algorithm)
            .field("access_ttl_minutes", &self.access_ttl_minutes)
            .field("refresh_ttl_days", &self.refresh_ttl_days)
            .finish()
    }
}

/// Health summary of the broker and its store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BrokerHealth {
    /// `healthy` or `unhealthy`.
    pub status: &'static str,
    /// Whether the store has been initialized, if it answered.
    pub initialized: Option<bool>,
    /// Whether the store is sealed, if it answered.
    pub sealed: Option<bool>,
    /// Why the store is considered unhealthy.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Number of cached bundles.
    pub cache_entries: usize,
    /// When the probe ran.
    pub timestamp: DateTime<Utc>,
}

impl BrokerHealth {
    /// Returns true if the store is serving.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.status == "healthy"
    }
}

/// Caching, fail-over-aware access to secrets.
pub struct SecretBroker {
    adapter: Arc<dyn SecretStoreAdapter>,
    cache: Arc<SecretCache>,
    fallback: EnvFallback,
    retry: RetryPolicy,
    audit: AuditSink,
}

impl SecretBroker {
    /// Creates a broker over `adapter` and `cache`.
    ///
    /// Uses the standard environment fallback table, the default retry
    /// policy, and an audit sink that only mirrors records to `tracing`.
    #[must_use]
    pub fn new(adapter: Arc<dyn SecretStoreAdapter>, cache: Arc<SecretCache>) -> Self {
        Self {
            adapter,
            cache,
            fallback: EnvFallback::standard(),
            retry: RetryPolicy::default(),
            audit: AuditSink::tracing_only(),
        }
    }

    /// Builds a broker talking to Vault from configuration.
    ///
    /// Returns the broker and the receiving end of its audit channel.
    ///
    /// # Errors
    ///
    /// Returns an error if the store configuration is invalid.
    pub fn from_config(
        config: &BrokerConfig,
        fallback: EnvFallback,
    ) -> Result<(Self, mpsc::Receiver<AccessRecord>)> {
        let adapter = VaultKvAdapter::new(&config.store)?;
        let (audit, rx) = AuditSink::channel(config.audit_capacity);
        info!(address = %adapter.address(), ttl_secs = config.cache_ttl.as_secs(), "secret broker configured");
        let broker = Self::new(Arc::new(adapter), Arc::new(SecretCache::new(config.cache_ttl)))
            .with_fallback(fallback)
            .with_retry_policy(config.retry)
            .with_audit(audit);
        Ok((broker, rx))
    }

    /// Replaces the environment fallback.
    #[must_use]
    pub fn with_fallback(mut self, fallback: EnvFallback) -> Self {
        self.fallback = fallback;
        self
    }

    /// Replaces the retry policy.
    #[must_use]
    pub const fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Replaces the audit sink.
    #[must_use]
    pub fn with_audit(mut self, audit: AuditSink) -> Self {
        self.audit = audit;
        self
    }

    /// Returns the audit sink.
    #[must_use]
    pub const fn audit(&self) -> &AuditSink {
        &self.audit
    }

    /// Returns one field of the bundle at `path`.
    ///
    /// # Errors
    ///
    /// [`Error::SecretNotFound`] if the field exists in no source,
    /// [`Error::SecretStoreUnavailable`] if the store failed and the
    /// environment had no value either.
    #[instrument(skip(self))]
    pub async fn get(&self, path: &str, field: &str) -> Result<String> {
        let path = SecretPath::new(path)?;

        let store_error = match self.fetch(&path).await {
            Ok((bundle, source)) => {
                if let Some(value) = bundle.get(field) {
                    self.record(&path, vec![field.to_string()], source);
                    return Ok(value.to_string());
                }
                StoreError::NotFound
            }
            Err(e) => e,
        };

        if let Some(value) = self.fallback.resolve(&path, field) {
            warn!(path = %path, field, error = %store_error, "serving secret from environment fallback");
            self.record(&path, vec![field.to_string()], SecretSource::Fallback);
            return Ok(value);
        }

        Err(exhausted(&path, Some(field), &store_error))
    }

    /// Returns the whole bundle at `path`.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`SecretBroker::get`].
    #[instrument(skip(self))]
    pub async fn get_bundle(&self, path: &str) -> Result<Arc<SecretBundle>> {
        let path = SecretPath::new(path)?;

        let store_error = match self.fetch(&path).await {
            Ok((bundle, source)) => {
                self.record(&path, bundle.field_names(), source);
                return Ok(bundle);
            }
            Err(e) => e,
        };

        if let Some(fields) = self.fallback.resolve_bundle(&path) {
            warn!(path = %path, error = %store_error, "serving bundle from environment fallback");
            let bundle = Arc::new(SecretBundle::new(fields, 0));
            self.record(&path, bundle.field_names(), SecretSource::Fallback);
            return Ok(bundle);
        }

        Err(exhausted(&path, None, &store_error))
    }

    /// Cache, then store under the retry policy. Never consults the fallback.
    async fn fetch(&self, path: &SecretPath) -> std::result::Result<(Arc<SecretBundle>, SecretSource), StoreError> {
        if let Some(bundle) = self.cache.get(path) {
            debug!(path = %path, "secret cache hit");
            return Ok((bundle, SecretSource::Cache));
        }

        let adapter = &self.adapter;
        let bundle = self.retry.run("read", || adapter.read(path)).await?;
        debug!(path = %path, version = bundle.version(), "fetched secret from store");
        Ok((self.cache.insert(path.clone(), bundle), SecretSource::Store))
    }

    fn record(&self, path: &SecretPath, fields: Vec<String>, source: SecretSource) {
        self.audit.emit(AccessRecord::new(path.clone(), fields, source));
    }

    /// Drops the cached entry for `path`. Returns true if one was present.
    ///
    /// # Errors
    ///
    /// Returns an error if `path` is not a valid secret path.
    pub fn invalidate(&self, path: &str) -> Result<bool> {
        let path = SecretPath::new(path)?;
        Ok(self.cache.invalidate(&path))
    }

    /// Drops every cached entry.
    pub fn clear_cache(&self) {
        self.cache.clear();
        info!("secret cache cleared");
    }

    /// Returns the number of cached bundles.
    #[must_use]
    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    /// Writes a new version of the bundle at `path` and invalidates its cache entry.
    ///
    /// This is an administrative operation; reads never write.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SecretStoreUnavailable`] if the store rejects or
    /// cannot take the write.
    #[instrument(skip(self, fields))]
    pub async fn put_bundle(&self, path: &str, fields: BTreeMap<String, String>) -> Result<u64> {
        let path = SecretPath::new(path)?;
        let adapter = &self.adapter;
        let version = self
            .single_attempt()
            .run("write", || adapter.write(&path, &fields))
            .await
            .map_err(|e| exhausted(&path, None, &e))?;
        self.cache.invalidate(&path);
        info!(path = %path, version, "secret written");
        Ok(version)
    }

    /// Deletes the latest version of the bundle at `path` and invalidates its cache entry.
    ///
    /// # Errors
    ///
    /// [`Error::SecretNotFound`] if nothing exists at `path`, otherwise
    /// [`Error::SecretStoreUnavailable`].
    #[instrument(skip(self))]
    pub async fn delete_bundle(&self, path: &str) -> Result<()> {
        let path = SecretPath::new(path)?;
        let adapter = &self.adapter;
        self.single_attempt()
            .run("delete", || adapter.delete(&path))
            .await
            .map_err(|e| exhausted(&path, None, &e))?;
        self.cache.invalidate(&path);
        info!(path = %path, "secret deleted");
        Ok(())
    }

    fn single_attempt(&self) -> RetryPolicy {
        self.retry.with_max_attempts(1)
    }

    /// Probes the store. Never fails: an unreachable store is reported as unhealthy.
    pub async fn health(&self) -> BrokerHealth {
        let adapter = &self.adapter;
        let probe = self.single_attempt().run("health", || adapter.health()).await;
        let cache_entries = self.cache.len();
        let timestamp = Utc::now();

        match probe {
            Ok(StoreHealth {
                healthy,
                initialized,
                sealed,
            }) => BrokerHealth {
                status: if healthy { "healthy" } else { "unhealthy" },
                initialized: Some(initialized),
                sealed: Some(sealed),
                error: None,
                cache_entries,
                timestamp,
            },
            Err(e) => {
                warn!(error = %e, "secret store health check failed");
                BrokerHealth {
                    status: "unhealthy",
                    initialized: None,
                    sealed: None,
                    error: Some(e.to_string()),
                    cache_entries,
                    timestamp,
                }
            }
        }
    }

    // ===================================================================
    // Typed accessors
    // ===================================================================

    /// Database connection bundle (`url`, `username`, `password`, ...).
    ///
    /// # Errors
    ///
    /// See [`SecretBroker::get_bundle`].
    pub async fn database_config(&self) -> Result<Arc<SecretBundle>> {
        self.get_bundle(DATABASE_CONFIG_PATH).await
    }

    /// Database connection URL.
    ///
    /// # Errors
    ///
    /// See [`SecretBroker::get`].
    pub async fn database_url(&self) -> Result<String> {
        self.get(DATABASE_CONFIG_PATH, "url").await
    }

    /// Message queue bundle.
    ///
    /// # Errors
    ///
    /// See [`SecretBroker::get_bundle`].
    pub async fn queue_config(&self) -> Result<Arc<SecretBundle>> {
        self.get_bundle(QUEUE_CONFIG_PATH).await
    }

    /// Message queue URL.
    ///
    /// # Errors
    ///
    /// See [`SecretBroker::get`].
    pub async fn queue_url(&self) -> Result<String> {
        self.get(QUEUE_CONFIG_PATH, "url").await
    }

    /// Token signing bundle.
    ///
    /// # Errors
    ///
    /// See [`SecretBroker::get_bundle`].
    pub async fn jwt_config(&self) -> Result<Arc<SecretBundle>> {
        self.get_bundle(JWT_CONFIG_PATH).await
    }

    /// Signing key, algorithm and lifetime overrides from `auth/jwt`.
    ///
    /// Only `secret_key` is required; `algorithm` defaults to
    /// [`DEFAULT_SIGNING_ALGORITHM`]. The bundle is read once. When the store
    /// is down each field is taken from the fallback table, and optional
    /// fields missing there fall back to their defaults.
    ///
    /// # Errors
    ///
    /// Fails if `secret_key` cannot be resolved, or a lifetime override is
    /// not a non-negative integer.
    #[instrument(skip(self))]
    pub async fn signing_key(&self) -> Result<SigningKeyMaterial> {
        let path = SecretPath::new(JWT_CONFIG_PATH)?;
        let (bundle, source, store_error) = match self.fetch(&path).await {
            Ok((bundle, source)) => (Some(bundle), source, StoreError::NotFound),
            Err(e) => (None, SecretSource::Fallback, e),
        };

        let mut fields = Vec::new();
        let mut used_fallback = false;
        let mut lookup = |field: &str| {
            let value = match bundle.as_deref().and_then(|b| b.get(field)) {
                Some(value) => Some(value.to_string()),
                None => {
                    let value = self.fallback.resolve(&path, field);
                    used_fallback |= value.is_some();
                    value
                }
            };
            if value.is_some() {
                fields.push(field.to_string());
            }
            value
        };

        let Some(secret_key) = lookup("secret_key") else {
            return Err(exhausted(&path, Some("secret_key"), &store_error));
        };
        let algorithm = lookup("algorithm");
        let access_ttl_minutes = lookup("token_expire_minutes");
        let refresh_ttl_days = lookup("refresh_token_expire_days");

        let source = if used_fallback {
            warn!(path = %path, error = %store_error, "serving signing key fields from environment fallback");
            SecretSource::Fallback
        } else {
            source
        };
        self.record(&path, fields, source);

        Ok(SigningKeyMaterial {
            secret_key,
            algorithm: algorithm.unwrap_or_else(|| DEFAULT_SIGNING_ALGORITHM.to_string()),
            access_ttl_minutes: parse_number(&path, "token_expire_minutes", access_ttl_minutes)?,
            refresh_ttl_days: parse_number(&path, "refresh_token_expire_days", refresh_ttl_days)?,
        })
    }

    /// Master encryption key.
    ///
    /// # Errors
    ///
    /// See [`SecretBroker::get`].
    pub async fn encryption_key(&self) -> Result<String> {
        self.get(ENCRYPTION_PATH, "master_key").await
    }

    /// API key of another platform service, stored as `{service}_service_key`.
    ///
    /// # Errors
    ///
    /// See [`SecretBroker::get`].
    pub async fn service_api_key(&self, service: &str) -> Result<String> {
        self.get(SERVICE_API_KEYS_PATH, &format!("{service}_service_key"))
            .await
    }

    /// Monitoring bundle.
    ///
    /// # Errors
    ///
    /// See [`SecretBroker::get_bundle`].
    pub async fn monitoring_config(&self) -> Result<Arc<SecretBundle>> {
        self.get_bundle(MONITORING_CONFIG_PATH).await
    }

    /// Grafana bundle.
    ///
    /// # Errors
    ///
    /// See [`SecretBroker::get_bundle`].
    pub async fn grafana_config(&self) -> Result<Arc<SecretBundle>> {
        self.get_bundle(GRAFANA_CONFIG_PATH).await
    }
}

impl fmt::Debug for SecretBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretBroker")
            .field("cache", &self.cache)
            .field("fallback", &self.fallback)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

fn parse_number(path: &SecretPath, field: &str, raw: Option<String>) -> Result<Option<u64>> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    raw.trim()
        .parse()
        .map(Some)
        .map_err(|e| Error::InvalidSecretValue {
            path: path.to_string(),
            field: field.to_string(),
            reason: format!("expected a whole number: {e}"),
        })
}

/// Maps the final store error once every source has been tried.
fn exhausted(path: &SecretPath, field: Option<&str>, error: &StoreError) -> Error {
    match error {
        StoreError::NotFound => Error::SecretNotFound {
            path: path.to_string(),
            field: field.map(ToString::to_string),
        },
        other => Error::SecretStoreUnavailable {
            path: path.to_string(),
            reason: other.to_string(),
        },
    }
}
