//! Transport-level access to the remote secret store.
//!
//! [`SecretStoreAdapter`] is the seam the broker talks through.
//! [`VaultKvAdapter`] speaks the HashiCorp Vault KV v2 HTTP API:
//!
//! - read: `GET {addr}/v1/{mount}/data/{path}`
//! - write: `POST {addr}/v1/{mount}/data/{path}` with `{"data": {...}}`
//! - delete: `DELETE {addr}/v1/{mount}/data/{path}`
//! - health: `GET {addr}/v1/sys/health`
//!
//! Every request carries the `X-Vault-Token` bearer credential.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{debug, instrument};
use url::Url;
use zeroize::Zeroizing;

use crate::config::StoreConfig;
use crate::error::{Error, Result, StoreError, StoreResult};
use crate::types::{SecretBundle, SecretPath};

static APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Health-check status codes Vault uses for a serving node
/// (active, standby, DR secondary, performance standby).
const HEALTHY_STATUS_CODES: [u16; 4] = [200, 429, 472, 473];

/// Health information reported by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreHealth {
    /// Whether the store is able to serve reads.
    pub healthy: bool,
    /// Whether the store has been initialized.
    pub initialized: bool,
    /// Whether the store is sealed.
    pub sealed: bool,
}

/// Authenticated reads and writes against a hierarchical key-value secret service.
#[async_trait]
pub trait SecretStoreAdapter: Send + Sync {
    /// Reads the latest version of the bundle at `path`.
    async fn read(&self, path: &SecretPath) -> StoreResult<SecretBundle>;

    /// Writes a new version of the bundle at `path`, returning the version number.
    async fn write(&self, path: &SecretPath, fields: &BTreeMap<String, String>) -> StoreResult<u64>;

    /// Deletes the latest version of the bundle at `path`.
    async fn delete(&self, path: &SecretPath) -> StoreResult<()>;

    /// Probes the store's health endpoint.
    async fn health(&self) -> StoreResult<StoreHealth>;
}

#[derive(Deserialize)]
struct KvReadResponse {
    data: KvReadData,
}

#[derive(Deserialize)]
struct KvReadData {
    data: Option<Map<String, Value>>,
    metadata: KvMetadata,
}

#[derive(Deserialize)]
struct KvMetadata {
    version: u64,
    #[serde(default)]
    destroyed: bool,
    #[serde(default)]
    deletion_time: String,
}

#[derive(Deserialize)]
struct KvWriteResponse {
    data: KvWriteData,
}

#[derive(Deserialize)]
struct KvWriteData {
    version: u64,
}

#[derive(Deserialize)]
struct HealthResponse {
    #[serde(default)]
    initialized: bool,
    #[serde(default = "default_sealed")]
    sealed: bool,
}

const fn default_sealed() -> bool {
    true
}

/// Adapter for the Vault KV v2 secrets engine.
#[derive(Clone)]
pub struct VaultKvAdapter {
    client: Client,
    base_url: Url,
    mount: String,
    token: Zeroizing<String>,
}

impl VaultKvAdapter {
    /// Creates an adapter from store configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the address is not an http(s) URL or the HTTP
    /// client cannot be built.
    pub fn new(config: &StoreConfig) -> Result<Self> {
        let mut base_url = Url::parse(&config.address).map_err(|e| Error::Configuration {
            reason: format!("invalid store address '{}': {e}", config.address),
        })?;

        if !matches!(base_url.scheme(), "http" | "https") {
            return Err(Error::Configuration {
                reason: format!("unsupported scheme '{}'", base_url.scheme()),
            });
        }

        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let client = Client::builder()
            .user_agent(APP_USER_AGENT)
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| Error::Configuration {
                reason: format!("failed to build http client: {e}"),
            })?;

        Ok(Self {
            client,
            base_url,
            mount: config.mount.trim_matches('/').to_string(),
            token: Zeroizing::new(config.token.clone()),
        })
    }

    /// Returns the base address of the store.
    #[must_use]
    pub fn address(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, suffix: &str) -> StoreResult<Url> {
        self.base_url
            .join(suffix)
            .map_err(|e| StoreError::InvalidResponse(format!("bad endpoint '{suffix}': {e}")))
    }

    fn data_url(&self, path: &SecretPath) -> StoreResult<Url> {
        self.endpoint(&format!("v1/{}/data/{}", self.mount, path))
    }

    async fn send(&self, method: Method, url: Url, body: Option<Value>) -> StoreResult<reqwest::Response> {
        let mut request = self
            .client
            .request(method, url)
            .header("X-Vault-Token", self.token.as_str());
        if let Some(body) = body {
            request = request.json(&body);
        }
        request
            .send()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }
}

/// Maps a non-success status to the adapter's error taxonomy.
async fn status_error(response: reqwest::Response) -> StoreError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let detail = vault_error_message(&body).unwrap_or(body);
    match status {
        StatusCode::NOT_FOUND => StoreError::NotFound,
        StatusCode::FORBIDDEN | StatusCode::UNAUTHORIZED => StoreError::Denied(detail),
        s if s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS => {
            StoreError::Unavailable(format!("{s}: {detail}"))
        }
        s => StoreError::InvalidResponse(format!("{s}: {detail}")),
    }
}

/// Extracts the first entry of Vault's `{"errors": [...]}` body.
fn vault_error_message(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    value["errors"][0].as_str().map(ToString::to_string)
}

fn value_to_string(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

#[async_trait]
impl SecretStoreAdapter for VaultKvAdapter {
    #[instrument(skip(self), fields(path = %path))]
    async fn read(&self, path: &SecretPath) -> StoreResult<SecretBundle> {
        let url = self.data_url(path)?;
        let response = self.send(Method::GET, url, None).await?;
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }

        let parsed: KvReadResponse = response
            .json()
            .await
            .map_err(|e| StoreError::InvalidResponse(format!("failed to decode read response: {e}")))?;

        let metadata = parsed.data.metadata;
        if metadata.destroyed || !metadata.deletion_time.is_empty() {
            debug!(version = metadata.version, "latest version is deleted");
            return Err(StoreError::NotFound);
        }

        let data = parsed.data.data.ok_or(StoreError::NotFound)?;
        let fields: BTreeMap<String, String> = data
            .into_iter()
            .map(|(k, v)| (k, value_to_string(v)))
            .collect();

        debug!(version = metadata.version, fields = fields.len(), "read secret from store");
        Ok(SecretBundle::new(fields, metadata.version))
    }

    #[instrument(skip(self, fields), fields(path = %path))]
    async fn write(&self, path: &SecretPath, fields: &BTreeMap<String, String>) -> StoreResult<u64> {
        let url = self.data_url(path)?;
        let response = self
            .send(Method::POST, url, Some(json!({ "data": fields })))
            .await?;
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }

        let parsed: KvWriteResponse = response
            .json()
            .await
            .map_err(|e| StoreError::InvalidResponse(format!("failed to decode write response: {e}")))?;
        Ok(parsed.data.version)
    }

    #[instrument(skip(self), fields(path = %path))]
    async fn delete(&self, path: &SecretPath) -> StoreResult<()> {
        let url = self.data_url(path)?;
        let response = self.send(Method::DELETE, url, None).await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(status_error(response).await)
        }
    }

    async fn health(&self) -> StoreResult<StoreHealth> {
        let url = self.endpoint("v1/sys/health")?;
        let response = self.send(Method::GET, url, None).await?;
        let healthy = HEALTHY_STATUS_CODES.contains(&response.status().as_u16());
        let body: HealthResponse = response
            .json()
            .await
            .map_err(|e| StoreError::InvalidResponse(format!("failed to decode health response: {e}")))?;
        Ok(StoreHealth {
            healthy,
            initialized: body.initialized,
            sealed: body.sealed,
        })
    }
}

impl fmt::Debug for VaultKvAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VaultKvAdapter")
            .field("base_url", &self.base_url.as_str())
            .field("mount", &self.mount)
            .field("token", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}
