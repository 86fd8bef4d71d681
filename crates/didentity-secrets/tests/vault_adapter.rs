//! Integration tests for the Vault KV v2 adapter against a fake Vault.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use didentity_secrets::{
    EnvFallback, RetryPolicy, SecretBroker, SecretCache, SecretPath, SecretStoreAdapter,
    StoreConfig, StoreError, VaultKvAdapter,
};
use parking_lot::Mutex;
use serde_json::{Map, Value, json};

const TOKEN: &str = "s.test-token";

#[derive(Default)]
struct FakeVault {
    secrets: Mutex<HashMap<String, (Map<String, Value>, u64)>>,
    down: AtomicBool,
    sealed: AtomicBool,
}

type Shared = Arc<FakeVault>;

fn authorized(headers: &HeaderMap) -> bool {
    headers.get("X-Vault-Token").and_then(|v| v.to_str().ok()) == Some(TOKEN)
}

fn vault_error(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "errors": [message] }))).into_response()
}

fn guard(vault: &FakeVault, headers: &HeaderMap) -> Option<Response> {
    if vault.down.load(Ordering::SeqCst) {
        return Some(vault_error(StatusCode::SERVICE_UNAVAILABLE, "Vault is sealed"));
    }
    if !authorized(headers) {
        return Some(vault_error(StatusCode::FORBIDDEN, "permission denied"));
    }
    None
}

async fn read_secret(State(vault): State<Shared>, Path(path): Path<String>, headers: HeaderMap) -> Response {
    if let Some(rejection) = guard(&vault, &headers) {
        return rejection;
    }
    match vault.secrets.lock().get(&path) {
        Some((data, version)) => Json(json!({
            "data": {
                "data": data,
                "metadata": { "version": version, "destroyed": false, "deletion_time": "" }
            }
        }))
        .into_response(),
        None => vault_error(StatusCode::NOT_FOUND, ""),
    }
}

async fn write_secret(
    State(vault): State<Shared>,
    Path(path): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if let Some(rejection) = guard(&vault, &headers) {
        return rejection;
    }
    let data = body["data"].as_object().cloned().unwrap_or_default();
    let mut secrets = vault.secrets.lock();
    let version = secrets.get(&path).map_or(1, |(_, v)| v + 1);
    secrets.insert(path, (data, version));
    Json(json!({ "data": { "version": version } })).into_response()
}

async fn delete_secret(State(vault): State<Shared>, Path(path): Path<String>, headers: HeaderMap) -> Response {
    if let Some(rejection) = guard(&vault, &headers) {
        return rejection;
    }
    if vault.secrets.lock().remove(&path).is_some() {
        StatusCode::NO_CONTENT.into_response()
    } else {
        vault_error(StatusCode::NOT_FOUND, "")
    }
}

async fn health(State(vault): State<Shared>) -> Response {
    let sealed = vault.sealed.load(Ordering::SeqCst);
    let status = if sealed {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (status, Json(json!({ "initialized": true, "sealed": sealed }))).into_response()
}

async fn start_fake_vault() -> (SocketAddr, Shared) {
    let vault: Shared = Arc::new(FakeVault::default());
    let app = Router::new()
        .route(
            "/v1/kv/data/{*path}",
            get(read_secret).post(write_secret).delete(delete_secret),
        )
        .route("/v1/sys/health", get(health))
        .with_state(Arc::clone(&vault));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, vault)
}

fn seed(vault: &FakeVault, path: &str, data: Value) {
    let data = data.as_object().cloned().unwrap_or_default();
    vault.secrets.lock().insert(path.to_string(), (data, 1));
}

fn adapter(addr: SocketAddr, token: &str) -> VaultKvAdapter {
    VaultKvAdapter::new(&StoreConfig::new(format!("http://{addr}"), token)).unwrap()
}

fn path(p: &str) -> SecretPath {
    SecretPath::new(p).unwrap()
}

// ===========================================================================
// Adapter
// ===========================================================================

#[tokio::test]
async fn reads_kv_v2_payload() {
    let (addr, vault) = start_fake_vault().await;
    seed(
        &vault,
        "database/config",
        json!({ "url": "postgresql://db/identity", "port": 5432 }),
    );

    let bundle = adapter(addr, TOKEN).read(&path("database/config")).await.unwrap();
    assert_eq!(bundle.version(), 1);
    assert_eq!(bundle.get("url"), Some("postgresql://db/identity"));
    assert_eq!(bundle.get("port"), Some("5432"));
}

#[tokio::test]
async fn missing_secret_is_not_found() {
    let (addr, _vault) = start_fake_vault().await;
    let result = adapter(addr, TOKEN).read(&path("auth/jwt")).await;
    assert_eq!(result.err(), Some(StoreError::NotFound));
}

#[tokio::test]
async fn wrong_token_is_denied() {
    let (addr, vault) = start_fake_vault().await;
    seed(&vault, "auth/jwt", json!({ "secret_key": "k" }));

    let result = adapter(addr, "s.wrong").read(&path("auth/jwt")).await;
    assert_eq!(result.err(), Some(StoreError::Denied("permission denied".to_string())));
}

#[tokio::test]
async fn server_errors_are_transient() {
    let (addr, vault) = start_fake_vault().await;
    vault.down.store(true, Ordering::SeqCst);

    let err = adapter(addr, TOKEN).read(&path("auth/jwt")).await.unwrap_err();
    assert!(err.is_transient());
}

#[tokio::test]
async fn unreachable_store_is_transient() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let err = adapter(addr, TOKEN).read(&path("auth/jwt")).await.unwrap_err();
    assert!(err.is_transient());
}

#[tokio::test]
async fn write_then_delete() {
    let (addr, _vault) = start_fake_vault().await;
    let adapter = adapter(addr, TOKEN);
    let fields = BTreeMap::from([("master_key".to_string(), "m1".to_string())]);

    assert_eq!(adapter.write(&path("security/encryption"), &fields).await, Ok(1));
    assert_eq!(adapter.write(&path("security/encryption"), &fields).await, Ok(2));
    assert_eq!(adapter.delete(&path("security/encryption")).await, Ok(()));
    assert_eq!(
        adapter.read(&path("security/encryption")).await.err(),
        Some(StoreError::NotFound)
    );
}

#[tokio::test]
async fn health_reports_seal_status() {
    let (addr, vault) = start_fake_vault().await;
    let adapter = adapter(addr, TOKEN);

    let health = adapter.health().await.unwrap();
    assert!(health.healthy);
    assert!(!health.sealed);

    vault.sealed.store(true, Ordering::SeqCst);
    let health = adapter.health().await.unwrap();
    assert!(!health.healthy);
    assert!(health.sealed);
}

// ===========================================================================
// Broker over the HTTP adapter
// ===========================================================================

#[tokio::test]
async fn broker_falls_back_when_vault_is_down() {
    let (addr, vault) = start_fake_vault().await;
    seed(&vault, "database/config", json!({ "password": "from-vault" }));
    vault.down.store(true, Ordering::SeqCst);

    let broker = SecretBroker::new(Arc::new(adapter(addr, TOKEN)), Arc::new(SecretCache::default()))
        .with_fallback(EnvFallback::standard().with_vars([("DB_PASSWORD", "from-env")]))
        .with_retry_policy(RetryPolicy::default().with_initial_backoff(Duration::from_millis(5)));

    assert_eq!(broker.get("database/config", "password").await.unwrap(), "from-env");
    assert_eq!(broker.cache_len(), 0);

    vault.down.store(false, Ordering::SeqCst);
    assert_eq!(broker.get("database/config", "password").await.unwrap(), "from-vault");
    assert_eq!(broker.cache_len(), 1);
}

#[tokio::test]
async fn broker_health_over_http() {
    let (addr, _vault) = start_fake_vault().await;
    let broker = SecretBroker::new(Arc::new(adapter(addr, TOKEN)), Arc::new(SecretCache::default()));

    let health = broker.health().await;
    assert!(health.is_healthy());
    assert_eq!(health.initialized, Some(true));
}
