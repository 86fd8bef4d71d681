//! # DIDentity Secrets
//!
//! This crate gives platform services cached, fail-over-aware access to the
//! centralized secret store (HashiCorp Vault KV v2):
//!
//! - **Adapter**: authenticated transport to the store ([`VaultKvAdapter`],
//!   or [`MemorySecretStore`] for tests)
//! - **Cache**: time-boxed snapshots of fetched bundles ([`SecretCache`])
//! - **Fallback**: a static `(path, field) -> ENV_VAR` table ([`EnvFallback`])
//! - **Audit**: non-blocking records of every successful fetch ([`AuditSink`])
//!
//! # Example
//!
//! ```rust,no_run
//! use didentity_secrets::{BrokerConfig, EnvFallback, SecretBroker, StoreConfig};
//!
//! # async fn example() -> didentity_secrets::Result<()> {
//! let config = BrokerConfig::new(StoreConfig::new("http://vault:8200", "root"));
//! let (broker, _audit) = SecretBroker::from_config(&config, EnvFallback::standard())?;
//!
//! let database_url = broker.database_url().await?;
//! let signing = broker.signing_key().await?;
//! # let _ = (database_url, signing);
//! # Ok(())
//! # }
//! ```

pub mod adapter;
pub mod audit;
pub mod broker;
pub mod cache;
pub mod config;
pub mod error;
pub mod fallback;
pub mod memory;
pub mod retry;
pub mod types;

pub use adapter::{SecretStoreAdapter, StoreHealth, VaultKvAdapter};
pub use audit::{AuditFilter, AuditLog, AuditSink, DEFAULT_AUDIT_LOG_CAPACITY};
pub use broker::{BrokerHealth, SecretBroker, SigningKeyMaterial};
pub use cache::SecretCache;
pub use config::{BrokerConfig, StoreConfig};
pub use error::{Error, Result, StoreError, StoreResult};
pub use fallback::{EnvFallback, FallbackMapping, STANDARD_MAPPINGS};
pub use memory::MemorySecretStore;
pub use retry::RetryPolicy;
pub use types::{AccessRecord, SecretBundle, SecretPath, SecretSource};
