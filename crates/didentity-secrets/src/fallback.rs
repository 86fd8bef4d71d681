//! Environment-variable fallback for secrets.
//!
//! The table is declared statically; nothing guesses variable names from
//! paths. The lookup function is injected so tests and embedders can supply
//! their own environment.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::types::SecretPath;

/// One `(path, field) -> environment variable` association.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FallbackMapping {
    /// Secret path.
    pub path: &'static str,
    /// Field within the bundle.
    pub field: &'static str,
    /// Environment variable consulted for the field.
    pub env_var: &'static str,
}

impl FallbackMapping {
    /// Creates a mapping.
    #[must_use]
    pub const fn new(path: &'static str, field: &'static str, env_var: &'static str) -> Self {
        Self {
            path,
            field,
            env_var,
        }
    }
}

/// The platform's standard fallback table.
pub const STANDARD_MAPPINGS: &[FallbackMapping] = &[
    FallbackMapping::new("database/config", "url", "DATABASE_URL"),
    FallbackMapping::new("database/config", "username", "DB_USER"),
    FallbackMapping::new("database/config", "password", "DB_PASSWORD"),
    FallbackMapping::new("auth/jwt", "secret_key", "JWT_SECRET_KEY"),
    FallbackMapping::new("auth/jwt", "algorithm", "JWT_ALGORITHM"),
    FallbackMapping::new("auth/jwt", "token_expire_minutes", "JWT_TOKEN_EXPIRE_MINUTES"),
    FallbackMapping::new("auth/jwt", "refresh_token_expire_days", "JWT_REFRESH_TOKEN_EXPIRE_DAYS"),
    FallbackMapping::new("rabbitmq/config", "url", "RABBITMQ_URL"),
    FallbackMapping::new("rabbitmq/config", "username", "RABBITMQ_USER"),
    FallbackMapping::new("rabbitmq/config", "password", "RABBITMQ_PASSWORD"),
    FallbackMapping::new("security/encryption", "master_key", "ENCRYPTION_MASTER_KEY"),
    FallbackMapping::new("grafana/config", "admin_password", "GRAFANA_ADMIN_PASSWORD"),
];

type Lookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Last-resort resolution of secrets from environment variables.
#[derive(Clone)]
pub struct EnvFallback {
    mappings: Vec<FallbackMapping>,
    lookup: Lookup,
}

impl EnvFallback {
    /// Creates a fallback over `mappings` reading the process environment.
    #[must_use]
    pub fn new(mappings: impl IntoIterator<Item = FallbackMapping>) -> Self {
        Self {
            mappings: mappings.into_iter().collect(),
            lookup: Arc::new(|name: &str| std::env::var(name).ok()),
        }
    }

    /// The standard table over the process environment.
    #[must_use]
    pub fn standard() -> Self {
        Self::new(STANDARD_MAPPINGS.iter().copied())
    }

    /// A fallback that never resolves anything.
    #[must_use]
    pub fn disabled() -> Self {
        Self::new(Vec::<FallbackMapping>::new())
    }

    /// Replaces the environment lookup function.
    #[must_use]
    pub fn with_lookup<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        self.lookup = Arc::new(lookup);
        self
    }

    /// Replaces the environment with a fixed set of variables.
    #[must_use]
    pub fn with_vars<K, V>(self, vars: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        let vars: BTreeMap<String, String> = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        self.with_lookup(move |name| vars.get(name).cloned())
    }

    /// Returns the environment variable mapped to `(path, field)`.
    #[must_use]
    pub fn env_var_for(&self, path: &SecretPath, field: &str) -> Option<&'static str> {
        self.mappings
            .iter()
            .find(|m| m.path == path.as_str() && m.field == field)
            .map(|m| m.env_var)
    }

    /// Resolves a single field. Empty values count as absent.
    #[must_use]
    pub fn resolve(&self, path: &SecretPath, field: &str) -> Option<String> {
        let var = self.env_var_for(path, field)?;
        (self.lookup)(var).filter(|v| !v.is_empty())
    }

    /// Resolves every mapped field of `path`; `None` if none resolve.
    #[must_use]
    pub fn resolve_bundle(&self, path: &SecretPath) -> Option<BTreeMap<String, String>> {
        let fields: BTreeMap<String, String> = self
            .mappings
            .iter()
            .filter(|m| m.path == path.as_str())
            .filter_map(|m| {
                (self.lookup)(m.env_var)
                    .filter(|v| !v.is_empty())
                    .map(|v| (m.field.to_string(), v))
            })
            .collect();
        (!fields.is_empty()).then_some(fields)
    }

    /// Returns the mappings in declaration order.
    #[must_use]
    pub fn mappings(&self) -> &[FallbackMapping] {
        &self.mappings
    }
}

impl Default for EnvFallback {
    fn default() -> Self {
        Self::standard()
    }
}

impl fmt::Debug for EnvFallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnvFallback")
            .field("mappings", &self.mappings.len())
            .finish_non_exhaustive()
    }
}
