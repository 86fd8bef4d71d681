//! Error types for the secret broker.

use thiserror::Error;

/// Errors surfaced by the secret broker to its callers.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid secret path format.
    #[error("invalid secret path: {reason}")]
    InvalidSecretPath {
        /// The reason the path is invalid.
        reason: String,
    },

    /// The bundle or field does not exist in any source of the fallback chain.
    #[error("secret not found: {}", display_target(.path, .field.as_deref()))]
    SecretNotFound {
        /// The secret path that was requested.
        path: String,
        /// The field that was requested, if any.
        field: Option<String>,
    },

    /// Neither the cache, the store, nor the environment could serve the request.
    #[error("secret store unavailable for {path}: {reason}")]
    SecretStoreUnavailable {
        /// The secret path that was requested.
        path: String,
        /// The last error observed from the store.
        reason: String,
    },

    /// A secret value exists but cannot be interpreted.
    #[error("invalid value for {path}.{field}: {reason}")]
    InvalidSecretValue {
        /// The secret path.
        path: String,
        /// The offending field.
        field: String,
        /// Why the value was rejected.
        reason: String,
    },

    /// Broker or adapter configuration is invalid.
    #[error("configuration error: {reason}")]
    Configuration {
        /// The reason the configuration is invalid.
        reason: String,
    },
}

fn display_target(path: &str, field: Option<&str>) -> String {
    match field {
        Some(field) => format!("{path}.{field}"),
        None => path.to_string(),
    }
}

/// Result type alias for broker operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors reported by a secret store adapter for a single request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The store answered that the path does not exist.
    #[error("not found")]
    NotFound,

    /// The store refused the credential presented.
    #[error("access denied: {0}")]
    Denied(String),

    /// Transport failure, timeout, or server-side error.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// The store answered with a payload that could not be understood.
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl StoreError {
    /// Returns true if the request may succeed when retried.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Result type alias for adapter operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;
