//! Core types for the secret broker.
//!
//! - [`SecretPath`]: a validated, slash-delimited secret location
//! - [`SecretBundle`]: a versioned field map fetched from a source
//! - [`SecretSource`]: where a value was served from
//! - [`AccessRecord`]: an audit record of a successful fetch

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::error::{Error, Result};

/// A validated path identifying a secret bundle, e.g. `database/config`.
///
/// Paths are case-sensitive. They must:
/// - Be between 1 and 512 bytes
/// - Not start or end with `/`
/// - Not contain empty, `.` or `..` segments
/// - Contain only ASCII alphanumerics, `-`, `_`, `.` within segments
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SecretPath(String);

impl SecretPath {
    /// Maximum length of a secret path.
    pub const MAX_LENGTH: usize = 512;

    /// Creates a new `SecretPath` after validating the input.
    ///
    /// # Errors
    ///
    /// Returns an error if the path is invalid.
    pub fn new(path: impl Into<String>) -> Result<Self> {
        let path = path.into();
        Self::validate(&path)?;
        Ok(Self(path))
    }

    /// Returns the path as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Iterates over the path segments.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/')
    }

    fn validate(path: &str) -> Result<()> {
        if path.is_empty() {
            return Err(Error::InvalidSecretPath {
                reason: "path cannot be empty".to_string(),
            });
        }

        if path.len() > Self::MAX_LENGTH {
            return Err(Error::InvalidSecretPath {
                reason: format!("path exceeds maximum length of {} bytes", Self::MAX_LENGTH),
            });
        }

        for segment in path.split('/') {
            if segment.is_empty() {
                return Err(Error::InvalidSecretPath {
                    reason: "path contains an empty segment".to_string(),
                });
            }
            if segment == "." || segment == ".." {
                return Err(Error::InvalidSecretPath {
                    reason: format!("path segment '{segment}' is not allowed"),
                });
            }
            if let Some(c) = segment
                .chars()
                .find(|c| !c.is_ascii_alphanumeric() && !matches!(c, '-' | '_' | '.'))
            {
                return Err(Error::InvalidSecretPath {
                    reason: format!("path contains invalid character '{c}'"),
                });
            }
        }

        Ok(())
    }
}

impl fmt::Display for SecretPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for SecretPath {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl TryFrom<&str> for SecretPath {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self> {
        Self::new(value)
    }
}

impl From<SecretPath> for String {
    fn from(path: SecretPath) -> Self {
        path.0
    }
}

impl AsRef<str> for SecretPath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A versioned map of field name to value, as fetched from one source.
///
/// Values are zeroized when the bundle is dropped and never appear in
/// `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretBundle {
    fields: BTreeMap<String, String>,
    version: u64,
    fetched_at: DateTime<Utc>,
}

impl SecretBundle {
    /// Creates a bundle fetched now.
    #[must_use]
    pub fn new(fields: BTreeMap<String, String>, version: u64) -> Self {
        Self {
            fields,
            version,
            fetched_at: Utc::now(),
        }
    }

    /// Builds a bundle from `(field, value)` pairs.
    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>, version: u64) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        let fields = pairs
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        Self::new(fields, version)
    }

    /// Returns the value of a field.
    #[must_use]
    pub fn get(&self, field: &str) -> Option<&str> {
        self.fields.get(field).map(String::as_str)
    }

    /// Returns the field map.
    #[must_use]
    pub const fn fields(&self) -> &BTreeMap<String, String> {
        &self.fields
    }

    /// Returns the field names in order.
    #[must_use]
    pub fn field_names(&self) -> Vec<String> {
        self.fields.keys().cloned().collect()
    }

    /// Returns the store version of this bundle (0 for synthesized bundles).
    #[must_use]
    pub const fn version(&self) -> u64 {
        self.version
    }

    /// Returns when the bundle was fetched.
    #[must_use]
    pub const fn fetched_at(&self) -> DateTime<Utc> {
        self.fetched_at
    }

    /// Returns the number of fields.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Returns true if the bundle has no fields.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl Drop for SecretBundle {
    fn drop(&mut self) {
        for value in self.fields.values_mut() {
            value.zeroize();
        }
    }
}

impl fmt::Debug for SecretBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretBundle")
            .field("fields", &self.fields.keys().collect::<Vec<_>>())
            .field("version", &self.version)
            .field("fetched_at", &self.fetched_at)
            .field("values", &"[REDACTED]")
            .finish()
    }
}

/// Where a secret was served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecretSource {
    /// Served from the in-memory cache.
    Cache,
    /// Fetched from the secret store.
    Store,
    /// Resolved from the environment fallback table.
    Fallback,
}

impl fmt::Display for SecretSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Cache => "cache",
            Self::Store => "store",
            Self::Fallback => "fallback",
        };
        f.write_str(name)
    }
}

/// Audit record of one successful secret fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessRecord {
    /// The path that was read.
    pub path: SecretPath,
    /// The fields that were handed to the caller.
    pub fields: Vec<String>,
    /// When the fetch completed.
    pub timestamp: DateTime<Utc>,
    /// Which source satisfied the request.
    pub source: SecretSource,
}

impl AccessRecord {
    /// Creates a record timestamped now.
    #[must_use]
    pub fn new(path: SecretPath, fields: Vec<String>, source: SecretSource) -> Self {
        Self {
            path,
            fields,
            timestamp: Utc::now(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use test_case::test_case;

    #[test_case("database/config" ; "two segments")]
    #[test_case("auth/jwt" ; "short")]
    #[test_case("services/api_keys" ; "underscore")]
    #[test_case("Monitoring/Config.v2" ; "mixed case and dot")]
    #[test_case("single" ; "one segment")]
    fn valid_paths(path: &str) {
        assert!(SecretPath::new(path).is_ok());
    }

    #[test_case("" ; "empty")]
    #[test_case("/database/config" ; "leading slash")]
    #[test_case("database/config/" ; "trailing slash")]
    #[test_case("database//config" ; "empty segment")]
    #[test_case("database/../config" ; "parent segment")]
    #[test_case("database/./config" ; "current segment")]
    #[test_case("database/con fig" ; "space")]
    #[test_case("database/config?x=1" ; "query")]
    fn invalid_paths(path: &str) {
        assert!(matches!(
            SecretPath::new(path),
            Err(Error::InvalidSecretPath { .. })
        ));
    }

    #[test]
    fn path_is_case_sensitive() {
        let lower = SecretPath::new("auth/jwt").ok();
        let upper = SecretPath::new("Auth/JWT").ok();
        assert!(lower.is_some());
        assert_ne!(lower, upper);
    }

    #[test]
    fn path_too_long() {
        let path = "a".repeat(SecretPath::MAX_LENGTH + 1);
        assert!(SecretPath::new(path).is_err());
    }

    #[test]
    fn path_segments() {
        let path = SecretPath::new("services/api_keys/did").ok();
        let segments: Vec<_> = path.iter().flat_map(SecretPath::segments).collect();
        assert_eq!(segments, vec!["services", "api_keys", "did"]);
    }

    #[test]
    fn path_serde_roundtrip_rejects_invalid() {
        let ok: std::result::Result<SecretPath, _> = serde_json::from_str("\"auth/jwt\"");
        assert!(ok.is_ok());
        let bad: std::result::Result<SecretPath, _> = serde_json::from_str("\"/auth\"");
        assert!(bad.is_err());
    }

    #[test]
    fn bundle_accessors() {
        let bundle = SecretBundle::from_pairs([("url", "postgres://db"), ("password", "pw")], 3);
        assert_eq!(bundle.get("url"), Some("postgres://db"));
        assert_eq!(bundle.get("missing"), None);
        assert_eq!(bundle.version(), 3);
        assert_eq!(bundle.len(), 2);
        assert_eq!(bundle.field_names(), vec!["password", "url"]);
    }

    #[test]
    fn bundle_debug_redacted() {
        let bundle = SecretBundle::from_pairs([("secret_key", "hunter2")], 1);
        let debug = format!("{bundle:?}");
        assert!(debug.contains("[REDACTED]"));
        assert!(debug.contains("secret_key"));
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn source_display() {
        assert_eq!(SecretSource::Cache.to_string(), "cache");
        assert_eq!(SecretSource::Store.to_string(), "store");
        assert_eq!(SecretSource::Fallback.to_string(), "fallback");
        assert_eq!(
            serde_json::to_string(&SecretSource::Fallback).ok().as_deref(),
            Some("\"fallback\"")
        );
    }

    proptest! {
        #[test]
        fn generated_paths_are_accepted(
            segments in proptest::collection::vec("[a-zA-Z0-9_-][a-zA-Z0-9_.-]{0,15}", 1..5)
        ) {
            let segments: Vec<String> = segments
                .into_iter()
                .filter(|s| s != "." && s != "..")
                .collect();
            prop_assume!(!segments.is_empty());
            let path = segments.join("/");
            prop_assert!(SecretPath::new(path).is_ok());
        }

        #[test]
        fn slashes_at_edges_are_rejected(body in "[a-z]{1,10}") {
            let leading = format!("/{body}");
            let trailing = format!("{body}/");
            prop_assert!(SecretPath::new(leading).is_err());
            prop_assert!(SecretPath::new(trailing).is_err());
        }
    }
}
