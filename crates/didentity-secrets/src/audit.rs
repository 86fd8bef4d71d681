//! Audit trail of secret fetches.
//!
//! The broker emits an [`AccessRecord`] for every successful fetch through an
//! [`AuditSink`]. Emission never blocks: records go into a bounded channel and
//! are dropped (and counted) when it is full. An [`AuditLog`] can drain the
//! channel into a bounded in-memory window for querying.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::types::{AccessRecord, SecretPath, SecretSource};

/// Non-blocking producer side of the audit trail.
#[derive(Debug)]
pub struct AuditSink {
    tx: Option<mpsc::Sender<AccessRecord>>,
    dropped: AtomicU64,
}

impl AuditSink {
    /// Creates a sink and the receiver that observes its records.
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<AccessRecord>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let sink = Self {
            tx: Some(tx),
            dropped: AtomicU64::new(0),
        };
        (sink, rx)
    }

    /// Creates a sink that only mirrors records to `tracing`.
    #[must_use]
    pub const fn tracing_only() -> Self {
        Self {
            tx: None,
            dropped: AtomicU64::new(0),
        }
    }

    /// Emits a record without waiting.
    pub fn emit(&self, record: AccessRecord) {
        debug!(
            target: "didentity_audit",
            path = %record.path,
            fields = ?record.fields,
            source = %record.source,
            timestamp = %record.timestamp,
            "secret accessed"
        );

        let Some(tx) = &self.tx else {
            return;
        };

        match tx.try_send(record) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Returns how many records were dropped because the channel was full.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for AuditSink {
    fn default() -> Self {
        Self::tracing_only()
    }
}

/// Filter criteria for querying an [`AuditLog`].
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    /// Filter by secret path.
    pub path: Option<SecretPath>,
    /// Filter by source.
    pub source: Option<SecretSource>,
    /// Filter entries after this time.
    pub after: Option<DateTime<Utc>>,
    /// Maximum number of entries to return.
    pub limit: Option<usize>,
}

impl AuditFilter {
    /// Creates a new empty filter that matches all entries.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Filters by secret path.
    #[must_use]
    pub fn for_path(mut self, path: SecretPath) -> Self {
        self.path = Some(path);
        self
    }

    /// Filters by source.
    #[must_use]
    pub const fn from_source(mut self, source: SecretSource) -> Self {
        self.source = Some(source);
        self
    }

    /// Filters entries after a given time.
    #[must_use]
    pub const fn after(mut self, time: DateTime<Utc>) -> Self {
        self.after = Some(time);
        self
    }

    /// Limits the number of returned entries.
    #[must_use]
    pub const fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    fn matches(&self, record: &AccessRecord) -> bool {
        self.path.as_ref().is_none_or(|p| &record.path == p)
            && self.source.is_none_or(|s| record.source == s)
            && self.after.is_none_or(|t| record.timestamp > t)
    }
}

/// Default number of records an [`AuditLog`] retains.
pub const DEFAULT_AUDIT_LOG_CAPACITY: usize = 10_000;

/// In-memory window over the most recent access records.
///
/// Once `capacity` records are held, each new record evicts the oldest.
#[derive(Debug)]
pub struct AuditLog {
    entries: RwLock<VecDeque<AccessRecord>>,
    capacity: usize,
    evicted: AtomicU64,
}

impl AuditLog {
    /// Creates a log holding up to [`DEFAULT_AUDIT_LOG_CAPACITY`] records.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_AUDIT_LOG_CAPACITY)
    }

    /// Creates a log holding up to `capacity` records (at least one).
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(VecDeque::new()),
            capacity: capacity.max(1),
            evicted: AtomicU64::new(0),
        }
    }

    /// Returns the maximum number of retained records.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns how many records were evicted to make room.
    #[must_use]
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    /// Appends a record, evicting the oldest when full.
    pub fn record(&self, record: AccessRecord) {
        let mut entries = self.entries.write();
        while entries.len() >= self.capacity {
            entries.pop_front();
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        entries.push_back(record);
    }

    /// Returns the records matching `filter`, oldest first.
    #[must_use]
    pub fn query(&self, filter: &AuditFilter) -> Vec<AccessRecord> {
        let entries = self.entries.read();
        let matching = entries.iter().filter(|r| filter.matches(r)).cloned();
        match filter.limit {
            Some(n) => matching.take(n).collect(),
            None => matching.collect(),
        }
    }

    /// Returns the number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Returns true if no records were collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Spawns a task that drains `rx` into this log until the sink is dropped.
    pub fn spawn_collector(self: &Arc<Self>, mut rx: mpsc::Receiver<AccessRecord>) -> JoinHandle<()> {
        let log = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                log.record(record);
            }
        })
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new()
    }
}
