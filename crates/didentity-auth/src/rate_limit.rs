//! Sliding-window rate limiting for authentication endpoints.
//!
//! [`RateLimiter::admit`] never errors: a rejected attempt is `false`, and
//! the caller turns it into [`AuthError::TooManyAttempts`](crate::AuthError).
//! The Redis limiter admits when Redis cannot be reached, so an outage of the
//! shared store degrades throttling rather than blocking logins.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::Script;
use redis::aio::ConnectionManager;
use tracing::{debug, warn};

use crate::error::{AuthError, Result};

/// Sliding window parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Attempts allowed per window.
    pub max_attempts: u32,
    /// Window length.
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            window: Duration::from_secs(60),
        }
    }
}

impl RateLimitConfig {
    /// Creates a configuration.
    #[must_use]
    pub const fn new(max_attempts: u32, window: Duration) -> Self {
        Self {
            max_attempts,
            window,
        }
    }
}

/// Per-identity attempt limiter.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Records an attempt for `identity`; false if the window is full.
    async fn admit(&self, identity: &str) -> bool;

    /// Time until `identity` will be admitted again; zero if it would be now.
    async fn retry_after(&self, identity: &str) -> Duration;
}

/// Admits `identity` or reports how long to wait.
///
/// # Errors
///
/// Returns [`AuthError::TooManyAttempts`] when the limiter rejects.
pub async fn check(limiter: &dyn RateLimiter, identity: &str) -> Result<()> {
    if limiter.admit(identity).await {
        return Ok(());
    }
    let retry_after = limiter.retry_after(identity).await;
    debug!(identity, retry_after_ms = retry_after.as_millis() as u64, "attempt rejected");
    Err(AuthError::TooManyAttempts { retry_after })
}

#[derive(Debug)]
struct SlidingWindow {
    timestamps: VecDeque<Instant>,
}

impl SlidingWindow {
    fn new(capacity: u32) -> Self {
        Self {
            timestamps: VecDeque::with_capacity(capacity as usize + 1),
        }
    }

    fn expire(&mut self, now: Instant, window: Duration) {
        let Some(cutoff) = now.checked_sub(window) else {
            return;
        };
        while self.timestamps.front().is_some_and(|t| *t <= cutoff) {
            self.timestamps.pop_front();
        }
    }

    fn try_attempt(&mut self, now: Instant, config: RateLimitConfig) -> bool {
        self.expire(now, config.window);
        if (self.timestamps.len() as u32) < config.max_attempts {
            self.timestamps.push_back(now);
            true
        } else {
            false
        }
    }

    fn time_until_available(&mut self, now: Instant, config: RateLimitConfig) -> Duration {
        self.expire(now, config.window);
        if (self.timestamps.len() as u32) < config.max_attempts {
            return Duration::ZERO;
        }
        self.timestamps
            .front()
            .map_or(Duration::ZERO, |oldest| (*oldest + config.window).saturating_duration_since(now))
    }
}

/// In-process sliding window limiter.
#[derive(Debug)]
pub struct InMemoryRateLimiter {
    config: RateLimitConfig,
    windows: Mutex<HashMap<String, SlidingWindow>>,
}

impl InMemoryRateLimiter {
    /// Creates a limiter.
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> RateLimitConfig {
        self.config
    }

    /// Drops identities with no attempts left in their window.
    pub fn cleanup(&self) -> usize {
        let now = Instant::now();
        let mut windows = self.windows.lock();
        let before = windows.len();
        windows.retain(|_, w| {
            w.expire(now, self.config.window);
            !w.timestamps.is_empty()
        });
        before - windows.len()
    }

    /// Returns the number of tracked identities.
    #[must_use]
    pub fn tracked(&self) -> usize {
        self.windows.lock().len()
    }
}

impl Default for InMemoryRateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}

#[async_trait]
impl RateLimiter for InMemoryRateLimiter {
    async fn admit(&self, identity: &str) -> bool {
        let mut windows = self.windows.lock();
        windows
            .entry(identity.to_string())
            .or_insert_with(|| SlidingWindow::new(self.config.max_attempts))
            .try_attempt(Instant::now(), self.config)
    }

    async fn retry_after(&self, identity: &str) -> Duration {
        let mut windows = self.windows.lock();
        windows
            .get_mut(identity)
            .map_or(Duration::ZERO, |w| w.time_until_available(Instant::now(), self.config))
    }
}

/// Removes attempts that left the window, then records one if there is room.
/// Returns 1 when admitted, 0 otherwise.
const ADMIT_SCRIPT: &str = r"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])
redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window)
if redis.call('ZCARD', key) < limit then
  redis.call('ZADD', key, now, ARGV[4])
  redis.call('PEXPIRE', key, window)
  return 1
end
return 0
";

/// Milliseconds until the oldest attempt leaves a full window, or 0.
const RETRY_AFTER_SCRIPT: &str = r"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])
redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window)
if redis.call('ZCARD', key) < limit then
  return 0
end
local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
return math.max(0, tonumber(oldest[2]) + window - now)
";

/// Default key prefix for rate limit windows in Redis.
pub const DEFAULT_KEY_PREFIX: &str = "didentity:ratelimit:";

/// Sliding window limiter shared across instances through a Redis sorted set.
#[derive(Clone)]
pub struct RedisRateLimiter {
    conn: ConnectionManager,
    config: RateLimitConfig,
    prefix: String,
    deadline: Duration,
    admit_script: Script,
    retry_script: Script,
}

impl RedisRateLimiter {
    /// Connects to Redis at `url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established.
    pub async fn connect(url: &str, config: RateLimitConfig) -> redis::RedisResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self::new(conn, config))
    }

    /// Wraps an existing connection.
    #[must_use]
    pub fn new(conn: ConnectionManager, config: RateLimitConfig) -> Self {
        Self {
            conn,
            config,
            prefix: DEFAULT_KEY_PREFIX.to_string(),
            deadline: Duration::from_millis(250),
            admit_script: Script::new(ADMIT_SCRIPT),
            retry_script: Script::new(RETRY_AFTER_SCRIPT),
        }
    }

    /// Sets the key prefix.
    #[must_use]
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Sets the deadline for each Redis call.
    #[must_use]
    pub const fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    fn now_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    fn window_ms(&self) -> i64 {
        i64::try_from(self.config.window.as_millis()).unwrap_or(i64::MAX)
    }

    async fn run(&self, script: &Script, identity: &str, member: Option<String>) -> Option<i64> {
        let mut conn = self.conn.clone();
        let mut invocation = script.key(format!("{}{identity}", self.prefix));
        invocation
            .arg(Self::now_ms())
            .arg(self.window_ms())
            .arg(self.config.max_attempts);
        if let Some(member) = member {
            invocation.arg(member);
        }

        match tokio::time::timeout(self.deadline, invocation.invoke_async(&mut conn)).await {
            Ok(Ok(value)) => Some(value),
            Ok(Err(e)) => {
                warn!(identity, error = %e, "rate limiter unavailable, admitting");
                None
            }
            Err(_) => {
                warn!(identity, "rate limiter timed out, admitting");
                None
            }
        }
    }
}

#[async_trait]
impl RateLimiter for RedisRateLimiter {
    async fn admit(&self, identity: &str) -> bool {
        let member = uuid::Uuid::new_v4().to_string();
        self.run(&self.admit_script, identity, Some(member))
            .await
            .is_none_or(|admitted| admitted == 1)
    }

    async fn retry_after(&self, identity: &str) -> Duration {
        self.run(&self.retry_script, identity, None)
            .await
            .map_or(Duration::ZERO, |ms| Duration::from_millis(u64::try_from(ms).unwrap_or(0)))
    }
}

impl std::fmt::Debug for RedisRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisRateLimiter")
            .field("config", &self.config)
            .field("prefix", &self.prefix)
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max: u32, window_ms: u64) -> InMemoryRateLimiter {
        InMemoryRateLimiter::new(RateLimitConfig::new(max, Duration::from_millis(window_ms)))
    }

    #[test]
    fn default_is_five_per_minute() {
        let config = RateLimitConfig::default();
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.window, Duration::from_secs(60));
    }

    #[tokio::test]
    async fn admits_exactly_n_attempts() {
        let limiter = limiter(5, 60_000);
        for _ in 0..5 {
            assert!(limiter.admit("ip:10.0.0.1").await);
        }
        assert!(!limiter.admit("ip:10.0.0.1").await);
        assert!(!limiter.admit("ip:10.0.0.1").await);
    }

    #[tokio::test]
    async fn identities_are_independent() {
        let limiter = limiter(1, 60_000);
        assert!(limiter.admit("account:alice").await);
        assert!(!limiter.admit("account:alice").await);
        assert!(limiter.admit("account:bob").await);
    }

    #[tokio::test]
    async fn admission_resumes_after_window() {
        let limiter = limiter(2, 100);
        assert!(limiter.admit("ip:a").await);
        assert!(limiter.admit("ip:a").await);
        assert!(!limiter.admit("ip:a").await);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(limiter.admit("ip:a").await);
    }

    #[tokio::test]
    async fn retry_after_counts_down() {
        let limiter = limiter(1, 60_000);
        assert_eq!(limiter.retry_after("ip:a").await, Duration::ZERO);

        assert!(limiter.admit("ip:a").await);
        let wait = limiter.retry_after("ip:a").await;
        assert!(wait > Duration::from_secs(59));
        assert!(wait <= Duration::from_secs(60));
    }

    #[tokio::test]
    async fn check_maps_rejection() {
        let limiter = limiter(1, 60_000);
        assert!(check(&limiter, "ip:a").await.is_ok());
        let err = check(&limiter, "ip:a").await.unwrap_err();
        assert!(matches!(err, AuthError::TooManyAttempts { retry_after } if retry_after > Duration::ZERO));
    }

    #[tokio::test]
    async fn cleanup_forgets_idle_identities() {
        let limiter = limiter(3, 50);
        assert!(limiter.admit("ip:a").await);
        assert!(limiter.admit("ip:b").await);
        assert_eq!(limiter.tracked(), 2);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(limiter.cleanup(), 2);
        assert_eq!(limiter.tracked(), 0);
    }

    #[tokio::test]
    async fn concurrent_attempts_respect_limit() {
        let limiter = std::sync::Arc::new(limiter(10, 60_000));
        let handles: Vec<_> = (0..50)
            .map(|_| {
                let limiter = std::sync::Arc::clone(&limiter);
                tokio::spawn(async move { limiter.admit("ip:burst").await })
            })
            .collect();

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 10);
    }
}
