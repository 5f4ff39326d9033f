//! Token-bucket rate limiting per (platform, account)
//!
//! Buckets live behind [`TokenStore`]. The SQLite store keeps them in the
//! `rate_buckets` table so every scheduler process sharing the database
//! draws from the same budget; refill and take happen in one statement.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use crate::config::RateLimitConfig;
use crate::error::{DbError, Result};
use crate::types::Platform;
use crate::Database;

/// Outcome of asking the limiter for a token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Granted,
    /// No token available; one will be after `retry_after`
    Denied { retry_after: Duration },
}

impl Admission {
    pub fn is_granted(&self) -> bool {
        matches!(self, Admission::Granted)
    }
}

/// Result of a single refill-and-take against a bucket
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Take {
    Taken { remaining: f64 },
    Short { available: f64 },
}

/// Refill rate in tokens per millisecond
fn refill_rate(limit: &RateLimitConfig) -> f64 {
    limit.capacity as f64 / (limit.per_secs.max(1) as f64 * 1000.0)
}

/// Atomic bucket storage.
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Refill the bucket up to `now_ms` and take one token if at least one
    /// is available. Must be atomic with respect to every other caller of
    /// the same store.
    async fn take(
        &self,
        platform: Platform,
        account: &str,
        limit: &RateLimitConfig,
        now_ms: i64,
    ) -> Result<Take>;

    /// Drop buckets untouched since `older_than_ms`. Returns how many went.
    async fn prune(&self, older_than_ms: i64) -> Result<u64>;
}

/// Buckets in the shared SQLite database
pub struct SqliteTokenStore {
    db: Database,
}

impl SqliteTokenStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl TokenStore for SqliteTokenStore {
    async fn take(
        &self,
        platform: Platform,
        account: &str,
        limit: &RateLimitConfig,
        now_ms: i64,
    ) -> Result<Take> {
        let capacity = limit.capacity as f64;
        let rate = refill_rate(limit);

        // The upsert's WHERE leaves the row untouched (and RETURNING empty)
        // when the refilled bucket holds less than one token.
        let taken = sqlx::query_as::<_, (f64,)>(
            r#"
            INSERT INTO rate_buckets (platform, account_key, tokens, updated_at_ms)
            VALUES (?1, ?2, ?3 - 1.0, ?4)
            ON CONFLICT(platform, account_key) DO UPDATE SET
                tokens = MIN(?3, rate_buckets.tokens
                    + MAX(0, ?4 - rate_buckets.updated_at_ms) * ?5) - 1.0,
                updated_at_ms = MAX(?4, rate_buckets.updated_at_ms)
            WHERE MIN(?3, rate_buckets.tokens
                    + MAX(0, ?4 - rate_buckets.updated_at_ms) * ?5) >= 1.0
            RETURNING tokens
            "#,
        )
        .bind(platform.as_str())
        .bind(account)
        .bind(capacity)
        .bind(now_ms)
        .bind(rate)
        .fetch_optional(self.db.pool())
        .await
        .map_err(DbError::SqlxError)?;

        if let Some((remaining,)) = taken {
            return Ok(Take::Taken { remaining });
        }

        let row = sqlx::query_as::<_, (f64, i64)>(
            "SELECT tokens, updated_at_ms FROM rate_buckets WHERE platform = ? AND account_key = ?",
        )
        .bind(platform.as_str())
        .bind(account)
        .fetch_optional(self.db.pool())
        .await
        .map_err(DbError::SqlxError)?;

        let available = row
            .map(|(tokens, updated_at_ms)| {
                (tokens + (now_ms - updated_at_ms).max(0) as f64 * rate).min(capacity)
            })
            .unwrap_or(0.0);

        Ok(Take::Short { available })
    }

    async fn prune(&self, older_than_ms: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM rate_buckets WHERE updated_at_ms < ?")
            .bind(older_than_ms)
            .execute(self.db.pool())
            .await
            .map_err(DbError::SqlxError)?;
        Ok(result.rows_affected())
    }
}

/// Process-local buckets, for tests and single-process deployments
#[derive(Default)]
pub struct MemoryTokenStore {
    buckets: Mutex<HashMap<(Platform, String), (f64, i64)>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn take(
        &self,
        platform: Platform,
        account: &str,
        limit: &RateLimitConfig,
        now_ms: i64,
    ) -> Result<Take> {
        let capacity = limit.capacity as f64;
        let mut buckets = self.buckets.lock().await;
        let (tokens, updated_at_ms) = buckets
            .entry((platform, account.to_string()))
            .or_insert((capacity, now_ms));

        let available =
            (*tokens + (now_ms - *updated_at_ms).max(0) as f64 * refill_rate(limit)).min(capacity);
        *updated_at_ms = (*updated_at_ms).max(now_ms);

        if available >= 1.0 {
            *tokens = available - 1.0;
            Ok(Take::Taken {
                remaining: *tokens,
            })
        } else {
            *tokens = available;
            Ok(Take::Short { available })
        }
    }

    async fn prune(&self, older_than_ms: i64) -> Result<u64> {
        let mut buckets = self.buckets.lock().await;
        let before = buckets.len();
        buckets.retain(|_, (_, updated_at_ms)| *updated_at_ms >= older_than_ms);
        Ok((before - buckets.len()) as u64)
    }
}

/// Per-(platform, account) admission control
pub struct RateLimiter {
    store: Arc<dyn TokenStore>,
    limits: HashMap<Platform, RateLimitConfig>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn TokenStore>, limits: HashMap<Platform, RateLimitConfig>) -> Self {
        Self { store, limits }
    }

    /// Limiter whose buckets are shared through the database
    pub fn sqlite(db: Database, limits: HashMap<Platform, RateLimitConfig>) -> Self {
        Self::new(Arc::new(SqliteTokenStore::new(db)), limits)
    }

    pub fn in_memory(limits: HashMap<Platform, RateLimitConfig>) -> Self {
        Self::new(Arc::new(MemoryTokenStore::new()), limits)
    }

    /// Non-blocking acquire at the current wall-clock time
    pub async fn try_acquire(&self, platform: Platform, account: &str) -> Result<Admission> {
        self.try_acquire_at(platform, account, chrono::Utc::now().timestamp_millis())
            .await
    }

    /// Non-blocking acquire at an explicit time in unix milliseconds
    pub async fn try_acquire_at(
        &self,
        platform: Platform,
        account: &str,
        now_ms: i64,
    ) -> Result<Admission> {
        let Some(limit) = self.limits.get(&platform) else {
            return Ok(Admission::Granted);
        };

        match self.store.take(platform, account, limit, now_ms).await? {
            Take::Taken { .. } => Ok(Admission::Granted),
            Take::Short { available } => {
                let missing = (1.0 - available).max(0.0);
                let millis = (missing / refill_rate(limit)).ceil().max(1.0) as u64;
                Ok(Admission::Denied {
                    retry_after: Duration::from_millis(millis),
                })
            }
        }
    }

    /// Drop buckets idle long enough to have refilled completely
    pub async fn prune_idle(&self, now_ms: i64) -> Result<u64> {
        let longest = self
            .limits
            .values()
            .map(|l| l.per_secs)
            .max()
            .unwrap_or(0) as i64;
        self.store.prune(now_ms - longest * 1000).await
    }

    /// Wait for a token, but never past `deadline`.
    ///
    /// Sleeps for the bucket's own retry estimate between attempts. If the
    /// next token cannot arrive before the deadline, returns `Denied` right
    /// away with that estimate.
    pub async fn acquire_blocking(
        &self,
        platform: Platform,
        account: &str,
        deadline: Duration,
    ) -> Result<Admission> {
        let started = Instant::now();
        loop {
            let admission = self.try_acquire(platform, account).await?;
            let Admission::Denied { retry_after } = admission else {
                return Ok(admission);
            };

            let remaining = deadline.saturating_sub(started.elapsed());
            if retry_after > remaining {
                return Ok(admission);
            }

            tracing::debug!(
                platform = %platform,
                account = account,
                wait_ms = retry_after.as_millis() as u64,
                "Waiting for rate limit token"
            );
            tokio::time::sleep(retry_after).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn setup_test_db() -> (TempDir, Database) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");
        let db = Database::new(&db_path.to_string_lossy()).await.unwrap();
        (temp_dir, db)
    }

    fn limits(capacity: u32, per_secs: u64) -> HashMap<Platform, RateLimitConfig> {
        let mut limits = HashMap::new();
        limits.insert(Platform::Meta, RateLimitConfig { capacity, per_secs });
        limits
    }

    #[tokio::test]
    async fn test_allows_burst_up_to_capacity() {
        let (_temp, db) = setup_test_db().await;
        let limiter = RateLimiter::sqlite(db, limits(5, 3600));
        let now = 1_000_000;

        for i in 0..5 {
            let admission = limiter.try_acquire_at(Platform::Meta, "page-1", now).await.unwrap();
            assert!(admission.is_granted(), "Request {} should be granted", i + 1);
        }

        let admission = limiter.try_acquire_at(Platform::Meta, "page-1", now).await.unwrap();
        assert!(!admission.is_granted(), "Request 6 should be denied");
    }

    #[tokio::test]
    async fn test_denial_reports_time_to_next_token() {
        let (_temp, db) = setup_test_db().await;
        // One token every 10 seconds
        let limiter = RateLimiter::sqlite(db, limits(1, 10));
        let now = 1_000_000;

        assert!(limiter.try_acquire_at(Platform::Meta, "a", now).await.unwrap().is_granted());
        let denied = limiter
            .try_acquire_at(Platform::Meta, "a", now + 4_000)
            .await
            .unwrap();
        let Admission::Denied { retry_after } = denied else {
            panic!("expected denial, got {:?}", denied);
        };
        let millis = retry_after.as_millis();
        assert!((5_999..=6_001).contains(&millis), "got {}ms", millis);
    }

    #[tokio::test]
    async fn test_bucket_refills_over_time() {
        let (_temp, db) = setup_test_db().await;
        let limiter = RateLimiter::sqlite(db, limits(2, 10));
        let now = 1_000_000;

        for _ in 0..2 {
            limiter.try_acquire_at(Platform::Meta, "a", now).await.unwrap();
        }
        assert!(!limiter.try_acquire_at(Platform::Meta, "a", now).await.unwrap().is_granted());

        // 2 tokens per 10s: one token after 5s
        assert!(limiter
            .try_acquire_at(Platform::Meta, "a", now + 5_001)
            .await
            .unwrap()
            .is_granted());
        assert!(!limiter
            .try_acquire_at(Platform::Meta, "a", now + 5_001)
            .await
            .unwrap()
            .is_granted());
    }

    #[tokio::test]
    async fn test_refill_is_capped_at_capacity() {
        let (_temp, db) = setup_test_db().await;
        let limiter = RateLimiter::sqlite(db, limits(3, 1));
        let now = 1_000_000;

        limiter.try_acquire_at(Platform::Meta, "a", now).await.unwrap();
        let later = now + 3_600_000;
        for _ in 0..3 {
            assert!(limiter.try_acquire_at(Platform::Meta, "a", later).await.unwrap().is_granted());
        }
        assert!(!limiter.try_acquire_at(Platform::Meta, "a", later).await.unwrap().is_granted());
    }

    #[tokio::test]
    async fn test_accounts_are_independent() {
        let (_temp, db) = setup_test_db().await;
        let limiter = RateLimiter::sqlite(db, limits(1, 3600));
        let now = 1_000_000;

        assert!(limiter.try_acquire_at(Platform::Meta, "a", now).await.unwrap().is_granted());
        assert!(limiter.try_acquire_at(Platform::Meta, "b", now).await.unwrap().is_granted());
        assert!(!limiter.try_acquire_at(Platform::Meta, "a", now).await.unwrap().is_granted());
    }

    #[tokio::test]
    async fn test_no_limit_configured() {
        let (_temp, db) = setup_test_db().await;
        let limiter = RateLimiter::sqlite(db, limits(1, 3600));
        let now = 1_000_000;

        for _ in 0..10 {
            let admission = limiter
                .try_acquire_at(Platform::LinkedIn, "a", now)
                .await
                .unwrap();
            assert!(admission.is_granted(), "Platforms without a limit are admitted");
        }
    }

    #[tokio::test]
    async fn test_concurrent_callers_never_exceed_capacity() {
        let (_temp, db) = setup_test_db().await;
        let limiter = Arc::new(RateLimiter::sqlite(db, limits(5, 3600)));
        let now = 1_000_000;

        let handles: Vec<_> = (0..20)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move {
                    limiter.try_acquire_at(Platform::Meta, "shared", now).await.unwrap()
                })
            })
            .collect();

        let mut granted = 0;
        for handle in handles {
            if handle.await.unwrap().is_granted() {
                granted += 1;
            }
        }
        assert_eq!(granted, 5);
    }

    #[tokio::test]
    async fn test_prune_idle_buckets() {
        let (_temp, db) = setup_test_db().await;
        let limiter = RateLimiter::sqlite(db.clone(), limits(5, 60));
        let now = 1_000_000;

        limiter.try_acquire_at(Platform::Meta, "old", now).await.unwrap();
        limiter
            .try_acquire_at(Platform::Meta, "fresh", now + 90_000)
            .await
            .unwrap();

        let pruned = limiter.prune_idle(now + 100_000).await.unwrap();
        assert_eq!(pruned, 1);

        let remaining: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM rate_buckets")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(remaining.0, 1);
    }

    #[tokio::test]
    async fn test_memory_store_matches_sqlite_semantics() {
        let limiter = RateLimiter::in_memory(limits(2, 10));
        let now = 1_000_000;

        assert!(limiter.try_acquire_at(Platform::Meta, "a", now).await.unwrap().is_granted());
        assert!(limiter.try_acquire_at(Platform::Meta, "a", now).await.unwrap().is_granted());
        let denied = limiter.try_acquire_at(Platform::Meta, "a", now).await.unwrap();
        let Admission::Denied { retry_after } = denied else {
            panic!("expected denial, got {:?}", denied);
        };
        assert!((4_999..=5_001).contains(&retry_after.as_millis()));
        assert!(limiter
            .try_acquire_at(Platform::Meta, "a", now + 5_001)
            .await
            .unwrap()
            .is_granted());
    }

    #[tokio::test]
    async fn test_acquire_blocking_gives_up_before_deadline() {
        let limiter = RateLimiter::in_memory(limits(1, 3600));

        assert!(limiter.try_acquire(Platform::Meta, "a").await.unwrap().is_granted());

        let started = Instant::now();
        let admission = limiter
            .acquire_blocking(Platform::Meta, "a", Duration::from_millis(200))
            .await
            .unwrap();
        assert!(!admission.is_granted());
        assert!(started.elapsed() < Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_acquire_blocking_waits_for_refill() {
        // Ten tokens per second: the next token is 100ms away
        let limiter = RateLimiter::in_memory(limits(10, 1));
        for _ in 0..10 {
            limiter.try_acquire(Platform::Meta, "a").await.unwrap();
        }

        let admission = limiter
            .acquire_blocking(Platform::Meta, "a", Duration::from_secs(2))
            .await
            .unwrap();
        assert!(admission.is_granted());
    }
}
