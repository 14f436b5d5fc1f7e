//! TTL exclusion cache for recently used and recently dead proxies

use crate::config::EngineConfig;
use crate::Result;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

/// Which exclusion set an entry belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSet {
    /// In flight or just validated
    Used,
    /// Confirmed not working
    Dead,
}

impl CacheSet {
    fn table(&self) -> &'static str {
        match self {
            CacheSet::Used => "used_proxies",
            CacheSet::Dead => "dead_proxies",
        }
    }
}

const LAST_PURGE_KEY: &str = "last_purge";

/// Two-table keyed store; one live entry per proxy per set
#[derive(Clone)]
pub struct ExclusionCache {
    pool: SqlitePool,
    used_ttl: Duration,
    dead_ttl: Duration,
    purge_interval: Duration,
}

impl ExclusionCache {
    pub async fn open(url: &str, config: &EngineConfig) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let in_memory = url.contains(":memory:");
        let pool = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { 5 })
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        for set in [CacheSet::Used, CacheSet::Dead] {
            sqlx::query(&format!(
                "CREATE TABLE IF NOT EXISTS {}(
                proxy TEXT NOT NULL UNIQUE,
                expiresAt INTEGER NOT NULL
            )",
                set.table()
            ))
            .execute(&pool)
            .await?;
        }
        sqlx::query("CREATE TABLE IF NOT EXISTS cache_meta(key TEXT PRIMARY KEY, value INTEGER NOT NULL)")
            .execute(&pool)
            .await?;

        Ok(Self {
            pool,
            used_ttl: config.used_ttl,
            dead_ttl: config.dead_ttl,
            purge_interval: config.purge_interval,
        })
    }

    fn ttl(&self, set: CacheSet) -> Duration {
        match set {
            CacheSet::Used => self.used_ttl,
            CacheSet::Dead => self.dead_ttl,
        }
    }

    /// Insert or replace `proxy` in `set` with a fresh TTL
    pub async fn mark(&self, set: CacheSet, proxy: &str) -> Result<()> {
        self.mark_at(set, proxy, now_ms()).await
    }

    pub(crate) async fn mark_at(&self, set: CacheSet, proxy: &str, now: i64) -> Result<()> {
        let expires_at = now + self.ttl(set).as_millis() as i64;
        sqlx::query(&format!(
            "INSERT OR REPLACE INTO {}(proxy, expiresAt) VALUES(?1, ?2)",
            set.table()
        ))
        .bind(proxy)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Whether `proxy` has a live entry; an expired entry is dropped on the way
    pub async fn contains(&self, set: CacheSet, proxy: &str) -> Result<bool> {
        self.contains_at(set, proxy, now_ms()).await
    }

    pub(crate) async fn contains_at(&self, set: CacheSet, proxy: &str, now: i64) -> Result<bool> {
        let row: Option<(i64,)> = sqlx::query_as(&format!(
            "SELECT expiresAt FROM {} WHERE proxy = ?1",
            set.table()
        ))
        .bind(proxy)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some((expires_at,)) if expires_at > now => Ok(true),
            Some(_) => {
                sqlx::query(&format!(
                    "DELETE FROM {} WHERE proxy = ?1 AND expiresAt <= ?2",
                    set.table()
                ))
                .bind(proxy)
                .bind(now)
                .execute(&self.pool)
                .await?;
                Ok(false)
            }
            None => Ok(false),
        }
    }

    /// Drop every expired entry from both sets, returning how many went
    pub async fn purge_expired(&self) -> Result<u64> {
        self.purge_expired_at(now_ms()).await
    }

    pub(crate) async fn purge_expired_at(&self, now: i64) -> Result<u64> {
        let mut removed = 0;
        for set in [CacheSet::Used, CacheSet::Dead] {
            removed += sqlx::query(&format!("DELETE FROM {} WHERE expiresAt <= ?1", set.table()))
                .bind(now)
                .execute(&self.pool)
                .await?
                .rows_affected();
        }
        sqlx::query(
            "INSERT INTO cache_meta(key, value) VALUES(?1, ?2)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(LAST_PURGE_KEY)
        .bind(now)
        .execute(&self.pool)
        .await?;
        debug!(removed, "purged exclusion cache");
        Ok(removed)
    }

    /// Purge when the last purge (by any process) is older than the interval
    pub async fn purge_if_due(&self) -> Result<Option<u64>> {
        self.purge_if_due_at(now_ms()).await
    }

    pub(crate) async fn purge_if_due_at(&self, now: i64) -> Result<Option<u64>> {
        let last: Option<(i64,)> = sqlx::query_as("SELECT value FROM cache_meta WHERE key = ?1")
            .bind(LAST_PURGE_KEY)
            .fetch_optional(&self.pool)
            .await?;

        let due = match last {
            Some((last,)) => now - last >= self.purge_interval.as_millis() as i64,
            None => true,
        };
        if due {
            Ok(Some(self.purge_expired_at(now).await?))
        } else {
            Ok(None)
        }
    }

    pub async fn len(&self, set: CacheSet) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {}", set.table()))
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR_MS: i64 = 60 * 60 * 1000;

    async fn cache() -> ExclusionCache {
        ExclusionCache::open("sqlite::memory:", &EngineConfig::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_mark_and_expire() {
        let cache = cache().await;
        let t0 = 1_700_000_000_000;
        cache.mark_at(CacheSet::Used, "1.2.3.4:80", t0).await.unwrap();
        cache.mark_at(CacheSet::Dead, "5.6.7.8:80", t0).await.unwrap();

        assert!(cache.contains_at(CacheSet::Used, "1.2.3.4:80", t0 + HOUR_MS - 1).await.unwrap());
        assert!(!cache.contains_at(CacheSet::Dead, "1.2.3.4:80", t0).await.unwrap());

        // used expires after one hour, dead lives for five
        assert!(!cache.contains_at(CacheSet::Used, "1.2.3.4:80", t0 + HOUR_MS).await.unwrap());
        assert!(cache.contains_at(CacheSet::Dead, "5.6.7.8:80", t0 + 4 * HOUR_MS).await.unwrap());
        assert!(!cache.contains_at(CacheSet::Dead, "5.6.7.8:80", t0 + 5 * HOUR_MS).await.unwrap());

        // lazily removed on lookup
        assert_eq!(cache.len(CacheSet::Used).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_insert_replaces() {
        let cache = cache().await;
        let t0 = 1_700_000_000_000;
        cache.mark_at(CacheSet::Used, "1.2.3.4:80", t0).await.unwrap();
        cache.mark_at(CacheSet::Used, "1.2.3.4:80", t0 + HOUR_MS).await.unwrap();

        assert_eq!(cache.len(CacheSet::Used).await.unwrap(), 1);
        assert!(cache.contains_at(CacheSet::Used, "1.2.3.4:80", t0 + HOUR_MS + 1).await.unwrap());
    }

    #[tokio::test]
    async fn test_purge_interval() {
        let cache = cache().await;
        let t0 = 1_700_000_000_000;
        cache.mark_at(CacheSet::Used, "1.1.1.1:80", t0).await.unwrap();
        cache.mark_at(CacheSet::Dead, "2.2.2.2:80", t0).await.unwrap();

        assert_eq!(cache.purge_if_due_at(t0).await.unwrap(), Some(0));
        // within the 30 minute interval nothing runs
        assert_eq!(cache.purge_if_due_at(t0 + HOUR_MS / 4).await.unwrap(), None);
        assert_eq!(cache.purge_if_due_at(t0 + 2 * HOUR_MS).await.unwrap(), Some(1));
        assert_eq!(cache.len(CacheSet::Used).await.unwrap(), 0);
        assert_eq!(cache.len(CacheSet::Dead).await.unwrap(), 1);
        assert_eq!(cache.purge_expired_at(t0 + 6 * HOUR_MS).await.unwrap(), 1);
    }
}
