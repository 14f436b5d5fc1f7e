//! SQLite-backed proxy record store

use crate::proxy::models::{Anonymity, ProxyCandidate, ProxyRecord, ProxyStatus};
use crate::Result;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::collections::BTreeMap;
use std::str::FromStr;

const SELECT_COLUMNS: &str = "proxy, username, password, type, https, status, latency, anonymity, \
     last_check, country, city, region, timezone, latitude, longitude";

/// Raw row as stored; statuses may be null, empty or unknown
#[derive(Debug, sqlx::FromRow)]
struct ProxyRow {
    proxy: String,
    username: Option<String>,
    password: Option<String>,
    #[sqlx(rename = "type")]
    proxy_type: Option<String>,
    https: bool,
    status: Option<String>,
    latency: Option<f64>,
    anonymity: Option<String>,
    last_check: Option<DateTime<Utc>>,
    country: Option<String>,
    city: Option<String>,
    region: Option<String>,
    timezone: Option<String>,
    latitude: Option<f64>,
    longitude: Option<f64>,
}

impl From<ProxyRow> for ProxyRecord {
    fn from(row: ProxyRow) -> Self {
        Self {
            proxy: row.proxy,
            username: row.username,
            password: row.password,
            proxy_type: row.proxy_type.filter(|t| !t.is_empty()),
            https: row.https,
            status: row.status.as_deref().and_then(|s| s.parse().ok()),
            latency: row.latency,
            anonymity: row.anonymity.as_deref().and_then(|a| a.parse().ok()),
            last_check: row.last_check,
            country: row.country,
            city: row.city,
            region: row.region,
            timezone: row.timezone,
            latitude: row.latitude,
            longitude: row.longitude,
        }
    }
}

/// Fields written by a checker after classifying one proxy
#[derive(Debug, Clone, PartialEq)]
pub struct CheckUpdate {
    pub status: ProxyStatus,
    pub proxy_type: Option<String>,
    pub https: bool,
    pub latency: Option<f64>,
    pub anonymity: Option<Anonymity>,
    pub checked_at: DateTime<Utc>,
}

impl CheckUpdate {
    /// Non-working result: classification fields cleared
    pub fn dead(checked_at: DateTime<Utc>) -> Self {
        Self {
            status: ProxyStatus::Dead,
            proxy_type: None,
            https: false,
            latency: None,
            anonymity: None,
            checked_at,
        }
    }
}

/// Proxy store handle
#[derive(Clone)]
pub struct ProxyStore {
    pool: SqlitePool,
}

impl ProxyStore {
    /// Open (creating if needed) the store at `url` and ensure the schema
    pub async fn open(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let in_memory = url.contains(":memory:");
        let pool = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { 5 })
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS proxies(
            proxy TEXT PRIMARY KEY,
            username TEXT,
            password TEXT,
            type TEXT,
            https INTEGER NOT NULL DEFAULT 0,
            status TEXT DEFAULT 'untested',
            latency REAL,
            anonymity TEXT,
            last_check TEXT,
            country TEXT,
            city TEXT,
            region TEXT,
            timezone TEXT,
            latitude REAL,
            longitude REAL
        )"#,
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    /// Insert a freshly extracted candidate as `untested`; credentials on a known
    /// address replace the stored ones, a bare re-sighting leaves them intact.
    pub async fn insert_candidate(&self, candidate: &ProxyCandidate) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO proxies(proxy, username, password, status)
            VALUES(?1, ?2, ?3, 'untested')
            ON CONFLICT(proxy) DO UPDATE SET
                username = COALESCE(excluded.username, proxies.username),
                password = COALESCE(excluded.password, proxies.password)
        "#,
        )
        .bind(candidate.address())
        .bind(candidate.username())
        .bind(candidate.password())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, address: &str) -> Result<Option<ProxyRecord>> {
        let row = sqlx::query_as::<_, ProxyRow>(&format!(
            "SELECT {SELECT_COLUMNS} FROM proxies WHERE proxy = ?1"
        ))
        .bind(address)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(ProxyRecord::from))
    }

    /// Single-row upsert of a checker's verdict
    pub async fn record_check(&self, address: &str, update: &CheckUpdate) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO proxies(proxy, status, type, https, latency, anonymity, last_check)
            VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(proxy) DO UPDATE SET
                status = excluded.status,
                type = excluded.type,
                https = excluded.https,
                latency = excluded.latency,
                anonymity = excluded.anonymity,
                last_check = excluded.last_check
        "#,
        )
        .bind(address)
        .bind(update.status.as_str())
        .bind(update.proxy_type.as_deref())
        .bind(update.https)
        .bind(update.latency)
        .bind(update.anonymity.map(|a| a.as_str()))
        .bind(update.checked_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update_status(&self, address: &str, status: ProxyStatus) -> Result<()> {
        sqlx::query("UPDATE proxies SET status = ?1 WHERE proxy = ?2")
            .bind(status.as_str())
            .bind(address)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Returns whether a row was removed
    pub async fn delete(&self, address: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM proxies WHERE proxy = ?1")
            .bind(address)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Up to `limit` untested/active rows, least recently checked first
    pub async fn sample_for_check(&self, limit: i64) -> Result<Vec<ProxyRecord>> {
        let rows = sqlx::query_as::<_, ProxyRow>(&format!(
            "SELECT {SELECT_COLUMNS} FROM proxies
            WHERE status IN ('untested', 'active') OR status IS NULL OR status = ''
            ORDER BY last_check IS NOT NULL, last_check ASC, proxy
            LIMIT ?1"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(ProxyRecord::from).collect())
    }

    /// Rows sharing an IP with at least one other row, where the group holds at least
    /// one dead, port-closed, untested or status-less member. Grouped by IP.
    pub async fn same_host_groups(&self) -> Result<Vec<Vec<ProxyRecord>>> {
        let rows = sqlx::query_as::<_, ProxyRow>(&format!(
            "SELECT {SELECT_COLUMNS} FROM proxies
            WHERE substr(proxy, 1, instr(proxy, ':') - 1) IN (
                SELECT substr(proxy, 1, instr(proxy, ':') - 1) AS ip FROM proxies
                GROUP BY ip
                HAVING COUNT(*) > 1
                   AND SUM(CASE WHEN status IS NULL
                                  OR status IN ('', 'dead', 'port-closed', 'untested')
                            THEN 1 ELSE 0 END) > 0
            )
            ORDER BY proxy"
        ))
        .fetch_all(&self.pool)
        .await?;

        let mut groups: BTreeMap<String, Vec<ProxyRecord>> = BTreeMap::new();
        for record in rows.into_iter().map(ProxyRecord::from) {
            groups.entry(record.ip().to_string()).or_default().push(record);
        }
        Ok(groups.into_values().collect())
    }

    pub async fn all(&self) -> Result<Vec<ProxyRecord>> {
        let rows = sqlx::query_as::<_, ProxyRow>(&format!(
            "SELECT {SELECT_COLUMNS} FROM proxies ORDER BY proxy"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(ProxyRecord::from).collect())
    }

    pub async fn count(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM proxies")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Run raw SQL; used to seed rows in tests and by maintenance tooling
    pub async fn execute(&self, sql: &str) -> Result<u64> {
        Ok(sqlx::query(sql).execute(&self.pool).await?.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    async fn store() -> ProxyStore {
        ProxyStore::open("sqlite::memory:").await.unwrap()
    }

    fn candidate(address: &str) -> ProxyCandidate {
        let (ip, port) = address.split_once(':').unwrap();
        ProxyCandidate::new(ip.to_string(), port.parse().unwrap())
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let store = store().await;
        store.insert_candidate(&candidate("1.2.3.4:80")).await.unwrap();

        let record = store.get("1.2.3.4:80").await.unwrap().unwrap();
        assert_eq!(record.status, Some(ProxyStatus::Untested));
        assert!(!record.https);
        assert!(record.last_check.is_none());
        assert!(store.get("9.9.9.9:80").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_credentials_survive_bare_reinsert() {
        let store = store().await;
        let with_auth = ProxyCandidate::with_auth(
            "1.2.3.4".to_string(),
            80,
            "user".to_string(),
            "pass".to_string(),
        );
        store.insert_candidate(&with_auth).await.unwrap();
        store.insert_candidate(&candidate("1.2.3.4:80")).await.unwrap();

        let record = store.get("1.2.3.4:80").await.unwrap().unwrap();
        assert_eq!(record.username.as_deref(), Some("user"));
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_record_check_round_trip() {
        let store = store().await;
        store.insert_candidate(&candidate("1.2.3.4:80")).await.unwrap();
        let now = Utc::now();
        store
            .record_check(
                "1.2.3.4:80",
                &CheckUpdate {
                    status: ProxyStatus::Active,
                    proxy_type: Some("http-socks5".to_string()),
                    https: true,
                    latency: Some(150.5),
                    anonymity: Some(Anonymity::Elite),
                    checked_at: now,
                },
            )
            .await
            .unwrap();

        let record = store.get("1.2.3.4:80").await.unwrap().unwrap();
        assert_eq!(record.status, Some(ProxyStatus::Active));
        assert_eq!(record.proxy_type.as_deref(), Some("http-socks5"));
        assert!(record.https);
        assert_eq!(record.latency, Some(150.5));
        assert_eq!(record.anonymity, Some(Anonymity::Elite));
        let stored = record.last_check.unwrap();
        assert!((stored - now).num_milliseconds().abs() < 1000);

        store
            .record_check("1.2.3.4:80", &CheckUpdate::dead(now))
            .await
            .unwrap();
        let record = store.get("1.2.3.4:80").await.unwrap().unwrap();
        assert_eq!(record.status, Some(ProxyStatus::Dead));
        assert!(record.latency.is_none());
        assert!(record.anonymity.is_none());
        assert!(record.proxy_type.is_none());
    }

    #[tokio::test]
    async fn test_sample_for_check_orders_by_recency() {
        let store = store().await;
        for address in ["1.1.1.1:80", "2.2.2.2:80", "3.3.3.3:80", "4.4.4.4:80"] {
            store.insert_candidate(&candidate(address)).await.unwrap();
        }
        let old = Utc::now() - ChronoDuration::hours(10);
        let mut active = CheckUpdate::dead(old);
        active.status = ProxyStatus::Active;
        store.record_check("1.1.1.1:80", &active).await.unwrap();
        store
            .record_check("2.2.2.2:80", &CheckUpdate::dead(old))
            .await
            .unwrap();

        let sample = store.sample_for_check(10).await.unwrap();
        let addresses: Vec<_> = sample.iter().map(|r| r.proxy.as_str()).collect();
        assert_eq!(addresses, vec!["3.3.3.3:80", "4.4.4.4:80", "1.1.1.1:80"]);
        assert_eq!(store.sample_for_check(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_same_host_groups() {
        let store = store().await;
        store
            .execute(
                "INSERT INTO proxies(proxy, status) VALUES
                ('5.5.5.5:80', 'dead'), ('5.5.5.5:81', 'active'), ('5.5.5.5:82', NULL),
                ('6.6.6.6:80', 'active'), ('6.6.6.6:81', 'active'),
                ('7.7.7.7:80', 'dead')",
            )
            .await
            .unwrap();

        let groups = store.same_host_groups().await.unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].len(), 3);
        assert!(groups[0].iter().all(|r| r.ip() == "5.5.5.5"));
        assert_eq!(groups[0][2].status, None);
    }

    #[tokio::test]
    async fn test_update_status_and_delete() {
        let store = store().await;
        store.insert_candidate(&candidate("1.2.3.4:80")).await.unwrap();
        store
            .update_status("1.2.3.4:80", ProxyStatus::PortOpen)
            .await
            .unwrap();
        assert_eq!(
            store.get("1.2.3.4:80").await.unwrap().unwrap().status,
            Some(ProxyStatus::PortOpen)
        );
        assert!(store.delete("1.2.3.4:80").await.unwrap());
        assert!(!store.delete("1.2.3.4:80").await.unwrap());
    }
}
