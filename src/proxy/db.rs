//! SQLite-backed proxy store.
//!
//! The default [`ProxyStore`] implementation: a connection-pooled SQLite
//! database with WAL mode for concurrent reads and migration-managed schema.

use std::path::Path;

use async_trait::async_trait;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use tracing::{debug, instrument, warn};

use super::store::{RANDOM_DRAW_WINDOW, pick_random};
use super::{ACTIVE_SCORE, AnonymityLevel, INITIAL_SCORE, Proxy, ProxyStore, StoreError};

/// Maximum connections in the pool. Kept low for SQLite since it uses
/// file-level locking.
const DEFAULT_MAX_CONNECTIONS: u32 = 5;

/// SQLite busy timeout in milliseconds.
const BUSY_TIMEOUT_MS: u32 = 5000;

#[derive(sqlx::FromRow)]
struct ProxyRow {
    host: String,
    port: i64,
    https: i64,
    anonymity: i64,
    score: i64,
}

impl From<ProxyRow> for Proxy {
    fn from(row: ProxyRow) -> Self {
        Proxy {
            host: row.host,
            port: u16::try_from(row.port).unwrap_or_default(),
            https: row.https != 0,
            anonymity: AnonymityLevel::from_i64(row.anonymity),
            score: row.score,
        }
    }
}

/// Proxy store persisted in a SQLite database.
#[derive(Debug, Clone)]
pub struct SqliteProxyStore {
    pool: SqlitePool,
}

impl SqliteProxyStore {
    /// Opens (creating if necessary) the store at the given path.
    ///
    /// Enables WAL mode and runs pending migrations.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the connection or a migration
    /// fails.
    #[instrument(skip(db_path), fields(path = %db_path.display()))]
    pub async fn new(db_path: &Path) -> Result<Self, StoreError> {
        let db_url = format!("sqlite:{}?mode=rwc", db_path.display());

        let pool = SqlitePoolOptions::new()
            .max_connections(DEFAULT_MAX_CONNECTIONS)
            .connect(&db_url)
            .await?;

        sqlx::query("PRAGMA journal_mode=WAL")
            .execute(&pool)
            .await?;
        sqlx::query(&format!("PRAGMA busy_timeout={BUSY_TIMEOUT_MS}"))
            .execute(&pool)
            .await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| StoreError::Database(sqlx::Error::Migrate(Box::new(e))))?;

        Ok(Self { pool })
    }

    /// Creates an in-memory store for testing.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the connection or a migration
    /// fails.
    #[instrument]
    pub async fn new_in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| StoreError::Database(sqlx::Error::Migrate(Box::new(e))))?;

        Ok(Self { pool })
    }

    /// Returns a reference to the underlying connection pool.
    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl ProxyStore for SqliteProxyStore {
    async fn get(&self, proxy: &Proxy) -> Result<Option<Proxy>, StoreError> {
        let row: Option<ProxyRow> = sqlx::query_as(
            "SELECT host, port, https, anonymity, score FROM proxies WHERE host = ? AND port = ?",
        )
        .bind(&proxy.host)
        .bind(i64::from(proxy.port))
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Proxy::from))
    }

    async fn contains(&self, proxy: &Proxy) -> Result<bool, StoreError> {
        let count: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM proxies WHERE host = ? AND port = ?")
                .bind(&proxy.host)
                .bind(i64::from(proxy.port))
                .fetch_one(&self.pool)
                .await?;
        Ok(count.0 != 0)
    }

    async fn create(&self, proxy: &Proxy) -> Result<(), StoreError> {
        if self.contains(proxy).await? {
            return Err(StoreError::already_exists(proxy));
        }

        sqlx::query(
            "INSERT INTO proxies (host, port, https, anonymity, score) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&proxy.host)
        .bind(i64::from(proxy.port))
        .bind(i64::from(proxy.https))
        .bind(proxy.anonymity.as_i64())
        .bind(INITIAL_SCORE)
        .execute(&self.pool)
        .await?;

        debug!(host = %proxy.host, port = proxy.port, "proxy created");
        Ok(())
    }

    async fn create_many(&self, proxies: &[Proxy]) -> usize {
        let mut created = 0;
        for proxy in proxies {
            match self.create(proxy).await {
                Ok(()) => created += 1,
                Err(StoreError::AlreadyExists { .. }) => {}
                Err(e) => {
                    warn!(proxy = %proxy, error = %e, "failed to create proxy");
                }
            }
        }
        created
    }

    async fn activate(&self, proxy: &Proxy) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE proxies SET score = ? WHERE host = ? AND port = ?")
            .bind(ACTIVE_SCORE)
            .bind(&proxy.host)
            .bind(i64::from(proxy.port))
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found(proxy));
        }
        Ok(())
    }

    async fn deactivate(&self, proxy: &Proxy) -> Result<(), StoreError> {
        let result =
            sqlx::query("UPDATE proxies SET score = score - 1 WHERE host = ? AND port = ?")
                .bind(&proxy.host)
                .bind(i64::from(proxy.port))
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found(proxy));
        }
        Ok(())
    }

    async fn top_by_score(&self, k: usize) -> Result<Vec<Proxy>, StoreError> {
        let rows: Vec<ProxyRow> = sqlx::query_as(
            "SELECT host, port, https, anonymity, score FROM proxies \
             ORDER BY score DESC LIMIT ?",
        )
        .bind(i64::try_from(k).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Proxy::from).collect())
    }

    async fn random_top(&self, k: usize) -> Result<Option<Proxy>, StoreError> {
        let candidates = self.top_by_score(k).await?;
        Ok(pick_random(&candidates))
    }

    async fn all(&self) -> Result<Vec<Proxy>, StoreError> {
        let rows: Vec<ProxyRow> =
            sqlx::query_as("SELECT host, port, https, anonymity, score FROM proxies")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(Proxy::from).collect())
    }

    async fn top_excluding(&self, refuse: &[Proxy], k: usize) -> Result<Vec<Proxy>, StoreError> {
        // Identity exclusion happens in Rust: SQL IN over (host, port) pairs
        // is awkward across backends, and fleets are small.
        let all = self.top_by_score(usize::MAX).await?;
        let mut filtered: Vec<Proxy> = all
            .into_iter()
            .filter(|p| !refuse.iter().any(|r| r.same_endpoint(p)))
            .collect();
        filtered.truncate(k);
        Ok(filtered)
    }

    async fn random_excluding(&self, refuse: &[Proxy]) -> Result<Option<Proxy>, StoreError> {
        let candidates = self.top_excluding(refuse, RANDOM_DRAW_WINDOW).await?;
        Ok(pick_random(&candidates))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    async fn store() -> SqliteProxyStore {
        SqliteProxyStore::new_in_memory().await.unwrap()
    }

    #[tokio::test]
    async fn test_sqlite_store_create_and_get() {
        let store = store().await;
        let proxy = Proxy::new("10.0.0.1", 8080).with_anonymity(AnonymityLevel::Elite);
        store.create(&proxy).await.unwrap();

        let stored = store.get(&proxy).await.unwrap().unwrap();
        assert_eq!(stored.host, "10.0.0.1");
        assert_eq!(stored.port, 8080);
        assert_eq!(stored.anonymity, AnonymityLevel::Elite);
        assert_eq!(stored.score, INITIAL_SCORE);
    }

    #[tokio::test]
    async fn test_sqlite_store_duplicate_create_fails() {
        let store = store().await;
        let proxy = Proxy::new("10.0.0.1", 8080);
        store.create(&proxy).await.unwrap();
        assert!(matches!(
            store.create(&proxy).await,
            Err(StoreError::AlreadyExists { .. })
        ));
    }

    #[tokio::test]
    async fn test_sqlite_store_score_policy() {
        let store = store().await;
        let proxy = Proxy::new("10.0.0.1", 8080);
        store.create(&proxy).await.unwrap();

        store.activate(&proxy).await.unwrap();
        assert_eq!(store.get(&proxy).await.unwrap().unwrap().score, ACTIVE_SCORE);

        store.deactivate(&proxy).await.unwrap();
        assert_eq!(
            store.get(&proxy).await.unwrap().unwrap().score,
            ACTIVE_SCORE - 1
        );
    }

    #[tokio::test]
    async fn test_sqlite_store_activate_missing_fails() {
        let store = store().await;
        assert!(matches!(
            store.activate(&Proxy::new("10.0.0.9", 1)).await,
            Err(StoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_sqlite_store_top_by_score_and_exclusion() {
        let store = store().await;
        let a = Proxy::new("10.0.0.1", 8080);
        let b = Proxy::new("10.0.0.2", 8080);
        let c = Proxy::new("10.0.0.3", 8080);
        assert_eq!(store.create_many(&[a.clone(), b.clone(), c.clone()]).await, 3);
        store.activate(&b).await.unwrap();
        store.deactivate(&c).await.unwrap();

        let top = store.top_by_score(2).await.unwrap();
        assert_eq!(top[0].host, "10.0.0.2");
        assert_eq!(top[1].host, "10.0.0.1");

        let excluded = store.top_excluding(&[b], 10).await.unwrap();
        assert_eq!(excluded.len(), 2);
        assert!(excluded.iter().all(|p| p.host != "10.0.0.2"));
    }

    #[tokio::test]
    async fn test_sqlite_store_random_excluding_exhausted() {
        let store = store().await;
        let a = Proxy::new("10.0.0.1", 8080);
        store.create(&a).await.unwrap();
        assert!(store.random_excluding(&[a]).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sqlite_store_file_backed() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteProxyStore::new(&dir.path().join("proxies.db"))
            .await
            .unwrap();
        store.create(&Proxy::new("10.0.0.1", 8080)).await.unwrap();
        assert_eq!(store.all().await.unwrap().len(), 1);
    }
}
