//! SQLite-backed [`KvStore`], shared by every process pointed at the same file.
//!
//! Compare-and-swap runs as a single conditional statement, so concurrent
//! writers serialize on SQLite's write lock rather than on anything in-process.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::time::Duration;

use super::{expires_at, is_expired, KvStore};
use crate::{db, migrate};

pub struct SqliteKvStore {
    pool: SqlitePool,
}

impl SqliteKvStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if needed) the cache database and ensure its schema.
    pub async fn open(path: &Path) -> Result<Self> {
        let pool = db::connect(path).await?;
        migrate::migrate_pool(&pool).await?;
        Ok(Self::new(pool))
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl KvStore for SqliteKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value, expires_at FROM cache WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("Failed to read cache key '{}'", key))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let expires: Option<i64> = row.try_get("expires_at")?;
        if is_expired(expires, Utc::now().timestamp()) {
            return Ok(None);
        }

        Ok(Some(row.try_get("value")?))
    }

    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        sqlx::query(
            "INSERT INTO cache (key, value, expires_at) VALUES (?, ?, ?) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at",
        )
        .bind(key)
        .bind(value)
        .bind(expires_at(ttl))
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to write cache key '{}'", key))?;

        Ok(())
    }

    async fn forget(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM cache WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .with_context(|| format!("Failed to delete cache key '{}'", key))?;

        Ok(())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        let now = Utc::now().timestamp();

        let result = match expected {
            // Insert, or take over an expired entry
            None => sqlx::query(
                "INSERT INTO cache (key, value, expires_at) VALUES (?, ?, ?) \
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at \
                 WHERE cache.expires_at IS NOT NULL AND cache.expires_at <= ?",
            )
            .bind(key)
            .bind(new)
            .bind(expires_at(ttl))
            .bind(now)
            .execute(&self.pool)
            .await,
            Some(current) => sqlx::query(
                "UPDATE cache SET value = ?, expires_at = ? \
                 WHERE key = ? AND value = ? AND (expires_at IS NULL OR expires_at > ?)",
            )
            .bind(new)
            .bind(expires_at(ttl))
            .bind(key)
            .bind(current)
            .bind(now)
            .execute(&self.pool)
            .await,
        }
        .with_context(|| format!("Failed to swap cache key '{}'", key))?;

        Ok(result.rows_affected() == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn store() -> (TempDir, SqliteKvStore) {
        let tmp = TempDir::new().unwrap();
        let store = SqliteKvStore::open(&tmp.path().join("cache.sqlite")).await.unwrap();
        (tmp, store)
    }

    #[tokio::test]
    async fn put_overwrites_and_forget_removes() {
        let (_tmp, store) = store().await;
        store.put("lastUpsert:invoices", "2025-01-01 00:00:00", None).await.unwrap();
        store.put("lastUpsert:invoices", "2025-02-01 00:00:00", None).await.unwrap();
        assert_eq!(
            store.get("lastUpsert:invoices").await.unwrap().as_deref(),
            Some("2025-02-01 00:00:00")
        );

        store.forget("lastUpsert:invoices").await.unwrap();
        assert_eq!(store.get("lastUpsert:invoices").await.unwrap(), None);
    }

    #[tokio::test]
    async fn expired_entry_is_absent_and_swappable() {
        let (_tmp, store) = store().await;
        store.put("k", "old", Some(Duration::ZERO)).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);

        assert!(store.compare_and_swap("k", None, "new", None).await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("new"));
    }

    #[tokio::test]
    async fn compare_and_swap_rejects_stale_expectation() {
        let (_tmp, store) = store().await;
        assert!(store.compare_and_swap("k", None, "a", None).await.unwrap());
        assert!(!store.compare_and_swap("k", None, "b", None).await.unwrap());
        assert!(!store.compare_and_swap("k", Some("stale"), "b", None).await.unwrap());
        assert!(store.compare_and_swap("k", Some("a"), "b", Some(Duration::from_secs(60))).await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn state_is_shared_between_handles() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("cache.sqlite");
        let a = SqliteKvStore::open(&path).await.unwrap();
        let b = SqliteKvStore::open(&path).await.unwrap();

        a.put("rateLimit:abc", "{}", None).await.unwrap();
        assert_eq!(b.get("rateLimit:abc").await.unwrap().as_deref(), Some("{}"));
    }
}
