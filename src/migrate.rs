use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

/// Create the cache schema in the configured cache database.
pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(&config.cache.path).await?;
    migrate_pool(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Apply the cache schema to an open pool. Idempotent.
pub async fn migrate_pool(pool: &SqlitePool) -> Result<()> {
    // Key/value entries; expires_at is a Unix timestamp, NULL = no expiry
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS cache (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            expires_at INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_cache_expires_at ON cache(expires_at)")
        .execute(pool)
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;
    use tempfile::TempDir;

    #[tokio::test]
    async fn creates_cache_table_idempotently() {
        let tmp = TempDir::new().unwrap();
        let cache_path = tmp.path().join("nested").join("cache.sqlite");
        let config = parse_config(&format!(
            "[source]\npath = \"app.sqlite\"\n\n[cache]\npath = {:?}\n",
            cache_path.display().to_string()
        ))
        .unwrap();

        run_migrations(&config).await.unwrap();
        run_migrations(&config).await.unwrap();

        let pool = db::connect(&cache_path).await.unwrap();
        let exists: bool = sqlx::query_scalar(
            "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='cache'",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert!(exists);
    }
}
