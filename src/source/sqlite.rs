//! SQLite-backed [`DataSource`].
//!
//! Builds parameterized `SELECT` statements from a [`SourceQuery`]. Table and
//! column names are validated when the collection plan is resolved and are
//! double-quoted here; filter values are always bound, never interpolated.
//! Raw where-fragments come from configuration and are trusted.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{Map, Number, Value};
use sqlx::query::Query;
use sqlx::sqlite::{Sqlite, SqliteArguments, SqliteRow};
use sqlx::{Column, Row, SqlitePool, TypeInfo, ValueRef};
use std::path::Path;

use super::{Condition, DataSource, SourceQuery};
use crate::db;

pub struct SqliteSource {
    pool: SqlitePool,
}

impl SqliteSource {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open the application database at `path`. The file must already exist.
    pub async fn open(path: &Path) -> Result<Self> {
        Ok(Self::new(db::connect_existing(path).await?))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Render the WHERE clause and the values to bind, in order.
fn where_clause(query: &SourceQuery, after: Option<&Value>) -> (String, Vec<Value>) {
    let mut clauses = Vec::new();
    let mut binds = Vec::new();

    for condition in &query.conditions {
        match condition {
            Condition::UpdatedSince { column, since } => {
                clauses.push(format!("{} >= ?", quote(column)));
                binds.push(Value::String(since.clone()));
            }
            Condition::Raw(fragment) => clauses.push(format!("({})", fragment)),
        }
    }

    if let Some(key) = after {
        clauses.push(format!("{} > ?", quote(&query.primary_key)));
        binds.push(key.clone());
    }

    if clauses.is_empty() {
        (String::new(), binds)
    } else {
        (format!(" WHERE {}", clauses.join(" AND ")), binds)
    }
}

fn select_list(columns: &[String]) -> String {
    if columns.is_empty() {
        "*".to_string()
    } else {
        columns
            .iter()
            .map(|c| quote(c))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

fn bind_value<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    value: &Value,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    match value {
        Value::Number(n) if n.is_i64() || n.is_u64() => query.bind(n.as_i64()),
        Value::Number(n) => query.bind(n.as_f64()),
        Value::String(s) => query.bind(s.clone()),
        Value::Bool(b) => query.bind(*b),
        Value::Null => query.bind(None::<String>),
        other => query.bind(other.to_string()),
    }
}

/// Decode a row into a JSON object using each value's runtime storage class.
fn row_to_map(row: &SqliteRow) -> Result<Map<String, Value>> {
    let mut map = Map::new();

    for (i, column) in row.columns().iter().enumerate() {
        let raw = row.try_get_raw(i)?;
        let value = if raw.is_null() {
            Value::Null
        } else {
            let type_name = raw.type_info().name().to_string();
            match type_name.as_str() {
                "INTEGER" | "BOOLEAN" => Value::from(row.try_get::<i64, _>(i)?),
                "REAL" | "NUMERIC" => Number::from_f64(row.try_get::<f64, _>(i)?)
                    .map(Value::Number)
                    .unwrap_or(Value::Null),
                "BLOB" => Value::String(hex::encode(row.try_get::<Vec<u8>, _>(i)?)),
                _ => Value::String(row.try_get::<String, _>(i)?),
            }
        };
        map.insert(column.name().to_string(), value);
    }

    Ok(map)
}

#[async_trait]
impl DataSource for SqliteSource {
    async fn fetch_page(
        &self,
        query: &SourceQuery,
        after: Option<&Value>,
        limit: usize,
    ) -> Result<Vec<Map<String, Value>>> {
        let (where_sql, binds) = where_clause(query, after);
        let sql = format!(
            "SELECT {} FROM {}{} ORDER BY {} ASC LIMIT ?",
            select_list(&query.columns),
            quote(&query.table),
            where_sql,
            quote(&query.primary_key),
        );

        let mut q = sqlx::query(&sql);
        for value in &binds {
            q = bind_value(q, value);
        }
        q = q.bind(limit as i64);

        let rows = q
            .fetch_all(&self.pool)
            .await
            .with_context(|| format!("Failed to fetch page from '{}'", query.table))?;

        rows.iter().map(row_to_map).collect()
    }

    async fn count(&self, query: &SourceQuery) -> Result<u64> {
        let (where_sql, binds) = where_clause(query, None);
        let sql = format!("SELECT COUNT(*) FROM {}{}", quote(&query.table), where_sql);

        let mut q = sqlx::query(&sql);
        for value in &binds {
            q = bind_value(q, value);
        }

        let row = q
            .fetch_one(&self.pool)
            .await
            .with_context(|| format!("Failed to count rows in '{}'", query.table))?;
        let count: i64 = row.try_get(0)?;

        Ok(count.max(0) as u64)
    }

    async fn fetch_related(
        &self,
        table: &str,
        key_column: &str,
        keys: &[Value],
    ) -> Result<Vec<Map<String, Value>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; keys.len()].join(", ");
        let sql = format!(
            "SELECT * FROM {} WHERE {} IN ({})",
            quote(table),
            quote(key_column),
            placeholders
        );

        let mut q = sqlx::query(&sql);
        for key in keys {
            q = bind_value(q, key);
        }

        let rows = q
            .fetch_all(&self.pool)
            .await
            .with_context(|| format!("Failed to load related rows from '{}'", table))?;

        rows.iter().map(row_to_map).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    async fn seeded() -> (TempDir, SqliteSource) {
        let tmp = TempDir::new().unwrap();
        let pool = db::connect(&tmp.path().join("app.sqlite")).await.unwrap();

        sqlx::query(
            "CREATE TABLE invoices (id INTEGER PRIMARY KEY, status TEXT, amount REAL, \
             customer_id INTEGER, updated_at TEXT, deleted_at TEXT, payload BLOB)",
        )
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query("CREATE TABLE customers (id INTEGER PRIMARY KEY, name TEXT)")
            .execute(&pool)
            .await
            .unwrap();

        for (id, status, updated, deleted) in [
            (1, "draft", "2025-01-01 10:00:00", None),
            (2, "sent", "2025-02-01 10:00:00", None),
            (3, "paid", "2025-03-01 10:00:00", Some("2025-03-02 00:00:00")),
            (4, "sent", "2025-04-01 10:00:00", None),
        ] {
            sqlx::query(
                "INSERT INTO invoices (id, status, amount, customer_id, updated_at, deleted_at, payload) \
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(id)
            .bind(status)
            .bind(100.5 * id as f64)
            .bind(10)
            .bind(updated)
            .bind(deleted)
            .bind(vec![0xABu8, 0x01])
            .execute(&pool)
            .await
            .unwrap();
        }
        sqlx::query("INSERT INTO customers (id, name) VALUES (10, 'Acme'), (11, 'Globex')")
            .execute(&pool)
            .await
            .unwrap();

        (tmp, SqliteSource::new(pool))
    }

    #[tokio::test]
    async fn pages_by_primary_key() {
        let (_tmp, source) = seeded().await;
        let query = SourceQuery::new("invoices", "id").select(vec!["status".into(), "id".into()]);

        let first = source.fetch_page(&query, None, 3).await.unwrap();
        assert_eq!(first.len(), 3);
        assert_eq!(first[0]["id"], json!(1));
        assert!(!first[0].contains_key("amount"));

        let last = first.last().unwrap()["id"].clone();
        let second = source.fetch_page(&query, Some(&last), 3).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0]["id"], json!(4));
    }

    #[tokio::test]
    async fn filters_by_updated_at_and_scope() {
        let (_tmp, source) = seeded().await;
        let query = SourceQuery::new("invoices", "id")
            .where_raw("deleted_at IS NULL")
            .where_updated_since("updated_at", "2025-02-01 10:00:00");

        let rows = source.fetch_page(&query, None, 10).await.unwrap();
        let ids: Vec<i64> = rows.iter().map(|r| r["id"].as_i64().unwrap()).collect();
        assert_eq!(ids, vec![2, 4]);
        assert_eq!(source.count(&query).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn decodes_storage_classes() {
        let (_tmp, source) = seeded().await;
        let query = SourceQuery::new("invoices", "id");
        let rows = source.fetch_page(&query, None, 1).await.unwrap();
        let row = &rows[0];

        assert_eq!(row["status"], json!("draft"));
        assert_eq!(row["amount"], json!(100.5));
        assert_eq!(row["deleted_at"], Value::Null);
        assert_eq!(row["payload"], json!("ab01"));
    }

    #[tokio::test]
    async fn loads_related_rows_in_one_query() {
        let (_tmp, source) = seeded().await;
        let rows = source
            .fetch_related("customers", "id", &[json!(10), json!(11), json!(99)])
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);

        let none = source.fetch_related("customers", "id", &[]).await.unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn quotes_identifiers() {
        assert_eq!(quote("status"), "\"status\"");
        assert_eq!(select_list(&[]), "*");
    }
}
