//! In-memory [`DataSource`] for tests and embedding.
//!
//! Tables are vectors of JSON objects behind a `RwLock`. Raw where-fragments
//! are SQL and cannot be evaluated here; queries carrying them fail.

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::{Map, Value};

use super::{compare_keys, key_string, Condition, DataSource, SourceQuery};
use crate::datetime::parse_datetime;

pub struct MemorySource {
    tables: RwLock<HashMap<String, Vec<Map<String, Value>>>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
        }
    }

    /// Append rows to `table`, creating it if needed.
    pub fn insert(&self, table: &str, rows: impl IntoIterator<Item = Value>) {
        let mut tables = self.tables.write().unwrap_or_else(|e| e.into_inner());
        let entry = tables.entry(table.to_string()).or_default();
        for row in rows {
            if let Value::Object(map) = row {
                entry.push(map);
            }
        }
    }

    fn matching(&self, query: &SourceQuery) -> Result<Vec<Map<String, Value>>> {
        let tables = self.tables.read().unwrap_or_else(|e| e.into_inner());
        let rows = tables.get(&query.table).cloned().unwrap_or_default();

        let mut out = Vec::new();
        for row in rows {
            if row_matches(&row, &query.conditions)? {
                out.push(row);
            }
        }
        out.sort_by(|a, b| {
            compare_keys(
                a.get(&query.primary_key).unwrap_or(&Value::Null),
                b.get(&query.primary_key).unwrap_or(&Value::Null),
            )
        });
        Ok(out)
    }
}

impl Default for MemorySource {
    fn default() -> Self {
        Self::new()
    }
}

fn row_matches(row: &Map<String, Value>, conditions: &[Condition]) -> Result<bool> {
    for condition in conditions {
        match condition {
            Condition::UpdatedSince { column, since } => {
                let Some(value) = row.get(column).filter(|v| !v.is_null()) else {
                    return Ok(false);
                };
                let since_value = Value::String(since.clone());
                let newer = match (parse_datetime(value), parse_datetime(&since_value)) {
                    (Some(v), Some(s)) => v >= s,
                    _ => key_string(value) >= *since,
                };
                if !newer {
                    return Ok(false);
                }
            }
            Condition::Raw(fragment) => {
                bail!("in-memory source cannot evaluate where-fragment: {}", fragment)
            }
        }
    }
    Ok(true)
}

fn project(row: Map<String, Value>, columns: &[String]) -> Map<String, Value> {
    if columns.is_empty() {
        return row;
    }
    columns
        .iter()
        .map(|c| (c.clone(), row.get(c).cloned().unwrap_or(Value::Null)))
        .collect()
}

#[async_trait]
impl DataSource for MemorySource {
    async fn fetch_page(
        &self,
        query: &SourceQuery,
        after: Option<&Value>,
        limit: usize,
    ) -> Result<Vec<Map<String, Value>>> {
        let rows = self.matching(query)?;
        Ok(rows
            .into_iter()
            .filter(|row| match after {
                Some(key) => {
                    let pk = row.get(&query.primary_key).unwrap_or(&Value::Null);
                    compare_keys(pk, key).is_gt()
                }
                None => true,
            })
            .take(limit)
            .map(|row| project(row, &query.columns))
            .collect())
    }

    async fn count(&self, query: &SourceQuery) -> Result<u64> {
        Ok(self.matching(query)?.len() as u64)
    }

    async fn fetch_related(
        &self,
        table: &str,
        key_column: &str,
        keys: &[Value],
    ) -> Result<Vec<Map<String, Value>>> {
        let wanted: Vec<String> = keys.iter().map(key_string).collect();
        let tables = self.tables.read().unwrap_or_else(|e| e.into_inner());
        Ok(tables
            .get(table)
            .map(|rows| {
                rows.iter()
                    .filter(|row| {
                        row.get(key_column)
                            .map(|v| wanted.contains(&key_string(v)))
                            .unwrap_or(false)
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}
