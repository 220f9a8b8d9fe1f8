//! Application data source abstraction.
//!
//! The sync pipeline needs only a small capability set from the store it
//! reads: column selection, a greater-or-equal filter on an updated-at
//! column, extra where-fragments, keyset paging by primary key, and batched
//! lookups of related rows. [`DataSource`] is that contract;
//! [`sqlite::SqliteSource`] and [`memory::MemorySource`] implement it.
//!
//! Rows travel as JSON objects so the mapper can treat every backend alike.

pub mod memory;
pub mod sqlite;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::error::ConfigError;

/// One fetched row plus its eagerly loaded relations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    pub fields: Map<String, Value>,
    /// Relation name → related row. `None` means "loaded, nothing found".
    pub relations: BTreeMap<String, Option<Map<String, Value>>>,
}

impl Record {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self {
            fields,
            relations: BTreeMap::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// The related row for `name`, if one was loaded.
    pub fn relation(&self, name: &str) -> Option<&Map<String, Value>> {
        self.relations.get(name).and_then(|r| r.as_ref())
    }

    pub fn with_relation(mut self, name: impl Into<String>, row: Option<Map<String, Value>>) -> Self {
        self.relations.insert(name.into(), row);
        self
    }
}

/// A filter applied to a [`SourceQuery`].
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// `column >= since`
    UpdatedSince { column: String, since: String },
    /// A trusted where-fragment from configuration (scopes, query filters).
    Raw(String),
}

/// Declarative description of the rows to read for one collection.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceQuery {
    pub table: String,
    pub primary_key: String,
    /// Selected columns; empty selects every column.
    pub columns: Vec<String>,
    pub conditions: Vec<Condition>,
}

impl SourceQuery {
    pub fn new(table: impl Into<String>, primary_key: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            primary_key: primary_key.into(),
            columns: Vec::new(),
            conditions: Vec::new(),
        }
    }

    pub fn select(mut self, columns: Vec<String>) -> Self {
        self.columns = columns;
        self
    }

    pub fn where_updated_since(mut self, column: impl Into<String>, since: impl Into<String>) -> Self {
        self.conditions.push(Condition::UpdatedSince {
            column: column.into(),
            since: since.into(),
        });
        self
    }

    pub fn where_raw(mut self, fragment: impl Into<String>) -> Self {
        self.conditions.push(Condition::Raw(fragment.into()));
        self
    }
}

/// Read-side contract the sync pipeline needs from the application database.
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Fetch up to `limit` rows with primary key greater than `after`,
    /// ordered by primary key ascending.
    async fn fetch_page(
        &self,
        query: &SourceQuery,
        after: Option<&Value>,
        limit: usize,
    ) -> Result<Vec<Map<String, Value>>>;

    /// Count rows matching the query (used for progress and dry runs).
    async fn count(&self, query: &SourceQuery) -> Result<u64>;

    /// Load rows of `table` whose `key_column` is one of `keys`.
    async fn fetch_related(
        &self,
        table: &str,
        key_column: &str,
        keys: &[Value],
    ) -> Result<Vec<Map<String, Value>>>;
}

/// Reject anything that is not a plain SQL identifier.
pub fn validate_identifier(ident: &str) -> std::result::Result<(), ConfigError> {
    let valid = !ident.is_empty()
        && ident
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !ident.starts_with(|c: char| c.is_ascii_digit());

    if valid {
        Ok(())
    } else {
        Err(ConfigError::InvalidIdentifier(ident.to_string()))
    }
}

/// Canonical string form of a key, so `10` and `"10"` join to the same row.
pub fn key_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

/// Order two key values: numerically when both are numbers, else by string form.
pub fn compare_keys(a: &Value, b: &Value) -> Ordering {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) if a.is_number() && b.is_number() => {
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        _ => key_string(a).cmp(&key_string(b)),
    }
}
