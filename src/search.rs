//! `vectorify query`: semantic search against the remote index.

use anyhow::{bail, Result};
use serde_json::Value;

use crate::config::Config;
use crate::endpoints::Queries;
use crate::error::ConfigError;
use crate::models::QueryRequest;

/// Build a query request from CLI arguments.
///
/// `filters` are `key=value` pairs; values that parse as JSON keep their
/// type (`team_id=42` filters on a number), anything else is a string.
pub fn build_query(
    config: &Config,
    text: &str,
    collection: Option<&str>,
    limit: Option<u32>,
    filters: &[String],
) -> Result<QueryRequest> {
    let mut request = QueryRequest::new(text.trim());
    if let Some(limit) = limit {
        if limit == 0 {
            bail!("--limit must be >= 1");
        }
        request = request.with_limit(limit);
    }

    if let Some(slug) = collection {
        if !config.collections.contains_key(slug) {
            return Err(ConfigError::UnknownCollection(slug.to_string()).into());
        }
        request = request.with_filter("collection", slug);
    }

    for filter in filters {
        let Some((key, raw)) = filter.split_once('=') else {
            bail!("invalid --filter '{}': expected key=value", filter);
        };
        let value = serde_json::from_str::<Value>(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        request = request.with_filter(key.trim(), value);
    }

    Ok(request)
}

pub async fn run_query(queries: &Queries, request: &QueryRequest) -> Result<()> {
    if request.text.is_empty() {
        println!("No results.");
        return Ok(());
    }

    match queries.send(request).await? {
        Some(body) => println!("{}", serde_json::to_string_pretty(&body)?),
        None => bail!("query rejected by the API"),
    }
    Ok(())
}
