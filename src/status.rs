//! `vectorify status`: last successful sync per collection and the API budget.
//!
//! Never fails on missing data: a collection without a watermark shows as
//! "Never" / "Pending", an absent rate-limit snapshot as "Unknown".

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::cache::{last_upsert_key, KvStore};
use crate::config::Config;
use crate::datetime::{humanize_since, parse_datetime_str};
use crate::ratelimit::{RateLimitSnapshot, RateLimitState};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionStatus {
    pub name: String,
    pub last_upsert: String,
    pub upserted: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatusReport {
    pub collections: Vec<CollectionStatus>,
    pub rate_limit: Option<RateLimitSnapshot>,
}

pub async fn collect_status(
    config: &Config,
    store: &dyn KvStore,
    rate_limit: Option<&RateLimitState>,
    now: DateTime<Utc>,
) -> StatusReport {
    let mut collections = Vec::with_capacity(config.collections.len());

    for slug in config.collections.keys() {
        let stored = match store.get(&last_upsert_key(slug)).await {
            Ok(value) => value,
            Err(e) => {
                warn!(collection = %slug, error = %e, "failed to read watermark");
                None
            }
        };

        let last_upsert = match &stored {
            Some(raw) => parse_datetime_str(raw)
                .map(|at| humanize_since(at, now))
                .unwrap_or_else(|| raw.clone()),
            None => "Never".to_string(),
        };

        collections.push(CollectionStatus {
            name: Config::collection_name(slug),
            last_upsert,
            upserted: stored.is_some(),
        });
    }

    let rate_limit = match rate_limit {
        Some(state) => state.load().await.unwrap_or_else(|e| {
            warn!(error = %e, "failed to read rate-limit snapshot");
            None
        }),
        None => None,
    };

    StatusReport {
        collections,
        rate_limit,
    }
}

pub fn render(report: &StatusReport, now: DateTime<Utc>) -> String {
    let mut out = String::new();

    if report.collections.is_empty() {
        out.push_str("No collections configured.\n");
    } else {
        let width = report
            .collections
            .iter()
            .map(|c| c.name.len())
            .max()
            .unwrap_or(0)
            .max("COLLECTION".len());

        out.push_str(&format!("{:<width$}  {:<20}  STATUS\n", "COLLECTION", "LAST UPSERT"));
        for c in &report.collections {
            let status = if c.upserted { "Upserted" } else { "Pending" };
            out.push_str(&format!("{:<width$}  {:<20}  {}\n", c.name, c.last_upsert, status));
        }
    }

    out.push('\n');
    out.push_str("API rate limit\n");
    match &report.rate_limit {
        Some(snapshot) => {
            out.push_str(&format!("  remaining requests: {}\n", snapshot.remaining));
            out.push_str(&format!("  reset: {}\n", humanize_since(snapshot.reset_at, now)));
        }
        None => {
            out.push_str("  remaining requests: Unknown\n");
            out.push_str("  reset: Unknown\n");
        }
    }

    out
}
