//! Persistent key/value store with per-entry expiry.
//!
//! Two kinds of entries live here:
//!
//! | Key | Value | TTL |
//! |-----|-------|-----|
//! | `lastUpsert:<slug>` | `%Y-%m-%d %H:%M:%S` (UTC) | 30 days |
//! | `rateLimit:<identity>` | JSON [`RateLimitSnapshot`](crate::ratelimit::RateLimitSnapshot) | until reset |
//!
//! Entries past their expiry read as absent. [`KvStore::compare_and_swap`] is
//! the only write used for shared state that several workers update.

pub mod memory;
pub mod sqlite;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::time::Duration;

/// Retention of the last-successful-sync watermark.
pub const LAST_UPSERT_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store `value`, replacing any existing entry. `ttl = None` never expires.
    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    async fn forget(&self, key: &str) -> Result<()>;

    /// Atomically replace the entry if its current value equals `expected`
    /// (`None` = absent or expired). Returns whether the write happened.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
        ttl: Option<Duration>,
    ) -> Result<bool>;
}

pub fn last_upsert_key(slug: &str) -> String {
    format!("lastUpsert:{}", slug)
}

pub fn rate_limit_key(identity: &str) -> String {
    format!("rateLimit:{}", identity)
}

/// Stable, non-reversible identity for an API key: first 16 hex chars of its SHA-256.
pub fn api_identity(api_key: &str) -> String {
    let digest = hex::encode(Sha256::digest(api_key.as_bytes()));
    digest[..16].to_string()
}

/// Absolute expiry (Unix seconds) for a TTL starting now.
pub(crate) fn expires_at(ttl: Option<Duration>) -> Option<i64> {
    ttl.map(|ttl| Utc::now().timestamp().saturating_add(ttl.as_secs() as i64))
}

pub(crate) fn is_expired(expires_at: Option<i64>, now: i64) -> bool {
    matches!(expires_at, Some(at) if at <= now)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_shapes() {
        assert_eq!(last_upsert_key("invoices"), "lastUpsert:invoices");
        assert_eq!(rate_limit_key("abc"), "rateLimit:abc");
    }

    #[test]
    fn identity_is_short_stable_hex() {
        let a = api_identity("secret-key");
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(a, api_identity("secret-key"));
        assert_ne!(a, api_identity("other-key"));
    }

    #[test]
    fn expiry_boundaries() {
        assert!(!is_expired(None, 100));
        assert!(is_expired(Some(100), 100));
        assert!(!is_expired(Some(101), 100));
    }
}
