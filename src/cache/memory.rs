//! In-process [`KvStore`]. State is lost when the process exits.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use super::{expires_at, is_expired, KvStore};

#[derive(Default)]
pub struct MemoryKvStore {
    entries: RwLock<HashMap<String, (String, Option<i64>)>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let now = Utc::now().timestamp();
        Ok(entries
            .get(key)
            .filter(|(_, exp)| !is_expired(*exp, now))
            .map(|(value, _)| value.clone()))
    }

    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.insert(key.to_string(), (value.to_string(), expires_at(ttl)));
        Ok(())
    }

    async fn forget(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.remove(key);
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let now = Utc::now().timestamp();
        let current = entries
            .get(key)
            .filter(|(_, exp)| !is_expired(*exp, now))
            .map(|(value, _)| value.as_str());

        if current != expected {
            return Ok(false);
        }

        entries.insert(key.to_string(), (new.to_string(), expires_at(ttl)));
        Ok(true)
    }
}
