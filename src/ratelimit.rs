//! Shared rate-limit state for one API identity.
//!
//! The remote API reports its remaining budget in `X-RateLimit-Remaining`
//! and the window length in `Retry-After`. Every response updates a
//! [`RateLimitSnapshot`] stored in the [`KvStore`] under
//! `rateLimit:<identity>`, expiring at the snapshot's reset time, so every
//! worker process pointed at the same store throttles against the same
//! budget.
//!
//! Writes go through compare-and-swap and never replace a snapshot observed
//! later than the one being written.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::cache::{api_identity, rate_limit_key, KvStore};

/// Reset window assumed when a response carries no `Retry-After`.
pub const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(90);

/// Longest single sleep, whether proactive or after a 429.
pub const MAX_WAIT: Duration = Duration::from_secs(90);

const MAX_SWAP_ATTEMPTS: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitSnapshot {
    pub remaining: i64,
    pub reset_at: DateTime<Utc>,
    pub observed_at: DateTime<Utc>,
}

impl RateLimitSnapshot {
    /// Snapshot for a response reporting `remaining` requests left, resetting after `retry_after`.
    pub fn observed(remaining: i64, retry_after: Duration, now: DateTime<Utc>) -> Self {
        let window = chrono::Duration::from_std(retry_after).unwrap_or(chrono::Duration::zero());
        Self {
            remaining,
            reset_at: now + window,
            observed_at: now,
        }
    }

    /// Snapshot after a 429: budget exhausted until `now + retry_after`.
    pub fn exhausted(retry_after: Duration, now: DateTime<Utc>) -> Self {
        Self::observed(0, retry_after, now)
    }

    /// Time left until the window resets; zero once it has passed.
    pub fn wait(&self, now: DateTime<Utc>) -> Duration {
        (self.reset_at - now).to_std().unwrap_or(Duration::ZERO)
    }
}

/// What CHECK_LIMIT should do before sending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Throttle {
    /// No delay needed.
    Proceed,
    /// The stored window already reset; drop the snapshot.
    Expired,
    /// Sleep this long before sending.
    Wait(Duration),
}

/// Proactive delay policy: the closer the budget is to exhaustion, the
/// larger the share of the reset window to wait out.
pub fn throttle(snapshot: &RateLimitSnapshot, now: DateTime<Utc>) -> Throttle {
    let wait = snapshot.wait(now);
    if wait.is_zero() {
        return Throttle::Expired;
    }

    let delay = match snapshot.remaining {
        r if r <= 0 => wait.min(MAX_WAIT),
        r if r <= 2 => (wait / 2).min(Duration::from_secs(30)),
        r if r <= 5 => (wait / 4).min(Duration::from_secs(10)),
        _ => Duration::ZERO,
    };

    if delay.is_zero() {
        Throttle::Proceed
    } else {
        Throttle::Wait(delay)
    }
}

/// Rate-limit state for one API key, persisted in a shared store.
#[derive(Clone)]
pub struct RateLimitState {
    store: Arc<dyn KvStore>,
    key: String,
}

impl RateLimitState {
    pub fn new(store: Arc<dyn KvStore>, api_key: &str) -> Self {
        Self {
            store,
            key: rate_limit_key(&api_identity(api_key)),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Current snapshot, if any. An unreadable stored value counts as absent.
    pub async fn load(&self) -> Result<Option<RateLimitSnapshot>> {
        Ok(self.load_raw().await?.1)
    }

    async fn load_raw(&self) -> Result<(Option<String>, Option<RateLimitSnapshot>)> {
        let raw = self.store.get(&self.key).await?;
        let snapshot = raw.as_deref().and_then(|s| match serde_json::from_str(s) {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                warn!(key = %self.key, error = %e, "discarding unreadable rate-limit snapshot");
                None
            }
        });
        Ok((raw, snapshot))
    }

    /// Evaluate the proactive throttle.
    ///
    /// A snapshot whose window has reset imposes no delay. It is not deleted
    /// here: its store TTL ends at the same reset time, and an unconditional
    /// delete could drop a snapshot another worker recorded after the read.
    pub async fn check(&self, now: DateTime<Utc>) -> Result<Option<Duration>> {
        let Some(snapshot) = self.load().await? else {
            return Ok(None);
        };

        match throttle(&snapshot, now) {
            Throttle::Proceed | Throttle::Expired => Ok(None),
            Throttle::Wait(delay) => Ok(Some(delay)),
        }
    }

    /// Store `snapshot` unless a newer observation is already stored.
    ///
    /// Returns `false` when the write was skipped as stale or lost every
    /// compare-and-swap race.
    pub async fn record(&self, snapshot: &RateLimitSnapshot) -> Result<bool> {
        let value = serde_json::to_string(snapshot)?;
        let ttl = snapshot.wait(snapshot.observed_at);

        for _ in 0..MAX_SWAP_ATTEMPTS {
            let (raw, current) = self.load_raw().await?;

            if let Some(current) = &current {
                if current.observed_at > snapshot.observed_at {
                    debug!(
                        key = %self.key,
                        stored = %current.observed_at,
                        "newer rate-limit snapshot already stored"
                    );
                    return Ok(false);
                }
            }

            if self
                .store
                .compare_and_swap(&self.key, raw.as_deref(), &value, Some(ttl))
                .await?
            {
                debug!(
                    remaining = snapshot.remaining,
                    reset_at = %snapshot.reset_at,
                    "rate limit updated"
                );
                return Ok(true);
            }
        }

        warn!(key = %self.key, "rate-limit snapshot update lost every swap attempt");
        Ok(false)
    }
}
