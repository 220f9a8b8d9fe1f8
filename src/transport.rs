//! Rate-limit aware HTTP executor for the remote vector API.
//!
//! Every logical request runs the same loop, at most `max_attempts` times:
//!
//! 1. **Check limit**: consult the shared [`RateLimitState`] and sleep
//!    proactively when the remaining budget is low.
//! 2. **Send**: one HTTP call with the configured timeout and the
//!    `Api-Key` header.
//! 3. **Classify** the outcome:
//!    - 2xx: record the rate-limit headers and return the JSON body
//!    - 429: mark the budget exhausted until `Retry-After` (default 90s),
//!      sleep at most 90s, retry
//!    - 5xx or a network error: retry after `min(2^(attempt-1), 60)` seconds
//!    - any other status: log it and return `Ok(None)`, no retry
//!
//! Running out of attempts yields [`TransportError::RetriesExhausted`].
//! Sleeping goes through a [`Sleeper`] so tests can observe delays
//! without waiting for them.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::{Method, StatusCode, Url};
use serde::Serialize;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::ApiConfig;
use crate::error::TransportError;
use crate::ratelimit::{RateLimitSnapshot, RateLimitState, DEFAULT_RETRY_AFTER, MAX_WAIT};

pub const RATE_LIMIT_REMAINING: &str = "X-RateLimit-Remaining";
pub const RETRY_AFTER: &str = "Retry-After";
pub const API_KEY_HEADER: &str = "Api-Key";

const MAX_BACKOFF_SECS: u64 = 60;

/// Delay before retrying after the given (1-based) failed attempt.
pub fn backoff(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(6);
    Duration::from_secs((1u64 << exp).min(MAX_BACKOFF_SECS))
}

#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Records requested delays and returns immediately.
#[derive(Default)]
pub struct RecordingSleeper {
    slept: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn recorded(&self) -> Vec<Duration> {
        self.slept.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.slept
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(duration);
    }
}

pub struct Transport {
    client: reqwest::Client,
    base_url: Url,
    api_key: HeaderValue,
    max_attempts: u32,
    rate_limit: RateLimitState,
    sleeper: Arc<dyn Sleeper>,
}

impl Transport {
    pub fn new(api: &ApiConfig, api_key: &str, rate_limit: RateLimitState) -> Result<Self, TransportError> {
        let mut base = api.base_url.clone();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url = Url::parse(&base)
            .map_err(|e| TransportError::InvalidBaseUrl(api.base_url.clone(), e.to_string()))?;

        let mut api_key = HeaderValue::from_str(api_key)
            .map_err(|_| TransportError::InvalidHeader(API_KEY_HEADER.to_string()))?;
        api_key.set_sensitive(true);

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(api.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url,
            api_key,
            max_attempts: api.max_attempts.max(1),
            rate_limit,
            sleeper: Arc::new(TokioSleeper),
        })
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn rate_limit(&self) -> &RateLimitState {
        &self.rate_limit
    }

    pub async fn get(&self, path: &str) -> Result<Option<Value>, TransportError> {
        self.request::<Value>(Method::GET, path, None).await
    }

    pub async fn post<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<Option<Value>, TransportError> {
        self.request(Method::POST, path, Some(body)).await
    }

    pub async fn put<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<Option<Value>, TransportError> {
        self.request(Method::PUT, path, Some(body)).await
    }

    pub async fn patch<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<Option<Value>, TransportError> {
        self.request(Method::PATCH, path, Some(body)).await
    }

    pub async fn delete(&self, path: &str) -> Result<Option<Value>, TransportError> {
        self.request::<Value>(Method::DELETE, path, None).await
    }

    /// Run one logical request through the retry loop.
    ///
    /// `Ok(Some(body))` on success (`Value::Null` for an empty body),
    /// `Ok(None)` when the API rejected the request with a non-retryable status.
    #[tracing::instrument(skip(self, body), fields(method = %method))]
    pub async fn request<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<Option<Value>, TransportError> {
        let url = self
            .base_url
            .join(path.trim_start_matches('/'))
            .map_err(|e| TransportError::InvalidBaseUrl(path.to_string(), e.to_string()))?;
        let payload = body.map(serde_json::to_vec).transpose()?;

        let mut last = String::from("no attempt made");

        for attempt in 1..=self.max_attempts {
            let retries_left = attempt < self.max_attempts;

            if let Some(delay) = self
                .rate_limit
                .check(Utc::now())
                .await
                .map_err(TransportError::Cache)?
            {
                info!(attempt, delay_secs = delay.as_secs_f64(), "rate limit preventive delay");
                self.sleeper.sleep(delay).await;
            }

            let mut request = self
                .client
                .request(method.clone(), url.clone())
                .header(ACCEPT, "application/json")
                .header(CONTENT_TYPE, "application/json")
                .header(API_KEY_HEADER, self.api_key.clone());
            if let Some(payload) = &payload {
                request = request.body(payload.clone());
            }

            let response = match request.send().await {
                Ok(response) => response,
                Err(e) => {
                    warn!(attempt, error = %e, "request failed, will retry");
                    last = e.to_string();
                    if retries_left {
                        self.sleeper.sleep(backoff(attempt)).await;
                    }
                    continue;
                }
            };

            let status = response.status();
            self.observe(response.headers()).await;

            if status == StatusCode::TOO_MANY_REQUESTS {
                let retry_after = header_secs(response.headers(), RETRY_AFTER)
                    .map(Duration::from_secs)
                    .unwrap_or(DEFAULT_RETRY_AFTER);
                warn!(attempt, retry_after_secs = retry_after.as_secs(), "rate limit exceeded");

                let snapshot = RateLimitSnapshot::exhausted(retry_after, Utc::now());
                if let Err(e) = self.rate_limit.record(&snapshot).await {
                    warn!(error = %e, "failed to store rate-limit snapshot");
                }

                last = status.to_string();
                if retries_left {
                    self.sleeper.sleep(retry_after.min(MAX_WAIT)).await;
                }
                continue;
            }

            if status.is_server_error() {
                warn!(attempt, status = status.as_u16(), "server error, will retry");
                last = format!("server error: {}", status);
                if retries_left {
                    self.sleeper.sleep(backoff(attempt)).await;
                }
                continue;
            }

            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                error!(status = status.as_u16(), body = %body, "request rejected");
                return Ok(None);
            }

            let bytes = response.bytes().await?;
            if bytes.is_empty() {
                return Ok(Some(Value::Null));
            }
            return Ok(Some(serde_json::from_slice(&bytes)?));
        }

        Err(TransportError::RetriesExhausted {
            attempts: self.max_attempts,
            last,
        })
    }

    /// Record the budget reported by any response that carries it.
    async fn observe(&self, headers: &HeaderMap) {
        let Some(remaining) = header_i64(headers, RATE_LIMIT_REMAINING) else {
            return;
        };
        let retry_after = header_secs(headers, RETRY_AFTER)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_RETRY_AFTER);

        let snapshot = RateLimitSnapshot::observed(remaining, retry_after, Utc::now());
        if let Err(e) = self.rate_limit.record(&snapshot).await {
            warn!(error = %e, "failed to store rate-limit snapshot");
        } else {
            debug!(remaining, "observed rate-limit headers");
        }
    }
}

fn header_i64(headers: &HeaderMap, name: &str) -> Option<i64> {
    headers.get(name)?.to_str().ok()?.trim().parse().ok()
}

fn header_secs(headers: &HeaderMap, name: &str) -> Option<u64> {
    header_i64(headers, name).map(|v| v.max(0) as u64)
}
