//! Error taxonomy for plan construction and the HTTP transport.
//!
//! - [`ConfigError`] is raised while resolving a collection plan. It is fatal
//!   and never retried; it aborts a collection run before any network activity.
//! - [`TransportError`] is what the transport surfaces once its retry budget is
//!   spent, or when a request cannot be built at all. Transient failures (429,
//!   5xx, connection errors) are contained inside the retry loop.
//!
//! Mapping problems (null fields, absent relations, unparseable datetimes) are
//! not errors; the mapper logs and skips them.

use thiserror::Error;

/// Configuration-time failures. Never retried.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown collection '{0}'")]
    UnknownCollection(String),

    #[error("collection '{collection}' references unknown source '{source_name}'")]
    UnknownSource {
        collection: String,
        source_name: String,
    },

    #[error("source '{0}' does not satisfy the source contract: {1}")]
    InvalidSource(String, String),

    #[error("invalid identifier '{0}': only letters, digits and underscores are allowed")]
    InvalidIdentifier(String),

    #[error("resource '{0}' is not registered")]
    UnknownResource(String),

    #[error("resource '{0}' is not a recognized formatter: {1}")]
    IncapableResource(String, String),

    #[error("collection '{0}' requires a tenant column in multi-tenant mode")]
    MissingTenant(String),

    #[error("column '{column}' in collection '{collection}': {reason}")]
    InvalidColumn {
        collection: String,
        column: String,
        reason: String,
    },

    #[error("relation '{relation}' in collection '{collection}': {reason}")]
    InvalidRelation {
        collection: String,
        relation: String,
        reason: String,
    },

    #[error("invalid query for collection '{0}': {1}")]
    InvalidQuery(String, String),
}

/// Failures surfaced by the transport after classification.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request failed after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("rate-limit state unavailable: {0}")]
    Cache(#[source] anyhow::Error),

    #[error("invalid header value: {0}")]
    InvalidHeader(String),

    #[error("invalid base URL '{0}': {1}")]
    InvalidBaseUrl(String, String),
}

impl TransportError {
    /// Returns true when the retry budget was spent on transient failures.
    pub fn is_exhausted(&self) -> bool {
        matches!(self, TransportError::RetriesExhausted { .. })
    }
}
