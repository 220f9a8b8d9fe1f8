//! Typed endpoints of the remote vector API.

use serde_json::Value;
use std::sync::Arc;
use tracing::info;

use crate::error::TransportError;
use crate::models::{QueryRequest, Upsert};
use crate::transport::Transport;

/// `POST upserts`: create or replace items by id in a collection's index.
#[derive(Clone)]
pub struct Upserts {
    transport: Arc<Transport>,
}

impl Upserts {
    pub const PATH: &'static str = "upserts";

    pub fn new(transport: Arc<Transport>) -> Self {
        Self { transport }
    }

    /// Submit one chunk. `Ok(false)` when the API rejected it.
    pub async fn create(&self, upsert: &Upsert) -> Result<bool, TransportError> {
        let response = self.transport.post(Self::PATH, upsert).await?;
        if response.is_some() {
            info!(collection = %upsert.collection.slug, items = upsert.len(), "chunk upserted");
        }
        Ok(response.is_some())
    }
}

/// `POST query`: semantic search over indexed items.
#[derive(Clone)]
pub struct Queries {
    transport: Arc<Transport>,
}

impl Queries {
    pub const PATH: &'static str = "query";

    pub fn new(transport: Arc<Transport>) -> Self {
        Self { transport }
    }

    /// The decoded response body, or `None` when the API rejected the query.
    pub async fn send(&self, query: &QueryRequest) -> Result<Option<Value>, TransportError> {
        self.transport.post(Self::PATH, query).await
    }
}
