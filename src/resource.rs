//! Pre-formatting transforms ("resources").
//!
//! A collection may name a resource instead of declaring columns. The resource
//! owns field shaping: it receives the fetched [`Record`] and returns the flat
//! field map for the item. A `{"data": {...}}` envelope is unwrapped by the
//! mapper, so resources that wrap their output are accepted as-is.
//!
//! Resources are registered by name in a [`ResourceRegistry`] and resolved
//! once per collection run, when the plan is built.

use anyhow::Result;
use serde_json::Value;
use std::sync::Arc;

use crate::source::Record;

/// A named record formatter.
///
/// # Example
///
/// ```rust
/// use anyhow::Result;
/// use serde_json::{json, Value};
/// use vectorify_sync::resource::Resource;
/// use vectorify_sync::source::Record;
///
/// struct InvoiceResource;
///
/// impl Resource for InvoiceResource {
///     fn name(&self) -> &str { "invoice" }
///
///     fn format(&self, record: &Record) -> Result<Value> {
///         Ok(json!({
///             "data": {
///                 "id": record.get("id").cloned().unwrap_or(Value::Null),
///                 "total": record.get("amount").cloned().unwrap_or(Value::Null),
///             }
///         }))
///     }
/// }
/// ```
pub trait Resource: Send + Sync {
    /// Name used in `resource = "..."` collection settings.
    fn name(&self) -> &str;

    /// Capability check run at plan construction.
    ///
    /// Return `Err(reason)` when the resource cannot act as a formatter in
    /// this process (missing template, unsupported mode, ...).
    fn check(&self) -> std::result::Result<(), String> {
        Ok(())
    }

    /// Produce the item's field map for one record.
    ///
    /// Must return a JSON object, optionally wrapped as `{"data": {...}}`.
    fn format(&self, record: &Record) -> Result<Value>;
}

impl std::fmt::Debug for dyn Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Resource({})", self.name())
    }
}

/// Named collection of [`Resource`]s.
pub struct ResourceRegistry {
    resources: Vec<Arc<dyn Resource>>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self {
            resources: Vec::new(),
        }
    }

    /// Register a resource. A later registration with the same name shadows earlier ones.
    pub fn register(&mut self, resource: Arc<dyn Resource>) {
        self.resources.push(resource);
    }

    pub fn find(&self, name: &str) -> Option<Arc<dyn Resource>> {
        self.resources
            .iter()
            .rev()
            .find(|r| r.name() == name)
            .cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }
}

impl Default for ResourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
