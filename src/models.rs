//! Wire payloads exchanged with the remote vector API.
//!
//! These types serialize to exactly the JSON shapes the API expects:
//!
//! ```text
//! POST upserts  { "collection": { "slug", "metadata" }, "items": [ { "id", "data", "metadata", "tenant", "url" } ] }
//! POST query    { "text", "limit", "filter" }
//! ```

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Declared value type of a column or metadata field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    #[default]
    String,
    Enum,
    Datetime,
    Integer,
    Number,
    Boolean,
}

/// Schema entry for one metadata field, as declared to the remote index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetaSpec {
    #[serde(rename = "type", default)]
    pub value_type: ValueType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<String>>,
}

impl MetaSpec {
    pub fn new(value_type: ValueType) -> Self {
        Self {
            value_type,
            options: None,
        }
    }

    pub fn with_options(mut self, options: Vec<String>) -> Self {
        self.options = Some(options);
        self
    }
}

/// Target index identity plus its metadata schema.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Collection {
    pub slug: String,
    pub metadata: IndexMap<String, MetaSpec>,
}

impl Collection {
    pub fn new(slug: impl Into<String>) -> Self {
        Self {
            slug: slug.into(),
            metadata: IndexMap::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: IndexMap<String, MetaSpec>) -> Self {
        self.metadata = metadata;
        self
    }
}

/// One normalized source record.
///
/// `data` and `metadata` never contain JSON nulls; the mapper drops them.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Item {
    pub id: Value,
    pub data: Map<String, Value>,
    pub metadata: Map<String, Value>,
    pub tenant: Option<Value>,
    pub url: Option<String>,
}

impl Item {
    pub fn new(id: impl Into<Value>, data: Map<String, Value>) -> Self {
        Self {
            id: id.into(),
            data,
            metadata: Map::new(),
            tenant: None,
            url: None,
        }
    }
}

/// The unit of network transfer: one chunk of items for one collection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Upsert {
    pub collection: Collection,
    pub items: Vec<Item>,
}

impl Upsert {
    pub fn new(collection: Collection, items: Vec<Item>) -> Self {
        Self { collection, items }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Semantic query against the remote index.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryRequest {
    pub text: String,
    pub limit: u32,
    pub filter: Map<String, Value>,
}

impl QueryRequest {
    pub const DEFAULT_LIMIT: u32 = 50;

    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            limit: Self::DEFAULT_LIMIT,
            filter: Map::new(),
        }
    }

    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_filter(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter.insert(key.into(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn invoice_metadata() -> IndexMap<String, MetaSpec> {
        let mut metadata = IndexMap::new();
        metadata.insert("customer_name".to_string(), MetaSpec::new(ValueType::String));
        metadata.insert(
            "status".to_string(),
            MetaSpec::new(ValueType::Enum).with_options(vec![
                "draft".to_string(),
                "sent".to_string(),
                "paid".to_string(),
            ]),
        );
        metadata.insert("due_at".to_string(), MetaSpec::new(ValueType::Datetime));
        metadata
    }

    #[test]
    fn collection_without_metadata_serializes_empty_object() {
        let collection = Collection::new("invoices");
        let value = serde_json::to_value(&collection).unwrap();
        assert_eq!(value, json!({ "slug": "invoices", "metadata": {} }));
    }

    #[test]
    fn collection_metadata_schema_shape() {
        let collection = Collection::new("invoices").with_metadata(invoice_metadata());
        let value = serde_json::to_value(&collection).unwrap();
        assert_eq!(
            value,
            json!({
                "slug": "invoices",
                "metadata": {
                    "customer_name": { "type": "string" },
                    "status": { "type": "enum", "options": ["draft", "sent", "paid"] },
                    "due_at": { "type": "datetime" }
                }
            })
        );
    }

    #[test]
    fn item_defaults_to_null_tenant_and_url() {
        let mut data = Map::new();
        data.insert("amount".to_string(), json!(100));
        let item = Item::new(1, data);
        let value = serde_json::to_value(&item).unwrap();
        assert_eq!(
            value,
            json!({ "id": 1, "data": { "amount": 100 }, "metadata": {}, "tenant": null, "url": null })
        );
    }

    #[test]
    fn upsert_payload_shape() {
        let mut data = Map::new();
        data.insert("amount".to_string(), json!(1500.0));
        let mut item = Item::new(1, data);
        item.metadata.insert("status".to_string(), json!("sent"));
        item.tenant = Some(json!(123));
        item.url = Some("https://example.com/invoices/1".to_string());

        let upsert = Upsert::new(Collection::new("invoices"), vec![item]);
        let value = serde_json::to_value(&upsert).unwrap();
        assert_eq!(value["collection"]["slug"], "invoices");
        assert_eq!(value["items"][0]["metadata"]["status"], "sent");
        assert_eq!(value["items"][0]["tenant"], 123);
        assert_eq!(value["items"][0]["url"], "https://example.com/invoices/1");
        assert_eq!(upsert.len(), 1);
    }

    #[test]
    fn query_request_defaults() {
        let query = QueryRequest::new("overdue invoices").with_filter("status", "sent");
        let value = serde_json::to_value(&query).unwrap();
        assert_eq!(
            value,
            json!({ "text": "overdue invoices", "limit": 50, "filter": { "status": "sent" } })
        );
    }

    #[test]
    fn value_type_parses_lowercase() {
        let spec: MetaSpec = serde_json::from_value(json!({ "type": "datetime" })).unwrap();
        assert_eq!(spec.value_type, ValueType::Datetime);
        let spec: MetaSpec = serde_json::from_value(json!({})).unwrap();
        assert_eq!(spec.value_type, ValueType::String);
    }
}
