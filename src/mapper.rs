//! Record → [`Item`] mapping.
//!
//! Each record is mapped through a fresh [`Scratch`] value holding two maps:
//! `data`, which becomes the item's payload, and `excluded`, which keeps
//! every value that left `data` (primary key, aliased source keys, columns
//! with `data = false`, relation foreign keys, fields selected only for
//! metadata or the tenant). Metadata and tenant lookups read `data` first
//! and fall back to `excluded`, so a field hidden from the payload is still
//! available to both.
//!
//! Null values are never emitted: they are skipped while mapping and a
//! final sweep removes any left over from unconfigured fields.

use anyhow::{bail, Result};
use serde_json::{Map, Value};
use tracing::debug;

use crate::datetime::format_value;
use crate::models::{Item, ValueType};
use crate::plan::{CollectionPlan, ColumnSpec};
use crate::source::Record;

/// Per-record working state. Built and dropped inside [`RecordMapper::map`].
#[derive(Debug, Default)]
struct Scratch {
    data: Map<String, Value>,
    excluded: Map<String, Value>,
}

impl Scratch {
    /// Place a mapped value under its output name, honouring `include_in_payload`.
    fn place(&mut self, spec: &ColumnSpec, value: Value) {
        let name = spec.output_name().to_string();
        if spec.include_in_payload {
            self.data.insert(name, value);
        } else {
            self.excluded.insert(name, value);
        }
    }

    fn exclude(&mut self, key: &str) {
        if let Some(value) = self.data.remove(key) {
            self.excluded.insert(key.to_string(), value);
        }
    }

    fn lookup(&self, key: &str) -> Option<&Value> {
        self.data
            .get(key)
            .filter(|v| !v.is_null())
            .or_else(|| self.excluded.get(key).filter(|v| !v.is_null()))
    }
}

pub struct RecordMapper<'a> {
    plan: &'a CollectionPlan,
}

impl<'a> RecordMapper<'a> {
    pub fn new(plan: &'a CollectionPlan) -> Self {
        Self { plan }
    }

    /// Map every record of a chunk, preserving order.
    pub fn map_all(&self, records: &[Record]) -> Result<Vec<Item>> {
        records.iter().map(|r| self.map(r)).collect()
    }

    pub fn map(&self, record: &Record) -> Result<Item> {
        let plan = self.plan;
        let mut scratch = Scratch {
            data: self.initial_fields(record)?,
            excluded: Map::new(),
        };

        let id = scratch
            .data
            .remove(&plan.primary_key)
            .or_else(|| record.get(&plan.primary_key).cloned())
            .filter(|v| !v.is_null());
        let Some(id) = id else {
            bail!(
                "record in collection '{}' has no value for primary key '{}'",
                plan.slug,
                plan.primary_key
            );
        };
        scratch.excluded.insert(plan.primary_key.clone(), id.clone());
        for field in &plan.support {
            scratch.exclude(field);
        }

        for spec in plan.columns.values() {
            let Some(value) = scratch.data.remove(&spec.source_key) else {
                continue;
            };
            if spec.output_name() != spec.source_key {
                scratch.excluded.insert(spec.source_key.clone(), value.clone());
            }
            if value.is_null() {
                continue;
            }
            scratch.place(spec, format_column(spec, value));
        }

        for relation in plan.relations.values() {
            let related = record.relation(&relation.name);
            if related.is_none() {
                debug!(
                    collection = %plan.slug,
                    relation = %relation.name,
                    "relation not loaded; skipping its columns"
                );
            }

            if let Some(related) = related {
                for spec in relation.columns.values() {
                    let Some(value) = related.get(&spec.source_key).filter(|v| !v.is_null()) else {
                        continue;
                    };
                    scratch.place(spec, format_column(spec, value.clone()));
                }
            }

            scratch.exclude(&relation.foreign_key);
        }

        scratch.data.retain(|_, v| !v.is_null());

        let mut metadata = Map::new();
        for name in plan.metadata.keys() {
            if let Some(value) = scratch.lookup(name) {
                metadata.insert(name.clone(), value.clone());
            }
        }

        let tenant = plan
            .tenant
            .as_deref()
            .and_then(|field| scratch.lookup(field))
            .cloned();

        Ok(Item {
            id,
            data: scratch.data,
            metadata,
            tenant,
            url: None,
        })
    }

    /// The flat field map before column rules: resource output or the record's own fields.
    fn initial_fields(&self, record: &Record) -> Result<Map<String, Value>> {
        let Some(resource) = &self.plan.resource else {
            return Ok(record.fields.clone());
        };

        match resource.format(record)? {
            Value::Object(mut map) => match map.remove("data") {
                Some(Value::Object(inner)) if !inner.is_empty() => Ok(inner),
                Some(other) => {
                    map.insert("data".to_string(), other);
                    Ok(map)
                }
                None => Ok(map),
            },
            other => bail!(
                "resource '{}' returned {} instead of an object",
                resource.name(),
                json_kind(&other)
            ),
        }
    }
}

fn format_column(spec: &ColumnSpec, value: Value) -> Value {
    let Some(format) = spec.format.as_deref() else {
        return value;
    };
    if spec.value_type != ValueType::Datetime {
        return value;
    }

    match format_value(&value, format) {
        Some(formatted) => Value::String(formatted),
        None => {
            debug!(column = %spec.source_key, value = %value, "unparseable datetime kept as-is");
            value
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;
    use crate::resource::{Resource, ResourceRegistry};
    use serde_json::json;
    use std::sync::Arc;

    fn plan_with(tenancy: &str, collection: &str, registry: &ResourceRegistry) -> CollectionPlan {
        let content = format!(
            r#"
tenancy = "{}"

[source]
path = "app.sqlite"

[cache]
path = "cache.sqlite"

[sources.invoices]
fillable = ["status", "amount"]

[sources.invoices.relations.customer]
source = "customers"

[sources.customers]
fillable = ["name"]

{}
"#,
            tenancy, collection
        );
        let config = parse_config(&content).unwrap();
        CollectionPlan::for_collection(&config, "invoices", registry).unwrap()
    }

    fn plan(tenancy: &str, collection: &str) -> CollectionPlan {
        plan_with(tenancy, collection, &ResourceRegistry::new())
    }

    fn record(value: Value) -> Record {
        Record::new(value.as_object().unwrap().clone())
    }

    #[test]
    fn status_metadata_and_formatted_alias() {
        let plan = plan(
            "single",
            r#"
[collections.invoices]
source = "invoices"
[collections.invoices.columns]
status = { metadata = true, type = "enum", options = ["draft", "sent", "paid"] }
due_at = { alias = "due_date", type = "datetime", format = "Y-m-d" }
"#,
        );
        let item = RecordMapper::new(&plan)
            .map(&record(json!({ "id": 1, "status": "sent", "due_at": "2025-06-30T00:00:00Z" })))
            .unwrap();

        assert_eq!(item.id, json!(1));
        assert_eq!(Value::Object(item.data), json!({ "due_date": "2025-06-30" }));
        assert_eq!(Value::Object(item.metadata), json!({ "status": "sent" }));
        assert_eq!(item.tenant, None);
    }

    const WITH_CUSTOMER: &str = r#"
[collections.invoices]
source = "invoices"
[collections.invoices.columns]
amount = {}
customer = { relationship = true, columns = { name = { alias = "customer_name" } } }
"#;

    #[test]
    fn relation_columns_join_and_foreign_key_is_stripped() {
        let plan = plan("single", WITH_CUSTOMER);
        let row = record(json!({ "id": 7, "amount": 12.5, "customer_id": 10 }))
            .with_relation("customer", json!({ "id": 10, "name": "Acme" }).as_object().cloned());

        let item = RecordMapper::new(&plan).map(&row).unwrap();
        assert_eq!(
            Value::Object(item.data),
            json!({ "amount": 12.5, "customer_name": "Acme" })
        );
    }

    #[test]
    fn missing_relation_yields_no_fields() {
        let plan = plan("single", WITH_CUSTOMER);
        let row = record(json!({ "id": 7, "amount": 1, "customer_id": 99 })).with_relation("customer", None);

        let item = RecordMapper::new(&plan).map(&row).unwrap();
        assert_eq!(Value::Object(item.data), json!({ "amount": 1 }));
    }

    #[test]
    fn alias_removes_source_key() {
        let plan = plan(
            "single",
            "[collections.invoices]\nsource = \"invoices\"\ncolumns = { status = { alias = \"state\" } }\n",
        );
        let item = RecordMapper::new(&plan)
            .map(&record(json!({ "id": 1, "status": "paid" })))
            .unwrap();

        assert_eq!(item.data.get("state"), Some(&json!("paid")));
        assert!(!item.data.contains_key("status"));
    }

    #[test]
    fn nulls_are_never_emitted() {
        let plan = plan(
            "single",
            r#"
[collections.invoices]
source = "invoices"
[collections.invoices.columns]
status = { metadata = true, data = true }
amount = {}
note = {}
"#,
        );
        let item = RecordMapper::new(&plan)
            .map(&record(json!({ "id": 1, "status": null, "amount": null, "note": "x", "extra": null })))
            .unwrap();

        assert_eq!(Value::Object(item.data), json!({ "note": "x" }));
        assert!(item.metadata.is_empty());
    }

    #[test]
    fn field_marked_metadata_and_tenant_resolves_for_both() {
        let plan = plan(
            "multi",
            r#"
[collections.invoices]
source = "invoices"
[collections.invoices.columns]
amount = {}
team_id = { metadata = true, tenant = true, type = "integer" }
"#,
        );
        let item = RecordMapper::new(&plan)
            .map(&record(json!({ "id": 3, "amount": 5, "team_id": 42 })))
            .unwrap();

        assert_eq!(Value::Object(item.data), json!({ "amount": 5 }));
        assert_eq!(item.metadata.get("team_id"), Some(&json!(42)));
        assert_eq!(item.tenant, Some(json!(42)));
    }

    #[test]
    fn tenant_falls_back_to_excluded_key() {
        let plan = plan(
            "multi",
            r#"
[collections.invoices]
source = "invoices"
tenant = "team_id"
[collections.invoices.columns]
team_id = { alias = "team" }
"#,
        );
        let item = RecordMapper::new(&plan)
            .map(&record(json!({ "id": 3, "team_id": 8 })))
            .unwrap();

        assert_eq!(item.data.get("team"), Some(&json!(8)));
        assert_eq!(item.tenant, Some(json!(8)));
    }

    #[test]
    fn mapping_is_deterministic() {
        let plan = plan("single", WITH_CUSTOMER);
        let row = record(json!({ "id": 7, "amount": 3, "customer_id": 10 }))
            .with_relation("customer", json!({ "name": "Acme" }).as_object().cloned());
        let mapper = RecordMapper::new(&plan);

        let first = serde_json::to_vec(&mapper.map(&row).unwrap()).unwrap();
        let second = serde_json::to_vec(&mapper.map(&row).unwrap()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn missing_primary_key_is_an_error() {
        let plan = plan("single", WITH_CUSTOMER);
        assert!(RecordMapper::new(&plan).map(&record(json!({ "amount": 1 }))).is_err());
    }

    struct Envelope;

    impl Resource for Envelope {
        fn name(&self) -> &str {
            "invoice"
        }
        fn format(&self, record: &Record) -> Result<Value> {
            Ok(json!({
                "data": {
                    "id": record.get("id").cloned().unwrap_or(Value::Null),
                    "label": format!("Invoice {}", record.get("id").cloned().unwrap_or(Value::Null)),
                    "empty": null,
                }
            }))
        }
    }

    #[test]
    fn resource_output_is_unwrapped() {
        let mut registry = ResourceRegistry::new();
        registry.register(Arc::new(Envelope));
        let plan = plan_with(
            "single",
            "[collections.invoices]\nsource = \"invoices\"\nresource = \"invoice\"\n",
            &registry,
        );
        assert!(plan.select.is_empty());

        let item = RecordMapper::new(&plan)
            .map(&record(json!({ "id": 4, "status": "paid" })))
            .unwrap();
        assert_eq!(item.id, json!(4));
        assert_eq!(Value::Object(item.data), json!({ "label": "Invoice 4" }));
    }

    #[test]
    fn map_all_preserves_order() {
        let plan = plan("single", "[collections]\ninvoices = \"invoices\"\n");
        let rows: Vec<Record> = (1..=3)
            .map(|i| record(json!({ "id": i, "status": "draft", "amount": i * 10 })))
            .collect();

        let items = RecordMapper::new(&plan).map_all(&rows).unwrap();
        let ids: Vec<Value> = items.into_iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![json!(1), json!(2), json!(3)]);
    }
}
