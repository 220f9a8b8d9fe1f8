//! Collection plans: the resolved, validated shape of one collection sync.
//!
//! A plan is built once per collection run from the configuration and then
//! shared read-only by every chunk. Resolution follows a fixed order:
//!
//! 1. base source binding (`collections.x = "source"` or a `query`/`source` block)
//! 2. primary key
//! 3. selected columns (skipped when a resource shapes the fields)
//! 4. relations and their join keys
//! 5. metadata schema (explicit block wins, else inferred from column markers)
//! 6. tenant column (multi-tenant mode only)
//!
//! Every failure is a [`ConfigError`] raised before any row is read.

use indexmap::IndexMap;
use std::collections::HashSet;
use std::sync::Arc;

use crate::config::{
    CollectionConfig, CollectionEntry, ColumnConfig, Config, SourceDefinition, Tenancy,
};
use crate::error::ConfigError;
use crate::models::{Collection, MetaSpec, ValueType};
use crate::resource::{Resource, ResourceRegistry};
use crate::source::{validate_identifier, SourceQuery};

/// How one source column becomes (or does not become) a payload field.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnSpec {
    pub source_key: String,
    pub alias: Option<String>,
    pub include_in_payload: bool,
    pub value_type: ValueType,
    pub format: Option<String>,
    pub enum_options: Option<Vec<String>>,
    pub metadata: bool,
    pub tenant: bool,
}

impl ColumnSpec {
    pub fn new(source_key: impl Into<String>) -> Self {
        Self {
            source_key: source_key.into(),
            alias: None,
            include_in_payload: true,
            value_type: ValueType::String,
            format: None,
            enum_options: None,
            metadata: false,
            tenant: false,
        }
    }

    /// The key this column is emitted under.
    pub fn output_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.source_key)
    }

    fn meta_spec(&self) -> MetaSpec {
        let spec = MetaSpec::new(self.value_type);
        match (&self.value_type, &self.enum_options) {
            (ValueType::Enum, Some(options)) => spec.with_options(options.clone()),
            _ => spec,
        }
    }
}

/// A joined relation whose columns land in the parent's flat `data` map.
#[derive(Debug, Clone, PartialEq)]
pub struct RelationSpec {
    pub name: String,
    /// Join key on the parent row; stripped from the payload.
    pub foreign_key: String,
    pub table: String,
    /// Key on the related table matched against `foreign_key`.
    pub owner_key: String,
    pub columns: IndexMap<String, ColumnSpec>,
}

/// Inputs that plan resolution reads besides the collection entry itself.
pub struct PlanContext<'a> {
    pub sources: &'a IndexMap<String, SourceDefinition>,
    pub resources: &'a ResourceRegistry,
    pub tenancy: Tenancy,
}

impl<'a> PlanContext<'a> {
    pub fn new(config: &'a Config, resources: &'a ResourceRegistry) -> Self {
        Self {
            sources: &config.sources,
            resources,
            tenancy: config.tenancy,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CollectionPlan {
    pub slug: String,
    pub source_name: String,
    pub table: String,
    pub primary_key: String,
    /// Columns to select; empty selects all (resource mode).
    pub select: Vec<String>,
    /// Fields selected only to feed metadata or the tenant; kept out of `data`.
    pub support: Vec<String>,
    pub columns: IndexMap<String, ColumnSpec>,
    pub relations: IndexMap<String, RelationSpec>,
    pub metadata: IndexMap<String, MetaSpec>,
    pub tenant: Option<String>,
    pub incremental_column: Option<String>,
    pub resource: Option<Arc<dyn Resource>>,
    pub scope: Option<String>,
    pub filter: Option<String>,
}

impl CollectionPlan {
    /// Resolve the plan for a configured collection slug.
    pub fn for_collection(
        config: &Config,
        slug: &str,
        resources: &ResourceRegistry,
    ) -> Result<Self, ConfigError> {
        let entry = config
            .collections
            .get(slug)
            .ok_or_else(|| ConfigError::UnknownCollection(slug.to_string()))?;
        Self::resolve(slug, entry, &PlanContext::new(config, resources))
    }

    pub fn resolve(
        slug: &str,
        entry: &CollectionEntry,
        ctx: &PlanContext<'_>,
    ) -> Result<Self, ConfigError> {
        let empty = CollectionConfig::default();
        let (source_name, block, filter) = match entry {
            CollectionEntry::Source(name) => (name.clone(), &empty, None),
            CollectionEntry::Block(block) => {
                let (name, filter) = resolve_query(slug, block)?;
                (name, &**block, filter)
            }
        };

        let definition = ctx
            .sources
            .get(&source_name)
            .ok_or_else(|| ConfigError::UnknownSource {
                collection: slug.to_string(),
                source_name: source_name.clone(),
            })?;
        let table = definition.table_name(&source_name).to_string();
        check_source(&source_name, &table, definition)?;

        let primary_key = definition.primary_key.clone();

        let resource = resolve_resource(block, ctx.resources)?;

        let mut columns = IndexMap::new();
        let mut relations = IndexMap::new();
        for (key, column) in &block.columns {
            if column.relationship {
                let relation = resolve_relation(slug, key, column, &source_name, definition, ctx)?;
                relations.insert(key.clone(), relation);
            } else {
                columns.insert(key.clone(), resolve_column(slug, key, column)?);
            }
        }

        let metadata = if !block.metadata.is_empty() {
            block.metadata.clone()
        } else {
            infer_metadata(&columns, &relations)
        };

        let tenant = resolve_tenant(slug, block, &columns, ctx.tenancy)?;

        let mut select = if resource.is_some() {
            Vec::new()
        } else {
            let mut select: Vec<String> = if block.columns.is_empty() {
                if definition.fillable.is_empty() {
                    return Err(ConfigError::InvalidSource(
                        source_name,
                        "no columns configured and no fillable columns declared".to_string(),
                    ));
                }
                definition.fillable.clone()
            } else {
                block
                    .columns
                    .keys()
                    .map(|key| match relations.get(key) {
                        Some(relation) => relation.foreign_key.clone(),
                        None => key.clone(),
                    })
                    .collect()
            };
            select.push(primary_key.clone());

            let mut seen = HashSet::new();
            select.retain(|c| seen.insert(c.clone()));
            for column in &select {
                validate_identifier(column)?;
            }
            select
        };

        let mut support = Vec::new();
        if resource.is_none() {
            let produced: HashSet<&str> = columns
                .values()
                .chain(relations.values().flat_map(|r| r.columns.values()))
                .map(ColumnSpec::output_name)
                .collect();
            for field in metadata.keys().chain(tenant.iter()) {
                if select.contains(field) || produced.contains(field.as_str()) {
                    continue;
                }
                validate_identifier(field)?;
                select.push(field.clone());
                support.push(field.clone());
            }
        }

        Ok(Self {
            slug: slug.to_string(),
            source_name,
            table,
            primary_key,
            select,
            support,
            columns,
            relations,
            metadata,
            tenant,
            incremental_column: definition.updated_at_column().map(str::to_string),
            resource,
            scope: definition.scope.clone(),
            filter,
        })
    }

    /// The payload-side collection descriptor.
    pub fn collection(&self) -> Collection {
        Collection::new(self.slug.clone()).with_metadata(self.metadata.clone())
    }

    /// Build the source query, applying scope, filter and the incremental condition.
    ///
    /// `since` is ignored when the source declares no updated-at column.
    pub fn query(&self, since: Option<&str>) -> SourceQuery {
        let mut query =
            SourceQuery::new(self.table.clone(), self.primary_key.clone()).select(self.select.clone());

        if let Some(scope) = &self.scope {
            query = query.where_raw(scope.clone());
        }
        if let Some(filter) = &self.filter {
            query = query.where_raw(filter.clone());
        }
        if let (Some(since), Some(column)) = (since, &self.incremental_column) {
            query = query.where_updated_since(column.clone(), since);
        }

        query
    }
}

fn resolve_query(
    slug: &str,
    block: &CollectionConfig,
) -> Result<(String, Option<String>), ConfigError> {
    let (name, filter) = match (&block.query, &block.source) {
        (Some(query), Some(source)) if &query.source != source => {
            return Err(ConfigError::InvalidQuery(
                slug.to_string(),
                format!(
                    "query source '{}' conflicts with source '{}'",
                    query.source, source
                ),
            ));
        }
        (Some(query), _) => (query.source.clone(), query.filter.clone()),
        (None, Some(source)) => (source.clone(), None),
        (None, None) => {
            return Err(ConfigError::InvalidQuery(
                slug.to_string(),
                "no source binding (set `source` or `query.source`)".to_string(),
            ));
        }
    };

    if let Some(fragment) = &filter {
        check_fragment(fragment).map_err(|reason| ConfigError::InvalidQuery(slug.to_string(), reason))?;
    }

    Ok((name, filter))
}

fn check_fragment(fragment: &str) -> Result<(), String> {
    if fragment.trim().is_empty() {
        return Err("where-fragment is empty".to_string());
    }
    if fragment.contains(';') {
        return Err("where-fragment must be a single expression".to_string());
    }
    Ok(())
}

fn check_source(name: &str, table: &str, definition: &SourceDefinition) -> Result<(), ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidSource(name.to_string(), reason);

    validate_identifier(table).map_err(|_| invalid(format!("invalid table name '{}'", table)))?;
    validate_identifier(&definition.primary_key)
        .map_err(|_| invalid(format!("invalid primary key '{}'", definition.primary_key)))?;
    if let Some(column) = definition.updated_at_column() {
        validate_identifier(column)
            .map_err(|_| invalid(format!("invalid updated_at column '{}'", column)))?;
    }
    if let Some(scope) = &definition.scope {
        check_fragment(scope).map_err(|reason| invalid(format!("scope: {}", reason)))?;
    }
    Ok(())
}

fn resolve_resource(
    block: &CollectionConfig,
    registry: &ResourceRegistry,
) -> Result<Option<Arc<dyn Resource>>, ConfigError> {
    let Some(name) = block.resource.as_deref().filter(|n| !n.is_empty()) else {
        return Ok(None);
    };

    let resource = registry
        .find(name)
        .ok_or_else(|| ConfigError::UnknownResource(name.to_string()))?;
    resource
        .check()
        .map_err(|reason| ConfigError::IncapableResource(name.to_string(), reason))?;

    Ok(Some(resource))
}

fn resolve_column(slug: &str, key: &str, column: &ColumnConfig) -> Result<ColumnSpec, ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidColumn {
        collection: slug.to_string(),
        column: key.to_string(),
        reason: reason.to_string(),
    };

    if !column.columns.is_empty() {
        return Err(invalid("nested columns require `relationship = true`"));
    }
    if column.foreign_key.is_some() {
        return Err(invalid("`foreign_key` requires `relationship = true`"));
    }

    let value_type = column.value_type.unwrap_or_default();

    if value_type == ValueType::Enum && column.options.as_ref().map_or(true, |o| o.is_empty()) {
        return Err(invalid("enum columns require `options`"));
    }
    if column.format.is_some() && value_type != ValueType::Datetime {
        return Err(invalid("`format` requires `type = \"datetime\"`"));
    }
    if matches!(column.alias.as_deref(), Some("")) {
        return Err(invalid("alias must not be empty"));
    }

    Ok(ColumnSpec {
        source_key: key.to_string(),
        alias: column.alias.clone(),
        include_in_payload: column.data.unwrap_or(!column.metadata),
        value_type,
        format: column.format.clone(),
        enum_options: column.options.clone(),
        metadata: column.metadata,
        tenant: column.tenant,
    })
}

fn resolve_relation(
    slug: &str,
    name: &str,
    column: &ColumnConfig,
    source_name: &str,
    definition: &SourceDefinition,
    ctx: &PlanContext<'_>,
) -> Result<RelationSpec, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidRelation {
        collection: slug.to_string(),
        relation: name.to_string(),
        reason,
    };

    let relation = definition.relations.get(name).ok_or_else(|| {
        invalid(format!(
            "source '{}' declares no relation '{}'",
            source_name, name
        ))
    })?;
    let related = ctx
        .sources
        .get(&relation.source)
        .ok_or_else(|| invalid(format!("unknown related source '{}'", relation.source)))?;

    let foreign_key = column
        .foreign_key
        .clone()
        .or_else(|| relation.foreign_key.clone())
        .unwrap_or_else(|| format!("{}_id", name));
    let table = related.table_name(&relation.source).to_string();
    let owner_key = relation
        .owner_key
        .clone()
        .unwrap_or_else(|| related.primary_key.clone());

    for ident in [&foreign_key, &table, &owner_key] {
        validate_identifier(ident)?;
    }

    if column.columns.is_empty() {
        return Err(invalid("relation declares no columns".to_string()));
    }

    let mut columns = IndexMap::new();
    for (key, nested) in &column.columns {
        if nested.relationship {
            return Err(invalid(format!("nested relation '{}' is not supported", key)));
        }
        columns.insert(key.clone(), resolve_column(slug, key, nested)?);
    }

    Ok(RelationSpec {
        name: name.to_string(),
        foreign_key,
        table,
        owner_key,
        columns,
    })
}

fn infer_metadata(
    columns: &IndexMap<String, ColumnSpec>,
    relations: &IndexMap<String, RelationSpec>,
) -> IndexMap<String, MetaSpec> {
    let mut metadata = IndexMap::new();

    for column in columns.values().filter(|c| c.metadata) {
        metadata.insert(column.output_name().to_string(), column.meta_spec());
    }

    for relation in relations.values() {
        for column in relation.columns.values().filter(|c| c.metadata) {
            metadata.insert(column.output_name().to_string(), column.meta_spec());
        }
    }

    metadata
}

fn resolve_tenant(
    slug: &str,
    block: &CollectionConfig,
    columns: &IndexMap<String, ColumnSpec>,
    tenancy: Tenancy,
) -> Result<Option<String>, ConfigError> {
    if tenancy == Tenancy::Single {
        return Ok(None);
    }

    if let Some(tenant) = block.tenant.as_deref().filter(|t| !t.is_empty()) {
        return Ok(Some(tenant.to_string()));
    }

    columns
        .values()
        .find(|c| c.tenant)
        .map(|c| Some(c.output_name().to_string()))
        .ok_or_else(|| ConfigError::MissingTenant(slug.to_string()))
}
