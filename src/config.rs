use anyhow::{Context, Result};
use indexmap::IndexMap;
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::models::{MetaSpec, ValueType};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub tenancy: Tenancy,
    #[serde(default)]
    pub api: ApiConfig,
    pub source: DbConfig,
    pub cache: DbConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub sources: IndexMap<String, SourceDefinition>,
    #[serde(default)]
    pub collections: IndexMap<String, CollectionEntry>,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Tenancy {
    #[default]
    Single,
    Multi,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ApiConfig {
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default = "default_key_env")]
    pub key_env: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            key: None,
            key_env: default_key_env(),
            base_url: default_base_url(),
            timeout_secs: default_timeout_secs(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl ApiConfig {
    /// The API key from config, falling back to the configured environment variable.
    pub fn api_key(&self) -> Option<String> {
        self.key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .or_else(|| std::env::var(&self.key_env).ok())
            .filter(|k| !k.trim().is_empty())
    }
}

fn default_key_env() -> String {
    "VECTORIFY_API_KEY".to_string()
}
fn default_base_url() -> String {
    "https://api.vectorify.ai/v1/".to_string()
}
fn default_timeout_secs() -> u64 {
    300
}
fn default_max_attempts() -> u32 {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueueConfig {
    #[serde(default = "default_queue_name")]
    pub name: String,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_tries")]
    pub tries: u32,
    #[serde(default = "default_backoff_secs")]
    pub backoff_secs: Vec<u64>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: default_queue_name(),
            workers: default_workers(),
            tries: default_tries(),
            backoff_secs: default_backoff_secs(),
        }
    }
}

fn default_queue_name() -> String {
    "default".to_string()
}
fn default_workers() -> usize {
    1
}
fn default_tries() -> u32 {
    3
}
fn default_backoff_secs() -> Vec<u64> {
    vec![30, 60, 120]
}

/// A source binding: one table in the application database.
#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct SourceDefinition {
    /// Table name; defaults to the source key.
    #[serde(default)]
    pub table: Option<String>,
    #[serde(default = "default_primary_key")]
    pub primary_key: String,
    /// Incremental filter column. An empty string disables incremental sync.
    #[serde(default = "default_updated_at")]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub fillable: Vec<String>,
    /// Collection-specific row filter, applied as a where-fragment.
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub relations: IndexMap<String, RelationDefinition>,
}

impl SourceDefinition {
    pub fn table_name<'a>(&'a self, key: &'a str) -> &'a str {
        self.table.as_deref().unwrap_or(key)
    }

    pub fn updated_at_column(&self) -> Option<&str> {
        self.updated_at.as_deref().filter(|c| !c.is_empty())
    }
}

fn default_primary_key() -> String {
    "id".to_string()
}
fn default_updated_at() -> Option<String> {
    Some("updated_at".to_string())
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct RelationDefinition {
    /// The related `[sources.*]` entry.
    pub source: String,
    #[serde(default)]
    pub foreign_key: Option<String>,
    /// Key on the related table; defaults to its primary key.
    #[serde(default)]
    pub owner_key: Option<String>,
}

/// A collection is either a bare source reference or a full configuration block.
#[derive(Debug, Deserialize, Clone)]
#[serde(untagged)]
pub enum CollectionEntry {
    Source(String),
    Block(Box<CollectionConfig>),
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct CollectionConfig {
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub query: Option<QueryConfig>,
    #[serde(default)]
    pub columns: IndexMap<String, ColumnConfig>,
    #[serde(default)]
    pub resource: Option<String>,
    #[serde(default)]
    pub metadata: IndexMap<String, MetaSpec>,
    #[serde(default)]
    pub tenant: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct QueryConfig {
    pub source: String,
    #[serde(default, rename = "where")]
    pub filter: Option<String>,
}

/// Raw column declaration. Relations are columns carrying `relationship = true`.
#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct ColumnConfig {
    #[serde(default)]
    pub alias: Option<String>,
    /// Whether the column is emitted in the item's `data`. Defaults to
    /// `true`, or `false` for columns marked `metadata`.
    #[serde(default)]
    pub data: Option<bool>,
    #[serde(default, rename = "type")]
    pub value_type: Option<ValueType>,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub options: Option<Vec<String>>,
    #[serde(default)]
    pub metadata: bool,
    #[serde(default)]
    pub tenant: bool,
    #[serde(default)]
    pub relationship: bool,
    #[serde(default)]
    pub foreign_key: Option<String>,
    #[serde(default)]
    pub columns: IndexMap<String, ColumnConfig>,
}

impl Default for ColumnConfig {
    fn default() -> Self {
        Self {
            alias: None,
            data: None,
            value_type: None,
            format: None,
            options: None,
            metadata: false,
            tenant: false,
            relationship: false,
            foreign_key: None,
            columns: IndexMap::new(),
        }
    }
}

impl Config {
    /// Display name for a collection: the slug with its first letter upper-cased.
    pub fn collection_name(slug: &str) -> String {
        let mut chars = slug.chars();
        match chars.next() {
            Some(first) => first.to_uppercase().chain(chars).collect(),
            None => String::new(),
        }
    }
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse_config(&content)
}

fn validate(config: &Config) -> Result<()> {
    if config.api.base_url.trim().is_empty() {
        anyhow::bail!("api.base_url must not be empty");
    }

    if config.api.timeout_secs == 0 {
        anyhow::bail!("api.timeout_secs must be > 0");
    }

    if config.api.max_attempts == 0 {
        anyhow::bail!("api.max_attempts must be >= 1");
    }

    if config.queue.workers == 0 {
        anyhow::bail!("queue.workers must be >= 1");
    }

    if config.queue.tries == 0 {
        anyhow::bail!("queue.tries must be >= 1");
    }

    for slug in config.collections.keys() {
        if slug.is_empty()
            || !slug
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            anyhow::bail!(
                "collection slug '{}' must contain only letters, digits, '-' or '_'",
                slug
            );
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = r#"
tenancy = "multi"

[api]
key = "secret"

[source]
path = "app.sqlite"

[cache]
path = "cache.sqlite"
"#;

    #[test]
    fn defaults_applied() {
        let config = parse_config(BASE).unwrap();
        assert_eq!(config.tenancy, Tenancy::Multi);
        assert_eq!(config.api.base_url, "https://api.vectorify.ai/v1/");
        assert_eq!(config.api.timeout_secs, 300);
        assert_eq!(config.api.max_attempts, 3);
        assert_eq!(config.queue.name, "default");
        assert_eq!(config.queue.backoff_secs, vec![30, 60, 120]);
        assert!(config.collections.is_empty());
    }

    #[test]
    fn collection_entries_parse_both_forms() {
        let content = format!(
            r#"{}
[sources.invoices]
fillable = ["status", "amount"]

[sources.invoices.relations.customer]
source = "customers"

[sources.customers]
updated_at = ""

[collections]
customers = "customers"

[collections.invoices]
query = {{ source = "invoices", where = "status != 'void'" }}
tenant = "team_id"

[collections.invoices.columns]
status = {{ metadata = true, type = "enum", options = ["draft", "sent", "paid"] }}
amount = {{}}
due_at = {{ alias = "due_date", type = "datetime", format = "Y-m-d" }}
customer = {{ relationship = true, columns = {{ name = {{ alias = "customer_name" }} }} }}
"#,
            BASE
        );
        let config = parse_config(&content).unwrap();

        assert!(matches!(
            config.collections.get("customers"),
            Some(CollectionEntry::Source(s)) if s == "customers"
        ));

        let Some(CollectionEntry::Block(block)) = config.collections.get("invoices") else {
            panic!("expected a configuration block");
        };
        let query = block.query.as_ref().unwrap();
        assert_eq!(query.source, "invoices");
        assert_eq!(query.filter.as_deref(), Some("status != 'void'"));

        let names: Vec<&str> = block.columns.keys().map(String::as_str).collect();
        assert_eq!(names, vec!["status", "amount", "due_at", "customer"]);
        assert_eq!(block.columns["amount"].data, None);
        assert_eq!(block.columns["due_at"].value_type, Some(ValueType::Datetime));
        assert!(block.columns["customer"].relationship);

        let invoices = &config.sources["invoices"];
        assert_eq!(invoices.table_name("invoices"), "invoices");
        assert_eq!(invoices.updated_at_column(), Some("updated_at"));
        assert_eq!(config.sources["customers"].updated_at_column(), None);
    }

    #[test]
    fn unknown_column_key_rejected() {
        let content = format!(
            "{}\n[collections.invoices.columns]\nstatus = {{ metdata = true }}\n",
            BASE
        );
        assert!(parse_config(&content).is_err());
    }

    #[test]
    fn zero_workers_rejected() {
        let content = format!("{}\n[queue]\nworkers = 0\n", BASE);
        let err = parse_config(&content).unwrap_err();
        assert!(err.to_string().contains("queue.workers"));
    }

    #[test]
    fn bad_slug_rejected() {
        let content = format!("{}\n[collections]\n\"in voices\" = \"invoices\"\n", BASE);
        assert!(parse_config(&content).is_err());
    }

    #[test]
    fn api_key_from_config_wins() {
        let config = parse_config(BASE).unwrap();
        assert_eq!(config.api.api_key().as_deref(), Some("secret"));
    }

    #[test]
    fn collection_display_name() {
        assert_eq!(Config::collection_name("invoices"), "Invoices");
        assert_eq!(Config::collection_name(""), "");
    }
}
