//! One collection sync: fetch → map → batch → send.
//!
//! Records are paged by primary key in chunks of [`CHUNK_SIZE`]. Each chunk
//! has its relations loaded in one query per relation, is mapped into items,
//! and is submitted as a single [`Upsert`]. The first chunk that fails aborts
//! the run; retries inside a chunk belong to the transport, retries of the
//! whole run to the job runner.
//!
//! The `lastUpsert:<slug>` watermark is written only when at least one chunk
//! was submitted, so an empty run leaves the previous watermark in place.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::cache::{last_upsert_key, KvStore, LAST_UPSERT_TTL};
use crate::datetime::format_watermark;
use crate::endpoints::Upserts;
use crate::error::TransportError;
use crate::mapper::RecordMapper;
use crate::models::Upsert;
use crate::plan::{CollectionPlan, RelationSpec};
use crate::progress::{SyncProgressEvent, SyncProgressReporter};
use crate::source::{key_string, DataSource, Record};

/// Records per upsert request.
pub const CHUNK_SIZE: usize = 90;

/// Where mapped chunks are submitted.
#[async_trait]
pub trait UpsertSink: Send + Sync {
    /// `Ok(false)` means the API refused the chunk without a retryable error.
    async fn submit(&self, upsert: &Upsert) -> Result<bool, TransportError>;
}

#[async_trait]
impl UpsertSink for Upserts {
    async fn submit(&self, upsert: &Upsert) -> Result<bool, TransportError> {
        self.create(upsert).await
    }
}

/// Outcome of one collection run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpsertReport {
    pub chunks: u64,
    pub items: u64,
    /// Watermark written by this run, if any.
    pub watermark: Option<String>,
}

pub struct BatchUpserter {
    source: Arc<dyn DataSource>,
    store: Arc<dyn KvStore>,
    /// `None` for a count-only upserter (dry runs).
    sink: Option<Arc<dyn UpsertSink>>,
}

impl BatchUpserter {
    pub fn new(source: Arc<dyn DataSource>, store: Arc<dyn KvStore>, sink: Arc<dyn UpsertSink>) -> Self {
        Self {
            source,
            store,
            sink: Some(sink),
        }
    }

    /// An upserter that can resolve and count but never submits.
    pub fn counting(source: Arc<dyn DataSource>, store: Arc<dyn KvStore>) -> Self {
        Self {
            source,
            store,
            sink: None,
        }
    }

    pub fn can_submit(&self) -> bool {
        self.sink.is_some()
    }

    /// The lower bound for the incremental filter.
    ///
    /// `force` means a full resync; otherwise an explicit `since` wins over
    /// the stored watermark.
    pub async fn resolve_since(&self, slug: &str, force: bool, since: Option<&str>) -> Result<Option<String>> {
        if force {
            return Ok(None);
        }
        if let Some(since) = since {
            return Ok(Some(since.to_string()));
        }
        self.store.get(&last_upsert_key(slug)).await
    }

    /// Count matching records and the chunks they will need.
    pub async fn count(&self, plan: &CollectionPlan, since: Option<&str>) -> Result<(u64, u64)> {
        let records = self.source.count(&plan.query(since)).await?;
        Ok((records, records.div_ceil(CHUNK_SIZE as u64)))
    }

    #[tracing::instrument(skip_all, fields(collection = %plan.slug))]
    pub async fn run(
        &self,
        plan: &CollectionPlan,
        since: Option<&str>,
        progress: &dyn SyncProgressReporter,
    ) -> Result<UpsertReport> {
        let Some(sink) = &self.sink else {
            bail!("collection '{}' cannot be upserted by a count-only upserter", plan.slug);
        };
        let started: DateTime<Utc> = Utc::now();
        let query = plan.query(since);
        let mapper = RecordMapper::new(plan);
        let collection = plan.collection();

        let (records, chunks_expected) = self.count(plan, since).await?;
        progress.report(SyncProgressEvent::Counted {
            collection: plan.slug.clone(),
            records,
            chunks: chunks_expected,
        });

        let mut report = UpsertReport::default();
        let mut after: Option<Value> = None;

        loop {
            let rows = self
                .source
                .fetch_page(&query, after.as_ref(), CHUNK_SIZE)
                .await
                .with_context(|| format!("Failed to fetch records for collection '{}'", plan.slug))?;
            if rows.is_empty() {
                break;
            }

            let full_page = rows.len() == CHUNK_SIZE;
            after = rows.last().and_then(|row| row.get(&plan.primary_key)).cloned();
            if after.as_ref().map_or(true, Value::is_null) {
                bail!(
                    "records of collection '{}' carry no primary key '{}'",
                    plan.slug,
                    plan.primary_key
                );
            }

            let records_chunk = self.load_relations(plan, rows).await;
            let items = mapper.map_all(&records_chunk)?;
            let count = items.len() as u64;
            let upsert = Upsert::new(collection.clone(), items);
            let chunk = report.chunks + 1;

            let accepted = match sink.submit(&upsert).await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!(chunk, error = %e, "chunk submission failed");
                    return Err(e).with_context(|| {
                        format!("Failed to upsert chunk {} of collection '{}'", chunk, plan.slug)
                    });
                }
            };
            if !accepted {
                error!(chunk, "chunk rejected by the API");
                bail!("API rejected chunk {} of collection '{}'", chunk, plan.slug);
            }

            report.chunks = chunk;
            report.items += count;
            progress.report(SyncProgressEvent::Upserted {
                collection: plan.slug.clone(),
                chunk,
                chunks: chunks_expected.max(chunk),
                items: report.items,
                records: records.max(report.items),
            });

            if !full_page {
                break;
            }
        }

        if report.chunks > 0 {
            let watermark = format_watermark(started);
            self.store
                .put(&last_upsert_key(&plan.slug), &watermark, Some(LAST_UPSERT_TTL))
                .await?;
            report.watermark = Some(watermark);
        }

        info!(chunks = report.chunks, items = report.items, "collection processed");
        Ok(report)
    }

    /// Attach each relation's row to every record of the chunk.
    ///
    /// A failed lookup leaves the relation empty for the whole chunk.
    async fn load_relations(&self, plan: &CollectionPlan, rows: Vec<Map<String, Value>>) -> Vec<Record> {
        let mut records: Vec<Record> = rows.into_iter().map(Record::new).collect();

        for relation in plan.relations.values() {
            let related = self.fetch_relation(relation, &records).await;
            for record in &mut records {
                let row = record
                    .get(&relation.foreign_key)
                    .filter(|v| !v.is_null())
                    .and_then(|key| related.get(&key_string(key)))
                    .cloned();
                record.relations.insert(relation.name.clone(), row);
            }
        }

        records
    }

    async fn fetch_relation(&self, relation: &RelationSpec, records: &[Record]) -> HashMap<String, Map<String, Value>> {
        let mut keys: Vec<Value> = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for key in records
            .iter()
            .filter_map(|r| r.get(&relation.foreign_key))
            .filter(|v| !v.is_null())
        {
            if seen.insert(key_string(key)) {
                keys.push(key.clone());
            }
        }

        let rows = match self
            .source
            .fetch_related(&relation.table, &relation.owner_key, &keys)
            .await
        {
            Ok(rows) => rows,
            Err(e) => {
                warn!(relation = %relation.name, error = %e, "failed to load relation; treating as empty");
                return HashMap::new();
            }
        };

        rows.into_iter()
            .filter_map(|row| {
                let key = row.get(&relation.owner_key).map(key_string)?;
                Some((key, row))
            })
            .collect()
    }
}
