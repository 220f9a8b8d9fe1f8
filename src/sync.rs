//! `vectorify sync`: pick collections, resolve their `since`, dispatch jobs.
//!
//! Every selected collection becomes one job on the [`JobRunner`]. A job
//! resolves the collection plan and runs the [`BatchUpserter`]; the `since`
//! bound is resolved once, before dispatch, so retries of a job re-run the
//! same window.
//!
//! Output on stdout:
//!
//! ```text
//! sync invoices (since: 2025-06-01 00:00:00)
//! sync customers (full)
//! invoices: 3 chunks, 200 items
//! customers: 0 chunks, 0 items
//! ok
//! ```

use anyhow::{bail, Result};
use std::sync::Arc;
use tracing::warn;

use crate::cache::sqlite::SqliteKvStore;
use crate::cache::KvStore;
use crate::config::Config;
use crate::datetime::{format_watermark, parse_datetime_str};
use crate::endpoints::Upserts;
use crate::error::ConfigError;
use crate::jobs::{Job, JobRunner};
use crate::plan::CollectionPlan;
use crate::progress::{ProgressMode, SyncProgressReporter};
use crate::ratelimit::RateLimitState;
use crate::resource::ResourceRegistry;
use crate::source::sqlite::SqliteSource;
use crate::source::DataSource;
use crate::transport::Transport;
use crate::upserter::{BatchUpserter, UpsertReport, UpsertSink};

#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    /// Only this collection slug.
    pub collection: Option<String>,
    /// Ignore watermarks and `since`; full resync.
    pub force: bool,
    pub since: Option<String>,
    /// Queue label override.
    pub queue: Option<String>,
    pub dry_run: bool,
    pub progress: Option<ProgressMode>,
}

#[derive(Debug)]
pub struct CollectionRun {
    pub slug: String,
    pub since: Option<String>,
    pub result: Result<UpsertReport>,
}

#[derive(Debug, Default)]
pub struct SyncSummary {
    pub runs: Vec<CollectionRun>,
}

impl SyncSummary {
    pub fn failed(&self) -> usize {
        self.runs.iter().filter(|r| r.result.is_err()).count()
    }
}

/// Slugs to process, in configuration order.
pub fn select_collections(config: &Config, only: Option<&str>) -> Result<Vec<String>, ConfigError> {
    match only {
        Some(slug) if !config.collections.contains_key(slug) => {
            Err(ConfigError::UnknownCollection(slug.to_string()))
        }
        Some(slug) => Ok(vec![slug.to_string()]),
        None => Ok(config.collections.keys().cloned().collect()),
    }
}

/// Normalize a user-supplied `--since` to the watermark format.
pub fn parse_since(since: &str) -> Result<String> {
    match parse_datetime_str(since) {
        Some(dt) => Ok(format_watermark(dt)),
        None => bail!(
            "invalid --since '{}': expected YYYY-MM-DD HH:MM:SS, YYYY-MM-DD or RFC 3339",
            since
        ),
    }
}

/// Wiring shared by every job of one sync invocation.
pub struct SyncContext {
    pub config: Arc<Config>,
    pub resources: Arc<ResourceRegistry>,
    pub upserter: Arc<BatchUpserter>,
}

impl SyncContext {
    pub fn new(
        config: Arc<Config>,
        resources: Arc<ResourceRegistry>,
        source: Arc<dyn DataSource>,
        store: Arc<dyn KvStore>,
        sink: Arc<dyn UpsertSink>,
    ) -> Self {
        Self {
            config,
            resources,
            upserter: Arc::new(BatchUpserter::new(source, store, sink)),
        }
    }

    /// Open the configured source and cache databases and build the HTTP transport.
    pub async fn open(config: Arc<Config>, resources: Arc<ResourceRegistry>, api_key: &str) -> Result<Self> {
        let source: Arc<dyn DataSource> = Arc::new(SqliteSource::open(&config.source.path).await?);
        let store: Arc<dyn KvStore> = Arc::new(SqliteKvStore::open(&config.cache.path).await?);
        let transport = Transport::new(&config.api, api_key, RateLimitState::new(store.clone(), api_key))?;
        let sink: Arc<dyn UpsertSink> = Arc::new(Upserts::new(Arc::new(transport)));

        Ok(Self::new(config, resources, source, store, sink))
    }

    /// Like [`SyncContext::open`], without an API key; the context can only count.
    pub async fn open_dry(config: Arc<Config>, resources: Arc<ResourceRegistry>) -> Result<Self> {
        let source: Arc<dyn DataSource> = Arc::new(SqliteSource::open(&config.source.path).await?);
        let store: Arc<dyn KvStore> = Arc::new(SqliteKvStore::open(&config.cache.path).await?);

        Ok(Self {
            config,
            resources,
            upserter: Arc::new(BatchUpserter::counting(source, store)),
        })
    }
}

/// Run a sync over the selected collections.
pub async fn run_sync(
    ctx: &SyncContext,
    runner: &JobRunner,
    options: &SyncOptions,
    progress: Arc<dyn SyncProgressReporter>,
) -> Result<SyncSummary> {
    if !ctx.upserter.can_submit() {
        bail!("sync context was opened for a dry run; use run_dry");
    }
    let slugs = select_collections(&ctx.config, options.collection.as_deref())?;
    if slugs.is_empty() {
        warn!("no collections configured");
        println!("No collections configured.");
        return Ok(SyncSummary::default());
    }

    let explicit_since = options.since.as_deref().map(parse_since).transpose()?;

    let mut jobs = Vec::with_capacity(slugs.len());
    let mut windows = Vec::with_capacity(slugs.len());

    for slug in &slugs {
        let since = ctx
            .upserter
            .resolve_since(slug, options.force, explicit_since.as_deref())
            .await?;
        match &since {
            Some(since) => println!("sync {} (since: {})", slug, since),
            None => println!("sync {} (full)", slug),
        }

        let config = ctx.config.clone();
        let resources = ctx.resources.clone();
        let upserter = ctx.upserter.clone();
        let progress = progress.clone();
        let job_slug = slug.clone();
        let job_since = since.clone();

        jobs.push(Job::new(slug.clone(), move || {
            let config = config.clone();
            let resources = resources.clone();
            let upserter = upserter.clone();
            let progress = progress.clone();
            let slug = job_slug.clone();
            let since = job_since.clone();
            async move {
                let plan = CollectionPlan::for_collection(&config, &slug, &resources)?;
                upserter.run(&plan, since.as_deref(), progress.as_ref()).await
            }
        }));
        windows.push((slug.clone(), since));
    }

    let outcomes = runner.run_all(jobs).await;

    let mut summary = SyncSummary::default();
    for ((slug, since), outcome) in windows.into_iter().zip(outcomes) {
        match &outcome.result {
            Ok(report) => println!("{}: {} chunks, {} items", slug, report.chunks, report.items),
            Err(e) => println!("{}: failed after {} attempts: {:#}", slug, outcome.attempts, e),
        }
        summary.runs.push(CollectionRun {
            slug,
            since,
            result: outcome.result,
        });
    }

    if summary.failed() == 0 {
        println!("ok");
    }
    Ok(summary)
}

/// Resolve plans and count pending records without touching the network or the watermark.
pub async fn run_dry(ctx: &SyncContext, options: &SyncOptions) -> Result<()> {
    let slugs = select_collections(&ctx.config, options.collection.as_deref())?;
    let explicit_since = options.since.as_deref().map(parse_since).transpose()?;

    for slug in &slugs {
        let plan = CollectionPlan::for_collection(&ctx.config, slug, &ctx.resources)?;
        let since = ctx
            .upserter
            .resolve_since(slug, options.force, explicit_since.as_deref())
            .await?;
        let (records, chunks) = ctx.upserter.count(&plan, since.as_deref()).await?;

        println!("sync {} (dry-run)", slug);
        println!("  since: {}", since.as_deref().unwrap_or("full"));
        println!("  records: {}", records);
        println!("  chunks: {}", chunks);
    }
    println!("ok");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::memory::MemoryKvStore;
    use crate::error::TransportError;
    use crate::models::Upsert;
    use async_trait::async_trait;
    use crate::config::parse_config;
    use crate::progress::NoProgress;
    use crate::source::memory::MemorySource;
    use crate::transport::RecordingSleeper;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Collect(Mutex<Vec<String>>);

    #[async_trait]
    impl UpsertSink for Collect {
        async fn submit(&self, upsert: &Upsert) -> Result<bool, TransportError> {
            self.0.lock().unwrap().push(upsert.collection.slug.clone());
            Ok(true)
        }
    }

    fn config() -> Config {
        parse_config(
            r#"
[source]
path = "app.sqlite"

[cache]
path = "cache.sqlite"

[sources.invoices]
fillable = ["status"]

[sources.customers]
fillable = ["name"]

[collections]
invoices = "invoices"
customers = "customers"
broken = "missing"
"#,
        )
        .unwrap()
    }

    fn context(sink: Arc<Collect>, store: Arc<MemoryKvStore>) -> SyncContext {
        let source = MemorySource::new();
        source.insert("invoices", vec![json!({ "id": 1, "status": "sent" })]);
        source.insert("customers", Vec::<serde_json::Value>::new());
        SyncContext::new(
            Arc::new(config()),
            Arc::new(ResourceRegistry::new()),
            Arc::new(source),
            store,
            sink,
        )
    }

    fn runner() -> JobRunner {
        JobRunner::new(&Default::default()).with_sleeper(Arc::new(RecordingSleeper::new()))
    }

    #[test]
    fn unknown_collection_is_rejected() {
        let config = config();
        assert!(matches!(
            select_collections(&config, Some("nope")),
            Err(ConfigError::UnknownCollection(_))
        ));
        assert_eq!(
            select_collections(&config, None).unwrap(),
            vec!["invoices", "customers", "broken"]
        );
    }

    #[test]
    fn since_is_normalized() {
        assert_eq!(parse_since("2025-06-01").unwrap(), "2025-06-01 00:00:00");
        assert_eq!(parse_since("2025-06-01T10:00:00Z").unwrap(), "2025-06-01 10:00:00");
        assert!(parse_since("yesterday").is_err());
    }

    #[tokio::test]
    async fn one_failing_collection_does_not_stop_the_others() {
        let sink = Arc::new(Collect::default());
        let store = Arc::new(MemoryKvStore::new());
        let ctx = context(sink.clone(), store.clone());

        let summary = run_sync(&ctx, &runner(), &SyncOptions::default(), Arc::new(NoProgress))
            .await
            .unwrap();

        assert_eq!(summary.runs.len(), 3);
        assert_eq!(summary.failed(), 1);
        assert_eq!(summary.runs[2].slug, "broken");
        assert_eq!(*sink.0.lock().unwrap(), vec!["invoices".to_string()]);
        assert!(store.get("lastUpsert:invoices").await.unwrap().is_some());
        assert!(store.get("lastUpsert:customers").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn count_only_context_refuses_to_sync() {
        let source = MemorySource::new();
        source.insert("invoices", vec![json!({ "id": 1, "status": "sent" })]);
        let store = Arc::new(MemoryKvStore::new());
        let ctx = SyncContext {
            config: Arc::new(config()),
            resources: Arc::new(ResourceRegistry::new()),
            upserter: Arc::new(BatchUpserter::counting(Arc::new(source), store.clone())),
        };

        let result = run_sync(&ctx, &runner(), &SyncOptions::default(), Arc::new(NoProgress)).await;
        assert!(result.is_err());
        assert!(store.get("lastUpsert:invoices").await.unwrap().is_none());

        let options = SyncOptions {
            collection: Some("invoices".to_string()),
            dry_run: true,
            ..SyncOptions::default()
        };
        run_dry(&ctx, &options).await.unwrap();
    }

    #[tokio::test]
    async fn stored_watermark_becomes_since_unless_forced() {
        let sink = Arc::new(Collect::default());
        let store = Arc::new(MemoryKvStore::new());
        store
            .put("lastUpsert:invoices", "2030-01-01 00:00:00", None)
            .await
            .unwrap();
        let ctx = context(sink.clone(), store);

        let options = SyncOptions {
            collection: Some("invoices".to_string()),
            ..SyncOptions::default()
        };
        let summary = run_sync(&ctx, &runner(), &options, Arc::new(NoProgress)).await.unwrap();
        assert_eq!(summary.runs[0].since.as_deref(), Some("2030-01-01 00:00:00"));

        let forced = SyncOptions {
            force: true,
            ..options
        };
        let summary = run_sync(&ctx, &runner(), &forced, Arc::new(NoProgress)).await.unwrap();
        assert_eq!(summary.runs[0].since, None);
        assert_eq!(summary.runs[0].result.as_ref().unwrap().items, 1);
    }
}
