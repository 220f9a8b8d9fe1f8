//! # Vectorify CLI (`vectorify`)
//!
//! Syncs configured collections of application records into the remote
//! vector index and queries it.
//!
//! ## Usage
//!
//! ```bash
//! vectorify --config ./config/vectorify.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `vectorify init` | Create the cache database and its schema |
//! | `vectorify collections` | Resolve every collection plan and report problems |
//! | `vectorify sync` | Upsert changed records of every (or one) collection |
//! | `vectorify status` | Show watermarks and the last known API rate limit |
//! | `vectorify query "<text>"` | Semantic search against the index |
//!
//! ## Logging
//!
//! Diagnostics go to stderr through `tracing`. `RUST_LOG` sets the filter
//! (default `info`); `VECTORIFY_LOG_FORMAT=json` switches to JSON lines.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use vectorify_sync::cache::sqlite::SqliteKvStore;
use vectorify_sync::cache::KvStore;
use vectorify_sync::collections;
use vectorify_sync::config::{self, Config};
use vectorify_sync::endpoints::Queries;
use vectorify_sync::jobs::JobRunner;
use vectorify_sync::migrate;
use vectorify_sync::progress::{ProgressMode, SyncProgressReporter};
use vectorify_sync::ratelimit::RateLimitState;
use vectorify_sync::resource::ResourceRegistry;
use vectorify_sync::search;
use vectorify_sync::status;
use vectorify_sync::sync::{self, SyncContext, SyncOptions};
use vectorify_sync::transport::Transport;

/// Vectorify: incremental sync of relational records into a vector index.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/vectorify.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "vectorify",
    about = "Incremental sync of relational records into a remote vector index",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/vectorify.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the cache database schema. Safe to run repeatedly.
    Init,

    /// List configured collections and whether their plans resolve.
    Collections,

    /// Upsert records changed since the last sync.
    ///
    /// Each collection runs as one job with retries; a failing collection
    /// does not stop the others.
    Sync {
        /// Only sync this collection.
        #[arg(long)]
        collection: Option<String>,

        /// Ignore the stored watermark and resync everything.
        #[arg(long)]
        force: bool,

        /// Only sync records updated at or after this time
        /// (`YYYY-MM-DD HH:MM:SS`, `YYYY-MM-DD` or RFC 3339).
        #[arg(long)]
        since: Option<String>,

        /// Queue label used in job logs.
        #[arg(long)]
        queue: Option<String>,

        /// Count pending records and chunks without sending anything.
        #[arg(long)]
        dry_run: bool,

        /// Progress output on stderr. Defaults to `human` on a TTY, otherwise `off`.
        #[arg(long, value_enum)]
        progress: Option<ProgressMode>,
    },

    /// Show per-collection watermarks and the cached API rate limit.
    Status,

    /// Semantic search against the remote index.
    Query {
        /// Free-text query.
        text: String,

        /// Restrict results to one collection.
        #[arg(long)]
        collection: Option<String>,

        /// Maximum number of results.
        #[arg(long)]
        limit: Option<u32>,

        /// Metadata filter as `key=value`; repeatable.
        #[arg(long = "filter")]
        filters: Vec<String>,
    },
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    let json = std::env::var("VECTORIFY_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    if json {
        builder.json().init();
    } else {
        builder.with_target(false).init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let cfg = config::load_config(&cli.config)?;
    // Resources are registered in code by embedding applications; the CLI has none.
    let resources = ResourceRegistry::new();

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Cache initialized at {}", cfg.cache.path.display());
        }
        Commands::Collections => {
            if collections::list_collections(&cfg, &resources) > 0 {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Sync {
            collection,
            force,
            since,
            queue,
            dry_run,
            progress,
        } => {
            let options = SyncOptions {
                collection,
                force,
                since,
                queue,
                dry_run,
                progress,
            };
            return run_sync(cfg, resources, options).await;
        }
        Commands::Status => {
            let store = SqliteKvStore::open(&cfg.cache.path).await?;
            let store: Arc<dyn KvStore> = Arc::new(store);
            let rate_limit = cfg
                .api
                .api_key()
                .map(|key| RateLimitState::new(store.clone(), &key));

            let now = chrono::Utc::now();
            let report = status::collect_status(&cfg, store.as_ref(), rate_limit.as_ref(), now).await;
            print!("{}", status::render(&report, now));
        }
        Commands::Query {
            text,
            collection,
            limit,
            filters,
        } => {
            let Some(api_key) = cfg.api.api_key() else {
                eprintln!("Error: no API key configured (set api.key or {})", cfg.api.key_env);
                return Ok(ExitCode::FAILURE);
            };
            let request = search::build_query(&cfg, &text, collection.as_deref(), limit, &filters)?;

            let store: Arc<dyn KvStore> = Arc::new(SqliteKvStore::open(&cfg.cache.path).await?);
            let transport = Transport::new(&cfg.api, &api_key, RateLimitState::new(store, &api_key))?;
            search::run_query(&Queries::new(Arc::new(transport)), &request).await?;
        }
    }

    Ok(ExitCode::SUCCESS)
}

async fn run_sync(cfg: Config, resources: ResourceRegistry, options: SyncOptions) -> Result<ExitCode> {
    let config = Arc::new(cfg);
    let resources = Arc::new(resources);

    if let Some(slug) = options.collection.as_deref() {
        if let Err(e) = sync::select_collections(&config, Some(slug)) {
            eprintln!("Error: {}", e);
            return Ok(ExitCode::FAILURE);
        }
    }

    if options.dry_run {
        let ctx = SyncContext::open_dry(config, resources).await?;
        sync::run_dry(&ctx, &options).await?;
        return Ok(ExitCode::SUCCESS);
    }

    let Some(api_key) = config.api.api_key() else {
        eprintln!(
            "Error: no API key configured (set api.key or {})",
            config.api.key_env
        );
        return Ok(ExitCode::FAILURE);
    };

    let mut runner = JobRunner::new(&config.queue);
    if let Some(queue) = options.queue.as_deref() {
        runner = runner.on_queue(queue);
    }
    let progress: Arc<dyn SyncProgressReporter> = Arc::from(
        options
            .progress
            .unwrap_or_else(ProgressMode::default_for_tty)
            .reporter(),
    );

    let ctx = SyncContext::open(config, resources, &api_key).await?;
    let summary = sync::run_sync(&ctx, &runner, &options, progress).await?;

    if summary.failed() > 0 {
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}
