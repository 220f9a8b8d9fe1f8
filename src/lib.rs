//! # Vectorify Sync
//!
//! Incremental sync of relational records into a remote vector index.
//!
//! For every configured collection the pipeline resolves a plan (which
//! columns become payload fields, metadata, relation joins and the tenant
//! discriminator), pages matching rows by primary key in chunks of 90,
//! maps each row to an item and upserts each chunk through a rate-limit
//! aware HTTP transport.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────┐   ┌──────────────┐   ┌────────────┐
//! │ DataSource  │──▶│ BatchUpserter│──▶│  Transport   │──▶│ Vector API │
//! │ SQLite/mem  │   │ plan + mapper│   │ retry + 429  │   │  /upserts  │
//! └─────────────┘   └──────┬───────┘   └──────┬───────┘   └────────────┘
//!                          │                  │
//!                          ▼                  ▼
//!                   ┌──────────────────────────────┐
//!                   │ KvStore: lastUpsert, rateLimit│
//!                   └──────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! vectorify init                        # create the cache table
//! vectorify collections                 # check every collection plan
//! vectorify sync                        # incremental sync of all collections
//! vectorify sync --collection invoices --force
//! vectorify status
//! vectorify query "overdue invoices" --collection invoices
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`plan`] | Collection plan resolution |
//! | [`mapper`] | Record → item mapping |
//! | [`source`] | Data source contract and backends |
//! | [`cache`] | Key/value store with expiry |
//! | [`ratelimit`] | Shared rate-limit state and throttle policy |
//! | [`transport`] | HTTP executor with retry and backoff |
//! | [`upserter`] | Chunked fetch → map → send |
//! | [`jobs`] | Bounded, retrying job runner |
//! | [`sync`] | `vectorify sync` orchestration |

pub mod cache;
pub mod collections;
pub mod config;
pub mod datetime;
pub mod db;
pub mod endpoints;
pub mod error;
pub mod jobs;
pub mod mapper;
pub mod migrate;
pub mod models;
pub mod plan;
pub mod progress;
pub mod ratelimit;
pub mod resource;
pub mod search;
pub mod source;
pub mod status;
pub mod sync;
pub mod transport;
pub mod upserter;
