//! # tsbucket
//!
//! Pre-aggregating time series storage. Every write is merged into running
//! statistics (count, sum, min, max) of a fixed time bucket instead of being
//! appended as a raw point, so range queries read at most one row per bucket
//! and sample.
//!
//! ## Features
//!
//! - **Two-level rollups**: per-bucket and per-sample aggregates updated by
//!   the same atomic upsert
//! - **Resolutions**: six bucketing policies, from seconds-in-a-minute to
//!   days-in-a-month
//! - **Tag filters**: series are identified by tag sets and merged at query time
//! - **Gap-fill**: placeholder samples for timestamps without data
//! - **Backends**: SQLite (`INSERT ... ON CONFLICT`) or in-memory
//!
//! ## Modules
//!
//! - [`series`]: resolutions, metric aggregates, buckets and time series
//! - [`store`]: the bucket store trait, pipelines and backends
//! - [`collection`]: write path and read path
//! - [`config`]: TOML configuration with environment overrides
//! - [`logging`]: tracing subscriber setup
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tsbucket::{Collection, Config, Tags};
//! use chrono::Utc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::load_default();
//!     tsbucket::logging::init(&config.logging);
//!
//!     let coll = Collection::open(&config.store).await?;
//!     let tags = Tags::new().tag("server", "localhost");
//!
//!     let from = Utc::now();
//!     coll.insert(from, [("value", 42.0)], &tags).await?;
//!
//!     let ts = coll.aggregate_samples(from, Utc::now(), &["value"], &tags).await?;
//!     println!("avg: {}", ts.avg("value")?);
//!
//!     Ok(())
//! }
//! ```

pub mod collection;
pub mod config;
pub mod logging;
pub mod series;
pub mod store;

// Re-export top-level types for convenience
pub use collection::{Aggregator, Bulk, Collection, Entry};

pub use config::{Config, ConfigError, LoggingConfig, StoreBackend, StoreConfig};

pub use series::{
    Bucket, Metric, Resolution, Sample, SampleKey, SeriesError, SeriesResult, TagValue, Tags,
    TimeSeries, ValidationError,
};

pub use store::{
    BucketStore, MemoryStore, Pipeline, SqliteStore, Stage, StoreError, StoreResult, Upsert,
};
