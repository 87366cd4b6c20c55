//! Bucket stores
//!
//! A store persists buckets and offers the primitives the write and read
//! paths need:
//!
//! - **upsert**: atomic merge of one write into a bucket (increment count and
//!   sum, widen min/max, set the sample start once), creating it if absent
//! - **bulk_upsert**: unordered batch of upserts
//! - **aggregate**: run a typed [`Pipeline`] over the stored buckets
//! - **ensure_indexes / purge_expired**: indexing and age based expiry
//!
//! Backends:
//!
//! - **memory**: in-process map, one write lock per upsert
//! - **sqlite**: normalized tables merged with `INSERT ... ON CONFLICT`

pub mod error;
pub mod memory;
pub mod pipeline;
pub mod sqlite;

pub use error::{StoreError, StoreResult};
pub use memory::MemoryStore;
pub use pipeline::{Pipeline, Stage};
pub use sqlite::SqliteStore;

use crate::series::{Resolution, Sample, SampleKey, Tags, ValidationError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::time::Duration;

/// One merge-upsert against a bucket
#[derive(Debug, Clone, PartialEq)]
pub struct Upsert {
    /// Bucket start, first half of the bucket identity
    pub start: DateTime<Utc>,
    /// Bucket tags, second half of the bucket identity
    pub tags: Tags,
    /// Sample key inside the bucket
    pub key: SampleKey,
    /// Sample timestamp, stored the first time the key is written
    pub sample_start: DateTime<Utc>,
    /// Values to merge, by metric name
    pub values: BTreeMap<String, f64>,
}

impl Upsert {
    /// Build the upsert for a write at `timestamp`
    ///
    /// Fails if any value is NaN or infinite, as no backend can merge it.
    pub fn new(
        resolution: Resolution,
        timestamp: DateTime<Utc>,
        values: BTreeMap<String, f64>,
        tags: Tags,
    ) -> Result<Self, ValidationError> {
        if let Some((metric, value)) = values.iter().find(|(_, v)| !v.is_finite()) {
            return Err(ValidationError::NonFiniteValue {
                metric: metric.clone(),
                value: value.to_string(),
            });
        }

        let (start, key) = resolution.split(timestamp);
        Ok(Self {
            start,
            tags,
            key,
            sample_start: resolution.join(start, key),
            values,
        })
    }
}

/// Backing store for buckets
///
/// Implementations must apply each upsert atomically with respect to other
/// upserts on the same bucket; no other coordination is expected.
#[async_trait]
pub trait BucketStore: Send + Sync {
    /// Merge one write into its bucket
    async fn upsert(&self, upsert: &Upsert) -> StoreResult<()>;

    /// Merge a batch of writes
    ///
    /// Not transactional: writes that succeed stay applied even if others
    /// fail, and the first failure is returned.
    async fn bulk_upsert(&self, upserts: &[Upsert]) -> StoreResult<()>;

    /// Run an aggregation pipeline
    async fn aggregate(&self, pipeline: &Pipeline) -> StoreResult<Vec<Sample>>;

    /// Create indexes on bucket start and tags
    ///
    /// With `expire_after`, buckets older than that become eligible for
    /// [`purge_expired`](Self::purge_expired).
    async fn ensure_indexes(&self, expire_after: Option<Duration>) -> StoreResult<()>;

    /// Remove expired buckets, returning how many were removed
    async fn purge_expired(&self, now: DateTime<Utc>) -> StoreResult<usize>;
}

/// Oldest bucket start that survives expiry
pub(crate) fn expiry_cutoff(now: DateTime<Utc>, expire_after: Duration) -> StoreResult<DateTime<Utc>> {
    let window = chrono::Duration::from_std(expire_after)
        .map_err(|e| StoreError::Config(format!("Invalid expiry window: {}", e)))?;

    now.checked_sub_signed(window)
        .ok_or_else(|| StoreError::Config("Expiry window exceeds calendar range".to_string()))
}
