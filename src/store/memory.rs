//! In-memory bucket store
//!
//! Buckets live in a map keyed by (start, canonical tags). The write lock
//! around each upsert is the per-bucket atomicity boundary.

use crate::series::{Bucket, Sample};
use crate::store::error::StoreResult;
use crate::store::pipeline::Pipeline;
use crate::store::{expiry_cutoff, BucketStore, Upsert};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BucketId {
    start: DateTime<Utc>,
    tags: String,
}

impl BucketId {
    fn of(upsert: &Upsert) -> Self {
        Self {
            start: upsert.start,
            tags: upsert.tags.canonical(),
        }
    }
}

/// Bucket store held entirely in memory
#[derive(Debug, Default)]
pub struct MemoryStore {
    buckets: RwLock<HashMap<BucketId, Bucket>>,
    expire_after: RwLock<Option<Duration>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all buckets, ordered by start then tags
    pub async fn documents(&self) -> Vec<Bucket> {
        let buckets = self.buckets.read().await;
        let mut docs: Vec<(&BucketId, &Bucket)> = buckets.iter().collect();
        docs.sort_by(|a, b| (a.0.start, &a.0.tags).cmp(&(b.0.start, &b.0.tags)));
        docs.into_iter().map(|(_, bucket)| bucket.clone()).collect()
    }

    /// Number of stored buckets
    pub async fn len(&self) -> usize {
        self.buckets.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.buckets.read().await.is_empty()
    }

    fn apply(buckets: &mut HashMap<BucketId, Bucket>, upsert: &Upsert) {
        buckets
            .entry(BucketId::of(upsert))
            .or_insert_with(|| Bucket::new(upsert.start, upsert.tags.clone()))
            .apply(upsert);
    }
}

#[async_trait]
impl BucketStore for MemoryStore {
    async fn upsert(&self, upsert: &Upsert) -> StoreResult<()> {
        let mut buckets = self.buckets.write().await;
        Self::apply(&mut buckets, upsert);
        Ok(())
    }

    async fn bulk_upsert(&self, upserts: &[Upsert]) -> StoreResult<()> {
        // One lock per upsert, as a concurrent reader may interleave
        for upsert in upserts {
            let mut buckets = self.buckets.write().await;
            Self::apply(&mut buckets, upsert);
        }
        Ok(())
    }

    async fn aggregate(&self, pipeline: &Pipeline) -> StoreResult<Vec<Sample>> {
        let candidates: Vec<Bucket> = {
            let buckets = self.buckets.read().await;
            match pipeline.bucket_match() {
                Some((first, last, tags)) => buckets
                    .values()
                    .filter(|b| b.start >= first && b.start <= last && b.tags.matches(tags))
                    .cloned()
                    .collect(),
                None => buckets.values().cloned().collect(),
            }
        };

        tracing::debug!("Aggregating {} candidate buckets in memory", candidates.len());
        Ok(pipeline.evaluate(candidates))
    }

    async fn ensure_indexes(&self, expire_after: Option<Duration>) -> StoreResult<()> {
        *self.expire_after.write().await = expire_after;
        Ok(())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> StoreResult<usize> {
        let Some(expire_after) = *self.expire_after.read().await else {
            return Ok(0);
        };
        let cutoff = expiry_cutoff(now, expire_after)?;

        let mut buckets = self.buckets.write().await;
        let before = buckets.len();
        buckets.retain(|_, bucket| bucket.start >= cutoff);
        let removed = before - buckets.len();

        if removed > 0 {
            tracing::info!("Purged {} buckets older than {}", removed, cutoff);
        }
        Ok(removed)
    }
}
