//! Read path
//!
//! Both queries select buckets by the bucket range that covers
//! `[first, last]`. Sample queries additionally clip the unpacked samples to
//! the sample-granularity range, since the outer buckets may hold samples on
//! either side of it.

use crate::series::{Resolution, Tags, TimeSeries};
use crate::store::{BucketStore, Pipeline, StoreResult};
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Range queries against a bucket store
#[derive(Clone)]
pub struct Aggregator {
    store: Arc<dyn BucketStore>,
    resolution: Resolution,
}

impl Aggregator {
    pub fn new(store: Arc<dyn BucketStore>, resolution: Resolution) -> Self {
        Self { store, resolution }
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    /// One sample per stored sample timestamp in `[first, last]`, merged
    /// across every series matching `tags`
    pub async fn aggregate_samples<S: AsRef<str>>(
        &self,
        first: DateTime<Utc>,
        last: DateTime<Utc>,
        metrics: &[S],
        tags: &Tags,
    ) -> StoreResult<TimeSeries> {
        if first > last {
            return Ok(TimeSeries::empty(first, last));
        }

        let pipeline = Pipeline::samples(
            self.bucket_range(first, last),
            (
                self.resolution.sample_timestamp(first),
                self.resolution.sample_timestamp(last),
            ),
            metrics,
            tags,
        );

        let samples = self.store.aggregate(&pipeline).await?;
        tracing::debug!(
            "Sample query {}..{} ({}) returned {} samples",
            first,
            last,
            self.resolution,
            samples.len()
        );

        Ok(TimeSeries::from_samples(first, last, samples))
    }

    /// One sample per bucket start in the bucket range of `[first, last]`,
    /// merged across every series matching `tags`
    pub async fn aggregate_sets<S: AsRef<str>>(
        &self,
        first: DateTime<Utc>,
        last: DateTime<Utc>,
        metrics: &[S],
        tags: &Tags,
    ) -> StoreResult<TimeSeries> {
        if first > last {
            return Ok(TimeSeries::empty(first, last));
        }

        let pipeline = Pipeline::sets(self.bucket_range(first, last), metrics, tags);

        let samples = self.store.aggregate(&pipeline).await?;
        tracing::debug!(
            "Set query {}..{} ({}) returned {} buckets",
            first,
            last,
            self.resolution,
            samples.len()
        );

        Ok(TimeSeries::from_samples(first, last, samples))
    }

    fn bucket_range(&self, first: DateTime<Utc>, last: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        (
            self.resolution.bucket_start(first),
            self.resolution.bucket_start(last),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::Collection;
    use crate::series::{Metric, Sample};
    use crate::store::{MemoryStore, StoreError, Upsert};
    use async_trait::async_trait;
    use std::time::Duration;

    /// Store whose every operation fails
    struct UnreachableStore;

    fn unreachable() -> StoreError {
        StoreError::Sqlite("database is locked".to_string())
    }

    #[async_trait]
    impl BucketStore for UnreachableStore {
        async fn upsert(&self, _upsert: &Upsert) -> StoreResult<()> {
            Err(unreachable())
        }

        async fn bulk_upsert(&self, _upserts: &[Upsert]) -> StoreResult<()> {
            Err(unreachable())
        }

        async fn aggregate(&self, _pipeline: &Pipeline) -> StoreResult<Vec<Sample>> {
            Err(unreachable())
        }

        async fn ensure_indexes(&self, _expire_after: Option<Duration>) -> StoreResult<()> {
            Err(unreachable())
        }

        async fn purge_expired(&self, _now: DateTime<Utc>) -> StoreResult<usize> {
            Err(unreachable())
        }
    }

    fn at(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    async fn seeded(resolution: Resolution) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        for (ts, value) in [
            ("2017-07-15T15:14:59Z", 1.0),
            ("2017-07-15T15:15:00Z", 2.0),
            ("2017-07-15T15:15:30Z", 3.0),
            ("2017-07-15T15:16:00Z", 4.0),
        ] {
            let values = [("value".to_string(), value)].into_iter().collect();
            store
                .upsert(&Upsert::new(resolution, at(ts), values, Tags::new()).unwrap())
                .await
                .unwrap();
        }
        store
    }

    #[tokio::test]
    async fn test_samples_are_clipped_to_range() {
        let resolution = Resolution::ONE_MINUTE_OF_60_SECONDS;
        let aggregator = Aggregator::new(seeded(resolution).await, resolution);

        // Buckets 15:14 and 15:16 are selected but only partly in range
        let ts = aggregator
            .aggregate_samples(at("2017-07-15T15:14:59.500Z"), at("2017-07-15T15:15:59Z"), &["value"], &Tags::new())
            .await
            .unwrap();

        assert_eq!(
            ts.timestamps(),
            vec![
                at("2017-07-15T15:14:59Z"),
                at("2017-07-15T15:15:00Z"),
                at("2017-07-15T15:15:30Z"),
            ]
        );
        assert_eq!(ts.first, at("2017-07-15T15:14:59.500Z"));
    }

    #[tokio::test]
    async fn test_sets_cover_whole_buckets() {
        let resolution = Resolution::ONE_MINUTE_OF_60_SECONDS;
        let aggregator = Aggregator::new(seeded(resolution).await, resolution);

        let ts = aggregator
            .aggregate_sets(at("2017-07-15T15:15:45Z"), at("2017-07-15T15:16:10Z"), &["value"], &Tags::new())
            .await
            .unwrap();

        assert_eq!(ts.len(), 2);
        assert_eq!(
            ts.get(at("2017-07-15T15:15:00Z")).unwrap().get("value"),
            Some(&Metric {
                count: 2,
                sum: 5.0,
                min: 2.0,
                max: 3.0
            })
        );
        assert_eq!(
            ts.get(at("2017-07-15T15:16:00Z")).unwrap().get("value"),
            Some(&Metric::single(4.0))
        );
    }

    #[tokio::test]
    async fn test_inverted_range_is_empty() {
        let resolution = Resolution::ONE_MINUTE_OF_60_SECONDS;
        let aggregator = Aggregator::new(seeded(resolution).await, resolution);

        let ts = aggregator
            .aggregate_samples(at("2017-07-15T15:16:00Z"), at("2017-07-15T15:15:00Z"), &["value"], &Tags::new())
            .await
            .unwrap();
        assert!(ts.is_empty());

        let ts = aggregator
            .aggregate_sets(at("2017-07-15T15:16:00Z"), at("2017-07-15T15:15:00Z"), &["value"], &Tags::new())
            .await
            .unwrap();
        assert!(ts.is_empty());
    }

    #[tokio::test]
    async fn test_store_errors_propagate() {
        let resolution = Resolution::ONE_MINUTE_OF_60_SECONDS;
        let store = Arc::new(UnreachableStore);
        let aggregator = Aggregator::new(store.clone(), resolution);
        let (first, last) = (at("2017-07-15T15:15:00Z"), at("2017-07-15T15:16:00Z"));

        let err = aggregator
            .aggregate_samples(first, last, &["value"], &Tags::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Sqlite(ref msg) if msg == "database is locked"));

        let err = aggregator
            .aggregate_sets(first, last, &["value"], &Tags::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Sqlite(_)));

        let collection = Collection::new(store, resolution);
        let err = collection
            .insert(first, [("value", 1.0)], &Tags::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Sqlite(_)));

        let mut bulk = collection.bulk();
        bulk.insert(first, [("value", 1.0)], &Tags::new());
        assert!(matches!(bulk.run().await, Err(StoreError::Sqlite(_))));
    }
}
