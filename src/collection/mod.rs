//! Time series collections
//!
//! A [`Collection`] pairs a bucket store with a [`Resolution`]. Writes are
//! split into (bucket start, sample key) and merged into their bucket with a
//! single upsert; reads go through the [`Aggregator`].
//!
//! ```text
//! insert(t, values, tags)
//!   → resolution.split(t) = (start, key)
//!   → store.upsert({start, tags, key, values})
//!
//! aggregate_samples(first, last, metrics, tags)
//!   → Pipeline::samples → store.aggregate → TimeSeries
//! ```
//!
//! No state is held besides the store handle, the resolution and, when
//! opened with an expiry window, the purge task, so a collection can be
//! shared freely between tasks.

pub mod aggregator;

pub use aggregator::Aggregator;

use crate::config::{StoreBackend, StoreConfig};
use crate::series::{Resolution, Tags, TimeSeries};
use crate::store::{BucketStore, MemoryStore, SqliteStore, StoreError, StoreResult, Upsert};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::interval;

/// One write of a batch
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub timestamp: DateTime<Utc>,
    pub values: BTreeMap<String, f64>,
    pub tags: Tags,
}

impl Entry {
    pub fn new<V, K>(timestamp: DateTime<Utc>, values: V, tags: Tags) -> Self
    where
        V: IntoIterator<Item = (K, f64)>,
        K: Into<String>,
    {
        Self {
            timestamp,
            values: collect_values(values),
            tags,
        }
    }
}

fn collect_values<V, K>(values: V) -> BTreeMap<String, f64>
where
    V: IntoIterator<Item = (K, f64)>,
    K: Into<String>,
{
    values.into_iter().map(|(k, v)| (k.into(), v)).collect()
}

/// Background purge owned by a collection, aborted when the last clone drops
struct ExpiryTask(JoinHandle<()>);

impl Drop for ExpiryTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Pre-aggregating time series collection
#[derive(Clone)]
pub struct Collection {
    store: Arc<dyn BucketStore>,
    resolution: Resolution,
    aggregator: Aggregator,
    expiry: Option<Arc<ExpiryTask>>,
}

impl Collection {
    /// Wrap an existing store
    pub fn new(store: Arc<dyn BucketStore>, resolution: Resolution) -> Self {
        let aggregator = Aggregator::new(Arc::clone(&store), resolution);
        Self {
            store,
            resolution,
            aggregator,
            expiry: None,
        }
    }

    /// Open the configured backend and ensure its indexes
    ///
    /// With `expire_after_secs` set, a purge task runs every
    /// `purge_interval_secs` for as long as the collection (or a clone) lives.
    pub async fn open(config: &StoreConfig) -> StoreResult<Self> {
        let store: Arc<dyn BucketStore> = match config.backend {
            StoreBackend::Sqlite => Arc::new(SqliteStore::open(&config.path, config.resolution)?),
            StoreBackend::Memory => Arc::new(MemoryStore::new()),
        };

        let mut collection = Self::new(store, config.resolution);
        collection.ensure_indexes(config.expire_after()).await?;

        if let Some(expire_after) = config.expire_after() {
            let handle = collection.start_expiry_task(config.purge_interval());
            collection.expiry = Some(Arc::new(ExpiryTask(handle)));
            tracing::info!(
                "Purging buckets older than {:?} every {:?}",
                expire_after,
                config.purge_interval()
            );
        }

        tracing::info!(
            "Opened {:?} collection with resolution {}",
            config.backend,
            config.resolution
        );
        Ok(collection)
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub fn store(&self) -> &Arc<dyn BucketStore> {
        &self.store
    }

    pub fn aggregator(&self) -> &Aggregator {
        &self.aggregator
    }

    /// True if this collection owns a running purge task
    pub fn has_expiry_task(&self) -> bool {
        self.expiry.as_ref().is_some_and(|task| !task.0.is_finished())
    }

    /// Merge one set of values recorded at `timestamp` into its bucket
    ///
    /// An empty value set writes nothing.
    pub async fn insert<V, K>(&self, timestamp: DateTime<Utc>, values: V, tags: &Tags) -> StoreResult<()>
    where
        V: IntoIterator<Item = (K, f64)>,
        K: Into<String>,
    {
        let values = collect_values(values);
        if values.is_empty() {
            return Ok(());
        }

        let upsert = Upsert::new(self.resolution, timestamp, values, tags.clone())?;
        tracing::debug!(
            "Insert {} values into bucket {} key {}",
            upsert.values.len(),
            upsert.start,
            upsert.key
        );
        self.store.upsert(&upsert).await
    }

    /// Start a batch of inserts
    pub fn bulk(&self) -> Bulk<'_> {
        Bulk {
            collection: self,
            upserts: Vec::new(),
            first_error: None,
        }
    }

    /// Submit a batch of writes
    ///
    /// Entries for the same bucket and key accumulate. On failure the
    /// entries already merged stay merged and the first error is returned.
    pub async fn bulk_insert<I>(&self, entries: I) -> StoreResult<()>
    where
        I: IntoIterator<Item = Entry>,
    {
        let mut bulk = self.bulk();
        for entry in entries {
            bulk.insert(entry.timestamp, entry.values, &entry.tags);
        }
        bulk.run().await
    }

    /// See [`Aggregator::aggregate_samples`]
    pub async fn aggregate_samples<S: AsRef<str>>(
        &self,
        first: DateTime<Utc>,
        last: DateTime<Utc>,
        metrics: &[S],
        tags: &Tags,
    ) -> StoreResult<TimeSeries> {
        self.aggregator.aggregate_samples(first, last, metrics, tags).await
    }

    /// See [`Aggregator::aggregate_sets`]
    pub async fn aggregate_sets<S: AsRef<str>>(
        &self,
        first: DateTime<Utc>,
        last: DateTime<Utc>,
        metrics: &[S],
        tags: &Tags,
    ) -> StoreResult<TimeSeries> {
        self.aggregator.aggregate_sets(first, last, metrics, tags).await
    }

    /// Create the store indexes, optionally with age based expiry
    ///
    /// Safe to call repeatedly.
    pub async fn ensure_indexes(&self, expire_after: Option<Duration>) -> StoreResult<()> {
        self.store.ensure_indexes(expire_after).await
    }

    /// Remove buckets that have expired as of now
    pub async fn purge_expired(&self) -> StoreResult<usize> {
        self.store.purge_expired(Utc::now()).await
    }

    /// Spawn a task that purges expired buckets every `every`
    ///
    /// Failures are logged and retried on the next tick. Abort the handle to
    /// stop it.
    pub fn start_expiry_task(&self, every: Duration) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);

        tokio::spawn(async move {
            let mut ticker = interval(every.max(Duration::from_millis(1)));

            loop {
                ticker.tick().await;

                if let Err(e) = store.purge_expired(Utc::now()).await {
                    tracing::error!("Background purge failed: {}", e);
                }
            }
        })
    }
}

/// Batch of inserts, submitted with [`Bulk::run`]
pub struct Bulk<'a> {
    collection: &'a Collection,
    upserts: Vec<Upsert>,
    first_error: Option<StoreError>,
}

impl Bulk<'_> {
    /// Queue one write; empty value sets are skipped
    ///
    /// A write with a non-finite value is dropped and its error is returned
    /// by [`run`](Self::run) after the rest of the batch is submitted.
    pub fn insert<V, K>(&mut self, timestamp: DateTime<Utc>, values: V, tags: &Tags) -> &mut Self
    where
        V: IntoIterator<Item = (K, f64)>,
        K: Into<String>,
    {
        let values = collect_values(values);
        if values.is_empty() {
            return self;
        }

        match Upsert::new(self.collection.resolution, timestamp, values, tags.clone()) {
            Ok(upsert) => self.upserts.push(upsert),
            Err(e) => {
                tracing::warn!("Dropping bulk entry at {}: {}", timestamp, e);
                self.first_error.get_or_insert(e.into());
            }
        }
        self
    }

    pub fn len(&self) -> usize {
        self.upserts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty()
    }

    /// Submit every queued write
    pub async fn run(self) -> StoreResult<()> {
        let submitted = if self.upserts.is_empty() {
            Ok(())
        } else {
            tracing::debug!("Submitting bulk of {} upserts", self.upserts.len());
            self.collection.store.bulk_upsert(&self.upserts).await
        };

        match self.first_error {
            Some(e) => Err(e),
            None => submitted,
        }
    }
}
