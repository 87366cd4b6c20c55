//! SQLite bucket store
//!
//! Buckets are normalized into two metric tables, one per level:
//!
//! ```text
//! series          (id, tags)                     canonical tag JSON, unique
//! series_tags     (series_id, key, value)        one row per tag, for filters
//! bucket_metrics  (start, series_id, metric, num, total, min_value, max_value)
//! sample_metrics  (start, series_id, sample_key, sample_start, metric, ...)
//! ```
//!
//! Every write is an `INSERT ... ON CONFLICT DO UPDATE` that increments
//! `num`/`total` and widens `min_value`/`max_value` inside SQLite, so no
//! value is ever read back and rewritten by this process.

use crate::series::{Bucket, Metric, Resolution, Sample, StoredSample, Tags};
use crate::store::error::{StoreError, StoreResult};
use crate::store::pipeline::{Pipeline, Stage};
use crate::store::{expiry_cutoff, BucketStore, Upsert};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OpenFlags, OptionalExtension, Transaction, TransactionBehavior};
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS meta (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS series (
        id INTEGER PRIMARY KEY,
        tags TEXT NOT NULL UNIQUE
    );
    CREATE TABLE IF NOT EXISTS series_tags (
        series_id INTEGER NOT NULL,
        key TEXT NOT NULL,
        value TEXT NOT NULL,
        PRIMARY KEY (series_id, key)
    );
    CREATE TABLE IF NOT EXISTS bucket_metrics (
        start INTEGER NOT NULL,
        series_id INTEGER NOT NULL,
        metric TEXT NOT NULL,
        num INTEGER NOT NULL,
        total REAL NOT NULL,
        min_value REAL NOT NULL,
        max_value REAL NOT NULL,
        PRIMARY KEY (start, series_id, metric)
    );
    CREATE TABLE IF NOT EXISTS sample_metrics (
        start INTEGER NOT NULL,
        series_id INTEGER NOT NULL,
        sample_key TEXT NOT NULL,
        sample_start INTEGER NOT NULL,
        metric TEXT NOT NULL,
        num INTEGER NOT NULL,
        total REAL NOT NULL,
        min_value REAL NOT NULL,
        max_value REAL NOT NULL,
        PRIMARY KEY (start, series_id, sample_key, metric)
    );
";

const MERGE_BUCKET: &str = "
    INSERT INTO bucket_metrics (start, series_id, metric, num, total, min_value, max_value)
    VALUES (?1, ?2, ?3, 1, ?4, ?4, ?4)
    ON CONFLICT (start, series_id, metric) DO UPDATE SET
        num = num + excluded.num,
        total = total + excluded.total,
        min_value = MIN(min_value, excluded.min_value),
        max_value = MAX(max_value, excluded.max_value)
";

// sample_start is only written on insert
const MERGE_SAMPLE: &str = "
    INSERT INTO sample_metrics
        (start, series_id, sample_key, sample_start, metric, num, total, min_value, max_value)
    VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6, ?6, ?6)
    ON CONFLICT (start, series_id, sample_key, metric) DO UPDATE SET
        num = num + excluded.num,
        total = total + excluded.total,
        min_value = MIN(min_value, excluded.min_value),
        max_value = MAX(max_value, excluded.max_value)
";

/// One metric row of either level
struct MetricRow {
    start: i64,
    series_id: i64,
    tags: String,
    sample_key: Option<String>,
    sample_start: Option<i64>,
    metric: String,
    aggregate: Metric,
}

/// Which level of a bucket to load
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Level {
    Bucket,
    Sample,
}

/// Bucket store backed by a SQLite database
pub struct SqliteStore {
    /// std::sync::Mutex because rusqlite::Connection is !Sync
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
    resolution: Resolution,
}

impl SqliteStore {
    /// Open or create a database file
    ///
    /// A database remembers the resolution it was created with; opening it
    /// with another one fails.
    pub fn open(path: impl AsRef<Path>, resolution: Resolution) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open_with_flags(
            &path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;

        tracing::info!("Opened bucket store at {:?} ({})", path, resolution);
        Self::init(conn, Some(path), resolution)
    }

    /// Private in-memory database
    pub fn open_in_memory(resolution: Resolution) -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn, None, resolution)
    }

    fn init(conn: Connection, path: Option<PathBuf>, resolution: Resolution) -> StoreResult<Self> {
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA cache_size = 10000;
            PRAGMA temp_store = MEMORY;
            ",
        )?;
        conn.execute_batch(SCHEMA)?;

        let stored: Option<String> = conn
            .query_row("SELECT value FROM meta WHERE key = 'resolution'", [], |row| row.get(0))
            .optional()?;

        match stored {
            Some(identifier) => {
                let existing: Resolution = identifier.parse()?;
                if existing != resolution {
                    return Err(StoreError::Config(format!(
                        "Store was created with resolution {}, not {}",
                        existing, resolution
                    )));
                }
            }
            None => {
                conn.execute(
                    "INSERT INTO meta (key, value) VALUES ('resolution', ?1)",
                    params![resolution.identifier()],
                )?;
            }
        }

        Ok(Self {
            conn: Mutex::new(conn),
            path,
            resolution,
        })
    }

    /// Database file, `None` for in-memory stores
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    /// Snapshot of all buckets with both levels, ordered by start
    pub fn documents(&self) -> StoreResult<Vec<Bucket>> {
        let conn = self.lock()?;
        let mut buckets = BTreeMap::new();
        self.load(&conn, None, &[], Level::Bucket, &mut buckets)?;
        self.load(&conn, None, &[], Level::Sample, &mut buckets)?;
        Ok(buckets.into_values().collect())
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| StoreError::Lock(format!("Failed to acquire connection lock: {}", e)))
    }

    /// Apply one upsert inside a savepoint of `tx`
    ///
    /// On failure the savepoint is rolled back and the transaction stays usable.
    fn apply_in_savepoint(tx: &mut Transaction<'_>, upsert: &Upsert) -> StoreResult<()> {
        let sp = tx.savepoint()?;
        Self::apply(&sp, upsert)?;
        sp.commit()?;
        Ok(())
    }

    fn apply(conn: &Connection, upsert: &Upsert) -> StoreResult<()> {
        if upsert.values.is_empty() {
            return Ok(());
        }

        let series_id = Self::series_id(conn, &upsert.tags)?;
        let start = upsert.start.timestamp_millis();
        let sample_start = upsert.sample_start.timestamp_millis();
        let key = upsert.key.to_string();

        let mut merge_bucket = conn.prepare_cached(MERGE_BUCKET)?;
        let mut merge_sample = conn.prepare_cached(MERGE_SAMPLE)?;

        for (name, value) in &upsert.values {
            merge_bucket.execute(params![start, series_id, name, value])?;
            merge_sample.execute(params![start, series_id, key, sample_start, name, value])?;
        }

        Ok(())
    }

    /// Id of a tag set, registering it on first use
    fn series_id(conn: &Connection, tags: &Tags) -> StoreResult<i64> {
        let canonical = tags.canonical();

        let inserted = conn
            .prepare_cached("INSERT INTO series (tags) VALUES (?1) ON CONFLICT (tags) DO NOTHING")?
            .execute(params![canonical])?;

        let id: i64 = conn
            .prepare_cached("SELECT id FROM series WHERE tags = ?1")?
            .query_row(params![canonical], |row| row.get(0))?;

        if inserted > 0 {
            let mut stmt = conn.prepare_cached(
                "INSERT OR IGNORE INTO series_tags (series_id, key, value) VALUES (?1, ?2, ?3)",
            )?;
            for (key, value) in tags.iter() {
                stmt.execute(params![id, key, value.encode()])?;
            }
        }

        Ok(id)
    }

    /// Load matching rows of one level and fold them into `buckets`
    fn load(
        &self,
        conn: &Connection,
        filter: Option<(DateTime<Utc>, DateTime<Utc>, &Tags)>,
        metrics: &[String],
        level: Level,
        buckets: &mut BTreeMap<(i64, i64), Bucket>,
    ) -> StoreResult<()> {
        let mut sql = match level {
            Level::Bucket => String::from(
                "SELECT m.start, m.series_id, s.tags, NULL, NULL, m.metric,
                        m.num, m.total, m.min_value, m.max_value
                 FROM bucket_metrics m JOIN series s ON s.id = m.series_id
                 WHERE 1 = 1",
            ),
            Level::Sample => String::from(
                "SELECT m.start, m.series_id, s.tags, m.sample_key, m.sample_start, m.metric,
                        m.num, m.total, m.min_value, m.max_value
                 FROM sample_metrics m JOIN series s ON s.id = m.series_id
                 WHERE 1 = 1",
            ),
        };
        let mut args: Vec<Value> = Vec::new();

        if let Some((first, last, tags)) = filter {
            sql.push_str(" AND m.start >= ? AND m.start <= ?");
            args.push(Value::Integer(first.timestamp_millis()));
            args.push(Value::Integer(last.timestamp_millis()));

            for (key, value) in tags.iter() {
                sql.push_str(
                    " AND m.series_id IN (SELECT series_id FROM series_tags WHERE key = ? AND value = ?)",
                );
                args.push(Value::Text(key.clone()));
                args.push(Value::Text(value.encode()));
            }
        }

        if !metrics.is_empty() {
            let marks = vec!["?"; metrics.len()].join(", ");
            sql.push_str(&format!(" AND m.metric IN ({})", marks));
            args.extend(metrics.iter().map(|m| Value::Text(m.clone())));
        }

        sql.push_str(" ORDER BY m.start, m.series_id");

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(args), |row| {
                let num: i64 = row.get(6)?;
                Ok(MetricRow {
                    start: row.get(0)?,
                    series_id: row.get(1)?,
                    tags: row.get(2)?,
                    sample_key: row.get(3)?,
                    sample_start: row.get(4)?,
                    metric: row.get(5)?,
                    aggregate: Metric {
                        count: num.max(0) as u64,
                        sum: row.get(7)?,
                        min: row.get(8)?,
                        max: row.get(9)?,
                    },
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        for row in rows {
            let bucket = match buckets.entry((row.start, row.series_id)) {
                Entry::Occupied(entry) => entry.into_mut(),
                Entry::Vacant(entry) => {
                    let tags: Tags = serde_json::from_str(&row.tags)?;
                    entry.insert(Bucket::new(from_millis(row.start)?, tags))
                }
            };

            match (row.sample_key, row.sample_start) {
                (Some(raw), Some(sample_start)) => {
                    let key = self.resolution.parse_key_in(bucket.start, &raw)?;
                    let sample_start = from_millis(sample_start)?;
                    bucket
                        .samples
                        .entry(key)
                        .or_insert_with(|| StoredSample {
                            start: sample_start,
                            metrics: BTreeMap::new(),
                        })
                        .metrics
                        .insert(row.metric, row.aggregate);
                }
                _ => {
                    bucket.metrics.insert(row.metric, row.aggregate);
                }
            }
        }

        Ok(())
    }

    fn expire_after(conn: &Connection) -> StoreResult<Option<Duration>> {
        let secs: Option<String> = conn
            .query_row("SELECT value FROM meta WHERE key = 'expire_after_secs'", [], |row| row.get(0))
            .optional()?;

        secs.map(|s| {
            s.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|e| StoreError::Serialization(format!("Invalid expiry window {:?}: {}", s, e)))
        })
        .transpose()
    }
}

fn from_millis(millis: i64) -> StoreResult<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| StoreError::Serialization(format!("Timestamp out of range: {}", millis)))
}

#[async_trait]
impl BucketStore for SqliteStore {
    async fn upsert(&self, upsert: &Upsert) -> StoreResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        Self::apply(&tx, upsert)?;
        tx.commit()?;
        Ok(())
    }

    async fn bulk_upsert(&self, upserts: &[Upsert]) -> StoreResult<()> {
        let mut conn = self.lock()?;
        let mut tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut first_error = None;

        for (idx, upsert) in upserts.iter().enumerate() {
            if let Err(e) = Self::apply_in_savepoint(&mut tx, upsert) {
                tracing::warn!("Bulk upsert entry {} at {} failed: {}", idx, upsert.start, e);
                first_error.get_or_insert(e);
            }
        }

        tx.commit()?;

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn aggregate(&self, pipeline: &Pipeline) -> StoreResult<Vec<Sample>> {
        let level = if pipeline.unwinds_samples() {
            Level::Sample
        } else {
            Level::Bucket
        };
        let metrics = pipeline
            .stages()
            .iter()
            .find_map(|stage| match stage {
                Stage::Group { metrics } => Some(metrics.as_slice()),
                _ => None,
            })
            .unwrap_or(&[]);

        let buckets = {
            let conn = self.lock()?;
            let mut buckets = BTreeMap::new();
            self.load(&conn, pipeline.bucket_match(), metrics, level, &mut buckets)?;
            buckets
        };

        tracing::debug!("Aggregating {} candidate buckets from SQLite", buckets.len());
        Ok(pipeline.evaluate(buckets.into_values()))
    }

    async fn ensure_indexes(&self, expire_after: Option<Duration>) -> StoreResult<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            "
            CREATE INDEX IF NOT EXISTS idx_bucket_metrics_start ON bucket_metrics(start);
            CREATE INDEX IF NOT EXISTS idx_sample_metrics_start ON sample_metrics(start);
            CREATE INDEX IF NOT EXISTS idx_series_tags ON series_tags(key, value);
            ",
        )?;

        match expire_after {
            Some(window) => {
                conn.execute(
                    "INSERT INTO meta (key, value) VALUES ('expire_after_secs', ?1)
                     ON CONFLICT (key) DO UPDATE SET value = excluded.value",
                    params![window.as_secs().to_string()],
                )?;
            }
            None => {
                conn.execute("DELETE FROM meta WHERE key = 'expire_after_secs'", [])?;
            }
        }

        tracing::info!("Ensured bucket store indexes (expire after: {:?})", expire_after);
        Ok(())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> StoreResult<usize> {
        let mut conn = self.lock()?;
        let Some(expire_after) = Self::expire_after(&conn)? else {
            return Ok(0);
        };
        let cutoff = expiry_cutoff(now, expire_after)?.timestamp_millis();

        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let removed: i64 = tx.query_row(
            "SELECT COUNT(*) FROM (
                SELECT start, series_id FROM bucket_metrics WHERE start < ?1
                UNION
                SELECT start, series_id FROM sample_metrics WHERE start < ?1
             )",
            params![cutoff],
            |row| row.get(0),
        )?;
        tx.execute("DELETE FROM bucket_metrics WHERE start < ?1", params![cutoff])?;
        tx.execute("DELETE FROM sample_metrics WHERE start < ?1", params![cutoff])?;
        tx.commit()?;

        if removed > 0 {
            tracing::info!("Purged {} expired buckets", removed);
        }
        Ok(removed as usize)
    }
}
