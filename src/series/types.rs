//! Core data types for pre-aggregated buckets
//!
//! - `Tags`: bucket identity besides the start timestamp
//! - `Bucket`: persisted aggregation unit with bucket and sample level metrics
//! - `Sample`: one point of a query result
//!
//! A bucket serializes to the persisted document layout:
//!
//! ```text
//! {
//!   start, tags,
//!   num:   { metric: count },
//!   total: { metric: sum },
//!   max:   { metric: max },
//!   min:   { metric: min },
//!   samples: { key: { start, metric: { num, total, max, min } } }
//! }
//! ```

use crate::series::metric::Metric;
use crate::series::resolution::SampleKey;
use crate::store::Upsert;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Scalar tag value
///
/// Compared by exact equality only; `1` and `"1"` are different values.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TagValue {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl TagValue {
    fn to_json(&self) -> serde_json::Value {
        match self {
            TagValue::Bool(b) => serde_json::Value::Bool(*b),
            TagValue::Int(i) => serde_json::Value::from(*i),
            TagValue::Str(s) => serde_json::Value::String(s.clone()),
        }
    }

    /// Type-preserving text form, used as the stored value in tag tables
    pub fn encode(&self) -> String {
        self.to_json().to_string()
    }
}

impl From<&str> for TagValue {
    fn from(value: &str) -> Self {
        TagValue::Str(value.to_string())
    }
}

impl From<String> for TagValue {
    fn from(value: String) -> Self {
        TagValue::Str(value)
    }
}

impl From<i64> for TagValue {
    fn from(value: i64) -> Self {
        TagValue::Int(value)
    }
}

impl From<i32> for TagValue {
    fn from(value: i32) -> Self {
        TagValue::Int(i64::from(value))
    }
}

impl From<bool> for TagValue {
    fn from(value: bool) -> Self {
        TagValue::Bool(value)
    }
}

/// Unordered set of tags, part of a bucket's identity
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tags(BTreeMap<String, TagValue>);

impl Tags {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder method: add a tag
    pub fn tag(mut self, key: impl Into<String>, value: impl Into<TagValue>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<TagValue>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&TagValue> {
        self.0.get(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &TagValue)> {
        self.0.iter()
    }

    /// Check that every tag of `filter` is present here with an equal value
    pub fn matches(&self, filter: &Tags) -> bool {
        filter
            .0
            .iter()
            .all(|(key, value)| self.0.get(key) == Some(value))
    }

    /// Canonical JSON text, identical for equal tag sets
    pub fn canonical(&self) -> String {
        let map: serde_json::Map<String, serde_json::Value> = self
            .0
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect();
        serde_json::Value::Object(map).to_string()
    }
}

impl<K: Into<String>, V: Into<TagValue>> FromIterator<(K, V)> for Tags {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Tags(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// Sample stored inside a bucket under its key
#[derive(Debug, Clone, PartialEq)]
pub struct StoredSample {
    /// Exact sample timestamp, set when the key is first written
    pub start: DateTime<Utc>,
    pub metrics: BTreeMap<String, Metric>,
}

/// Persisted aggregation unit, identified by (start, tags)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "BucketDocument", from = "BucketDocument")]
pub struct Bucket {
    pub start: DateTime<Utc>,
    pub tags: Tags,
    /// Bucket level aggregates
    pub metrics: BTreeMap<String, Metric>,
    pub samples: BTreeMap<SampleKey, StoredSample>,
}

impl Bucket {
    pub fn new(start: DateTime<Utc>, tags: Tags) -> Self {
        Self {
            start,
            tags,
            metrics: BTreeMap::new(),
            samples: BTreeMap::new(),
        }
    }

    /// Merge an upsert into both levels
    pub fn apply(&mut self, upsert: &Upsert) {
        if upsert.values.is_empty() {
            return;
        }

        let sample = self
            .samples
            .entry(upsert.key)
            .or_insert_with(|| StoredSample {
                start: upsert.sample_start,
                metrics: BTreeMap::new(),
            });

        for (name, &value) in &upsert.values {
            sample
                .metrics
                .entry(name.clone())
                .or_insert_with(Metric::zero)
                .record(value);
            self.metrics
                .entry(name.clone())
                .or_insert_with(Metric::zero)
                .record(value);
        }
    }

    /// The whole bucket as one sample at its start
    pub fn to_sample(&self) -> Sample {
        Sample {
            start: self.start,
            metrics: self.metrics.clone(),
        }
    }

    /// Every stored sample, in key order
    pub fn unpack(&self) -> impl Iterator<Item = Sample> + '_ {
        self.samples.values().map(|stored| Sample {
            start: stored.start,
            metrics: stored.metrics.clone(),
        })
    }
}

#[derive(Serialize, Deserialize)]
struct SampleDocument {
    start: DateTime<Utc>,
    #[serde(flatten)]
    metrics: BTreeMap<String, Metric>,
}

#[derive(Serialize, Deserialize)]
struct BucketDocument {
    start: DateTime<Utc>,
    #[serde(default)]
    tags: Tags,
    #[serde(default)]
    num: BTreeMap<String, u64>,
    #[serde(default)]
    total: BTreeMap<String, f64>,
    #[serde(default)]
    max: BTreeMap<String, f64>,
    #[serde(default)]
    min: BTreeMap<String, f64>,
    #[serde(default)]
    samples: BTreeMap<SampleKey, SampleDocument>,
}

impl From<Bucket> for BucketDocument {
    fn from(bucket: Bucket) -> Self {
        let mut doc = BucketDocument {
            start: bucket.start,
            tags: bucket.tags,
            num: BTreeMap::new(),
            total: BTreeMap::new(),
            max: BTreeMap::new(),
            min: BTreeMap::new(),
            samples: BTreeMap::new(),
        };

        for (name, metric) in bucket.metrics {
            doc.num.insert(name.clone(), metric.count);
            doc.total.insert(name.clone(), metric.sum);
            doc.max.insert(name.clone(), metric.max);
            doc.min.insert(name, metric.min);
        }

        doc.samples = bucket
            .samples
            .into_iter()
            .map(|(key, stored)| {
                (
                    key,
                    SampleDocument {
                        start: stored.start,
                        metrics: stored.metrics,
                    },
                )
            })
            .collect();

        doc
    }
}

impl From<BucketDocument> for Bucket {
    fn from(doc: BucketDocument) -> Self {
        let metrics = doc
            .num
            .iter()
            .map(|(name, &count)| {
                let metric = Metric {
                    count,
                    sum: doc.total.get(name).copied().unwrap_or_default(),
                    min: doc.min.get(name).copied().unwrap_or_default(),
                    max: doc.max.get(name).copied().unwrap_or_default(),
                };
                (name.clone(), metric)
            })
            .collect();

        let samples = doc
            .samples
            .into_iter()
            .map(|(key, sample)| {
                (
                    key,
                    StoredSample {
                        start: sample.start,
                        metrics: sample.metrics,
                    },
                )
            })
            .collect();

        Bucket {
            start: doc.start,
            tags: doc.tags,
            metrics,
            samples,
        }
    }
}

/// One point of a query result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub start: DateTime<Utc>,
    pub metrics: BTreeMap<String, Metric>,
}

impl Sample {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            start,
            metrics: BTreeMap::new(),
        }
    }

    /// Builder method: set a metric
    pub fn metric(mut self, name: impl Into<String>, metric: Metric) -> Self {
        self.metrics.insert(name.into(), metric);
        self
    }

    /// Sample with a zero metric for every name
    pub fn placeholder<S: AsRef<str>>(start: DateTime<Utc>, names: &[S]) -> Self {
        Self {
            start,
            metrics: names
                .iter()
                .map(|name| (name.as_ref().to_string(), Metric::zero()))
                .collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Metric> {
        self.metrics.get(name)
    }

    /// Merge another sample's metrics into this one, name by name
    pub fn merge_from(&mut self, other: &Sample) {
        for (name, metric) in &other.metrics {
            self.metrics
                .entry(name.clone())
                .or_insert_with(Metric::zero)
                .merge_from(metric);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn at(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    fn upsert(key: u32, sample_start: &str, values: &[(&str, f64)]) -> Upsert {
        Upsert {
            start: at("2017-07-15T15:15:00Z"),
            tags: Tags::new(),
            key: SampleKey(key),
            sample_start: at(sample_start),
            values: values.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
        }
    }

    #[test]
    fn test_tags_matches() {
        let tags = Tags::new().tag("foo", "bar").tag("host", "one").tag("core", 2);

        assert!(tags.matches(&Tags::new()));
        assert!(tags.matches(&Tags::new().tag("foo", "bar")));
        assert!(tags.matches(&Tags::new().tag("foo", "bar").tag("core", 2)));
        assert!(!tags.matches(&Tags::new().tag("foo", "baz")));
        assert!(!tags.matches(&Tags::new().tag("core", "2")));
        assert!(!tags.matches(&Tags::new().tag("missing", true)));
    }

    #[test]
    fn test_tags_canonical() {
        let a = Tags::new().tag("b", 1).tag("a", "x");
        let b: Tags = vec![("a", "x")].into_iter().collect::<Tags>().tag("b", 1);

        assert_eq!(a.canonical(), b.canonical());
        assert_eq!(a.canonical(), r#"{"a":"x","b":1}"#);
        assert_eq!(Tags::new().canonical(), "{}");
        assert_eq!(TagValue::from("x").encode(), "\"x\"");
        assert_eq!(TagValue::from(true).encode(), "true");
    }

    #[test]
    fn test_apply_keeps_levels_consistent() {
        let mut bucket = Bucket::new(at("2017-07-15T15:15:00Z"), Tags::new());

        bucket.apply(&upsert(15, "2017-07-15T15:15:15Z", &[("value", 1.0), ("other", 5.0)]));
        bucket.apply(&upsert(15, "2017-07-15T15:15:15Z", &[("value", 3.0)]));
        bucket.apply(&upsert(20, "2017-07-15T15:15:20Z", &[("value", -2.0)]));

        for (name, metric) in &bucket.metrics {
            let rolled = bucket
                .samples
                .values()
                .filter_map(|s| s.metrics.get(name))
                .fold(Metric::zero(), |acc, m| acc.merge(m));
            assert_eq!(&rolled, metric, "{}", name);
        }

        assert_eq!(bucket.metrics["value"].count, 3);
        assert_eq!(bucket.metrics["value"].min, -2.0);
        assert_eq!(bucket.samples.len(), 2);
    }

    #[test]
    fn test_sample_start_is_set_once() {
        let mut bucket = Bucket::new(at("2017-07-15T15:15:00Z"), Tags::new());
        bucket.apply(&upsert(15, "2017-07-15T15:15:15Z", &[("value", 1.0)]));
        bucket.apply(&upsert(15, "2017-07-15T15:15:59Z", &[("value", 1.0)]));

        assert_eq!(bucket.samples[&SampleKey(15)].start, at("2017-07-15T15:15:15Z"));
    }

    #[test]
    fn test_apply_empty_values() {
        let mut bucket = Bucket::new(at("2017-07-15T15:15:00Z"), Tags::new());
        bucket.apply(&upsert(15, "2017-07-15T15:15:15Z", &[]));

        assert!(bucket.metrics.is_empty());
        assert!(bucket.samples.is_empty());
    }

    #[test]
    fn test_document_layout() {
        let mut bucket = Bucket::new(at("2017-07-15T15:15:00Z"), Tags::new());
        bucket.apply(&upsert(15, "2017-07-15T15:15:15Z", &[("value", 10.0)]));

        let doc = serde_json::to_value(&bucket).unwrap();
        assert_eq!(
            doc,
            json!({
                "start": "2017-07-15T15:15:00Z",
                "tags": {},
                "num": {"value": 1},
                "total": {"value": 10.0},
                "max": {"value": 10.0},
                "min": {"value": 10.0},
                "samples": {
                    "15": {
                        "start": "2017-07-15T15:15:15Z",
                        "value": {"num": 1, "total": 10.0, "max": 10.0, "min": 10.0}
                    }
                }
            })
        );

        let restored: Bucket = serde_json::from_value(doc).unwrap();
        assert_eq!(restored, bucket);
    }

    #[test]
    fn test_sample_merge() {
        let mut a = Sample::new(at("2017-07-15T15:15:16Z")).metric("value", Metric::single(1.0));
        let b = Sample::new(at("2017-07-15T15:15:16Z"))
            .metric("value", Metric::single(21.0))
            .metric("other", Metric::single(4.0));

        a.merge_from(&b);
        assert_eq!(a.get("value").unwrap().count, 2);
        assert_eq!(a.get("value").unwrap().max, 21.0);
        assert_eq!(a.get("other"), Some(&Metric::single(4.0)));
    }

    #[test]
    fn test_placeholder() {
        let p = Sample::placeholder(at("2017-07-15T15:15:16Z"), &["a", "b"]);
        assert_eq!(p.metrics.len(), 2);
        assert_eq!(p.get("a"), Some(&Metric::zero()));
    }
}
