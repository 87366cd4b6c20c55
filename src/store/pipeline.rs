//! Aggregation pipelines over buckets
//!
//! Two fixed pipeline shapes exist, one per read path:
//!
//! ```text
//! samples:  MatchBuckets → UnwindSamples → MatchSamples → Group → Sort
//! sets:     MatchBuckets → Group → Sort
//! ```
//!
//! Stores may push `MatchBuckets` down into their own query language; the
//! remaining stages are evaluated in process by [`Pipeline::evaluate`].

use crate::series::{Bucket, Metric, Sample, Tags};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// One step of a pipeline
#[derive(Debug, Clone, PartialEq)]
pub enum Stage {
    /// Keep buckets starting in `[first, last]` whose tags match
    MatchBuckets {
        first: DateTime<Utc>,
        last: DateTime<Utc>,
        tags: Tags,
    },
    /// Replace each bucket by one row per stored sample
    UnwindSamples,
    /// Keep rows whose timestamp is in `[first, last]`
    MatchSamples {
        first: DateTime<Utc>,
        last: DateTime<Utc>,
    },
    /// Merge rows sharing a timestamp, keeping only the listed metrics
    Group { metrics: Vec<String> },
    /// Order rows by ascending timestamp
    Sort,
}

/// Typed aggregation pipeline
#[derive(Debug, Clone, PartialEq)]
pub struct Pipeline {
    stages: Vec<Stage>,
}

impl Pipeline {
    /// Sample level aggregation: unpack buckets, clip to the exact range,
    /// merge samples sharing a timestamp
    pub fn samples<S: AsRef<str>>(
        buckets: (DateTime<Utc>, DateTime<Utc>),
        samples: (DateTime<Utc>, DateTime<Utc>),
        metrics: &[S],
        tags: &Tags,
    ) -> Self {
        Self {
            stages: vec![
                Stage::MatchBuckets {
                    first: buckets.0,
                    last: buckets.1,
                    tags: tags.clone(),
                },
                Stage::UnwindSamples,
                Stage::MatchSamples {
                    first: samples.0,
                    last: samples.1,
                },
                Stage::Group {
                    metrics: names(metrics),
                },
                Stage::Sort,
            ],
        }
    }

    /// Bucket level aggregation: one row per bucket, merged by bucket start
    pub fn sets<S: AsRef<str>>(
        buckets: (DateTime<Utc>, DateTime<Utc>),
        metrics: &[S],
        tags: &Tags,
    ) -> Self {
        Self {
            stages: vec![
                Stage::MatchBuckets {
                    first: buckets.0,
                    last: buckets.1,
                    tags: tags.clone(),
                },
                Stage::Group {
                    metrics: names(metrics),
                },
                Stage::Sort,
            ],
        }
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Bucket range and tag filter of the leading match stage
    pub fn bucket_match(&self) -> Option<(DateTime<Utc>, DateTime<Utc>, &Tags)> {
        self.stages.iter().find_map(|stage| match stage {
            Stage::MatchBuckets { first, last, tags } => Some((*first, *last, tags)),
            _ => None,
        })
    }

    /// True if the pipeline needs the stored samples of each bucket
    pub fn unwinds_samples(&self) -> bool {
        self.stages.contains(&Stage::UnwindSamples)
    }

    /// Run every stage over a set of candidate buckets
    pub fn evaluate<I>(&self, buckets: I) -> Vec<Sample>
    where
        I: IntoIterator<Item = Bucket>,
    {
        let mut buckets: Vec<Bucket> = buckets.into_iter().collect();
        let mut rows: Option<Vec<Sample>> = None;

        for stage in &self.stages {
            match stage {
                Stage::MatchBuckets { first, last, tags } => {
                    buckets.retain(|b| b.start >= *first && b.start <= *last && b.tags.matches(tags));
                }
                Stage::UnwindSamples => {
                    rows = Some(buckets.iter().flat_map(|b| b.unpack()).collect());
                }
                Stage::MatchSamples { first, last } => {
                    materialize(&mut rows, &buckets).retain(|s| s.start >= *first && s.start <= *last);
                }
                Stage::Group { metrics } => {
                    let input = std::mem::take(materialize(&mut rows, &buckets));
                    rows = Some(group(input, metrics));
                }
                Stage::Sort => {
                    materialize(&mut rows, &buckets).sort_by_key(|s| s.start);
                }
            }
        }

        rows.unwrap_or_else(|| buckets.iter().map(Bucket::to_sample).collect())
    }
}

fn names<S: AsRef<str>>(metrics: &[S]) -> Vec<String> {
    metrics.iter().map(|m| m.as_ref().to_string()).collect()
}

/// Rows so far, or one row per bucket if nothing has been unwound
fn materialize<'a>(rows: &'a mut Option<Vec<Sample>>, buckets: &[Bucket]) -> &'a mut Vec<Sample> {
    rows.get_or_insert_with(|| buckets.iter().map(Bucket::to_sample).collect())
}

/// Merge rows by timestamp
///
/// A row without a metric contributes nothing for it; a timestamp without
/// any requested metric yields no row.
fn group(rows: Vec<Sample>, metrics: &[String]) -> Vec<Sample> {
    let mut groups: BTreeMap<DateTime<Utc>, Sample> = BTreeMap::new();

    for row in rows {
        let entry = groups
            .entry(row.start)
            .or_insert_with(|| Sample::new(row.start));

        for name in metrics {
            if let Some(metric) = row.metrics.get(name) {
                entry
                    .metrics
                    .entry(name.clone())
                    .or_insert_with(Metric::zero)
                    .merge_from(metric);
            }
        }
    }

    groups
        .into_values()
        .filter(|sample| !sample.metrics.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::series::Resolution;
    use crate::store::Upsert;

    fn at(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    fn write(buckets: &mut Vec<Bucket>, ts: &str, values: &[(&str, f64)], tags: &Tags) {
        let upsert = Upsert::new(
            Resolution::ONE_MINUTE_OF_60_SECONDS,
            at(ts),
            values.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
            tags.clone(),
        )
        .unwrap();

        match buckets
            .iter_mut()
            .find(|b| b.start == upsert.start && b.tags == upsert.tags)
        {
            Some(bucket) => bucket.apply(&upsert),
            None => {
                let mut bucket = Bucket::new(upsert.start, upsert.tags.clone());
                bucket.apply(&upsert);
                buckets.push(bucket);
            }
        }
    }

    fn fixture() -> Vec<Bucket> {
        let mut buckets = Vec::new();
        let one = Tags::new().tag("foo", "bar").tag("host", "one");
        let two = Tags::new().tag("foo", "bar").tag("host", "two");
        let other = Tags::new().tag("foo", "baz");

        write(&mut buckets, "2017-07-15T15:15:15Z", &[("value", 1.0)], &one);
        write(&mut buckets, "2017-07-15T15:15:16Z", &[("value", 2.0), ("load", 0.5)], &one);
        write(&mut buckets, "2017-07-15T15:15:16Z", &[("value", 12.0)], &two);
        write(&mut buckets, "2017-07-15T15:16:01Z", &[("load", 0.7)], &two);
        write(&mut buckets, "2017-07-15T15:15:16Z", &[("value", 100.0)], &other);
        buckets
    }

    #[test]
    fn test_samples_pipeline() {
        let pipeline = Pipeline::samples(
            (at("2017-07-15T15:15:00Z"), at("2017-07-15T15:16:00Z")),
            (at("2017-07-15T15:15:16Z"), at("2017-07-15T15:16:59Z")),
            &["value"],
            &Tags::new().tag("foo", "bar"),
        );

        let rows = pipeline.evaluate(fixture());
        assert_eq!(
            rows,
            vec![Sample::new(at("2017-07-15T15:15:16Z")).metric(
                "value",
                Metric {
                    count: 2,
                    sum: 14.0,
                    min: 2.0,
                    max: 12.0
                }
            )]
        );
    }

    #[test]
    fn test_sets_pipeline() {
        let pipeline = Pipeline::sets(
            (at("2017-07-15T15:15:00Z"), at("2017-07-15T15:16:00Z")),
            &["value", "load"],
            &Tags::new().tag("foo", "bar"),
        );

        let rows = pipeline.evaluate(fixture());
        assert_eq!(rows.len(), 2);

        assert_eq!(rows[0].start, at("2017-07-15T15:15:00Z"));
        assert_eq!(rows[0].get("value").unwrap().count, 3);
        assert_eq!(rows[0].get("value").unwrap().sum, 15.0);
        assert_eq!(rows[0].get("load"), Some(&Metric::single(0.5)));

        // Only load was written in the second bucket
        assert_eq!(rows[1].start, at("2017-07-15T15:16:00Z"));
        assert_eq!(rows[1].get("value"), None);
        assert_eq!(rows[1].get("load"), Some(&Metric::single(0.7)));
    }

    #[test]
    fn test_group_drops_points_without_requested_metrics() {
        let pipeline = Pipeline::sets(
            (at("2017-07-15T15:15:00Z"), at("2017-07-15T15:16:00Z")),
            &["value"],
            &Tags::new(),
        );

        let rows = pipeline.evaluate(fixture());
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("value").unwrap().max, 100.0);
    }

    #[test]
    fn test_pipeline_shape() {
        let tags = Tags::new().tag("host", "one");
        let range = (at("2017-07-15T15:15:00Z"), at("2017-07-15T15:16:00Z"));

        let samples = Pipeline::samples(range, range, &["value"], &tags);
        assert_eq!(samples.stages().len(), 5);
        assert!(samples.unwinds_samples());
        assert_eq!(samples.bucket_match(), Some((range.0, range.1, &tags)));

        let sets = Pipeline::sets(range, &["value"], &tags);
        assert_eq!(sets.stages().len(), 3);
        assert!(!sets.unwinds_samples());
    }
}
