//! TimeSeries - ordered query result with derived statistics and gap-fill

use crate::series::error::{SeriesError, SeriesResult};
use crate::series::metric::Metric;
use crate::series::types::Sample;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Samples sorted ascending by timestamp, at most one per timestamp
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeries {
    /// First timestamp of the query range (inclusive)
    pub first: DateTime<Utc>,
    /// Last timestamp of the query range (inclusive)
    pub last: DateTime<Utc>,
    samples: Vec<Sample>,
}

impl TimeSeries {
    /// Build a series from arbitrary samples
    ///
    /// Samples are sorted and those sharing a timestamp are merged.
    pub fn from_samples(first: DateTime<Utc>, last: DateTime<Utc>, mut samples: Vec<Sample>) -> Self {
        samples.sort_by_key(|s| s.start);

        let mut merged: Vec<Sample> = Vec::with_capacity(samples.len());
        for sample in samples {
            match merged.last_mut() {
                Some(prev) if prev.start == sample.start => prev.merge_from(&sample),
                _ => merged.push(sample),
            }
        }

        Self {
            first,
            last,
            samples: merged,
        }
    }

    /// Empty series over a range
    pub fn empty(first: DateTime<Utc>, last: DateTime<Utc>) -> Self {
        Self {
            first,
            last,
            samples: Vec::new(),
        }
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn into_samples(self) -> Vec<Sample> {
        self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Query range as (first, last)
    pub fn range(&self) -> (DateTime<Utc>, DateTime<Utc>) {
        (self.first, self.last)
    }

    /// Timestamps of all samples
    pub fn timestamps(&self) -> Vec<DateTime<Utc>> {
        self.samples.iter().map(|s| s.start).collect()
    }

    /// Sample at an exact timestamp
    pub fn get(&self, timestamp: DateTime<Utc>) -> Option<&Sample> {
        self.samples
            .binary_search_by_key(&timestamp, |s| s.start)
            .ok()
            .map(|idx| &self.samples[idx])
    }

    /// (timestamp, metric) pairs for samples that carry the metric
    pub fn values(&self, metric: &str) -> Vec<(DateTime<Utc>, Metric)> {
        self.samples
            .iter()
            .filter_map(|s| s.get(metric).map(|m| (s.start, *m)))
            .collect()
    }

    /// The metric merged over the whole series
    pub fn total(&self, metric: &str) -> Metric {
        self.samples
            .iter()
            .filter_map(|s| s.get(metric))
            .fold(Metric::zero(), |acc, m| acc.merge(m))
    }

    /// Sum of all values of the metric
    pub fn sum(&self, metric: &str) -> f64 {
        self.samples
            .iter()
            .filter_map(|s| s.get(metric))
            .map(|m| m.sum)
            .sum()
    }

    /// Number of values of the metric
    pub fn num(&self, metric: &str) -> u64 {
        self.samples
            .iter()
            .filter_map(|s| s.get(metric))
            .map(|m| m.count)
            .sum()
    }

    /// Smallest value of the metric
    pub fn min(&self, metric: &str) -> SeriesResult<f64> {
        self.non_empty(metric)
            .map(|m| m.min)
            .reduce(f64::min)
            .ok_or_else(|| empty_result(metric))
    }

    /// Largest value of the metric
    pub fn max(&self, metric: &str) -> SeriesResult<f64> {
        self.non_empty(metric)
            .map(|m| m.max)
            .reduce(f64::max)
            .ok_or_else(|| empty_result(metric))
    }

    /// Average weighted by sample counts (`sum / num`)
    pub fn avg(&self, metric: &str) -> SeriesResult<f64> {
        let num = self.num(metric);
        if num == 0 {
            return Err(empty_result(metric));
        }
        Ok(self.sum(metric) / num as f64)
    }

    /// Align the series to a list of expected timestamps
    ///
    /// Returns exactly one sample per timestamp: the existing sample or a
    /// placeholder with zero metrics for `metrics`. Both inputs are ascending,
    /// so one forward pass is enough.
    pub fn null<S: AsRef<str>>(&self, timestamps: &[DateTime<Utc>], metrics: &[S]) -> TimeSeries {
        let mut samples = Vec::with_capacity(timestamps.len());
        let mut cursor = 0;

        for &timestamp in timestamps {
            while cursor < self.samples.len() && self.samples[cursor].start < timestamp {
                cursor += 1;
            }

            match self.samples.get(cursor) {
                Some(sample) if sample.start == timestamp => {
                    samples.push(sample.clone());
                    cursor += 1;
                }
                _ => samples.push(Sample::placeholder(timestamp, metrics)),
            }
        }

        TimeSeries {
            first: self.first,
            last: self.last,
            samples,
        }
    }

    /// Metrics of `metric` that hold data (empty placeholders are skipped)
    fn non_empty<'a>(&'a self, metric: &'a str) -> impl Iterator<Item = &'a Metric> + 'a {
        self.samples
            .iter()
            .filter_map(move |s| s.get(metric))
            .filter(|m| !m.is_empty())
    }
}

fn empty_result(metric: &str) -> SeriesError {
    SeriesError::EmptyResult {
        metric: metric.to_string(),
    }
}
