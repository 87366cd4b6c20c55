//! Metric aggregate - running {count, sum, min, max} statistics
//!
//! Merging is commutative and associative, so any number of writers can
//! fold values into the same aggregate in any order and batch layout.

use crate::series::error::{SeriesError, SeriesResult};
use serde::{Deserialize, Serialize};

/// Running statistics for one metric at one point
///
/// Serialized with the persisted field names `num` and `total`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    /// Number of merged values
    #[serde(rename = "num")]
    pub count: u64,
    /// Sum of merged values
    #[serde(rename = "total")]
    pub sum: f64,
    /// Smallest merged value
    pub min: f64,
    /// Largest merged value
    pub max: f64,
}

impl Metric {
    /// Aggregate of a single value
    pub fn single(value: f64) -> Self {
        Self {
            count: 1,
            sum: value,
            min: value,
            max: value,
        }
    }

    /// Placeholder for a point with no data
    pub fn zero() -> Self {
        Self {
            count: 0,
            sum: 0.0,
            min: 0.0,
            max: 0.0,
        }
    }

    /// True if no value has been merged
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Merge two aggregates into a new one
    pub fn merge(&self, other: &Metric) -> Metric {
        let mut merged = *self;
        merged.merge_from(other);
        merged
    }

    /// Merge another aggregate into this one
    ///
    /// An empty operand leaves the other side unchanged.
    pub fn merge_from(&mut self, other: &Metric) {
        if other.count == 0 {
            return;
        }
        if self.count == 0 {
            *self = *other;
            return;
        }

        self.count += other.count;
        self.sum += other.sum;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }

    /// Fold a single value into this aggregate
    pub fn record(&mut self, value: f64) {
        self.merge_from(&Metric::single(value));
    }

    /// Average of the merged values
    pub fn avg(&self) -> SeriesResult<f64> {
        if self.count == 0 {
            return Err(SeriesError::DivideByZero);
        }
        Ok(self.sum / self.count as f64)
    }
}

impl FromIterator<f64> for Metric {
    fn from_iter<I: IntoIterator<Item = f64>>(iter: I) -> Self {
        let mut metric = Metric::zero();
        for value in iter {
            metric.record(value);
        }
        metric
    }
}
