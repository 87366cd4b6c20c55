//! Bucketing model
//!
//! - **resolution**: maps timestamps to (bucket start, sample key) and back
//! - **metric**: the {count, sum, min, max} aggregate and its merge
//! - **types**: tags, buckets and result samples
//! - **time_series**: query results, statistics and gap-fill
//! - **error**: validation and statistics errors
//!
//! # Layout
//!
//! ```text
//! Resolution one-minute-of-60-seconds, write at 15:15:15
//!
//!   Bucket (start 15:15:00, tags {host: one})
//!     metrics  value → {num 1, total 10, min 10, max 10}
//!     samples  "15"  → {start 15:15:15, value → {num 1, total 10, ...}}
//! ```

pub mod error;
pub mod metric;
pub mod resolution;
pub mod time_series;
pub mod types;

pub use error::{SeriesError, SeriesResult, ValidationError};
pub use metric::Metric;
pub use resolution::{Resolution, SampleKey};
pub use time_series::TimeSeries;
pub use types::{Bucket, Sample, StoredSample, TagValue, Tags};
