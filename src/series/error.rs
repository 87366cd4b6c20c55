//! Series error types
//!
//! Validation failures are programming errors (bad resolution identifier,
//! corrupt sample key). Series errors are precondition violations on query
//! results (asking for the minimum of nothing).

use thiserror::Error;

/// Errors raised while constructing resolutions or decoding sample keys
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Resolution identifier is not one of the known variants
    #[error("Unknown resolution: {0}")]
    UnknownResolution(String),

    /// Persisted sample key is not a valid key for the resolution
    #[error("Invalid sample key {key:?} for {resolution}: {reason}")]
    InvalidSampleKey {
        key: String,
        resolution: &'static str,
        reason: String,
    },

    /// Written value is NaN or infinite
    #[error("Non-finite value for metric {metric}: {value}")]
    NonFiniteValue { metric: String, value: String },
}

/// Errors raised when deriving statistics from aggregates
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SeriesError {
    /// No sample in the series carries data for the metric
    #[error("No data for metric: {metric}")]
    EmptyResult { metric: String },

    /// Average requested on an aggregate with a zero count
    #[error("Division by zero: aggregate has no values")]
    DivideByZero,
}

/// Result type alias for series statistics
pub type SeriesResult<T> = Result<T, SeriesError>;
