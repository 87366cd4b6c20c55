//! Resolution - bucketing policy for pre-aggregated samples
//!
//! A resolution maps a timestamp to the start of the bucket that holds it and
//! to the key of the sample inside that bucket:
//!
//! ```text
//! second-in-minute:  15:15:15  →  bucket 15:15:00, key 15
//! minute-in-day:     15:15:15  →  bucket 00:00:00, key 915
//! day-in-month:      Jul 15    →  bucket Jul 1,    key 15
//! ```
//!
//! Every variant is one row of a fixed policy table. A [`Resolution`] holds a
//! reference to its row, so there is no way to hold an invalid one.

use crate::series::error::ValidationError;
use chrono::{DateTime, Datelike, Duration, Months, Timelike, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Calendar period covered by one bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BucketPeriod {
    Minute,
    Hour,
    Day,
    Month,
}

impl BucketPeriod {
    fn truncate(self, t: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            BucketPeriod::Minute => SampleUnit::Minute.truncate(t),
            BucketPeriod::Hour => SampleUnit::Hour.truncate(t),
            BucketPeriod::Day => SampleUnit::Day.truncate(t),
            BucketPeriod::Month => {
                let day = SampleUnit::Day.truncate(t);
                day - Duration::days(i64::from(day.day0()))
            }
        }
    }

    /// Start of the following bucket, `None` past the end of the calendar
    fn next(self, start: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            BucketPeriod::Minute => start.checked_add_signed(Duration::minutes(1)),
            BucketPeriod::Hour => start.checked_add_signed(Duration::hours(1)),
            BucketPeriod::Day => start.checked_add_signed(Duration::days(1)),
            BucketPeriod::Month => start.checked_add_months(Months::new(1)),
        }
    }
}

/// Granularity of the samples stored inside a bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SampleUnit {
    Second,
    Minute,
    Hour,
    Day,
}

impl SampleUnit {
    fn seconds(self) -> i64 {
        match self {
            SampleUnit::Second => 1,
            SampleUnit::Minute => 60,
            SampleUnit::Hour => 3600,
            SampleUnit::Day => 86_400,
        }
    }

    fn truncate(self, t: DateTime<Utc>) -> DateTime<Utc> {
        let below = match self {
            SampleUnit::Second => 0,
            SampleUnit::Minute => t.second(),
            SampleUnit::Hour => t.minute() * 60 + t.second(),
            SampleUnit::Day => t.num_seconds_from_midnight(),
        };

        t - Duration::nanoseconds(i64::from(t.nanosecond())) - Duration::seconds(i64::from(below))
    }
}

/// One row of the resolution table
#[derive(Debug)]
struct Policy {
    identifier: &'static str,
    alias: Option<&'static str>,
    bucket: BucketPeriod,
    sample: SampleUnit,
    /// Key of the first sample in a bucket
    key_base: u32,
    /// Maximum number of distinct keys per bucket
    size: u32,
}

const SECOND_IN_MINUTE: Policy = Policy {
    identifier: "second-in-minute",
    alias: Some("s"),
    bucket: BucketPeriod::Minute,
    sample: SampleUnit::Second,
    key_base: 0,
    size: 60,
};

const MINUTE_IN_HOUR: Policy = Policy {
    identifier: "minute-in-hour",
    alias: Some("m"),
    bucket: BucketPeriod::Hour,
    sample: SampleUnit::Minute,
    key_base: 0,
    size: 60,
};

const HOUR_IN_DAY: Policy = Policy {
    identifier: "hour-in-day",
    alias: Some("h"),
    bucket: BucketPeriod::Day,
    sample: SampleUnit::Hour,
    key_base: 0,
    size: 24,
};

// Keys are days of the month, so they start at 1.
const DAY_IN_MONTH: Policy = Policy {
    identifier: "day-in-month",
    alias: Some("d"),
    bucket: BucketPeriod::Month,
    sample: SampleUnit::Day,
    key_base: 1,
    size: 31,
};

const SECOND_IN_HOUR: Policy = Policy {
    identifier: "second-in-hour",
    alias: None,
    bucket: BucketPeriod::Hour,
    sample: SampleUnit::Second,
    key_base: 0,
    size: 3600,
};

const MINUTE_IN_DAY: Policy = Policy {
    identifier: "minute-in-day",
    alias: None,
    bucket: BucketPeriod::Day,
    sample: SampleUnit::Minute,
    key_base: 0,
    size: 1440,
};

/// Key of a sample within its bucket
///
/// Persisted as a decimal string (`"15"`, `"915"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SampleKey(pub u32);

impl fmt::Display for SampleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Granularity of saved samples and their organization in buckets
#[derive(Clone, Copy)]
pub struct Resolution {
    policy: &'static Policy,
}

impl Resolution {
    /// 60 one-second samples per one-minute bucket
    pub const ONE_MINUTE_OF_60_SECONDS: Resolution = Resolution {
        policy: &SECOND_IN_MINUTE,
    };

    /// 60 one-minute samples per one-hour bucket
    pub const ONE_HOUR_OF_60_MINUTES: Resolution = Resolution {
        policy: &MINUTE_IN_HOUR,
    };

    /// 24 one-hour samples per one-day bucket
    pub const ONE_DAY_OF_24_HOURS: Resolution = Resolution {
        policy: &HOUR_IN_DAY,
    };

    /// 28 to 31 one-day samples per one-month bucket
    pub const ONE_MONTH_OF_UP_TO_31_DAYS: Resolution = Resolution {
        policy: &DAY_IN_MONTH,
    };

    /// 3600 one-second samples per one-hour bucket
    pub const ONE_HOUR_OF_3600_SECONDS: Resolution = Resolution {
        policy: &SECOND_IN_HOUR,
    };

    /// 1440 one-minute samples per one-day bucket
    pub const ONE_DAY_OF_1440_MINUTES: Resolution = Resolution {
        policy: &MINUTE_IN_DAY,
    };

    /// Every supported resolution
    pub const ALL: [Resolution; 6] = [
        Self::ONE_MINUTE_OF_60_SECONDS,
        Self::ONE_HOUR_OF_60_MINUTES,
        Self::ONE_DAY_OF_24_HOURS,
        Self::ONE_MONTH_OF_UP_TO_31_DAYS,
        Self::ONE_HOUR_OF_3600_SECONDS,
        Self::ONE_DAY_OF_1440_MINUTES,
    ];

    /// Identifier used in configuration files
    pub fn identifier(&self) -> &'static str {
        self.policy.identifier
    }

    /// Split a timestamp into the start of its bucket and its sample key
    pub fn split(&self, t: DateTime<Utc>) -> (DateTime<Utc>, SampleKey) {
        let start = self.policy.bucket.truncate(t);
        let sample_start = self.policy.sample.truncate(t);
        let offset = (sample_start - start).num_seconds() / self.policy.sample.seconds();

        // offset is bounded by the bucket size
        let key = self.policy.key_base + offset as u32;
        (start, SampleKey(key))
    }

    /// Rebuild the sample timestamp from a bucket start and a sample key
    ///
    /// Inverse of [`split`](Self::split) at sample granularity.
    pub fn join(&self, start: DateTime<Utc>, key: SampleKey) -> DateTime<Utc> {
        let offset = i64::from(key.0) - i64::from(self.policy.key_base);
        start + Duration::seconds(offset * self.policy.sample.seconds())
    }

    /// Start of the bucket containing `t`
    pub fn bucket_start(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        self.policy.bucket.truncate(t)
    }

    /// `t` truncated to sample granularity
    pub fn sample_timestamp(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        self.policy.sample.truncate(t)
    }

    /// Maximum number of distinct sample keys per bucket
    pub fn bucket_size(&self) -> usize {
        self.policy.size as usize
    }

    /// Exact number of sample keys in the bucket starting at `start`
    ///
    /// Differs from [`bucket_size`](Self::bucket_size) only for month buckets.
    pub fn samples_in_bucket(&self, start: DateTime<Utc>) -> usize {
        match self.policy.bucket {
            BucketPeriod::Month => self
                .policy
                .bucket
                .next(start)
                .map(|next| (next - start).num_days() as usize)
                .unwrap_or(self.bucket_size()),
            _ => self.bucket_size(),
        }
    }

    /// Ascending bucket starts covering `[first, last]`
    pub fn bucket_timestamps(&self, first: DateTime<Utc>, last: DateTime<Utc>) -> Vec<DateTime<Utc>> {
        let mut timestamps = Vec::new();
        if first > last {
            return timestamps;
        }

        let end = self.bucket_start(last);
        let mut current = self.bucket_start(first);

        while current <= end {
            timestamps.push(current);
            match self.policy.bucket.next(current) {
                Some(next) => current = next,
                None => break,
            }
        }

        timestamps
    }

    /// Ascending sample timestamps covering `[first, last]`
    pub fn sample_timestamps(&self, first: DateTime<Utc>, last: DateTime<Utc>) -> Vec<DateTime<Utc>> {
        let mut timestamps = Vec::new();
        if first > last {
            return timestamps;
        }

        let step = Duration::seconds(self.policy.sample.seconds());
        let end = self.sample_timestamp(last);
        let mut current = self.sample_timestamp(first);

        while current <= end {
            timestamps.push(current);
            match current.checked_add_signed(step) {
                Some(next) => current = next,
                None => break,
            }
        }

        timestamps
    }

    /// Decode a persisted sample key against the largest bucket
    pub fn parse_key(&self, raw: &str) -> Result<SampleKey, ValidationError> {
        self.decode_key(raw, self.policy.size)
    }

    /// Decode a persisted sample key of the bucket starting at `start`
    ///
    /// Month buckets only accept the days of their own month.
    pub fn parse_key_in(&self, start: DateTime<Utc>, raw: &str) -> Result<SampleKey, ValidationError> {
        self.decode_key(raw, self.samples_in_bucket(start) as u32)
    }

    fn decode_key(&self, raw: &str, count: u32) -> Result<SampleKey, ValidationError> {
        let invalid = |reason: String| ValidationError::InvalidSampleKey {
            key: raw.to_string(),
            resolution: self.policy.identifier,
            reason,
        };

        let value: u32 = raw
            .parse()
            .map_err(|_| invalid("not a decimal integer".to_string()))?;

        let low = self.policy.key_base;
        let high = low + count;
        if value < low || value >= high {
            return Err(invalid(format!("outside {}..{}", low, high)));
        }

        Ok(SampleKey(value))
    }
}

impl PartialEq for Resolution {
    fn eq(&self, other: &Self) -> bool {
        self.policy.identifier == other.policy.identifier
    }
}

impl Eq for Resolution {}

impl std::hash::Hash for Resolution {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.policy.identifier.hash(state);
    }
}

impl fmt::Debug for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Resolution").field(&self.policy.identifier).finish()
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.policy.identifier)
    }
}

impl Default for Resolution {
    fn default() -> Self {
        Self::ONE_MINUTE_OF_60_SECONDS
    }
}

impl FromStr for Resolution {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        Self::ALL
            .iter()
            .find(|r| r.policy.identifier == wanted || r.policy.alias == Some(wanted))
            .copied()
            .ok_or_else(|| ValidationError::UnknownResolution(s.to_string()))
    }
}

impl Serialize for Resolution {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.policy.identifier)
    }
}

impl<'de> Deserialize<'de> for Resolution {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    #[test]
    fn test_resolution_table() {
        let ts = at("2017-07-15T15:15:15Z");

        let table = [
            (Resolution::ONE_MINUTE_OF_60_SECONDS, 60, "2017-07-15T15:15:00Z", 15, "2017-07-15T15:15:15Z"),
            (Resolution::ONE_HOUR_OF_60_MINUTES, 60, "2017-07-15T15:00:00Z", 15, "2017-07-15T15:15:00Z"),
            (Resolution::ONE_DAY_OF_24_HOURS, 24, "2017-07-15T00:00:00Z", 15, "2017-07-15T15:00:00Z"),
            (Resolution::ONE_MONTH_OF_UP_TO_31_DAYS, 31, "2017-07-01T00:00:00Z", 15, "2017-07-15T00:00:00Z"),
            (Resolution::ONE_HOUR_OF_3600_SECONDS, 3600, "2017-07-15T15:00:00Z", 915, "2017-07-15T15:15:15Z"),
            (Resolution::ONE_DAY_OF_1440_MINUTES, 1440, "2017-07-15T00:00:00Z", 915, "2017-07-15T15:15:00Z"),
        ];

        for (resolution, size, start, key, joined) in table {
            assert_eq!(resolution.bucket_size(), size, "{}", resolution);

            let (s, k) = resolution.split(ts);
            assert_eq!(s, at(start), "{}", resolution);
            assert_eq!(k, SampleKey(key), "{}", resolution);
            assert_eq!(resolution.join(s, k), at(joined), "{}", resolution);
        }
    }

    #[test]
    fn test_split_is_deterministic() {
        let ts = at("2017-07-15T15:15:15.250Z");
        for resolution in Resolution::ALL {
            assert_eq!(resolution.split(ts), resolution.split(ts));
        }
    }

    #[test]
    fn test_join_split_round_trip() {
        let timestamps = [
            at("2017-07-15T15:15:15.999Z"),
            at("2020-02-29T23:59:59Z"),
            at("2021-12-31T23:59:59Z"),
            at("2021-01-01T00:00:00Z"),
            at("1969-12-31T23:59:59.5Z"),
        ];

        for resolution in Resolution::ALL {
            for ts in timestamps {
                let (start, key) = resolution.split(ts);
                let once = resolution.join(start, key);
                assert_eq!(once, resolution.sample_timestamp(ts), "{} {}", resolution, ts);

                let (start2, key2) = resolution.split(once);
                assert_eq!((start2, key2), (start, key));
                assert_eq!(resolution.join(start2, key2), once);
            }
        }
    }

    #[test]
    fn test_month_boundaries() {
        let r = Resolution::ONE_MONTH_OF_UP_TO_31_DAYS;

        let (start, key) = r.split(at("2020-02-29T10:00:00Z"));
        assert_eq!(start, at("2020-02-01T00:00:00Z"));
        assert_eq!(key, SampleKey(29));
        assert_eq!(r.join(start, key), at("2020-02-29T00:00:00Z"));

        let (start, key) = r.split(at("2021-03-01T00:00:00Z"));
        assert_eq!(start, at("2021-03-01T00:00:00Z"));
        assert_eq!(key, SampleKey(1));

        assert_eq!(r.samples_in_bucket(at("2020-02-01T00:00:00Z")), 29);
        assert_eq!(r.samples_in_bucket(at("2021-02-01T00:00:00Z")), 28);
        assert_eq!(r.samples_in_bucket(at("2021-04-01T00:00:00Z")), 30);
        assert_eq!(r.samples_in_bucket(at("2021-07-01T00:00:00Z")), 31);
        assert_eq!(
            Resolution::ONE_DAY_OF_24_HOURS.samples_in_bucket(at("2021-07-01T00:00:00Z")),
            24
        );
    }

    #[test]
    fn test_bucket_timestamps() {
        let r = Resolution::ONE_MONTH_OF_UP_TO_31_DAYS;
        let buckets = r.bucket_timestamps(at("2020-01-15T12:00:00Z"), at("2020-04-02T00:00:00Z"));
        assert_eq!(
            buckets,
            vec![
                at("2020-01-01T00:00:00Z"),
                at("2020-02-01T00:00:00Z"),
                at("2020-03-01T00:00:00Z"),
                at("2020-04-01T00:00:00Z"),
            ]
        );

        let r = Resolution::ONE_MINUTE_OF_60_SECONDS;
        let buckets = r.bucket_timestamps(at("2017-07-15T15:15:15Z"), at("2017-07-15T15:17:00Z"));
        assert_eq!(
            buckets,
            vec![
                at("2017-07-15T15:15:00Z"),
                at("2017-07-15T15:16:00Z"),
                at("2017-07-15T15:17:00Z"),
            ]
        );
    }

    #[test]
    fn test_sample_timestamps() {
        let r = Resolution::ONE_MINUTE_OF_60_SECONDS;
        let samples = r.sample_timestamps(at("2017-07-15T15:15:15Z"), at("2017-07-15T15:15:17Z"));
        assert_eq!(
            samples,
            vec![
                at("2017-07-15T15:15:15Z"),
                at("2017-07-15T15:15:16Z"),
                at("2017-07-15T15:15:17Z"),
            ]
        );

        let r = Resolution::ONE_DAY_OF_24_HOURS;
        let samples = r.sample_timestamps(at("2017-07-15T22:30:00Z"), at("2017-07-16T01:10:00Z"));
        assert_eq!(samples.len(), 4);
        assert_eq!(samples[0], at("2017-07-15T22:00:00Z"));
        assert_eq!(samples[3], at("2017-07-16T01:00:00Z"));
    }

    #[test]
    fn test_empty_ranges() {
        let r = Resolution::ONE_HOUR_OF_60_MINUTES;
        let first = at("2017-07-15T15:15:15Z");
        let last = at("2017-07-15T15:00:00Z");
        assert!(r.bucket_timestamps(first, last).is_empty());
        assert!(r.sample_timestamps(first, last).is_empty());
    }

    #[test]
    fn test_from_str() {
        assert_eq!(
            "second-in-minute".parse::<Resolution>().unwrap(),
            Resolution::ONE_MINUTE_OF_60_SECONDS
        );
        assert_eq!("d".parse::<Resolution>().unwrap(), Resolution::ONE_MONTH_OF_UP_TO_31_DAYS);
        assert_eq!(
            "minute-in-day".parse::<Resolution>().unwrap(),
            Resolution::ONE_DAY_OF_1440_MINUTES
        );

        let err = "week-in-year".parse::<Resolution>().unwrap_err();
        assert_eq!(err, ValidationError::UnknownResolution("week-in-year".to_string()));
    }

    #[test]
    fn test_parse_key() {
        let r = Resolution::ONE_MINUTE_OF_60_SECONDS;
        assert_eq!(r.parse_key("15").unwrap(), SampleKey(15));
        assert_eq!(r.parse_key("0").unwrap(), SampleKey(0));
        assert!(matches!(r.parse_key("60"), Err(ValidationError::InvalidSampleKey { .. })));
        assert!(matches!(r.parse_key("x1"), Err(ValidationError::InvalidSampleKey { .. })));

        let r = Resolution::ONE_MONTH_OF_UP_TO_31_DAYS;
        assert!(r.parse_key("0").is_err());
        assert_eq!(r.parse_key("31").unwrap(), SampleKey(31));
    }

    #[test]
    fn test_parse_key_in_short_month() {
        let r = Resolution::ONE_MONTH_OF_UP_TO_31_DAYS;
        let feb = at("2021-02-01T00:00:00Z");

        let key = r.parse_key_in(feb, "28").unwrap();
        assert_eq!(r.split(r.join(feb, key)), (feb, key));

        for raw in ["29", "30", "31"] {
            assert!(matches!(
                r.parse_key_in(feb, raw),
                Err(ValidationError::InvalidSampleKey { .. })
            ));
        }

        let leap = at("2020-02-01T00:00:00Z");
        assert_eq!(r.parse_key_in(leap, "29").unwrap(), SampleKey(29));
        assert!(r.parse_key_in(leap, "30").is_err());

        let jul = at("2017-07-01T00:00:00Z");
        assert_eq!(r.parse_key_in(jul, "31").unwrap(), SampleKey(31));

        // Fixed-size buckets are unaffected by the start
        let s = Resolution::ONE_MINUTE_OF_60_SECONDS;
        assert_eq!(s.parse_key_in(at("2017-07-15T15:15:00Z"), "59").unwrap(), SampleKey(59));
        assert!(s.parse_key_in(at("2017-07-15T15:15:00Z"), "60").is_err());
    }

    #[test]
    fn test_serde() {
        let json = serde_json::to_string(&Resolution::ONE_DAY_OF_24_HOURS).unwrap();
        assert_eq!(json, "\"hour-in-day\"");

        let restored: Resolution = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, Resolution::ONE_DAY_OF_24_HOURS);

        assert!(serde_json::from_str::<Resolution>("\"decade\"").is_err());
    }
}
