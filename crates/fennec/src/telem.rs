//! Core telemetry types: timestamps, time ranges, data types, and series.
//!
//! Timestamps are 64-bit signed nanosecond counts since a fixed epoch. Time
//! ranges are half-open `[start, end)` intervals. A series is a blob of
//! fixed-width samples of a single [`DataType`].

use serde::{Deserialize, Serialize};
use std::fmt;

/// A 64-bit signed nanosecond count since the epoch.
pub type TimeStamp = i64;

/// A 64-bit signed nanosecond span.
pub type TimeSpan = i64;

/// The maximum representable timestamp.
pub const TIME_STAMP_MAX: TimeStamp = i64::MAX;

/// The minimum representable timestamp.
pub const TIME_STAMP_MIN: TimeStamp = i64::MIN;

/// The maximum representable time span.
pub const TIME_SPAN_MAX: TimeSpan = i64::MAX;

/// One microsecond, in nanoseconds.
pub const MICROSECOND: TimeSpan = 1_000;

/// One millisecond, in nanoseconds.
pub const MILLISECOND: TimeSpan = 1_000 * MICROSECOND;

/// One second, in nanoseconds.
pub const SECOND: TimeSpan = 1_000 * MILLISECOND;

/// A half-open time interval `[start, end)`.
///
/// An empty range (`start == end`) is valid but contains no samples. Two
/// ranges overlap iff `a.start < b.end && b.start < a.end`, so touching
/// ranges do not overlap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimeRange {
    /// Start of the range, inclusive.
    pub start: TimeStamp,
    /// End of the range, exclusive.
    pub end: TimeStamp,
}

/// The maximal time range.
pub const TIME_RANGE_MAX: TimeRange = TimeRange {
    start: TIME_STAMP_MIN,
    end: TIME_STAMP_MAX,
};

impl TimeRange {
    /// Creates a new time range. `start > end` is representable but invalid;
    /// callers validate with [`TimeRange::valid`].
    pub fn new(start: TimeStamp, end: TimeStamp) -> Self {
        Self { start, end }
    }

    /// The range covering all of time.
    pub const MAX: TimeRange = TIME_RANGE_MAX;

    /// Returns true when `start <= end`.
    pub fn valid(&self) -> bool {
        self.start <= self.end
    }

    /// Returns true when the range contains no instant.
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Duration of the range in nanoseconds.
    pub fn span(&self) -> TimeSpan {
        self.end - self.start
    }

    /// Returns true when `ts` falls within `[start, end)`.
    pub fn contains_stamp(&self, ts: TimeStamp) -> bool {
        ts >= self.start && ts < self.end
    }

    /// Returns true when `other` lies entirely within this range.
    ///
    /// The exclusive end is allowed to touch: `[0, 10)` contains `[2, 10)`.
    pub fn contains_range(&self, other: &TimeRange) -> bool {
        other.start >= self.start && other.end <= self.end
    }

    /// Returns true when the two half-open ranges share any instant.
    pub fn overlaps_with(&self, other: &TimeRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Intersection of the two ranges. Empty or inverted results collapse to
    /// an empty range at the boundary.
    pub fn intersection(&self, other: &TimeRange) -> TimeRange {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        TimeRange {
            start,
            end: end.max(start),
        }
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// The fixed-width scalar type of a channel's samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    /// Unset. Channels must declare a concrete type before creation.
    #[default]
    Unknown,
    /// Signed 8-bit integer.
    Int8,
    /// Signed 16-bit integer.
    Int16,
    /// Signed 32-bit integer.
    Int32,
    /// Signed 64-bit integer.
    Int64,
    /// Unsigned 8-bit integer.
    Uint8,
    /// Unsigned 16-bit integer.
    Uint16,
    /// Unsigned 32-bit integer.
    Uint32,
    /// Unsigned 64-bit integer.
    Uint64,
    /// Unsigned 128-bit integer.
    Uint128,
    /// 32-bit float.
    Float32,
    /// 64-bit float.
    Float64,
    /// 64-bit nanosecond timestamp.
    TimeStamp,
}

impl DataType {
    /// On-disk width of one sample, in bytes. Zero for [`DataType::Unknown`].
    pub fn density(&self) -> u32 {
        match self {
            DataType::Unknown => 0,
            DataType::Int8 | DataType::Uint8 => 1,
            DataType::Int16 | DataType::Uint16 => 2,
            DataType::Int32 | DataType::Uint32 | DataType::Float32 => 4,
            DataType::Int64 | DataType::Uint64 | DataType::Float64 | DataType::TimeStamp => 8,
            DataType::Uint128 => 16,
        }
    }

    /// Returns true for the timestamp type required of index channels.
    pub fn is_timestamp(&self) -> bool {
        matches!(self, DataType::TimeStamp)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::Unknown => "unknown",
            DataType::Int8 => "int8",
            DataType::Int16 => "int16",
            DataType::Int32 => "int32",
            DataType::Int64 => "int64",
            DataType::Uint8 => "uint8",
            DataType::Uint16 => "uint16",
            DataType::Uint32 => "uint32",
            DataType::Uint64 => "uint64",
            DataType::Uint128 => "uint128",
            DataType::Float32 => "float32",
            DataType::Float64 => "float64",
            DataType::TimeStamp => "timestamp",
        };
        write!(f, "{name}")
    }
}

/// A run of fixed-width samples of one data type.
///
/// `time_range` is populated on reads with the interval the samples occupy;
/// series headed for a writer leave it empty.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Series {
    /// Sample type of every element in `data`.
    pub data_type: DataType,
    /// Interval occupied by the samples, populated on reads.
    pub time_range: TimeRange,
    /// Raw little-endian sample bytes, a multiple of the type's density.
    pub data: Vec<u8>,
}

impl Series {
    /// Creates a series from raw sample bytes.
    pub fn new(data_type: DataType, data: Vec<u8>) -> Self {
        Self {
            data_type,
            time_range: TimeRange::default(),
            data,
        }
    }

    /// Creates an int64 series from values.
    pub fn from_i64s(values: &[i64]) -> Self {
        let mut data = Vec::with_capacity(values.len() * 8);
        for v in values {
            data.extend_from_slice(&v.to_le_bytes());
        }
        Self::new(DataType::Int64, data)
    }

    /// Creates a float64 series from values.
    pub fn from_f64s(values: &[f64]) -> Self {
        let mut data = Vec::with_capacity(values.len() * 8);
        for v in values {
            data.extend_from_slice(&v.to_le_bytes());
        }
        Self::new(DataType::Float64, data)
    }

    /// Creates a timestamp series from nanosecond stamps.
    pub fn from_timestamps(stamps: &[TimeStamp]) -> Self {
        let mut data = Vec::with_capacity(stamps.len() * 8);
        for ts in stamps {
            data.extend_from_slice(&ts.to_le_bytes());
        }
        Self::new(DataType::TimeStamp, data)
    }

    /// Creates a timestamp series from whole-second stamps.
    pub fn from_second_timestamps(seconds: &[i64]) -> Self {
        let stamps: Vec<TimeStamp> = seconds.iter().map(|s| s * SECOND).collect();
        Self::from_timestamps(&stamps)
    }

    /// Number of samples in the series.
    pub fn len(&self) -> i64 {
        let density = self.data_type.density();
        if density == 0 {
            return 0;
        }
        (self.data.len() / density as usize) as i64
    }

    /// Returns true when the series holds no samples.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Reads the sample at `idx` as a little-endian i64. Only meaningful for
    /// 8-byte-wide types.
    pub fn i64_at(&self, idx: usize) -> i64 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.data[idx * 8..idx * 8 + 8]);
        i64::from_le_bytes(buf)
    }

    /// Decodes the series as i64 values. Only meaningful for 8-byte types.
    pub fn as_i64s(&self) -> Vec<i64> {
        (0..self.len() as usize).map(|i| self.i64_at(i)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_range_contains_stamp() {
        let tr = TimeRange::new(1000, 2000);
        assert!(!tr.contains_stamp(999));
        assert!(tr.contains_stamp(1000));
        assert!(tr.contains_stamp(1999));
        assert!(!tr.contains_stamp(2000));
    }

    #[test]
    fn test_time_range_overlap_is_half_open() {
        let a = TimeRange::new(1000, 2000);
        assert!(a.overlaps_with(&TimeRange::new(1500, 2500)));
        assert!(a.overlaps_with(&TimeRange::new(500, 1500)));
        // Touching ranges do not overlap.
        assert!(!a.overlaps_with(&TimeRange::new(2000, 3000)));
        assert!(!a.overlaps_with(&TimeRange::new(0, 1000)));
        // An empty range never overlaps itself.
        let empty = TimeRange::new(1500, 1500);
        assert!(!empty.overlaps_with(&empty));
    }

    #[test]
    fn test_series_round_trip() {
        let s = Series::from_i64s(&[2, 3, 5, 7, 11]);
        assert_eq!(s.len(), 5);
        assert_eq!(s.as_i64s(), vec![2, 3, 5, 7, 11]);
        assert_eq!(s.data.len(), 40);
    }

    #[test]
    fn test_data_type_density() {
        assert_eq!(DataType::Uint8.density(), 1);
        assert_eq!(DataType::Int16.density(), 2);
        assert_eq!(DataType::Float32.density(), 4);
        assert_eq!(DataType::TimeStamp.density(), 8);
        assert_eq!(DataType::Uint128.density(), 16);
        assert_eq!(DataType::Unknown.density(), 0);
    }
}
