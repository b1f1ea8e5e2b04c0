//! Minute Grid Semantics
//!
//! Single source of truth for minute boundaries and date partitions.
//!
//! # Canonical Rule
//!
//! For any event time `t` (nanoseconds since the Unix epoch, UTC):
//! - `minute_start = floor_div(t, M) * M` where `M = 1 minute in nanoseconds`
//! - the minute is **half-open**: `[minute_start, minute_start + M)`
//!
//! An event stamped exactly on a boundary belongs to the minute that starts
//! at that boundary. Date partitions follow the same half-open rule on UTC days.

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Nanoseconds since Unix epoch (1970-01-01 00:00:00 UTC).
pub type Nanos = i64;

pub const NANOS_PER_MILLI: i64 = 1_000_000;
pub const NANOS_PER_SEC: i64 = 1_000_000_000;
pub const NANOS_PER_MIN: i64 = 60 * NANOS_PER_SEC;
pub const MINUTES_PER_DAY: i64 = 24 * 60;
pub const NANOS_PER_DAY: i64 = MINUTES_PER_DAY * NANOS_PER_MIN;

/// Minutes in a (365-day) year, used to annualize 1-minute volatility.
pub const MINUTES_PER_YEAR: f64 = 525_600.0;

/// Floor a timestamp to the start of its minute.
///
/// Uses Euclidean division so pre-epoch timestamps still floor downward.
#[inline]
pub fn minute_floor(t: Nanos) -> Nanos {
    t.div_euclid(NANOS_PER_MIN) * NANOS_PER_MIN
}

/// True if `t` is exactly a minute boundary.
#[inline]
pub fn is_minute_aligned(t: Nanos) -> bool {
    t.rem_euclid(NANOS_PER_MIN) == 0
}

/// UTC calendar date containing `t`.
pub fn date_of(t: Nanos) -> NaiveDate {
    nanos_to_datetime(t).date_naive()
}

/// Start of the UTC day (midnight) for a date.
pub fn day_start(date: NaiveDate) -> Nanos {
    let midnight = date.and_hms_opt(0, 0, 0).unwrap_or_default();
    Utc.from_utc_datetime(&midnight).timestamp() * NANOS_PER_SEC
}

/// Half-open nanosecond bounds `[start, end)` of a UTC day.
pub fn day_bounds(date: NaiveDate) -> (Nanos, Nanos) {
    let start = day_start(date);
    (start, start + NANOS_PER_DAY)
}

pub fn nanos_to_datetime(t: Nanos) -> DateTime<Utc> {
    let secs = t.div_euclid(NANOS_PER_SEC);
    let sub = t.rem_euclid(NANOS_PER_SEC) as u32;
    Utc.timestamp_opt(secs, sub).single().unwrap_or_default()
}

pub fn datetime_to_nanos(dt: &DateTime<Utc>) -> Nanos {
    dt.timestamp() * NANOS_PER_SEC + dt.timestamp_subsec_nanos() as i64
}

/// Parse an RFC 3339 timestamp into nanoseconds.
pub fn parse_timestamp(s: &str) -> Option<Nanos> {
    DateTime::parse_from_rfc3339(s.trim())
        .ok()
        .map(|dt| datetime_to_nanos(&dt.with_timezone(&Utc)))
}

/// RFC 3339 rendering with a `Z` suffix.
pub fn format_timestamp(t: Nanos) -> String {
    nanos_to_datetime(t).format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Dates `[first, last]` inclusive.
pub fn date_range(first: NaiveDate, last: NaiveDate) -> Vec<NaiveDate> {
    let mut out = Vec::new();
    let mut d = first;
    while d <= last {
        out.push(d);
        d += Duration::days(1);
    }
    out
}

// =============================================================================
// MINUTE GRID
// =============================================================================

/// A half-open grid of minute starts `[start, end)`.
///
/// Both bounds are floored to the minute on construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MinuteGrid {
    pub start: Nanos,
    pub end: Nanos,
}

impl MinuteGrid {
    pub fn new(start: Nanos, end: Nanos) -> Self {
        let start = minute_floor(start);
        let end = minute_floor(end).max(start);
        Self { start, end }
    }

    /// Grid covering one UTC day.
    pub fn for_day(date: NaiveDate) -> Self {
        let (start, end) = day_bounds(date);
        Self { start, end }
    }

    pub fn len(&self) -> usize {
        ((self.end - self.start) / NANOS_PER_MIN) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    #[inline]
    pub fn contains(&self, t: Nanos) -> bool {
        t >= self.start && t < self.end
    }

    pub fn minutes(&self) -> impl Iterator<Item = Nanos> {
        let start = self.start;
        (0..self.len() as i64).map(move |i| start + i * NANOS_PER_MIN)
    }

    /// Index of the minute containing `t`, if inside the grid.
    pub fn index_of(&self, t: Nanos) -> Option<usize> {
        if !self.contains(t) {
            return None;
        }
        Some(((minute_floor(t) - self.start) / NANOS_PER_MIN) as usize)
    }
}

/// Half-open nanosecond range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    pub start_ns: Nanos,
    pub end_ns: Nanos,
}

impl TimeRange {
    pub fn new(start_ns: Nanos, end_ns: Nanos) -> Self {
        Self { start_ns, end_ns }
    }

    pub fn contains(&self, t: Nanos) -> bool {
        t >= self.start_ns && t < self.end_ns
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minute_floor_boundary_belongs_to_next_minute() {
        let t = 1_700_000_040 * NANOS_PER_SEC; // :00 of a minute
        assert!(is_minute_aligned(t));
        assert_eq!(minute_floor(t), t);
        assert_eq!(minute_floor(t - 1), t - NANOS_PER_MIN);
        assert_eq!(minute_floor(t + NANOS_PER_MIN - 1), t);
    }

    #[test]
    fn test_minute_floor_negative() {
        assert_eq!(minute_floor(-1), -NANOS_PER_MIN);
    }

    #[test]
    fn test_grid_for_day() {
        let d = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let grid = MinuteGrid::for_day(d);
        assert_eq!(grid.len(), 1440);
        assert_eq!(date_of(grid.start), d);
        assert_eq!(date_of(grid.end - 1), d);
        assert_eq!(grid.minutes().next(), Some(grid.start));
        assert_eq!(grid.minutes().last(), Some(grid.end - NANOS_PER_MIN));
    }

    #[test]
    fn test_grid_floors_bounds() {
        let grid = MinuteGrid::new(NANOS_PER_MIN + 5, 3 * NANOS_PER_MIN + 7);
        assert_eq!(grid.start, NANOS_PER_MIN);
        assert_eq!(grid.end, 3 * NANOS_PER_MIN);
        assert_eq!(grid.len(), 2);
        assert_eq!(grid.index_of(2 * NANOS_PER_MIN + 1), Some(1));
        assert_eq!(grid.index_of(3 * NANOS_PER_MIN), None);
    }

    #[test]
    fn test_timestamp_roundtrip_text() {
        let t = parse_timestamp("2024-01-02T03:04:00Z").unwrap();
        assert_eq!(format_timestamp(t), "2024-01-02T03:04:00Z");
    }
}
