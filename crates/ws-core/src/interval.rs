//! Half-open time intervals and calendar-day splitting.

use chrono::{DateTime, Days, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::types::ValidationError;

/// A half-open interval `[start, end)` with `start < end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Interval {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Interval {
    /// Creates an interval, rejecting `end <= start`.
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, ValidationError> {
        if end <= start {
            return Err(ValidationError::EmptyInterval);
        }
        Ok(Self { start, end })
    }

    /// Whole seconds covered by the interval.
    #[must_use]
    pub fn seconds(&self) -> i64 {
        self.end.signed_duration_since(self.start).num_seconds()
    }

    /// Whether the two intervals share any instant.
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// The part of `self` inside `window`, if any.
    #[must_use]
    pub fn clip(&self, window: &Self) -> Option<Self> {
        let start = self.start.max(window.start);
        let end = self.end.min(window.end);
        Self::new(start, end).ok()
    }

    /// Raises the start to `floor`, returning `None` when nothing remains.
    ///
    /// Used to keep materialization from re-counting time already behind the
    /// watermark.
    #[must_use]
    pub fn clamp_start(&self, floor: DateTime<Utc>) -> Option<Self> {
        Self::new(self.start.max(floor), self.end).ok()
    }
}

/// The portion of an interval falling on one calendar date.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DayPart {
    pub date: NaiveDate,
    pub seconds: i64,
}

/// Splits an interval at local midnights of `tz`.
///
/// An interval crossing N midnights yields N + 1 parts whose seconds sum to
/// the interval's duration.
pub fn split_by_day<Tz: TimeZone>(interval: &Interval, tz: &Tz) -> Vec<DayPart> {
    let mut parts = Vec::new();
    let mut current = interval.start;
    while current < interval.end {
        let date = current.with_timezone(tz).date_naive();
        let part_end = next_midnight(date, tz)
            .filter(|midnight| *midnight < interval.end)
            .unwrap_or(interval.end);
        parts.push(DayPart {
            date,
            seconds: part_end.signed_duration_since(current).num_seconds(),
        });
        current = part_end;
    }
    parts
}

/// The UTC interval covering the local calendar `date` in `tz`.
pub fn day_bounds<Tz: TimeZone>(date: NaiveDate, tz: &Tz) -> Option<Interval> {
    let start = local_midnight(date, tz)?;
    let end = next_midnight(date, tz)?;
    Interval::new(start, end).ok()
}

fn local_midnight<Tz: TimeZone>(date: NaiveDate, tz: &Tz) -> Option<DateTime<Utc>> {
    let naive = date.and_hms_opt(0, 0, 0)?;
    tz.from_local_datetime(&naive)
        .earliest()
        .map(|local| local.with_timezone(&Utc))
}

fn next_midnight<Tz: TimeZone>(date: NaiveDate, tz: &Tz) -> Option<DateTime<Utc>> {
    local_midnight(date.checked_add_days(Days::new(1))?, tz)
}

/// Why an interval is not covered by offline time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoverageGap {
    /// No offline segment intersects the interval at all.
    NoOfflineTime,
    /// Offline segments leave an uncovered hole starting at this instant.
    UncoveredFrom(DateTime<Utc>),
}

/// Checks that `covering` fully covers `target` with no holes.
///
/// The covering segments need not be sorted and may overlap each other.
pub fn check_coverage(target: &Interval, covering: &[Interval]) -> Result<(), CoverageGap> {
    if covering.is_empty() {
        return Err(CoverageGap::NoOfflineTime);
    }
    let mut sorted = covering.to_vec();
    sorted.sort_by_key(|segment| segment.start);

    let mut cursor = target.start;
    for segment in &sorted {
        if segment.start > cursor {
            return Err(CoverageGap::UncoveredFrom(cursor));
        }
        cursor = cursor.max(segment.end);
        if cursor >= target.end {
            return Ok(());
        }
    }
    Err(CoverageGap::UncoveredFrom(cursor))
}

/// The parts of `target` not covered by any of `holes`, in order.
///
/// The holes need not be sorted and may overlap each other.
#[must_use]
pub fn uncovered_parts(target: &Interval, holes: &[Interval]) -> Vec<Interval> {
    let mut sorted: Vec<Interval> = holes.iter().filter_map(|hole| hole.clip(target)).collect();
    sorted.sort_by_key(|hole| hole.start);

    let mut parts = Vec::new();
    let mut cursor = target.start;
    for hole in &sorted {
        if hole.start > cursor {
            parts.push(Interval {
                start: cursor,
                end: hole.start,
            });
        }
        cursor = cursor.max(hole.end);
    }
    if cursor < target.end {
        parts.push(Interval {
            start: cursor,
            end: target.end,
        });
    }
    parts
}
