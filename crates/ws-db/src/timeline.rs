//! Segment writing, daily statistic accumulation and timeline queries.
//!
//! Every materialization of reported time goes through [`materialize`]: the
//! interval is clamped to the watermark, written as a segment (merging with
//! the previous one where legal), counted into daily statistics and then the
//! watermark is advanced. Callers run it inside a transaction so a failure at
//! any step leaves no partial state.

use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use tracing::debug;
use ws_core::{
    DailyIncrement, DailyStats, EmployeeCode, Interval, SegmentSource, StatusCode, day_bounds,
    split_by_day,
};

use crate::{Database, DbError, employee_by_code, format_date, format_timestamp, parse_timestamp};

/// An interval to be recorded on an employee's timeline.
#[derive(Debug, Clone, Copy)]
pub(crate) struct NewSegment<'a> {
    pub interval: Interval,
    pub status: StatusCode,
    pub description: &'a str,
    pub source: SegmentSource,
}

/// The correction record a segment belongs to, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SegmentOwner {
    Reported,
    Adjustment(i64),
    Incident(i64),
}

/// How a segment write landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentWrite {
    /// The previous segment was extended in place.
    Merged { id: i64 },
    /// A new segment row was inserted.
    Inserted { id: i64 },
}

/// A stored time segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentRecord {
    pub id: i64,
    pub employee_code: EmployeeCode,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub status: StatusCode,
    pub description: String,
    pub source: SegmentSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adjustment_id: Option<i64>,
}

impl SegmentRecord {
    pub fn interval(&self) -> Interval {
        Interval {
            start: self.start,
            end: self.end,
        }
    }
}

/// Writes a segment, extending the employee's latest reported segment when it
/// ends exactly at `segment.interval.start` with identical status, source and
/// description. Adjustment and incident overlays are never extended.
pub(crate) fn write_segment(
    conn: &Connection,
    employee_id: i64,
    segment: &NewSegment<'_>,
) -> Result<SegmentWrite, DbError> {
    let start = format_timestamp(segment.interval.start);
    let end = format_timestamp(segment.interval.end);
    let description = segment.description.trim();

    let last = conn
        .query_row(
            "
            SELECT id, end_at, status, description, source
            FROM time_segments
            WHERE employee_id = ? AND adjustment_id IS NULL AND incident_id IS NULL
            ORDER BY end_at DESC, id DESC
            LIMIT 1
            ",
            params![employee_id],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            },
        )
        .optional()?;

    if let Some((id, last_end, last_status, last_description, last_source)) = last {
        let mergeable = last_end == start
            && last_status == segment.status.as_str()
            && last_source == segment.source.as_str()
            && last_description.trim() == description;
        if mergeable {
            let updated = conn.execute(
                "UPDATE time_segments SET end_at = ?1 WHERE id = ?2 AND end_at = ?3",
                params![end, id, last_end],
            )?;
            if updated > 0 {
                return Ok(SegmentWrite::Merged { id });
            }
        }
    }

    let id = insert_segment(conn, employee_id, segment, SegmentOwner::Reported)?;
    Ok(SegmentWrite::Inserted { id })
}

/// Inserts a segment row without attempting to merge.
pub(crate) fn insert_segment(
    conn: &Connection,
    employee_id: i64,
    segment: &NewSegment<'_>,
    owner: SegmentOwner,
) -> Result<i64, DbError> {
    let (adjustment_id, incident_id) = match owner {
        SegmentOwner::Reported => (None, None),
        SegmentOwner::Adjustment(id) => (Some(id), None),
        SegmentOwner::Incident(id) => (None, Some(id)),
    };
    conn.execute(
        "
        INSERT INTO time_segments
            (employee_id, start_at, end_at, status, description, source, adjustment_id, incident_id)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        ",
        params![
            employee_id,
            format_timestamp(segment.interval.start),
            format_timestamp(segment.interval.end),
            segment.status.as_str(),
            segment.description.trim(),
            segment.source.as_str(),
            adjustment_id,
            incident_id,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Adds per-day increments for `interval`, split at midnights of `offset`.
///
/// `increment` maps the seconds falling on one day to that day's deltas;
/// all-zero deltas are skipped.
pub(crate) fn accumulate(
    conn: &Connection,
    employee_id: i64,
    interval: &Interval,
    offset: &FixedOffset,
    increment: impl Fn(i64) -> DailyIncrement,
) -> Result<(), DbError> {
    let mut stmt = conn.prepare_cached(
        "
        INSERT INTO daily_stats
            (employee_id, stat_date, work_seconds, normal_seconds, fish_seconds, idle_seconds,
             offline_seconds, attendance_seconds, effective_seconds)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(employee_id, stat_date) DO UPDATE SET
            work_seconds = work_seconds + excluded.work_seconds,
            normal_seconds = normal_seconds + excluded.normal_seconds,
            fish_seconds = fish_seconds + excluded.fish_seconds,
            idle_seconds = idle_seconds + excluded.idle_seconds,
            offline_seconds = offline_seconds + excluded.offline_seconds,
            attendance_seconds = attendance_seconds + excluded.attendance_seconds,
            effective_seconds = effective_seconds + excluded.effective_seconds
        ",
    )?;
    for part in split_by_day(interval, offset) {
        let inc = increment(part.seconds);
        if inc.is_zero() {
            continue;
        }
        stmt.execute(params![
            employee_id,
            format_date(part.date),
            inc.work,
            inc.normal,
            inc.fish,
            inc.idle,
            inc.offline,
            inc.attendance,
            inc.effective,
        ])?;
    }
    Ok(())
}

/// Moves the watermark forward to `to`; never moves it backwards.
pub(crate) fn advance_watermark(
    conn: &Connection,
    employee_id: i64,
    to: DateTime<Utc>,
) -> Result<(), DbError> {
    conn.execute(
        "
        UPDATE employees
        SET watermark = CASE WHEN watermark IS NULL OR watermark < ?1 THEN ?1 ELSE watermark END
        WHERE id = ?2
        ",
        params![format_timestamp(to), employee_id],
    )?;
    Ok(())
}

/// Records `segment` on the timeline: clamps it to the watermark, writes the
/// segment, counts its statistics and advances the watermark.
///
/// Returns the interval actually materialized, or `None` when it lay entirely
/// behind the watermark.
pub(crate) fn materialize(
    conn: &Connection,
    employee_id: i64,
    watermark: Option<DateTime<Utc>>,
    segment: NewSegment<'_>,
    offset: &FixedOffset,
) -> Result<Option<Interval>, DbError> {
    let interval = match watermark {
        Some(floor) => segment.interval.clamp_start(floor),
        None => Some(segment.interval),
    };
    let Some(interval) = interval else {
        debug!(
            employee_id,
            start = %segment.interval.start,
            end = %segment.interval.end,
            "interval already behind watermark, skipping"
        );
        return Ok(None);
    };

    let segment = NewSegment { interval, ..segment };
    let write = write_segment(conn, employee_id, &segment)?;
    accumulate(conn, employee_id, &interval, offset, |seconds| {
        DailyIncrement::for_status(segment.status, seconds)
    })?;
    advance_watermark(conn, employee_id, interval.end)?;
    debug!(
        employee_id,
        status = %segment.status,
        source = %segment.source,
        seconds = interval.seconds(),
        ?write,
        "materialized interval"
    );
    Ok(Some(interval))
}

const SEGMENT_SELECT: &str = "
    SELECT s.id, e.code, s.start_at, s.end_at, s.status, s.description, s.source, s.adjustment_id
    FROM time_segments s
    JOIN employees e ON e.id = s.employee_id
";

type SegmentRow = (i64, String, String, String, String, String, String, Option<i64>);

fn segment_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SegmentRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
    ))
}

fn into_segment(row: SegmentRow) -> Result<SegmentRecord, DbError> {
    let (id, code, start, end, status, description, source, adjustment_id) = row;
    Ok(SegmentRecord {
        id,
        employee_code: EmployeeCode::new(code)?,
        start: parse_timestamp(&start)?,
        end: parse_timestamp(&end)?,
        status: status.parse()?,
        description,
        source: source.parse()?,
        adjustment_id,
    })
}

/// Segments of one employee intersecting `window`, ordered by start.
///
/// With `source` set, only segments of that source are returned.
pub(crate) fn segments_overlapping(
    conn: &Connection,
    employee_id: i64,
    window: &Interval,
    source: Option<SegmentSource>,
) -> Result<Vec<SegmentRecord>, DbError> {
    let mut stmt = conn.prepare_cached(&format!(
        "{SEGMENT_SELECT}
        WHERE s.employee_id = ?1 AND s.start_at < ?2 AND s.end_at > ?3
          AND (?4 IS NULL OR s.source = ?4)
        ORDER BY s.start_at ASC, s.id ASC"
    ))?;
    let rows = stmt.query_map(
        params![
            employee_id,
            format_timestamp(window.end),
            format_timestamp(window.start),
            source.map(|s| s.as_str()),
        ],
        segment_row,
    )?;
    let mut segments = Vec::new();
    for row in rows {
        segments.push(into_segment(row?)?);
    }
    Ok(segments)
}

impl Database {
    /// Segments of one employee intersecting `window`, ordered by start.
    pub fn segments(
        &self,
        code: &EmployeeCode,
        window: &Interval,
    ) -> Result<Vec<SegmentRecord>, DbError> {
        let employee = employee_by_code(&self.conn, code)?;
        segments_overlapping(&self.conn, employee.id, window, None)
    }

    /// Offline-sourced segments of every employee intersecting local `date`.
    pub fn offline_segments_on(&self, date: NaiveDate) -> Result<Vec<SegmentRecord>, DbError> {
        let Some(day) = day_bounds(date, &self.settings.utc_offset) else {
            return Ok(Vec::new());
        };
        let mut stmt = self.conn.prepare(&format!(
            "{SEGMENT_SELECT}
            WHERE s.source = ?1 AND s.start_at < ?2 AND s.end_at > ?3
            ORDER BY e.code ASC, s.start_at ASC"
        ))?;
        let rows = stmt.query_map(
            params![
                SegmentSource::Offline.as_str(),
                format_timestamp(day.end),
                format_timestamp(day.start),
            ],
            segment_row,
        )?;
        let mut segments = Vec::new();
        for row in rows {
            segments.push(into_segment(row?)?);
        }
        Ok(segments)
    }

    /// The daily statistic bucket of an employee, zero when never touched.
    pub fn daily_stats(&self, code: &EmployeeCode, date: NaiveDate) -> Result<DailyStats, DbError> {
        let employee = employee_by_code(&self.conn, code)?;
        let stats = self
            .conn
            .query_row(
                "
                SELECT work_seconds, normal_seconds, fish_seconds, idle_seconds,
                       offline_seconds, attendance_seconds, effective_seconds
                FROM daily_stats
                WHERE employee_id = ? AND stat_date = ?
                ",
                params![employee.id, format_date(date)],
                |row| {
                    Ok(DailyStats {
                        date,
                        work_seconds: row.get(0)?,
                        normal_seconds: row.get(1)?,
                        fish_seconds: row.get(2)?,
                        idle_seconds: row.get(3)?,
                        offline_seconds: row.get(4)?,
                        attendance_seconds: row.get(5)?,
                        effective_seconds: row.get(6)?,
                    })
                },
            )
            .optional()?;
        Ok(stats.unwrap_or_else(|| DailyStats::empty(date)))
    }
}
