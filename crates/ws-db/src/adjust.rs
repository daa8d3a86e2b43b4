//! Manual adjustments: operator corrections that turn recorded offline time
//! into work.
//!
//! An adjustment interval must lie entirely inside the employee's
//! offline-sourced segments and must not touch any other recorded segment.
//! Accepting one moves its seconds from the offline counter to the work
//! counters and inserts a `work`/`manual` segment on top of the offline
//! segment, which stays in place. Revoking reverses exactly that.

use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use serde::Serialize;
use thiserror::Error;
use tracing::info;
use ws_core::{
    AdjustmentStatus, CoverageGap, DailyIncrement, EmployeeCode, Interval, SegmentSource,
    StatusCode, check_coverage, day_bounds,
};

use crate::timeline::{NewSegment, SegmentOwner, accumulate, insert_segment, segments_overlapping};
use crate::{
    Database, DbError, employee_by_code, format_timestamp, parse_timestamp, truncate_to_second,
};

const MANUAL_DESCRIPTION: &str = "manual adjustment";

/// Why an adjustment was refused.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AdjustmentError {
    #[error("adjustment must be fully covered by offline segments (uncovered from {from})")]
    NotCovered { from: DateTime<Utc> },

    #[error("adjustment must be fully covered by offline segments (no offline time in range)")]
    NoOfflineTime,

    #[error("adjustment conflicts with recorded {status} time at {at}")]
    ConflictsWithRecorded { status: StatusCode, at: DateTime<Utc> },

    #[error("adjustment {id} is already revoked")]
    AlreadyRevoked { id: i64 },

    #[error("{field} cannot be empty")]
    MissingText { field: &'static str },
}

impl From<CoverageGap> for AdjustmentError {
    fn from(gap: CoverageGap) -> Self {
        match gap {
            CoverageGap::NoOfflineTime => Self::NoOfflineTime,
            CoverageGap::UncoveredFrom(from) => Self::NotCovered { from },
        }
    }
}

/// An adjustment request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAdjustment {
    pub employee_code: EmployeeCode,
    pub interval: Interval,
    pub reason: String,
    pub note: String,
    pub operator: String,
}

/// A stored adjustment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdjustmentRecord {
    pub id: i64,
    pub employee_code: EmployeeCode,
    pub employee_name: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub reason: String,
    pub note: String,
    pub operator: String,
    pub status: AdjustmentStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AdjustmentRecord {
    pub fn interval(&self) -> Interval {
        Interval {
            start: self.start,
            end: self.end,
        }
    }
}

/// Work gained and offline time given back for `seconds` of adjusted time.
fn manual_increment(seconds: i64) -> DailyIncrement {
    DailyIncrement::for_status(StatusCode::Work, seconds)
        + -DailyIncrement::for_status(StatusCode::Offline, seconds)
}

fn required_text<'a>(field: &'static str, value: &'a str) -> Result<&'a str, AdjustmentError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(AdjustmentError::MissingText { field });
    }
    Ok(trimmed)
}

fn whole_seconds(interval: &Interval) -> Result<Interval, DbError> {
    Ok(Interval::new(
        truncate_to_second(interval.start),
        truncate_to_second(interval.end),
    )?)
}

/// Checks that `interval` sits on offline time only.
fn validate_range(conn: &Connection, employee_id: i64, interval: &Interval) -> Result<(), DbError> {
    let offline: Vec<Interval> =
        segments_overlapping(conn, employee_id, interval, Some(SegmentSource::Offline))?
            .iter()
            .map(|segment| segment.interval())
            .collect();
    check_coverage(interval, &offline).map_err(AdjustmentError::from)?;

    let conflict = segments_overlapping(conn, employee_id, interval, None)?
        .into_iter()
        .find(|segment| segment.source != SegmentSource::Offline);
    if let Some(segment) = conflict {
        return Err(AdjustmentError::ConflictsWithRecorded {
            status: segment.status,
            at: segment.start.max(interval.start),
        }
        .into());
    }
    Ok(())
}

/// Counts the adjustment into daily statistics and inserts its manual segment.
fn apply(
    conn: &Connection,
    employee_id: i64,
    adjustment_id: i64,
    interval: &Interval,
    offset: &FixedOffset,
) -> Result<(), DbError> {
    accumulate(conn, employee_id, interval, offset, manual_increment)?;
    let segment = NewSegment {
        interval: *interval,
        status: StatusCode::Work,
        description: MANUAL_DESCRIPTION,
        source: SegmentSource::Manual,
    };
    insert_segment(conn, employee_id, &segment, SegmentOwner::Adjustment(adjustment_id))?;
    Ok(())
}

fn reverse(
    conn: &Connection,
    employee_id: i64,
    adjustment_id: i64,
    interval: &Interval,
    offset: &FixedOffset,
) -> Result<(), DbError> {
    conn.execute(
        "DELETE FROM time_segments WHERE adjustment_id = ? AND source = ?",
        params![adjustment_id, SegmentSource::Manual.as_str()],
    )?;
    accumulate(conn, employee_id, interval, offset, |seconds| -manual_increment(seconds))
}

impl Database {
    /// Records an adjustment and moves its time from offline to work.
    pub fn add_adjustment(
        &mut self,
        request: &NewAdjustment,
        now: DateTime<Utc>,
    ) -> Result<AdjustmentRecord, DbError> {
        let reason = required_text("reason", &request.reason)?;
        let note = required_text("note", &request.note)?;
        let operator = required_text("operator", &request.operator)?;
        let interval = whole_seconds(&request.interval)?;
        let now = format_timestamp(truncate_to_second(now));
        let offset = self.settings.utc_offset;

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let employee = employee_by_code(&tx, &request.employee_code)?;
        validate_range(&tx, employee.id, &interval)?;

        tx.execute(
            "
            INSERT INTO manual_adjustments
                (employee_id, start_at, end_at, reason, note, operator, status, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
            ",
            params![
                employee.id,
                format_timestamp(interval.start),
                format_timestamp(interval.end),
                reason,
                note,
                operator,
                AdjustmentStatus::Active.as_str(),
                now,
            ],
        )?;
        let id = tx.last_insert_rowid();
        apply(&tx, employee.id, id, &interval, &offset)?;
        tx.commit()?;

        info!(
            id,
            employee = %request.employee_code,
            start = %interval.start,
            end = %interval.end,
            operator,
            "manual adjustment added"
        );
        self.adjustment(id)
    }

    /// Moves an active adjustment to `interval`, replacing its reason and note.
    ///
    /// The old interval is reversed before the new one is validated, so an
    /// adjustment may be moved onto time it previously covered.
    pub fn update_adjustment(
        &mut self,
        id: i64,
        interval: &Interval,
        reason: &str,
        note: &str,
        now: DateTime<Utc>,
    ) -> Result<AdjustmentRecord, DbError> {
        let reason = required_text("reason", reason)?;
        let note = required_text("note", note)?;
        let interval = whole_seconds(interval)?;
        let offset = self.settings.utc_offset;

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current = active_adjustment(&tx, id)?;
        reverse(&tx, current.employee_id, id, &current.interval, &offset)?;
        validate_range(&tx, current.employee_id, &interval)?;
        tx.execute(
            "
            UPDATE manual_adjustments
            SET start_at = ?, end_at = ?, reason = ?, note = ?, updated_at = ?
            WHERE id = ?
            ",
            params![
                format_timestamp(interval.start),
                format_timestamp(interval.end),
                reason,
                note,
                format_timestamp(truncate_to_second(now)),
                id,
            ],
        )?;
        apply(&tx, current.employee_id, id, &interval, &offset)?;
        tx.commit()?;

        info!(id, start = %interval.start, end = %interval.end, "manual adjustment updated");
        self.adjustment(id)
    }

    /// Revokes an active adjustment, giving its time back to offline.
    pub fn revoke_adjustment(
        &mut self,
        id: i64,
        now: DateTime<Utc>,
    ) -> Result<AdjustmentRecord, DbError> {
        let offset = self.settings.utc_offset;
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current = active_adjustment(&tx, id)?;
        reverse(&tx, current.employee_id, id, &current.interval, &offset)?;
        tx.execute(
            "UPDATE manual_adjustments SET status = ?, updated_at = ? WHERE id = ?",
            params![
                AdjustmentStatus::Revoked.as_str(),
                format_timestamp(truncate_to_second(now)),
                id,
            ],
        )?;
        tx.commit()?;

        info!(id, "manual adjustment revoked");
        self.adjustment(id)
    }

    /// Looks up one adjustment.
    pub fn adjustment(&self, id: i64) -> Result<AdjustmentRecord, DbError> {
        let row = self
            .conn
            .query_row(
                &format!("{ADJUSTMENT_SELECT} WHERE a.id = ?"),
                params![id],
                adjustment_row,
            )
            .optional()?;
        row.ok_or(DbError::NotFound {
            entity: "adjustment",
            id,
        })?
        .into_record()
    }

    /// Adjustments ordered by start, optionally for one employee and/or
    /// intersecting one local day.
    pub fn list_adjustments(
        &self,
        code: Option<&EmployeeCode>,
        date: Option<NaiveDate>,
    ) -> Result<Vec<AdjustmentRecord>, DbError> {
        let employee_id = code
            .map(|code| employee_by_code(&self.conn, code).map(|employee| employee.id))
            .transpose()?;
        let day = match date {
            Some(date) => match day_bounds(date, &self.settings.utc_offset) {
                Some(day) => Some(day),
                None => return Ok(Vec::new()),
            },
            None => None,
        };

        let mut stmt = self.conn.prepare(&format!(
            "{ADJUSTMENT_SELECT}
            WHERE (?1 IS NULL OR a.employee_id = ?1)
              AND (?2 IS NULL OR a.start_at < ?2)
              AND (?3 IS NULL OR a.end_at > ?3)
            ORDER BY a.start_at ASC, a.id ASC"
        ))?;
        let rows = stmt.query_map(
            params![
                employee_id,
                day.map(|day| format_timestamp(day.end)),
                day.map(|day| format_timestamp(day.start)),
            ],
            adjustment_row,
        )?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?.into_record()?);
        }
        Ok(records)
    }
}

struct ActiveAdjustment {
    employee_id: i64,
    interval: Interval,
}

fn active_adjustment(conn: &Connection, id: i64) -> Result<ActiveAdjustment, DbError> {
    let row: Option<(i64, String, String, String)> = conn
        .query_row(
            "SELECT employee_id, start_at, end_at, status FROM manual_adjustments WHERE id = ?",
            params![id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )
        .optional()?;
    let Some((employee_id, start, end, status)) = row else {
        return Err(DbError::NotFound {
            entity: "adjustment",
            id,
        });
    };
    if status.parse::<AdjustmentStatus>()? != AdjustmentStatus::Active {
        return Err(AdjustmentError::AlreadyRevoked { id }.into());
    }
    Ok(ActiveAdjustment {
        employee_id,
        interval: Interval::new(parse_timestamp(&start)?, parse_timestamp(&end)?)?,
    })
}

const ADJUSTMENT_SELECT: &str = "
    SELECT a.id, e.code, e.name, a.start_at, a.end_at, a.reason, a.note, a.operator,
           a.status, a.created_at, a.updated_at
    FROM manual_adjustments a
    JOIN employees e ON e.id = a.employee_id
";

struct AdjustmentRow {
    id: i64,
    code: String,
    name: String,
    start_at: String,
    end_at: String,
    reason: String,
    note: String,
    operator: String,
    status: String,
    created_at: String,
    updated_at: String,
}

fn adjustment_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AdjustmentRow> {
    Ok(AdjustmentRow {
        id: row.get(0)?,
        code: row.get(1)?,
        name: row.get(2)?,
        start_at: row.get(3)?,
        end_at: row.get(4)?,
        reason: row.get(5)?,
        note: row.get(6)?,
        operator: row.get(7)?,
        status: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

impl AdjustmentRow {
    fn into_record(self) -> Result<AdjustmentRecord, DbError> {
        Ok(AdjustmentRecord {
            id: self.id,
            employee_code: EmployeeCode::new(self.code)?,
            employee_name: self.name,
            start: parse_timestamp(&self.start_at)?,
            end: parse_timestamp(&self.end_at)?,
            reason: self.reason,
            note: self.note,
            operator: self.operator,
            status: self.status.parse()?,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
        })
    }
}
