//! System incidents: outage windows during which offline time is excused.
//!
//! An incident covers every employee. Recording one turns the recorded
//! offline time inside its window into `incident` segments, laid on top of
//! the offline segments the same way manual adjustments are, and takes those
//! seconds out of the offline counter. Incident time counts toward nothing.
//! Offline time already backfilled by an adjustment is left alone.
//!
//! Only offline time recorded when the incident is added or updated is
//! excused; updating an incident re-applies it to the current timeline.

use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};
use ws_core::{
    AdjustmentStatus, DailyIncrement, Interval, SegmentSource, StatusCode, day_bounds,
    uncovered_parts,
};

use crate::timeline::{NewSegment, SegmentOwner, accumulate, insert_segment, segments_overlapping};
use crate::{Database, DbError, format_timestamp, parse_timestamp, truncate_to_second};

/// Why an incident change was refused.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IncidentError {
    #[error("incident {id} is already revoked")]
    AlreadyRevoked { id: i64 },

    #[error("incident reason cannot be empty")]
    MissingReason,
}

/// An incident request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewIncident {
    pub interval: Interval,
    pub reason: String,
    pub note: String,
}

/// A stored incident with the time it excused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IncidentRecord {
    pub id: i64,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub reason: String,
    pub note: String,
    pub status: AdjustmentStatus,
    /// Employees with excused time.
    pub employees: i64,
    /// Offline seconds currently excused across all employees.
    pub excused_seconds: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl IncidentRecord {
    pub fn interval(&self) -> Interval {
        Interval {
            start: self.start,
            end: self.end,
        }
    }
}

/// Offline time handed back for `seconds` of incident time.
fn incident_increment(seconds: i64) -> DailyIncrement {
    DailyIncrement::for_status(StatusCode::Incident, seconds)
        + -DailyIncrement::for_status(StatusCode::Offline, seconds)
}

fn whole_seconds(interval: &Interval) -> Result<Interval, DbError> {
    Ok(Interval::new(
        truncate_to_second(interval.start),
        truncate_to_second(interval.end),
    )?)
}

fn required_reason(reason: &str) -> Result<&str, IncidentError> {
    let trimmed = reason.trim();
    if trimmed.is_empty() {
        return Err(IncidentError::MissingReason);
    }
    Ok(trimmed)
}

fn employees_offline_during(conn: &Connection, window: &Interval) -> Result<Vec<i64>, DbError> {
    let mut stmt = conn.prepare_cached(
        "
        SELECT DISTINCT employee_id FROM time_segments
        WHERE source = ?1 AND start_at < ?2 AND end_at > ?3
        ORDER BY employee_id
        ",
    )?;
    let rows = stmt.query_map(
        params![
            SegmentSource::Offline.as_str(),
            format_timestamp(window.end),
            format_timestamp(window.start),
        ],
        |row| row.get::<_, i64>(0),
    )?;
    let mut ids = Vec::new();
    for row in rows {
        ids.push(row?);
    }
    Ok(ids)
}

/// Lays incident segments over the uncorrected offline time in `window` and
/// returns the seconds excused.
fn apply(
    conn: &Connection,
    incident_id: i64,
    window: &Interval,
    description: &str,
    offset: &FixedOffset,
) -> Result<i64, DbError> {
    let mut excused = 0;
    for employee_id in employees_offline_during(conn, window)? {
        let segments = segments_overlapping(conn, employee_id, window, None)?;
        let corrected: Vec<Interval> = segments
            .iter()
            .filter(|segment| segment.source != SegmentSource::Offline)
            .map(|segment| segment.interval())
            .collect();
        let offline = segments
            .iter()
            .filter(|segment| segment.source == SegmentSource::Offline)
            .filter_map(|segment| segment.interval().clip(window));

        for piece in offline {
            for part in uncovered_parts(&piece, &corrected) {
                let segment = NewSegment {
                    interval: part,
                    status: StatusCode::Incident,
                    description,
                    source: SegmentSource::Incident,
                };
                insert_segment(conn, employee_id, &segment, SegmentOwner::Incident(incident_id))?;
                accumulate(conn, employee_id, &part, offset, incident_increment)?;
                excused += part.seconds();
            }
        }
    }
    debug!(incident_id, excused, "incident applied");
    Ok(excused)
}

/// Removes the incident's segments, handing their time back to offline.
fn reverse(conn: &Connection, incident_id: i64, offset: &FixedOffset) -> Result<(), DbError> {
    let owned: Vec<(i64, Interval)> = {
        let mut stmt = conn.prepare_cached(
            "SELECT employee_id, start_at, end_at FROM time_segments WHERE incident_id = ?",
        )?;
        let rows = stmt.query_map(params![incident_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;
        let mut owned = Vec::new();
        for row in rows {
            let (employee_id, start, end) = row?;
            owned.push((
                employee_id,
                Interval::new(parse_timestamp(&start)?, parse_timestamp(&end)?)?,
            ));
        }
        owned
    };

    for (employee_id, interval) in &owned {
        accumulate(conn, *employee_id, interval, offset, |seconds| {
            -incident_increment(seconds)
        })?;
    }
    conn.execute(
        "DELETE FROM time_segments WHERE incident_id = ? AND source = ?",
        params![incident_id, SegmentSource::Incident.as_str()],
    )?;
    Ok(())
}

fn active_incident(conn: &Connection, id: i64) -> Result<(), DbError> {
    let status: Option<String> = conn
        .query_row(
            "SELECT status FROM system_incidents WHERE id = ?",
            params![id],
            |row| row.get(0),
        )
        .optional()?;
    let Some(status) = status else {
        return Err(DbError::NotFound {
            entity: "incident",
            id,
        });
    };
    if status.parse::<AdjustmentStatus>()? != AdjustmentStatus::Active {
        return Err(IncidentError::AlreadyRevoked { id }.into());
    }
    Ok(())
}

impl Database {
    /// Records an incident and excuses the offline time inside it.
    pub fn add_incident(
        &mut self,
        request: &NewIncident,
        now: DateTime<Utc>,
    ) -> Result<IncidentRecord, DbError> {
        let reason = required_reason(&request.reason)?;
        let note = request.note.trim();
        let interval = whole_seconds(&request.interval)?;
        let now = format_timestamp(truncate_to_second(now));
        let offset = self.settings.utc_offset;

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "
            INSERT INTO system_incidents (start_at, end_at, reason, note, status, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
            ",
            params![
                format_timestamp(interval.start),
                format_timestamp(interval.end),
                reason,
                note,
                AdjustmentStatus::Active.as_str(),
                now,
            ],
        )?;
        let id = tx.last_insert_rowid();
        let excused = apply(&tx, id, &interval, reason, &offset)?;
        tx.commit()?;

        info!(
            id,
            start = %interval.start,
            end = %interval.end,
            excused_seconds = excused,
            "system incident added"
        );
        self.incident(id)
    }

    /// Moves an active incident to a new window, replacing its reason and note.
    pub fn update_incident(
        &mut self,
        id: i64,
        request: &NewIncident,
        now: DateTime<Utc>,
    ) -> Result<IncidentRecord, DbError> {
        let reason = required_reason(&request.reason)?;
        let interval = whole_seconds(&request.interval)?;
        let offset = self.settings.utc_offset;

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        active_incident(&tx, id)?;
        reverse(&tx, id, &offset)?;
        tx.execute(
            "
            UPDATE system_incidents
            SET start_at = ?, end_at = ?, reason = ?, note = ?, updated_at = ?
            WHERE id = ?
            ",
            params![
                format_timestamp(interval.start),
                format_timestamp(interval.end),
                reason,
                request.note.trim(),
                format_timestamp(truncate_to_second(now)),
                id,
            ],
        )?;
        let excused = apply(&tx, id, &interval, reason, &offset)?;
        tx.commit()?;

        info!(
            id,
            start = %interval.start,
            end = %interval.end,
            excused_seconds = excused,
            "system incident updated"
        );
        self.incident(id)
    }

    /// Revokes an active incident, giving its time back to offline.
    pub fn revoke_incident(
        &mut self,
        id: i64,
        now: DateTime<Utc>,
    ) -> Result<IncidentRecord, DbError> {
        let offset = self.settings.utc_offset;
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        active_incident(&tx, id)?;
        reverse(&tx, id, &offset)?;
        tx.execute(
            "UPDATE system_incidents SET status = ?, updated_at = ? WHERE id = ?",
            params![
                AdjustmentStatus::Revoked.as_str(),
                format_timestamp(truncate_to_second(now)),
                id,
            ],
        )?;
        tx.commit()?;

        info!(id, "system incident revoked");
        self.incident(id)
    }

    /// Looks up one incident.
    pub fn incident(&self, id: i64) -> Result<IncidentRecord, DbError> {
        let row = self
            .conn
            .query_row(&format!("{INCIDENT_SELECT} WHERE i.id = ?"), params![id], incident_row)
            .optional()?;
        row.ok_or(DbError::NotFound {
            entity: "incident",
            id,
        })?
        .into_record()
    }

    /// Incidents ordered by start, optionally only those intersecting one
    /// local day.
    pub fn list_incidents(&self, date: Option<NaiveDate>) -> Result<Vec<IncidentRecord>, DbError> {
        let day = match date {
            Some(date) => match day_bounds(date, &self.settings.utc_offset) {
                Some(day) => Some(day),
                None => return Ok(Vec::new()),
            },
            None => None,
        };

        let mut stmt = self.conn.prepare(&format!(
            "{INCIDENT_SELECT}
            WHERE (?1 IS NULL OR i.start_at < ?1)
              AND (?2 IS NULL OR i.end_at > ?2)
            ORDER BY i.start_at ASC, i.id ASC"
        ))?;
        let rows = stmt.query_map(
            params![
                day.map(|day| format_timestamp(day.end)),
                day.map(|day| format_timestamp(day.start)),
            ],
            incident_row,
        )?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?.into_record()?);
        }
        Ok(records)
    }
}

const INCIDENT_SELECT: &str = "
    SELECT i.id, i.start_at, i.end_at, i.reason, i.note, i.status, i.created_at, i.updated_at,
           (SELECT COUNT(DISTINCT s.employee_id) FROM time_segments s WHERE s.incident_id = i.id),
           (SELECT COALESCE(SUM(CAST(strftime('%s', s.end_at) AS INTEGER)
                                - CAST(strftime('%s', s.start_at) AS INTEGER)), 0)
              FROM time_segments s WHERE s.incident_id = i.id)
    FROM system_incidents i
";

struct IncidentRow {
    id: i64,
    start_at: String,
    end_at: String,
    reason: String,
    note: String,
    status: String,
    created_at: String,
    updated_at: String,
    employees: i64,
    excused_seconds: i64,
}

fn incident_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<IncidentRow> {
    Ok(IncidentRow {
        id: row.get(0)?,
        start_at: row.get(1)?,
        end_at: row.get(2)?,
        reason: row.get(3)?,
        note: row.get(4)?,
        status: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
        employees: row.get(8)?,
        excused_seconds: row.get(9)?,
    })
}

impl IncidentRow {
    fn into_record(self) -> Result<IncidentRecord, DbError> {
        Ok(IncidentRecord {
            id: self.id,
            start: parse_timestamp(&self.start_at)?,
            end: parse_timestamp(&self.end_at)?,
            reason: self.reason,
            note: self.note,
            status: self.status.parse()?,
            employees: self.employees,
            excused_seconds: self.excused_seconds,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::Offset;
    use ws_core::{DailyStats, EmployeeCode};

    use crate::adjust::NewAdjustment;
    use crate::master::MasterData;
    use crate::test_support::{seeded_db, ts};
    use crate::timeline::materialize;

    fn iv(start: &str, end: &str) -> Interval {
        Interval::new(ts(start), ts(end)).unwrap()
    }

    fn code(value: &str) -> EmployeeCode {
        EmployeeCode::new(value).unwrap()
    }

    fn march_first() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, 1).unwrap()
    }

    fn now() -> DateTime<Utc> {
        ts("2025-03-02T08:00:00Z")
    }

    fn record(db: &Database, employee_id: i64, interval: Interval, status: StatusCode) {
        let source = match status {
            StatusCode::Offline => SegmentSource::Offline,
            _ => SegmentSource::System,
        };
        materialize(
            &db.conn,
            employee_id,
            None,
            NewSegment {
                interval,
                status,
                description: "",
                source,
            },
            &Utc.fix(),
        )
        .unwrap();
    }

    /// E001 offline 09:00-12:00, E002 offline 10:00-11:00 then working.
    fn db_with_outage() -> Database {
        let mut db = seeded_db();
        let data: MasterData =
            serde_json::from_str(r#"{"employees": [{"code": "E002", "name": "Grace"}]}"#).unwrap();
        db.import_master_data(&data).unwrap();
        let grace = db.employee(&code("E002")).unwrap().id;

        record(&db, 1, iv("2025-03-01T09:00:00Z", "2025-03-01T12:00:00Z"), StatusCode::Offline);
        record(&db, grace, iv("2025-03-01T10:00:00Z", "2025-03-01T11:00:00Z"), StatusCode::Offline);
        record(&db, grace, iv("2025-03-01T11:00:00Z", "2025-03-01T12:00:00Z"), StatusCode::Work);
        db
    }

    fn outage(interval: Interval) -> NewIncident {
        NewIncident {
            interval,
            reason: "VPN down".to_string(),
            note: String::new(),
        }
    }

    fn stats(db: &Database, employee: &str) -> DailyStats {
        db.daily_stats(&code(employee), march_first()).unwrap()
    }

    #[test]
    fn incident_excuses_offline_time_of_every_employee() {
        let mut db = db_with_outage();
        let ada_before = stats(&db, "E001");
        let grace_before = stats(&db, "E002");

        let incident = db
            .add_incident(&outage(iv("2025-03-01T10:30:00Z", "2025-03-01T11:30:00Z")), now())
            .unwrap();
        assert_eq!(incident.status, AdjustmentStatus::Active);
        assert_eq!(incident.employees, 2);
        assert_eq!(incident.excused_seconds, 3600 + 1800);

        let ada = stats(&db, "E001");
        assert_eq!(ada.offline_seconds, ada_before.offline_seconds - 3600);
        assert_eq!(ada.work_seconds, ada_before.work_seconds);
        assert_eq!(ada.attendance_seconds, ada_before.attendance_seconds);

        // Grace was working from 11:00, only her offline half hour is excused
        let grace = stats(&db, "E002");
        assert_eq!(grace.offline_seconds, grace_before.offline_seconds - 1800);
        assert_eq!(grace.work_seconds, grace_before.work_seconds);

        let window = iv("2025-03-01T00:00:00Z", "2025-03-02T00:00:00Z");
        let grace_incident: Vec<_> = db
            .segments(&code("E002"), &window)
            .unwrap()
            .into_iter()
            .filter(|segment| segment.source == SegmentSource::Incident)
            .collect();
        assert_eq!(grace_incident.len(), 1);
        assert_eq!(grace_incident[0].status, StatusCode::Incident);
        assert_eq!(grace_incident[0].interval(), iv("2025-03-01T10:30:00Z", "2025-03-01T11:00:00Z"));
        assert_eq!(grace_incident[0].description, "VPN down");
    }

    #[test]
    fn adjusted_time_is_not_excused_twice() {
        let mut db = db_with_outage();
        db.add_adjustment(
            &NewAdjustment {
                employee_code: code("E001"),
                interval: iv("2025-03-01T09:30:00Z", "2025-03-01T10:00:00Z"),
                reason: "client site".to_string(),
                note: "confirmed".to_string(),
                operator: "hr-admin".to_string(),
            },
            now(),
        )
        .unwrap();
        let before = stats(&db, "E001");

        let incident = db
            .add_incident(&outage(iv("2025-03-01T09:00:00Z", "2025-03-01T10:30:00Z")), now())
            .unwrap();
        let after = stats(&db, "E001");
        assert_eq!(after.offline_seconds, before.offline_seconds - 3600);
        assert_eq!(after.work_seconds, before.work_seconds);
        // 3600 for E001 plus 1800 for E002
        assert_eq!(incident.excused_seconds, 5400);

        // An adjustment over excused time conflicts with the incident
        let err = db
            .add_adjustment(
                &NewAdjustment {
                    employee_code: code("E001"),
                    interval: iv("2025-03-01T09:00:00Z", "2025-03-01T09:15:00Z"),
                    reason: "r".to_string(),
                    note: "n".to_string(),
                    operator: "hr-admin".to_string(),
                },
                now(),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            DbError::Adjustment(crate::AdjustmentError::ConflictsWithRecorded {
                status: StatusCode::Incident,
                ..
            })
        ));
    }

    #[test]
    fn revoke_hands_time_back_to_offline() {
        let mut db = db_with_outage();
        let before = stats(&db, "E001");
        let incident = db
            .add_incident(&outage(iv("2025-03-01T09:00:00Z", "2025-03-01T12:00:00Z")), now())
            .unwrap();
        assert_eq!(stats(&db, "E001").offline_seconds, 0);

        let revoked = db.revoke_incident(incident.id, now()).unwrap();
        assert_eq!(revoked.status, AdjustmentStatus::Revoked);
        assert_eq!(revoked.excused_seconds, 0);
        assert_eq!(stats(&db, "E001"), before);

        let again = db.revoke_incident(incident.id, now()).unwrap_err();
        assert!(matches!(
            again,
            DbError::Incident(IncidentError::AlreadyRevoked { id }) if id == incident.id
        ));
    }

    #[test]
    fn update_reapplies_to_the_new_window() {
        let mut db = db_with_outage();
        let before = stats(&db, "E001");
        let incident = db
            .add_incident(&outage(iv("2025-03-01T09:00:00Z", "2025-03-01T10:00:00Z")), now())
            .unwrap();

        let mut moved = outage(iv("2025-03-01T11:00:00Z", "2025-03-01T12:00:00Z"));
        moved.note = "second wave".to_string();
        let updated = db.update_incident(incident.id, &moved, now()).unwrap();
        assert_eq!(updated.interval(), moved.interval);
        assert_eq!(updated.note, "second wave");
        assert_eq!(updated.employees, 1);
        assert_eq!(updated.excused_seconds, 3600);
        assert_eq!(stats(&db, "E001").offline_seconds, before.offline_seconds - 3600);
    }

    #[test]
    fn offline_time_keeps_extending_under_an_incident() {
        let mut db = db_with_outage();
        db.add_incident(&outage(iv("2025-03-01T11:00:00Z", "2025-03-01T12:00:00Z")), now())
            .unwrap();
        record(&db, 1, iv("2025-03-01T12:00:00Z", "2025-03-01T13:00:00Z"), StatusCode::Offline);

        let offline: Vec<_> = db
            .segments(&code("E001"), &iv("2025-03-01T00:00:00Z", "2025-03-02T00:00:00Z"))
            .unwrap()
            .into_iter()
            .filter(|segment| segment.source == SegmentSource::Offline)
            .collect();
        assert_eq!(offline.len(), 1);
        assert_eq!(offline[0].interval(), iv("2025-03-01T09:00:00Z", "2025-03-01T13:00:00Z"));
    }

    #[test]
    fn incident_without_offline_time_excuses_nothing() {
        let mut db = db_with_outage();
        let incident = db
            .add_incident(&outage(iv("2025-03-01T14:00:00Z", "2025-03-01T15:00:00Z")), now())
            .unwrap();
        assert_eq!(incident.employees, 0);
        assert_eq!(incident.excused_seconds, 0);
    }

    #[test]
    fn blank_reason_is_rejected() {
        let mut db = db_with_outage();
        let mut blank = outage(iv("2025-03-01T09:00:00Z", "2025-03-01T10:00:00Z"));
        blank.reason = " ".to_string();
        let err = db.add_incident(&blank, now()).unwrap_err();
        assert!(matches!(err, DbError::Incident(IncidentError::MissingReason)));
        assert!(db.list_incidents(None).unwrap().is_empty());
    }

    #[test]
    fn list_filters_by_day() {
        let mut db = db_with_outage();
        db.add_incident(&outage(iv("2025-03-01T10:00:00Z", "2025-03-01T11:00:00Z")), now())
            .unwrap();
        assert_eq!(db.list_incidents(None).unwrap().len(), 1);
        assert_eq!(db.list_incidents(Some(march_first())).unwrap().len(), 1);
        let next_day = NaiveDate::from_ymd_opt(2025, 3, 2).unwrap();
        assert!(db.list_incidents(Some(next_day)).unwrap().is_empty());
        assert!(matches!(db.incident(42), Err(DbError::NotFound { entity: "incident", id: 42 })));
    }
}
