//! Work-session closure and shift reviews.
//!
//! Closure runs in a single `IMMEDIATE` transaction: the open session is
//! loaded, the checkout form validated, the department policy evaluated, and
//! then the checkout, the review and the session end are written together.
//! Any refusal returns before the commit, so the session stays open and
//! nothing is recorded.

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tracing::info;
use ws_core::policy::{ReasonStatus, empty_status_totals, format_duration, status_totals, summarize_breaks, violation_summary};
use ws_core::{
    BreakSummary, CheckoutError, CheckoutSubmission, DepartmentPolicy, EmployeeCode, Interval,
    ReviewPayload, SessionMeasurements, StatusCode, Verdict, evaluate,
};

use crate::master::{department_policy, enabled_checkout_template};
use crate::timeline::segments_overlapping;
use crate::{
    Database, DbError, employee_by_code, format_date, format_timestamp, parse_date,
    parse_timestamp, truncate_to_second,
};

/// Why a shift could not be closed.
#[derive(Debug, Error)]
pub enum CloseError {
    #[error("no open work session")]
    NoOpenSession,

    #[error("unknown employee: {0}")]
    UnknownEmployee(String),

    #[error("invalid checkout: {0}")]
    Checkout(#[from] CheckoutError),

    #[error(
        "standard work time {} is below the target {}",
        format_duration(*work_standard_seconds),
        format_duration(*target_seconds)
    )]
    WorkTimeShort {
        work_standard_seconds: i64,
        target_seconds: i64,
    },

    #[error("a reason is required to close this shift")]
    ReasonRequired(ReviewPayload),

    #[error("checkout already submitted for this session")]
    AlreadyCheckedOut,

    #[error(transparent)]
    Storage(DbError),
}

impl From<DbError> for CloseError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::UnknownEmployee(code) => Self::UnknownEmployee(code),
            other => Self::Storage(other),
        }
    }
}

impl From<rusqlite::Error> for CloseError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Storage(err.into())
    }
}

impl From<serde_json::Error> for CloseError {
    fn from(err: serde_json::Error) -> Self {
        Self::Storage(err.into())
    }
}

impl CloseError {
    /// Stable machine-readable code.
    pub const fn code(&self) -> &'static str {
        match self {
            Self::NoOpenSession => "no_open_session",
            Self::UnknownEmployee(_) => "unknown_employee",
            Self::Checkout(_) => "invalid_checkout",
            Self::WorkTimeShort { .. } => "work_time_short",
            Self::ReasonRequired(_) => "need_reason",
            Self::AlreadyCheckedOut => "checkout_exists",
            Self::Storage(_) => "storage_error",
        }
    }

    /// Equivalent HTTP status for transport layers.
    pub const fn http_status(&self) -> u16 {
        match self {
            Self::NoOpenSession | Self::UnknownEmployee(_) => 404,
            Self::Checkout(_) | Self::WorkTimeShort { .. } => 400,
            Self::ReasonRequired(_) | Self::AlreadyCheckedOut => 409,
            Self::Storage(_) => 500,
        }
    }

    /// Structured data the client needs to act on the refusal.
    pub fn data(&self) -> Option<serde_json::Value> {
        match self {
            Self::WorkTimeShort {
                work_standard_seconds,
                target_seconds,
            } => Some(json!({
                "workStandardSeconds": work_standard_seconds,
                "targetSeconds": target_seconds,
            })),
            Self::ReasonRequired(payload) => serde_json::to_value(payload).ok(),
            _ => None,
        }
    }
}

/// A successfully closed session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClosedSession {
    pub session_id: i64,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub checkout_recorded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub review_id: Option<i64>,
    pub need_reason: bool,
}

/// A stored shift review with list-view fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewRecord {
    pub id: i64,
    pub employee_code: EmployeeCode,
    pub employee_name: String,
    pub work_session_id: i64,
    pub work_date: NaiveDate,
    pub session_start: DateTime<Utc>,
    pub session_end: Option<DateTime<Utc>>,
    pub need_reason: bool,
    pub reason: Option<String>,
    pub reason_status: ReasonStatus,
    pub violation_summary: String,
    pub payload: ReviewPayload,
    pub created_at: DateTime<Utc>,
}

pub(crate) fn has_open_session(conn: &Connection, employee_id: i64) -> Result<bool, DbError> {
    Ok(open_session_of(conn, employee_id)?.is_some())
}

fn open_session_of(
    conn: &Connection,
    employee_id: i64,
) -> Result<Option<(i64, DateTime<Utc>)>, DbError> {
    let row: Option<(i64, String)> = conn
        .query_row(
            "SELECT id, start_at FROM work_sessions WHERE employee_id = ? AND end_at IS NULL",
            params![employee_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    row.map(|(id, start)| Ok((id, parse_timestamp(&start)?)))
        .transpose()
}

/// Raw duration, breaks and per-status totals of `[start, now)`.
fn measure(
    conn: &Connection,
    employee_id: i64,
    start: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<SessionMeasurements, DbError> {
    let Ok(window) = Interval::new(start, now) else {
        return Ok(SessionMeasurements {
            raw_seconds: 0,
            breaks: BreakSummary::default(),
            status_totals: empty_status_totals(),
        });
    };
    let segments = segments_overlapping(conn, employee_id, &window, None)?;
    let breaks: Vec<Interval> = segments
        .iter()
        .filter(|s| s.status == StatusCode::Break)
        .map(|s| s.interval())
        .collect();
    let by_status: Vec<(StatusCode, Interval)> =
        segments.iter().map(|s| (s.status, s.interval())).collect();
    Ok(SessionMeasurements {
        raw_seconds: window.seconds(),
        breaks: summarize_breaks(&window, &breaks),
        status_totals: status_totals(&window, &by_status),
    })
}

impl Database {
    /// Closes the employee's open work session at `now`.
    ///
    /// Refusals (`work_time_short`, `need_reason`, invalid checkout) leave
    /// the session open with no side effects. On success the checkout (if the
    /// department requires one), the review (if any violation was found) and
    /// the session end are committed together.
    pub fn close_work_session(
        &mut self,
        code: &EmployeeCode,
        checkout: Option<&CheckoutSubmission>,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<ClosedSession, CloseError> {
        let now = truncate_to_second(now);
        let offset = self.settings.utc_offset;
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let employee = employee_by_code(&tx, code)?;
        let (session_id, start) =
            open_session_of(&tx, employee.id)?.ok_or(CloseError::NoOpenSession)?;

        let template = match employee.department_id {
            Some(department_id) => enabled_checkout_template(&tx, department_id)?,
            None => None,
        };
        let cleaned = template
            .as_ref()
            .map(|template| template.validate(checkout))
            .transpose()?;

        let policy = match employee.department_id {
            Some(department_id) => department_policy(&tx, department_id)?,
            None => DepartmentPolicy::default(),
        };
        let measured = if policy.is_configured() {
            measure(&tx, employee.id, start, now)?
        } else {
            SessionMeasurements {
                raw_seconds: (now - start).num_seconds().max(0),
                breaks: BreakSummary::default(),
                status_totals: empty_status_totals(),
            }
        };

        let (review, need_reason) = match evaluate(&policy, &measured, reason) {
            Verdict::WorkTimeShort {
                work_standard_seconds,
                target_seconds,
            } => {
                return Err(CloseError::WorkTimeShort {
                    work_standard_seconds,
                    target_seconds,
                });
            }
            Verdict::NeedsReason(payload) => return Err(CloseError::ReasonRequired(payload)),
            Verdict::Proceed {
                review,
                need_reason,
            } => (review, need_reason),
        };

        let mut checkout_recorded = false;
        if let (Some(template), Some(data)) = (&template, &cleaned) {
            let existing: Option<i64> = tx
                .query_row(
                    "SELECT id FROM work_session_checkouts WHERE work_session_id = ?",
                    params![session_id],
                    |row| row.get(0),
                )
                .optional()?;
            if existing.is_some() {
                return Err(CloseError::AlreadyCheckedOut);
            }
            tx.execute(
                "
                INSERT INTO work_session_checkouts
                    (work_session_id, template_id, template_snapshot_json, data_json, created_at)
                VALUES (?, ?, ?, ?, ?)
                ",
                params![
                    session_id,
                    template.id,
                    serde_json::to_string(&template.snapshot())?,
                    serde_json::to_string(data)?,
                    format_timestamp(now),
                ],
            )?;
            checkout_recorded = true;
        }

        let review_id = match &review {
            Some(payload) => {
                let work_date = start.with_timezone(&offset).date_naive();
                let reason = reason.map(str::trim).filter(|r| !r.is_empty());
                tx.execute(
                    "
                    INSERT INTO work_session_reviews
                        (work_session_id, employee_id, work_date, work_standard_seconds,
                         break_seconds, need_reason, reason, payload_json, created_at)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                    ",
                    params![
                        session_id,
                        employee.id,
                        format_date(work_date),
                        payload.work_standard_seconds,
                        payload.break_seconds,
                        need_reason,
                        reason,
                        serde_json::to_string(payload)?,
                        format_timestamp(now),
                    ],
                )?;
                Some(tx.last_insert_rowid())
            }
            None => None,
        };

        let end = now.max(start);
        tx.execute(
            "UPDATE work_sessions SET end_at = ? WHERE id = ? AND end_at IS NULL",
            params![format_timestamp(end), session_id],
        )?;
        tx.commit()?;

        info!(
            employee = %code,
            session_id,
            start = %start,
            end = %end,
            violations = review.as_ref().map_or(0, |r| r.violations.len()),
            need_reason,
            "work session closed"
        );

        Ok(ClosedSession {
            session_id,
            start,
            end,
            checkout_recorded,
            review_id,
            need_reason,
        })
    }

    /// Reviews whose work date falls in `[from, to]`, newest first.
    pub fn list_reviews(&self, from: NaiveDate, to: NaiveDate) -> Result<Vec<ReviewRecord>, DbError> {
        let mut stmt = self.conn.prepare(&format!(
            "{REVIEW_SELECT} WHERE r.work_date >= ? AND r.work_date <= ? ORDER BY r.work_date DESC, r.id DESC"
        ))?;
        let rows = stmt.query_map(params![format_date(from), format_date(to)], review_row)?;
        let mut reviews = Vec::new();
        for row in rows {
            reviews.push(row?.into_record()?);
        }
        Ok(reviews)
    }

    /// A single review by id.
    pub fn review(&self, id: i64) -> Result<ReviewRecord, DbError> {
        let row = self
            .conn
            .query_row(&format!("{REVIEW_SELECT} WHERE r.id = ?"), params![id], review_row)
            .optional()?;
        row.ok_or(DbError::NotFound {
            entity: "review",
            id,
        })?
        .into_record()
    }
}

const REVIEW_SELECT: &str = "
    SELECT r.id, e.code, e.name, r.work_session_id, r.work_date, ws.start_at, ws.end_at,
           r.need_reason, r.reason, r.payload_json, r.created_at
    FROM work_session_reviews r
    JOIN employees e ON e.id = r.employee_id
    JOIN work_sessions ws ON ws.id = r.work_session_id
";

struct ReviewRow {
    id: i64,
    code: String,
    name: String,
    work_session_id: i64,
    work_date: String,
    start_at: String,
    end_at: Option<String>,
    need_reason: bool,
    reason: Option<String>,
    payload_json: String,
    created_at: String,
}

fn review_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ReviewRow> {
    Ok(ReviewRow {
        id: row.get(0)?,
        code: row.get(1)?,
        name: row.get(2)?,
        work_session_id: row.get(3)?,
        work_date: row.get(4)?,
        start_at: row.get(5)?,
        end_at: row.get(6)?,
        need_reason: row.get(7)?,
        reason: row.get(8)?,
        payload_json: row.get(9)?,
        created_at: row.get(10)?,
    })
}

impl ReviewRow {
    fn into_record(self) -> Result<ReviewRecord, DbError> {
        let payload: ReviewPayload = serde_json::from_str(&self.payload_json)?;
        Ok(ReviewRecord {
            id: self.id,
            employee_code: EmployeeCode::new(self.code)?,
            employee_name: self.name,
            work_session_id: self.work_session_id,
            work_date: parse_date(&self.work_date)?,
            session_start: parse_timestamp(&self.start_at)?,
            session_end: self.end_at.as_deref().map(parse_timestamp).transpose()?,
            need_reason: self.need_reason,
            reason_status: ReasonStatus::of(self.need_reason, self.reason.as_deref()),
            reason: self.reason,
            violation_summary: violation_summary(&payload.violations),
            payload,
            created_at: parse_timestamp(&self.created_at)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::Duration;
    use ws_core::policy::ViolationKind;
    use ws_core::{CheckoutTemplate, ReportKind};

    use crate::test_support::ts;
    use crate::{EngineSettings, MasterData, Report};

    const HOUR: i64 = 3600;

    /// E100 is in `Eng` (8h target, 30 min break cap, fish show-only
    /// above 10 min); E200 is in `Ops` with a checkout form; E300 has no
    /// department.
    fn policy_db() -> Database {
        let mut db = Database::open_in_memory().unwrap().with_settings(EngineSettings {
            offline_threshold_seconds: 24 * HOUR,
            ..EngineSettings::default()
        });
        let data: MasterData = serde_json::from_str(
            r#"{
                "departments": [
                    {
                        "name": "Eng",
                        "rule": {"targetSeconds": 28800, "maxBreakSeconds": 1800},
                        "thresholds": [
                            {"statusCode": "fish", "maxSeconds": 600, "triggerAction": "show_only"}
                        ]
                    },
                    {
                        "name": "Ops",
                        "checkout": {
                            "name": "Wrap-up",
                            "fields": [{"name": "Summary", "type": "text", "required": true}]
                        }
                    }
                ],
                "employees": [
                    {"code": "E100", "name": "Ada", "department": "Eng"},
                    {"code": "E200", "name": "Bob", "department": "Ops"},
                    {"code": "E300", "name": "Cy"}
                ],
                "rules": [
                    {"ruleType": "white", "matchMode": "process", "matchValue": "code.exe"},
                    {"ruleType": "black", "matchMode": "process", "matchValue": "game.exe"}
                ]
            }"#,
        )
        .unwrap();
        db.import_master_data(&data).unwrap();
        db
    }

    fn code(s: &str) -> EmployeeCode {
        EmployeeCode::new(s).unwrap()
    }

    fn report(process_name: &str, report_type: ReportKind) -> Report {
        Report {
            process_name: process_name.to_string(),
            report_type,
            ..Report::default()
        }
    }

    fn send(db: &mut Database, who: &str, process_name: &str, kind: ReportKind, at: DateTime<Utc>) {
        db.ingest_report(&code(who), &report(process_name, kind), at).unwrap();
    }

    fn open_sessions(db: &Database) -> i64 {
        db.overview().unwrap().open_sessions
    }

    fn count(db: &Database, table: &str) -> i64 {
        db.conn
            .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
            .unwrap()
    }

    fn nine() -> DateTime<Utc> {
        ts("2025-03-03T09:00:00Z")
    }

    #[test]
    fn one_minute_short_of_target_keeps_session_open() {
        let mut db = policy_db();
        send(&mut db, "E100", "code.exe", ReportKind::WorkStart, nine());
        let err = db
            .close_work_session(&code("E100"), None, None, nine() + Duration::minutes(8 * 60 - 1))
            .unwrap_err();
        assert!(matches!(
            err,
            CloseError::WorkTimeShort {
                work_standard_seconds,
                target_seconds: 28_800,
            } if work_standard_seconds == 8 * HOUR - 60
        ));
        assert_eq!(err.code(), "work_time_short");
        assert_eq!(err.http_status(), 400);
        assert_eq!(err.data().unwrap()["targetSeconds"], 28_800);
        assert_eq!(open_sessions(&db), 1);
    }

    #[test]
    fn long_break_requires_reason_then_closes_with_review() {
        let mut db = policy_db();
        send(&mut db, "E100", "code.exe", ReportKind::WorkStart, nine());
        send(&mut db, "E100", "", ReportKind::Break, nine() + Duration::hours(3));
        send(&mut db, "E100", "code.exe", ReportKind::Heartbeat, nine() + Duration::minutes(220));

        let end = nine() + Duration::hours(9);
        let outcome = db
            .ingest_report(&code("E100"), &report("code.exe", ReportKind::WorkEnd), end)
            .unwrap();
        let Some(Err(err)) = outcome.work_end else {
            panic!("expected closure to be refused");
        };
        assert_eq!(err.code(), "need_reason");
        assert_eq!(err.http_status(), 409);
        let CloseError::ReasonRequired(payload) = err else {
            panic!("expected reason-required refusal");
        };
        assert_eq!(payload.break_seconds, 40 * 60);
        assert_eq!(payload.work_standard_seconds, 9 * HOUR - 40 * 60);
        assert_eq!(payload.violations.len(), 1);
        assert_eq!(payload.violations[0].kind, ViolationKind::BreakTotal);
        assert!(outcome.live.working);
        assert_eq!(open_sessions(&db), 1);
        assert_eq!(count(&db, "work_session_reviews"), 0);

        let mut retry = report("code.exe", ReportKind::WorkEnd);
        retry.reason = Some("dentist appointment".to_string());
        let outcome = db
            .ingest_report(&code("E100"), &retry, end + Duration::minutes(1))
            .unwrap();
        let closed = outcome.work_end.unwrap().unwrap();
        assert!(closed.need_reason);
        assert_eq!(open_sessions(&db), 0);

        let review = db.review(closed.review_id.unwrap()).unwrap();
        assert_eq!(review.reason.as_deref(), Some("dentist appointment"));
        assert_eq!(review.reason_status, ReasonStatus::Supplied);
        assert_eq!(review.work_date, NaiveDate::from_ymd_opt(2025, 3, 3).unwrap());
        assert_eq!(review.payload.status_totals[&StatusCode::Break], 40 * 60);
        assert!(review.violation_summary.starts_with("total break time exceeds limit"));
    }

    #[test]
    fn show_only_violation_closes_with_review_and_no_reason() {
        let mut db = policy_db();
        send(&mut db, "E100", "game.exe", ReportKind::WorkStart, nine());
        send(&mut db, "E100", "code.exe", ReportKind::Heartbeat, nine() + Duration::minutes(20));
        let closed = db
            .close_work_session(&code("E100"), None, None, nine() + Duration::hours(8))
            .unwrap();
        assert!(!closed.need_reason);

        let reviews = db
            .list_reviews(
                NaiveDate::from_ymd_opt(2025, 3, 1).unwrap(),
                NaiveDate::from_ymd_opt(2025, 3, 31).unwrap(),
            )
            .unwrap();
        assert_eq!(reviews.len(), 1);
        assert_eq!(reviews[0].reason_status, ReasonStatus::NotRequired);
        assert_eq!(reviews[0].payload.violations[0].status_code, Some(StatusCode::Fish));
        assert_eq!(reviews[0].payload.violations[0].actual_seconds, 20 * 60);
    }

    #[test]
    fn clean_shift_writes_no_review() {
        let mut db = policy_db();
        send(&mut db, "E100", "code.exe", ReportKind::WorkStart, nine());
        let closed = db
            .close_work_session(&code("E100"), None, None, nine() + Duration::hours(8))
            .unwrap();
        assert_eq!(closed.review_id, None);
        assert_eq!(closed.end, nine() + Duration::hours(8));
        assert_eq!(count(&db, "work_session_reviews"), 0);
    }

    #[test]
    fn unconfigured_department_always_closes() {
        let mut db = policy_db();
        send(&mut db, "E300", "code.exe", ReportKind::WorkStart, nine());
        let closed = db
            .close_work_session(&code("E300"), None, None, nine() + Duration::minutes(5))
            .unwrap();
        assert_eq!(closed.review_id, None);
        assert!(!closed.checkout_recorded);
    }

    #[test]
    fn closing_without_session_is_not_found() {
        let mut db = policy_db();
        let err = db.close_work_session(&code("E300"), None, None, nine()).unwrap_err();
        assert!(matches!(err, CloseError::NoOpenSession));
        assert_eq!(err.http_status(), 404);
    }

    #[test]
    fn closing_for_unknown_employee_is_not_found() {
        let mut db = policy_db();
        let err = db.close_work_session(&code("E999"), None, None, nine()).unwrap_err();
        assert!(matches!(&err, CloseError::UnknownEmployee(found) if found == "E999"));
        assert_eq!(err.code(), "unknown_employee");
        assert_eq!(err.http_status(), 404);
    }

    fn ops_template(db: &Database) -> CheckoutTemplate {
        db.checkout_template_for(&code("E200")).unwrap().unwrap()
    }

    fn submission(template: &CheckoutTemplate, summary: &str) -> CheckoutSubmission {
        CheckoutSubmission {
            template_id: template.id,
            data: [(template.fields[0].id.to_string(), summary.to_string())]
                .into_iter()
                .collect(),
        }
    }

    #[test]
    fn checkout_is_validated_and_recorded_once() {
        let mut db = policy_db();
        send(&mut db, "E200", "code.exe", ReportKind::WorkStart, nine());
        let template = ops_template(&db);

        let missing = db
            .close_work_session(&code("E200"), None, None, nine() + Duration::hours(1))
            .unwrap_err();
        assert!(matches!(missing, CloseError::Checkout(CheckoutError::Missing)));
        let blank = db
            .close_work_session(&code("E200"), Some(&submission(&template, " ")), None, nine() + Duration::hours(1))
            .unwrap_err();
        assert_eq!(blank.code(), "invalid_checkout");
        assert_eq!(open_sessions(&db), 1);
        assert_eq!(count(&db, "work_session_checkouts"), 0);

        let closed = db
            .close_work_session(
                &code("E200"),
                Some(&submission(&template, " shipped ")),
                None,
                nine() + Duration::hours(1),
            )
            .unwrap();
        assert!(closed.checkout_recorded);
        let data: String = db
            .conn
            .query_row("SELECT data_json FROM work_session_checkouts", [], |row| row.get(0))
            .unwrap();
        assert!(data.contains("\"shipped\""));
    }

    #[test]
    fn existing_checkout_for_session_is_a_conflict() {
        let mut db = policy_db();
        send(&mut db, "E200", "code.exe", ReportKind::WorkStart, nine());
        let template = ops_template(&db);
        db.conn
            .execute(
                "INSERT INTO work_session_checkouts
                 (work_session_id, template_id, template_snapshot_json, data_json, created_at)
                 VALUES (1, ?, '{}', '{}', '2025-03-03T10:00:00Z')",
                params![template.id],
            )
            .unwrap();
        let err = db
            .close_work_session(&code("E200"), Some(&submission(&template, "ok")), None, nine() + Duration::hours(1))
            .unwrap_err();
        assert!(matches!(err, CloseError::AlreadyCheckedOut));
        assert_eq!(err.http_status(), 409);
        assert_eq!(open_sessions(&db), 1);
    }

    #[test]
    fn stale_template_id_is_rejected() {
        let mut db = policy_db();
        send(&mut db, "E200", "code.exe", ReportKind::WorkStart, nine());
        let template = ops_template(&db);
        let mut stale = submission(&template, "ok");
        stale.template_id += 100;
        let err = db
            .close_work_session(&code("E200"), Some(&stale), None, nine() + Duration::hours(1))
            .unwrap_err();
        assert!(matches!(err, CloseError::Checkout(CheckoutError::TemplateChanged { .. })));
    }

    #[test]
    fn missing_review_is_not_found() {
        let db = policy_db();
        assert!(matches!(
            db.review(42).unwrap_err(),
            DbError::NotFound { entity: "review", id: 42 }
        ));
    }
}
