//! Report ingestion and live views.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use ws_core::{
    Activity, CheckoutSubmission, EmployeeCode, Interval, LiveView, PresenceInput, ReportKind,
    SegmentSource, StatusCode, classify, describe,
};

use crate::closure::{ClosedSession, CloseError, has_open_session};
use crate::timeline::{NewSegment, advance_watermark, materialize};
use crate::{Database, DbError, Employee, employee_by_code, format_timestamp, parse_timestamp, truncate_to_second};

const BREAK_DESCRIPTION: &str = "on break";
const OFF_WORK_DESCRIPTION: &str = "off work";

/// One activity report from a worker's client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    #[serde(default)]
    pub process_name: String,
    #[serde(default)]
    pub window_title: String,
    #[serde(default)]
    pub idle_seconds: i64,
    #[serde(default)]
    pub client_version: Option<String>,
    #[serde(default)]
    pub report_type: ReportKind,
    #[serde(default)]
    pub checkout: Option<CheckoutSubmission>,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Thresholds returned to the client with every accepted report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportResponse {
    pub idle_threshold_seconds: i64,
    pub heartbeat_interval_seconds: i64,
    pub offline_threshold_seconds: i64,
    pub server_time: DateTime<Utc>,
}

/// Everything that happened while ingesting one report.
#[derive(Debug)]
pub struct ReportOutcome {
    pub response: ReportResponse,
    pub status: StatusCode,
    pub description: String,
    /// The interval since the previous report that was written to the timeline.
    pub materialized: Option<Interval>,
    /// Result of shift closure, for `work_end` reports only.
    pub work_end: Option<Result<ClosedSession, CloseError>>,
    /// The update to push to live dashboards.
    pub live: LiveView,
}

/// Row counts for a quick health overview.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Overview {
    pub employees: i64,
    pub open_sessions: i64,
    pub segments: i64,
    pub raw_events: i64,
    pub last_report: Option<DateTime<Utc>>,
}

impl Database {
    /// Ingests one report received at `now`.
    ///
    /// The interval since the previous report is materialized with the
    /// previous report's status (or as offline when the gap exceeds the
    /// offline threshold), then the timeline state is updated, all in one
    /// transaction. A `work_end` report then runs shift closure.
    pub fn ingest_report(
        &mut self,
        code: &EmployeeCode,
        report: &Report,
        now: DateTime<Utc>,
    ) -> Result<ReportOutcome, DbError> {
        let now = truncate_to_second(now);
        let settings = self.settings;
        let rules = self.enabled_rules()?;

        let (status, description) = if report.report_type == ReportKind::Break {
            (StatusCode::Break, BREAK_DESCRIPTION.to_string())
        } else {
            let activity = Activity {
                idle_seconds: report.idle_seconds,
                process_name: &report.process_name,
                window_title: &report.window_title,
            };
            (
                classify(&activity, settings.idle_threshold_seconds, &rules),
                describe(&report.process_name, &report.window_title),
            )
        };

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let employee = employee_by_code(&tx, code)?;

        if report.report_type == ReportKind::WorkStart {
            open_session(&tx, employee.id, now)?;
        }
        insert_raw_event(&tx, employee.id, report, status, now)?;

        let previous = &employee.timeline;
        let mut materialized = None;
        if let Some(last_seen) = previous.last_seen {
            if let Ok(gap) = Interval::new(last_seen, now) {
                let segment = if gap.seconds() > settings.offline_threshold_seconds {
                    NewSegment {
                        interval: gap,
                        status: StatusCode::Offline,
                        description: "",
                        source: SegmentSource::Offline,
                    }
                } else {
                    NewSegment {
                        interval: gap,
                        status: previous.last_status.unwrap_or(StatusCode::Normal),
                        description: &previous.last_description,
                        source: SegmentSource::System,
                    }
                };
                materialized =
                    materialize(&tx, employee.id, previous.watermark, segment, &settings.utc_offset)?;
            }
        }

        if previous.last_seen.is_some_and(|seen| now < seen) {
            debug!(employee = %code, %now, "late report, timeline state left unchanged");
        } else {
            tx.execute(
                "
                UPDATE employees
                SET last_seen_at = ?1, last_status = ?2, last_description = ?3
                WHERE id = ?4
                ",
                params![format_timestamp(now), status.as_str(), description, employee.id],
            )?;
            advance_watermark(&tx, employee.id, now)?;
        }
        tx.commit()?;

        debug!(
            employee = %code,
            kind = %report.report_type,
            %status,
            materialized_seconds = materialized.map_or(0, |i| i.seconds()),
            "report ingested"
        );

        let work_end = (report.report_type == ReportKind::WorkEnd).then(|| {
            self.close_work_session(
                code,
                report.checkout.as_ref(),
                report.reason.as_deref(),
                now,
            )
        });

        let working = has_open_session(&self.conn, employee.id)?;
        let live = LiveView::build(
            &PresenceInput {
                employee_code: employee.code.clone(),
                name: employee.name.clone(),
                last_seen: Some(now),
                last_status: Some(status),
                last_description: if working {
                    description.clone()
                } else {
                    OFF_WORK_DESCRIPTION.to_string()
                },
                has_open_session: working,
            },
            now,
            settings.offline_threshold_seconds,
        );

        Ok(ReportOutcome {
            response: ReportResponse {
                idle_threshold_seconds: settings.idle_threshold_seconds,
                heartbeat_interval_seconds: settings.heartbeat_interval_seconds,
                offline_threshold_seconds: settings.offline_threshold_seconds,
                server_time: now,
            },
            status,
            description,
            materialized,
            work_end,
            live,
        })
    }

    /// The live view of every employee at `now`.
    pub fn live_snapshot(&self, now: DateTime<Utc>) -> Result<Vec<LiveView>, DbError> {
        let offline_threshold = self.settings.offline_threshold_seconds;
        let mut views = Vec::new();
        for employee in self.list_employees()? {
            let working = has_open_session(&self.conn, employee.id)?;
            views.push(LiveView::build(
                &presence_input(&employee, working),
                now,
                offline_threshold,
            ));
        }
        Ok(views)
    }

    /// Row counts and the most recent report time.
    pub fn overview(&self) -> Result<Overview, DbError> {
        let count = |sql: &str| -> Result<i64, DbError> {
            Ok(self.conn.query_row(sql, [], |row| row.get(0))?)
        };
        let last_report: Option<String> = self
            .conn
            .query_row("SELECT MAX(received_at) FROM raw_events", [], |row| row.get(0))
            .optional()?
            .flatten();
        Ok(Overview {
            employees: count("SELECT COUNT(*) FROM employees")?,
            open_sessions: count("SELECT COUNT(*) FROM work_sessions WHERE end_at IS NULL")?,
            segments: count("SELECT COUNT(*) FROM time_segments")?,
            raw_events: count("SELECT COUNT(*) FROM raw_events")?,
            last_report: last_report.as_deref().map(parse_timestamp).transpose()?,
        })
    }
}

fn presence_input(employee: &Employee, has_open_session: bool) -> PresenceInput {
    PresenceInput {
        employee_code: employee.code.clone(),
        name: employee.name.clone(),
        last_seen: employee.timeline.last_seen,
        last_status: employee.timeline.last_status,
        last_description: employee.timeline.last_description.clone(),
        has_open_session,
    }
}

/// Opens a work session unless one is already open.
fn open_session(conn: &Connection, employee_id: i64, now: DateTime<Utc>) -> Result<(), DbError> {
    if has_open_session(conn, employee_id)? {
        debug!(employee_id, "work session already open");
        return Ok(());
    }
    conn.execute(
        "INSERT INTO work_sessions (employee_id, start_at) VALUES (?, ?)",
        params![employee_id, format_timestamp(now)],
    )?;
    info!(employee_id, start = %now, "work session opened");
    Ok(())
}

fn insert_raw_event(
    conn: &Connection,
    employee_id: i64,
    report: &Report,
    status: StatusCode,
    now: DateTime<Utc>,
) -> Result<(), DbError> {
    conn.execute(
        "
        INSERT INTO raw_events
            (employee_id, received_at, kind, process_name, window_title, idle_seconds, status, client_version)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        ",
        params![
            employee_id,
            format_timestamp(now),
            report.report_type.as_str(),
            report.process_name.trim(),
            report.window_title.trim(),
            report.idle_seconds,
            status.as_str(),
            report.client_version.as_deref(),
        ],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::{Duration, NaiveDate};

    use crate::test_support::{seeded_db, ts};
    use crate::{EngineSettings, MasterData};

    fn code() -> EmployeeCode {
        EmployeeCode::new("E001").unwrap()
    }

    fn heartbeat(process_name: &str, idle_seconds: i64) -> Report {
        Report {
            process_name: process_name.to_string(),
            window_title: "window".to_string(),
            idle_seconds,
            ..Report::default()
        }
    }

    fn kind(report_type: ReportKind) -> Report {
        Report {
            report_type,
            ..heartbeat("code.exe", 0)
        }
    }

    fn day() -> Interval {
        Interval::new(ts("2025-03-01T00:00:00Z"), ts("2025-03-02T00:00:00Z")).unwrap()
    }

    fn march_first() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, 1).unwrap()
    }

    #[test]
    fn report_json_uses_client_field_names() {
        let report: Report = serde_json::from_str(
            r#"{"processName":"code.exe","windowTitle":"main.rs","idleSeconds":3,"reportType":"work_start"}"#,
        )
        .unwrap();
        assert_eq!(report.report_type, ReportKind::WorkStart);
        assert_eq!(report.idle_seconds, 3);

        let bare: Report = serde_json::from_str("{}").unwrap();
        assert_eq!(bare.report_type, ReportKind::Heartbeat);
    }

    #[test]
    fn first_report_sets_state_without_segments() {
        let mut db = seeded_db();
        let t0 = ts("2025-03-01T09:00:00Z");
        let outcome = db.ingest_report(&code(), &heartbeat("code.exe", 0), t0).unwrap();
        assert_eq!(outcome.status, StatusCode::Work);
        assert_eq!(outcome.description, "code: window");
        assert_eq!(outcome.materialized, None);
        assert_eq!(outcome.response.offline_threshold_seconds, 600);

        let timeline = db.employee(&code()).unwrap().timeline;
        assert_eq!(timeline.last_seen, Some(t0));
        assert_eq!(timeline.last_status, Some(StatusCode::Work));
        assert_eq!(timeline.watermark, Some(t0));
        assert!(db.segments(&code(), &day()).unwrap().is_empty());
    }

    #[test]
    fn interval_since_previous_report_gets_previous_status() {
        let mut db = seeded_db();
        let t0 = ts("2025-03-01T09:00:00Z");
        db.ingest_report(&code(), &heartbeat("code.exe", 0), t0).unwrap();
        db.ingest_report(&code(), &heartbeat("game.exe", 0), t0 + Duration::minutes(5)).unwrap();
        let outcome = db
            .ingest_report(&code(), &heartbeat("code.exe", 0), t0 + Duration::minutes(10))
            .unwrap();
        assert_eq!(outcome.status, StatusCode::Work);

        let segments = db.segments(&code(), &day()).unwrap();
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].status, StatusCode::Work);
        assert_eq!(segments[0].source, SegmentSource::System);
        assert_eq!(segments[1].status, StatusCode::Fish);
        assert_eq!(segments[1].description, "game: window");

        let stats = db.daily_stats(&code(), march_first()).unwrap();
        assert_eq!(stats.work_seconds, 300);
        assert_eq!(stats.fish_seconds, 300);
        assert_eq!(stats.attendance_seconds, 600);
        assert_eq!(stats.effective_seconds, 300);
    }

    #[test]
    fn steady_reports_merge_into_one_segment() {
        let mut db = seeded_db();
        let t0 = ts("2025-03-01T09:00:00Z");
        for minute in 0..=6 {
            db.ingest_report(&code(), &heartbeat("code.exe", 0), t0 + Duration::minutes(minute * 5))
                .unwrap();
        }
        let segments = db.segments(&code(), &day()).unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].interval().seconds(), 1800);
    }

    #[test]
    fn idle_report_is_classified_idle() {
        let mut db = seeded_db();
        let outcome = db
            .ingest_report(&code(), &heartbeat("code.exe", 400), ts("2025-03-01T09:00:00Z"))
            .unwrap();
        assert_eq!(outcome.status, StatusCode::Idle);
    }

    #[test]
    fn long_gap_is_recorded_offline() {
        let mut db = seeded_db();
        let t0 = ts("2025-03-01T09:00:00Z");
        db.ingest_report(&code(), &heartbeat("code.exe", 0), t0).unwrap();
        let outcome = db
            .ingest_report(&code(), &heartbeat("code.exe", 0), t0 + Duration::minutes(30))
            .unwrap();
        assert_eq!(outcome.materialized.unwrap().seconds(), 1800);

        let segments = db.segments(&code(), &day()).unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].status, StatusCode::Offline);
        assert_eq!(segments[0].source, SegmentSource::Offline);
        assert_eq!(db.daily_stats(&code(), march_first()).unwrap().offline_seconds, 1800);
    }

    #[test]
    fn late_report_does_not_recount_time() {
        let mut db = seeded_db();
        let t0 = ts("2025-03-01T09:00:00Z");
        db.ingest_report(&code(), &heartbeat("code.exe", 0), t0).unwrap();
        db.ingest_report(&code(), &heartbeat("code.exe", 0), t0 + Duration::minutes(5)).unwrap();
        let late = db
            .ingest_report(&code(), &heartbeat("game.exe", 0), t0 + Duration::minutes(2))
            .unwrap();
        assert_eq!(late.materialized, None);

        let timeline = db.employee(&code()).unwrap().timeline;
        assert_eq!(timeline.last_seen, Some(t0 + Duration::minutes(5)));
        assert_eq!(timeline.last_status, Some(StatusCode::Work));
        assert_eq!(db.daily_stats(&code(), march_first()).unwrap().work_seconds, 300);
    }

    #[test]
    fn concurrent_connections_never_double_count() {
        const REPORTS: i64 = 32;
        const THREADS: i64 = 16;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ws.db");
        let settings = EngineSettings {
            offline_threshold_seconds: 3600,
            ..EngineSettings::default()
        };
        let data: MasterData = serde_json::from_str(
            r#"{"employees": [{"code": "E001", "name": "Ada"}],
                "rules": [{"ruleType": "white", "matchMode": "process", "matchValue": "code.exe"}]}"#,
        )
        .unwrap();
        Database::open(&path).unwrap().import_master_data(&data).unwrap();

        // 13 is coprime with 32, so every slot is sent once, out of order
        let t0 = ts("2025-03-01T09:00:00Z");
        let slots: Vec<DateTime<Utc>> = (0..REPORTS)
            .map(|i| t0 + Duration::seconds((i * 13 % REPORTS) * 30))
            .collect();
        std::thread::scope(|scope| {
            for chunk in slots.chunks((REPORTS / THREADS) as usize) {
                let path = &path;
                scope.spawn(move || {
                    let mut db = Database::open(path).unwrap().with_settings(settings);
                    for &at in chunk {
                        db.ingest_report(&code(), &heartbeat("code.exe", 0), at).unwrap();
                    }
                });
            }
        });

        let db = Database::open(&path).unwrap().with_settings(settings);
        let mut segments = db.segments(&code(), &day()).unwrap();
        segments.sort_by_key(|segment| segment.start);
        for pair in segments.windows(2) {
            assert!(pair[0].end <= pair[1].start, "overlap: {pair:?}");
        }
        assert!(segments.iter().all(|segment| segment.status == StatusCode::Work));

        let recorded: i64 = segments.iter().map(|segment| segment.interval().seconds()).sum();
        let stats = db.daily_stats(&code(), march_first()).unwrap();
        assert_eq!(stats.work_seconds, recorded);
        assert_eq!(stats.attendance_seconds, recorded);
        assert!(recorded <= (REPORTS - 1) * 30);
        assert_eq!(db.overview().unwrap().raw_events, REPORTS);
    }

    #[test]
    fn duplicate_report_at_same_instant_is_harmless() {
        let mut db = seeded_db();
        let t0 = ts("2025-03-01T09:00:00Z");
        db.ingest_report(&code(), &heartbeat("code.exe", 0), t0).unwrap();
        db.ingest_report(&code(), &heartbeat("code.exe", 0), t0 + Duration::minutes(5)).unwrap();
        db.ingest_report(&code(), &heartbeat("code.exe", 0), t0 + Duration::minutes(5)).unwrap();
        assert_eq!(db.daily_stats(&code(), march_first()).unwrap().work_seconds, 300);
        assert_eq!(db.overview().unwrap().raw_events, 3);
    }

    #[test]
    fn break_report_records_break_status() {
        let mut db = seeded_db();
        let t0 = ts("2025-03-01T09:00:00Z");
        let outcome = db.ingest_report(&code(), &kind(ReportKind::Break), t0).unwrap();
        assert_eq!(outcome.status, StatusCode::Break);
        assert_eq!(outcome.description, BREAK_DESCRIPTION);

        db.ingest_report(&code(), &heartbeat("code.exe", 0), t0 + Duration::minutes(5)).unwrap();
        let segments = db.segments(&code(), &day()).unwrap();
        assert_eq!(segments[0].status, StatusCode::Break);
        assert_eq!(db.daily_stats(&code(), march_first()).unwrap(), ws_core::DailyStats::empty(march_first()));
    }

    #[test]
    fn work_start_opens_one_session() {
        let mut db = seeded_db();
        let t0 = ts("2025-03-01T09:00:00Z");
        let outcome = db.ingest_report(&code(), &kind(ReportKind::WorkStart), t0).unwrap();
        assert!(outcome.live.working);
        db.ingest_report(&code(), &kind(ReportKind::WorkStart), t0 + Duration::minutes(1)).unwrap();
        assert_eq!(db.overview().unwrap().open_sessions, 1);
    }

    #[test]
    fn work_end_closes_session_and_goes_off_work() {
        let mut db = seeded_db();
        let t0 = ts("2025-03-01T09:00:00Z");
        db.ingest_report(&code(), &kind(ReportKind::WorkStart), t0).unwrap();
        let outcome = db
            .ingest_report(&code(), &kind(ReportKind::WorkEnd), t0 + Duration::hours(8))
            .unwrap();
        assert!(matches!(outcome.work_end, Some(Ok(_))));
        assert!(!outcome.live.working);
        assert_eq!(outcome.live.status_code, ws_core::presence::OFF_WORK);
        assert_eq!(db.overview().unwrap().open_sessions, 0);
    }

    #[test]
    fn work_end_without_session_is_rejected_but_report_kept() {
        let mut db = seeded_db();
        let outcome = db
            .ingest_report(&code(), &kind(ReportKind::WorkEnd), ts("2025-03-01T18:00:00Z"))
            .unwrap();
        assert!(matches!(outcome.work_end, Some(Err(CloseError::NoOpenSession))));
        assert_eq!(db.overview().unwrap().raw_events, 1);
    }

    #[test]
    fn unknown_employee_is_rejected() {
        let mut db = seeded_db();
        let err = db
            .ingest_report(&EmployeeCode::new("E404").unwrap(), &heartbeat("x", 0), ts("2025-03-01T09:00:00Z"))
            .unwrap_err();
        assert!(matches!(err, DbError::UnknownEmployee(_)));
        assert_eq!(db.overview().unwrap().raw_events, 0);
    }

    #[test]
    fn live_snapshot_reflects_presence() {
        let mut db = seeded_db();
        let t0 = ts("2025-03-01T09:00:00Z");
        db.ingest_report(&code(), &kind(ReportKind::WorkStart), t0).unwrap();

        let fresh = db.live_snapshot(t0 + Duration::minutes(1)).unwrap();
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0].status_code, "work");

        let stale = db.live_snapshot(t0 + Duration::hours(1)).unwrap();
        assert_eq!(stale[0].status_code, "offline");
        assert!(stale[0].working);
    }

    #[test]
    fn sub_second_precision_is_dropped() {
        let mut db = seeded_db();
        let t0 = ts("2025-03-01T09:00:00.900Z");
        db.ingest_report(&code(), &heartbeat("code.exe", 0), t0).unwrap();
        assert_eq!(
            db.employee(&code()).unwrap().timeline.last_seen,
            Some(ts("2025-03-01T09:00:00Z"))
        );
    }
}
