//! Report command: ingest one worker report and print the client reply.

use std::io::{Read, Write};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::warn;
use ws_core::{EmployeeCode, LiveView, StatusCode};
use ws_db::{ClosedSession, Database, DbError, Report, ReportResponse};

/// What the client gets back for one report.
#[derive(Debug, Clone)]
pub struct Reply {
    pub body: Value,
    /// `false` when the report or its shift closure was refused.
    pub accepted: bool,
    /// Live update to broadcast, present whenever the report was ingested.
    pub live: Option<LiveView>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Accepted<'a> {
    ok: bool,
    #[serde(flatten)]
    response: &'a ReportResponse,
    status: StatusCode,
    description: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    session: Option<&'a ClosedSession>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Rejected<'a> {
    ok: bool,
    error: &'a str,
    message: String,
    http_status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

fn rejected(error: &str, message: String, http_status: u16, data: Option<Value>) -> Result<Value> {
    Ok(serde_json::to_value(Rejected {
        ok: false,
        error,
        message,
        http_status,
        data,
    })?)
}

/// Error code and HTTP-equivalent status for a failed ingestion.
const fn ingest_error_code(err: &DbError) -> (&'static str, u16) {
    match err {
        DbError::UnknownEmployee(_) => ("unknown_employee", 404),
        DbError::Validation(_) => ("invalid_report", 400),
        _ => ("storage_error", 500),
    }
}

/// Ingests `report` and builds the reply the client would receive.
pub fn handle(
    db: &mut Database,
    code: &EmployeeCode,
    report: &Report,
    now: DateTime<Utc>,
) -> Result<Reply> {
    let outcome = match db.ingest_report(code, report, now) {
        Ok(outcome) => outcome,
        Err(err) => {
            let (error, http_status) = ingest_error_code(&err);
            if http_status >= 500 {
                warn!(employee = %code, error = %err, "report ingestion failed");
            }
            return Ok(Reply {
                body: rejected(error, err.to_string(), http_status, None)?,
                accepted: false,
                live: None,
            });
        }
    };

    let body = match &outcome.work_end {
        Some(Err(err)) => rejected(err.code(), err.to_string(), err.http_status(), err.data())?,
        closed => serde_json::to_value(Accepted {
            ok: true,
            response: &outcome.response,
            status: outcome.status,
            description: &outcome.description,
            session: closed.as_ref().and_then(|result| result.as_ref().ok()),
        })?,
    };
    Ok(Reply {
        accepted: !matches!(outcome.work_end, Some(Err(_))),
        body,
        live: Some(outcome.live),
    })
}

/// Reads one report from `reader`, ingests it and writes the reply.
pub fn run<R: Read, W: Write>(
    reader: R,
    writer: &mut W,
    db: &mut Database,
    code: &EmployeeCode,
    now: DateTime<Utc>,
) -> Result<bool> {
    let report: Report = serde_json::from_reader(reader).context("invalid report JSON")?;
    let reply = handle(db, code, &report, now)?;
    writeln!(writer, "{}", serde_json::to_string(&reply.body)?)?;
    Ok(reply.accepted)
}

#[cfg(test)]
mod tests {
    use super::*;

    use insta::assert_snapshot;
    use ws_db::{EngineSettings, MasterData};

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn db() -> Database {
        let mut db = Database::open_in_memory()
            .unwrap()
            .with_settings(EngineSettings::default());
        let data: MasterData = serde_json::from_str(
            r#"{
                "departments": [{"name": "Eng", "rule": {"targetSeconds": 28800}}],
                "employees": [{"code": "E001", "name": "Ada", "department": "Eng"}],
                "rules": [{"ruleType": "white", "matchMode": "process", "matchValue": "code.exe"}]
            }"#,
        )
        .unwrap();
        db.import_master_data(&data).unwrap();
        db
    }

    fn send(db: &mut Database, code: &str, json: &str, at: &str) -> (bool, String) {
        let mut output = Vec::new();
        let accepted = run(
            json.as_bytes(),
            &mut output,
            db,
            &EmployeeCode::new(code).unwrap(),
            ts(at),
        )
        .unwrap();
        (accepted, String::from_utf8(output).unwrap())
    }

    #[test]
    fn accepted_report_returns_thresholds() {
        let mut db = db();
        let (accepted, output) = send(
            &mut db,
            "E001",
            r#"{"processName":"Code.exe","windowTitle":"main.rs","reportType":"work_start"}"#,
            "2025-03-03T09:00:00Z",
        );
        assert!(accepted);
        assert_snapshot!(output, @r#"{"description":"Code: main.rs","heartbeatIntervalSeconds":300,"idleThresholdSeconds":300,"offlineThresholdSeconds":600,"ok":true,"serverTime":"2025-03-03T09:00:00Z","status":"work"}"#);
    }

    #[test]
    fn early_shift_end_is_refused_with_data() {
        let mut db = db();
        send(&mut db, "E001", r#"{"processName":"code.exe","reportType":"work_start"}"#, "2025-03-03T09:00:00Z");
        let (accepted, output) = send(
            &mut db,
            "E001",
            r#"{"processName":"code.exe","reportType":"work_end"}"#,
            "2025-03-03T09:05:00Z",
        );
        assert!(!accepted);
        assert_snapshot!(output, @r#"{"data":{"targetSeconds":28800,"workStandardSeconds":300},"error":"work_time_short","httpStatus":400,"message":"standard work time 00:05 is below the target 08:00","ok":false}"#);
    }

    #[test]
    fn unknown_employee_is_refused() {
        let mut db = db();
        let (accepted, output) = send(&mut db, "E404", "{}", "2025-03-03T09:00:00Z");
        assert!(!accepted);
        assert!(output.contains(r#""error":"unknown_employee""#));
        assert!(output.contains(r#""httpStatus":404"#));
    }
}
