//! Incident command: outage windows that excuse everyone's offline time.

use std::io::Write;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use ws_core::Interval;
use ws_db::{Database, NewIncident};

use super::util::{parse_date, parse_datetime, write_json_lines};
use crate::IncidentAction;

fn request(
    start: &str,
    end: &str,
    reason: &str,
    note: &str,
    now: DateTime<Utc>,
) -> Result<NewIncident> {
    let start = parse_datetime(start, now).context("invalid --start")?;
    let end = parse_datetime(end, now).context("invalid --end")?;
    Ok(NewIncident {
        interval: Interval::new(start, end).context("invalid incident window")?,
        reason: reason.to_string(),
        note: note.to_string(),
    })
}

pub fn run<W: Write>(
    writer: &mut W,
    db: &mut Database,
    action: &IncidentAction,
    now: DateTime<Utc>,
) -> Result<()> {
    match action {
        IncidentAction::Add {
            start,
            end,
            reason,
            note,
        } => {
            let record = db.add_incident(&request(start, end, reason, note, now)?, now)?;
            writeln!(writer, "{}", serde_json::to_string(&record)?)?;
        }
        IncidentAction::Update {
            id,
            start,
            end,
            reason,
            note,
        } => {
            let record = db.update_incident(*id, &request(start, end, reason, note, now)?, now)?;
            writeln!(writer, "{}", serde_json::to_string(&record)?)?;
        }
        IncidentAction::Revoke { id } => {
            let record = db.revoke_incident(*id, now)?;
            writeln!(writer, "{}", serde_json::to_string(&record)?)?;
        }
        IncidentAction::List { date } => {
            let date = date.as_deref().map(parse_date).transpose()?;
            write_json_lines(writer, &db.list_incidents(date)?)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use insta::assert_snapshot;
    use serde_json::Value;
    use ws_core::EmployeeCode;
    use ws_db::{MasterData, Report};

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn now() -> DateTime<Utc> {
        ts("2025-03-01T18:00:00Z")
    }

    fn code() -> EmployeeCode {
        EmployeeCode::new("E001").unwrap()
    }

    /// E001 is offline from 10:00 to 12:00.
    fn db() -> Database {
        let mut db = Database::open_in_memory().unwrap();
        let data: MasterData =
            serde_json::from_str(r#"{"employees": [{"code": "E001", "name": "Ada"}]}"#).unwrap();
        db.import_master_data(&data).unwrap();
        db.ingest_report(&code(), &Report::default(), ts("2025-03-01T10:00:00Z"))
            .unwrap();
        db.ingest_report(&code(), &Report::default(), ts("2025-03-01T12:00:00Z"))
            .unwrap();
        db
    }

    fn add(start: &str, end: &str) -> IncidentAction {
        IncidentAction::Add {
            start: start.to_string(),
            end: end.to_string(),
            reason: "network outage".to_string(),
            note: String::new(),
        }
    }

    fn exec(db: &mut Database, action: &IncidentAction) -> Result<Value> {
        let mut output = Vec::new();
        run(&mut output, db, action, now())?;
        Ok(serde_json::from_slice(&output)?)
    }

    #[test]
    fn add_prints_the_record_and_excuses_offline_time() {
        let mut db = db();
        let mut output = Vec::new();
        run(
            &mut output,
            &mut db,
            &add("2025-03-01T10:30:00Z", "2025-03-01T11:00:00Z"),
            now(),
        )
        .unwrap();
        assert_snapshot!(String::from_utf8(output).unwrap(), @r#"{"id":1,"start":"2025-03-01T10:30:00Z","end":"2025-03-01T11:00:00Z","reason":"network outage","note":"","status":"active","employees":1,"excusedSeconds":1800,"createdAt":"2025-03-01T18:00:00Z","updatedAt":"2025-03-01T18:00:00Z"}"#);

        let stats = db.daily_stats(&code(), "2025-03-01".parse().unwrap()).unwrap();
        assert_eq!(stats.offline_seconds, 7200 - 1800);
        assert_eq!(stats.work_seconds, 0);
    }

    #[test]
    fn update_revoke_and_list() {
        let mut db = db();
        exec(&mut db, &add("2025-03-01T10:30:00Z", "2025-03-01T11:00:00Z")).unwrap();

        let updated = exec(
            &mut db,
            &IncidentAction::Update {
                id: 1,
                start: "2025-03-01T10:00:00Z".to_string(),
                end: "2025-03-01T12:00:00Z".to_string(),
                reason: "network outage".to_string(),
                note: "whole window".to_string(),
            },
        )
        .unwrap();
        assert_eq!(updated["excusedSeconds"], 7200);

        let revoked = exec(&mut db, &IncidentAction::Revoke { id: 1 }).unwrap();
        assert_eq!(revoked["status"], "revoked");
        let stats = db.daily_stats(&code(), "2025-03-01".parse().unwrap()).unwrap();
        assert_eq!(stats.offline_seconds, 7200);

        let mut output = Vec::new();
        let list = IncidentAction::List {
            date: Some("2025-03-01".to_string()),
        };
        run(&mut output, &mut db, &list, now()).unwrap();
        assert_eq!(String::from_utf8(output).unwrap().lines().count(), 1);
    }

    #[test]
    fn inverted_window_is_refused_before_touching_the_store() {
        let mut db = db();
        let err = exec(&mut db, &add("2025-03-01T11:00:00Z", "2025-03-01T10:00:00Z")).unwrap_err();
        assert!(err.to_string().contains("invalid incident window"));
        assert!(db.list_incidents(None).unwrap().is_empty());
    }
}
