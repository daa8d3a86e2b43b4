//! Sweep command: record offline time for employees that went silent.

use std::io::Write;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use ws_db::{Database, SweepStats};

/// Runs one offline sweep at `now` and prints its counts.
pub fn run<W: Write>(writer: &mut W, db: &mut Database, now: DateTime<Utc>) -> Result<SweepStats> {
    let stats = db.sweep_offline(now).context("offline sweep failed")?;
    writeln!(writer, "{}", serde_json::to_string(&stats)?)?;
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    use insta::assert_snapshot;
    use ws_core::EmployeeCode;
    use ws_db::{MasterData, Report};

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn sweep_records_silent_employee_once() {
        let mut db = Database::open_in_memory().unwrap();
        let data: MasterData = serde_json::from_str(
            r#"{"employees": [{"code": "E001", "name": "Ada"}, {"code": "E002", "name": "Bob"}]}"#,
        )
        .unwrap();
        db.import_master_data(&data).unwrap();
        let code = EmployeeCode::new("E001").unwrap();
        db.ingest_report(&code, &Report::default(), ts("2025-03-01T09:00:00Z"))
            .unwrap();

        let mut output = Vec::new();
        run(&mut output, &mut db, ts("2025-03-01T09:30:00Z")).unwrap();
        run(&mut output, &mut db, ts("2025-03-01T09:31:00Z")).unwrap();

        assert_snapshot!(String::from_utf8(output).unwrap(), @r#"
        {"silent":1,"recorded":1,"failed":0}
        {"silent":1,"recorded":1,"failed":0}
        "#);
    }
}
