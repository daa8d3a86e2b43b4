//! Adjust command: operator corrections that turn offline time into work.

use std::io::Write;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use ws_core::Interval;
use ws_db::{Database, NewAdjustment};

use super::util::{employee_code, parse_date, parse_datetime, write_json_lines};
use crate::AdjustAction;

fn interval(start: &str, end: &str, now: DateTime<Utc>) -> Result<Interval> {
    let start = parse_datetime(start, now).context("invalid --start")?;
    let end = parse_datetime(end, now).context("invalid --end")?;
    Interval::new(start, end).context("invalid adjustment range")
}

/// Executes one adjustment action and prints the affected record(s).
pub fn run<W: Write>(
    writer: &mut W,
    db: &mut Database,
    action: &AdjustAction,
    now: DateTime<Utc>,
) -> Result<()> {
    match action {
        AdjustAction::Add {
            employee,
            start,
            end,
            reason,
            note,
            operator,
        } => {
            let request = NewAdjustment {
                employee_code: employee_code(employee)?,
                interval: interval(start, end, now)?,
                reason: reason.clone(),
                note: note.clone(),
                operator: operator.clone(),
            };
            let record = db.add_adjustment(&request, now)?;
            writeln!(writer, "{}", serde_json::to_string(&record)?)?;
        }
        AdjustAction::Update {
            id,
            start,
            end,
            reason,
            note,
        } => {
            let record = db.update_adjustment(*id, &interval(start, end, now)?, reason, note, now)?;
            writeln!(writer, "{}", serde_json::to_string(&record)?)?;
        }
        AdjustAction::Revoke { id } => {
            let record = db.revoke_adjustment(*id, now)?;
            writeln!(writer, "{}", serde_json::to_string(&record)?)?;
        }
        AdjustAction::List { employee, date } => {
            let code = employee.as_deref().map(employee_code).transpose()?;
            let date = date.as_deref().map(parse_date).transpose()?;
            write_json_lines(writer, &db.list_adjustments(code.as_ref(), date)?)?;
        }
    }
    Ok(())
}
