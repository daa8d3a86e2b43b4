//! Read-side commands over the timeline: daily statistics, segments of one
//! employee and the offline segments of everyone.

use std::io::Write;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use ws_core::{EmployeeCode, day_bounds};
use ws_db::Database;

use super::util::write_json_lines;

/// Prints the statistic bucket of `code` on `date`.
pub fn stats<W: Write>(writer: &mut W, db: &Database, code: &EmployeeCode, date: NaiveDate) -> Result<()> {
    let stats = db.daily_stats(code, date)?;
    writeln!(writer, "{}", serde_json::to_string(&stats)?)?;
    Ok(())
}

/// Prints every segment of `code` intersecting the local day `date`.
pub fn segments<W: Write>(writer: &mut W, db: &Database, code: &EmployeeCode, date: NaiveDate) -> Result<()> {
    let window = day_bounds(date, &db.settings().utc_offset)
        .with_context(|| format!("{date} has no local midnight"))?;
    write_json_lines(writer, &db.segments(code, &window)?)
}

/// Prints the offline segments of all employees on `date`.
pub fn offline<W: Write>(writer: &mut W, db: &Database, date: NaiveDate) -> Result<()> {
    write_json_lines(writer, &db.offline_segments_on(date)?)
}
