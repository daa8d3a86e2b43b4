//! Reviews command: shift reviews written at session close.

use std::io::Write;

use anyhow::Result;
use chrono::{Days, NaiveDate};
use ws_db::Database;

use super::util::write_json_lines;

/// Days listed when only the end of the range is given.
const DEFAULT_RANGE_DAYS: u64 = 7;

/// Which reviews to print.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    One(i64),
    Range { from: Option<NaiveDate>, to: NaiveDate },
}

pub fn run<W: Write>(writer: &mut W, db: &Database, selection: Selection) -> Result<()> {
    match selection {
        Selection::One(id) => {
            let review = db.review(id)?;
            writeln!(writer, "{}", serde_json::to_string(&review)?)?;
        }
        Selection::Range { from, to } => {
            let from = from.unwrap_or_else(|| {
                to.checked_sub_days(Days::new(DEFAULT_RANGE_DAYS))
                    .unwrap_or(NaiveDate::MIN)
            });
            if from > to {
                anyhow::bail!("--from {from} is after --to {to}");
            }
            write_json_lines(writer, &db.list_reviews(from, to)?)?;
        }
    }
    Ok(())
}
