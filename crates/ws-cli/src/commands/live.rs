//! Live command: the presence view of every employee at one instant.

use std::io::Write;

use anyhow::Result;
use chrono::{DateTime, Utc};
use ws_db::Database;

use super::util::write_json_lines;

pub fn run<W: Write>(writer: &mut W, db: &Database, now: DateTime<Utc>) -> Result<()> {
    write_json_lines(writer, &db.live_snapshot(now)?)
}
