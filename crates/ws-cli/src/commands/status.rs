//! Status command for a quick health overview of the store.

use std::io::Write;

use anyhow::{Context, Result};

use ws_db::Database;

use crate::Config;

pub fn run<W: Write>(writer: &mut W, config: &Config) -> Result<()> {
    let db = Database::open(&config.database_path)
        .with_context(|| format!("failed to open {}", config.database_path.display()))?;
    let overview = db.overview()?;

    writeln!(writer, "Worksentry status")?;
    writeln!(writer, "Database: {}", config.database_path.display())?;
    writeln!(writer, "Employees: {}", overview.employees)?;
    writeln!(writer, "Open sessions: {}", overview.open_sessions)?;
    writeln!(writer, "Segments: {}", overview.segments)?;
    writeln!(writer, "Raw events: {}", overview.raw_events)?;

    match overview.last_report {
        Some(at) => writeln!(writer, "Last report: {}", at.to_rfc3339())?,
        None => writeln!(writer, "No reports recorded.")?,
    }

    Ok(())
}
