//! Import command for loading master data into the local `SQLite` store.

use std::io::{Read, Write};

use anyhow::{Context, Result};
use ws_db::{Database, ImportStats, MasterData};

/// Reads one master-data JSON document and loads it.
pub fn run<R: Read, W: Write>(reader: R, writer: &mut W, db: &mut Database) -> Result<ImportStats> {
    let data: MasterData = serde_json::from_reader(reader).context("invalid master data JSON")?;
    let stats = db
        .import_master_data(&data)
        .context("failed to import master data")?;
    writeln!(writer, "{}", serde_json::to_string(&stats)?)?;
    Ok(stats)
}
