//! Shared utilities for CLI commands.

use std::io::Write;
use std::sync::LazyLock;

use anyhow::Context;
use chrono::{DateTime, Duration, FixedOffset, NaiveDate, Utc};
use regex::Regex;
use serde::Serialize;
use ws_core::EmployeeCode;

/// Pre-compiled regex for relative time parsing.
static RELATIVE_TIME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+)\s+(second|minute|hour|day)s?\s+ago$").unwrap());

/// Conservative bounds for relative time parsing (~100 years in seconds).
const MAX_RELATIVE_SECONDS: i64 = 100 * 365 * 24 * 60 * 60;

/// Parse a datetime string as either ISO 8601 or relative time.
///
/// Supports:
/// - ISO 8601: "2026-01-15T10:30:00Z"
/// - Relative: "90 seconds ago", "30 minutes ago", "2 hours ago", "1 day ago"
pub fn parse_datetime(s: &str, now: DateTime<Utc>) -> anyhow::Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }

    let Some(caps) = RELATIVE_TIME_RE.captures(s.trim()) else {
        anyhow::bail!(
            "Invalid datetime: {s}. Use ISO 8601 (e.g., 2026-01-15T10:30:00Z) or relative (e.g., '5 minutes ago')"
        );
    };

    let n: i64 = caps[1]
        .parse()
        .context("failed to parse number in relative time")?;

    let seconds_per_unit = match &caps[2] {
        "second" => 1,
        "minute" => 60,
        "hour" => 60 * 60,
        "day" => 24 * 60 * 60,
        unit => anyhow::bail!("Unknown time unit: {unit}"),
    };

    if n > MAX_RELATIVE_SECONDS / seconds_per_unit {
        anyhow::bail!("Relative time value too large: {n} {}", &caps[2]);
    }

    Ok(now - Duration::seconds(n * seconds_per_unit))
}

/// The given time, or now when absent.
pub fn time_or_now(s: Option<&str>) -> anyhow::Result<DateTime<Utc>> {
    let now = Utc::now();
    s.map_or(Ok(now), |s| parse_datetime(s, now))
}

pub fn parse_date(s: &str) -> anyhow::Result<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .with_context(|| format!("invalid date: {s}, expected YYYY-MM-DD"))
}

/// Parses `YYYY-MM-DD`, defaulting to today in `offset`.
pub fn date_or_today(s: Option<&str>, offset: &FixedOffset) -> anyhow::Result<NaiveDate> {
    s.map_or_else(|| Ok(Utc::now().with_timezone(offset).date_naive()), parse_date)
}

pub fn employee_code(s: &str) -> anyhow::Result<EmployeeCode> {
    EmployeeCode::new(s).context("invalid employee code")
}

/// Writes each item as one JSON line.
pub fn write_json_lines<W: Write, T: Serialize>(writer: &mut W, items: &[T]) -> anyhow::Result<()> {
    for item in items {
        writeln!(writer, "{}", serde_json::to_string(item)?)?;
    }
    Ok(())
}
