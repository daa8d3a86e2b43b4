//! Storage layer for the activity timeline and attendance engine.
//!
//! Provides persistence for timelines, segments, daily statistics, work
//! sessions, manual adjustments, system incidents and shift reviews using
//! `rusqlite`, and hosts the engine operations that must read and write them
//! atomically.
//!
//! # Thread Safety
//!
//! The [`Database`] type wraps a `rusqlite::Connection`, which is `Send` but not `Sync`.
//! Concurrent callers open one `Database` per task; writers serialize on
//! SQLite's `BEGIN IMMEDIATE` lock and wait up to the busy timeout.
//!
//! # Schema
//!
//! ## Timestamp Format
//!
//! Timestamps are stored as TEXT in RFC 3339 UTC with whole seconds
//! (e.g. `2025-03-01T09:00:00Z`). Every writer truncates to the second, so
//! lexicographic ordering matches chronological ordering and equality checks
//! on segment boundaries are exact.
//!
//! ## Calendar Dates
//!
//! Daily statistics and review work dates are keyed by `YYYY-MM-DD` in the
//! configured UTC offset (see [`EngineSettings::utc_offset`]).
//!
//! ## Employee Timeline State
//!
//! Each `employees` row carries the timeline state: last seen time, last
//! status and description, and the watermark. The watermark is the exclusive
//! upper bound of time already materialized into segments and statistics and
//! never moves backwards.

mod adjust;
mod closure;
mod incident;
mod master;
mod report;
mod sweep;
mod timeline;

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, NaiveDate, Offset, SecondsFormat, Timelike, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use thiserror::Error;
use ws_core::{EmployeeCode, StatusCode, ValidationError};

pub use adjust::{AdjustmentError, AdjustmentRecord, NewAdjustment};
pub use closure::{CloseError, ClosedSession, ReviewRecord};
pub use incident::{IncidentError, IncidentRecord, NewIncident};
pub use master::{
    CheckoutFieldImport, CheckoutTemplateImport, DepartmentImport, EmployeeImport, ImportStats,
    MasterData,
};
pub use report::{Overview, Report, ReportOutcome, ReportResponse};
pub use sweep::SweepStats;
pub use timeline::{SegmentRecord, SegmentWrite};

/// Database errors.
#[derive(Debug, Error)]
pub enum DbError {
    /// An error from the underlying database.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// Failed to parse a stored timestamp.
    #[error("invalid timestamp: {value}")]
    TimestampParse {
        value: String,
        #[source]
        source: chrono::ParseError,
    },
    /// A stored JSON document could not be read or written.
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    /// A stored or supplied value failed domain validation.
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// No employee has the given code.
    #[error("unknown employee: {0}")]
    UnknownEmployee(String),
    /// A row referenced by id does not exist.
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },
    /// A manual adjustment was rejected.
    #[error(transparent)]
    Adjustment(#[from] AdjustmentError),
    /// A system incident was rejected.
    #[error(transparent)]
    Incident(#[from] IncidentError),
}

/// Engine thresholds and the calendar used for day splitting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSettings {
    /// Offset whose midnights split daily statistics.
    pub utc_offset: FixedOffset,
    pub idle_threshold_seconds: i64,
    pub heartbeat_interval_seconds: i64,
    pub offline_threshold_seconds: i64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            utc_offset: Utc.fix(),
            idle_threshold_seconds: 300,
            heartbeat_interval_seconds: 300,
            offline_threshold_seconds: 600,
        }
    }
}

/// Database connection wrapper.
///
/// See the [module documentation](self) for thread safety considerations.
pub struct Database {
    conn: Connection,
    settings: EngineSettings,
}

/// Timeline state stored on the employee row.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimelineState {
    pub last_seen: Option<DateTime<Utc>>,
    pub last_status: Option<StatusCode>,
    pub last_description: String,
    pub watermark: Option<DateTime<Utc>>,
}

/// A monitored worker with its timeline state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Employee {
    pub id: i64,
    pub code: EmployeeCode,
    pub name: String,
    pub department_id: Option<i64>,
    pub timeline: TimelineState,
}

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

impl Database {
    /// Opens a database at the given path, creating it if necessary.
    ///
    /// The database schema is automatically initialized on first open.
    pub fn open(path: &Path) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        let db = Self {
            conn,
            settings: EngineSettings::default(),
        };
        db.init()?;
        Ok(db)
    }

    /// Opens an in-memory database.
    ///
    /// Useful for testing. The database is destroyed when the connection closes.
    pub fn open_in_memory() -> Result<Self, DbError> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn,
            settings: EngineSettings::default(),
        };
        db.init()?;
        Ok(db)
    }

    #[must_use]
    pub fn with_settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    pub const fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Initializes the database schema.
    ///
    /// This is idempotent - safe to call on an already-initialized database.
    fn init(&self) -> Result<(), DbError> {
        self.conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS departments (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL UNIQUE
            );

            -- Absent row: no work rule configured for the department
            CREATE TABLE IF NOT EXISTS department_rules (
                department_id INTEGER PRIMARY KEY,
                target_seconds INTEGER NOT NULL DEFAULT 0,
                max_break_seconds INTEGER NOT NULL DEFAULT 0,
                max_break_count INTEGER NOT NULL DEFAULT 0,
                max_break_single_seconds INTEGER,
                FOREIGN KEY (department_id) REFERENCES departments(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS status_thresholds (
                id INTEGER PRIMARY KEY,
                department_id INTEGER NOT NULL,
                status_code TEXT NOT NULL,
                min_seconds INTEGER,
                max_seconds INTEGER,
                trigger_action TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                UNIQUE (department_id, status_code),
                FOREIGN KEY (department_id) REFERENCES departments(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS classification_rules (
                id INTEGER PRIMARY KEY,
                rule_type TEXT NOT NULL,
                match_mode TEXT NOT NULL,
                match_value TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                UNIQUE (rule_type, match_mode, match_value)
            );

            CREATE TABLE IF NOT EXISTS checkout_templates (
                id INTEGER PRIMARY KEY,
                department_id INTEGER NOT NULL,
                name TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                FOREIGN KEY (department_id) REFERENCES departments(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_checkout_templates_department
                ON checkout_templates(department_id, enabled);

            -- options_json: JSON array of select options
            CREATE TABLE IF NOT EXISTS checkout_fields (
                id INTEGER PRIMARY KEY,
                template_id INTEGER NOT NULL,
                name TEXT NOT NULL,
                type TEXT NOT NULL,
                required INTEGER NOT NULL DEFAULT 0,
                options_json TEXT NOT NULL DEFAULT '[]',
                sort_order INTEGER NOT NULL DEFAULT 0,
                enabled INTEGER NOT NULL DEFAULT 1,
                FOREIGN KEY (template_id) REFERENCES checkout_templates(id) ON DELETE CASCADE
            );

            -- Timeline state lives on the employee row
            -- watermark: exclusive end of time already materialized
            CREATE TABLE IF NOT EXISTS employees (
                id INTEGER PRIMARY KEY,
                code TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL,
                department_id INTEGER,
                last_seen_at TEXT,
                last_status TEXT,
                last_description TEXT NOT NULL DEFAULT '',
                watermark TEXT,
                FOREIGN KEY (department_id) REFERENCES departments(id) ON DELETE SET NULL
            );

            CREATE TABLE IF NOT EXISTS work_sessions (
                id INTEGER PRIMARY KEY,
                employee_id INTEGER NOT NULL,
                start_at TEXT NOT NULL,
                end_at TEXT,
                FOREIGN KEY (employee_id) REFERENCES employees(id) ON DELETE CASCADE
            );

            -- At most one open session per employee
            CREATE UNIQUE INDEX IF NOT EXISTS idx_work_sessions_open
                ON work_sessions(employee_id) WHERE end_at IS NULL;

            CREATE TABLE IF NOT EXISTS work_session_checkouts (
                id INTEGER PRIMARY KEY,
                work_session_id INTEGER NOT NULL UNIQUE,
                template_id INTEGER NOT NULL,
                template_snapshot_json TEXT NOT NULL,
                data_json TEXT NOT NULL,
                created_at TEXT NOT NULL,
                FOREIGN KEY (work_session_id) REFERENCES work_sessions(id) ON DELETE CASCADE
            );

            -- payload_json: totals and violations as returned to the client
            CREATE TABLE IF NOT EXISTS work_session_reviews (
                id INTEGER PRIMARY KEY,
                work_session_id INTEGER NOT NULL UNIQUE,
                employee_id INTEGER NOT NULL,
                work_date TEXT NOT NULL,
                work_standard_seconds INTEGER NOT NULL,
                break_seconds INTEGER NOT NULL,
                need_reason INTEGER NOT NULL,
                reason TEXT,
                payload_json TEXT NOT NULL,
                created_at TEXT NOT NULL,
                FOREIGN KEY (work_session_id) REFERENCES work_sessions(id) ON DELETE CASCADE,
                FOREIGN KEY (employee_id) REFERENCES employees(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_reviews_work_date ON work_session_reviews(work_date);

            CREATE TABLE IF NOT EXISTS manual_adjustments (
                id INTEGER PRIMARY KEY,
                employee_id INTEGER NOT NULL,
                start_at TEXT NOT NULL,
                end_at TEXT NOT NULL,
                reason TEXT NOT NULL,
                note TEXT NOT NULL,
                operator TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'active',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                FOREIGN KEY (employee_id) REFERENCES employees(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_manual_adjustments_employee
                ON manual_adjustments(employee_id, start_at);

            CREATE TABLE IF NOT EXISTS system_incidents (
                id INTEGER PRIMARY KEY,
                start_at TEXT NOT NULL,
                end_at TEXT NOT NULL,
                reason TEXT NOT NULL,
                note TEXT NOT NULL DEFAULT '',
                status TEXT NOT NULL DEFAULT 'active',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            -- Segments are half-open [start_at, end_at)
            -- adjustment_id: set only for source = 'manual'
            -- incident_id: set only for source = 'incident'
            CREATE TABLE IF NOT EXISTS time_segments (
                id INTEGER PRIMARY KEY,
                employee_id INTEGER NOT NULL,
                start_at TEXT NOT NULL,
                end_at TEXT NOT NULL,
                status TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                source TEXT NOT NULL,
                adjustment_id INTEGER,
                incident_id INTEGER,
                FOREIGN KEY (employee_id) REFERENCES employees(id) ON DELETE CASCADE,
                FOREIGN KEY (adjustment_id) REFERENCES manual_adjustments(id) ON DELETE SET NULL,
                FOREIGN KEY (incident_id) REFERENCES system_incidents(id) ON DELETE SET NULL
            );

            CREATE INDEX IF NOT EXISTS idx_segments_employee_end ON time_segments(employee_id, end_at);
            CREATE INDEX IF NOT EXISTS idx_segments_employee_start ON time_segments(employee_id, start_at);
            CREATE INDEX IF NOT EXISTS idx_segments_source ON time_segments(source, start_at);

            CREATE TABLE IF NOT EXISTS daily_stats (
                employee_id INTEGER NOT NULL,
                stat_date TEXT NOT NULL,
                work_seconds INTEGER NOT NULL DEFAULT 0,
                normal_seconds INTEGER NOT NULL DEFAULT 0,
                fish_seconds INTEGER NOT NULL DEFAULT 0,
                idle_seconds INTEGER NOT NULL DEFAULT 0,
                offline_seconds INTEGER NOT NULL DEFAULT 0,
                attendance_seconds INTEGER NOT NULL DEFAULT 0,
                effective_seconds INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (employee_id, stat_date),
                FOREIGN KEY (employee_id) REFERENCES employees(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS raw_events (
                id INTEGER PRIMARY KEY,
                employee_id INTEGER NOT NULL,
                received_at TEXT NOT NULL,
                kind TEXT NOT NULL,
                process_name TEXT NOT NULL DEFAULT '',
                window_title TEXT NOT NULL DEFAULT '',
                idle_seconds INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL,
                client_version TEXT,
                FOREIGN KEY (employee_id) REFERENCES employees(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_raw_events_received ON raw_events(received_at);
            ",
        )?;
        Ok(())
    }

    /// Looks up an employee by code.
    pub fn employee(&self, code: &EmployeeCode) -> Result<Employee, DbError> {
        employee_by_code(&self.conn, code)
    }

    /// Lists all employees ordered by code.
    pub fn list_employees(&self) -> Result<Vec<Employee>, DbError> {
        let mut stmt = self.conn.prepare(&format!("{EMPLOYEE_SELECT} ORDER BY code ASC"))?;
        let rows = stmt.query_map([], employee_row)?;
        let mut employees = Vec::new();
        for row in rows {
            employees.push(row?.into_employee()?);
        }
        Ok(employees)
    }
}

const EMPLOYEE_SELECT: &str = "
    SELECT id, code, name, department_id, last_seen_at, last_status, last_description, watermark
    FROM employees
";

struct EmployeeRow {
    id: i64,
    code: String,
    name: String,
    department_id: Option<i64>,
    last_seen_at: Option<String>,
    last_status: Option<String>,
    last_description: String,
    watermark: Option<String>,
}

fn employee_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<EmployeeRow> {
    Ok(EmployeeRow {
        id: row.get(0)?,
        code: row.get(1)?,
        name: row.get(2)?,
        department_id: row.get(3)?,
        last_seen_at: row.get(4)?,
        last_status: row.get(5)?,
        last_description: row.get(6)?,
        watermark: row.get(7)?,
    })
}

impl EmployeeRow {
    fn into_employee(self) -> Result<Employee, DbError> {
        Ok(Employee {
            id: self.id,
            code: EmployeeCode::new(self.code)?,
            name: self.name,
            department_id: self.department_id,
            timeline: TimelineState {
                last_seen: self.last_seen_at.as_deref().map(parse_timestamp).transpose()?,
                last_status: self.last_status.as_deref().map(str::parse::<StatusCode>).transpose()?,
                last_description: self.last_description,
                watermark: self.watermark.as_deref().map(parse_timestamp).transpose()?,
            },
        })
    }
}

pub(crate) fn employee_by_code(conn: &Connection, code: &EmployeeCode) -> Result<Employee, DbError> {
    let row = conn
        .query_row(
            &format!("{EMPLOYEE_SELECT} WHERE code = ?"),
            params![code.as_str()],
            employee_row,
        )
        .optional()?;
    row.ok_or_else(|| DbError::UnknownEmployee(code.to_string()))?
        .into_employee()
}

pub(crate) fn employee_by_id(conn: &Connection, id: i64) -> Result<Employee, DbError> {
    let row = conn
        .query_row(&format!("{EMPLOYEE_SELECT} WHERE id = ?"), params![id], employee_row)
        .optional()?;
    row.ok_or(DbError::NotFound {
        entity: "employee",
        id,
    })?
    .into_employee()
}

/// Drops sub-second precision; every stored instant is whole seconds.
pub fn truncate_to_second(timestamp: DateTime<Utc>) -> DateTime<Utc> {
    timestamp.with_nanosecond(0).unwrap_or(timestamp)
}

pub(crate) fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, DbError> {
    DateTime::parse_from_rfc3339(value)
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|source| DbError::TimestampParse {
            value: value.to_string(),
            source,
        })
}

pub(crate) fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub(crate) fn format_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

pub(crate) fn parse_date(value: &str) -> Result<NaiveDate, DbError> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d").map_err(|source| DbError::TimestampParse {
        value: value.to_string(),
        source,
    })
}
