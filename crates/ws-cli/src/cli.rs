//! Command-line argument definitions.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Workforce activity timeline and attendance engine.
///
/// Turns worker activity reports into a classified timeline with daily
/// statistics, detects offline gaps, reconciles manual corrections and
/// evaluates shift-end policy.
#[derive(Debug, Parser)]
#[command(name = "worksentry", version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to config file.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Load master data (departments, employees, rules) as JSON from stdin.
    Import,

    /// Ingest one report (JSON on stdin) for an employee.
    Report {
        /// Employee code.
        #[arg(long)]
        employee: String,

        /// Receive time (ISO 8601 or relative, e.g. '5 minutes ago'). Defaults to now.
        #[arg(long)]
        at: Option<String>,
    },

    /// Serve reports as JSON lines on stdin, running background sweeps.
    Serve,

    /// Record offline time for silent employees once.
    Sweep {
        /// Sweep time (ISO 8601 or relative). Defaults to now.
        #[arg(long)]
        at: Option<String>,
    },

    /// Manage manual adjustments.
    #[command(subcommand)]
    Adjust(AdjustAction),

    /// Manage system incident windows.
    #[command(subcommand)]
    Incident(IncidentAction),

    /// Show daily statistics for an employee.
    Stats {
        /// Employee code.
        #[arg(long)]
        employee: String,

        /// Calendar date (YYYY-MM-DD). Defaults to today.
        #[arg(long)]
        date: Option<String>,
    },

    /// List timeline segments of an employee for one day.
    Segments {
        /// Employee code.
        #[arg(long)]
        employee: String,

        /// Calendar date (YYYY-MM-DD). Defaults to today.
        #[arg(long)]
        date: Option<String>,
    },

    /// List offline segments of all employees for one day.
    Offline {
        /// Calendar date (YYYY-MM-DD). Defaults to today.
        #[arg(long)]
        date: Option<String>,
    },

    /// Print the live view of every employee.
    Live {
        /// Evaluation time (ISO 8601 or relative). Defaults to now.
        #[arg(long)]
        at: Option<String>,
    },

    /// List shift reviews by work date, or show one review.
    Reviews {
        /// First work date (YYYY-MM-DD). Defaults to seven days before --to.
        #[arg(long)]
        from: Option<String>,

        /// Last work date (YYYY-MM-DD). Defaults to today.
        #[arg(long)]
        to: Option<String>,

        /// Show a single review by id.
        #[arg(long, conflicts_with_all = ["from", "to"])]
        id: Option<i64>,
    },

    /// Print the checkout form an employee must submit at shift end.
    Checkout {
        /// Employee code.
        #[arg(long)]
        employee: String,
    },

    /// Show database status.
    Status,
}

/// Manual adjustment actions.
#[derive(Debug, Subcommand)]
pub enum AdjustAction {
    /// Mark offline time as worked.
    Add {
        /// Employee code.
        #[arg(long)]
        employee: String,

        /// Start of the adjusted interval (ISO 8601).
        #[arg(long)]
        start: String,

        /// End of the adjusted interval (ISO 8601).
        #[arg(long)]
        end: String,

        #[arg(long)]
        reason: String,

        #[arg(long)]
        note: String,

        /// Who entered the correction.
        #[arg(long, default_value = "operator")]
        operator: String,
    },

    /// Move an active adjustment to a new interval.
    Update {
        /// Adjustment id.
        id: i64,

        #[arg(long)]
        start: String,

        #[arg(long)]
        end: String,

        #[arg(long)]
        reason: String,

        #[arg(long)]
        note: String,
    },

    /// Revoke an active adjustment.
    Revoke {
        /// Adjustment id.
        id: i64,
    },

    /// List adjustments.
    List {
        /// Only this employee.
        #[arg(long)]
        employee: Option<String>,

        /// Only adjustments touching this date (YYYY-MM-DD).
        #[arg(long)]
        date: Option<String>,
    },
}

/// System incident actions.
#[derive(Debug, Subcommand)]
pub enum IncidentAction {
    /// Record an outage and excuse the offline time inside it.
    Add {
        /// Start of the outage (ISO 8601).
        #[arg(long)]
        start: String,

        /// End of the outage (ISO 8601).
        #[arg(long)]
        end: String,

        #[arg(long)]
        reason: String,

        #[arg(long, default_value = "")]
        note: String,
    },

    /// Move an active incident to a new window.
    Update {
        /// Incident id.
        id: i64,

        #[arg(long)]
        start: String,

        #[arg(long)]
        end: String,

        #[arg(long)]
        reason: String,

        #[arg(long, default_value = "")]
        note: String,
    },

    /// Revoke an active incident.
    Revoke {
        /// Incident id.
        id: i64,
    },

    /// List incidents.
    List {
        /// Only incidents touching this date (YYYY-MM-DD).
        #[arg(long)]
        date: Option<String>,
    },
}
