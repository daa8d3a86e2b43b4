//! Live presence of a worker, derived from session state and report recency.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{EmployeeCode, StatusCode};

/// Status code shown for workers without an open session.
pub const OFF_WORK: &str = "offwork";

/// Where a worker stands right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    /// Open session and a report within the offline threshold.
    OnShift,
    /// No open session. Recency does not matter once the shift is over.
    OffShift,
    /// Open session but silent beyond the offline threshold, or never seen.
    Stale,
}

impl Presence {
    /// Computes presence from session existence and the time since last seen.
    pub fn compute(
        has_open_session: bool,
        last_seen: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        offline_threshold_seconds: i64,
    ) -> Self {
        if !has_open_session {
            return Self::OffShift;
        }
        match last_seen {
            Some(seen) if now.signed_duration_since(seen).num_seconds() <= offline_threshold_seconds => {
                Self::OnShift
            }
            _ => Self::Stale,
        }
    }

    /// The displayed status code and label, given the last classified status.
    pub fn display(self, last_status: Option<StatusCode>) -> (&'static str, &'static str) {
        match self {
            Self::OnShift => {
                let status = last_status.unwrap_or(StatusCode::Normal);
                (status.as_str(), status.label())
            }
            Self::OffShift => (OFF_WORK, "Off work"),
            Self::Stale => (StatusCode::Offline.as_str(), StatusCode::Offline.label()),
        }
    }
}

/// Per-worker timeline state needed to render a live view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceInput {
    pub employee_code: EmployeeCode,
    pub name: String,
    pub last_seen: Option<DateTime<Utc>>,
    pub last_status: Option<StatusCode>,
    pub last_description: String,
    pub has_open_session: bool,
}

/// One live-status update as pushed to dashboards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveView {
    pub employee_code: EmployeeCode,
    pub name: String,
    pub status_code: String,
    pub status_label: String,
    pub description: String,
    pub last_seen: Option<DateTime<Utc>>,
    pub delay_seconds: i64,
    pub working: bool,
}

impl LiveView {
    pub fn build(input: &PresenceInput, now: DateTime<Utc>, offline_threshold_seconds: i64) -> Self {
        let presence = Presence::compute(
            input.has_open_session,
            input.last_seen,
            now,
            offline_threshold_seconds,
        );
        let (status_code, status_label) = presence.display(input.last_status);
        Self {
            employee_code: input.employee_code.clone(),
            name: input.name.clone(),
            status_code: status_code.to_string(),
            status_label: status_label.to_string(),
            description: input.last_description.clone(),
            last_seen: input.last_seen,
            delay_seconds: input
                .last_seen
                .map_or(0, |seen| now.signed_duration_since(seen).num_seconds().max(0)),
            working: input.has_open_session,
        }
    }
}
