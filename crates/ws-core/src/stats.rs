//! Per-day statistic counters and the status-to-counter mapping.

use std::ops::Neg;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::types::StatusCode;

/// Signed second deltas for one daily statistic bucket.
///
/// Attendance is work + normal + fish; effective is work only.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyIncrement {
    pub work: i64,
    pub normal: i64,
    pub fish: i64,
    pub idle: i64,
    pub offline: i64,
    pub attendance: i64,
    pub effective: i64,
}

impl DailyIncrement {
    /// The counter deltas contributed by `seconds` spent in `status`.
    ///
    /// `break` and `incident` time contribute to no counter.
    #[must_use]
    pub fn for_status(status: StatusCode, seconds: i64) -> Self {
        let mut inc = Self::default();
        match status {
            StatusCode::Work => {
                inc.work = seconds;
                inc.attendance = seconds;
                inc.effective = seconds;
            }
            StatusCode::Normal => {
                inc.normal = seconds;
                inc.attendance = seconds;
            }
            StatusCode::Fish => {
                inc.fish = seconds;
                inc.attendance = seconds;
            }
            StatusCode::Idle => inc.idle = seconds,
            StatusCode::Offline => inc.offline = seconds,
            StatusCode::Break | StatusCode::Incident => {}
        }
        inc
    }

    /// Whether applying this increment would change nothing.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }
}

impl Neg for DailyIncrement {
    type Output = Self;

    fn neg(self) -> Self {
        Self {
            work: -self.work,
            normal: -self.normal,
            fish: -self.fish,
            idle: -self.idle,
            offline: -self.offline,
            attendance: -self.attendance,
            effective: -self.effective,
        }
    }
}

impl std::ops::Add for DailyIncrement {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            work: self.work + rhs.work,
            normal: self.normal + rhs.normal,
            fish: self.fish + rhs.fish,
            idle: self.idle + rhs.idle,
            offline: self.offline + rhs.offline,
            attendance: self.attendance + rhs.attendance,
            effective: self.effective + rhs.effective,
        }
    }
}

/// A stored daily statistic bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyStats {
    pub date: NaiveDate,
    pub work_seconds: i64,
    pub normal_seconds: i64,
    pub fish_seconds: i64,
    pub idle_seconds: i64,
    pub offline_seconds: i64,
    pub attendance_seconds: i64,
    pub effective_seconds: i64,
}

impl DailyStats {
    /// An empty bucket for `date`.
    #[must_use]
    pub const fn empty(date: NaiveDate) -> Self {
        Self {
            date,
            work_seconds: 0,
            normal_seconds: 0,
            fish_seconds: 0,
            idle_seconds: 0,
            offline_seconds: 0,
            attendance_seconds: 0,
            effective_seconds: 0,
        }
    }
}
