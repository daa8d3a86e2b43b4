//! Offline gap detection and raw-event retention.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{TransactionBehavior, params};
use serde::Serialize;
use tracing::{debug, info, warn};
use ws_core::{EmployeeCode, Interval, SegmentSource, StatusCode};

use crate::timeline::{NewSegment, materialize};
use crate::{Database, DbError, employee_by_id, format_timestamp, truncate_to_second};

/// Outcome of one offline sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepStats {
    /// Employees whose last report is older than the offline threshold.
    pub silent: usize,
    /// Employees that got new offline time recorded.
    pub recorded: usize,
    /// Employees skipped because of a storage error.
    pub failed: usize,
}

impl Database {
    /// Records offline time for every employee silent for longer than the
    /// offline threshold, up to `now`.
    ///
    /// Each employee is handled in its own transaction; a failure is logged
    /// and the sweep moves on, so the next sweep retries it.
    pub fn sweep_offline(&mut self, now: DateTime<Utc>) -> Result<SweepStats, DbError> {
        let now = truncate_to_second(now);
        let threshold = self.settings.offline_threshold_seconds;
        let mut stats = SweepStats::default();
        if threshold <= 0 {
            return Ok(stats);
        }

        let candidates: Vec<(i64, EmployeeCode)> = self
            .list_employees()?
            .into_iter()
            .filter(|employee| {
                employee
                    .timeline
                    .last_seen
                    .is_some_and(|seen| (now - seen).num_seconds() > threshold)
            })
            .map(|employee| (employee.id, employee.code))
            .collect();

        for (id, code) in candidates {
            stats.silent += 1;
            match self.record_offline(id, now) {
                Ok(Some(interval)) => {
                    stats.recorded += 1;
                    debug!(employee = %code, start = %interval.start, end = %interval.end, "offline time recorded");
                }
                Ok(None) => {}
                Err(err) => {
                    stats.failed += 1;
                    warn!(employee = %code, error = %err, "offline sweep failed for employee");
                }
            }
        }

        if stats.recorded > 0 || stats.failed > 0 {
            info!(
                silent = stats.silent,
                recorded = stats.recorded,
                failed = stats.failed,
                "offline sweep finished"
            );
        }
        Ok(stats)
    }

    fn record_offline(
        &mut self,
        employee_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<Interval>, DbError> {
        let offset = self.settings.utc_offset;
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        // A report may have arrived since the candidate list was read
        let timeline = employee_by_id(&tx, employee_id)?.timeline;
        let Some(last_seen) = timeline.last_seen else {
            return Ok(None);
        };
        if (now - last_seen).num_seconds() <= self.settings.offline_threshold_seconds {
            return Ok(None);
        }
        let start = timeline.watermark.map_or(last_seen, |wm| wm.max(last_seen));
        let Ok(gap) = Interval::new(start, now) else {
            return Ok(None);
        };

        let segment = NewSegment {
            interval: gap,
            status: StatusCode::Offline,
            description: "",
            source: SegmentSource::Offline,
        };
        let written = materialize(&tx, employee_id, timeline.watermark, segment, &offset)?;
        tx.commit()?;
        Ok(written)
    }

    /// Deletes raw events received more than `retention_days` before `now`.
    pub fn cleanup_raw_events(
        &self,
        now: DateTime<Utc>,
        retention_days: i64,
    ) -> Result<usize, DbError> {
        let cutoff = truncate_to_second(now) - Duration::days(retention_days);
        let deleted = self.conn.execute(
            "DELETE FROM raw_events WHERE received_at < ?",
            params![format_timestamp(cutoff)],
        )?;
        if deleted > 0 {
            info!(deleted, cutoff = %cutoff, "raw events cleaned up");
        }
        Ok(deleted)
    }
}
