//! Department attendance policy and end-of-shift evaluation.
//!
//! Evaluation is split from storage: callers measure the session (raw
//! duration, breaks, per-status totals) and [`evaluate`] turns those numbers
//! into a [`Verdict`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::interval::Interval;
use crate::types::{StatusCode, TriggerAction};

/// Work-time and break limits for a department.
///
/// Zero limits are treated as unset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkRule {
    #[serde(default)]
    pub target_seconds: i64,
    #[serde(default)]
    pub max_break_seconds: i64,
    #[serde(default)]
    pub max_break_count: i64,
    #[serde(default)]
    pub max_break_single_seconds: Option<i64>,
}

/// Minimum/maximum seconds allowed in one status over a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusThreshold {
    pub status_code: StatusCode,
    #[serde(default)]
    pub min_seconds: Option<i64>,
    #[serde(default)]
    pub max_seconds: Option<i64>,
    pub trigger_action: TriggerAction,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

const fn default_enabled() -> bool {
    true
}

/// Everything a department configures for shift-end evaluation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DepartmentPolicy {
    #[serde(default)]
    pub rule: Option<WorkRule>,
    #[serde(default)]
    pub thresholds: Vec<StatusThreshold>,
}

impl DepartmentPolicy {
    /// A department with neither a rule nor thresholds is unconfigured and
    /// evaluation is skipped entirely.
    #[must_use]
    pub fn is_configured(&self) -> bool {
        self.rule.is_some() || !self.thresholds.is_empty()
    }
}

/// Break statistics over a session window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakSummary {
    pub count: i64,
    pub total_seconds: i64,
    pub max_single_seconds: i64,
}

/// Seconds spent in each status over a session window.
pub type StatusTotals = BTreeMap<StatusCode, i64>;

/// Totals with every reportable status present at zero.
pub fn empty_status_totals() -> StatusTotals {
    [
        StatusCode::Work,
        StatusCode::Normal,
        StatusCode::Fish,
        StatusCode::Idle,
        StatusCode::Offline,
        StatusCode::Break,
    ]
    .into_iter()
    .map(|status| (status, 0))
    .collect()
}

/// Summarizes break segments clipped to `window`.
pub fn summarize_breaks(window: &Interval, breaks: &[Interval]) -> BreakSummary {
    breaks
        .iter()
        .filter_map(|segment| segment.clip(window))
        .fold(BreakSummary::default(), |mut summary, clipped| {
            let seconds = clipped.seconds();
            summary.count += 1;
            summary.total_seconds += seconds;
            summary.max_single_seconds = summary.max_single_seconds.max(seconds);
            summary
        })
}

/// Sums per-status seconds of segments clipped to `window`.
pub fn status_totals(window: &Interval, segments: &[(StatusCode, Interval)]) -> StatusTotals {
    let mut totals = empty_status_totals();
    for (status, segment) in segments {
        if let Some(clipped) = segment.clip(window) {
            *totals.entry(*status).or_default() += clipped.seconds();
        }
    }
    totals
}

/// What a violation is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    BreakTotal,
    BreakCount,
    BreakSingle,
    StatusThreshold,
}

/// Whether the configured limit is a floor or a ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LimitType {
    Min,
    Max,
}

/// A detected policy breach at shift close.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Violation {
    #[serde(rename = "type")]
    pub kind: ViolationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<StatusCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_label: Option<String>,
    pub trigger_action: TriggerAction,
    /// Seconds, or a count for [`ViolationKind::BreakCount`].
    pub actual_seconds: i64,
    pub limit_seconds: i64,
    pub limit_type: LimitType,
    pub message: String,
}

impl Violation {
    #[must_use]
    pub fn requires_reason(&self) -> bool {
        self.trigger_action == TriggerAction::RequireReason
    }
}

/// Computed numbers carried by a reason-required response and stored on the
/// review record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewPayload {
    pub work_standard_seconds: i64,
    pub break_seconds: i64,
    pub status_totals: StatusTotals,
    pub violations: Vec<Violation>,
}

impl ReviewPayload {
    #[must_use]
    pub fn needs_reason(&self) -> bool {
        self.violations.iter().any(Violation::requires_reason)
    }
}

/// Raw numbers measured over an open session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionMeasurements {
    /// `now - session start`.
    pub raw_seconds: i64,
    pub breaks: BreakSummary,
    pub status_totals: StatusTotals,
}

/// Outcome of shift-end evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Standard work time is below a positive target; closure is refused.
    WorkTimeShort {
        work_standard_seconds: i64,
        target_seconds: i64,
    },
    /// A require-reason violation exists and no reason was supplied.
    NeedsReason(ReviewPayload),
    /// Closure may proceed. `review` is present when any violation exists.
    Proceed {
        review: Option<ReviewPayload>,
        need_reason: bool,
    },
}

/// Evaluates a session against the department policy.
///
/// An unconfigured policy always proceeds with no review. Otherwise breaks
/// are subtracted from the raw duration (floored at zero) to give standard
/// work time.
pub fn evaluate(
    policy: &DepartmentPolicy,
    measured: &SessionMeasurements,
    reason: Option<&str>,
) -> Verdict {
    if !policy.is_configured() {
        return Verdict::Proceed {
            review: None,
            need_reason: false,
        };
    }

    let work_standard_seconds = (measured.raw_seconds - measured.breaks.total_seconds).max(0);
    let rule = policy.rule.clone().unwrap_or_default();

    if rule.target_seconds > 0 && work_standard_seconds < rule.target_seconds {
        return Verdict::WorkTimeShort {
            work_standard_seconds,
            target_seconds: rule.target_seconds,
        };
    }

    let mut violations = break_violations(&rule, &measured.breaks);
    violations.extend(threshold_violations(&policy.thresholds, &measured.status_totals));

    let payload = ReviewPayload {
        work_standard_seconds,
        break_seconds: measured.breaks.total_seconds,
        status_totals: measured.status_totals.clone(),
        violations,
    };
    let need_reason = payload.needs_reason();
    let has_reason = reason.is_some_and(|text| !text.trim().is_empty());

    if need_reason && !has_reason {
        return Verdict::NeedsReason(payload);
    }

    Verdict::Proceed {
        review: (!payload.violations.is_empty()).then_some(payload),
        need_reason,
    }
}

fn break_violations(rule: &WorkRule, breaks: &BreakSummary) -> Vec<Violation> {
    let mut violations = Vec::new();
    if rule.max_break_seconds > 0 && breaks.total_seconds > rule.max_break_seconds {
        violations.push(Violation {
            kind: ViolationKind::BreakTotal,
            status_code: None,
            status_label: None,
            trigger_action: TriggerAction::RequireReason,
            actual_seconds: breaks.total_seconds,
            limit_seconds: rule.max_break_seconds,
            limit_type: LimitType::Max,
            message: format!(
                "total break time exceeds limit ({})",
                format_duration(rule.max_break_seconds)
            ),
        });
    }
    if rule.max_break_count > 0 && breaks.count > rule.max_break_count {
        violations.push(Violation {
            kind: ViolationKind::BreakCount,
            status_code: None,
            status_label: None,
            trigger_action: TriggerAction::RequireReason,
            actual_seconds: breaks.count,
            limit_seconds: rule.max_break_count,
            limit_type: LimitType::Max,
            message: format!("break count exceeds limit ({} breaks)", rule.max_break_count),
        });
    }
    if let Some(max_single) = rule.max_break_single_seconds.filter(|limit| *limit > 0) {
        if breaks.max_single_seconds > max_single {
            violations.push(Violation {
                kind: ViolationKind::BreakSingle,
                status_code: None,
                status_label: None,
                trigger_action: TriggerAction::RequireReason,
                actual_seconds: breaks.max_single_seconds,
                limit_seconds: max_single,
                limit_type: LimitType::Max,
                message: format!("single break exceeds limit ({})", format_duration(max_single)),
            });
        }
    }
    violations
}

fn threshold_violations(thresholds: &[StatusThreshold], totals: &StatusTotals) -> Vec<Violation> {
    let mut violations = Vec::new();
    for threshold in thresholds.iter().filter(|t| t.enabled) {
        let actual = totals.get(&threshold.status_code).copied().unwrap_or(0);
        let label = threshold.status_code.label();
        let violation = |limit_seconds: i64, limit_type: LimitType, message: String| Violation {
            kind: ViolationKind::StatusThreshold,
            status_code: Some(threshold.status_code),
            status_label: Some(label.to_string()),
            trigger_action: threshold.trigger_action,
            actual_seconds: actual,
            limit_seconds,
            limit_type,
            message,
        };
        if let Some(min) = threshold.min_seconds.filter(|min| *min > 0) {
            if actual < min {
                violations.push(violation(
                    min,
                    LimitType::Min,
                    format!("{label} time below minimum ({})", format_duration(min)),
                ));
            }
        }
        if let Some(max) = threshold.max_seconds.filter(|max| *max > 0) {
            if actual > max {
                violations.push(violation(
                    max,
                    LimitType::Max,
                    format!("{label} time above maximum ({})", format_duration(max)),
                ));
            }
        }
    }
    violations
}

/// Whether a stored review still lacks its justification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonStatus {
    NotRequired,
    Supplied,
    Missing,
}

impl ReasonStatus {
    pub fn of(need_reason: bool, reason: Option<&str>) -> Self {
        match (need_reason, reason.map(str::trim)) {
            (false, _) => Self::NotRequired,
            (true, Some(text)) if !text.is_empty() => Self::Supplied,
            (true, _) => Self::Missing,
        }
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::NotRequired => "not_required",
            Self::Supplied => "supplied",
            Self::Missing => "missing",
        }
    }
}

/// One-line summary of violation messages for list views.
///
/// At most three messages are shown; `-` stands for none.
pub fn violation_summary(violations: &[Violation]) -> String {
    let messages: Vec<&str> = violations
        .iter()
        .map(|v| v.message.trim())
        .filter(|m| !m.is_empty())
        .collect();
    match messages.len() {
        0 => "-".to_string(),
        1..=3 => messages.join("; "),
        _ => format!("{} ...", messages[..3].join("; ")),
    }
}

/// Formats seconds as `HH:MM`, clamping negatives to zero.
pub fn format_duration(seconds: i64) -> String {
    let minutes = seconds.max(0) / 60;
    format!("{:02}:{:02}", minutes / 60, minutes % 60)
}
