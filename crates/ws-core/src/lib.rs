//! Core domain logic for the activity timeline and attendance engine.
//!
//! This crate contains the storage-free parts of the engine:
//! - Classification: turning an activity report into a status code
//! - Intervals: day splitting, clipping and offline coverage checks
//! - Statistics: status-to-counter increments for daily buckets
//! - Policy: shift-end break and threshold evaluation
//! - Checkout: shift-end form validation
//! - Presence: the live on-shift / off-shift / stale view

pub mod checkout;
pub mod classify;
pub mod interval;
pub mod policy;
pub mod presence;
pub mod stats;
pub mod types;

pub use checkout::{CheckoutError, CheckoutSubmission, CheckoutTemplate};
pub use classify::{Activity, MatchMode, Rule, RuleType, classify, describe};
pub use interval::{
    CoverageGap, DayPart, Interval, check_coverage, day_bounds, split_by_day, uncovered_parts,
};
pub use policy::{
    BreakSummary, DepartmentPolicy, ReasonStatus, ReviewPayload, SessionMeasurements,
    StatusThreshold, Verdict, Violation, WorkRule, evaluate, violation_summary,
};
pub use presence::{LiveView, Presence, PresenceInput};
pub use stats::{DailyIncrement, DailyStats};
pub use types::{
    AdjustmentStatus, EmployeeCode, ReportKind, SegmentSource, StatusCode, TriggerAction,
    ValidationError,
};
