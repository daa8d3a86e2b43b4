//! Status classification of a single activity report.
//!
//! Classification is a pure function of the report (idle seconds, foreground
//! process and window title) and the ordered rule list. Blacklist rules are
//! evaluated before whitelist rules so a forbidden application wins over a
//! generally approved one.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::{StatusCode, ValidationError};

/// Whether a rule marks matching activity as work or as slacking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleType {
    /// Matching activity is classified as [`StatusCode::Work`].
    White,
    /// Matching activity is classified as [`StatusCode::Fish`].
    Black,
}

impl RuleType {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::White => "white",
            Self::Black => "black",
        }
    }
}

impl std::str::FromStr for RuleType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "white" => Ok(Self::White),
            "black" => Ok(Self::Black),
            _ => Err(ValidationError::UnknownVariant {
                kind: "rule type",
                value: s.to_string(),
            }),
        }
    }
}

/// Which report field a rule matches against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchMode {
    /// Exact, case-insensitive process name match.
    Process,
    /// Case-insensitive substring match on the window title.
    Title,
}

impl MatchMode {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Process => "process",
            Self::Title => "title",
        }
    }
}

impl std::str::FromStr for MatchMode {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "process" => Ok(Self::Process),
            "title" => Ok(Self::Title),
            _ => Err(ValidationError::UnknownVariant {
                kind: "match mode",
                value: s.to_string(),
            }),
        }
    }
}

/// A single classification rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    pub rule_type: RuleType,
    pub match_mode: MatchMode,
    pub match_value: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

const fn default_enabled() -> bool {
    true
}

impl Rule {
    fn matches(&self, process_name: &str, window_title: &str) -> bool {
        let needle = normalize(&self.match_value);
        if needle.is_empty() {
            return false;
        }
        match self.match_mode {
            MatchMode::Process => process_name == needle,
            MatchMode::Title => window_title.contains(&needle),
        }
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.rule_type.as_str(),
            self.match_mode.as_str(),
            self.match_value
        )
    }
}

/// The observable inputs of one report that drive classification.
#[derive(Debug, Clone, Copy)]
pub struct Activity<'a> {
    pub idle_seconds: i64,
    pub process_name: &'a str,
    pub window_title: &'a str,
}

/// Classifies a report into `idle`, `fish`, `work` or `normal`.
pub fn classify(activity: &Activity<'_>, idle_threshold_seconds: i64, rules: &[Rule]) -> StatusCode {
    if activity.idle_seconds >= idle_threshold_seconds {
        return StatusCode::Idle;
    }

    let process_name = normalize(activity.process_name);
    let window_title = normalize(activity.window_title);

    let any_match = |rule_type: RuleType| {
        rules
            .iter()
            .filter(|rule| rule.enabled && rule.rule_type == rule_type)
            .any(|rule| rule.matches(&process_name, &window_title))
    };

    if any_match(RuleType::Black) {
        StatusCode::Fish
    } else if any_match(RuleType::White) {
        StatusCode::Work
    } else {
        StatusCode::Normal
    }
}

/// Builds the human description of a report: `process: title`, with a trailing
/// `.exe` removed from the process name.
pub fn describe(process_name: &str, window_title: &str) -> String {
    let process_name = process_name.trim();
    let process_name = process_name.strip_suffix(".exe").unwrap_or(process_name);
    let window_title = window_title.trim();
    match (process_name.is_empty(), window_title.is_empty()) {
        (true, _) => window_title.to_string(),
        (false, true) => process_name.to_string(),
        (false, false) => format!("{process_name}: {window_title}"),
    }
}

fn normalize(value: &str) -> String {
    value.trim().to_lowercase()
}
