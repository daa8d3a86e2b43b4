//! Core type definitions with validation.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Validation errors for core types.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// The provided value was empty.
    #[error("{field} cannot be empty")]
    Empty { field: &'static str },

    /// A string did not name a known variant.
    #[error("invalid {kind}: {value}")]
    UnknownVariant { kind: &'static str, value: String },

    /// An interval whose end is not after its start.
    #[error("interval end must be after start")]
    EmptyInterval,
}

/// Generates a string-backed enum with `as_str`, `Display`, `FromStr` and serde
/// support using the storage representation.
macro_rules! define_str_enum {
    (
        $(#[$meta:meta])*
        $name:ident, $kind:literal {
            $( $(#[$vmeta:meta])* $variant:ident => $repr:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "&'static str")]
        pub enum $name {
            $( $(#[$vmeta])* $variant ),+
        }

        impl $name {
            /// String representation for database storage.
            #[must_use]
            pub const fn as_str(&self) -> &'static str {
                match self {
                    $( Self::$variant => $repr ),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = ValidationError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim() {
                    $( $repr => Ok(Self::$variant), )+
                    _ => Err(ValidationError::UnknownVariant {
                        kind: $kind,
                        value: s.to_string(),
                    }),
                }
            }
        }

        impl TryFrom<String> for $name {
            type Error = ValidationError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                value.parse()
            }
        }

        impl From<$name> for &'static str {
            fn from(value: $name) -> Self {
                value.as_str()
            }
        }
    };
}

define_str_enum!(
    /// Classified activity status of a time segment.
    StatusCode, "status code" {
        /// Foreground application matched a whitelist rule.
        Work => "work",
        /// Active, but no rule matched.
        Normal => "normal",
        /// Foreground application matched a blacklist rule.
        Fish => "fish",
        /// Input idle beyond the idle threshold.
        Idle => "idle",
        /// No report arrived within the offline threshold.
        Offline => "offline",
        /// The worker declared a break.
        Break => "break",
        /// System-wide outage window.
        Incident => "incident",
    }
);

impl StatusCode {
    /// Every status, in display order.
    pub const ALL: [Self; 7] = [
        Self::Work,
        Self::Normal,
        Self::Fish,
        Self::Idle,
        Self::Offline,
        Self::Break,
        Self::Incident,
    ];

    /// Human-readable label.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Work => "Working",
            Self::Normal => "Normal",
            Self::Fish => "Slacking",
            Self::Idle => "Away",
            Self::Offline => "Offline",
            Self::Break => "On break",
            Self::Incident => "System incident",
        }
    }
}

define_str_enum!(
    /// Which writer produced a time segment.
    SegmentSource, "segment source" {
        /// Materialized from periodic reports.
        System => "system",
        /// Closed by the offline sweep or a report after a long gap.
        Offline => "offline",
        /// Backfilled by an operator correction.
        Manual => "manual",
        /// Recorded for a system incident window.
        Incident => "incident",
    }
);

define_str_enum!(
    /// Kind of report sent by a worker's client.
    ReportKind, "report kind" {
        Heartbeat => "heartbeat",
        WorkStart => "work_start",
        WorkEnd => "work_end",
        Break => "break",
    }
);

impl Default for ReportKind {
    fn default() -> Self {
        Self::Heartbeat
    }
}

define_str_enum!(
    /// What happens when a policy violation is detected at shift end.
    TriggerAction, "trigger action" {
        /// Recorded on the review, never blocks closure.
        ShowOnly => "show_only",
        /// Blocks closure until a reason is supplied.
        RequireReason => "require_reason",
    }
);

define_str_enum!(
    /// Lifecycle of a manual adjustment.
    AdjustmentStatus, "adjustment status" {
        Active => "active",
        Revoked => "revoked",
    }
);

/// Generates a validated string ID newtype with common trait implementations.
macro_rules! define_string_id {
    (
        $(#[$meta:meta])*
        $name:ident, $field_name:literal
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// Creates a new ID after trimming and validation.
            pub fn new(id: impl Into<String>) -> Result<Self, ValidationError> {
                let id = id.into();
                let trimmed = id.trim();
                if trimmed.is_empty() {
                    return Err(ValidationError::Empty { field: $field_name });
                }
                Ok(Self(trimmed.to_string()))
            }

            /// Returns the ID as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl TryFrom<String> for $name {
            type Error = ValidationError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

define_string_id!(
    /// A validated employee code.
    ///
    /// Employee codes are the external identity of a monitored worker. They are
    /// trimmed on construction and must be non-empty.
    EmployeeCode, "employee code"
);
