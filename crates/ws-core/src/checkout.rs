//! Shift-end checkout forms.
//!
//! A department may require a short form at shift end. The enabled template
//! is snapshotted with each submission so later template edits do not change
//! what was recorded.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum characters accepted in a text field.
pub const TEXT_MAX_CHARS: usize = 1000;

/// Errors from validating a checkout submission.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CheckoutError {
    #[error("checkout form is required")]
    Missing,

    #[error("checkout template changed (expected {expected}, got {submitted}); refresh and retry")]
    TemplateChanged { expected: i64, submitted: i64 },

    #[error("{field} is required")]
    Required { field: String },

    #[error("{field} must be at most {max} characters")]
    TooLong { field: String, max: usize },

    #[error("{field} must be a number")]
    NotANumber { field: String },

    #[error("{field} has an invalid option")]
    InvalidOption { field: String },
}

/// Input type of a checkout field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    Text,
    Number,
    Select,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutField {
    pub id: i64,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: FieldKind,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub options: Vec<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

const fn default_enabled() -> bool {
    true
}

/// A department's checkout template with its fields in display order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutTemplate {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub fields: Vec<CheckoutField>,
}

/// Form data sent with a `work_end` report, keyed by field id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutSubmission {
    pub template_id: i64,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

impl CheckoutTemplate {
    /// The template as recorded alongside a submission: enabled fields only.
    #[must_use]
    pub fn snapshot(&self) -> Self {
        Self {
            id: self.id,
            name: self.name.clone(),
            fields: self.fields.iter().filter(|f| f.enabled).cloned().collect(),
        }
    }

    /// Validates a submission, returning the trimmed values of the enabled
    /// fields that were filled in.
    pub fn validate(
        &self,
        submission: Option<&CheckoutSubmission>,
    ) -> Result<BTreeMap<String, String>, CheckoutError> {
        let submission = submission.ok_or(CheckoutError::Missing)?;
        if submission.template_id != self.id {
            return Err(CheckoutError::TemplateChanged {
                expected: self.id,
                submitted: submission.template_id,
            });
        }

        let mut cleaned = BTreeMap::new();
        for field in self.fields.iter().filter(|f| f.enabled) {
            let key = field.id.to_string();
            let value = submission
                .data
                .get(&key)
                .map(|v| v.trim())
                .unwrap_or_default();

            if value.is_empty() {
                if field.required {
                    return Err(CheckoutError::Required {
                        field: field.name.clone(),
                    });
                }
                continue;
            }

            match field.kind {
                FieldKind::Text => {
                    if value.chars().count() > TEXT_MAX_CHARS {
                        return Err(CheckoutError::TooLong {
                            field: field.name.clone(),
                            max: TEXT_MAX_CHARS,
                        });
                    }
                }
                FieldKind::Number => {
                    if value.parse::<f64>().is_err() {
                        return Err(CheckoutError::NotANumber {
                            field: field.name.clone(),
                        });
                    }
                }
                FieldKind::Select => {
                    if !field.options.iter().any(|opt| opt.trim() == value) {
                        return Err(CheckoutError::InvalidOption {
                            field: field.name.clone(),
                        });
                    }
                }
            }

            cleaned.insert(key, value.to_string());
        }
        Ok(cleaned)
    }
}
