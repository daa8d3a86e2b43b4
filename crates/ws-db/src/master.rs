//! Master data: departments, employees, classification rules and the
//! collaborator lookups the engine needs from them.

use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use tracing::info;
use ws_core::checkout::{CheckoutField, FieldKind};
use ws_core::{
    CheckoutTemplate, DepartmentPolicy, EmployeeCode, Rule, StatusThreshold, WorkRule,
};

use crate::{Database, DbError, employee_by_code};

/// A master-data document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MasterData {
    #[serde(default)]
    pub departments: Vec<DepartmentImport>,
    #[serde(default)]
    pub employees: Vec<EmployeeImport>,
    #[serde(default)]
    pub rules: Vec<Rule>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DepartmentImport {
    pub name: String,
    #[serde(default)]
    pub rule: Option<WorkRule>,
    #[serde(default)]
    pub thresholds: Vec<StatusThreshold>,
    #[serde(default)]
    pub checkout: Option<CheckoutTemplateImport>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutTemplateImport {
    pub name: String,
    #[serde(default)]
    pub fields: Vec<CheckoutFieldImport>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutFieldImport {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: FieldKind,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub options: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmployeeImport {
    pub code: EmployeeCode,
    pub name: String,
    #[serde(default)]
    pub department: Option<String>,
}

/// Counts of rows touched by an import.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportStats {
    pub departments: usize,
    pub employees: usize,
    pub rules: usize,
    pub templates_created: usize,
}

impl Database {
    /// Loads master data idempotently.
    ///
    /// Departments and employees are upserted by name and code. A department's
    /// rule and thresholds are replaced by the imported ones. A checkout
    /// template is replaced only when its content changed, so re-importing the
    /// same document keeps template and field ids stable.
    pub fn import_master_data(&mut self, data: &MasterData) -> Result<ImportStats, DbError> {
        let tx = self.conn.transaction()?;
        let mut stats = ImportStats::default();

        for department in &data.departments {
            let id = upsert_department(&tx, department.name.trim())?;
            replace_policy(&tx, id, department)?;
            if let Some(checkout) = &department.checkout {
                if sync_checkout_template(&tx, id, checkout)? {
                    stats.templates_created += 1;
                }
            }
            stats.departments += 1;
        }

        for employee in &data.employees {
            let department_id = match employee.department.as_deref().map(str::trim) {
                Some(name) if !name.is_empty() => Some(upsert_department(&tx, name)?),
                _ => None,
            };
            tx.execute(
                "
                INSERT INTO employees (code, name, department_id) VALUES (?1, ?2, ?3)
                ON CONFLICT(code) DO UPDATE SET name = ?2, department_id = ?3
                ",
                params![employee.code.as_str(), employee.name.trim(), department_id],
            )?;
            stats.employees += 1;
        }

        for rule in &data.rules {
            tx.execute(
                "
                INSERT INTO classification_rules (rule_type, match_mode, match_value, enabled)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(rule_type, match_mode, match_value) DO UPDATE SET enabled = ?4
                ",
                params![
                    rule.rule_type.as_str(),
                    rule.match_mode.as_str(),
                    rule.match_value.trim(),
                    rule.enabled,
                ],
            )?;
            stats.rules += 1;
        }

        tx.commit()?;
        info!(
            departments = stats.departments,
            employees = stats.employees,
            rules = stats.rules,
            templates_created = stats.templates_created,
            "master data imported"
        );
        Ok(stats)
    }

    /// Enabled classification rules in insertion order.
    pub fn enabled_rules(&self) -> Result<Vec<Rule>, DbError> {
        let mut stmt = self.conn.prepare_cached(
            "
            SELECT rule_type, match_mode, match_value
            FROM classification_rules
            WHERE enabled = 1
            ORDER BY id ASC
            ",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;
        let mut rules = Vec::new();
        for row in rows {
            let (rule_type, match_mode, match_value) = row?;
            rules.push(Rule {
                rule_type: rule_type.parse()?,
                match_mode: match_mode.parse()?,
                match_value,
                enabled: true,
            });
        }
        Ok(rules)
    }

    /// The checkout template an employee must fill at shift end, if any.
    pub fn checkout_template_for(
        &self,
        code: &EmployeeCode,
    ) -> Result<Option<CheckoutTemplate>, DbError> {
        let employee = employee_by_code(&self.conn, code)?;
        match employee.department_id {
            Some(department_id) => enabled_checkout_template(&self.conn, department_id),
            None => Ok(None),
        }
    }
}

fn upsert_department(conn: &Connection, name: &str) -> Result<i64, DbError> {
    conn.execute(
        "INSERT INTO departments (name) VALUES (?) ON CONFLICT(name) DO NOTHING",
        params![name],
    )?;
    Ok(conn.query_row(
        "SELECT id FROM departments WHERE name = ?",
        params![name],
        |row| row.get(0),
    )?)
}

fn replace_policy(
    conn: &Connection,
    department_id: i64,
    department: &DepartmentImport,
) -> Result<(), DbError> {
    conn.execute(
        "DELETE FROM department_rules WHERE department_id = ?",
        params![department_id],
    )?;
    conn.execute(
        "DELETE FROM status_thresholds WHERE department_id = ?",
        params![department_id],
    )?;
    if let Some(rule) = &department.rule {
        conn.execute(
            "
            INSERT INTO department_rules
                (department_id, target_seconds, max_break_seconds, max_break_count, max_break_single_seconds)
            VALUES (?, ?, ?, ?, ?)
            ",
            params![
                department_id,
                rule.target_seconds,
                rule.max_break_seconds,
                rule.max_break_count,
                rule.max_break_single_seconds,
            ],
        )?;
    }
    for threshold in &department.thresholds {
        conn.execute(
            "
            INSERT INTO status_thresholds
                (department_id, status_code, min_seconds, max_seconds, trigger_action, enabled)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(department_id, status_code) DO UPDATE SET
                min_seconds = excluded.min_seconds,
                max_seconds = excluded.max_seconds,
                trigger_action = excluded.trigger_action,
                enabled = excluded.enabled
            ",
            params![
                department_id,
                threshold.status_code.as_str(),
                threshold.min_seconds,
                threshold.max_seconds,
                threshold.trigger_action.as_str(),
                threshold.enabled,
            ],
        )?;
    }
    Ok(())
}

/// Makes `wanted` the department's enabled template. Returns whether a new
/// template was created.
fn sync_checkout_template(
    conn: &Connection,
    department_id: i64,
    wanted: &CheckoutTemplateImport,
) -> Result<bool, DbError> {
    if let Some(current) = enabled_checkout_template(conn, department_id)? {
        if same_template(&current, wanted) {
            return Ok(false);
        }
    }

    conn.execute(
        "UPDATE checkout_templates SET enabled = 0 WHERE department_id = ?",
        params![department_id],
    )?;
    conn.execute(
        "INSERT INTO checkout_templates (department_id, name, enabled) VALUES (?, ?, 1)",
        params![department_id, wanted.name.trim()],
    )?;
    let template_id = conn.last_insert_rowid();
    for (sort_order, field) in wanted.fields.iter().enumerate() {
        conn.execute(
            "
            INSERT INTO checkout_fields (template_id, name, type, required, options_json, sort_order)
            VALUES (?, ?, ?, ?, ?, ?)
            ",
            params![
                template_id,
                field.name.trim(),
                field_kind_str(field.kind),
                field.required,
                serde_json::to_string(&field.options)?,
                i64::try_from(sort_order).unwrap_or(i64::MAX),
            ],
        )?;
    }
    Ok(true)
}

fn same_template(current: &CheckoutTemplate, wanted: &CheckoutTemplateImport) -> bool {
    current.name == wanted.name.trim()
        && current.fields.len() == wanted.fields.len()
        && current.fields.iter().zip(&wanted.fields).all(|(have, want)| {
            have.name == want.name.trim()
                && have.kind == want.kind
                && have.required == want.required
                && have.options == want.options
        })
}

const fn field_kind_str(kind: FieldKind) -> &'static str {
    match kind {
        FieldKind::Text => "text",
        FieldKind::Number => "number",
        FieldKind::Select => "select",
    }
}

fn parse_field_kind(value: &str) -> Result<FieldKind, DbError> {
    match value {
        "text" => Ok(FieldKind::Text),
        "number" => Ok(FieldKind::Number),
        "select" => Ok(FieldKind::Select),
        other => Err(ws_core::ValidationError::UnknownVariant {
            kind: "checkout field type",
            value: other.to_string(),
        }
        .into()),
    }
}

/// The enabled checkout template of a department with its enabled fields.
pub(crate) fn enabled_checkout_template(
    conn: &Connection,
    department_id: i64,
) -> Result<Option<CheckoutTemplate>, DbError> {
    let template: Option<(i64, String)> = conn
        .query_row(
            "
            SELECT id, name FROM checkout_templates
            WHERE department_id = ? AND enabled = 1
            ORDER BY id DESC
            LIMIT 1
            ",
            params![department_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    let Some((id, name)) = template else {
        return Ok(None);
    };

    let mut stmt = conn.prepare_cached(
        "
        SELECT id, name, type, required, options_json
        FROM checkout_fields
        WHERE template_id = ? AND enabled = 1
        ORDER BY sort_order ASC, id ASC
        ",
    )?;
    let rows = stmt.query_map(params![id], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, bool>(3)?,
            row.get::<_, String>(4)?,
        ))
    })?;
    let mut fields = Vec::new();
    for row in rows {
        let (field_id, field_name, kind, required, options_json) = row?;
        fields.push(CheckoutField {
            id: field_id,
            name: field_name,
            kind: parse_field_kind(&kind)?,
            required,
            options: serde_json::from_str(&options_json)?,
            enabled: true,
        });
    }
    Ok(Some(CheckoutTemplate { id, name, fields }))
}

/// The department's policy; unconfigured when neither a rule nor any
/// threshold exists.
pub(crate) fn department_policy(
    conn: &Connection,
    department_id: i64,
) -> Result<DepartmentPolicy, DbError> {
    let rule = conn
        .query_row(
            "
            SELECT target_seconds, max_break_seconds, max_break_count, max_break_single_seconds
            FROM department_rules
            WHERE department_id = ?
            ",
            params![department_id],
            |row| {
                Ok(WorkRule {
                    target_seconds: row.get(0)?,
                    max_break_seconds: row.get(1)?,
                    max_break_count: row.get(2)?,
                    max_break_single_seconds: row.get(3)?,
                })
            },
        )
        .optional()?;

    let mut stmt = conn.prepare_cached(
        "
        SELECT status_code, min_seconds, max_seconds, trigger_action, enabled
        FROM status_thresholds
        WHERE department_id = ?
        ORDER BY id ASC
        ",
    )?;
    let rows = stmt.query_map(params![department_id], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, Option<i64>>(1)?,
            row.get::<_, Option<i64>>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, bool>(4)?,
        ))
    })?;
    let mut thresholds = Vec::new();
    for row in rows {
        let (status_code, min_seconds, max_seconds, trigger_action, enabled) = row?;
        thresholds.push(StatusThreshold {
            status_code: status_code.parse()?,
            min_seconds,
            max_seconds,
            trigger_action: trigger_action.parse()?,
            enabled,
        });
    }

    Ok(DepartmentPolicy { rule, thresholds })
}
