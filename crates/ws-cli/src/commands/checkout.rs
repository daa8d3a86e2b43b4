//! Checkout command: the form an employee submits with `work_end`.

use std::io::Write;

use anyhow::Result;
use ws_core::EmployeeCode;
use ws_db::Database;

/// Prints the enabled template of the employee's department, or `null`.
pub fn run<W: Write>(writer: &mut W, db: &Database, code: &EmployeeCode) -> Result<()> {
    let template = db.checkout_template_for(code)?.map(|template| template.snapshot());
    writeln!(writer, "{}", serde_json::to_string(&template)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use insta::assert_snapshot;
    use ws_db::MasterData;

    fn db() -> Database {
        let mut db = Database::open_in_memory().unwrap();
        let data: MasterData = serde_json::from_str(
            r#"{
                "departments": [{
                    "name": "Ops",
                    "checkout": {
                        "name": "Wrap-up",
                        "fields": [
                            {"name": "Summary", "type": "text", "required": true},
                            {"name": "Mood", "type": "select", "options": ["good", "bad"]}
                        ]
                    }
                }],
                "employees": [
                    {"code": "E001", "name": "Ada", "department": "Ops"},
                    {"code": "E002", "name": "Bob"}
                ]
            }"#,
        )
        .unwrap();
        db.import_master_data(&data).unwrap();
        db
    }

    fn checkout(db: &Database, code: &str) -> String {
        let mut output = Vec::new();
        run(&mut output, db, &EmployeeCode::new(code).unwrap()).unwrap();
        String::from_utf8(output).unwrap()
    }

    #[test]
    fn department_template_is_printed() {
        assert_snapshot!(checkout(&db(), "E001"), @r#"{"id":1,"name":"Wrap-up","fields":[{"id":1,"name":"Summary","type":"text","required":true,"options":[],"enabled":true},{"id":2,"name":"Mood","type":"select","required":false,"options":["good","bad"],"enabled":true}]}"#);
    }

    #[test]
    fn employee_without_department_gets_null() {
        assert_snapshot!(checkout(&db(), "E002"), @"null");
    }

    #[test]
    fn unknown_employee_is_an_error() {
        let err = run(&mut Vec::new(), &db(), &EmployeeCode::new("E404").unwrap()).unwrap_err();
        assert!(err.to_string().contains("E404"));
    }
}
