use crate::db::now_ts;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{optional_str, required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use tracing::info;
use uuid::Uuid;

fn personal_info_id(
    conn: &Connection,
    student_id: &str,
) -> rusqlite::Result<Option<Option<String>>> {
    conn.query_row(
        "SELECT personal_info_id FROM students WHERE id = ?",
        [student_id],
        |r| r.get::<_, Option<String>>(0),
    )
    .optional()
}

fn classes_of(conn: &Connection, student_id: &str) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT class_id FROM student_classes WHERE student_id = ?")?;
    let rows = stmt
        .query_map([student_id], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn handle_students_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let last_name = match required_str(req, "lastName") {
        Ok(v) => v.trim().to_string(),
        Err(resp) => return resp,
    };
    let first_name = match required_str(req, "firstName") {
        Ok(v) => v.trim().to_string(),
        Err(resp) => return resp,
    };
    if last_name.is_empty() || first_name.is_empty() {
        return err(&req.id, "bad_params", "firstName and lastName must not be empty", None);
    }
    let middle_name = optional_str(req, "middleName");
    let email = optional_str(req, "email");

    let student_id = Uuid::new_v4().to_string();
    let info_id = Uuid::new_v4().to_string();
    let now = now_ts();

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    if let Err(e) = tx.execute(
        "INSERT INTO personal_info(id, first_name, last_name, middle_name, email, updated_at)
         VALUES(?, ?, ?, ?, ?, ?)",
        (&info_id, &first_name, &last_name, &middle_name, &email, &now),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "personal_info" })),
        );
    }
    if let Err(e) = tx.execute(
        "INSERT INTO students(id, personal_info_id, created_at) VALUES(?, ?, ?)",
        (&student_id, &info_id, &now),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "students" })),
        );
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "studentId": student_id }))
}

fn handle_students_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let Some(patch) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "missing patch", None);
    };

    let info_id = match personal_info_id(conn, &student_id) {
        Ok(Some(Some(id))) => id,
        Ok(Some(None)) => {
            return err(&req.id, "not_found", "student has no personal info record", None)
        }
        Ok(None) => return err(&req.id, "not_found", "student not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut sets: Vec<&'static str> = Vec::new();
    let mut values: Vec<rusqlite::types::Value> = Vec::new();
    for (key, column, nullable) in [
        ("firstName", "first_name = ?", false),
        ("lastName", "last_name = ?", false),
        ("middleName", "middle_name = ?", true),
        ("email", "email = ?", true),
    ] {
        let Some(v) = patch.get(key) else {
            continue;
        };
        match v {
            serde_json::Value::String(s) if nullable || !s.trim().is_empty() => {
                sets.push(column);
                values.push(rusqlite::types::Value::Text(s.trim().to_string()));
            }
            serde_json::Value::Null if nullable => {
                sets.push(column);
                values.push(rusqlite::types::Value::Null);
            }
            _ => {
                return err(
                    &req.id,
                    "bad_params",
                    format!("patch.{} has an invalid value", key),
                    None,
                )
            }
        }
    }
    if sets.is_empty() {
        return err(&req.id, "bad_params", "patch has no recognized fields", None);
    }
    sets.push("updated_at = ?");
    values.push(rusqlite::types::Value::Text(now_ts()));
    values.push(rusqlite::types::Value::Text(info_id));

    let sql = format!("UPDATE personal_info SET {} WHERE id = ?", sets.join(", "));
    if let Err(e) = conn.execute(&sql, rusqlite::params_from_iter(values)) {
        return err(
            &req.id,
            "db_update_failed",
            e.to_string(),
            Some(json!({ "table": "personal_info" })),
        );
    }

    match classes_of(conn, &student_id) {
        Ok(classes) => {
            for class_id in &classes {
                state.caches.invalidate_class(class_id);
            }
        }
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    ok(&req.id, json!({ "ok": true }))
}

fn handle_enrollments_add(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match crate::store::class_exists(conn, &class_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "class not found", None),
        Err(e) => return err(&req.id, e.code(), e.to_string(), None),
    }
    match personal_info_id(conn, &student_id) {
        Ok(Some(_)) => {}
        Ok(None) => return err(&req.id, "not_found", "student not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let inserted = match conn.execute(
        "INSERT OR IGNORE INTO student_classes(student_id, class_id, joined_at) VALUES(?, ?, ?)",
        (&student_id, &class_id, now_ts()),
    ) {
        Ok(n) => n,
        Err(e) => {
            return err(
                &req.id,
                "db_insert_failed",
                e.to_string(),
                Some(json!({ "table": "student_classes" })),
            )
        }
    };
    state.caches.invalidate_class(&class_id);
    if inserted > 0 {
        info!(class_id = %class_id, student_id = %student_id, "student enrolled");
    }

    ok(&req.id, json!({ "enrolled": inserted > 0 }))
}

fn handle_enrollments_remove(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let removed = match conn.execute(
        "DELETE FROM student_classes WHERE student_id = ? AND class_id = ?",
        (&student_id, &class_id),
    ) {
        Ok(n) => n,
        Err(e) => {
            return err(
                &req.id,
                "db_delete_failed",
                e.to_string(),
                Some(json!({ "table": "student_classes" })),
            )
        }
    };
    if removed == 0 {
        return err(&req.id, "not_found", "enrollment not found", None);
    }
    state.caches.invalidate_class(&class_id);

    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.create" => Some(handle_students_create(state, req)),
        "students.update" => Some(handle_students_update(state, req)),
        "enrollments.add" => Some(handle_enrollments_add(state, req)),
        "enrollments.remove" => Some(handle_enrollments_remove(state, req)),
        _ => None,
    }
}
