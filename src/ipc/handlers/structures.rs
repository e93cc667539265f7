use crate::ipc::error::{err, grade_err, ok};
use crate::ipc::helpers::{optional_str, required_str};
use crate::ipc::types::{AppState, Request};
use crate::materialize::materialize;
use crate::store::{self, StructureRow};
use serde_json::json;

fn structure_json(row: &StructureRow) -> serde_json::Value {
    // Rows that no longer parse are still listed; their definition reads as null.
    let definition = row.definition().unwrap_or(serde_json::Value::Null);
    json!({
        "id": row.id,
        "classId": row.class_id,
        "name": row.name,
        "version": row.version,
        "isActive": row.is_active,
        "createdBy": row.created_by,
        "createdAt": row.created_at,
        "updatedAt": row.updated_at,
        "definition": definition,
    })
}

fn handle_structures_save(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let Some(definition) = req.params.get("definition") else {
        return err(&req.id, "bad_params", "missing definition", None);
    };
    let name = optional_str(req, "name").unwrap_or_default();
    let created_by = optional_str(req, "createdBy");

    match store::save_structure(
        conn,
        &class_id,
        &name,
        definition,
        created_by.as_deref(),
        state.config.category_weight,
    ) {
        Ok(saved) => {
            state.caches.invalidate_class(&class_id);
            ok(
                &req.id,
                json!({
                    "id": saved.id,
                    "version": saved.version,
                    "materialized": saved.materialized,
                }),
            )
        }
        Err(e) => grade_err(&req.id, &e),
    }
}

fn handle_structures_active(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match store::active_structure(conn, &class_id) {
        Ok(Some(row)) => ok(&req.id, json!({ "structure": structure_json(&row) })),
        Ok(None) => ok(&req.id, json!({ "structure": null })),
        Err(e) => grade_err(&req.id, &e),
    }
}

fn handle_structures_history(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let structure_id = match required_str(req, "structureId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match store::structure_history(conn, &structure_id) {
        Ok((class_id, rows)) => ok(
            &req.id,
            json!({
                "classId": class_id,
                "versions": rows.iter().map(structure_json).collect::<Vec<_>>(),
            }),
        ),
        Err(e) => grade_err(&req.id, &e),
    }
}

fn handle_structures_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let structure_id = match required_str(req, "structureId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match store::delete_structure(conn, &structure_id) {
        Ok(row) => {
            state.caches.invalidate_class(&row.class_id);
            ok(
                &req.id,
                json!({ "classId": row.class_id, "wasActive": row.is_active }),
            )
        }
        Err(e) => grade_err(&req.id, &e),
    }
}

fn handle_structures_materialize(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let structure_id = match required_str(req, "structureId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match materialize(conn, &structure_id, state.config.category_weight) {
        Ok(outcome) => ok(&req.id, json!(outcome)),
        Err(e) => grade_err(&req.id, &e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "structures.save" => Some(handle_structures_save(state, req)),
        "structures.active" => Some(handle_structures_active(state, req)),
        "structures.history" => Some(handle_structures_history(state, req)),
        "structures.delete" => Some(handle_structures_delete(state, req)),
        "structures.materialize" => Some(handle_structures_materialize(state, req)),
        _ => None,
    }
}
