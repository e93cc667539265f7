use crate::ipc::error::{err, grade_err, ok};
use crate::ipc::helpers::{optional_str, required_f64, required_str};
use crate::ipc::types::{AppState, Request};
use crate::scores::{self, SubcategoryRef};
use serde_json::json;

fn subcategory_target(req: &Request) -> Result<SubcategoryRef, serde_json::Value> {
    if let Some(id) = optional_str(req, "subcategoryId") {
        return Ok(SubcategoryRef::Id(id));
    }
    let Some(subcategory) = optional_str(req, "subcategory") else {
        return Err(err(
            &req.id,
            "bad_params",
            "missing subcategoryId or subcategory",
            None,
        ));
    };
    Ok(SubcategoryRef::Named {
        structure_id: optional_str(req, "structureId"),
        class_id: optional_str(req, "classId"),
        category: optional_str(req, "category"),
        subcategory,
    })
}

fn handle_assessments_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let target = match subcategory_target(req) {
        Ok(t) => t,
        Err(resp) => return resp,
    };
    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let max_score = match required_f64(req, "maxScore") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let created = scores::create_assessment(
        conn,
        &target,
        &name,
        max_score,
        state.config.category_weight,
    )
    .and_then(|id| Ok((scores::assessment_class(conn, &id)?, id)));
    match created {
        Ok((class_id, id)) => {
            if let Some(class_id) = class_id {
                state.caches.invalidate_class(&class_id);
            }
            ok(&req.id, json!({ "assessmentId": id }))
        }
        Err(e) => grade_err(&req.id, &e),
    }
}

fn handle_assessments_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match scores::list_assessments(conn, &class_id) {
        Ok(rows) => ok(&req.id, json!({ "assessments": rows })),
        Err(e) => grade_err(&req.id, &e),
    }
}

fn handle_scores_record(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let assessment_id = match required_str(req, "assessmentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let score = match required_f64(req, "score") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match scores::record_score(conn, &assessment_id, &student_id, score) {
        Ok(class_id) => {
            state.caches.invalidate_class(&class_id);
            ok(&req.id, json!({ "ok": true, "classId": class_id }))
        }
        Err(e) => grade_err(&req.id, &e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "assessments.create" => Some(handle_assessments_create(state, req)),
        "assessments.list" => Some(handle_assessments_list(state, req)),
        "scores.record" => Some(handle_scores_record(state, req)),
        _ => None,
    }
}
