use crate::calc::{class_summary, compute_class_grades, CalcContext};
use crate::formula::compute_with_formula;
use crate::ipc::error::{err, grade_err, ok};
use crate::ipc::helpers::required_str;
use crate::ipc::types::{AppState, Request};
use serde_json::json;

fn handle_grades_compute(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let ctx = CalcContext {
        conn,
        class_id: &class_id,
        policy: state.config.category_weight,
    };
    match compute_class_grades(&ctx) {
        Ok(grades) => ok(&req.id, json!({ "classId": class_id, "grades": grades })),
        Err(e) => grade_err(&req.id, &e),
    }
}

fn handle_grades_compute_with_formula(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let Some(formula) = req.params.get("formula") else {
        return err(&req.id, "bad_params", "missing formula", None);
    };
    let ctx = CalcContext {
        conn,
        class_id: &class_id,
        policy: state.config.category_weight,
    };
    match compute_with_formula(&ctx, formula) {
        Ok(grades) => ok(&req.id, json!({ "classId": class_id, "grades": grades })),
        Err(e) => grade_err(&req.id, &e),
    }
}

fn handle_grades_summary(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let ctx = CalcContext {
        conn,
        class_id: &class_id,
        policy: state.config.category_weight,
    };
    match class_summary(&ctx) {
        Ok(summary) => ok(&req.id, json!(summary)),
        Err(e) => grade_err(&req.id, &e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "grades.compute" => Some(handle_grades_compute(state, req)),
        "grades.computeWithFormula" => Some(handle_grades_compute_with_formula(state, req)),
        "grades.summary" => Some(handle_grades_summary(state, req)),
        _ => None,
    }
}
