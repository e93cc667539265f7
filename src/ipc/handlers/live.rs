use crate::ipc::error::{err, grade_err, ok};
use crate::ipc::helpers::required_str;
use crate::ipc::types::{AppState, Request};
use serde_json::json;

fn handle_live_version(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match state.caches.live_version(conn, &class_id) {
        Ok(version) => ok(&req.id, json!({ "classId": class_id, "version": version })),
        Err(e) => grade_err(&req.id, &e),
    }
}

fn handle_structures_normalized(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match state.caches.normalized_structure(conn, &class_id) {
        Ok(cached) => ok(
            &req.id,
            json!({ "version": cached.version, "cacheHit": cached.hit, "rows": cached.value }),
        ),
        Err(e) => grade_err(&req.id, &e),
    }
}

fn handle_structures_grouped(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match state.caches.grouped_structure(conn, &class_id) {
        Ok(cached) => ok(
            &req.id,
            json!({
                "version": cached.version,
                "cacheHit": cached.hit,
                "strings": cached.value.strings,
                "numbers": cached.value.numbers,
            }),
        ),
        Err(e) => grade_err(&req.id, &e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "live.version" => Some(handle_live_version(state, req)),
        "structures.normalized" => Some(handle_structures_normalized(state, req)),
        "structures.grouped" => Some(handle_structures_grouped(state, req)),
        _ => None,
    }
}
