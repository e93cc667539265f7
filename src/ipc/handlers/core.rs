use crate::config::EngineConfig;
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

fn handle_health(state: &mut AppState, req: &Request) -> serde_json::Value {
    ok(
        &req.id,
        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "workspacePath": state.workspace.as_ref().map(|p| p.to_string_lossy().to_string())
        }),
    )
}

fn handle_workspace_select(state: &mut AppState, req: &Request) -> serde_json::Value {
    let p = req
        .params
        .get("path")
        .and_then(|v| v.as_str())
        .map(PathBuf::from);
    let Some(path) = p else {
        return err(&req.id, "bad_params", "missing params.path", None);
    };

    let mut config = match EngineConfig::load_or_init(&path) {
        Ok(c) => c,
        Err(e) => {
            warn!(workspace = %path.display(), error = %e, "config load failed");
            return err(&req.id, "config_invalid", format!("{e:#}"), None);
        }
    };
    if let Some(overrides) = req.params.get("config").filter(|v| !v.is_null()) {
        if let Err(e) = config.merge_overrides(overrides) {
            return err(&req.id, "bad_params", format!("{e:#}"), None);
        }
    }

    match db::open_db(&path, Duration::from_millis(config.busy_timeout_ms)) {
        Ok(conn) => {
            info!(workspace = %path.display(), "workspace opened");
            let result = json!({
                "workspacePath": path.to_string_lossy(),
                "config": &config,
            });
            state.attach(path, conn, config);
            ok(&req.id, result)
        }
        Err(e) => err(&req.id, "db_open_failed", format!("{e:?}"), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "health" => Some(handle_health(state, req)),
        "workspace.select" => Some(handle_workspace_select(state, req)),
        _ => None,
    }
}
