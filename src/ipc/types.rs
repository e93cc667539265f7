use std::path::PathBuf;
use std::sync::Arc;

use rusqlite::Connection;
use serde::Deserialize;

use crate::config::EngineConfig;
use crate::live::{LiveCaches, SystemClock};

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
    pub config: EngineConfig,
    pub caches: LiveCaches,
}

impl AppState {
    pub fn new() -> Self {
        let config = EngineConfig::default();
        let caches = LiveCaches::new(&config, Arc::new(SystemClock));
        Self {
            workspace: None,
            db: None,
            config,
            caches,
        }
    }

    /// Swaps in a freshly opened workspace. Caches are rebuilt from the new
    /// config so nothing computed against the previous database survives.
    pub fn attach(&mut self, workspace: PathBuf, conn: Connection, config: EngineConfig) {
        self.caches = LiveCaches::new(&config, Arc::new(SystemClock));
        self.config = config;
        self.workspace = Some(workspace);
        self.db = Some(conn);
    }
}
