use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::structure::LECTURE;

pub const CONFIG_FILE_NAME: &str = "gradecored.json";

const ENV_LIVE_TTL_MS: &str = "GRADECORED_LIVE_TTL_MS";
const ENV_CACHE_CAPACITY: &str = "GRADECORED_CACHE_CAPACITY";

const CATEGORY_WEIGHT_TOTAL: f64 = 100.0;

/// How a category's weight is filled in when its rows are materialized.
///
/// The weights of the categories a structure actually uses must add up to
/// 100; `structure::validate` enforces that at save time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum CategoryWeightPolicy {
    /// Fixed lecture/laboratory split. A structure with only one non-empty
    /// category gives it the whole 100.
    Split { lecture: f64, laboratory: f64 },
    /// The same value for every category.
    Placeholder { value: f64 },
}

impl Default for CategoryWeightPolicy {
    fn default() -> Self {
        Self::Split {
            lecture: 60.0,
            laboratory: 40.0,
        }
    }
}

impl CategoryWeightPolicy {
    /// Weight of each category in `present`, in the given order.
    pub fn category_weights(&self, present: &[&'static str]) -> Vec<(&'static str, f64)> {
        match *self {
            Self::Split { .. } if present.len() == 1 => vec![(present[0], CATEGORY_WEIGHT_TOTAL)],
            Self::Split {
                lecture,
                laboratory,
            } => present
                .iter()
                .map(|&key| (key, if key == LECTURE { lecture } else { laboratory }))
                .collect(),
            Self::Placeholder { value } => present.iter().map(|&key| (key, value)).collect(),
        }
    }

    fn check(&self) -> anyhow::Result<()> {
        match *self {
            Self::Split {
                lecture,
                laboratory,
            } => {
                anyhow::ensure!(
                    lecture.is_finite()
                        && laboratory.is_finite()
                        && lecture >= 0.0
                        && laboratory >= 0.0
                        && (lecture + laboratory - CATEGORY_WEIGHT_TOTAL).abs() <= 0.01,
                    "split category weights must be non-negative and sum to 100 (got {} + {})",
                    lecture,
                    laboratory
                );
            }
            Self::Placeholder { value } => {
                anyhow::ensure!(
                    value.is_finite() && value > 0.0,
                    "placeholder category weight must be positive (got {})",
                    value
                );
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub live_version_ttl_ms: u64,
    pub result_cache_capacity: usize,
    pub category_weight: CategoryWeightPolicy,
    pub busy_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            live_version_ttl_ms: 2_000,
            result_cache_capacity: 200,
            category_weight: CategoryWeightPolicy::default(),
            busy_timeout_ms: 5_000,
        }
    }
}

impl EngineConfig {
    /// Reads `gradecored.json` from the workspace, writing the defaults when it
    /// does not exist yet. Environment overrides are applied last.
    pub fn load_or_init(workspace: &Path) -> anyhow::Result<Self> {
        fs::create_dir_all(workspace)
            .with_context(|| format!("create workspace dir {}", workspace.display()))?;
        let path = workspace.join(CONFIG_FILE_NAME);
        let mut config = if path.exists() {
            let raw = fs::read_to_string(&path)
                .with_context(|| format!("read config {}", path.display()))?;
            serde_json::from_str::<EngineConfig>(&raw)
                .with_context(|| format!("parse config {}", path.display()))?
        } else {
            let default = EngineConfig::default();
            let payload = serde_json::to_string_pretty(&default)?;
            fs::write(&path, payload)
                .with_context(|| format!("write config {}", path.display()))?;
            default
        };
        config.apply_env();
        config
            .category_weight
            .check()
            .with_context(|| format!("invalid config {}", path.display()))?;
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Some(v) = env_parse::<u64>(ENV_LIVE_TTL_MS) {
            self.live_version_ttl_ms = v;
        }
        if let Some(v) = env_parse::<usize>(ENV_CACHE_CAPACITY) {
            self.result_cache_capacity = v;
        }
    }

    /// Applies per-session overrides sent with `workspace.select`.
    pub fn merge_overrides(&mut self, overrides: &serde_json::Value) -> anyhow::Result<()> {
        let Some(obj) = overrides.as_object() else {
            anyhow::bail!("config overrides must be an object");
        };
        let mut current = serde_json::to_value(&*self)?;
        if let Some(target) = current.as_object_mut() {
            for (k, v) in obj {
                target.insert(k.clone(), v.clone());
            }
        }
        let merged: EngineConfig =
            serde_json::from_value(current).context("invalid config overrides")?;
        merged.category_weight.check()?;
        *self = merged;
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok()?.trim().parse().ok()
}
