//! Grading-structure definitions: flattening, grouping and save-time validation.
//!
//! A definition is a JSON object keyed by the two fixed category names, each
//! holding a list of subcategories:
//!
//! ```text
//! { "LECTURE": [
//!     { "name": "Quizzes", "weight": 60, "assessments": [ { "name": "Q1", "max_score": 50 } ] }
//!   ],
//!   "LABORATORY": [ ... ] }
//! ```
//!
//! Everything here is pure. Readers are lenient (malformed pieces are skipped),
//! the validator is strict and reports every problem at once.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

use crate::config::CategoryWeightPolicy;
use crate::error::{GradeError, GradeResult};

pub const LABORATORY: &str = "LABORATORY";
pub const LECTURE: &str = "LECTURE";

/// Category visiting order for flattening and validation.
pub const CATEGORY_KEYS: [&str; 2] = [LABORATORY, LECTURE];

/// Category order used when creating relational rows.
pub const MATERIALIZE_ORDER: [&str; 2] = [LECTURE, LABORATORY];

const WEIGHT_SUM_TARGET: f64 = 100.0;
const WEIGHT_SUM_TOLERANCE: f64 = 0.01;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRow {
    pub category: String,
    /// Subcategory name.
    pub name: String,
    /// Subcategory weight.
    pub weight: f64,
    pub assessment: String,
    pub max_score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowLabels {
    pub category: String,
    pub name: String,
    pub assessment: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowNumbers {
    pub weight: f64,
    pub max_score: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupedStructure {
    pub strings: Vec<RowLabels>,
    pub numbers: Vec<RowNumbers>,
}

/// A subcategory as declared in a definition, without its assessments.
#[derive(Debug, Clone, PartialEq)]
pub struct SubcategoryDef {
    pub name: String,
    pub weight: f64,
}

/// Accepts JSON numbers and numeric strings; anything else is `None`.
pub fn as_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
        _ => None,
    }
}

fn number_or_zero(v: Option<&Value>) -> f64 {
    v.and_then(as_number).unwrap_or(0.0)
}

fn str_or_empty(v: Option<&Value>) -> String {
    v.and_then(|v| v.as_str()).unwrap_or("").to_string()
}

/// Parses a stored definition document. The top level must be an object.
pub fn parse_definition(text: &str) -> GradeResult<Value> {
    let doc: Value =
        serde_json::from_str(text).map_err(|e| GradeError::structure_invalid(e.to_string()))?;
    if doc.is_null() {
        return Ok(Value::Object(Default::default()));
    }
    if !doc.is_object() {
        return Err(GradeError::structure_invalid(
            "definition must be a JSON object",
        ));
    }
    Ok(doc)
}

/// Flattens a definition into one row per (category, subcategory, assessment).
pub fn normalize(doc: &Value) -> Vec<NormalizedRow> {
    let mut rows = Vec::new();
    let Some(obj) = doc.as_object() else {
        return rows;
    };

    for key in CATEGORY_KEYS {
        let Some(subs) = obj.get(key).and_then(|v| v.as_array()) else {
            continue;
        };
        for sub in subs {
            let Some(sub) = sub.as_object() else {
                continue;
            };
            let name = str_or_empty(sub.get("name"));
            let weight = number_or_zero(sub.get("weight"));
            let Some(assessments) = sub.get("assessments").and_then(|v| v.as_array()) else {
                continue;
            };
            for a in assessments {
                let Some(a) = a.as_object() else {
                    continue;
                };
                rows.push(NormalizedRow {
                    category: key.to_string(),
                    name: name.clone(),
                    weight,
                    assessment: str_or_empty(a.get("name")),
                    max_score: number_or_zero(a.get("max_score")),
                });
            }
        }
    }
    rows
}

/// Splits rows into parallel descriptive and numeric arrays.
pub fn group(rows: &[NormalizedRow]) -> GroupedStructure {
    let mut out = GroupedStructure::default();
    for row in rows {
        out.strings.push(RowLabels {
            category: row.category.clone(),
            name: row.name.clone(),
            assessment: row.assessment.clone(),
        });
        out.numbers.push(RowNumbers {
            weight: row.weight,
            max_score: row.max_score,
        });
    }
    out
}

/// Subcategories declared under `category`, in document order. Entries that
/// are not objects or have no name are skipped.
pub fn subcategories(doc: &Value, category: &str) -> Vec<SubcategoryDef> {
    let Some(subs) = doc.get(category).and_then(|v| v.as_array()) else {
        return Vec::new();
    };
    subs.iter()
        .filter_map(|s| s.as_object())
        .filter_map(|s| {
            let name = s.get("name").and_then(|v| v.as_str())?;
            if name.trim().is_empty() {
                return None;
            }
            Some(SubcategoryDef {
                name: name.to_string(),
                weight: number_or_zero(s.get("weight")),
            })
        })
        .collect()
}

/// Categories holding at least one usable subcategory, in `order`.
pub fn present_categories(doc: &Value, order: [&'static str; 2]) -> Vec<&'static str> {
    order
        .into_iter()
        .filter(|key| !subcategories(doc, key).is_empty())
        .collect()
}

/// Save-time validation. Collects every violated rule, including the total of
/// the category weights `policy` would assign.
pub fn validate(doc: &Value, policy: &CategoryWeightPolicy) -> GradeResult<()> {
    let Some(obj) = doc.as_object() else {
        return Err(GradeError::ValidationFailed {
            reasons: vec!["structure definition must be an object".to_string()],
        });
    };

    let mut reasons: Vec<String> = Vec::new();
    for key in CATEGORY_KEYS {
        let items = match obj.get(key) {
            None => {
                reasons.push(format!("Missing required key: {}", key));
                continue;
            }
            Some(Value::Null) => continue,
            Some(Value::Array(items)) => items,
            Some(_) => {
                reasons.push(format!("{} must be an array", key));
                continue;
            }
        };

        let mut seen: HashSet<String> = HashSet::new();
        let mut total = 0.0_f64;
        let mut total_ok = true;
        for (i, item) in items.iter().enumerate() {
            let Some(item) = item.as_object() else {
                reasons.push(format!("{}[{}] must be an object", key, i));
                total_ok = false;
                continue;
            };
            match item.get("name").and_then(|v| v.as_str()).map(str::trim) {
                Some(name) if !name.is_empty() => {
                    if !seen.insert(name.to_string()) {
                        reasons.push(format!("{}[{}].name duplicates '{}'", key, i, name));
                    }
                }
                _ => reasons.push(format!("{}[{}].name must be a non-empty string", key, i)),
            }
            match item.get("weight").and_then(as_number) {
                Some(w) => total += w,
                None => {
                    reasons.push(format!("{}[{}].weight must be a number", key, i));
                    total_ok = false;
                }
            }
        }

        if !items.is_empty() && total_ok && (total - WEIGHT_SUM_TARGET).abs() > WEIGHT_SUM_TOLERANCE
        {
            reasons.push(format!(
                "{} subcategory weights must sum to 100 (got {})",
                key, total
            ));
        }
    }

    let weights = policy.category_weights(&present_categories(doc, MATERIALIZE_ORDER));
    let category_total: f64 = weights.iter().map(|(_, w)| w).sum();
    if !weights.is_empty() && (category_total - WEIGHT_SUM_TARGET).abs() > WEIGHT_SUM_TOLERANCE {
        reasons.push(format!(
            "category weights must sum to 100 (got {})",
            category_total
        ));
    }

    if reasons.is_empty() {
        Ok(())
    } else {
        Err(GradeError::ValidationFailed { reasons })
    }
}
