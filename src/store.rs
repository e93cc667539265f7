//! Versioned grading-structure storage and the relational category rows
//! hanging off each version.

use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior};
use serde::Serialize;
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use crate::config::CategoryWeightPolicy;
use crate::db::now_ts;
use crate::error::{GradeError, GradeResult};
use crate::materialize::{materialize_in, MaterializeOutcome};
use crate::structure;

const DEFAULT_STRUCTURE_NAME: &str = "Untitled";

#[derive(Debug, Clone, PartialEq)]
pub struct StructureRow {
    pub id: String,
    pub class_id: String,
    pub name: String,
    pub structure_json: String,
    pub version: i64,
    pub is_active: bool,
    pub created_by: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl StructureRow {
    pub fn definition(&self) -> GradeResult<Value> {
        structure::parse_definition(&self.structure_json)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryRow {
    pub id: String,
    pub structure_id: String,
    pub name: String,
    pub weight: f64,
    pub position: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubcategoryRow {
    pub id: String,
    pub category_id: String,
    pub name: String,
    pub weight: f64,
    pub max_score: f64,
    pub position: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedStructure {
    pub id: String,
    pub version: i64,
    pub materialized: MaterializeOutcome,
}

const STRUCTURE_COLUMNS: &str = "id, class_id, structure_name, structure_json, version, is_active,
     created_by, created_at, updated_at";

fn structure_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<StructureRow> {
    Ok(StructureRow {
        id: r.get(0)?,
        class_id: r.get(1)?,
        name: r.get(2)?,
        structure_json: r.get(3)?,
        version: r.get(4)?,
        is_active: r.get::<_, i64>(5)? != 0,
        created_by: r.get(6)?,
        created_at: r.get(7)?,
        updated_at: r.get(8)?,
    })
}

pub fn class_exists(conn: &Connection, class_id: &str) -> GradeResult<bool> {
    let found = conn
        .query_row("SELECT 1 FROM classes WHERE id = ?", [class_id], |r| {
            r.get::<_, i64>(0)
        })
        .optional()?;
    Ok(found.is_some())
}

/// Validates and stores a new structure version for `class_id`, making it the
/// only active one, and materializes its categories in the same transaction.
pub fn save_structure(
    conn: &Connection,
    class_id: &str,
    name: &str,
    definition: &Value,
    created_by: Option<&str>,
    policy: CategoryWeightPolicy,
) -> GradeResult<SavedStructure> {
    structure::validate(definition, &policy)?;
    if !class_exists(conn, class_id)? {
        return Err(GradeError::not_found("class"));
    }

    let name = match name.trim() {
        "" => DEFAULT_STRUCTURE_NAME,
        n => n,
    };
    let structure_json = serde_json::to_string(definition)
        .map_err(|e| GradeError::structure_invalid(e.to_string()))?;

    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
    let next_version: i64 = tx.query_row(
        "SELECT COALESCE(MAX(version), 0) + 1 FROM grade_structures WHERE class_id = ?",
        [class_id],
        |r| r.get(0),
    )?;
    let now = now_ts();
    tx.execute(
        "UPDATE grade_structures SET is_active = 0, updated_at = ?
         WHERE class_id = ? AND is_active = 1",
        (&now, class_id),
    )?;
    let id = Uuid::new_v4().to_string();
    tx.execute(
        "INSERT INTO grade_structures(
            id, class_id, structure_name, structure_json, version, is_active,
            created_by, created_at, updated_at
         ) VALUES(?, ?, ?, ?, ?, 1, ?, ?, ?)",
        (
            &id,
            class_id,
            name,
            &structure_json,
            next_version,
            created_by,
            &now,
            &now,
        ),
    )?;
    let materialized = materialize_in(&tx, &id, policy)?;
    tx.commit()?;

    info!(
        class_id,
        structure_id = %id,
        version = next_version,
        categories = materialized.categories,
        "grading structure saved"
    );
    Ok(SavedStructure {
        id,
        version: next_version,
        materialized,
    })
}

pub fn get_structure(conn: &Connection, structure_id: &str) -> GradeResult<Option<StructureRow>> {
    let sql = format!("SELECT {} FROM grade_structures WHERE id = ?", STRUCTURE_COLUMNS);
    Ok(conn
        .query_row(&sql, [structure_id], structure_from_row)
        .optional()?)
}

pub fn active_structure(conn: &Connection, class_id: &str) -> GradeResult<Option<StructureRow>> {
    let sql = format!(
        "SELECT {} FROM grade_structures
         WHERE class_id = ? AND is_active = 1
         ORDER BY version DESC
         LIMIT 1",
        STRUCTURE_COLUMNS
    );
    Ok(conn.query_row(&sql, [class_id], structure_from_row).optional()?)
}

/// Every version stored for the class owning `structure_id`, newest first.
pub fn structure_history(
    conn: &Connection,
    structure_id: &str,
) -> GradeResult<(String, Vec<StructureRow>)> {
    let Some(anchor) = get_structure(conn, structure_id)? else {
        return Err(GradeError::not_found("structure"));
    };
    let sql = format!(
        "SELECT {} FROM grade_structures WHERE class_id = ? ORDER BY version DESC",
        STRUCTURE_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([&anchor.class_id], structure_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok((anchor.class_id, rows))
}

/// Deletes one version together with its categories, assessments and scores.
/// Another version is never promoted to active.
pub fn delete_structure(conn: &Connection, structure_id: &str) -> GradeResult<StructureRow> {
    let Some(row) = get_structure(conn, structure_id)? else {
        return Err(GradeError::not_found("structure"));
    };
    conn.execute("DELETE FROM grade_structures WHERE id = ?", [structure_id])?;
    // Freshness signal for the class: the active-structure aggregates may not
    // change when an inactive version goes away.
    conn.execute(
        "UPDATE classes SET updated_at = ? WHERE id = ?",
        (now_ts(), &row.class_id),
    )?;
    info!(
        class_id = %row.class_id,
        structure_id,
        was_active = row.is_active,
        "grading structure deleted"
    );
    Ok(row)
}

pub fn has_categories(conn: &Connection, structure_id: &str) -> GradeResult<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(1) FROM grade_categories WHERE structure_id = ?",
        [structure_id],
        |r| r.get(0),
    )?;
    Ok(count > 0)
}

pub fn load_categories(conn: &Connection, structure_id: &str) -> GradeResult<Vec<CategoryRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, structure_id, name, weight, position
         FROM grade_categories
         WHERE structure_id = ?
         ORDER BY position, name",
    )?;
    let rows = stmt
        .query_map([structure_id], |r| {
            Ok(CategoryRow {
                id: r.get(0)?,
                structure_id: r.get(1)?,
                name: r.get(2)?,
                weight: r.get(3)?,
                position: r.get(4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn load_subcategories(
    conn: &Connection,
    structure_id: &str,
) -> GradeResult<Vec<SubcategoryRow>> {
    let mut stmt = conn.prepare(
        "SELECT gsc.id, gsc.category_id, gsc.name, gsc.weight, gsc.max_score, gsc.position
         FROM grade_subcategories gsc
         JOIN grade_categories gc ON gc.id = gsc.category_id
         WHERE gc.structure_id = ?
         ORDER BY gc.position, gsc.position, gsc.name",
    )?;
    let rows = stmt
        .query_map([structure_id], |r| {
            Ok(SubcategoryRow {
                id: r.get(0)?,
                category_id: r.get(1)?,
                name: r.get(2)?,
                weight: r.get(3)?,
                max_score: r.get(4)?,
                position: r.get(5)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Resolves a subcategory of `structure_id` by name, optionally restricted to
/// one category.
pub fn find_subcategory(
    conn: &Connection,
    structure_id: &str,
    subcategory: &str,
    category: Option<&str>,
) -> GradeResult<Option<String>> {
    let found = match category {
        Some(category) => conn
            .query_row(
                "SELECT gsc.id
                 FROM grade_subcategories gsc
                 JOIN grade_categories gc ON gsc.category_id = gc.id
                 WHERE gc.structure_id = ? AND gsc.name = ? AND gc.name = ?
                 ORDER BY gc.position, gsc.position
                 LIMIT 1",
                (structure_id, subcategory, category),
                |r| r.get(0),
            )
            .optional()?,
        None => conn
            .query_row(
                "SELECT gsc.id
                 FROM grade_subcategories gsc
                 JOIN grade_categories gc ON gsc.category_id = gc.id
                 WHERE gc.structure_id = ? AND gsc.name = ?
                 ORDER BY gc.position, gsc.position
                 LIMIT 1",
                (structure_id, subcategory),
                |r| r.get(0),
            )
            .optional()?,
    };
    Ok(found)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub fn insert_class(conn: &Connection, id: &str) {
        let now = now_ts();
        conn.execute(
            "INSERT INTO classes(id, name, created_at, updated_at) VALUES(?, ?, ?, ?)",
            (id, format!("Class {}", id), &now, &now),
        )
        .expect("insert class");
    }

    pub fn insert_student(conn: &Connection, student_id: &str, class_id: &str) {
        let now = now_ts();
        let pi = format!("pi-{}", student_id);
        conn.execute(
            "INSERT INTO personal_info(id, first_name, last_name, updated_at)
             VALUES(?, 'Test', ?, ?)",
            (&pi, student_id, &now),
        )
        .expect("insert personal info");
        conn.execute(
            "INSERT INTO students(id, personal_info_id, created_at) VALUES(?, ?, ?)",
            (student_id, &pi, &now),
        )
        .expect("insert student");
        conn.execute(
            "INSERT INTO student_classes(student_id, class_id, joined_at) VALUES(?, ?, ?)",
            (student_id, class_id, &now),
        )
        .expect("enroll student");
    }

    /// Stores a definition as the active version without save-time validation.
    pub fn insert_active_structure(
        conn: &Connection,
        class_id: &str,
        id: &str,
        definition: &Value,
    ) {
        let now = now_ts();
        conn.execute(
            "UPDATE grade_structures SET is_active = 0 WHERE class_id = ?",
            [class_id],
        )
        .expect("deactivate");
        conn.execute(
            "INSERT INTO grade_structures(
                id, class_id, structure_name, structure_json, version, is_active,
                created_by, created_at, updated_at
             ) VALUES(
                ?, ?, 'fixture', ?,
                (SELECT COALESCE(MAX(version), 0) + 1 FROM grade_structures WHERE class_id = ?),
                1, NULL, ?, ?
             )",
            (id, class_id, definition.to_string(), class_id, &now, &now),
        )
        .expect("insert structure");
    }
}
