use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior};
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::CategoryWeightPolicy;
use crate::error::{GradeError, GradeResult};
use crate::store::has_categories;
use crate::structure::{self, MATERIALIZE_ORDER};

/// Nominal subcategory max score; assessments carry the real ones.
const SUBCATEGORY_MAX_PLACEHOLDER: f64 = 100.0;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MaterializeOutcome {
    pub created: bool,
    pub categories: usize,
    pub subcategories: usize,
}

/// Creates the category/subcategory rows of a structure if none exist yet.
///
/// Runs inside an immediate transaction so two callers racing on the same
/// structure serialize on the write lock; the loser sees the winner's rows
/// and returns without inserting.
pub fn materialize(
    conn: &Connection,
    structure_id: &str,
    policy: CategoryWeightPolicy,
) -> GradeResult<MaterializeOutcome> {
    if has_categories(conn, structure_id)? {
        return Ok(MaterializeOutcome::default());
    }
    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
    let outcome = materialize_in(&tx, structure_id, policy)?;
    tx.commit()?;
    Ok(outcome)
}

/// Same as [`materialize`] but on a connection already inside a write
/// transaction. The caller commits.
pub fn materialize_in(
    conn: &Connection,
    structure_id: &str,
    policy: CategoryWeightPolicy,
) -> GradeResult<MaterializeOutcome> {
    if has_categories(conn, structure_id)? {
        debug!(structure_id, "structure already materialized");
        return Ok(MaterializeOutcome::default());
    }

    let raw: Option<String> = conn
        .query_row(
            "SELECT structure_json FROM grade_structures WHERE id = ?",
            [structure_id],
            |r| r.get(0),
        )
        .optional()?;
    let raw = match raw {
        Some(s) if !s.trim().is_empty() => s,
        _ => {
            return Err(GradeError::StructureMissing {
                structure_id: structure_id.to_string(),
            })
        }
    };
    let doc = structure::parse_definition(&raw)?;

    let mut outcome = MaterializeOutcome::default();
    let present = structure::present_categories(&doc, MATERIALIZE_ORDER);
    let mut category_position: i64 = 1;
    for (key, weight) in policy.category_weights(&present) {
        let subs = structure::subcategories(&doc, key);
        let category_id = Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO grade_categories(id, structure_id, name, weight, position)
             VALUES(?, ?, ?, ?, ?)",
            (&category_id, structure_id, key, weight, category_position),
        )?;
        category_position += 1;
        outcome.categories += 1;

        for (i, sub) in subs.iter().enumerate() {
            conn.execute(
                "INSERT INTO grade_subcategories(id, category_id, name, weight, max_score, position)
                 VALUES(?, ?, ?, ?, ?, ?)",
                (
                    Uuid::new_v4().to_string(),
                    &category_id,
                    &sub.name,
                    sub.weight,
                    SUBCATEGORY_MAX_PLACEHOLDER,
                    (i as i64) + 1,
                ),
            )?;
            outcome.subcategories += 1;
        }
    }

    outcome.created = outcome.categories > 0;
    if outcome.created {
        info!(
            structure_id,
            categories = outcome.categories,
            subcategories = outcome.subcategories,
            "structure materialized"
        );
    }
    Ok(outcome)
}
