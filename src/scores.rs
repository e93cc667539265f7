//! Assessments and raw scores.

use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior};
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::config::CategoryWeightPolicy;
use crate::db::now_ts;
use crate::error::{GradeError, GradeResult};
use crate::materialize::materialize;
use crate::store::{active_structure, find_subcategory, get_structure};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssessmentRow {
    pub id: String,
    pub subcategory_id: String,
    pub name: String,
    pub max_score: f64,
    pub weight: Option<f64>,
    pub passing_score: Option<f64>,
    pub position: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssessmentListing {
    pub id: String,
    pub name: String,
    pub max_score: f64,
    pub position: i64,
    pub subcategory_id: String,
    pub subcategory: String,
    pub category: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoreRow {
    pub student_id: String,
    pub assessment_id: String,
    pub score: f64,
}

/// How the caller addresses the subcategory a new assessment goes into.
#[derive(Debug, Clone, PartialEq)]
pub enum SubcategoryRef {
    Id(String),
    Named {
        structure_id: Option<String>,
        class_id: Option<String>,
        category: Option<String>,
        subcategory: String,
    },
}

fn resolve_subcategory(
    conn: &Connection,
    target: &SubcategoryRef,
    policy: CategoryWeightPolicy,
) -> GradeResult<String> {
    match target {
        SubcategoryRef::Id(id) => {
            let found: Option<String> = conn
                .query_row(
                    "SELECT id FROM grade_subcategories WHERE id = ?",
                    [id],
                    |r| r.get(0),
                )
                .optional()?;
            found.ok_or_else(|| GradeError::SubcategoryNotFound {
                subcategory: id.clone(),
            })
        }
        SubcategoryRef::Named {
            structure_id,
            class_id,
            category,
            subcategory,
        } => {
            let structure_id = match (structure_id, class_id) {
                (Some(sid), _) => {
                    if get_structure(conn, sid)?.is_none() {
                        return Err(GradeError::StructureMissing {
                            structure_id: sid.clone(),
                        });
                    }
                    sid.clone()
                }
                (None, Some(cid)) => match active_structure(conn, cid)? {
                    Some(s) => s.id,
                    None => {
                        return Err(GradeError::NoActiveStructure {
                            class_id: cid.clone(),
                        })
                    }
                },
                (None, None) => {
                    return Err(GradeError::invalid(
                        "structureId or classId is required to resolve a subcategory by name",
                    ))
                }
            };
            materialize(conn, &structure_id, policy)?;
            find_subcategory(conn, &structure_id, subcategory, category.as_deref())?.ok_or_else(
                || GradeError::SubcategoryNotFound {
                    subcategory: match category {
                        Some(c) => format!("{}::{}", c, subcategory),
                        None => subcategory.clone(),
                    },
                },
            )
        }
    }
}

/// Adds an assessment at the next position of its subcategory.
pub fn create_assessment(
    conn: &Connection,
    target: &SubcategoryRef,
    name: &str,
    max_score: f64,
    policy: CategoryWeightPolicy,
) -> GradeResult<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(GradeError::invalid("assessment name must not be empty"));
    }
    if !max_score.is_finite() || max_score <= 0.0 {
        return Err(GradeError::invalid("maxScore must be greater than 0"));
    }

    let subcategory_id = resolve_subcategory(conn, target, policy)?;

    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
    let next_pos: i64 = tx.query_row(
        "SELECT COALESCE(MAX(position), 0) + 1 FROM grade_assessments WHERE subcategory_id = ?",
        [&subcategory_id],
        |r| r.get(0),
    )?;
    let id = Uuid::new_v4().to_string();
    tx.execute(
        "INSERT INTO grade_assessments(
            id, subcategory_id, name, max_score, weight, passing_score, position, created_at
         ) VALUES(?, ?, ?, ?, NULL, NULL, ?, ?)",
        (&id, &subcategory_id, name, max_score, next_pos, now_ts()),
    )?;
    tx.commit()?;
    debug!(
        assessment_id = %id,
        subcategory_id = %subcategory_id,
        position = next_pos,
        "assessment created"
    );
    Ok(id)
}

/// Class that owns an assessment through its structure.
pub fn assessment_class(conn: &Connection, assessment_id: &str) -> GradeResult<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT gs.class_id
             FROM grade_assessments ga
             JOIN grade_subcategories gsc ON ga.subcategory_id = gsc.id
             JOIN grade_categories gc ON gsc.category_id = gc.id
             JOIN grade_structures gs ON gc.structure_id = gs.id
             WHERE ga.id = ?",
            [assessment_id],
            |r| r.get(0),
        )
        .optional()?)
}

fn is_enrolled(conn: &Connection, student_id: &str, class_id: &str) -> GradeResult<bool> {
    let found = conn
        .query_row(
            "SELECT 1 FROM student_classes WHERE student_id = ? AND class_id = ?",
            (student_id, class_id),
            |r| r.get::<_, i64>(0),
        )
        .optional()?;
    Ok(found.is_some())
}

/// Upserts one score. Returns the class the score belongs to.
pub fn record_score(
    conn: &Connection,
    assessment_id: &str,
    student_id: &str,
    score: f64,
) -> GradeResult<String> {
    if !score.is_finite() {
        return Err(GradeError::invalid("score must be a finite number"));
    }
    let Some(class_id) = assessment_class(conn, assessment_id)? else {
        return Err(GradeError::not_found("assessment"));
    };
    if !is_enrolled(conn, student_id, &class_id)? {
        return Err(GradeError::invalid(format!(
            "student {} is not enrolled in class {}",
            student_id, class_id
        )));
    }

    conn.execute(
        "INSERT INTO student_scores(id, assessment_id, student_id, score, updated_at)
         VALUES(?, ?, ?, ?, ?)
         ON CONFLICT(assessment_id, student_id) DO UPDATE SET
           score = excluded.score,
           updated_at = excluded.updated_at",
        (
            Uuid::new_v4().to_string(),
            assessment_id,
            student_id,
            score,
            now_ts(),
        ),
    )?;
    Ok(class_id)
}

pub fn load_assessments(conn: &Connection, structure_id: &str) -> GradeResult<Vec<AssessmentRow>> {
    let mut stmt = conn.prepare(
        "SELECT ga.id, ga.subcategory_id, ga.name, ga.max_score, ga.weight, ga.passing_score,
                ga.position
         FROM grade_assessments ga
         JOIN grade_subcategories gsc ON ga.subcategory_id = gsc.id
         JOIN grade_categories gc ON gsc.category_id = gc.id
         WHERE gc.structure_id = ?
         ORDER BY gc.position, gsc.position, ga.position",
    )?;
    let rows = stmt
        .query_map([structure_id], |r| {
            Ok(AssessmentRow {
                id: r.get(0)?,
                subcategory_id: r.get(1)?,
                name: r.get(2)?,
                max_score: r.get(3)?,
                weight: r.get(4)?,
                passing_score: r.get(5)?,
                position: r.get(6)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Assessments of the class's active structure with their category labels.
pub fn list_assessments(conn: &Connection, class_id: &str) -> GradeResult<Vec<AssessmentListing>> {
    let Some(active) = active_structure(conn, class_id)? else {
        return Err(GradeError::NoActiveStructure {
            class_id: class_id.to_string(),
        });
    };
    let mut stmt = conn.prepare(
        "SELECT ga.id, ga.name, ga.max_score, ga.position, gsc.id, gsc.name, gc.name
         FROM grade_assessments ga
         JOIN grade_subcategories gsc ON ga.subcategory_id = gsc.id
         JOIN grade_categories gc ON gsc.category_id = gc.id
         WHERE gc.structure_id = ?
         ORDER BY gc.position, gsc.position, ga.position",
    )?;
    let rows = stmt
        .query_map([&active.id], |r| {
            Ok(AssessmentListing {
                id: r.get(0)?,
                name: r.get(1)?,
                max_score: r.get(2)?,
                position: r.get(3)?,
                subcategory_id: r.get(4)?,
                subcategory: r.get(5)?,
                category: r.get(6)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn enrolled_students(conn: &Connection, class_id: &str) -> GradeResult<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT student_id FROM student_classes WHERE class_id = ? ORDER BY student_id",
    )?;
    let rows = stmt
        .query_map([class_id], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Scores of enrolled students for assessments of `structure_id`.
pub fn load_scores(
    conn: &Connection,
    class_id: &str,
    structure_id: &str,
) -> GradeResult<Vec<ScoreRow>> {
    let mut stmt = conn.prepare(
        "SELECT ss.student_id, ss.assessment_id, ss.score
         FROM student_scores ss
         JOIN grade_assessments ga ON ss.assessment_id = ga.id
         JOIN grade_subcategories gsc ON ga.subcategory_id = gsc.id
         JOIN grade_categories gc ON gsc.category_id = gc.id
         JOIN student_classes sc ON sc.student_id = ss.student_id AND sc.class_id = ?
         WHERE gc.structure_id = ?",
    )?;
    let rows = stmt
        .query_map((class_id, structure_id), |r| {
            Ok(ScoreRow {
                student_id: r.get(0)?,
                assessment_id: r.get(1)?,
                score: r.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_in_memory;
    use crate::store::has_categories;
    use crate::store::test_support::{insert_active_structure, insert_class, insert_student};
    use serde_json::json;

    fn fixture(conn: &Connection) {
        insert_class(conn, "c1");
        insert_student(conn, "st1", "c1");
        insert_active_structure(
            conn,
            "c1",
            "s1",
            &json!({
                "LECTURE": [ { "name": "Quizzes", "weight": 100, "assessments": [] } ],
                "LABORATORY": [ { "name": "Quizzes", "weight": 100, "assessments": [] } ]
            }),
        );
    }

    fn policy() -> CategoryWeightPolicy {
        CategoryWeightPolicy::default()
    }

    fn named(category: Option<&str>, subcategory: &str) -> SubcategoryRef {
        SubcategoryRef::Named {
            structure_id: None,
            class_id: Some("c1".into()),
            category: category.map(str::to_string),
            subcategory: subcategory.into(),
        }
    }

    #[test]
    fn create_materializes_lazily_and_assigns_positions() {
        let conn = open_in_memory().expect("db");
        fixture(&conn);
        assert!(!has_categories(&conn, "s1").expect("count"));

        let target = named(Some("LABORATORY"), "Quizzes");
        let a1 = create_assessment(&conn, &target, "Q1", 10.0, policy()).expect("a1");
        let a2 = create_assessment(&conn, &target, "Q2", 20.0, policy()).expect("a2");
        assert!(has_categories(&conn, "s1").expect("count"));

        let listed = list_assessments(&conn, "c1").expect("list");
        assert_eq!(
            listed
                .iter()
                .map(|a| (a.id.as_str(), a.category.as_str(), a.position))
                .collect::<Vec<_>>(),
            vec![(a1.as_str(), "LABORATORY", 1), (a2.as_str(), "LABORATORY", 2)]
        );

        let by_id = SubcategoryRef::Id(listed[0].subcategory_id.clone());
        create_assessment(&conn, &by_id, "Q3", 5.0, policy()).expect("a3");
        assert_eq!(list_assessments(&conn, "c1").expect("list").len(), 3);
    }

    #[test]
    fn create_rejects_bad_input() {
        let conn = open_in_memory().expect("db");
        fixture(&conn);
        let target = named(None, "Quizzes");
        for max in [0.0, -1.0, f64::NAN] {
            let err = create_assessment(&conn, &target, "Q1", max, policy()).expect_err("max");
            assert_eq!(err.code(), "bad_params");
        }
        let err = create_assessment(&conn, &named(None, "Missing"), "Q1", 1.0, policy())
            .expect_err("subcategory");
        assert!(matches!(err, GradeError::SubcategoryNotFound { .. }));
        let err = create_assessment(
            &conn,
            &SubcategoryRef::Id("nope".into()),
            "Q1",
            1.0,
            policy(),
        )
        .expect_err("id");
        assert!(matches!(err, GradeError::SubcategoryNotFound { .. }));
    }

    #[test]
    fn record_score_upserts_one_row_per_pair() {
        let conn = open_in_memory().expect("db");
        fixture(&conn);
        let aid = create_assessment(&conn, &named(None, "Quizzes"), "Q1", 10.0, policy())
            .expect("create");

        assert_eq!(record_score(&conn, &aid, "st1", 4.0).expect("first"), "c1");
        record_score(&conn, &aid, "st1", 7.5).expect("second");
        let scores = load_scores(&conn, "c1", "s1").expect("scores");
        assert_eq!(
            scores,
            vec![ScoreRow {
                student_id: "st1".into(),
                assessment_id: aid.clone(),
                score: 7.5
            }]
        );

        insert_class(&conn, "c2");
        insert_student(&conn, "st2", "c2");
        let err = record_score(&conn, &aid, "st2", 1.0).expect_err("not enrolled");
        assert_eq!(err.code(), "bad_params");
        let err = record_score(&conn, "ghost", "st1", 1.0).expect_err("no assessment");
        assert_eq!(err.code(), "not_found");
    }
}
