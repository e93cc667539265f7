//! Formula-override grading: an alternative to the canonical weighting in
//! `calc` where category totals come from a caller-supplied formula and only
//! assessments a student was actually scored on count.

use serde_json::Value;
use std::collections::HashMap;
use tracing::{error, info};

use crate::calc::{gpa_equivalent, round_2dp, CalcContext, StructureSnapshot};
use crate::error::{GradeError, GradeResult};
use crate::materialize::materialize;
use crate::scores::{enrolled_students, load_scores};
use crate::store::active_structure;
use crate::structure::as_number;

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FormulaGrade {
    pub student_id: String,
    pub final_grade: f64,
    pub equivalent: String,
}

/// Desired total weight per category: the sum of its parts' `weight`.
/// Non-object categories are ignored; parts without a numeric weight add 0.
pub fn formula_category_weights(formula: &Value) -> HashMap<String, f64> {
    let mut out = HashMap::new();
    let Some(obj) = formula.as_object() else {
        return out;
    };
    for (category, parts) in obj {
        let Some(parts) = parts.as_object() else {
            continue;
        };
        let total = parts
            .values()
            .filter_map(|p| p.get("weight").and_then(as_number))
            .sum::<f64>();
        out.insert(category.clone(), total);
    }
    out
}

pub fn grade_with_formula(
    snapshot: &StructureSnapshot,
    desired: &HashMap<String, f64>,
    student_id: &str,
    scores: &HashMap<String, f64>,
) -> FormulaGrade {
    let mut total = 0.0;
    for cat in &snapshot.categories {
        let structure_weight: f64 = cat.subcategories.iter().map(|s| s.weight).sum();
        let mut contribution = 0.0;
        let mut counted_raw = 0.0;
        let mut counted_max = 0.0;
        let mut any_counted = false;

        for sub in &cat.subcategories {
            let mut raw = 0.0;
            let mut max = 0.0;
            for (aid, m) in &sub.assessments {
                if let Some(score) = scores.get(aid) {
                    if *m > 0.0 {
                        raw += *score;
                        max += *m;
                    }
                }
            }
            if max <= 0.0 {
                continue;
            }
            any_counted = true;
            counted_raw += raw;
            counted_max += max;
            contribution += (raw / max) * sub.weight;
        }
        if !any_counted {
            continue;
        }

        if let Some(want) = desired.get(&cat.name) {
            if structure_weight > 0.0 {
                contribution *= want / structure_weight;
            } else if counted_max > 0.0 {
                contribution = (counted_raw / counted_max) * want;
            }
        }
        total += contribution;
    }

    let final_grade = round_2dp(total);
    FormulaGrade {
        student_id: student_id.to_string(),
        final_grade,
        equivalent: gpa_equivalent(final_grade).to_string(),
    }
}

pub fn compute_with_formula(
    ctx: &CalcContext<'_>,
    formula: &Value,
) -> GradeResult<Vec<FormulaGrade>> {
    match formula_inner(ctx, formula) {
        Ok(grades) => {
            info!(class_id = ctx.class_id, students = grades.len(), "formula grades computed");
            Ok(grades)
        }
        Err(e) => {
            let e = e.into_computation(ctx.class_id);
            error!(
                class_id = ctx.class_id,
                code = e.code(),
                error = %e,
                "formula computation failed"
            );
            Err(e)
        }
    }
}

fn formula_inner(ctx: &CalcContext<'_>, formula: &Value) -> GradeResult<Vec<FormulaGrade>> {
    if !formula.is_object() {
        return Err(GradeError::invalid("formula must be an object"));
    }
    let Some(active) = active_structure(ctx.conn, ctx.class_id)? else {
        return Err(GradeError::NoActiveStructure {
            class_id: ctx.class_id.to_string(),
        });
    };
    materialize(ctx.conn, &active.id, ctx.policy)?;
    let snapshot = StructureSnapshot::load(ctx.conn, &active.id)?;
    let desired = formula_category_weights(formula);

    let mut per_student: HashMap<String, HashMap<String, f64>> = HashMap::new();
    for s in load_scores(ctx.conn, ctx.class_id, &active.id)? {
        per_student
            .entry(s.student_id)
            .or_default()
            .insert(s.assessment_id, s.score);
    }
    let empty = HashMap::new();
    Ok(enrolled_students(ctx.conn, ctx.class_id)?
        .iter()
        .map(|sid| {
            let scores = per_student.get(sid).unwrap_or(&empty);
            grade_with_formula(&snapshot, &desired, sid, scores)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calc::{CategorySnapshot, SubcategorySnapshot};
    use crate::config::CategoryWeightPolicy;
    use crate::db::open_in_memory;
    use crate::scores::{create_assessment, record_score, SubcategoryRef};
    use crate::store::test_support::{insert_active_structure, insert_class, insert_student};
    use serde_json::json;

    fn snapshot() -> StructureSnapshot {
        StructureSnapshot {
            categories: vec![
                CategorySnapshot {
                    name: "LECTURE".into(),
                    weight: 100.0,
                    subcategories: vec![
                        SubcategorySnapshot {
                            id: "quiz".into(),
                            name: "Quizzes".into(),
                            weight: 60.0,
                            assessments: vec![("q1".into(), 50.0), ("q2".into(), 50.0)],
                        },
                        SubcategorySnapshot {
                            id: "exam".into(),
                            name: "Exam".into(),
                            weight: 40.0,
                            assessments: vec![("e1".into(), 100.0)],
                        },
                    ],
                },
                CategorySnapshot {
                    name: "LABORATORY".into(),
                    weight: 0.0,
                    subcategories: vec![SubcategorySnapshot {
                        id: "labs".into(),
                        name: "Labs".into(),
                        weight: 0.0,
                        assessments: vec![("l1".into(), 20.0)],
                    }],
                },
            ],
        }
    }

    fn scores(pairs: &[(&str, f64)]) -> HashMap<String, f64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn category_weights_sum_parts() {
        let w = formula_category_weights(&json!({
            "LECTURE": { "quiz": { "weight": 40 }, "exam": { "weight": "20" }, "bad": 3 },
            "LABORATORY": { "labs": { "weight": 40 } },
            "junk": 5
        }));
        assert_eq!(w.get("LECTURE"), Some(&60.0));
        assert_eq!(w.get("LABORATORY"), Some(&40.0));
        assert!(!w.contains_key("junk"));
    }

    #[test]
    fn only_scored_assessments_count_and_categories_rescale() {
        let desired = formula_category_weights(&json!({
            "LECTURE": { "quiz": { "weight": 30 }, "exam": { "weight": 30 } }
        }));
        // q2 and e1 unscored: Quizzes = 40/50, Exam skipped.
        let g = grade_with_formula(&snapshot(), &desired, "st", &scores(&[("q1", 40.0)]));
        // 0.8 * 60 = 48, rescaled by 60 / 100.
        assert_eq!(g.final_grade, 28.8);
        assert_eq!(g.equivalent, "5.00");
    }

    #[test]
    fn zero_structure_weight_falls_back_to_raw_average() {
        let desired =
            formula_category_weights(&json!({ "LABORATORY": { "labs": { "weight": 40 } } }));
        let g = grade_with_formula(&snapshot(), &desired, "st", &scores(&[("l1", 15.0)]));
        assert_eq!(g.final_grade, 30.0);

        let g = grade_with_formula(&snapshot(), &HashMap::new(), "st", &scores(&[]));
        assert_eq!(g.final_grade, 0.0);
        assert_eq!(g.equivalent, "5.00");
    }

    #[test]
    fn computes_for_every_enrolled_student() {
        let conn = open_in_memory().expect("db");
        insert_class(&conn, "c1");
        insert_student(&conn, "a", "c1");
        insert_student(&conn, "b", "c1");
        insert_active_structure(
            &conn,
            "c1",
            "s1",
            &json!({ "LECTURE": [ { "name": "Quizzes", "weight": 100 } ], "LABORATORY": [] }),
        );
        let policy = CategoryWeightPolicy::default();
        let target = SubcategoryRef::Named {
            structure_id: Some("s1".into()),
            class_id: None,
            category: None,
            subcategory: "Quizzes".into(),
        };
        let q1 = create_assessment(&conn, &target, "Q1", 10.0, policy).expect("q1");
        record_score(&conn, &q1, "a", 9.0).expect("score");

        let ctx = CalcContext {
            conn: &conn,
            class_id: "c1",
            policy,
        };
        let grades = compute_with_formula(&ctx, &json!({ "LECTURE": { "q": { "weight": 100 } } }))
            .expect("compute");
        assert_eq!(
            grades
                .iter()
                .map(|g| (g.student_id.as_str(), g.final_grade, g.equivalent.as_str()))
                .collect::<Vec<_>>(),
            vec![("a", 90.0, "1.50"), ("b", 0.0, "5.00")]
        );

        let err = compute_with_formula(&ctx, &json!([1])).expect_err("not an object");
        assert_eq!(err.code(), "bad_params");
    }
}
