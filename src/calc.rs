use rusqlite::Connection;
use serde::Serialize;
use std::collections::HashMap;
use tracing::{error, info};

use crate::config::CategoryWeightPolicy;
use crate::error::{GradeError, GradeResult};
use crate::materialize::materialize;
use crate::scores::{enrolled_students, load_assessments, load_scores, AssessmentRow};
use crate::store::{
    active_structure, load_categories, load_subcategories, CategoryRow, SubcategoryRow,
};

/// `transmuted = final * 0.625 + 37.5`
pub const TRANSMUTE_SLOPE: f64 = 0.625;
pub const TRANSMUTE_BASE: f64 = 37.5;

/// Upper-exclusive cutoffs on the transmuted grade, ascending.
const TRANSMUTED_TABLE: [(f64, &str); 8] = [
    (75.0, "5.0"),
    (77.0, "3.0"),
    (80.0, "2.75"),
    (83.0, "2.5"),
    (86.0, "2.25"),
    (89.0, "2.0"),
    (92.0, "1.75"),
    (95.0, "1.5"),
];
const TRANSMUTED_TOP: &str = "1.25";

/// Inclusive lower bounds on a percentage, descending. Used by class reports
/// and the formula strategy; kept apart from the transmuted table.
const GPA_TABLE: [(f64, &str); 8] = [
    (96.0, "1.00"),
    (93.0, "1.25"),
    (90.0, "1.50"),
    (87.0, "1.75"),
    (84.0, "2.00"),
    (81.0, "2.25"),
    (78.0, "2.50"),
    (75.0, "2.75"),
];
const GPA_FAILING: &str = "5.00";

pub fn round_2dp(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

pub fn transmute(final_percentage: f64) -> f64 {
    final_percentage * TRANSMUTE_SLOPE + TRANSMUTE_BASE
}

pub fn transmuted_equivalent(transmuted: f64) -> &'static str {
    TRANSMUTED_TABLE
        .iter()
        .find(|(cutoff, _)| transmuted < *cutoff)
        .map(|(_, eq)| *eq)
        .unwrap_or(TRANSMUTED_TOP)
}

pub fn gpa_equivalent(percentage: f64) -> &'static str {
    GPA_TABLE
        .iter()
        .find(|(floor, _)| percentage >= *floor)
        .map(|(_, eq)| *eq)
        .unwrap_or(GPA_FAILING)
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubcategorySnapshot {
    pub id: String,
    pub name: String,
    pub weight: f64,
    /// `(assessment_id, max_score)`
    pub assessments: Vec<(String, f64)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CategorySnapshot {
    pub name: String,
    pub weight: f64,
    pub subcategories: Vec<SubcategorySnapshot>,
}

/// The materialized rows of one structure, nested for evaluation.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StructureSnapshot {
    pub categories: Vec<CategorySnapshot>,
}

impl StructureSnapshot {
    pub fn assemble(
        categories: Vec<CategoryRow>,
        subcategories: Vec<SubcategoryRow>,
        assessments: Vec<AssessmentRow>,
    ) -> Self {
        let mut by_sub: HashMap<String, Vec<(String, f64)>> = HashMap::new();
        for a in assessments {
            by_sub
                .entry(a.subcategory_id)
                .or_default()
                .push((a.id, a.max_score));
        }
        let mut by_cat: HashMap<String, Vec<SubcategorySnapshot>> = HashMap::new();
        for s in subcategories {
            let assessments = by_sub.remove(&s.id).unwrap_or_default();
            by_cat.entry(s.category_id).or_default().push(SubcategorySnapshot {
                id: s.id,
                name: s.name,
                weight: s.weight,
                assessments,
            });
        }
        let categories = categories
            .into_iter()
            .map(|c| CategorySnapshot {
                subcategories: by_cat.remove(&c.id).unwrap_or_default(),
                name: c.name,
                weight: c.weight,
            })
            .collect();
        Self { categories }
    }

    pub fn load(conn: &Connection, structure_id: &str) -> GradeResult<Self> {
        Ok(Self::assemble(
            load_categories(conn, structure_id)?,
            load_subcategories(conn, structure_id)?,
            load_assessments(conn, structure_id)?,
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubcategoryBreakdown {
    pub id: String,
    pub name: String,
    pub weight: f64,
    pub percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryBreakdown {
    pub name: String,
    pub weight: f64,
    pub percent: f64,
    pub subcategories: Vec<SubcategoryBreakdown>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentGrade {
    pub student_id: String,
    pub final_percentage: f64,
    pub transmuted: f64,
    pub equivalent: String,
    pub categories: Vec<CategoryBreakdown>,
}

/// Weighted final grade of one student. `scores` maps assessment id to raw
/// score; a missing entry counts as 0.
pub fn grade_student(
    snapshot: &StructureSnapshot,
    student_id: &str,
    scores: &HashMap<String, f64>,
) -> StudentGrade {
    let mut final_fraction = 0.0;
    let mut breakdown = Vec::with_capacity(snapshot.categories.len());

    for cat in &snapshot.categories {
        let mut cat_fraction = 0.0;
        let mut subs = Vec::with_capacity(cat.subcategories.len());
        for sub in &cat.subcategories {
            let mut sum_score = 0.0;
            let mut sum_max = 0.0;
            for (aid, max) in &sub.assessments {
                sum_score += scores.get(aid).copied().unwrap_or(0.0);
                sum_max += *max;
            }
            let sub_fraction = if sum_max > 0.0 {
                sum_score / sum_max
            } else {
                0.0
            };
            cat_fraction += sub_fraction * sub.weight / 100.0;
            subs.push(SubcategoryBreakdown {
                id: sub.id.clone(),
                name: sub.name.clone(),
                weight: sub.weight,
                percent: round_2dp(sub_fraction * 100.0),
            });
        }
        final_fraction += cat_fraction * cat.weight / 100.0;
        breakdown.push(CategoryBreakdown {
            name: cat.name.clone(),
            weight: cat.weight,
            percent: round_2dp(cat_fraction * 100.0),
            subcategories: subs,
        });
    }

    let final_percentage = final_fraction * 100.0;
    let transmuted = round_2dp(transmute(final_percentage));
    StudentGrade {
        student_id: student_id.to_string(),
        final_percentage: round_2dp(final_percentage),
        transmuted,
        equivalent: transmuted_equivalent(transmuted).to_string(),
        categories: breakdown,
    }
}

pub struct CalcContext<'a> {
    pub conn: &'a Connection,
    pub class_id: &'a str,
    pub policy: CategoryWeightPolicy,
}

/// Final grades for every enrolled student of the class, ordered by student id.
pub fn compute_class_grades(ctx: &CalcContext<'_>) -> GradeResult<Vec<StudentGrade>> {
    match compute_inner(ctx) {
        Ok(grades) => {
            info!(class_id = ctx.class_id, students = grades.len(), "grades computed");
            Ok(grades)
        }
        Err(e) => {
            let e = e.into_computation(ctx.class_id);
            error!(
                class_id = ctx.class_id,
                code = e.code(),
                error = %e,
                "grade computation failed"
            );
            Err(e)
        }
    }
}

fn compute_inner(ctx: &CalcContext<'_>) -> GradeResult<Vec<StudentGrade>> {
    let conn = ctx.conn;
    let Some(active) = active_structure(conn, ctx.class_id)? else {
        return Err(GradeError::NoActiveStructure {
            class_id: ctx.class_id.to_string(),
        });
    };
    materialize(conn, &active.id, ctx.policy)?;
    let snapshot = StructureSnapshot::load(conn, &active.id)?;

    let mut per_student: HashMap<String, HashMap<String, f64>> = HashMap::new();
    for s in load_scores(conn, ctx.class_id, &active.id)? {
        per_student
            .entry(s.student_id)
            .or_default()
            .insert(s.assessment_id, s.score);
    }

    let empty = HashMap::new();
    let grades = enrolled_students(conn, ctx.class_id)?
        .iter()
        .map(|sid| grade_student(&snapshot, sid, per_student.get(sid).unwrap_or(&empty)))
        .collect();
    Ok(grades)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassSummary {
    pub class_id: String,
    pub student_count: usize,
    pub average_final: f64,
    pub average_transmuted: f64,
    pub gpa_equivalent: String,
}

pub fn class_summary(ctx: &CalcContext<'_>) -> GradeResult<ClassSummary> {
    let grades = compute_class_grades(ctx)?;
    let n = grades.len();
    let (average_final, average_transmuted) = if n == 0 {
        (0.0, 0.0)
    } else {
        let f: f64 = grades.iter().map(|g| g.final_percentage).sum();
        let t: f64 = grades.iter().map(|g| g.transmuted).sum();
        (round_2dp(f / n as f64), round_2dp(t / n as f64))
    };
    Ok(ClassSummary {
        class_id: ctx.class_id.to_string(),
        student_count: n,
        average_final,
        average_transmuted,
        gpa_equivalent: gpa_equivalent(average_final).to_string(),
    })
}
