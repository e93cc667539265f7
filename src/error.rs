use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GradeError {
    #[error("no active grading structure for class {class_id}")]
    NoActiveStructure { class_id: String },
    #[error("grading structure {structure_id} has no stored definition")]
    StructureMissing { structure_id: String },
    #[error("grading structure is invalid: {message}")]
    StructureInvalid { message: String },
    #[error("subcategory not found: {subcategory}")]
    SubcategoryNotFound { subcategory: String },
    #[error("structure validation failed ({} problem(s))", reasons.len())]
    ValidationFailed { reasons: Vec<String> },
    #[error("grade computation failed for class {class_id}: {message}")]
    ComputationFailed { class_id: String, message: String },
    #[error("{what} not found")]
    NotFound { what: String },
    #[error("{message}")]
    InvalidInput { message: String },
    #[error("storage error: {message}")]
    Storage { message: String },
}

impl GradeError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    pub fn structure_invalid(message: impl Into<String>) -> Self {
        Self::StructureInvalid {
            message: message.into(),
        }
    }

    /// Wraps a storage failure raised while aggregating grades for `class_id`.
    /// Domain errors pass through untouched.
    pub fn into_computation(self, class_id: &str) -> Self {
        match self {
            Self::Storage { message } => Self::ComputationFailed {
                class_id: class_id.to_string(),
                message,
            },
            other => other,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::NoActiveStructure { .. } => "no_active_structure",
            Self::StructureMissing { .. } => "structure_missing",
            Self::StructureInvalid { .. } => "structure_invalid",
            Self::SubcategoryNotFound { .. } => "subcategory_not_found",
            Self::ValidationFailed { .. } => "validation_failed",
            Self::ComputationFailed { .. } => "computation_failed",
            Self::NotFound { .. } => "not_found",
            Self::InvalidInput { .. } => "bad_params",
            Self::Storage { .. } => "db_query_failed",
        }
    }

    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            Self::ValidationFailed { reasons } => Some(json!({ "reasons": reasons })),
            Self::ComputationFailed { class_id, .. } => Some(json!({ "classId": class_id })),
            Self::NoActiveStructure { class_id } => Some(json!({ "classId": class_id })),
            Self::StructureMissing { structure_id } => {
                Some(json!({ "structureId": structure_id }))
            }
            _ => None,
        }
    }
}

pub type GradeResult<T> = Result<T, GradeError>;

impl From<rusqlite::Error> for GradeError {
    fn from(value: rusqlite::Error) -> Self {
        GradeError::Storage {
            message: value.to_string(),
        }
    }
}
