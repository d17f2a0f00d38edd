use thiserror::Error;

/// Failures raised while building or checking symbolic expressions.
///
/// Every variant is fatal at the point of detection and carries enough
/// context to name the offending node in a human-readable way.
#[derive(Debug, Clone, Error)]
pub enum ShapeError {
    #[error("{context}: shapes {lhs} and {rhs} do not match")]
    ShapeMismatch {
        context: String,
        lhs: String,
        rhs: String,
    },
    #[error("{context}: {detail}")]
    RankMismatch { context: String, detail: String },
    #[error("{context}: element types {lhs} and {rhs} do not match")]
    DTypeMismatch {
        context: String,
        lhs: String,
        rhs: String,
    },
    #[error("unresolved size symbols: {}", .symbols.join(", "))]
    UnresolvedSymbol { symbols: Vec<String> },
    #[error("size expression {size} does not evaluate to a natural number")]
    NonNaturalSize { size: String },
    #[error("extension op '{name}' expects {expected} arguments, got {actual}")]
    UnsupportedOp {
        name: String,
        expected: usize,
        actual: usize,
    },
}

impl ShapeError {
    pub fn shape_mismatch(
        context: impl Into<String>,
        lhs: impl ToString,
        rhs: impl ToString,
    ) -> Self {
        ShapeError::ShapeMismatch {
            context: context.into(),
            lhs: lhs.to_string(),
            rhs: rhs.to_string(),
        }
    }

    pub fn rank_mismatch(context: impl Into<String>, detail: impl Into<String>) -> Self {
        ShapeError::RankMismatch {
            context: context.into(),
            detail: detail.into(),
        }
    }

    pub fn dtype_mismatch(
        context: impl Into<String>,
        lhs: impl ToString,
        rhs: impl ToString,
    ) -> Self {
        ShapeError::DTypeMismatch {
            context: context.into(),
            lhs: lhs.to_string(),
            rhs: rhs.to_string(),
        }
    }
}
