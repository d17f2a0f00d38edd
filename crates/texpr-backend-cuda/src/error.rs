use thiserror::Error;

use texpr::ShapeError;

/// Failures raised by the execution-unit planner.
#[derive(Debug, Error)]
pub enum PlanError {
    #[error(transparent)]
    Shape(#[from] ShapeError),
    #[error("variable {var} has no placement in the compile environment")]
    PlacementMissing { var: String },
    #[error("cannot plan with unresolved size symbols: {}", .symbols.join(", "))]
    UnresolvedSymbols { symbols: Vec<String> },
    #[error("no safe in-place site for {context}")]
    InPlaceConflict { context: String },
    #[error("unit {unit} depends on unit {dependency}, which is not planned before it")]
    Topology { unit: usize, dependency: usize },
    #[error("unsupported operation in planner: {0}")]
    Unsupported(String),
}

/// Failures raised while linearizing the stream schedule.
#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("scheduler deadlock: no stream has a ready head command\n{state}")]
    Deadlock { state: String },
}

/// Any failure of the whole lowering pipeline.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error(transparent)]
    Shape(#[from] ShapeError),
    #[error(transparent)]
    Plan(#[from] PlanError),
    #[error(transparent)]
    Schedule(#[from] ScheduleError),
}
